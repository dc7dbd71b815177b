//! Admission tests
//!
//! Quota accounting under concurrency, through the pooled store path.

mod common;

use std::sync::Arc;

use assistant_core::domains::admission::{AdmissionPolicy, QuotaDecision};
use assistant_core::domains::chat::prompts::LIMIT_REACHED_MESSAGE;
use assistant_core::domains::chat::{ChatRequest, StreamItem};
use assistant_core::kernel::TestDependencies;
use futures::future::join_all;

use crate::common::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_never_exceed_remaining_trial_quota() {
    let org = trial_org(10, 4);
    let deps = TestDependencies::new().with_quota(org.clone());
    let (deps, pool) = leasing_deps(deps, 3).await.unwrap();
    let admission = deps.admission();

    let decisions = join_all((0..25).map(|_| {
        let admission = Arc::clone(&admission);
        let org_id = org.org_id;
        tokio::spawn(async move { admission.consume_quota_if_available(org_id).await })
    }))
    .await;

    let decisions: Vec<QuotaDecision> = decisions.into_iter().map(|d| d.unwrap()).collect();
    let allowed = decisions.iter().filter(|d| d.allowed()).count();
    let exceeded = decisions
        .iter()
        .filter(|d| **d == QuotaDecision::QuotaExceeded)
        .count();

    assert_eq!(allowed, 4);
    assert_eq!(exceeded, 21);
    assert_eq!(deps.quotas.get(org.org_id).unwrap().daily_used, 10);
    assert_eq!(pool.status().in_use, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_chats_past_the_limit_only_get_the_limit_message() {
    let org = trial_org(5, 2);
    let deps = TestDependencies::new().with_quota(org.clone());
    for _ in 0..2 {
        deps.provider.push_reply(classification_reply(&horeca_metadata()));
        deps.provider.push_stream(answer_stream(&horeca_answer()));
    }
    let orchestrator = deps.orchestrator();

    let streams = join_all((0..6).map(|_| {
        let stream = orchestrator.answer(ChatRequest::new(org.org_id, "btw tarief horeca"));
        tokio::spawn(collect(stream))
    }))
    .await;

    let mut answered = 0;
    let mut limited = 0;
    for items in streams.into_iter().map(|s| s.unwrap()) {
        if items == vec![StreamItem::text(LIMIT_REACHED_MESSAGE)] {
            limited += 1;
        } else {
            assert_eq!(errors(&items), 0);
            answered += 1;
        }
    }

    assert_eq!(answered, 2);
    assert_eq!(limited, 4);
}

#[tokio::test]
async fn paid_usage_beyond_limit_reports_each_unit() {
    let org = paid_org(3, 0);
    let deps = TestDependencies::new().with_quota(org.clone());
    let admission = deps.admission();

    let mut over = Vec::new();
    for _ in 0..6 {
        let decision = admission.consume_quota_if_available(org.org_id).await;
        assert!(decision.allowed());
        over.push(decision.over_quota());
    }

    assert_eq!(over, vec![false, false, false, true, true, true]);
    assert_eq!(deps.billing.usage_reports().len(), 3);
    assert!(deps
        .billing
        .usage_reports()
        .iter()
        .all(|report| *report == (org.org_id, 1)));
}

#[tokio::test]
async fn overage_hard_cap_refuses_past_the_cap() {
    let org = paid_org(2, 0);
    let deps = TestDependencies::new()
        .with_quota(org.clone())
        .policy(AdmissionPolicy {
            overage_hard_cap: Some(1),
            ..AdmissionPolicy::default()
        });
    let admission = deps.admission();

    let mut decisions = Vec::new();
    for _ in 0..4 {
        decisions.push(admission.consume_quota_if_available(org.org_id).await);
    }

    assert_eq!(
        decisions,
        vec![
            QuotaDecision::Allowed { over_quota: false },
            QuotaDecision::Allowed { over_quota: false },
            QuotaDecision::Allowed { over_quota: true },
            QuotaDecision::OverageCapReached,
        ]
    );
    assert_eq!(deps.billing.usage_reports().len(), 1);
}

#[tokio::test]
async fn billing_outage_does_not_block_paid_usage() {
    let org = paid_org(0, 0);
    let deps = TestDependencies::new().with_quota(org.clone());
    deps.billing.fail_usage_reports();

    let decision = deps.admission().consume_quota_if_available(org.org_id).await;

    assert_eq!(decision, QuotaDecision::Allowed { over_quota: true });
    assert!(deps.billing.usage_reports().is_empty());
}
