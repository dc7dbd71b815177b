//! Test fixtures: quota rows and scripted model output.

use std::collections::BTreeSet;

use assistant_core::domains::admission::QuotaState;
use assistant_core::domains::chat::{AnswerDraft, Confidence, QuestionMetadata, Topic};
use chrono::{Duration, Utc};
use completion_client::testing::{MockReply, MockStream};
use uuid::Uuid;

/// Organization in a running trial with `remaining` questions left today.
pub fn trial_org(daily_limit: i32, remaining: i32) -> QuotaState {
    let mut state = QuotaState::trial(Uuid::new_v4(), Utc::now() + Duration::days(7), daily_limit);
    state.daily_used = daily_limit - remaining;
    state
}

/// Organization whose trial ended without a subscription.
pub fn expired_trial_org() -> QuotaState {
    QuotaState::trial(Uuid::new_v4(), Utc::now() - Duration::days(1), 10)
}

/// Organization with an active subscription and `monthly_used` units consumed.
pub fn paid_org(monthly_limit: i32, monthly_used: i32) -> QuotaState {
    let mut state = QuotaState::trial(Uuid::new_v4(), Utc::now() - Duration::days(30), 10);
    state.subscription_active = true;
    state.period_end = Some(Utc::now() + Duration::days(20));
    state.price_id = Some("price_pro".to_string());
    state.monthly_limit = monthly_limit;
    state.monthly_used = monthly_used;
    state
}

pub fn horeca_metadata() -> QuestionMetadata {
    QuestionMetadata {
        topics: BTreeSet::from([Topic::Omzetbelasting]),
        years: BTreeSet::from([2025]),
        search_query: "btw tarief horeca".to_string(),
        confidence: Confidence::High,
    }
}

pub fn horeca_answer() -> AnswerDraft {
    AnswerDraft {
        answer: "Voor eten en drinken in de horeca geldt het verlaagde btw-tarief van 9%. \
Alcoholische dranken vallen onder 21%."
            .to_string(),
        sources: vec!["Tabel btw-tarieven".to_string()],
    }
}

pub fn classification_reply(metadata: &QuestionMetadata) -> MockReply {
    MockReply::value(metadata)
}

/// The answer split into small deltas, the way the provider streams it.
pub fn answer_stream(answer: &AnswerDraft) -> MockStream {
    MockStream::chunked(answer, 7)
}
