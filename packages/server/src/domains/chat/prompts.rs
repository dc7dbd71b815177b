//! Message construction for the answer pipeline.

use completion_client::Message;

use super::types::{ChatTurn, TurnRole, UploadedDocument};
use crate::kernel::traits::ScoredDocument;

pub const SIGNUP_MESSAGE: &str = "Je organisatie heeft geen actief abonnement. \
Sluit een abonnement af om vragen te blijven stellen.";

pub const LIMIT_REACHED_MESSAGE: &str = "Je hebt het maximale aantal vragen voor vandaag bereikt. \
Probeer het morgen opnieuw of sluit een abonnement af.";

pub const OVERAGE_CAP_MESSAGE: &str = "Je organisatie heeft het maximale gebruik voor deze \
factuurperiode bereikt. Neem contact met ons op om de limiet te verhogen.";

pub const GENERIC_ERROR_MESSAGE: &str =
    "Er ging iets mis bij het beantwoorden van je vraag. Probeer het later opnieuw.";

/// Upper bound on document text sent to the model.
pub const MAX_DOCUMENT_CHARS: usize = 60_000;

const CLASSIFY_SYSTEM: &str = "Je analyseert vragen over Nederlandse belastingen. \
Bepaal de belastingsoorten, de belastingjaren (gebruik het huidige jaar als er geen jaar wordt genoemd) \
en formuleer een zelfstandige zoekvraag voor de documentenindex.";

const ANSWER_SYSTEM: &str = "Je bent een belastingassistent. Beantwoord de vraag uitsluitend \
op basis van de aangeleverde documenten. Noem de titels van de gebruikte documenten als bronnen. \
Zeg het eerlijk als de documenten geen antwoord geven.";

const DOCUMENT_SYSTEM: &str = "Je bent een belastingassistent. Beantwoord de vraag op basis \
van het geüploade document.";

fn history_messages(history: &[ChatTurn]) -> impl Iterator<Item = Message> + '_ {
    history.iter().map(|turn| match turn.role {
        TurnRole::User => Message::user(turn.content.clone()),
        TurnRole::Assistant => Message::assistant(turn.content.clone()),
    })
}

pub fn classification_messages(question: &str, history: &[ChatTurn], year: i32) -> Vec<Message> {
    let mut messages = vec![Message::system(format!(
        "{}\nHet huidige jaar is {}.",
        CLASSIFY_SYSTEM, year
    ))];
    messages.extend(history_messages(history));
    messages.push(Message::user(question));
    messages
}

pub fn answer_messages(
    question: &str,
    history: &[ChatTurn],
    documents: &[ScoredDocument],
) -> Vec<Message> {
    let context = documents
        .iter()
        .enumerate()
        .map(|(i, doc)| match &doc.source_url {
            Some(url) => format!("[{}] {} ({})\n{}", i + 1, doc.title, url, doc.content),
            None => format!("[{}] {}\n{}", i + 1, doc.title, doc.content),
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut messages = vec![Message::system(format!(
        "{}\n\nDocumenten:\n{}",
        ANSWER_SYSTEM, context
    ))];
    messages.extend(history_messages(history));
    messages.push(Message::user(question));
    messages
}

pub fn document_messages(
    question: &str,
    history: &[ChatTurn],
    document: &UploadedDocument,
) -> Vec<Message> {
    let text: String = document.text.chars().take(MAX_DOCUMENT_CHARS).collect();
    let mut messages = vec![Message::system(format!(
        "{}\n\nDocument '{}':\n{}",
        DOCUMENT_SYSTEM, document.filename, text
    ))];
    messages.extend(history_messages(history));
    messages.push(Message::user(question));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use completion_client::Role;

    #[test]
    fn history_sits_between_system_and_question() {
        let history = vec![
            ChatTurn::user("Wat is het btw-tarief?"),
            ChatTurn::assistant("Dat hangt af van de dienst."),
        ];
        let messages = classification_messages("En voor horeca?", &history, 2025);

        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User]
        );
        assert!(messages[0].content.contains("2025"));
        assert_eq!(messages[3].content, "En voor horeca?");
    }

    #[test]
    fn documents_are_numbered_in_context() {
        let docs = vec![ScoredDocument {
            id: "d1".into(),
            title: "Tabel btw-tarieven".into(),
            content: "Horeca: 9%".into(),
            source_url: None,
            keyword_score: 0.4,
            semantic_score: 0.9,
            rerank_score: 0.8,
            score: 0.73,
        }];
        let messages = answer_messages("btw tarief horeca", &[], &docs);

        assert!(messages[0].content.contains("[1] Tabel btw-tarieven\nHoreca: 9%"));
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn long_documents_are_truncated() {
        let document = UploadedDocument {
            filename: "aangifte.md".into(),
            text: "x".repeat(MAX_DOCUMENT_CHARS + 100),
        };
        let messages = document_messages("Klopt dit?", &[], &document);

        let xs = messages[0].content.chars().filter(|c| *c == 'x').count();
        assert_eq!(xs, MAX_DOCUMENT_CHARS);
    }
}
