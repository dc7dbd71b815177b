//! Structured output, once in full and once streamed.

use std::sync::Arc;

use completion_client::{CompletionOptions, Message, OpenAIClient, StructuredCompletionClient};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
struct Person {
    /// The person's name
    name: String,
    /// The person's age
    age: u32,
    /// The person's job
    occupation: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = StructuredCompletionClient::new(Arc::new(OpenAIClient::from_env()?), "gpt-4o");

    let messages = vec![
        Message::system("Extract person information from text."),
        Message::user("John Smith is a 35 year old software engineer."),
    ];

    let person: Person = client
        .complete(messages.clone(), CompletionOptions::default())
        .await?;
    println!("Complete: {:?}", person);

    let mut partials = client.stream_complete::<Person>(messages, CompletionOptions::default());
    while let Some(partial) = partials.next().await {
        println!("Partial: {:?}", partial?);
    }

    Ok(())
}
