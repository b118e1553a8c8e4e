//! The `llm_session` module encapsulates a conversational session with a
//! language model behind the [`ClientWrapper`] trait. It provides the
//! foundational tools necessary for back-and-forth interactions with the
//! LLM, tracking both the user's queries and the LLM's responses within
//! specified token limits to comply with model constraints.
//!
//! At its core is the `LLMSession` structure, responsible for maintaining a
//! running dialogue history while adhering to the token limitations of the
//! LLM. This allows for contextualized exchanges that build upon previous
//! interactions without exceeding the model's capacity.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use hai_hive::Agent;
//! use hai_hive::LLMSession;
//! use hai_hive::clients::openai::OpenAIClient;
//! use hai_hive::client_wrapper::Role;
//! use std::sync::Arc;
//!
//! # async {
//! let client: Arc<dyn hai_hive::ClientWrapper> =
//!     Arc::new(OpenAIClient::new_with_model_string("key", "gpt-4o"));
//! let mut session = LLMSession::new(client, "You are an assistant.".to_string(), 8_000);
//! let response = session.send_message(Role::User, "Hello, World!".to_string()).await.unwrap();
//! println!("Assistant: {}", response.content);
//! # };
//! ```
//!
//! ## Notes
//!
//! - **Token Counting:** The session uses an approximate method to estimate
//!   token counts, assuming one token per 4 characters. This is good enough
//!   to budget history trimming but should not be relied on for exact
//!   provider-side accounting.
//! - **Trimming:** When the running total exceeds `max_tokens`, the oldest
//!   non-system messages are dropped until the session fits again.

use std::error::Error;
use std::sync::Arc;

use crate::hive::client_wrapper::{ClientWrapper, Message, MessageChunkStream, Role};

/// A conversational session with an LLM, scoped to a single agent.
///
/// `LLMSession` keeps a rolling history of [`Message`]s plus a standing
/// system prompt, sending both on every round-trip and trimming the oldest
/// history entries whenever the estimated token count exceeds `max_tokens`.
pub struct LLMSession {
    client: Arc<dyn ClientWrapper>,
    system_prompt: Message,
    conversation_history: Vec<Message>,
    max_tokens: usize,
    token_count: usize,
}

impl LLMSession {
    /// Creates a new `LLMSession` with the given client and system prompt.
    pub fn new(client: Arc<dyn ClientWrapper>, system_prompt: String, max_tokens: usize) -> Self {
        let system_prompt_message = Message {
            role: Role::System,
            content: Arc::from(system_prompt.as_str()),
            tool_calls: Vec::new(),
        };
        let system_prompt_tokens = count_message_tokens(&system_prompt_message);
        LLMSession {
            client,
            system_prompt: system_prompt_message,
            conversation_history: Vec::new(),
            max_tokens,
            token_count: system_prompt_tokens,
        }
    }

    /// Sends a message to the LLM and appends both the message and the
    /// response to the conversation history, trimming as needed to stay
    /// within `max_tokens`.
    pub async fn send_message(
        &mut self,
        role: Role,
        content: String,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        let message = Message {
            role,
            content: Arc::from(content.as_str()),
            tool_calls: Vec::new(),
        };
        self.token_count += count_message_tokens(&message);
        self.conversation_history.push(message);
        self.trim_conversation_history();

        let mut outgoing = Vec::with_capacity(self.conversation_history.len() + 1);
        outgoing.push(self.system_prompt.clone());
        outgoing.extend(self.conversation_history.iter().cloned());

        let response = self
            .client
            .send_message(&outgoing, None)
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { e.to_string().into() })?;

        self.token_count += count_message_tokens(&response);
        self.conversation_history.push(response.clone());
        self.trim_conversation_history();

        Ok(response)
    }

    /// Sends a message and requests a streaming response. The user turn is
    /// pushed to history the same way [`send_message`](Self::send_message)
    /// does; the assistant's reply is *not* appended here, since its full
    /// text is not known until the caller finishes draining the stream —
    /// call [`inject_message`](Self::inject_message) with the accumulated
    /// text once the stream ends. Returns `Ok(None)` when the underlying
    /// [`ClientWrapper`] does not support streaming, matching
    /// [`ClientWrapper::send_message_stream`]'s own contract.
    pub async fn send_message_stream(
        &mut self,
        role: Role,
        content: String,
    ) -> Result<Option<MessageChunkStream>, Box<dyn Error + Send + Sync>> {
        let message = Message {
            role,
            content: Arc::from(content.as_str()),
            tool_calls: Vec::new(),
        };
        self.token_count += count_message_tokens(&message);
        self.conversation_history.push(message);
        self.trim_conversation_history();

        let mut outgoing = Vec::with_capacity(self.conversation_history.len() + 1);
        outgoing.push(self.system_prompt.clone());
        outgoing.extend(self.conversation_history.iter().cloned());

        self.client
            .send_message_stream(&outgoing, None)
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { e.to_string().into() })
    }

    /// Injects a message directly into the history without sending it to
    /// the LLM. Used to seed a fresh session with a bootstrap prompt.
    pub fn inject_message(&mut self, role: Role, content: String) {
        let message = Message {
            role,
            content: Arc::from(content.as_str()),
            tool_calls: Vec::new(),
        };
        self.token_count += count_message_tokens(&message);
        self.conversation_history.push(message);
        self.trim_conversation_history();
    }

    /// Replaces the system prompt, updating the running token count.
    pub fn set_system_prompt(&mut self, prompt: String) {
        let old_prompt_tokens = count_message_tokens(&self.system_prompt);
        self.system_prompt = Message {
            role: Role::System,
            content: Arc::from(prompt.as_str()),
            tool_calls: Vec::new(),
        };
        let new_prompt_tokens = count_message_tokens(&self.system_prompt);
        self.token_count = self.token_count - old_prompt_tokens + new_prompt_tokens;
    }

    /// Drops all non-system history, resetting the token count to just the
    /// system prompt's cost.
    pub fn clear_history(&mut self) {
        self.conversation_history.clear();
        self.token_count = count_message_tokens(&self.system_prompt);
    }

    pub fn get_conversation_history(&self) -> &[Message] {
        &self.conversation_history
    }

    pub fn get_max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn estimated_history_tokens(&self) -> usize {
        self.token_count
    }

    pub fn client(&self) -> &Arc<dyn ClientWrapper> {
        &self.client
    }

    fn trim_conversation_history(&mut self) {
        while self.token_count > self.max_tokens && !self.conversation_history.is_empty() {
            let removed = self.conversation_history.remove(0);
            self.token_count -= count_message_tokens(&removed);
        }
    }
}

/// Estimates the number of tokens in a string using a one-token-per-4-chars
/// approximation.
fn count_tokens(text: &str) -> usize {
    (text.len() / 4).max(1)
}

fn count_message_tokens(message: &Message) -> usize {
    let role_token_count = 1;
    role_token_count + count_tokens(&message.content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::client_wrapper::ToolDefinition;
    use async_trait::async_trait;

    struct EchoClient;

    #[async_trait]
    impl ClientWrapper for EchoClient {
        async fn send_message(
            &self,
            messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            let last = messages.last().cloned().unwrap();
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(format!("echo: {}", last.content).as_str()),
                tool_calls: Vec::new(),
            })
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn round_trip_updates_history() {
        let mut session = LLMSession::new(Arc::new(EchoClient), "be terse".to_string(), 10_000);
        let response = session
            .send_message(Role::User, "hi".to_string())
            .await
            .unwrap();
        assert_eq!(response.content.as_ref(), "echo: hi");
        assert_eq!(session.get_conversation_history().len(), 2);
    }

    #[tokio::test]
    async fn trims_oldest_messages_under_pressure() {
        let mut session = LLMSession::new(Arc::new(EchoClient), "sp".to_string(), 20);
        for i in 0..20 {
            session
                .send_message(Role::User, format!("message number {}", i))
                .await
                .unwrap();
        }
        assert!(session.estimated_history_tokens() <= 20);
    }

    #[tokio::test]
    async fn clear_history_resets_token_count() {
        let mut session = LLMSession::new(Arc::new(EchoClient), "sp".to_string(), 10_000);
        session
            .send_message(Role::User, "hello there".to_string())
            .await
            .unwrap();
        session.clear_history();
        assert!(session.get_conversation_history().is_empty());
        assert_eq!(session.estimated_history_tokens(), count_message_tokens(&session.system_prompt));
    }
}
