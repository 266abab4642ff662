use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ResponderError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One prior exchange passed to the responder as conversation context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub text: String,
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
        }
    }
}

/// Black-box text completion used to answer consultations.
#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a reply to `prompt` given the preceding `history`.
    async fn generate(&self, prompt: &str, history: &[ChatTurn]) -> Result<String, ResponderError>;
}
