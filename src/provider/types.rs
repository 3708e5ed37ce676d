use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::ChatError;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1_000_000_000;

/// Models served on the demo key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum Model {
    #[default]
    #[serde(rename = "llama3.1-8b")]
    #[value(name = "llama3.1-8b")]
    Llama31_8b,
    #[serde(rename = "llama3.1-70b")]
    #[value(name = "llama3.1-70b")]
    Llama31_70b,
}

impl Model {
    pub fn as_str(self) -> &'static str {
        match self {
            Model::Llama31_8b => "llama3.1-8b",
            Model::Llama31_70b => "llama3.1-70b",
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub model: Model,
    pub temperature: f32,
    pub max_tokens: u32,

    /// `None` waits for the server indefinitely.
    pub timeout: Option<Duration>,

    /// Echo deltas to the caller's writer as they arrive.
    pub stream_to_caller: bool,
}

impl ChatRequest {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_message: user_message.into(),
            model: Model::default(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: None,
            stream_to_caller: false,
        }
    }

    /// Same settings, different user message.
    pub fn with_message(&self, user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatChunk {
    pub text: String,
}

/// Lazy, finite sequence of deltas. Ends when the server closes the body.
pub type ChunkStream = BoxStream<'static, Result<ChatChunk, ChatError>>;
