use crate::credential::{RefreshMode, RetryPolicy, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
use crate::provider::Model;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default model (optional)
    pub model: Option<Model>,

    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,

    /// Per-request timeout in seconds. Unset waits indefinitely.
    pub timeout_secs: Option<u64>,

    /// Print deltas as they arrive (default: true).
    pub stream: Option<bool>,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub endpoints: EndpointsConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Raw `Cookie` header of a signed-in inference.cerebras.ai tab.
    pub cookies: Option<String>,

    /// File holding the cookie header; re-read on every refresh.
    pub cookies_file: Option<PathBuf>,

    /// `graphql` (default) or `session`.
    pub mode: Option<RefreshMode>,
}

// Cookies are a live session; keep them out of debug logs.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("cookies", &self.cookies.as_ref().map(|_| "<redacted>"))
            .field("cookies_file", &self.cookies_file)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointsConfig {
    pub api_base: Option<String>,
    pub identity_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,

    /// Retry key refreshes forever instead of giving up after `max_attempts`.
    #[serde(default)]
    pub unbounded: bool,

    /// Key refreshes allowed per chat request before a 401 is final.
    pub max_reauth: Option<u32>,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let backoff = self
            .backoff_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BACKOFF);

        if self.unbounded {
            RetryPolicy::Unbounded { backoff }
        } else {
            RetryPolicy::Bounded {
                max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
                backoff,
            }
        }
    }
}

impl Config {
    /// Load config if the file exists, otherwise return Ok(None).
    pub fn load_optional(path: impl AsRef<Path>) -> anyhow::Result<Option<Self>> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("failed to read config: {}", path.display()))
            }
        };

        let s = String::from_utf8(bytes).context("config is not valid UTF-8")?;
        let cfg: Config = toml::from_str(&s)
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
        Ok(Some(cfg))
    }
}
