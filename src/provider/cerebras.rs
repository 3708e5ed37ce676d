use super::sse::{self, Frame, FrameParser};
use super::{ChatChunk, ChatError, ChatRequest, ChunkStream};
use crate::browser;
use crate::credential::{
    Credential, CredentialError, CredentialStore, IdentitySource, KeyExchange, RefreshMode, RetryPolicy,
};
use anyhow::Context;
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

pub const DEFAULT_API_BASE: &str = "https://api.cerebras.ai/";
pub const DEFAULT_IDENTITY_BASE: &str = "https://inference.cerebras.ai/";

#[derive(Debug, Clone)]
pub struct Endpoints {
    pub completions: Url,
    pub graphql: Url,
    pub session: Url,
}

impl Endpoints {
    pub fn new(api_base: &str, identity_base: &str) -> anyhow::Result<Self> {
        let identity = base_url(identity_base)?;
        Ok(Self {
            completions: base_url(api_base)?.join("v1/chat/completions")?,
            graphql: identity.join("api/graphql")?,
            session: identity.join("api/auth/session")?,
        })
    }

    pub fn key_exchange(&self, mode: RefreshMode) -> KeyExchange {
        match mode {
            RefreshMode::Graphql => KeyExchange::Graphql(self.graphql.clone()),
            RefreshMode::Session => KeyExchange::Session(self.session.clone()),
        }
    }
}

fn base_url(raw: &str) -> anyhow::Result<Url> {
    // Url::join drops the last segment unless the base ends with '/'.
    let mut s = raw.trim().to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    Url::parse(&s).with_context(|| format!("invalid base URL: {raw}"))
}

/// Streaming chat client that re-mints the demo key when it is rejected.
///
/// Holds the cached token; one request at a time (`&mut self`).
pub struct CerebrasClient {
    http: reqwest::Client,
    endpoints: Endpoints,
    store: CredentialStore,
    identity: Box<dyn IdentitySource>,
    refresh_policy: RetryPolicy,
    refresh_mode: RefreshMode,
    max_reauth: u32,
    token: Option<String>,
}

impl CerebrasClient {
    pub fn new(
        http: reqwest::Client,
        endpoints: Endpoints,
        store: CredentialStore,
        identity: Box<dyn IdentitySource>,
    ) -> Self {
        Self {
            http,
            endpoints,
            store,
            identity,
            refresh_policy: RetryPolicy::default(),
            refresh_mode: RefreshMode::default(),
            max_reauth: 1,
            token: None,
        }
    }

    pub fn with_refresh_policy(mut self, policy: RetryPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn with_refresh_mode(mut self, mode: RefreshMode) -> Self {
        self.refresh_mode = mode;
        self
    }

    /// Refreshes allowed per request before a 401 becomes final.
    pub fn with_max_reauth(mut self, max_reauth: u32) -> Self {
        self.max_reauth = max_reauth;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Re-read the store, replacing only the cached token.
    pub fn reload_credential(&mut self) -> Result<(), CredentialError> {
        let cred = self.store.load()?;
        self.token = Some(cred.token);
        Ok(())
    }

    pub async fn refresh_credential(&mut self) -> Result<Credential, CredentialError> {
        let exchange = self.endpoints.key_exchange(self.refresh_mode);
        let cred = self
            .store
            .refresh(&self.http, &exchange, &*self.identity, self.refresh_policy)
            .await?;
        self.reload_credential()?;
        Ok(cred)
    }

    fn token(&mut self) -> Result<String, CredentialError> {
        if self.token.is_none() {
            self.reload_credential()?;
        }
        Ok(self.token.clone().unwrap_or_default())
    }

    /// Start a completion and hand back its deltas as they arrive.
    pub async fn stream_chat(&mut self, req: &ChatRequest) -> Result<ChunkStream, ChatError> {
        let mut refreshes = 0u32;

        loop {
            let token = self.token().map_err(ChatError::NoCredential)?;
            let resp = self.send(req, &token).await?;
            let status = resp.status();

            match status {
                StatusCode::OK => return Ok(into_chunk_stream(resp)),
                StatusCode::UNAUTHORIZED => {
                    if refreshes >= self.max_reauth {
                        return Err(ChatError::AuthExpired {
                            attempts: refreshes,
                        });
                    }
                    refreshes += 1;
                    tracing::warn!(refreshes, "demo API key rejected, minting a new one");
                    self.refresh_credential().await.map_err(ChatError::Refresh)?;
                }
                _ => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(ChatError::UnexpectedStatus { status, body });
                }
            }
        }
    }

    /// Run a completion to the end and return the accumulated text.
    ///
    /// With `stream_to_caller` set, each delta is also written to `out` as it
    /// arrives.
    pub async fn chat(&mut self, req: &ChatRequest, out: &mut dyn Write) -> Result<String, ChatError> {
        let mut stream = self.stream_chat(req).await?;
        let mut text = String::new();

        while let Some(item) = stream.next().await {
            let chunk = item?;
            if req.stream_to_caller {
                out.write_all(chunk.text.as_bytes())?;
                out.flush()?;
            }
            text.push_str(&chunk.text);
        }

        Ok(text)
    }

    async fn send(&self, req: &ChatRequest, token: &str) -> Result<reqwest::Response, ChatError> {
        let mut headers = browser::site_headers();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer =
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ChatError::InvalidToken)?;
        headers.insert(AUTHORIZATION, bearer);

        let body = CompletionRequest {
            messages: [
                Message {
                    role: "system",
                    content: &req.system_prompt,
                },
                Message {
                    role: "user",
                    content: &req.user_message,
                },
            ],
            model: req.model.as_str(),
            stream: true,
            temperature: req.temperature,
            top_p: 1.0,
            max_completion_tokens: req.max_tokens,
        };

        let mut builder = self
            .http
            .post(self.endpoints.completions.clone())
            .headers(headers)
            .json(&body);
        if let Some(timeout) = req.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!(model = %req.model, url = %self.endpoints.completions, "sending completion request");
        Ok(builder.send().await?)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    messages: [Message<'a>; 2],
    model: &'static str,
    stream: bool,
    temperature: f32,
    top_p: f32,
    max_completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

fn into_chunk_stream(resp: reqwest::Response) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<Result<ChatChunk, ChatError>>(64);

    tokio::spawn(async move {
        let mut body = Box::pin(resp.bytes_stream());
        let mut parser = FrameParser::new();

        while let Some(item) = body.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx.send(Err(ChatError::Transport(e))).await;
                    return;
                }
            };

            for frame in parser.push(&bytes) {
                if let Some(chunk) = chunk_from_frame(frame) {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
            }
        }

        if let Some(chunk) = parser.finish().and_then(chunk_from_frame) {
            let _ = tx.send(Ok(chunk)).await;
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

fn chunk_from_frame(frame: Frame) -> Option<ChatChunk> {
    match frame {
        Frame::Data(data) => match sse::decode_delta(&data) {
            Ok(Some(text)) if !text.is_empty() => Some(ChatChunk { text }),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(frame = %data, error = %e, "skipping undecodable frame");
                None
            }
        },
        Frame::Other(line) => {
            tracing::debug!(frame = %line, "skipping non-data frame");
            None
        }
    }
}
