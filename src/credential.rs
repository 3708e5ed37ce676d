use crate::browser;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE, COOKIE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Name of the credential file inside the state directory.
pub const CREDENTIAL_FILE: &str = "demo_api_key.json";

#[derive(Debug, Error)]
pub enum CredentialError {
    /// Nothing usable on disk; the caller should refresh.
    #[error("no usable credential at {}: {reason}", path.display())]
    ConfigMissing { path: PathBuf, reason: String },

    #[error("no session cookies available: {0}")]
    MissingIdentity(String),

    #[error("demo key refresh gave up after {attempts} attempt(s): {last}")]
    RefreshFailed { attempts: u32, last: String },

    #[error("unexpected demo key payload: {0}")]
    UnexpectedPayload(String),

    #[error("failed to write credential {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Demo API key plus whatever metadata the identity service sent with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub token: String,
    pub created_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub owner_name: Option<String>,

    /// Response body exactly as received; this is what gets persisted.
    pub payload: Value,
}

impl Credential {
    /// Accepts both the GraphQL `GetMyDemoApiKey` response and the
    /// `/api/auth/session` shape (`user.demoApiKey`).
    pub fn from_payload(payload: Value) -> Result<Self, String> {
        let token = payload
            .pointer("/data/GetMyDemoApiKey")
            .or_else(|| payload.pointer("/user/demoApiKey"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let Some(token) = token else {
            return Err(missing_token_reason(&payload));
        };

        Ok(Self {
            token,
            created_at: timestamp(&payload, "/createdAt"),
            expires_at: timestamp(&payload, "/expires"),
            owner_name: payload
                .pointer("/user/name")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload,
        })
    }

    pub fn masked_token(&self) -> String {
        let chars: Vec<char> = self.token.chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}…{tail}")
    }
}

fn timestamp(payload: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    let raw = payload.pointer(pointer)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn missing_token_reason(payload: &Value) -> String {
    let messages: Vec<&str> = payload
        .get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if messages.is_empty() {
        "no demo API key in payload".to_string()
    } else {
        format!("no demo API key in payload: {}", messages.join("; "))
    }
}

/// Supplies the session assertion exchanged for a demo key.
pub trait IdentitySource: Send + Sync {
    /// Value for the `Cookie` header of a signed-in inference.cerebras.ai session.
    fn cookie_header(&self) -> Result<String, CredentialError>;
}

#[derive(Debug, Clone)]
pub struct StaticCookies(pub String);

impl IdentitySource for StaticCookies {
    fn cookie_header(&self) -> Result<String, CredentialError> {
        let s = self.0.trim();
        if s.is_empty() {
            return Err(CredentialError::MissingIdentity("cookie string is empty".into()));
        }
        Ok(s.to_string())
    }
}

/// Cookie header read from a file on every refresh, so it can be updated
/// without restarting.
#[derive(Debug, Clone)]
pub struct CookieFile(pub PathBuf);

impl IdentitySource for CookieFile {
    fn cookie_header(&self) -> Result<String, CredentialError> {
        let s = std::fs::read_to_string(&self.0).map_err(|e| {
            CredentialError::MissingIdentity(format!("{}: {e}", self.0.display()))
        })?;
        StaticCookies(s).cookie_header()
    }
}

/// How often a failing refresh is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Bounded { max_attempts: u32, backoff: Duration },
    /// Keep trying until the identity service answers.
    Unbounded { backoff: Duration },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Bounded {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow `attempts` failed ones.
    pub fn allows_another(&self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Bounded { max_attempts, .. } => attempts < *max_attempts,
            RetryPolicy::Unbounded { .. } => true,
        }
    }

    /// Sleep after the `attempt`-th failure: doubles each time, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = match self {
            RetryPolicy::Bounded { backoff, .. } | RetryPolicy::Unbounded { backoff } => *backoff,
        };
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        base.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Which inference.cerebras.ai endpoint mints the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// `POST /api/graphql` `GetMyDemoApiKey`; answers with the key only.
    #[default]
    Graphql,
    /// `GET /api/auth/session`; key plus owner, creation and expiry.
    Session,
}

/// A refresh mode bound to its URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyExchange {
    Graphql(Url),
    Session(Url),
}

impl KeyExchange {
    pub fn url(&self) -> &Url {
        match self {
            KeyExchange::Graphql(u) | KeyExchange::Session(u) => u,
        }
    }
}

enum AttemptError {
    /// Network failure or non-2xx; worth retrying.
    Transport(String),
    /// The service answered but not with something we understand.
    Payload(String),
}

/// Single JSON file holding the last demo key payload.
///
/// Not synchronised: concurrent refreshes from several processes race on the
/// rename and the last writer wins.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/demo_api_key.json`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CREDENTIAL_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Credential, CredentialError> {
        let bytes = std::fs::read(&self.path).map_err(|e| self.missing(e.to_string()))?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| self.missing(format!("invalid JSON: {e}")))?;
        Credential::from_payload(payload).map_err(|reason| self.missing(reason))
    }

    /// Replace the stored payload via write-to-temp and rename.
    pub fn save(&self, payload: &Value) -> Result<(), CredentialError> {
        let io_err = |source| CredentialError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;

        let tmp = tmp_path(&self.path);
        let bytes = serde_json::to_vec_pretty(payload)
            .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Exchange session cookies for a fresh demo key and persist it.
    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        exchange: &KeyExchange,
        identity: &dyn IdentitySource,
        policy: RetryPolicy,
    ) -> Result<Credential, CredentialError> {
        let cookies = identity.cookie_header()?;
        let cookie = HeaderValue::from_str(&cookies).map_err(|e| {
            CredentialError::MissingIdentity(format!("cookie string is not a valid header: {e}"))
        })?;

        let payload = with_retries(policy, || request_demo_key(http, exchange, &cookie)).await?;
        let cred = Credential::from_payload(payload).map_err(CredentialError::UnexpectedPayload)?;
        self.save(&cred.payload)?;
        tracing::info!(
            path = %self.path.display(),
            url = %exchange.url(),
            owner = ?cred.owner_name,
            "demo API key updated"
        );
        Ok(cred)
    }

    fn missing(&self, reason: String) -> CredentialError {
        CredentialError::ConfigMissing {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Run `attempt` until it succeeds, fails for good, or `policy` runs out.
async fn with_retries<T, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T, CredentialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(AttemptError::Payload(msg)) => return Err(CredentialError::UnexpectedPayload(msg)),
            Err(AttemptError::Transport(msg)) => {
                if !policy.allows_another(attempts) {
                    return Err(CredentialError::RefreshFailed {
                        attempts,
                        last: msg,
                    });
                }
                let delay = policy.delay_after(attempts);
                tracing::warn!(attempts, ?delay, error = %msg, "demo key refresh failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn request_demo_key(
    http: &reqwest::Client,
    exchange: &KeyExchange,
    cookie: &HeaderValue,
) -> Result<Value, AttemptError> {
    let mut headers = browser::site_headers();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(COOKIE, cookie.clone());

    let req = match exchange {
        KeyExchange::Graphql(url) => http.post(url.clone()).json(&json!({
            "operationName": "GetMyDemoApiKey",
            "variables": {},
            "query": "query GetMyDemoApiKey {\n  GetMyDemoApiKey\n}",
        })),
        KeyExchange::Session(url) => http.get(url.clone()),
    };

    let resp = req
        .headers(headers)
        .send()
        .await
        .map_err(|e| AttemptError::Transport(e.to_string()))?;

    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| AttemptError::Transport(format!("failed to read response: {e}")))?;
    if !status.is_success() {
        return Err(AttemptError::Transport(format!(
            "HTTP {status}: {}",
            String::from_utf8_lossy(&bytes)
        )));
    }

    serde_json::from_slice(&bytes).map_err(|e| AttemptError::Payload(format!("invalid JSON: {e}")))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let file = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "credential.json".to_string());
    p.set_file_name(format!("{file}.tmp"));
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::Bounded {
            max_attempts,
            backoff: Duration::ZERO,
        }
    }

    fn graphql_url(server: &MockServer) -> KeyExchange {
        KeyExchange::Graphql(Url::parse(&format!("{}/api/graphql", server.uri())).unwrap())
    }

    fn key_body(key: &str) -> Value {
        json!({ "data": { "GetMyDemoApiKey": key } })
    }

    #[test]
    fn load_missing_file_is_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nope.json"));
        assert!(matches!(store.load(), Err(CredentialError::ConfigMissing { .. })));
    }

    #[test]
    fn load_malformed_or_empty_is_config_missing() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cred.json");

        std::fs::write(&p, b"{not json").unwrap();
        let store = CredentialStore::new(&p);
        assert!(matches!(store.load(), Err(CredentialError::ConfigMissing { .. })));

        std::fs::write(&p, b"{}").unwrap();
        assert!(matches!(store.load(), Err(CredentialError::ConfigMissing { .. })));

        std::fs::write(&p, br#"{"data":{"GetMyDemoApiKey":"  "}}"#).unwrap();
        assert!(matches!(store.load(), Err(CredentialError::ConfigMissing { .. })));
    }

    #[test]
    fn session_payload_shape() {
        let cred = Credential::from_payload(json!({
            "user": { "name": "Ada", "demoApiKey": "csk-123456789" },
            "createdAt": "2024-11-20T10:00:00.000Z",
            "expires": "2024-12-20T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(cred.token, "csk-123456789");
        assert_eq!(cred.owner_name.as_deref(), Some("Ada"));
        assert_eq!(cred.created_at.unwrap().to_rfc3339(), "2024-11-20T10:00:00+00:00");
        assert!(cred.expires_at.unwrap() > cred.created_at.unwrap());
        assert_eq!(cred.masked_token(), "csk-…6789");
    }

    #[test]
    fn graphql_errors_are_reported() {
        let err = Credential::from_payload(json!({
            "data": null,
            "errors": [{ "message": "Not authenticated" }]
        }))
        .unwrap_err();
        assert!(err.contains("Not authenticated"), "{err}");
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = RetryPolicy::Bounded {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(500));
        assert_eq!(p.delay_after(2), Duration::from_secs(1));
        assert_eq!(p.delay_after(3), Duration::from_secs(2));
        assert_eq!(p.delay_after(40), MAX_BACKOFF);
        assert!(p.allows_another(2));
        assert!(!p.allows_another(3));
        assert!(RetryPolicy::Unbounded { backoff: Duration::ZERO }.allows_another(u32::MAX));
    }

    #[test]
    fn cookie_sources_reject_blank() {
        assert!(StaticCookies("  \n".into()).cookie_header().is_err());
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("cookies.txt");
        std::fs::write(&p, "a=1; b=2\n").unwrap();
        assert_eq!(CookieFile(p).cookie_header().unwrap(), "a=1; b=2");
        assert!(CookieFile(dir.path().join("missing")).cookie_header().is_err());
    }

    #[tokio::test]
    async fn refresh_persists_and_load_returns_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .and(header("cookie", "session=abc"))
            .and(body_partial_json(json!({ "operationName": "GetMyDemoApiKey" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(key_body("csk-fresh")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("state").join("cred.json"));
        assert!(store.load().is_err());

        let http = reqwest::Client::new();
        let cred = store
            .refresh(&http, &graphql_url(&server), &StaticCookies("session=abc".into()), fast(1))
            .await
            .unwrap();
        assert_eq!(cred.token, "csk-fresh");

        let loaded = store.load().unwrap();
        assert_eq!(loaded.token, "csk-fresh");
        assert_eq!(loaded.payload, key_body("csk-fresh"));
        assert!(!tmp_path(store.path()).exists());
    }

    #[tokio::test]
    async fn refresh_retries_transport_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/graphql"))
            .respond_with(ResponseTemplate::new(200).set_body_json(key_body("csk-third")))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cred.json"));
        let cred = store
            .refresh(&reqwest::Client::new(), &graphql_url(&server), &StaticCookies("s=1".into()), fast(3))
            .await
            .unwrap();
        assert_eq!(cred.token, "csk-third");
    }

    #[tokio::test]
    async fn unbounded_policy_keeps_going() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(7)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(key_body("csk-late")))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cred.json"));
        let cred = store
            .refresh(
                &reqwest::Client::new(),
                &graphql_url(&server),
                &StaticCookies("s=1".into()),
                RetryPolicy::Unbounded { backoff: Duration::ZERO },
            )
            .await
            .unwrap();
        assert_eq!(cred.token, "csk-late");
    }

    #[tokio::test]
    async fn bounded_policy_gives_up_and_keeps_old_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cred.json"));
        store.save(&key_body("csk-old")).unwrap();

        let err = store
            .refresh(&reqwest::Client::new(), &graphql_url(&server), &StaticCookies("s=1".into()), fast(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::RefreshFailed { attempts: 2, .. }), "{err}");
        assert_eq!(store.load().unwrap().token, "csk-old");
    }

    #[tokio::test]
    async fn rejected_session_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [{ "message": "Unauthorized" }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cred.json"));
        let err = store
            .refresh(&reqwest::Client::new(), &graphql_url(&server), &StaticCookies("s=1".into()), fast(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialError::UnexpectedPayload(_)), "{err}");
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn session_refresh_fills_owner_and_dates() {
        let server = MockServer::start().await;
        let payload = json!({
            "user": { "name": "Ada Lovelace", "demoApiKey": "csk-session-key" },
            "createdAt": "2024-11-20T10:00:00.000Z",
            "expires": "2024-12-20T10:00:00.000Z",
        });
        Mock::given(method("GET"))
            .and(path("/api/auth/session"))
            .and(header("cookie", "session=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(payload.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        let exchange =
            KeyExchange::Session(Url::parse(&format!("{}/api/auth/session", server.uri())).unwrap());
        store
            .refresh(&reqwest::Client::new(), &exchange, &StaticCookies("session=abc".into()), fast(1))
            .await
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.token, "csk-session-key");
        assert_eq!(loaded.owner_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(loaded.created_at.unwrap().to_rfc3339(), "2024-11-20T10:00:00+00:00");
        assert_eq!(loaded.expires_at.unwrap().to_rfc3339(), "2024-12-20T10:00:00+00:00");
        assert_eq!(loaded.payload, payload);
    }

    #[test]
    fn store_in_dir_uses_fixed_file_name() {
        let store = CredentialStore::in_dir("/var/lib/cerebras");
        assert_eq!(store.path(), Path::new("/var/lib/cerebras/demo_api_key.json"));
    }

    #[test]
    fn refresh_mode_names() {
        #[derive(Deserialize)]
        struct Wrap {
            mode: RefreshMode,
        }
        let w: Wrap = toml::from_str(r#"mode = "session""#).unwrap();
        assert_eq!(w.mode, RefreshMode::Session);
        assert_eq!(RefreshMode::default(), RefreshMode::Graphql);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_sleep_doubling_backoff() {
        let policy = RetryPolicy::Bounded {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        };
        let started = tokio::time::Instant::now();
        let mut calls = 0u32;
        let got = with_retries(policy, || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(AttemptError::Transport(format!("down #{n}")))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(got, 3);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_last_error() {
        let policy = RetryPolicy::Bounded {
            max_attempts: 2,
            backoff: Duration::from_secs(10),
        };
        let started = tokio::time::Instant::now();
        let err = with_retries(policy, || async {
            Err::<(), _>(AttemptError::Transport("refused".into()))
        })
        .await
        .unwrap_err();

        assert!(
            matches!(&err, CredentialError::RefreshFailed { attempts: 2, last } if last == "refused"),
            "{err}"
        );
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
