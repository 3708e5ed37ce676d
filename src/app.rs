use crate::credential::{
    Credential, CookieFile, CredentialError, CredentialStore, IdentitySource, RefreshMode, StaticCookies,
};
use crate::provider::cerebras::{CerebrasClient, Endpoints, DEFAULT_API_BASE, DEFAULT_IDENTITY_BASE};
use crate::provider::ChatRequest;
use crate::{cli, config};
use anyhow::Context;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

pub fn build_client(
    http: &reqwest::Client,
    cfg: Option<&config::Config>,
    args: &cli::Args,
    config_dir: &Path,
    state_dir: &Path,
) -> anyhow::Result<CerebrasClient> {
    let endpoints = Endpoints::new(
        cfg.and_then(|c| c.endpoints.api_base.as_deref())
            .unwrap_or(DEFAULT_API_BASE),
        cfg.and_then(|c| c.endpoints.identity_base.as_deref())
            .unwrap_or(DEFAULT_IDENTITY_BASE),
    )?;

    let store = CredentialStore::in_dir(state_dir);
    let identity = identity_source(cfg, args.cookies.clone(), config_dir);

    let mut client = CerebrasClient::new(http.clone(), endpoints, store, identity)
        .with_refresh_mode(refresh_mode(args, cfg));
    if let Some(c) = cfg {
        client = client.with_refresh_policy(c.retry.policy());
        if let Some(n) = c.retry.max_reauth {
            client = client.with_max_reauth(n);
        }
    }
    Ok(client)
}

/// `--refresh-mode`, then `session.mode`, then GraphQL.
pub fn refresh_mode(args: &cli::Args, cfg: Option<&config::Config>) -> RefreshMode {
    args.refresh_mode
        .or_else(|| cfg.and_then(|c| c.session.mode))
        .unwrap_or_default()
}

/// Flag, then CEREBRAS_COOKIES, then config, then `<config_dir>/cookies.txt`.
pub fn identity_source(
    cfg: Option<&config::Config>,
    flag: Option<String>,
    config_dir: &Path,
) -> Box<dyn IdentitySource> {
    let cookies = flag
        .or_else(|| std::env::var("CEREBRAS_COOKIES").ok())
        .or_else(|| cfg.and_then(|c| c.session.cookies.clone()));
    if let Some(cookies) = cookies {
        return Box::new(StaticCookies(cookies));
    }

    let file = cfg
        .and_then(|c| c.session.cookies_file.clone())
        .unwrap_or_else(|| config_dir.join("cookies.txt"));
    Box::new(CookieFile(file))
}

/// Defaults for every message: flags win over config, config over built-ins.
pub fn request_template(args: &cli::Args, cfg: Option<&config::Config>) -> ChatRequest {
    let mut req = ChatRequest::new("");

    if let Some(model) = args.model.or_else(|| cfg.and_then(|c| c.model)) {
        req.model = model;
    }
    if let Some(system) = args
        .system_prompt
        .clone()
        .or_else(|| cfg.and_then(|c| c.system_prompt.clone()))
    {
        req.system_prompt = system;
    }
    if let Some(t) = args.temperature.or_else(|| cfg.and_then(|c| c.temperature)) {
        req.temperature = t;
    }
    if let Some(n) = args.max_tokens.or_else(|| cfg.and_then(|c| c.max_tokens)) {
        req.max_tokens = n;
    }
    req.timeout = args
        .timeout
        .or_else(|| cfg.and_then(|c| c.timeout_secs))
        .map(Duration::from_secs);
    req.stream_to_caller = !args.no_stream && cfg.and_then(|c| c.stream).unwrap_or(true);

    req
}

/// Make sure a key is on disk before the first request.
pub async fn bootstrap(client: &mut CerebrasClient) -> anyhow::Result<()> {
    match client.reload_credential() {
        Ok(()) => Ok(()),
        Err(CredentialError::ConfigMissing { path, reason }) => {
            tracing::info!(path = %path.display(), %reason, "no stored demo API key, fetching one");
            client
                .refresh_credential()
                .await
                .context("failed to obtain a demo API key")?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn cmd_refresh(client: &mut CerebrasClient, out: &mut dyn Write) -> anyhow::Result<()> {
    let cred = client
        .refresh_credential()
        .await
        .context("failed to refresh demo API key")?;
    writeln!(out, "API key updated successfully.")?;
    print_credential(out, &cred)?;
    writeln!(out, "Saved to: {}", client.store().path().display())?;
    Ok(())
}

pub fn cmd_status(store: &CredentialStore, out: &mut dyn Write) -> anyhow::Result<()> {
    match store.load() {
        Ok(cred) => print_credential(out, &cred)?,
        Err(CredentialError::ConfigMissing { path, reason }) => {
            writeln!(out, "No demo API key stored at {} ({reason}).", path.display())?;
            writeln!(out, "Run `cerebras refresh` to fetch one.")?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn print_credential(out: &mut dyn Write, cred: &Credential) -> std::io::Result<()> {
    let fmt_time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.format("%d-%m-%Y %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };

    writeln!(out, "Owner:   {}", cred.owner_name.as_deref().unwrap_or("unknown"))?;
    writeln!(out, "API key: {}", cred.masked_token())?;
    writeln!(out, "Created: {}", fmt_time(cred.created_at))?;
    writeln!(out, "Expires: {}", fmt_time(cred.expires_at))?;
    Ok(())
}

pub async fn run_once(
    client: &mut CerebrasClient,
    req: &ChatRequest,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let text = client.chat(req, out).await.context("chat request failed")?;
    if !req.stream_to_caller {
        write!(out, "{text}")?;
    }
    writeln!(out)?;
    Ok(())
}
