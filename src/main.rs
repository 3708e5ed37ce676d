mod app;
mod browser;
mod cli;
mod config;
mod credential;
mod paths;
mod provider;
mod repl;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the conversation.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    // Resolve and create dirs early.
    let config_dir = paths::config_dir()?;
    let state_dir = paths::state_dir()?;

    let cfg = config::Config::load_optional(config_dir.join("config.toml"))?;
    tracing::debug!(?config_dir, ?cfg, "resolved config");

    // User-Agent is chosen per request.
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let mut client = app::build_client(&http, cfg.as_ref(), &args, &config_dir, &state_dir)?;
    let mut out = std::io::stdout();

    match &args.cmd {
        Some(cli::Command::Refresh) => {
            return app::cmd_refresh(&mut client, &mut out).await;
        }
        Some(cli::Command::Status) => {
            return app::cmd_status(client.store(), &mut out);
        }
        Some(cli::Command::Chat) | None => {}
    }

    app::bootstrap(&mut client).await?;
    let template = app::request_template(&args, cfg.as_ref());

    let prompt = args.prompt_text();
    if matches!(args.cmd, Some(cli::Command::Chat)) || prompt.trim().is_empty() {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        return repl::run(&mut client, &template, stdin, &mut out).await;
    }

    app::run_once(&mut client, &template.with_message(prompt), &mut out).await
}
