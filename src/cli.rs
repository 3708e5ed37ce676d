use crate::credential::RefreshMode;
use crate::provider::Model;
use clap::{Parser, Subcommand};

/// Chat with Cerebras-hosted models on a demo API key
#[derive(Debug, Parser)]
#[command(name = "cerebras")]
#[command(version)]
#[command(about = "Chat with Cerebras-hosted models on a demo API key", long_about = None)]
pub struct Args {
    /// Model name
    #[arg(short = 'm', long = "model", value_enum)]
    pub model: Option<Model>,

    /// System prompt
    #[arg(short = 's', long = "system")]
    pub system_prompt: Option<String>,

    /// Sampling temperature
    #[arg(short = 't', long = "temperature")]
    pub temperature: Option<f32>,

    /// Completion token limit
    #[arg(long = "max-tokens")]
    pub max_tokens: Option<u32>,

    /// Give up on a request after this many seconds (default: wait forever)
    #[arg(long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the answer only once it is complete
    #[arg(long = "no-stream")]
    pub no_stream: bool,

    /// Cookie header of a signed-in inference.cerebras.ai session
    #[arg(long = "cookies", value_name = "COOKIE")]
    pub cookies: Option<String>,

    /// Endpoint used to mint a new demo key
    #[arg(long = "refresh-mode", value_enum, value_name = "MODE")]
    pub refresh_mode: Option<RefreshMode>,

    /// Prompt text; safe for prompts that start with a subcommand name
    #[arg(short = 'p', long = "prompt", value_name = "TEXT", conflicts_with = "prompt")]
    pub prompt_flag: Option<String>,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Prompt text (positional); without one the interactive loop starts
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

impl Args {
    /// `-p` text if given, else the positional words joined by spaces.
    pub fn prompt_text(&self) -> String {
        match &self.prompt_flag {
            Some(p) => p.clone(),
            None => self.prompt.join(" "),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive chat loop on stdin
    Chat,

    /// Mint a new demo API key from the session cookies and store it
    Refresh,

    /// Show the stored demo API key
    Status,
}
