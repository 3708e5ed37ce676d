use crate::provider::cerebras::CerebrasClient;
use crate::provider::ChatRequest;
use anyhow::Context;
use std::io::Write;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// `None` for input that should never reach the server.
pub fn dispatchable(line: &str) -> Option<&str> {
    if line.trim().is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Read prompts line by line until EOF, answering each.
///
/// A failed exchange is reported and the loop carries on.
pub async fn run<R>(
    client: &mut CerebrasClient,
    template: &ChatRequest,
    input: R,
    out: &mut dyn Write,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();

    loop {
        write!(out, "You: ")?;
        out.flush()?;

        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            writeln!(out)?;
            return Ok(());
        };
        let Some(message) = dispatchable(&line) else {
            continue;
        };

        let req = template.with_message(message);
        let started = Instant::now();
        if req.stream_to_caller {
            write!(out, "Cerebras: ")?;
            out.flush()?;
        }

        match client.chat(&req, out).await {
            Ok(text) => {
                if !req.stream_to_caller {
                    write!(out, "Cerebras: {text}")?;
                }
                writeln!(out, "\n[{:.2}s]\n", started.elapsed().as_secs_f64())?;
            }
            Err(e) => {
                tracing::debug!(error = ?e, "chat exchange failed");
                writeln!(out, "\nerror: {e}\n")?;
            }
        }
    }
}
