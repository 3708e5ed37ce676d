use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload of a `data:` line, prefix stripped.
    Data(String),
    /// Anything else: comments, keep-alives, `event:` lines, undecodable bytes.
    Other(String),
}

/// Line-oriented parser for the completions stream.
///
/// Every newline-terminated line is one frame. Bytes are buffered until a
/// newline arrives, so frames split across network chunks reassemble.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.drain(..=pos).collect::<Vec<u8>>();
            if let Some(frame) = frame_from_line(&line) {
                out.push(frame);
            }
        }

        out
    }

    /// Flush a trailing line the server did not terminate before closing.
    pub fn finish(&mut self) -> Option<Frame> {
        let line = std::mem::take(&mut self.buf);
        frame_from_line(&line)
    }
}

fn frame_from_line(line: &[u8]) -> Option<Frame> {
    let mut line = line;
    if let Some(rest) = line.strip_suffix(b"\n") {
        line = rest;
    }
    if let Some(rest) = line.strip_suffix(b"\r") {
        line = rest;
    }
    if line.is_empty() {
        return None;
    }

    let s = String::from_utf8_lossy(line);
    match s.strip_prefix("data:") {
        Some(rest) => Some(Frame::Data(rest.strip_prefix(' ').unwrap_or(rest).to_string())),
        None => Some(Frame::Other(s.to_string())),
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Content of `choices[0].delta.content`, `None` when absent or null.
pub fn decode_delta(data: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: CompletionChunk = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content))
}
