//! Child-process wire framing.
//!
//! Line-delimited JSON over stdin/stdout. Host-to-child and
//! child-to-host payloads are signed envelopes; the child may
//! additionally emit untrusted `progress` and `log` lines which are
//! surfaced but never acted upon.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::envelope::SignedEnvelope;
use crate::types::{Error, Result};

/// One parsed line from a child.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildMessage {
    Envelope(Box<SignedEnvelope>),
    Progress { percent: u8, message: Option<String> },
    Log { message: String },
}

/// Parse a single NDJSON line from the child.
pub fn parse_child_line(line: &str) -> Result<ChildMessage> {
    let value: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| Error::GearError(format!("malformed child output: {}", e)))?;

    match value.get("type").and_then(|t| t.as_str()) {
        Some("progress") => {
            let percent = value
                .get("percent")
                .and_then(|p| p.as_u64())
                .unwrap_or(0)
                .min(100) as u8;
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string());
            Ok(ChildMessage::Progress { percent, message })
        }
        Some("log") => {
            let message = value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(ChildMessage::Log { message })
        }
        _ => {
            let envelope: SignedEnvelope = serde_json::from_value(value)
                .map_err(|e| Error::GearError(format!("malformed child envelope: {}", e)))?;
            Ok(ChildMessage::Envelope(Box::new(envelope)))
        }
    }
}

/// Write one envelope as a single line.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &SignedEnvelope,
) -> Result<()> {
    let mut line = serde_json::to_string(envelope)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line; `None` on clean EOF.
pub async fn read_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}
