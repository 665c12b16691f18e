//! Wire protocol between host and isolated runtime.
//!
//! One frame = a 4-byte big-endian length prefix followed by a JSON
//! message body. The host sends `call` frames on the command pipe and the
//! guest answers with `reply` frames on the reply pipe; call ids are
//! allocated by the host, monotonic, and never reused within a handle.
//!
//! Both async (host) and blocking (guest) helpers live here so the two
//! sides cannot drift apart.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single frame body. Megabyte-scale payloads are
/// in-contract; a corrupt or hostile length prefix must not drive host
/// allocation.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Environment variable telling the guest how its channel is wired.
pub const CHANNEL_ENV: &str = "FORMBOX_CHANNEL";
/// Channel on dedicated descriptors: guest reads fd 3, writes fd 4.
pub const CHANNEL_FDS: &str = "fd:3,4";
/// Channel on stdin/stdout (wasm host runtimes forward only stdio).
pub const CHANNEL_STDIO: &str = "stdio";

/// Guest-side descriptor carrying host-to-sandbox frames.
pub const COMMAND_FD: i32 = 3;
/// Guest-side descriptor carrying sandbox-to-host frames.
pub const REPLY_FD: i32 = 4;

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Host asks the guest to run a named function.
    Call {
        id: u64,
        function: String,
        args: Vec<Value>,
    },
    /// Guest answers a call.
    Reply { id: u64, outcome: Outcome },
}

/// Result carried by a reply frame: `{"ok": value}` or `{"err": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "ok")]
    Ok(Value),
    #[serde(rename = "err")]
    Err(RemoteFailure),
}

/// A failure raised inside the isolated runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub message: String,
    pub traceback: String,
}

/// Why a frame could not be read.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Truncated header/body, oversized length, or unparseable JSON.
    /// Fatal to the handle (protocol violation).
    #[error("{0}")]
    Malformed(String),
}

/// Serializes a message into a ready-to-write frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)
        .map_err(|e| FrameError::Malformed(format!("encode: {e}")))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::Malformed(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN}-byte cap",
            body.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

fn decode_body(body: &[u8]) -> Result<Message, FrameError> {
    serde_json::from_slice(body).map_err(|e| FrameError::Malformed(format!("bad frame: {e}")))
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Malformed(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN}-byte cap"
        )));
    }
    Ok(())
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly on a frame
/// boundary; EOF inside a frame is malformed.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Malformed("truncated frame header".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Malformed("truncated frame body".into())
        } else {
            FrameError::Io(e)
        }
    })?;
    decode_body(&body).map(Some)
}

/// Blocking counterpart of [`read_frame`] for the guest side.
pub fn read_frame_sync<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: std::io::Read,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Malformed("truncated frame header".into()));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::Malformed("truncated frame body".into())
        } else {
            FrameError::Io(e)
        }
    })?;
    decode_body(&body).map(Some)
}
