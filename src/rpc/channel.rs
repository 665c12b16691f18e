//! Framed transport over the sandbox pipe pair.
//!
//! The channel owns the host-to-sandbox write half. The sandbox-to-host
//! read half is consumed by the dispatcher's reply pump, so the two
//! directions close independently and each closure is reported with its
//! own side.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::{self, Message};
use crate::error::{PipeSide, Result, SandboxError};

pub(crate) type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type PipeReader = Box<dyn AsyncRead + Send + Unpin>;

pub(crate) struct Channel {
    /// `None` once the write side is closed, by request or by error.
    writer: Mutex<Option<PipeWriter>>,
}

impl Channel {
    pub fn new(writer: PipeWriter) -> Self {
        Self {
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Writes one frame. The first I/O failure closes the write side for
    /// good; later sends fail immediately without touching the pipe.
    pub async fn send(&self, message: &Message) -> Result<()> {
        let frame = protocol::encode(message)
            .map_err(|e| SandboxError::Protocol(e.to_string()))?;

        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(SandboxError::ChannelClosed {
                side: PipeSide::ToSandbox,
            });
        };

        let outcome = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = outcome {
            debug!(error = %e, "write to sandbox failed, command pipe is closed");
            *guard = None;
            return Err(SandboxError::ChannelClosed {
                side: PipeSide::ToSandbox,
            });
        }
        Ok(())
    }

    /// Drops the write half. The guest observes end-of-stream on its
    /// command pipe, which is the graceful-exit request.
    pub async fn close(&self) {
        *self.writer.lock().await = None;
    }
}
