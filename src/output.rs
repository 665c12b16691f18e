//! Capture of the isolated runtime's diagnostic output.
//!
//! Guest stdout/stderr lines are forwarded to `tracing`, tagged with the
//! handle id and stream, and the most recent lines are kept in a bounded
//! tail so a remote error can carry the output that preceded it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Which guest stream a diagnostic line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagStream {
    Stdout,
    Stderr,
}

impl fmt::Display for DiagStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagStream::Stdout => write!(f, "stdout"),
            DiagStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Upper bound on retained diagnostic text per handle. Old lines are
/// evicted first; logging via `tracing` is unaffected.
const TAIL_MAX_BYTES: usize = 8 * 1024;

/// Bounded tail of recent guest output.
#[derive(Default)]
pub(crate) struct DiagTail {
    lines: Mutex<VecDeque<String>>,
}

impl DiagTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stream: DiagStream, line: &str) {
        let mut lines = self.lines.lock().unwrap();
        lines.push_back(format!("[{stream}] {line}"));
        let mut total: usize = lines.iter().map(|l| l.len() + 1).sum();
        while total > TAIL_MAX_BYTES {
            match lines.pop_front() {
                Some(evicted) => total -= evicted.len() + 1,
                None => break,
            }
        }
    }

    /// Takes the retained tail, leaving it empty. Each remote error gets
    /// the output captured since the previous one.
    pub fn take(&self) -> String {
        let mut lines = self.lines.lock().unwrap();
        let text = lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        lines.clear();
        text
    }
}

/// Pumps one guest stream into `tracing` and the tail buffer until it
/// ends. The task finishes on its own when the process exits.
pub(crate) fn capture<R>(
    reader: R,
    stream: DiagStream,
    handle_id: Uuid,
    tail: std::sync::Arc<DiagTail>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "formbox::sandbox", handle = %handle_id, %stream, "{line}");
                    tail.push(stream, &line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(handle = %handle_id, %stream, error = %e, "diagnostic stream read failed");
                    break;
                }
            }
        }
    })
}
