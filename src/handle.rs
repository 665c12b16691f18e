//! The sandbox handle: one isolated runtime, its channel, and its
//! lifecycle.
//!
//! `spawn` wires a backend's launched process to the dispatcher and the
//! diagnostic capture tasks. `shutdown` drives the state machine
//! Ready -> ShuttingDown -> Exited: graceful-exit request first (command
//! pipe EOF plus SIGTERM), one bounded wait, then SIGKILL. It is
//! idempotent — every caller resolves once the handle is Exited — and a
//! call outstanding at the moment of a forced kill fails exactly like a
//! spontaneous crash.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Child;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend;
use crate::config::{Flavor, SandboxConfig};
use crate::error::{PipeSide, Result};
use crate::fsview::FilesystemView;
use crate::output::{self, DiagStream, DiagTail};
use crate::rpc::channel::Channel;
use crate::rpc::dispatch::{Dispatcher, Fault};

/// Lifecycle of one sandbox instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Starting,
    Ready,
    ShuttingDown,
    Exited,
}

/// One running isolated runtime, exclusively owned by its creator.
/// Methods take `&self` and are safe to drive from any number of tasks.
pub struct SandboxHandle {
    id: Uuid,
    flavor: Flavor,
    fs_view: FilesystemView,
    channel: Arc<Channel>,
    dispatcher: Dispatcher,
    state_tx: watch::Sender<HandleState>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    grace: Duration,
    _scratch: Option<tempfile::TempDir>,
}

/// Starts an isolated runtime under the configured flavor and returns
/// the live handle. The configuration is consumed once, here; there is
/// no process-wide backend registry.
pub async fn spawn(config: SandboxConfig) -> Result<SandboxHandle> {
    let id = Uuid::new_v4();
    let flavor = config.flavor.kind();
    let (state_tx, _) = watch::channel(HandleState::Starting);

    info!(
        handle = %id,
        %flavor,
        interpreter = %config.interpreter.display(),
        root = %config.sandbox_root.display(),
        "spawning sandbox"
    );

    let backend = backend::backend_for(&config);
    let mut launched = backend.launch(&config).await?;
    let pid = launched.child.id();

    let diag = Arc::new(DiagTail::new());
    if let Some(stdout) = launched.stdout.take() {
        output::capture(stdout, DiagStream::Stdout, id, diag.clone());
    }
    if let Some(stderr) = launched.stderr.take() {
        output::capture(stderr, DiagStream::Stderr, id, diag.clone());
    }

    let channel = Arc::new(Channel::new(launched.command_pipe));
    let dispatcher = Dispatcher::new(channel.clone(), diag, id);
    dispatcher.spawn_pump(launched.reply_pipe);

    state_tx.send_replace(HandleState::Ready);
    info!(handle = %id, pid = ?pid, "sandbox ready");

    Ok(SandboxHandle {
        id,
        flavor,
        fs_view: launched.fs_view,
        channel,
        dispatcher,
        state_tx,
        child: Mutex::new(Some(launched.child)),
        pid,
        grace: Duration::from_millis(config.shutdown_grace_ms),
        _scratch: launched.scratch,
    })
}

impl SandboxHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// The mount policy this handle's backend enforces. Immutable.
    pub fn fs_view(&self) -> &FilesystemView {
        &self.fs_view
    }

    pub fn state(&self) -> HandleState {
        *self.state_tx.borrow()
    }

    /// OS pid of the isolated runtime, for diagnostics.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Runs a named function inside the isolated runtime and waits for
    /// its result. Remote errors are recoverable; a closed channel is
    /// final and every later call fails the same way, without a write.
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        if self.state() != HandleState::Ready {
            return Err(self.dispatcher.closed_error());
        }
        self.dispatcher.invoke(function, args).await
    }

    /// Terminates the isolated runtime. Never fails, always resolves
    /// once the process has exited or been killed; concurrent and
    /// repeated calls all converge on the same Exited state.
    pub async fn shutdown(&self) {
        let owner = self.state_tx.send_if_modified(|state| {
            if *state == HandleState::Ready {
                *state = HandleState::ShuttingDown;
                true
            } else {
                false
            }
        });

        if !owner {
            // Another caller runs (or ran) the terminate sequence.
            let mut rx = self.state_tx.subscribe();
            while *rx.borrow_and_update() != HandleState::Exited {
                if rx.changed().await.is_err() {
                    break;
                }
            }
            return;
        }

        debug!(handle = %self.id, "shutting down sandbox");

        // Calls outstanding now are rejected with the write-side closure
        // — the same failure a spontaneous crash produces — and no
        // further write is attempted.
        self.dispatcher
            .poison(Fault::Closed(PipeSide::ToSandbox));

        // Graceful-exit request: EOF on the command pipe, then SIGTERM
        // for guests stuck outside their read loop.
        self.channel.close().await;
        let mut child = self.child.lock().await.take();

        if let Some(child) = child.as_mut() {
            if let Some(pid) = child.id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }

            // The single owned timer for this handle; dropped (cancelled)
            // the moment the child exits on its own.
            match tokio::time::timeout(self.grace, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(handle = %self.id, %status, "sandbox exited gracefully")
                }
                Ok(Err(e)) => {
                    warn!(handle = %self.id, error = %e, "wait on sandbox process failed")
                }
                Err(_) => {
                    warn!(
                        handle = %self.id,
                        grace_ms = self.grace.as_millis() as u64,
                        "sandbox did not exit within the grace window, killing"
                    );
                    // From the caller's point of view this is the same as
                    // a crash: pending calls get the closed-channel
                    // failure, not a timeout-specific error.
                    if let Err(e) = child.kill().await {
                        warn!(handle = %self.id, error = %e, "kill failed");
                    }
                }
            }
        }

        self.state_tx.send_replace(HandleState::Exited);
        info!(handle = %self.id, "sandbox handle exited");
    }
}

impl std::fmt::Debug for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHandle")
            .field("id", &self.id)
            .field("flavor", &self.flavor)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;

    // Process-backed behavior is covered by the integration suite in
    // tests/sandbox.rs.

    #[tokio::test]
    async fn test_spawn_failure_produces_no_handle() {
        let config = SandboxConfig {
            interpreter: "/nonexistent/formula-interp".into(),
            interpreter_args: vec![],
            sandbox_root: std::env::temp_dir(),
            shutdown_grace_ms: 100,
            flavor: crate::config::FlavorConfig::Unsandboxed,
        };
        match spawn(config).await {
            Err(SandboxError::Spawn(_)) => {}
            other => panic!("expected spawn failure, got {other:?}"),
        }
    }
}
