//! Unsandboxed passthrough flavor.
//!
//! Runs the interpreter directly, with no isolation at all. Diagnostic
//! and test use only: the factory never selects it unless the
//! configuration names it explicitly. The reported filesystem view is
//! the standard policy the other flavors enforce — here it is a
//! statement of intent, nothing more.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use super::{spawn_with_conduit_fds, standard_view, Backend, LaunchedRuntime};
use crate::config::{Flavor, SandboxConfig};
use crate::error::{Result, SandboxError};

pub(crate) struct PassthroughBackend;

#[async_trait]
impl Backend for PassthroughBackend {
    fn flavor(&self) -> Flavor {
        Flavor::Unsandboxed
    }

    async fn launch(&self, config: &SandboxConfig) -> Result<LaunchedRuntime> {
        warn!(
            interpreter = %config.interpreter.display(),
            "spawning sandbox WITHOUT isolation (unsandboxed flavor)"
        );

        let scratch = tempfile::tempdir()
            .map_err(|e| SandboxError::Spawn(format!("create scratch dir: {e}")))?;

        let mut command = Command::new(&config.interpreter);
        command
            .args(&config.interpreter_args)
            .current_dir(&config.sandbox_root)
            .env("FORMBOX_SCRATCH", scratch.path())
            .kill_on_drop(true);

        let (mut child, command_pipe, reply_pipe) = spawn_with_conduit_fds(command)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let fs_view = standard_view(
            config,
            scratch.path().to_path_buf(),
            Some(scratch.path().to_path_buf()),
            &[],
        );

        Ok(LaunchedRuntime {
            child,
            command_pipe,
            reply_pipe,
            stdout,
            stderr,
            fs_view,
            scratch: Some(scratch),
        })
    }
}
