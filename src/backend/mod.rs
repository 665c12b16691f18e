//! Isolation backends.
//!
//! One adapter per flavor behind a single capability trait; a factory
//! picks the adapter from the configuration's flavor tag. Every adapter
//! produces the same bundle: a child process, the channel pipe pair, the
//! diagnostic streams, and the filesystem view it enforces.
//!
//! All flavors must refuse, or render ineffective, the same four
//! operations: writing into the interpreter's code directory, creating
//! usable network sockets, forking past a small fixed budget, and reading
//! outside the assigned sandbox root. The mechanism (and the error text
//! the guest sees) differs per flavor; the observable property does not.

pub(crate) mod namespace;
pub(crate) mod passthrough;
pub(crate) mod seatbelt;
pub(crate) mod wasm;

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::{Flavor, FlavorConfig, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::fsview::{FilesystemView, Mount, MountMode};
use crate::rpc::channel::{PipeReader, PipeWriter};
use crate::rpc::protocol::{CHANNEL_ENV, CHANNEL_FDS, CHANNEL_STDIO, COMMAND_FD, REPLY_FD};

/// Everything a backend hands back for one running sandbox.
pub(crate) struct LaunchedRuntime {
    pub child: Child,
    /// Host-to-sandbox frame pipe (write half).
    pub command_pipe: PipeWriter,
    /// Sandbox-to-host frame pipe (read half).
    pub reply_pipe: PipeReader,
    /// Diagnostic streams; `stdout` is `None` when it carries the channel.
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    pub fs_view: FilesystemView,
    /// Host-backed writable-ephemeral area, deleted when the handle goes.
    pub scratch: Option<tempfile::TempDir>,
}

/// Capability interface every isolation flavor implements.
#[async_trait]
pub(crate) trait Backend: Send + Sync {
    fn flavor(&self) -> Flavor;

    /// Starts the isolated runtime and wires its channel.
    async fn launch(&self, config: &SandboxConfig) -> Result<LaunchedRuntime>;
}

/// Selects the adapter for the configured flavor. The set is closed: no
/// runtime discovery, no process-wide registry.
pub(crate) fn backend_for(config: &SandboxConfig) -> Box<dyn Backend> {
    match &config.flavor {
        FlavorConfig::Namespace { .. } => Box::new(namespace::NamespaceBackend),
        FlavorConfig::Wasm { .. } => Box::new(wasm::WasmBackend),
        FlavorConfig::Seatbelt { .. } => Box::new(seatbelt::SeatbeltBackend),
        FlavorConfig::Unsandboxed => Box::new(passthrough::PassthroughBackend),
    }
}

/// The interpreter's code directory, when the path has one.
pub(crate) fn interpreter_dir(config: &SandboxConfig) -> Option<PathBuf> {
    config
        .interpreter
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
}

/// The mount policy shared by the process-backed flavors: interpreter
/// code and sandbox root read-only, one writable-ephemeral scratch area,
/// everything else hidden. Backends enforce it each in their own way;
/// the passthrough flavor reports it without enforcing anything.
pub(crate) fn standard_view(
    config: &SandboxConfig,
    scratch_sandbox_path: PathBuf,
    scratch_host_path: Option<PathBuf>,
    hidden_paths: &[PathBuf],
) -> FilesystemView {
    let mut mounts = Vec::new();
    if let Some(code_dir) = interpreter_dir(config) {
        mounts.push(Mount {
            host_path: Some(code_dir.clone()),
            sandbox_path: code_dir,
            mode: MountMode::ReadOnly,
        });
    }
    mounts.push(Mount {
        host_path: Some(config.sandbox_root.clone()),
        sandbox_path: config.sandbox_root.clone(),
        mode: MountMode::ReadOnly,
    });
    mounts.push(Mount {
        host_path: scratch_host_path,
        sandbox_path: scratch_sandbox_path,
        mode: MountMode::WritableEphemeral,
    });
    for path in hidden_paths {
        mounts.push(Mount {
            host_path: None,
            sandbox_path: path.clone(),
            mode: MountMode::Hidden,
        });
    }
    FilesystemView::new(config.sandbox_root.clone(), mounts)
}

/// Spawns `command` with the channel on dedicated descriptors 3 and 4,
/// leaving the guest's stdout/stderr free for diagnostics.
pub(crate) fn spawn_with_conduit_fds(
    mut command: Command,
) -> Result<(Child, PipeWriter, PipeReader)> {
    use std::os::fd::AsRawFd;

    // All four ends are made close-on-exec. The child's copies are
    // recreated by dup2 below, which clears the flag on descriptors 3
    // and 4 only, so neither the originals nor the parent ends leak
    // into the guest.
    let (cmd_read, cmd_write) = nix::unistd::pipe()
        .map_err(|e| SandboxError::Spawn(format!("pipe(command): {e}")))?;
    let (reply_read, reply_write) = nix::unistd::pipe()
        .map_err(|e| SandboxError::Spawn(format!("pipe(reply): {e}")))?;
    for fd in [&cmd_read, &cmd_write, &reply_read, &reply_write] {
        set_cloexec(fd.as_raw_fd())?;
    }

    // Keep the child-facing ends clear of the target descriptors so the
    // two dup2 calls cannot clobber each other.
    let cmd_read = raise_fd(cmd_read)?;
    let reply_write = raise_fd(reply_write)?;
    let cmd_read_fd = cmd_read.as_raw_fd();
    let reply_write_fd = reply_write.as_raw_fd();

    command
        .env(CHANNEL_ENV, CHANNEL_FDS)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: dup2 is async-signal-safe and the closure touches nothing
    // else; the source descriptors outlive spawn() in this scope.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(cmd_read_fd, COMMAND_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(reply_write_fd, REPLY_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;

    // The child-facing ends close with this scope; the parent keeps the
    // command write half and the reply read half.
    drop(cmd_read);
    drop(reply_write);

    let writer = tokio::net::unix::pipe::Sender::from_owned_fd(cmd_write)
        .map_err(|e| SandboxError::Spawn(format!("register command pipe: {e}")))?;
    let reader = tokio::net::unix::pipe::Receiver::from_owned_fd(reply_read)
        .map_err(|e| SandboxError::Spawn(format!("register reply pipe: {e}")))?;

    Ok((child, Box::new(writer), Box::new(reader)))
}

fn set_cloexec(fd: i32) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(SandboxError::Spawn(format!(
            "mark pipe close-on-exec: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Moves a pipe end above the target descriptor range so the dup2 pair
/// in `pre_exec` cannot clobber a not-yet-installed end.
fn raise_fd(fd: std::os::fd::OwnedFd) -> Result<std::os::fd::OwnedFd> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    if fd.as_raw_fd() > REPLY_FD {
        return Ok(fd);
    }
    let raised = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 10) };
    if raised < 0 {
        return Err(SandboxError::Spawn(format!(
            "raise pipe fd: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { OwnedFd::from_raw_fd(raised) })
}

/// Spawns `command` with the channel on stdin/stdout, for hosts that do
/// not forward extra descriptors (the wasm flavor). Only stderr remains
/// as a diagnostic stream.
pub(crate) fn spawn_with_stdio_conduit(
    mut command: Command,
) -> Result<(Child, PipeWriter, PipeReader, Option<ChildStderr>)> {
    command
        .env(CHANNEL_ENV, CHANNEL_STDIO)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| SandboxError::Spawn("child stdin was not piped".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandboxError::Spawn("child stdout was not piped".into()))?;
    let stderr = child.stderr.take();

    Ok((child, Box::new(stdin), Box::new(stdout), stderr))
}
