//! Filesystem view — which host paths a sandbox can see, and how.
//!
//! Built once by the backend at spawn time and immutable afterwards.
//! This is bookkeeping only: enforcement is the backend's business
//! (mount namespaces, Seatbelt profile, wasm capabilities). Callers read
//! the view for diagnostics.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// How a mounted path behaves inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    /// Visible, not writable.
    ReadOnly,
    /// Writable, discarded when the sandbox exits.
    WritableEphemeral,
    /// Not visible at all.
    Hidden,
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::ReadOnly => write!(f, "read-only"),
            MountMode::WritableEphemeral => write!(f, "writable-ephemeral"),
            MountMode::Hidden => write!(f, "hidden"),
        }
    }
}

/// One entry in the sandbox's mount table.
#[derive(Debug, Clone, Serialize)]
pub struct Mount {
    /// Backing host path, when the mount is host-backed. `None` for
    /// synthetic mounts (tmpfs scratch, in-memory wasm world).
    pub host_path: Option<PathBuf>,
    /// Where the sandbox sees it.
    pub sandbox_path: PathBuf,
    pub mode: MountMode,
}

/// The complete, ordered mount policy of one sandbox instance.
///
/// Order matters: `mode_of` answers with the first matching entry, so
/// backends list specific mounts before catch-alls.
#[derive(Debug, Clone, Serialize)]
pub struct FilesystemView {
    sandbox_root: PathBuf,
    mounts: Vec<Mount>,
}

impl FilesystemView {
    pub(crate) fn new(sandbox_root: PathBuf, mounts: Vec<Mount>) -> Self {
        Self {
            sandbox_root,
            mounts,
        }
    }

    /// The directory tree assigned to the sandbox.
    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// The mode governing `sandbox_path`, if any mount covers it.
    pub fn mode_of(&self, sandbox_path: &Path) -> Option<MountMode> {
        self.mounts
            .iter()
            .find(|m| sandbox_path.starts_with(&m.sandbox_path))
            .map(|m| m.mode)
    }
}

impl fmt::Display for FilesystemView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sandbox root: {}", self.sandbox_root.display())?;
        for mount in &self.mounts {
            match &mount.host_path {
                Some(host) => writeln!(
                    f,
                    "  {} -> {} ({})",
                    host.display(),
                    mount.sandbox_path.display(),
                    mount.mode
                )?,
                None => writeln!(f, "  {} ({})", mount.sandbox_path.display(), mount.mode)?,
            }
        }
        Ok(())
    }
}
