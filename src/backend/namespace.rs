//! Linux namespace flavor.
//!
//! Isolation is set up by the child itself, between fork and exec, in a
//! fixed order: namespaces, identity maps, mount propagation, read-only
//! binds, tmpfs masking, resource limits. The empty network namespace
//! leaves sockets with nothing to reach; `RLIMIT_NPROC` is the fork
//! budget; the interpreter's code directory is bind-remounted read-only;
//! hidden paths are masked with an empty tmpfs.

use std::path::PathBuf;

use async_trait::async_trait;

use super::Backend;
use crate::config::{Flavor, SandboxConfig};
use crate::error::{Result, SandboxError};

pub(crate) struct NamespaceBackend;

/// The mounts the pre-exec chain will perform, as data. Building the
/// plan is separate from enforcing it so the policy is testable anywhere.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) struct MountPlan {
    /// Bind-remounted read-only onto themselves.
    pub readonly_binds: Vec<PathBuf>,
    /// Masked with a fresh tmpfs (first entry is the scratch area).
    pub tmpfs_targets: Vec<PathBuf>,
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub(crate) fn build_mount_plan(config: &SandboxConfig, hidden_paths: &[PathBuf]) -> MountPlan {
    let mut readonly_binds = Vec::new();
    if let Some(code_dir) = super::interpreter_dir(config) {
        readonly_binds.push(code_dir);
    }
    readonly_binds.push(config.sandbox_root.clone());

    let mut tmpfs_targets = vec![PathBuf::from("/tmp")];
    tmpfs_targets.extend(hidden_paths.iter().cloned());

    MountPlan {
        readonly_binds,
        tmpfs_targets,
    }
}

#[async_trait]
impl Backend for NamespaceBackend {
    fn flavor(&self) -> Flavor {
        Flavor::Namespace
    }

    #[cfg(not(target_os = "linux"))]
    async fn launch(&self, _config: &SandboxConfig) -> Result<super::LaunchedRuntime> {
        Err(SandboxError::Spawn(
            "the namespace flavor requires Linux".into(),
        ))
    }

    #[cfg(target_os = "linux")]
    async fn launch(&self, config: &SandboxConfig) -> Result<super::LaunchedRuntime> {
        use crate::config::FlavorConfig;
        use tokio::process::Command;

        let FlavorConfig::Namespace {
            hidden_paths,
            fork_budget,
        } = &config.flavor
        else {
            return Err(SandboxError::Spawn(
                "namespace backend selected with mismatched flavor config".into(),
            ));
        };

        let plan = build_mount_plan(config, hidden_paths);
        let setup = linux::PreExecSetup::prepare(&plan, *fork_budget)?;

        let mut command = Command::new(&config.interpreter);
        command
            .args(&config.interpreter_args)
            .current_dir(&config.sandbox_root)
            .env("FORMBOX_SCRATCH", "/tmp")
            .kill_on_drop(true);

        // SAFETY: apply() performs only async-signal-safe syscalls
        // (unshare, open/write/close, mount, setrlimit) on data prepared
        // before the fork.
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        let (mut child, command_pipe, reply_pipe) = super::spawn_with_conduit_fds(command)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let fs_view = super::standard_view(config, PathBuf::from("/tmp"), None, hidden_paths);

        Ok(super::LaunchedRuntime {
            child,
            command_pipe,
            reply_pipe,
            stdout,
            stderr,
            fs_view,
            scratch: None,
        })
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::{CStr, CString};
    use std::os::unix::ffi::OsStrExt;

    use super::MountPlan;
    use crate::error::{Result, SandboxError};

    /// Everything the pre-exec chain needs, allocated before the fork.
    pub(super) struct PreExecSetup {
        readonly_binds: Vec<CString>,
        tmpfs_targets: Vec<CString>,
        uid_map: Vec<u8>,
        gid_map: Vec<u8>,
        fork_budget: u64,
    }

    impl PreExecSetup {
        pub fn prepare(plan: &MountPlan, fork_budget: u64) -> Result<Self> {
            let to_cstring = |path: &std::path::PathBuf| {
                CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                    SandboxError::Spawn(format!("path contains NUL: {}", path.display()))
                })
            };

            let uid = unsafe { libc::getuid() };
            let gid = unsafe { libc::getgid() };

            Ok(Self {
                readonly_binds: plan
                    .readonly_binds
                    .iter()
                    .map(to_cstring)
                    .collect::<Result<_>>()?,
                tmpfs_targets: plan
                    .tmpfs_targets
                    .iter()
                    .map(to_cstring)
                    .collect::<Result<_>>()?,
                uid_map: format!("{uid} {uid} 1\n").into_bytes(),
                gid_map: format!("{gid} {gid} 1\n").into_bytes(),
                fork_budget,
            })
        }

        /// Runs in the child between fork and exec. The order is fixed:
        /// namespaces, identity maps, mount propagation, read-only binds,
        /// tmpfs masking, fork budget.
        pub fn apply(&self) -> std::io::Result<()> {
            let flags = libc::CLONE_NEWUSER
                | libc::CLONE_NEWNS
                | libc::CLONE_NEWNET
                | libc::CLONE_NEWIPC;
            if unsafe { libc::unshare(flags) } != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // Single-uid self-map; setgroups must be denied before the
            // gid map becomes writable.
            write_proc(c"/proc/self/setgroups", b"deny")?;
            write_proc(c"/proc/self/gid_map", &self.gid_map)?;
            write_proc(c"/proc/self/uid_map", &self.uid_map)?;

            // Mount changes stay inside this namespace.
            if unsafe {
                libc::mount(
                    std::ptr::null(),
                    c"/".as_ptr(),
                    std::ptr::null(),
                    libc::MS_REC | libc::MS_PRIVATE,
                    std::ptr::null(),
                )
            } != 0
            {
                return Err(std::io::Error::last_os_error());
            }

            for bind in &self.readonly_binds {
                let base = libc::MS_NOSUID | libc::MS_NODEV;
                if unsafe {
                    libc::mount(
                        bind.as_ptr(),
                        bind.as_ptr(),
                        std::ptr::null(),
                        libc::MS_BIND | libc::MS_REC | base,
                        std::ptr::null(),
                    )
                } != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
                if unsafe {
                    libc::mount(
                        std::ptr::null(),
                        bind.as_ptr(),
                        std::ptr::null(),
                        libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | base,
                        std::ptr::null(),
                    )
                } != 0
                {
                    return Err(std::io::Error::last_os_error());
                }
            }

            for target in &self.tmpfs_targets {
                let rc = unsafe {
                    libc::mount(
                        c"tmpfs".as_ptr(),
                        target.as_ptr(),
                        c"tmpfs".as_ptr(),
                        libc::MS_NOSUID | libc::MS_NODEV,
                        std::ptr::null(),
                    )
                };
                if rc != 0 {
                    let err = std::io::Error::last_os_error();
                    // A hidden path that does not exist needs no mask.
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err);
                    }
                }
            }

            let limit = libc::rlimit {
                rlim_cur: self.fork_budget as libc::rlim_t,
                rlim_max: self.fork_budget as libc::rlim_t,
            };
            if unsafe { libc::setrlimit(libc::RLIMIT_NPROC, &limit) } != 0 {
                return Err(std::io::Error::last_os_error());
            }

            Ok(())
        }
    }

    fn write_proc(path: &CStr, data: &[u8]) -> std::io::Result<()> {
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_WRONLY) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let written =
            unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        unsafe { libc::close(fd) };
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if written != data.len() as isize {
            return Err(std::io::Error::other("short write to proc file"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlavorConfig;

    fn config(hidden: Vec<PathBuf>) -> SandboxConfig {
        SandboxConfig {
            interpreter: PathBuf::from("/opt/formula/bin/formula-interp"),
            interpreter_args: vec![],
            sandbox_root: PathBuf::from("/srv/docs/doc-1"),
            shutdown_grace_ms: 2000,
            flavor: FlavorConfig::Namespace {
                hidden_paths: hidden,
                fork_budget: 16,
            },
        }
    }

    #[test]
    fn test_mount_plan_protects_code_dir_and_root() {
        let plan = build_mount_plan(&config(vec![]), &[]);
        assert_eq!(
            plan.readonly_binds,
            vec![
                PathBuf::from("/opt/formula/bin"),
                PathBuf::from("/srv/docs/doc-1"),
            ]
        );
        assert_eq!(plan.tmpfs_targets, vec![PathBuf::from("/tmp")]);
    }

    #[test]
    fn test_mount_plan_masks_hidden_paths_after_scratch() {
        let hidden = vec![PathBuf::from("/home"), PathBuf::from("/root")];
        let plan = build_mount_plan(&config(hidden.clone()), &hidden);
        assert_eq!(plan.tmpfs_targets[0], PathBuf::from("/tmp"));
        assert_eq!(&plan.tmpfs_targets[1..], hidden.as_slice());
    }

    #[test]
    fn test_mount_plan_skips_code_dir_for_bare_command() {
        let mut config = config(vec![]);
        config.interpreter = PathBuf::from("formula-interp");
        let plan = build_mount_plan(&config, &[]);
        assert_eq!(plan.readonly_binds, vec![PathBuf::from("/srv/docs/doc-1")]);
    }
}
