//! macOS Seatbelt flavor.
//!
//! Generates a deny-default SBPL profile and runs the interpreter under
//! `sandbox-exec -p`. The profile denies writes everywhere except the
//! scratch area, denies the network outright, and limits reads to the
//! system libraries, the interpreter's code directory and the sandbox
//! root. The fork budget is enforced with `RLIMIT_NPROC`, which Seatbelt
//! itself cannot express.
//!
//! Profile generation is pure string building and unit-tested on every
//! platform; only the spawn path is macOS-specific.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::Backend;
use crate::config::{Flavor, SandboxConfig};
use crate::error::{Result, SandboxError};

pub(crate) struct SeatbeltBackend;

/// Builds the SBPL profile text for one sandbox instance.
///
/// Deny-default whitelist: every section below adds back the minimum a
/// formula interpreter needs to start and run.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub(crate) fn generate_profile(
    config: &SandboxConfig,
    scratch: &Path,
    extra_read_only: &[PathBuf],
) -> String {
    let mut profile = String::with_capacity(2048);

    profile.push_str("(version 1)\n");
    profile.push_str("(deny default)\n\n");

    profile.push_str("; --- process basics ---\n");
    profile.push_str("(allow process-exec)\n");
    profile.push_str("(allow process-fork)\n");
    profile.push_str("(allow signal (target same-sandbox))\n");
    profile.push_str("(allow sysctl-read)\n\n");

    profile.push_str("; --- system libraries (dyld, libSystem) ---\n");
    profile.push_str(
        "(allow file-read*\n  \
         (subpath \"/usr/lib\")\n  \
         (subpath \"/System/Library\")\n  \
         (literal \"/\")\n  \
         (literal \"/dev/null\")\n  \
         (literal \"/dev/random\")\n  \
         (literal \"/dev/urandom\"))\n",
    );
    profile.push_str(
        "(allow file-map-executable\n  \
         (subpath \"/usr/lib\")\n  \
         (subpath \"/System/Library\"))\n\n",
    );

    profile.push_str("; --- interpreter code (read-only) ---\n");
    if let Some(code_dir) = super::interpreter_dir(config) {
        profile.push_str(&format!(
            "(allow file-read* file-map-executable (subpath \"{}\"))\n",
            code_dir.display()
        ));
    }

    profile.push_str("\n; --- sandbox root (read-only) ---\n");
    profile.push_str(&format!(
        "(allow file-read* (subpath \"{}\"))\n",
        config.sandbox_root.display()
    ));

    for path in extra_read_only {
        profile.push_str(&format!(
            "(allow file-read* (subpath \"{}\"))\n",
            path.display()
        ));
    }

    profile.push_str("\n; --- scratch (the only writable area) ---\n");
    profile.push_str(&format!(
        "(allow file-read* file-write* (subpath \"{}\"))\n",
        scratch.display()
    ));

    profile.push_str("\n; --- /dev/null writes for stdio plumbing ---\n");
    profile.push_str(
        "(allow file-write-data\n  \
         (require-all (literal \"/dev/null\") (vnode-type CHARACTER-DEVICE)))\n",
    );

    profile.push_str("\n; --- network: denied (no allow rules) ---\n");

    profile
}

#[async_trait]
impl Backend for SeatbeltBackend {
    fn flavor(&self) -> Flavor {
        Flavor::Seatbelt
    }

    #[cfg(not(target_os = "macos"))]
    async fn launch(&self, _config: &SandboxConfig) -> Result<super::LaunchedRuntime> {
        Err(SandboxError::Spawn(
            "the seatbelt flavor requires macOS".into(),
        ))
    }

    #[cfg(target_os = "macos")]
    async fn launch(&self, config: &SandboxConfig) -> Result<super::LaunchedRuntime> {
        use crate::config::FlavorConfig;
        use tokio::process::Command;

        let FlavorConfig::Seatbelt {
            extra_read_only,
            fork_budget,
        } = &config.flavor
        else {
            return Err(SandboxError::Spawn(
                "seatbelt backend selected with mismatched flavor config".into(),
            ));
        };

        let scratch = tempfile::tempdir()
            .map_err(|e| SandboxError::Spawn(format!("create scratch dir: {e}")))?;
        let profile = generate_profile(config, scratch.path(), extra_read_only);

        let mut command = Command::new("sandbox-exec");
        command
            .arg("-p")
            .arg(&profile)
            .arg("--")
            .arg(&config.interpreter)
            .args(&config.interpreter_args)
            .current_dir(&config.sandbox_root)
            .env("FORMBOX_SCRATCH", scratch.path())
            .kill_on_drop(true);

        let budget = *fork_budget as libc::rlim_t;
        // SAFETY: setrlimit is async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                let limit = libc::rlimit {
                    rlim_cur: budget,
                    rlim_max: budget,
                };
                if libc::setrlimit(libc::RLIMIT_NPROC, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let (mut child, command_pipe, reply_pipe) = super::spawn_with_conduit_fds(command)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let fs_view = super::standard_view(
            config,
            scratch.path().to_path_buf(),
            Some(scratch.path().to_path_buf()),
            &[],
        );

        Ok(super::LaunchedRuntime {
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
