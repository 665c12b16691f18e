//! WebAssembly-hosted flavor.
//!
//! The interpreter is compiled to a wasm module and run under a
//! configured wasm host runtime (a wasmtime-style CLI). Capabilities are
//! an explicit allow-list: by default the module gets no filesystem or
//! network access at all, and anything it writes lives in its in-memory
//! world, invisible outside the instance. Extra directories can be
//! preopened read-only through configuration.
//!
//! Host runtimes forward only stdio to the guest, so this flavor carries
//! the channel over stdin/stdout and keeps stderr for diagnostics.

use async_trait::async_trait;
use tokio::process::Command;

use super::{spawn_with_stdio_conduit, Backend, LaunchedRuntime};
use crate::config::{Flavor, FlavorConfig, SandboxConfig};
use crate::error::{Result, SandboxError};
use crate::fsview::{FilesystemView, Mount, MountMode};

pub(crate) struct WasmBackend;

#[async_trait]
impl Backend for WasmBackend {
    fn flavor(&self) -> Flavor {
        Flavor::Wasm
    }

    async fn launch(&self, config: &SandboxConfig) -> Result<LaunchedRuntime> {
        let FlavorConfig::Wasm {
            host_runtime,
            module,
            preopen_read_only,
        } = &config.flavor
        else {
            return Err(SandboxError::Spawn(
                "wasm backend selected with mismatched flavor config".into(),
            ));
        };

        let mut command = Command::new(host_runtime);
        command.arg("run");
        for dir in preopen_read_only {
            command.arg(format!("--dir={}", dir.display()));
        }
        command
            .arg(module)
            .arg("--")
            .args(&config.interpreter_args)
            .current_dir(&config.sandbox_root)
            .kill_on_drop(true);

        let (child, command_pipe, reply_pipe, stderr) = spawn_with_stdio_conduit(command)?;

        let mut mounts: Vec<Mount> = preopen_read_only
            .iter()
            .map(|dir| Mount {
                host_path: Some(dir.clone()),
                sandbox_path: dir.clone(),
                mode: MountMode::ReadOnly,
            })
            .collect();
        // The module's whole world is an in-memory filesystem that dies
        // with the instance.
        mounts.push(Mount {
            host_path: None,
            sandbox_path: "/".into(),
            mode: MountMode::WritableEphemeral,
        });
        let fs_view = FilesystemView::new(config.sandbox_root.clone(), mounts);

        Ok(LaunchedRuntime {
            child,
            command_pipe,
            reply_pipe,
            stdout: None,
            stderr,
            fs_view,
            scratch: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_wasm_view_defaults_to_in_memory_world() {
        // Mirror of the view construction in launch(); the module world
        // must be last so preopens take precedence.
        let preopens = vec![PathBuf::from("/opt/formula/stdlib")];
        let mut mounts: Vec<Mount> = preopens
            .iter()
            .map(|dir| Mount {
                host_path: Some(dir.clone()),
                sandbox_path: dir.clone(),
                mode: MountMode::ReadOnly,
            })
            .collect();
        mounts.push(Mount {
            host_path: None,
            sandbox_path: "/".into(),
            mode: MountMode::WritableEphemeral,
        });
        let view = FilesystemView::new(PathBuf::from("/srv/docs/doc-1"), mounts);

        assert_eq!(
            view.mode_of(std::path::Path::new("/opt/formula/stdlib/core.fml")),
            Some(MountMode::ReadOnly)
        );
        assert_eq!(
            view.mode_of(std::path::Path::new("/anything/else")),
            Some(MountMode::WritableEphemeral)
        );
    }
}
