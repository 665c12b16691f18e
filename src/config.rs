use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// Default shutdown grace window before the process is force-killed.
const DEFAULT_GRACE_MS: u64 = 2000;

/// Default number of processes the sandboxed runtime may hold at once
/// (the interpreter itself counts against it).
const DEFAULT_FORK_BUDGET: u64 = 16;

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    /// Formula interpreter executable (the isolated runtime).
    pub interpreter: PathBuf,
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// The directory tree assigned to the sandbox. Nothing outside it
    /// should become readable from inside.
    pub sandbox_root: PathBuf,
    /// How long `shutdown` waits for a graceful exit before killing.
    #[serde(default = "default_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(flatten)]
    pub flavor: FlavorConfig,
}

/// Isolation backend selection plus flavor-specific overrides.
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum FlavorConfig {
    /// Linux user/mount/net namespaces with a read-only code directory
    /// and a tmpfs scratch area.
    Namespace {
        /// Host paths masked with an empty tmpfs inside the sandbox.
        #[serde(default = "default_hidden_paths")]
        hidden_paths: Vec<PathBuf>,
        #[serde(default = "default_fork_budget")]
        fork_budget: u64,
    },
    /// Interpreter compiled to WebAssembly, run under a wasm host runtime
    /// with no filesystem capability beyond an explicit allow-list.
    Wasm {
        /// The wasm host runtime executable (e.g. a wasmtime binary).
        host_runtime: PathBuf,
        /// The interpreter module to run.
        module: PathBuf,
        /// Directories preopened read-only for the module.
        #[serde(default)]
        preopen_read_only: Vec<PathBuf>,
    },
    /// macOS Seatbelt profile via sandbox-exec.
    Seatbelt {
        /// Extra read-only paths beyond the interpreter and sandbox root.
        #[serde(default)]
        extra_read_only: Vec<PathBuf>,
        #[serde(default = "default_fork_budget")]
        fork_budget: u64,
    },
    /// No isolation at all. Diagnostic and test use only — never chosen
    /// by default, only by explicit configuration.
    Unsandboxed,
}

/// The closed set of isolation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Namespace,
    Wasm,
    Seatbelt,
    Unsandboxed,
}

impl Flavor {
    pub fn as_str(self) -> &'static str {
        match self {
            Flavor::Namespace => "namespace",
            Flavor::Wasm => "wasm",
            Flavor::Seatbelt => "seatbelt",
            Flavor::Unsandboxed => "unsandboxed",
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}

fn default_fork_budget() -> u64 {
    DEFAULT_FORK_BUDGET
}

/// User-data trees masked by default under the namespace flavor.
fn default_hidden_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/home"), PathBuf::from("/root")]
}

impl FlavorConfig {
    pub fn kind(&self) -> Flavor {
        match self {
            FlavorConfig::Namespace { .. } => Flavor::Namespace,
            FlavorConfig::Wasm { .. } => Flavor::Wasm,
            FlavorConfig::Seatbelt { .. } => Flavor::Seatbelt,
            FlavorConfig::Unsandboxed => Flavor::Unsandboxed,
        }
    }

    /// The flavor used when none is named: the strongest isolation the
    /// platform offers. The unsandboxed flavor is never inferred.
    fn platform_default() -> anyhow::Result<Self> {
        if cfg!(target_os = "linux") {
            Ok(FlavorConfig::Namespace {
                hidden_paths: default_hidden_paths(),
                fork_budget: DEFAULT_FORK_BUDGET,
            })
        } else if cfg!(target_os = "macos") {
            Ok(FlavorConfig::Seatbelt {
                extra_read_only: Vec::new(),
                fork_budget: DEFAULT_FORK_BUDGET,
            })
        } else {
            anyhow::bail!(
                "no default sandbox flavor on this platform; set FORMBOX_FLAVOR explicitly"
            )
        }
    }
}

impl SandboxConfig {
    /// Loads configuration from a TOML file.
    /// Environment variables like `${FORMBOX_INTERPRETER}` are expanded.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = shellexpand::env(&content)?;
        let config: SandboxConfig = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// Builds a configuration from `FORMBOX_*` environment variables,
    /// consumed once at spawn time.
    ///
    /// - `FORMBOX_FLAVOR`: namespace | wasm | seatbelt | unsandboxed
    ///   (defaults to the platform's strongest flavor, never unsandboxed)
    /// - `FORMBOX_INTERPRETER`: interpreter executable (required except
    ///   for the wasm flavor)
    /// - `FORMBOX_SANDBOX_ROOT`: assigned directory tree (default ".")
    /// - `FORMBOX_GRACE_MS`: shutdown grace window
    /// - `FORMBOX_WASM_RUNTIME` / `FORMBOX_WASM_MODULE`: wasm flavor paths
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        let flavor = match std::env::var("FORMBOX_FLAVOR") {
            Ok(name) => match name.as_str() {
                "namespace" => FlavorConfig::Namespace {
                    hidden_paths: default_hidden_paths(),
                    fork_budget: DEFAULT_FORK_BUDGET,
                },
                "wasm" => FlavorConfig::Wasm {
                    host_runtime: std::env::var("FORMBOX_WASM_RUNTIME")
                        .context("FORMBOX_WASM_RUNTIME is not set")?
                        .into(),
                    module: std::env::var("FORMBOX_WASM_MODULE")
                        .context("FORMBOX_WASM_MODULE is not set")?
                        .into(),
                    preopen_read_only: Vec::new(),
                },
                "seatbelt" => FlavorConfig::Seatbelt {
                    extra_read_only: Vec::new(),
                    fork_budget: DEFAULT_FORK_BUDGET,
                },
                "unsandboxed" => FlavorConfig::Unsandboxed,
                other => anyhow::bail!("unknown sandbox flavor: {other}"),
            },
            Err(_) => FlavorConfig::platform_default()?,
        };

        let interpreter: PathBuf = match &flavor {
            // The wasm flavor runs the module, not a host executable; an
            // interpreter path is accepted but unused.
            FlavorConfig::Wasm { module, .. } => std::env::var("FORMBOX_INTERPRETER")
                .map(PathBuf::from)
                .unwrap_or_else(|_| module.clone()),
            _ => std::env::var("FORMBOX_INTERPRETER")
                .context("FORMBOX_INTERPRETER is not set")?
                .into(),
        };

        let sandbox_root = std::env::var("FORMBOX_SANDBOX_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let shutdown_grace_ms = match std::env::var("FORMBOX_GRACE_MS") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("invalid FORMBOX_GRACE_MS: {value}"))?,
            Err(_) => DEFAULT_GRACE_MS,
        };

        Ok(SandboxConfig {
            interpreter,
            interpreter_args: Vec::new(),
            sandbox_root,
            shutdown_grace_ms,
            flavor,
        })
    }
}
