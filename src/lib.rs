//! formbox: sandboxed execution host for untrusted formula code.
//!
//! A host application hands this crate a function name and
//! JSON-serializable arguments; the crate runs them inside an isolated
//! interpreter process and returns the result or a structured failure.
//!
//! # Architecture
//!
//! - [`config`]: flavor selection and per-flavor settings, from TOML or
//!   `FORMBOX_*` environment variables, consumed once at spawn.
//! - [`rpc`]: the wire protocol (length-prefixed JSON frames), the
//!   framed pipe channel, and the call dispatcher that correlates
//!   replies to pending calls.
//! - `backend`: one adapter per isolation flavor — Linux namespaces,
//!   WebAssembly host runtime, macOS Seatbelt, and an explicit-only
//!   unsandboxed passthrough — all satisfying the same contract.
//! - [`handle`]: [`SandboxHandle`] and its lifecycle, including the
//!   graceful-then-forced shutdown state machine.
//! - [`fsview`]: the immutable mount policy a handle reports for
//!   diagnostics.
//!
//! # Example
//!
//! ```ignore
//! let config = SandboxConfig::load("config/formbox.toml")?;
//! let handle = formbox::spawn(config).await?;
//! let result = handle.invoke("uppercase", vec![json!("hello")]).await?;
//! assert_eq!(result, json!("HELLO"));
//! handle.shutdown().await;
//! ```
//!
//! Unix only (Linux and macOS): the channel runs over pipe pairs and the
//! isolation backends are built on kernel facilities of both systems.

pub mod config;
pub mod error;
pub mod fsview;
pub mod handle;
pub mod output;
pub mod rpc;

mod backend;

pub use config::{Flavor, FlavorConfig, SandboxConfig};
pub use error::{PipeSide, Result, SandboxError};
pub use fsview::{FilesystemView, Mount, MountMode};
pub use handle::{spawn, HandleState, SandboxHandle};
