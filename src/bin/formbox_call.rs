//! Diagnostic CLI: spawn a sandbox, invoke one function, print the
//! result as JSON, shut the sandbox down.

use anyhow::Result;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use formbox::{SandboxConfig, SandboxError};

fn print_help() {
    println!(
        "\
formbox-call v{}

Spawn a formula sandbox, invoke one function, print the result.

USAGE:
    formbox-call [OPTIONS] <FUNCTION> [ARGS...]

ARGUMENTS:
    FUNCTION    Name of the remote function to invoke
    ARGS        Arguments, each parsed as JSON (bare words become strings)

OPTIONS:
    -c, --config <PATH>   Load configuration from a TOML file instead of
                          FORMBOX_* environment variables
    -h, --help            Print this help message and exit
    -V, --version         Print version and exit

ENVIRONMENT VARIABLES:
    RUST_LOG                Log level filter for tracing
                            (e.g. debug, formbox=debug,warn)
    FORMBOX_FLAVOR          namespace | wasm | seatbelt | unsandboxed
    FORMBOX_INTERPRETER     Formula interpreter executable
    FORMBOX_SANDBOX_ROOT    Directory tree assigned to the sandbox
    FORMBOX_GRACE_MS        Shutdown grace window in milliseconds
    FORMBOX_WASM_RUNTIME    Wasm host runtime (wasm flavor)
    FORMBOX_WASM_MODULE     Interpreter module (wasm flavor)

EXAMPLES:
    FORMBOX_INTERPRETER=/opt/formula/bin/interp formbox-call uppercase hello
    formbox-call -c formbox.toml echo '{{\"k\": [1, 2, 3]}}'",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("formbox-call v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = args.next();
                if config_path.is_none() {
                    anyhow::bail!("--config needs a path");
                }
            }
            _ => positional.push(arg),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("formbox=info")),
        )
        .init();

    if positional.is_empty() {
        print_help();
        anyhow::bail!("missing FUNCTION argument");
    }
    let function = positional.remove(0);
    // Bare words are convenient on a shell: `uppercase hello` instead of
    // `uppercase '"hello"'`.
    let call_args: Vec<Value> = positional
        .iter()
        .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone())))
        .collect();

    let config = match &config_path {
        Some(path) => SandboxConfig::load(path)?,
        None => SandboxConfig::from_env()?,
    };

    info!(flavor = %config.flavor.kind(), "spawning sandbox");
    let handle = formbox::spawn(config).await?;

    let outcome = handle.invoke(&function, call_args).await;
    handle.shutdown().await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(SandboxError::Remote { message, traceback }) => {
            eprintln!("{traceback}");
            anyhow::bail!("remote execution failed: {message}")
        }
        Err(e) => Err(e.into()),
    }
}
