//! Minimal guest runtime speaking the formbox wire protocol.
//!
//! Stands in for the real formula interpreter in the integration tests
//! and the diagnostic CLI: a blocking loop that reads call frames,
//! dispatches a small set of functions, and writes reply frames. Exits
//! cleanly when the host closes the command pipe.
//!
//! Probe functions report what the surrounding isolation let them do,
//! so isolation tests can compare flavors from outside.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};

use formbox::rpc::protocol::{
    self, Message, Outcome, RemoteFailure, CHANNEL_ENV, CHANNEL_FDS,
};

fn main() -> anyhow::Result<()> {
    // With `--ignore-term` the stub survives SIGTERM, so hosts can
    // exercise their forced-kill path.
    if std::env::args().any(|arg| arg == "--ignore-term") {
        unsafe {
            libc::signal(libc::SIGTERM, libc::SIG_IGN);
        }
    }

    let wiring = std::env::var(CHANNEL_ENV).unwrap_or_default();
    let fd_wiring = wiring == CHANNEL_FDS;
    let (mut reader, mut writer) = open_channel(fd_wiring);

    loop {
        let message = match protocol::read_frame_sync(&mut reader) {
            Ok(Some(message)) => message,
            // Command pipe closed: the host asked us to go.
            Ok(None) => return Ok(()),
            Err(e) => anyhow::bail!("bad frame from host: {e}"),
        };
        let Message::Call { id, function, args } = message else {
            anyhow::bail!("unexpected reply frame from host");
        };

        let outcome = dispatch(&function, &args, fd_wiring);
        let frame =
            protocol::encode(&Message::Reply { id, outcome }).context("encode reply")?;
        writer.write_all(&frame)?;
        writer.flush()?;
    }
}

fn open_channel(fd_wiring: bool) -> (Box<dyn Read>, Box<dyn Write>) {
    if fd_wiring {
        use std::os::fd::FromRawFd;
        // SAFETY: the host dup2'ed the channel onto descriptors 3 and 4
        // before exec and nothing else owns them.
        let reader = unsafe { std::fs::File::from_raw_fd(protocol::COMMAND_FD) };
        let writer = unsafe { std::fs::File::from_raw_fd(protocol::REPLY_FD) };
        (Box::new(reader), Box::new(writer))
    } else {
        (Box::new(std::io::stdin()), Box::new(std::io::stdout()))
    }
}

fn dispatch(function: &str, args: &[Value], stdout_free: bool) -> Outcome {
    match function {
        "echo" => Outcome::Ok(args.first().cloned().unwrap_or(Value::Null)),

        "uppercase" => match args.first().and_then(Value::as_str) {
            Some(s) => Outcome::Ok(Value::String(s.to_uppercase())),
            None => failure("TypeError: uppercase() expects a string"),
        },

        "raise" => {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("formula raised");
            Outcome::Err(RemoteFailure {
                message: format!("FormulaError: {message}"),
                traceback: format!(
                    "Traceback (most recent call last):\n  in formula body\n  in raise()\nFormulaError: {message}"
                ),
            })
        }

        // Emits diagnostic chatter, then succeeds. Stdout carries the
        // channel under stdio wiring, so only use it when it is free.
        "chatter" => {
            if stdout_free {
                println!("stub: chatter on stdout");
                let _ = std::io::stdout().flush();
            }
            eprintln!("stub: chatter on stderr");
            let _ = std::io::stderr().flush();
            Outcome::Ok(Value::Bool(true))
        }

        // Never replies; the host's only way out is to kill us.
        "stall" => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },

        "write_probe" => {
            let Some(path) = args.first().and_then(Value::as_str) else {
                return failure("TypeError: write_probe() expects a path");
            };
            let content = args.get(1).and_then(Value::as_str).unwrap_or("probe");
            match std::fs::write(path, content) {
                Ok(()) => Outcome::Ok(json!({ "written": true })),
                Err(e) => Outcome::Ok(json!({ "written": false, "error": e.to_string() })),
            }
        }

        "read_probe" => {
            let Some(path) = args.first().and_then(Value::as_str) else {
                return failure("TypeError: read_probe() expects a path");
            };
            match std::fs::read_to_string(path) {
                Ok(content) => Outcome::Ok(json!({ "read": true, "content": content })),
                Err(e) => Outcome::Ok(json!({ "read": false, "error": e.to_string() })),
            }
        }

        "socket_probe" => match std::net::TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                Outcome::Ok(json!({ "bound": true, "port": port }))
            }
            Err(e) => Outcome::Ok(json!({ "bound": false, "error": e.to_string() })),
        },

        "spawn_probe" => match std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .status()
        {
            Ok(status) => Outcome::Ok(json!({ "spawned": status.success() })),
            Err(e) => Outcome::Ok(json!({ "spawned": false, "error": e.to_string() })),
        },

        other => failure(&format!("NameError: unknown function '{other}'")),
    }
}

fn failure(message: &str) -> Outcome {
    Outcome::Err(RemoteFailure {
        message: message.to_string(),
        traceback: format!("Traceback (most recent call last):\n  in formula body\n{message}"),
    })
}
