//! Call correlation: pending-call table, reply demultiplexing, closure
//! draining.
//!
//! Every in-flight call is an entry in an arena keyed by its id, holding
//! a single-assignment completion slot. A reply resolves its entry by id
//! (arrival order does not matter). The first channel fault — either pipe
//! closing, or a protocol violation — is recorded, drains every pending
//! entry, and fails all future calls without touching the pipe again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::channel::{Channel, PipeReader};
use super::protocol::{self, FrameError, Message, Outcome, RemoteFailure};
use crate::error::{PipeSide, Result, SandboxError};
use crate::output::DiagTail;

/// Why the handle stopped accepting calls.
#[derive(Debug, Clone)]
pub(crate) enum Fault {
    Closed(PipeSide),
    Protocol(String),
}

impl Fault {
    fn to_error(&self) -> SandboxError {
        match self {
            Fault::Closed(side) => SandboxError::ChannelClosed { side: *side },
            Fault::Protocol(detail) => SandboxError::Protocol(detail.clone()),
        }
    }
}

struct PendingTable {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    /// First fault wins; set exactly once, together with the drain.
    fault: Option<Fault>,
}

pub(crate) struct Dispatcher {
    channel: Arc<Channel>,
    table: Arc<Mutex<PendingTable>>,
    diag: Arc<DiagTail>,
    handle_id: Uuid,
}

impl Dispatcher {
    pub fn new(channel: Arc<Channel>, diag: Arc<DiagTail>, handle_id: Uuid) -> Self {
        Self {
            channel,
            table: Arc::new(Mutex::new(PendingTable {
                next_id: 1,
                pending: HashMap::new(),
                fault: None,
            })),
            diag,
            handle_id,
        }
    }

    /// Sends a call and waits for its reply. Safe to drive from any
    /// number of tasks; replies match by id, not by issue order.
    pub async fn invoke(&self, function: &str, args: Vec<Value>) -> Result<Value> {
        let (id, rx) = {
            let mut table = self.table.lock().unwrap();
            if let Some(fault) = &table.fault {
                return Err(fault.to_error());
            }
            let id = table.next_id;
            table.next_id += 1;
            let (tx, rx) = oneshot::channel();
            table.pending.insert(id, tx);
            (id, rx)
        };

        let message = Message::Call {
            id,
            function: function.to_string(),
            args,
        };
        if self.channel.send(&message).await.is_err() {
            poison(&self.table, self.handle_id, Fault::Closed(PipeSide::ToSandbox));
            return Err(self.closed_error());
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Sender dropped by the drain: report the recorded fault.
            Err(_) => Err(self.closed_error()),
        }
    }

    /// The error that poisoned this handle, or the write-side closure if
    /// none was recorded (used for fail-fast after shutdown).
    pub fn closed_error(&self) -> SandboxError {
        let table = self.table.lock().unwrap();
        table
            .fault
            .as_ref()
            .map(Fault::to_error)
            .unwrap_or(SandboxError::ChannelClosed {
                side: PipeSide::ToSandbox,
            })
    }

    /// Records a fault and drains every pending call.
    pub fn poison(&self, fault: Fault) {
        poison(&self.table, self.handle_id, fault);
    }

    /// Spawns the reply pump: reads frames off the reply pipe until the
    /// stream ends or the protocol is violated.
    pub fn spawn_pump(&self, mut reader: PipeReader) -> JoinHandle<()> {
        let table = self.table.clone();
        let diag = self.diag.clone();
        let handle_id = self.handle_id;

        tokio::spawn(async move {
            loop {
                match protocol::read_frame(&mut reader).await {
                    Ok(Some(Message::Reply { id, outcome })) => {
                        let (entry, already_faulted) = {
                            let mut table = table.lock().unwrap();
                            (table.pending.remove(&id), table.fault.is_some())
                        };
                        match entry {
                            Some(tx) => {
                                let result = match outcome {
                                    Outcome::Ok(value) => Ok(value),
                                    Outcome::Err(failure) => Err(remote_error(failure, &diag)),
                                };
                                if tx.send(result).is_err() {
                                    debug!(
                                        handle = %handle_id,
                                        call = id,
                                        "reply receiver dropped before delivery"
                                    );
                                }
                            }
                            None => {
                                // After a drain, a reply to an already
                                // rejected call is expected noise, not a
                                // protocol violation.
                                if already_faulted {
                                    debug!(handle = %handle_id, call = id, "reply for a drained call");
                                    break;
                                }
                                error!(handle = %handle_id, call = id, "reply references unknown call id");
                                poison(
                                    &table,
                                    handle_id,
                                    Fault::Protocol(format!(
                                        "reply references unknown call id {id}"
                                    )),
                                );
                                break;
                            }
                        }
                    }
                    Ok(Some(Message::Call { id, .. })) => {
                        error!(handle = %handle_id, call = id, "unexpected call frame from sandbox");
                        poison(
                            &table,
                            handle_id,
                            Fault::Protocol("unexpected call frame from sandbox".into()),
                        );
                        break;
                    }
                    Ok(None) => {
                        debug!(handle = %handle_id, "reply pipe reached end of stream");
                        poison(&table, handle_id, Fault::Closed(PipeSide::FromSandbox));
                        break;
                    }
                    Err(FrameError::Malformed(detail)) => {
                        error!(handle = %handle_id, %detail, "malformed frame from sandbox");
                        poison(&table, handle_id, Fault::Protocol(detail));
                        break;
                    }
                    Err(FrameError::Io(e)) => {
                        warn!(handle = %handle_id, error = %e, "reply pipe read failed");
                        poison(&table, handle_id, Fault::Closed(PipeSide::FromSandbox));
                        break;
                    }
                }
            }
        })
    }
}

/// Builds the caller-facing remote failure, appending any diagnostic
/// output captured since the last error.
fn remote_error(failure: RemoteFailure, diag: &DiagTail) -> SandboxError {
    let mut traceback = failure.traceback;
    let tail = diag.take();
    if !tail.is_empty() {
        traceback.push_str("\n--- captured sandbox output ---\n");
        traceback.push_str(&tail);
    }
    SandboxError::Remote {
        message: failure.message,
        traceback,
    }
}

fn poison(table: &Mutex<PendingTable>, handle_id: Uuid, fault: Fault) {
    let drained = {
        let mut table = table.lock().unwrap();
        if table.fault.is_none() {
            table.fault = Some(fault);
        }
        // Dropping the senders resolves every waiter with the fault.
        table.pending.drain().count()
    };
    if drained > 0 {
        debug!(handle = %handle_id, drained, "drained pending calls after channel fault");
    }
}
