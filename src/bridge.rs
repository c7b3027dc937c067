//! Messaging-interface boundary between clients and the protocol engine.
//!
//! Requests arrive as JSON text `{"type": <command name>, ...fields}` and are encoded through
//! the [`CommandRegistry`] before being enqueued. Engine events leave as JSON text
//! `{"event": <kind>, ...}` broadcast to every registered client. The socket or HTTP server that
//! carries this text is left to the embedding application.

use crate::base::{Error, EventSink, Result};
use crate::engine::{DiagnosticKind, EngineEvent, ProtocolEngine};
use crate::registry::CommandRegistry;
use crate::utils::{cmd_label, to_hex};
use log::{debug, trace, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

/// Identifies one registered client.
pub type ClientId = u64;

/// The set of connected clients. Owned by the bridge side and handed to the engine as its
/// [`EventSink`]; the engine never learns how many clients there are.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<(ClientId, Sender<String>)>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> ClientRegistry {
        ClientRegistry::default()
    }

    /// Adds a client; every later event arrives on the returned receiver as JSON text.
    pub fn register(&self) -> (ClientId, Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = channel();
        self.lock().push((id, tx));
        debug!("Client {} registered", id);
        (id, rx)
    }

    pub fn unregister(&self, id: ClientId) {
        self.lock().retain(|(client, _)| *client != id);
        debug!("Client {} unregistered", id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends `message` to every client, dropping clients whose receiver is gone.
    pub fn broadcast(&self, message: &Value) {
        let text = message.to_string();
        trace!("Broadcast: {}", text);
        self.lock().retain(|(id, tx)| {
            let alive = tx.send(text.clone()).is_ok();
            if !alive {
                debug!("Client {} disconnected, removing", id);
            }
            alive
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ClientId, Sender<String>)>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EventSink for ClientRegistry {
    fn on_event(&self, event: EngineEvent) {
        self.broadcast(&event_to_json(&event));
    }
}

/// Turns client requests into enqueued commands.
#[derive(Debug)]
pub struct Bridge {
    engine: Arc<ProtocolEngine>,
    clients: Arc<ClientRegistry>,
    registry: &'static CommandRegistry,
}

impl Bridge {
    pub fn new(engine: Arc<ProtocolEngine>, clients: Arc<ClientRegistry>) -> Bridge {
        Bridge {
            engine,
            clients,
            registry: CommandRegistry::global(),
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Handles one JSON request and returns the sequence number it was queued under.
    ///
    /// Every rejection is also broadcast as an `error` event.
    pub fn handle_message(&self, text: &str) -> Result<u8> {
        debug!("Request received: {:?}", text);
        self.submit(text).inspect_err(|err| {
            warn!("Request rejected: {}", err);
            self.clients
                .broadcast(&json!({"event": "error", "error": err.to_string()}));
        })
    }

    fn submit(&self, text: &str) -> Result<u8> {
        let request: Value = serde_json::from_str(text)
            .map_err(|e| Error::InvalidRequest(format!("invalid JSON: {}", e)))?;
        let Value::Object(fields) = request else {
            return Err(Error::InvalidRequest("expected a JSON object".to_owned()));
        };
        let name = match fields.get("type") {
            Some(Value::String(name)) if !name.is_empty() => name.as_str(),
            _ => return Err(Error::InvalidRequest("missing 'type'".to_owned())),
        };

        let command = self.registry.encode(name, &fields)?;
        self.engine
            .enqueue(command.id, command.payload, command.description)
    }
}

/// JSON rendering of an engine event for clients.
pub fn event_to_json(event: &EngineEvent) -> Value {
    match event {
        EngineEvent::Queued {
            cmd,
            seq,
            description,
        } => json!({
            "event": "command_queued",
            "cmd": cmd_label(*cmd),
            "comm_no": seq,
            "description": description,
        }),
        EngineEvent::Sent {
            cmd,
            seq,
            attempt,
            raw,
            description,
        } => json!({
            "event": "command_sent",
            "direction": "TX",
            "cmd": cmd_label(*cmd),
            "comm_no": seq,
            "retries": attempt,
            "raw": to_hex(raw),
            "description": description,
        }),
        EngineEvent::Acknowledged {
            cmd,
            seq,
            description,
        } => json!({
            "event": "vmc_ack",
            "cmd": cmd_label(*cmd),
            "comm_no": seq,
            "description": description,
        }),
        EngineEvent::Data { cmd, raw, event } => {
            let mut value = serde_json::to_value(event).unwrap_or_else(|e| {
                json!({"event": "error", "error": format!("cannot render event: {}", e)})
            });
            if let Value::Object(map) = &mut value {
                map.insert("cmd".to_owned(), Value::from(cmd_label(*cmd)));
                map.insert("raw".to_owned(), Value::from(to_hex(raw)));
            }
            value
        }
        EngineEvent::Finished {
            cmd,
            seq,
            description,
        } => json!({
            "event": "command_finished",
            "cmd": cmd_label(*cmd),
            "comm_no": seq,
            "description": description,
        }),
        EngineEvent::TimedOut {
            cmd,
            seq,
            attempts,
            description,
        } => json!({
            "event": "command_timeout",
            "cmd": cmd_label(*cmd),
            "comm_no": seq,
            "retries": attempts,
            "description": description,
        }),
        EngineEvent::Diagnostic { kind, message } => json!({
            "event": "log",
            "kind": diagnostic_label(*kind),
            "message": message,
        }),
    }
}

fn diagnostic_label(kind: DiagnosticKind) -> &'static str {
    match kind {
        DiagnosticKind::ChecksumMismatch => "checksum_mismatch",
        DiagnosticKind::UnexpectedAck => "unexpected_ack",
        DiagnosticKind::UnexpectedData => "unexpected_data",
        DiagnosticKind::DeviceIo => "device_io",
    }
}
