//! The turn-taking state machine of the upper computer.
//!
//! The VMC is bus master and polls every few hundred milliseconds; the upper computer may only
//! transmit in reply to a frame. A queued command therefore goes out on the next poll, and a
//! retry is simply "send it again on the following poll". The retry budget is a count of polls,
//! so the real timeout is `max_retries × poll interval`, with no timer thread involved.
//!
//! ```text
//!  Idle ──enqueue──▶ WaitingAck ──ack──▶ WaitingData ──poll──▶ Idle (finished)
//!                      │  ▲ poll: send cmd     │ ▲ data: decode + ack
//!                      │  └────────────────────┘ └─────┘
//!                      └──poll after max retries──▶ Idle (timeout)
//! ```

use crate::answers::DecodedEvent;
use crate::base::{Error, EventSink, Frame, Result};
use crate::cmds::{VMC_CMD_ACK, VMC_CMD_POLL};
use crate::internals::DEFAULT_MAX_RETRIES;
use crate::protocol::{write_frame, VMC_MAX_PAYLOAD_SIZE};
use crate::registry::CommandRegistry;
use crate::utils::to_hex;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

/// Where the engine is in the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No command in flight; polls are answered with a bare ack.
    Idle,
    /// A command is queued or sent, waiting for the VMC to acknowledge it.
    WaitingAck,
    /// The VMC acknowledged; data frames may follow until the next poll.
    WaitingData,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::WaitingAck => "waiting_ack",
            EngineState::WaitingData => "waiting_data",
        };
        f.write_str(name)
    }
}

/// The single in-flight outbound transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub cmd: u8,
    pub seq: u8,
    /// Payload without the sequence byte.
    pub payload: Vec<u8>,
    /// Send attempts so far.
    pub retries: u8,
    pub description: String,
    pub acknowledged: bool,
}

impl PendingCommand {
    fn wire_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + self.payload.len());
        payload.push(self.seq);
        payload.extend_from_slice(&self.payload);
        payload
    }
}

/// Classes of anomaly reported as log-level events rather than errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    ChecksumMismatch,
    UnexpectedAck,
    UnexpectedData,
    DeviceIo,
}

/// Everything the engine reports to its sink, in the order it happened on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Queued {
        cmd: u8,
        seq: u8,
        description: String,
    },
    Sent {
        cmd: u8,
        seq: u8,
        attempt: u8,
        raw: Vec<u8>,
        description: String,
    },
    Acknowledged {
        cmd: u8,
        seq: u8,
        description: String,
    },
    Data {
        cmd: u8,
        raw: Vec<u8>,
        event: DecodedEvent,
    },
    Finished {
        cmd: u8,
        seq: u8,
        description: String,
    },
    TimedOut {
        cmd: u8,
        seq: u8,
        attempts: u8,
        description: String,
    },
    Diagnostic {
        kind: DiagnosticKind,
        message: String,
    },
}

#[derive(Debug)]
struct EngineInner {
    state: EngineState,
    pending: Option<PendingCommand>,
    next_seq: u8,
    /// Events recorded under the lock, waiting for delivery in recording order.
    outbox: VecDeque<EngineEvent>,
}

impl EngineInner {
    /// Next sequence number in `1..=255`; 0 is never issued.
    fn allocate_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = if seq == u8::MAX { 1 } else { seq + 1 };
        seq
    }

    fn clear(&mut self) -> Option<PendingCommand> {
        self.state = EngineState::Idle;
        self.pending.take()
    }
}

/// Owns the transaction state and reacts to classified inbound frames.
///
/// All methods take `&self`: one mutex guards state, the pending slot and the sequence counter,
/// so the link worker and request handlers can share an `Arc<ProtocolEngine>`. Frames are
/// written and events recorded while the lock is held, so the recorded order is the wire order.
/// Delivery happens after the lock is released and is serialized by a second mutex: one thread
/// at a time drains the outbox, and a thread that finds delivery in progress leaves its events to
/// that thread. A sink may therefore call back into the engine, and `Queued` for a command always
/// reaches the sink before its first `Sent`.
pub struct ProtocolEngine {
    inner: Mutex<EngineInner>,
    delivery: Mutex<()>,
    sink: Arc<dyn EventSink>,
    registry: &'static CommandRegistry,
    max_retries: u8,
}

impl fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("inner", &self.inner)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Creates an idle engine delivering events to `sink`.
    pub fn new(sink: Arc<dyn EventSink>) -> ProtocolEngine {
        ProtocolEngine::with_max_retries(sink, DEFAULT_MAX_RETRIES)
    }

    /// Creates an idle engine with a non-default retry budget.
    ///
    /// Every command gets at least one send attempt: a budget of 0 is raised to 1.
    pub fn with_max_retries(sink: Arc<dyn EventSink>, max_retries: u8) -> ProtocolEngine {
        let max_retries = if max_retries == 0 {
            warn!("max_retries of 0 would never send a command, using 1");
            1
        } else {
            max_retries
        };
        trace!("Creating ProtocolEngine (max_retries={})", max_retries);
        ProtocolEngine {
            inner: Mutex::new(EngineInner {
                state: EngineState::Idle,
                pending: None,
                next_seq: 1,
                outbox: VecDeque::new(),
            }),
            delivery: Mutex::new(()),
            sink,
            registry: CommandRegistry::global(),
            max_retries,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        // state stays consistent even if a sink panicked on another thread
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, events: Vec<EngineEvent>) {
        self.lock().outbox.extend(events);
        self.deliver();
    }

    /// Drains the outbox into the sink unless another call is already draining it.
    fn deliver(&self) {
        loop {
            let delivering = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return,
            };
            loop {
                // the engine lock must not be held while the sink runs
                let next = self.lock().outbox.pop_front();
                let Some(event) = next else { break };
                self.sink.on_event(event);
            }
            drop(delivering);

            // events recorded after the drain ended but before the release were left to us
            if self.lock().outbox.is_empty() {
                return;
            }
        }
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    /// Snapshot of the in-flight command, if any.
    pub fn pending(&self) -> Option<PendingCommand> {
        self.lock().pending.clone()
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Registers a command to go out on the next poll and returns its sequence number.
    ///
    /// Fails fast with [`Error::Busy`] while another transaction is in flight; the existing
    /// command is left untouched.
    pub fn enqueue(&self, cmd: u8, payload: Vec<u8>, description: impl Into<String>) -> Result<u8> {
        let description = description.into();
        if cmd == VMC_CMD_POLL || cmd == VMC_CMD_ACK {
            return Err(Error::ReservedCommand(cmd));
        }
        if payload.len() >= VMC_MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge { len: payload.len() });
        }

        let seq = {
            let mut inner = self.lock();
            if let Some(current) = inner.pending.as_ref() {
                debug!(
                    "Rejecting '{}': comm {} ({}) still {}",
                    description, current.seq, current.description, inner.state
                );
                return Err(Error::Busy {
                    seq: current.seq,
                    description: current.description.clone(),
                });
            }

            let seq = inner.allocate_seq();
            inner.pending = Some(PendingCommand {
                cmd,
                seq,
                payload,
                retries: 0,
                description: description.clone(),
                acknowledged: false,
            });
            inner.state = EngineState::WaitingAck;
            info!(
                "Command queued: {}, cmd=0x{:02X}, comm={}",
                description, cmd, seq
            );
            inner.outbox.push_back(EngineEvent::Queued {
                cmd,
                seq,
                description,
            });
            seq
        };

        self.deliver();
        Ok(seq)
    }

    /// Routes a checksum-valid frame to the poll, ack or data handler.
    pub fn handle_frame<W: Write + ?Sized>(&self, frame: &Frame, out: &mut W) {
        match frame.cmd {
            VMC_CMD_POLL => self.on_poll(out),
            VMC_CMD_ACK => self.on_ack(),
            _ => self.on_data(frame, out),
        }
    }

    /// Reacts to a poll: the one moment the upper computer may transmit.
    pub fn on_poll<W: Write + ?Sized>(&self, out: &mut W) {
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            match inner.state {
                EngineState::Idle => send_ack(out, &mut events),
                EngineState::WaitingAck => self.poll_waiting_ack(inner, out, &mut events),
                EngineState::WaitingData => {
                    send_ack(out, &mut events);
                    if let Some(done) = inner.clear() {
                        info!("Command finished: {}, comm={}", done.description, done.seq);
                        events.push(EngineEvent::Finished {
                            cmd: done.cmd,
                            seq: done.seq,
                            description: done.description,
                        });
                    }
                }
            }
            inner.outbox.extend(events);
        }
        self.deliver();
    }

    fn poll_waiting_ack<W: Write + ?Sized>(
        &self,
        inner: &mut EngineInner,
        out: &mut W,
        events: &mut Vec<EngineEvent>,
    ) {
        let max_retries = self.max_retries;
        let Some(pending) = inner.pending.as_mut() else {
            warn!("Waiting for ack without a pending command, returning to idle");
            inner.clear();
            send_ack(out, events);
            return;
        };

        if pending.retries >= max_retries {
            send_ack(out, events);
            if let Some(abandoned) = inner.clear() {
                warn!(
                    "Command timeout, no ACK after {} attempts: {}, comm={}",
                    abandoned.retries, abandoned.description, abandoned.seq
                );
                events.push(EngineEvent::TimedOut {
                    cmd: abandoned.cmd,
                    seq: abandoned.seq,
                    attempts: abandoned.retries,
                    description: abandoned.description,
                });
            }
            return;
        }

        // the attempt counts even if the write fails
        pending.retries += 1;
        match write_frame(out, pending.cmd, &pending.wire_payload()) {
            Ok(raw) => {
                debug!(
                    "TX cmd 0x{:02X}, comm={}, attempt={}: {}",
                    pending.cmd,
                    pending.seq,
                    pending.retries,
                    to_hex(&raw)
                );
                events.push(EngineEvent::Sent {
                    cmd: pending.cmd,
                    seq: pending.seq,
                    attempt: pending.retries,
                    raw,
                    description: pending.description.clone(),
                });
            }
            Err(err) => {
                warn!("Serial write error (cmd 0x{:02X}): {}", pending.cmd, err);
                events.push(EngineEvent::Diagnostic {
                    kind: DiagnosticKind::DeviceIo,
                    message: format!("serial write error (cmd 0x{:02X}): {}", pending.cmd, err),
                });
            }
        }
    }

    /// Reacts to an ack from the VMC.
    pub fn on_ack(&self) {
        let mut events = Vec::new();
        {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let state = inner.state;
            match (state, inner.pending.as_mut()) {
                (EngineState::WaitingAck, Some(pending)) => {
                    pending.acknowledged = true;
                    info!(
                        "ACK from VMC for cmd=0x{:02X}, comm={}",
                        pending.cmd, pending.seq
                    );
                    events.push(EngineEvent::Acknowledged {
                        cmd: pending.cmd,
                        seq: pending.seq,
                        description: pending.description.clone(),
                    });
                    inner.state = EngineState::WaitingData;
                }
                _ => {
                    warn!("ACK from VMC while {}, ignoring", state);
                    events.push(EngineEvent::Diagnostic {
                        kind: DiagnosticKind::UnexpectedAck,
                        message: format!("ACK from VMC while {}", state),
                    });
                }
            }
            inner.outbox.extend(events);
        }
        self.deliver();
    }

    /// Reacts to any frame other than poll or ack. Data is always acknowledged right away.
    pub fn on_data<W: Write + ?Sized>(&self, frame: &Frame, out: &mut W) {
        let mut events = Vec::new();
        {
            let mut inner = self.lock();
            send_ack(out, &mut events);

            let raw = frame.to_bytes();
            if inner.state == EngineState::WaitingData {
                let event = self.registry.decode(frame.cmd, &frame.payload);
                if event.is_error() {
                    warn!(
                        "Malformed data frame 0x{:02X}: {:?} ({})",
                        frame.cmd,
                        event,
                        to_hex(&raw)
                    );
                } else {
                    debug!("RX data 0x{:02X}: {}", frame.cmd, event.name());
                }
                events.push(EngineEvent::Data {
                    cmd: frame.cmd,
                    raw,
                    event,
                });
            } else {
                warn!(
                    "Data frame 0x{:02X} while {}, ignoring: {}",
                    frame.cmd,
                    inner.state,
                    to_hex(&raw)
                );
                events.push(EngineEvent::Diagnostic {
                    kind: DiagnosticKind::UnexpectedData,
                    message: format!(
                        "data frame 0x{:02X} while {}: {}",
                        frame.cmd,
                        inner.state,
                        to_hex(&raw)
                    ),
                });
            }
            inner.outbox.extend(events);
        }
        self.deliver();
    }

    /// Reports a frame the codec dropped for a bad checksum.
    pub fn report_checksum_mismatch(&self, cmd: u8, expected: u8, actual: u8, raw: &[u8]) {
        self.record(vec![EngineEvent::Diagnostic {
            kind: DiagnosticKind::ChecksumMismatch,
            message: format!(
                "bad checksum on cmd 0x{:02X} (expected {:02X}, got {:02X}): {}",
                cmd,
                expected,
                actual,
                to_hex(raw)
            ),
        }]);
    }

    /// Reports a transient device failure seen by the link.
    pub fn report_device_error(&self, message: String) {
        self.record(vec![EngineEvent::Diagnostic {
            kind: DiagnosticKind::DeviceIo,
            message,
        }]);
    }

    /// Drops any in-flight command and returns to idle. Nothing is persisted.
    pub fn reset(&self) -> Option<PendingCommand> {
        let discarded = self.lock().clear();
        if let Some(pending) = discarded.as_ref() {
            debug!(
                "Discarding in-flight command: {}, comm={}",
                pending.description, pending.seq
            );
        }
        discarded
    }
}

fn send_ack<W: Write + ?Sized>(out: &mut W, events: &mut Vec<EngineEvent>) {
    if let Err(err) = write_frame(out, VMC_CMD_ACK, &[]) {
        warn!("Serial write error (ACK): {}", err);
        events.push(EngineEvent::Diagnostic {
            kind: DiagnosticKind::DeviceIo,
            message: format!("serial write error (ACK): {}", err),
        });
    }
}
