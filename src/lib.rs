//! # VMC Link
//!
//! `vmc_link` implements the upper-computer (slave) side of the VMC vending machine controller
//! serial protocol. The VMC polls; this crate answers every poll, sends one queued command at a
//! time, retries it on later polls, decodes the data frames the VMC sends back, and reports
//! every step as an [`EngineEvent`].
//!
//! ```ignore
//! use std::sync::Arc;
//! use vmc_link::{Bridge, ClientRegistry, LinkConfig, ProtocolEngine, VmcLink};
//!
//! let config = LinkConfig::default();
//! let clients = Arc::new(ClientRegistry::new());
//! let engine = Arc::new(ProtocolEngine::with_max_retries(clients.clone(), config.max_retries));
//! let link = VmcLink::open(&config, engine.clone())?.spawn()?;
//!
//! let bridge = Bridge::new(engine, clients.clone());
//! let (_id, events) = clients.register();
//! bridge.handle_message(r#"{"type": "buy", "selection": 12}"#)?;
//! println!("{}", events.recv()?);
//! link.shutdown();
//! ```

pub mod answers;
pub mod base;
pub mod bridge;
mod checksum;
pub mod cmds;
pub mod config;
pub mod engine;
mod internals;
pub mod protocol;
pub mod registry;
pub mod utils;

pub use crate::answers::DecodedEvent;
pub use crate::base::{Channel, Error, EventSink, Frame, Inbound, Result};
pub use crate::bridge::{Bridge, ClientRegistry};
pub use crate::config::LinkConfig;
pub use crate::engine::{EngineEvent, EngineState, ProtocolEngine};
pub use crate::registry::CommandRegistry;

use log::{debug, error, info, trace, warn};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// The transport driver: reads the device, feeds frames to the engine, and lets the engine
/// write its replies back on the same stream.
///
/// Frame handling and device writes happen on whichever thread runs [`VmcLink::run`]; callers
/// on other threads interact only through the shared [`ProtocolEngine`].
#[derive(Debug)]
pub struct VmcLink<T: ?Sized> {
    channel: Channel<T>,
    engine: Arc<ProtocolEngine>,
    stop: Arc<AtomicBool>,
    error_backoff: Duration,
}

impl VmcLink<dyn SerialPort> {
    /// Opens the configured serial device and wires it to `engine`.
    ///
    /// Failing to open the device is the one unrecoverable error of the link.
    pub fn open(config: &LinkConfig, engine: Arc<ProtocolEngine>) -> Result<VmcLink<dyn SerialPort>> {
        let port = config.open_port()?;
        let mut link = VmcLink::with_channel(
            Channel::with_read_chunk_size(port, config.read_chunk_size),
            engine,
        );
        link.set_error_backoff(config.error_backoff());
        Ok(link)
    }
}

impl<T: ?Sized> VmcLink<T>
where
    T: Read + Write,
{
    /// Constructs a link over any byte stream (serial port, pty, in-memory mock).
    ///
    /// The stream should time out its reads after a short interval so the read loop can notice
    /// a stop request.
    pub fn new(stream: Box<T>, engine: Arc<ProtocolEngine>) -> VmcLink<T> {
        VmcLink::with_channel(Channel::new(stream), engine)
    }

    /// Constructs a link over an existing `Channel`.
    pub fn with_channel(channel: Channel<T>, engine: Arc<ProtocolEngine>) -> VmcLink<T> {
        trace!("Creating new VmcLink");
        VmcLink {
            channel,
            engine,
            stop: Arc::new(AtomicBool::new(false)),
            error_backoff: internals::DEFAULT_ERROR_BACKOFF,
        }
    }

    pub fn set_error_backoff(&mut self, backoff: Duration) {
        self.error_backoff = backoff;
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Flag that makes [`VmcLink::run`] return after the current read.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Performs one device read and handles every complete frame it produced.
    ///
    /// Returns the number of frames handed to the engine (corrupt frames excluded).
    pub fn poll_once(&mut self) -> Result<usize> {
        self.channel.fill()?;

        let mut handled = 0;
        while let Some(inbound) = self.channel.next_inbound() {
            match inbound {
                Inbound::Frame(frame) => {
                    self.engine.handle_frame(&frame, &mut self.channel);
                    handled += 1;
                }
                Inbound::Corrupt {
                    cmd,
                    expected,
                    actual,
                    raw,
                } => self
                    .engine
                    .report_checksum_mismatch(cmd, expected, actual, &raw),
            }
        }
        Ok(handled)
    }

    /// Runs the read loop until the stop flag is set.
    ///
    /// Device errors are reported, followed by a pause, and never end the loop. On exit any
    /// in-flight command is discarded.
    pub fn run(&mut self) {
        info!("Serial loop started");
        while !self.stop.load(Ordering::Acquire) {
            if let Err(err) = self.poll_once() {
                warn!("Serial read error: {}", err);
                self.engine
                    .report_device_error(format!("serial read error: {}", err));
                self.backoff();
            }
        }
        self.channel.reset();
        if let Some(discarded) = self.engine.reset() {
            debug!("Dropped '{}' on shutdown", discarded.description);
        }
        info!("Serial loop stopped");
    }

    /// Sleeps for the error backoff in short slices so a stop request is not delayed.
    fn backoff(&self) {
        const SLICE: Duration = Duration::from_millis(10);
        let mut remaining = self.error_backoff;
        while !remaining.is_zero() && !self.stop.load(Ordering::Acquire) {
            let step = remaining.min(SLICE);
            thread::sleep(step);
            remaining -= step;
        }
    }
}

impl<T: ?Sized> VmcLink<T>
where
    T: Read + Write + Send + 'static,
{
    /// Moves the link onto its own worker thread.
    pub fn spawn(mut self) -> Result<LinkHandle> {
        let stop = self.stop.clone();
        let engine = self.engine.clone();
        let worker = thread::Builder::new()
            .name("vmc-link".to_owned())
            .spawn(move || self.run())
            .map_err(|e| {
                error!("Cannot start serial worker: {}", e);
                Error::from(e)
            })?;
        Ok(LinkHandle {
            stop,
            engine,
            worker: Some(worker),
        })
    }
}

/// Owner's handle on a spawned link. Dropping it stops the worker and waits for it.
#[derive(Debug)]
pub struct LinkHandle {
    stop: Arc<AtomicBool>,
    engine: Arc<ProtocolEngine>,
    worker: Option<JoinHandle<()>>,
}

impl LinkHandle {
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Signals the worker and waits for it; takes at most one read timeout plus one frame.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Serial worker panicked");
            }
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Mutex;

    const POLL: [u8; 5] = [0xFA, 0xFB, 0x41, 0x00, 0x40];
    const ACK_FROM_VMC: [u8; 5] = [0xFA, 0xFB, 0x42, 0x00, 0x43];

    /// In-memory device: reads come from a shared script, writes are recorded.
    #[derive(Clone, Default)]
    struct MockDevice {
        reads: Arc<Mutex<VecDeque<io::Result<Vec<u8>>>>>,
        written: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl MockDevice {
        fn push(&self, bytes: &[u8]) {
            self.reads.lock().unwrap().push_back(Ok(bytes.to_vec()));
        }

        fn push_error(&self, kind: io::ErrorKind) {
            self.reads
                .lock()
                .unwrap()
                .push_back(Err(io::Error::new(kind, "mock failure")));
        }

        fn take_written(&self) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.written.lock().unwrap())
        }
    }

    impl Read for MockDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.lock().unwrap().pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => {
                    thread::sleep(Duration::from_millis(1));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
            }
        }
    }

    impl Write for MockDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<EngineEvent>>>, Arc<ProtocolEngine>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |event: EngineEvent| events.lock().unwrap().push(event)
        };
        (events, Arc::new(ProtocolEngine::new(Arc::new(sink))))
    }

    #[test]
    fn idle_poll_is_acked() {
        let (_events, engine) = recorder();
        let device = MockDevice::default();
        let mut link = VmcLink::new(Box::new(device.clone()), engine);

        device.push(&POLL);
        assert_eq!(link.poll_once().unwrap(), 1);
        assert_eq!(device.take_written(), vec![ACK_FROM_VMC.to_vec()]);
    }

    #[test]
    fn command_round_trip_over_the_link() {
        let (events, engine) = recorder();
        let device = MockDevice::default();
        let mut link = VmcLink::new(Box::new(device.clone()), engine.clone());

        let seq = engine.enqueue(0x03, vec![0x00, 0x0C], "buy selection=12").unwrap();

        device.push(&POLL);
        link.poll_once().unwrap();
        assert_eq!(
            device.take_written(),
            vec![build(0x03, &[seq, 0x00, 0x0C])]
        );

        let mut burst = ACK_FROM_VMC.to_vec();
        burst.extend(build(0x04, &[seq, 0x02, 0x00, 0x0C]));
        device.push(&burst);
        assert_eq!(link.poll_once().unwrap(), 2);
        assert_eq!(device.take_written(), vec![ACK_FROM_VMC.to_vec()]);

        device.push(&POLL);
        link.poll_once().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);

        let names: Vec<&str> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| match e {
                EngineEvent::Queued { .. } => "queued",
                EngineEvent::Sent { .. } => "sent",
                EngineEvent::Acknowledged { .. } => "acknowledged",
                EngineEvent::Data { event, .. } => event.name(),
                EngineEvent::Finished { .. } => "finished",
                EngineEvent::TimedOut { .. } => "timeout",
                EngineEvent::Diagnostic { .. } => "diagnostic",
            })
            .collect();
        assert_eq!(
            names,
            ["queued", "sent", "acknowledged", "vend_status", "finished"]
        );
    }

    #[test]
    fn corrupt_frame_is_reported_not_handled() {
        let (events, engine) = recorder();
        let device = MockDevice::default();
        let mut link = VmcLink::new(Box::new(device.clone()), engine);

        let mut bad = POLL.to_vec();
        bad[4] = 0x00;
        device.push(&bad);
        assert_eq!(link.poll_once().unwrap(), 0);
        assert!(device.take_written().is_empty());
        assert!(matches!(
            events.lock().unwrap().as_slice(),
            [EngineEvent::Diagnostic {
                kind: engine::DiagnosticKind::ChecksumMismatch,
                ..
            }]
        ));
    }

    #[test]
    fn read_errors_do_not_stop_the_loop() {
        let (events, engine) = recorder();
        let device = MockDevice::default();
        let mut link = VmcLink::new(Box::new(device.clone()), engine);
        link.set_error_backoff(Duration::ZERO);

        device.push_error(io::ErrorKind::BrokenPipe);
        device.push(&POLL);

        let stop = link.stop_flag();
        let worker = thread::spawn(move || {
            link.run();
            link
        });

        for _ in 0..500 {
            if !device.written.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        stop.store(true, Ordering::Release);
        worker.join().unwrap();

        assert_eq!(device.take_written(), vec![ACK_FROM_VMC.to_vec()]);
        assert!(events.lock().unwrap().iter().any(|e| matches!(
            e,
            EngineEvent::Diagnostic {
                kind: engine::DiagnosticKind::DeviceIo,
                ..
            }
        )));
    }

    #[test]
    fn spawned_link_shuts_down_and_discards_pending() {
        let (_events, engine) = recorder();
        let device = MockDevice::default();
        let handle = VmcLink::new(Box::new(device.clone()), engine.clone())
            .spawn()
            .unwrap();
        assert!(handle.is_running());

        engine.enqueue(0x31, Vec::new(), "get_slots").unwrap();
        handle.shutdown();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.pending(), None);
    }
}
