use crate::base::error::Result;
use crate::base::frame::Frame;
use crate::internals::DEFAULT_READ_CHUNK_SIZE;
use crate::protocol::{parse, Parsed};
use bytes::BytesMut;
use log::{error, trace, warn};
use std::io;

/// Something pulled off the wire that the engine needs to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A checksum-valid frame.
    Frame(Frame),

    /// A complete frame that failed its checksum and was dropped.
    Corrupt {
        cmd: u8,
        expected: u8,
        actual: u8,
        raw: Vec<u8>,
    },
}

/// Device stream plus the inbound byte buffer frames are cut from.
///
/// Writes go straight through to the stream and are flushed by the frame writer, so a
/// `Channel` can be handed to the engine as its output.
///
/// # Examples
/// ```ignore
/// let mut channel = Channel::new(serial_port);
/// channel.fill()?;
/// while let Some(inbound) = channel.next_inbound() {
///     println!("{:?}", inbound);
/// }
/// ```
#[derive(Debug)]
pub struct Channel<T: ?Sized> {
    stream: Box<T>,
    read_buffer: BytesMut,
    scratch: Vec<u8>,
}

impl<T: ?Sized> Channel<T>
where
    T: io::Read + io::Write,
{
    /// Create a new `Channel` reading in default sized chunks.
    pub fn new(stream: Box<T>) -> Channel<T> {
        Channel::with_read_chunk_size(stream, DEFAULT_READ_CHUNK_SIZE)
    }

    /// Create a new `Channel` requesting `chunk_size` bytes per device read.
    pub fn with_read_chunk_size(stream: Box<T>, chunk_size: usize) -> Channel<T> {
        let chunk_size = chunk_size.max(1);
        trace!("Creating new Channel with read chunk size {}", chunk_size);
        Channel {
            stream,
            read_buffer: BytesMut::with_capacity(chunk_size * 4),
            scratch: vec![0; chunk_size],
        }
    }

    /// Drops whatever partial data is buffered.
    pub fn reset(&mut self) {
        trace!("Resetting Channel, dropping {} buffered bytes", self.read_buffer.len());
        self.read_buffer.clear();
    }

    /// Number of bytes waiting to be parsed.
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Performs one device read and appends the bytes to the buffer.
    ///
    /// A read that times out is not an error: it returns `Ok(0)` so the caller can check its
    /// stop flag.
    pub fn fill(&mut self) -> Result<usize> {
        match self.stream.read(&mut self.scratch) {
            Ok(read) => {
                if read > 0 {
                    trace!("Read {} bytes from stream", read);
                    self.read_buffer.extend_from_slice(&self.scratch[..read]);
                }
                Ok(read)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => {
                error!("IO error reading from stream: {}", e);
                Err(e.into())
            }
        }
    }

    /// Pulls the next frame (or dropped corrupt frame) from the buffer, skipping junk.
    /// Returns `None` once only a partial frame remains.
    pub fn next_inbound(&mut self) -> Option<Inbound> {
        loop {
            match parse(&mut self.read_buffer) {
                Parsed::Frame(frame) => return Some(Inbound::Frame(frame)),
                Parsed::NeedMoreData => return None,
                Parsed::Resynced { discarded } => {
                    warn!("Resynchronized, discarded {} bytes", discarded);
                }
                Parsed::ChecksumMismatch {
                    cmd,
                    expected,
                    actual,
                    raw,
                } => {
                    return Some(Inbound::Corrupt {
                        cmd,
                        expected,
                        actual,
                        raw,
                    })
                }
            }
        }
    }
}

impl<T: ?Sized> io::Write for Channel<T>
where
    T: io::Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build;
    use std::collections::VecDeque;
    use std::io::{Read, Write};

    /// Serves queued read results one per call.
    struct Scripted {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn channel(reads: Vec<io::Result<Vec<u8>>>) -> Channel<Scripted> {
        Channel::new(Box::new(Scripted {
            reads: reads.into(),
            written: Vec::new(),
        }))
    }

    #[test]
    fn frame_split_across_reads() {
        let frame = build(0x04, &[0x01, 0x02, 0x00, 0x0C]);
        let mut chn = channel(vec![Ok(frame[..5].to_vec()), Ok(frame[5..].to_vec())]);

        assert_eq!(chn.fill().unwrap(), 5);
        assert_eq!(chn.next_inbound(), None);
        assert_eq!(chn.buffered(), 5);

        chn.fill().unwrap();
        assert_eq!(
            chn.next_inbound(),
            Some(Inbound::Frame(Frame::with_payload(
                0x04,
                &[0x01, 0x02, 0x00, 0x0C]
            )))
        );
        assert_eq!(chn.buffered(), 0);
    }

    #[test]
    fn several_frames_in_one_read_with_junk() {
        let mut bytes = vec![0x55, 0x66];
        bytes.extend(build(0x41, &[]));
        bytes.extend(build(0x42, &[]));
        let mut chn = channel(vec![Ok(bytes)]);

        chn.fill().unwrap();
        assert_eq!(chn.next_inbound(), Some(Inbound::Frame(Frame::new(0x41))));
        assert_eq!(chn.next_inbound(), Some(Inbound::Frame(Frame::new(0x42))));
        assert_eq!(chn.next_inbound(), None);
    }

    #[test]
    fn corrupt_frame_is_reported() {
        let mut bytes = build(0x41, &[]);
        bytes[4] ^= 0x01;
        let mut chn = channel(vec![Ok(bytes)]);
        chn.fill().unwrap();
        assert!(matches!(
            chn.next_inbound(),
            Some(Inbound::Corrupt { cmd: 0x41, .. })
        ));
        assert_eq!(chn.next_inbound(), None);
    }

    #[test]
    fn timeouts_are_empty_reads_and_other_errors_propagate() {
        let mut chn = channel(vec![
            Err(io::Error::new(io::ErrorKind::TimedOut, "quiet")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
        ]);
        assert_eq!(chn.fill().unwrap(), 0);
        assert!(chn.fill().is_err());
    }

    #[test]
    fn writes_reach_the_stream() {
        let mut chn = channel(Vec::new());
        chn.write_all(&[1, 2, 3]).unwrap();
        assert_eq!(chn.stream.written, [1, 2, 3]);
    }
}
