use crate::base::Frame;
use crate::checksum::Checksum;
use crate::utils::to_hex;
use bytes::{Buf, BytesMut};
use log::{trace, warn};
use std::io::{self, Write};

/// Two-byte marker opening every frame in both directions.
pub const VMC_SYNC_BYTES: [u8; 2] = [0xFA, 0xFB];

/// Sync (2) + command (1) + length (1).
pub const VMC_HEADER_SIZE: usize = 4;

/// Header plus the trailing checksum byte.
pub const VMC_FRAME_OVERHEAD: usize = VMC_HEADER_SIZE + 1;

/// Largest payload the one-byte length field can describe.
pub const VMC_MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Result of one attempt to pull a frame off the inbound buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// A checksum-valid frame, already removed from the buffer.
    Frame(Frame),

    /// The buffer holds at most a partial frame; read more and try again.
    NeedMoreData,

    /// Bytes ahead of the next sync marker were thrown away.
    Resynced { discarded: usize },

    /// A complete frame failed its checksum and was thrown away.
    ChecksumMismatch {
        cmd: u8,
        expected: u8,
        actual: u8,
        raw: Vec<u8>,
    },
}

/// Builds the wire encoding `sync, cmd, len, payload, checksum`.
///
/// # Panics
///
/// Panics if `payload` is longer than 255 bytes; callers size payloads before building.
pub fn build(cmd: u8, payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= VMC_MAX_PAYLOAD_SIZE,
        "payload too big: {} bytes",
        payload.len()
    );

    let mut bytes = Vec::with_capacity(VMC_FRAME_OVERHEAD + payload.len());
    bytes.extend_from_slice(&VMC_SYNC_BYTES);
    bytes.push(cmd);
    bytes.push(payload.len() as u8);
    bytes.extend_from_slice(payload);
    let checksum = Checksum::of(&bytes);
    bytes.push(checksum);
    bytes
}

/// Builds a frame and writes it in one piece to `dest`, returning the bytes written.
pub fn write_frame<W: Write + ?Sized>(dest: &mut W, cmd: u8, payload: &[u8]) -> io::Result<Vec<u8>> {
    let bytes = build(cmd, payload);
    trace!("TX {}", to_hex(&bytes));
    dest.write_all(&bytes)?;
    dest.flush()?;
    Ok(bytes)
}

fn find_sync(buf: &[u8]) -> Option<usize> {
    buf.windows(VMC_SYNC_BYTES.len())
        .position(|w| w == VMC_SYNC_BYTES)
}

/// Extracts at most one frame from the front of `buf`.
///
/// Junk ahead of the sync marker is dropped and reported as `Resynced`; a partial frame is left
/// untouched so the next read can complete it. Callers loop until `NeedMoreData`.
pub fn parse(buf: &mut BytesMut) -> Parsed {
    match find_sync(buf) {
        Some(0) => {}
        Some(start) => {
            trace!("Discarding {} bytes before sync marker", start);
            buf.advance(start);
            return Parsed::Resynced { discarded: start };
        }
        None => {
            // keep a trailing first sync byte, its partner may be in the next read
            let keep = usize::from(buf.last() == Some(&VMC_SYNC_BYTES[0]));
            let discarded = buf.len() - keep;
            if discarded == 0 {
                return Parsed::NeedMoreData;
            }
            trace!("No sync marker in {} buffered bytes, discarding", discarded);
            buf.advance(discarded);
            return Parsed::Resynced { discarded };
        }
    }

    if buf.len() < VMC_HEADER_SIZE {
        return Parsed::NeedMoreData;
    }

    let cmd = buf[2];
    let len = buf[3] as usize;
    let frame_len = VMC_FRAME_OVERHEAD + len;
    if buf.len() < frame_len {
        trace!(
            "Frame cmd={:02X} needs {} bytes, have {}",
            cmd,
            frame_len,
            buf.len()
        );
        return Parsed::NeedMoreData;
    }

    let raw = buf.split_to(frame_len);
    let expected = Checksum::of(&raw[..frame_len - 1]);
    let actual = raw[frame_len - 1];
    if expected != actual {
        warn!(
            "Bad checksum (expected {:02X}, got {:02X}), dropping frame: {}",
            expected,
            actual,
            to_hex(&raw)
        );
        return Parsed::ChecksumMismatch {
            cmd,
            expected,
            actual,
            raw: raw.to_vec(),
        };
    }

    trace!("RX {}", to_hex(&raw));
    Parsed::Frame(Frame::with_payload(
        cmd,
        &raw[VMC_HEADER_SIZE..frame_len - 1],
    ))
}
