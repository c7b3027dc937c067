/// One decoded unit from the wire: command id plus payload, sync and checksum stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The command identifier.
    pub cmd: u8,

    /// Payload bytes. For application commands the first byte is the sequence echo.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame with no payload, such as a poll or a bare ack.
    pub fn new(cmd: u8) -> Frame {
        Frame::with_payload(cmd, &[])
    }

    /// Creates a frame carrying `payload`.
    #[inline]
    pub fn with_payload(cmd: u8, payload: &[u8]) -> Frame {
        Frame {
            cmd,
            payload: payload.to_vec(),
        }
    }

    /// Full wire encoding of this frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        crate::protocol::build(self.cmd, &self.payload)
    }
}
