use std::time::Duration;

/// Number of poll-triggered send attempts before a command is abandoned.
///
/// Retries are counted in polls, not seconds: the real-world timeout is
/// `DEFAULT_MAX_RETRIES × poll interval` of the controller.
pub const DEFAULT_MAX_RETRIES: u8 = 5;

/// Serial device used when no path is configured.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyS1";

/// Line speed of the VMC link.
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Upper bound on one blocking device read, so the worker notices a stop request quickly.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Pause after a device read/write failure before the read loop tries again.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Bytes requested from the device per read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64;
