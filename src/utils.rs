use std::fmt::Write;

/// Renders bytes as space separated uppercase hex, e.g. `FA FB 42 00 43`.
///
/// Used for raw frames in events and log lines.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        // writing into a String cannot fail
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Renders bytes as contiguous uppercase hex, e.g. `AABB`.
pub fn to_hex_compact(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02X}", b);
    }
    out
}

/// Formats a command id the way clients see it, e.g. `0x03`.
pub fn cmd_label(cmd: u8) -> String {
    format!("0x{:02X}", cmd)
}
