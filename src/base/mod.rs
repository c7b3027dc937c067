mod channel;
mod error;
mod frame;
mod traits;

pub use self::channel::*;
pub use self::error::{Error, Result};
pub use self::frame::Frame;
pub use self::traits::EventSink;
