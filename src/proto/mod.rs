//! Control protocol for the remote traffic engine: newline-delimited text
//! commands and responses, with binary packet captures embedded in-stream.

pub mod client;
pub mod wire;

pub use client::ControlClient;
pub use wire::{CaptureRecord, ControlCodec, ControlEvent};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A `pktdump` header that could not be parsed. Fatal: the stream can no
    /// longer be resynchronized and the session must be reconnected.
    #[error("malformed capture header {0:?}")]
    BadCaptureHeader(String),

    /// The stream ended inside a capture record, before the declared payload
    /// length (plus its terminator) arrived. Fatal, as above.
    #[error("stream ended inside a capture record ({missing} of {declared} bytes missing)")]
    TruncatedCapture { declared: usize, missing: usize },

    #[error("control connection closed by peer")]
    ConnectionClosed,

    /// The remote side did not answer a query that requires a response.
    #[error("no response to {command:?}")]
    NoResponse { command: String },

    #[error("unparseable response {response:?} to {command:?}")]
    BadResponse { command: String, response: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
