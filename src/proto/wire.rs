//! Framing for the traffic engine's control stream.
//!
//! A regular response is a single line of text terminated by `\n`. A packet
//! capture is announced by a header line `pktdump,<port>,<len>` followed by
//! exactly `<len>` raw bytes and a trailing `\n`. Any number of captures may
//! precede a regular response, so the decoder yields a flat sequence of
//! [`ControlEvent`]s and the client layer sorts them out.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::ProtocolError;

const CAPTURE_PREFIX: &[u8] = b"pktdump,";

/// One captured packet, read off the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    port_id: u32,
    payload: Vec<u8>,
}

impl CaptureRecord {
    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    /// Declared and actual payload length; the decoder guarantees they match.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// One decoded unit of the control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// A regular newline-terminated response, without the terminator.
    Line(String),
    Capture(CaptureRecord),
}

/// Incremental decoder for the control stream. Chunk boundaries of the
/// underlying reads never affect the decoded event sequence.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    pub fn new() -> Self {
        Self
    }
}

fn parse_capture_header(header: &[u8]) -> Result<(u32, usize), ProtocolError> {
    let bad = || ProtocolError::BadCaptureHeader(String::from_utf8_lossy(header).into_owned());

    let text = std::str::from_utf8(header).map_err(|_| bad())?;
    let mut fields = text.splitn(3, ',');
    fields.next(); // "pktdump"
    let port_id = fields
        .next()
        .and_then(|f| f.parse::<u32>().ok())
        .ok_or_else(bad)?;
    let len = fields
        .next()
        .and_then(|f| f.parse::<usize>().ok())
        .ok_or_else(bad)?;
    Ok((port_id, len))
}

impl Decoder for ControlCodec {
    type Item = ControlEvent;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ControlEvent>, ProtocolError> {
        let Some(eol) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };

        if src[..eol].starts_with(CAPTURE_PREFIX) {
            let (port_id, len) = parse_capture_header(&src[..eol])?;
            // Header, '\n', payload, trailing '\n'.
            let total = eol + 1 + len + 1;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }
            src.advance(eol + 1);
            let payload = src.split_to(len).to_vec();
            src.advance(1);
            return Ok(Some(ControlEvent::Capture(CaptureRecord { port_id, payload })));
        }

        let line = src.split_to(eol);
        src.advance(1);
        Ok(Some(ControlEvent::Line(
            String::from_utf8_lossy(&line).into_owned(),
        )))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<ControlEvent>, ProtocolError> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if src.is_empty() {
            return Ok(None);
        }
        if src.starts_with(CAPTURE_PREFIX) {
            // A capture that never completed. The payload length can only be
            // trusted if the header line itself was complete.
            let missing = match src.iter().position(|&b| b == b'\n') {
                Some(eol) => {
                    let (_, len) = parse_capture_header(&src[..eol])?;
                    (eol + 1 + len + 1).saturating_sub(src.len())
                }
                None => 0,
            };
            let declared = src.len() + missing;
            src.clear();
            return Err(ProtocolError::TruncatedCapture { declared, missing });
        }
        // The peer closed mid-line; hand back what arrived.
        let rest = src.split_to(src.len());
        Ok(Some(ControlEvent::Line(
            String::from_utf8_lossy(&rest).into_owned(),
        )))
    }
}

impl Encoder<String> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}
