//! HTTP/2 frame model (RFC 9113 section 4).
//!
//! Byte-level parsing and serialization of the 9-octet frame header and the
//! frame payloads the client cares about. HEADERS/CONTINUATION aggregation
//! and HPACK decoding live in the codec; this module only deals in raw
//! header blocks.

use bytes::{BufMut, Bytes, BytesMut};

pub(crate) const HEADER_LEN: usize = 9;

/// The fixed 24-octet client greeting that begins every h2 connection.
pub(crate) const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
pub(crate) const MAX_STREAM_ID: u32 = (1 << 31) - 1;

pub(crate) mod flags {
    pub(crate) const END_STREAM: u8 = 0x1;
    pub(crate) const ACK: u8 = 0x1;
    pub(crate) const END_HEADERS: u8 = 0x4;
    pub(crate) const PADDED: u8 = 0x8;
    pub(crate) const PRIORITY: u8 = 0x20;
}

/// Frame type registry. Unknown types are skipped by the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Data,
    Headers,
    Priority,
    Reset,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    Unknown(u8),
}

impl Kind {
    pub(crate) fn from_u8(byte: u8) -> Kind {
        match byte {
            0 => Kind::Data,
            1 => Kind::Headers,
            2 => Kind::Priority,
            3 => Kind::Reset,
            4 => Kind::Settings,
            5 => Kind::PushPromise,
            6 => Kind::Ping,
            7 => Kind::GoAway,
            8 => Kind::WindowUpdate,
            9 => Kind::Continuation,
            other => Kind::Unknown(other),
        }
    }

    fn into_u8(self) -> u8 {
        match self {
            Kind::Data => 0,
            Kind::Headers => 1,
            Kind::Priority => 2,
            Kind::Reset => 3,
            Kind::Settings => 4,
            Kind::PushPromise => 5,
            Kind::Ping => 6,
            Kind::GoAway => 7,
            Kind::WindowUpdate => 8,
            Kind::Continuation => 9,
            Kind::Unknown(other) => other,
        }
    }
}

/// An HTTP/2 error code, carried by RST_STREAM and GOAWAY frames.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reason(u32);

impl Reason {
    pub const NO_ERROR: Reason = Reason(0);
    pub const PROTOCOL_ERROR: Reason = Reason(1);
    pub const INTERNAL_ERROR: Reason = Reason(2);
    pub const FLOW_CONTROL_ERROR: Reason = Reason(3);
    pub const SETTINGS_TIMEOUT: Reason = Reason(4);
    pub const STREAM_CLOSED: Reason = Reason(5);
    pub const FRAME_SIZE_ERROR: Reason = Reason(6);
    pub const REFUSED_STREAM: Reason = Reason(7);
    pub const CANCEL: Reason = Reason(8);
    pub const COMPRESSION_ERROR: Reason = Reason(9);
    pub const CONNECT_ERROR: Reason = Reason(10);
    pub const ENHANCE_YOUR_CALM: Reason = Reason(11);
    pub const INADEQUATE_SECURITY: Reason = Reason(12);
    pub const HTTP_1_1_REQUIRED: Reason = Reason(13);

    pub(crate) fn from_u32(src: u32) -> Reason {
        Reason(src)
    }

    pub(crate) fn into_u32(self) -> u32 {
        self.0
    }

    pub fn description(&self) -> &'static str {
        match self.0 {
            0 => "not a result of an error",
            1 => "unspecific protocol error detected",
            2 => "unexpected internal error encountered",
            3 => "flow-control protocol violated",
            4 => "settings ACK not received in timely manner",
            5 => "received frame when stream half-closed",
            6 => "frame with invalid size",
            7 => "refused stream before processing any application logic",
            8 => "stream no longer needed",
            9 => "unable to maintain the header compression context",
            10 => "connection established in response to a CONNECT request was reset or abnormally closed",
            11 => "detected excessive load generating behavior",
            12 => "security properties do not meet minimum requirements",
            13 => "endpoint requires HTTP/1.1",
            _ => "unknown error code",
        }
    }
}

impl std::fmt::Debug for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            0 => "NO_ERROR",
            1 => "PROTOCOL_ERROR",
            2 => "INTERNAL_ERROR",
            3 => "FLOW_CONTROL_ERROR",
            4 => "SETTINGS_TIMEOUT",
            5 => "STREAM_CLOSED",
            6 => "FRAME_SIZE_ERROR",
            7 => "REFUSED_STREAM",
            8 => "CANCEL",
            9 => "COMPRESSION_ERROR",
            10 => "CONNECT_ERROR",
            11 => "ENHANCE_YOUR_CALM",
            12 => "INADEQUATE_SECURITY",
            13 => "HTTP_1_1_REQUIRED",
            _ => return write!(f, "Reason({})", self.0),
        };
        f.write_str(name)
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// A settings parameter identifier. Parameters with identifiers outside the
/// registry are ignored, as required by the RFC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
}

impl SettingId {
    pub(crate) const ALL: [SettingId; 6] = [
        SettingId::HeaderTableSize,
        SettingId::EnablePush,
        SettingId::MaxConcurrentStreams,
        SettingId::InitialWindowSize,
        SettingId::MaxFrameSize,
        SettingId::MaxHeaderListSize,
    ];

    pub(crate) fn from_u16(raw: u16) -> Option<SettingId> {
        match raw {
            1 => Some(SettingId::HeaderTableSize),
            2 => Some(SettingId::EnablePush),
            3 => Some(SettingId::MaxConcurrentStreams),
            4 => Some(SettingId::InitialWindowSize),
            5 => Some(SettingId::MaxFrameSize),
            6 => Some(SettingId::MaxHeaderListSize),
            _ => None,
        }
    }

    pub(crate) fn into_u16(self) -> u16 {
        match self {
            SettingId::HeaderTableSize => 1,
            SettingId::EnablePush => 2,
            SettingId::MaxConcurrentStreams => 3,
            SettingId::InitialWindowSize => 4,
            SettingId::MaxFrameSize => 5,
            SettingId::MaxHeaderListSize => 6,
        }
    }
}

/// The 9-octet header preceding every frame payload.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameHeader {
    pub(crate) length: u32,
    pub(crate) kind: Kind,
    pub(crate) flags: u8,
    pub(crate) stream_id: u32,
}

impl FrameHeader {
    pub(crate) fn parse(buf: &[u8; HEADER_LEN]) -> FrameHeader {
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);
        let stream_id = ((buf[5] as u32) << 24)
            | ((buf[6] as u32) << 16)
            | ((buf[7] as u32) << 8)
            | (buf[8] as u32);

        FrameHeader {
            length,
            kind: Kind::from_u8(buf[3]),
            flags: buf[4],
            // high bit is reserved
            stream_id: stream_id & MAX_STREAM_ID,
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        debug_assert!(self.length <= MAX_MAX_FRAME_SIZE);
        dst.put_u8((self.length >> 16) as u8);
        dst.put_u8((self.length >> 8) as u8);
        dst.put_u8(self.length as u8);
        dst.put_u8(self.kind.into_u8());
        dst.put_u8(self.flags);
        dst.put_u32(self.stream_id & MAX_STREAM_ID);
    }

    pub(crate) fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }

    pub(crate) fn is_end_headers(&self) -> bool {
        self.flags & flags::END_HEADERS != 0
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }
}

/// A decoded header field. Kept as raw strings because pseudo-header names
/// (`:status`, ...) are not representable in an `http::HeaderMap`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeaderField {
    pub(crate) name: String,
    pub(crate) value: String,
}

impl HeaderField {
    /// The size of an entry per RFC 7541 section 4.1.
    pub(crate) fn size(name: &[u8], value: &[u8]) -> u32 {
        name.len() as u32 + value.len() as u32 + 32
    }
}

/// An inbound frame, after HEADERS/CONTINUATION aggregation.
#[derive(Debug)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
        /// Padding octets (incl. the length octet) stripped from the
        /// payload; they still count against flow-control windows.
        pad_len: u32,
    },
    /// An aggregated HEADERS + CONTINUATION chain, HPACK-decoded.
    MetaHeaders {
        stream_id: u32,
        end_stream: bool,
        fields: Vec<HeaderField>,
    },
    Reset {
        stream_id: u32,
        code: Reason,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: Reason,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
}

/// Payload-level parse failures. All of them terminate the connection with
/// the mapped [`Reason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameError {
    BadFrameSize,
    TooMuchPadding,
    InvalidStreamId,
    InvalidAckPayload,
    PartialSettingLength,
    ZeroWindowIncrement,
}

impl FrameError {
    pub(crate) fn reason(&self) -> Reason {
        match self {
            FrameError::BadFrameSize => Reason::FRAME_SIZE_ERROR,
            _ => Reason::PROTOCOL_ERROR,
        }
    }
}

/// Strips padding from a DATA payload. Returns the data and the number of
/// padding octets (including the pad-length octet itself).
pub(crate) fn strip_padding(mut payload: Bytes) -> Result<(Bytes, u32), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::TooMuchPadding);
    }
    let pad_len = payload[0] as usize;
    if pad_len + 1 > payload.len() {
        return Err(FrameError::TooMuchPadding);
    }
    let _ = payload.split_to(1);
    payload.truncate(payload.len() - pad_len);
    Ok((payload, pad_len as u32 + 1))
}

pub(crate) fn parse_reset(header: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
    if header.stream_id == 0 {
        return Err(FrameError::InvalidStreamId);
    }
    if payload.len() != 4 {
        return Err(FrameError::BadFrameSize);
    }
    Ok(Frame::Reset {
        stream_id: header.stream_id,
        code: Reason::from_u32(u32::from_be_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ])),
    })
}

pub(crate) fn parse_settings(header: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::InvalidStreamId);
    }
    if header.is_ack() {
        if !payload.is_empty() {
            return Err(FrameError::InvalidAckPayload);
        }
        return Ok(Frame::Settings {
            ack: true,
            values: Vec::new(),
        });
    }
    if payload.len() % 6 != 0 {
        return Err(FrameError::PartialSettingLength);
    }

    let mut values = Vec::with_capacity(payload.len() / 6);
    for entry in payload.chunks_exact(6) {
        let id = u16::from_be_bytes([entry[0], entry[1]]);
        let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
        values.push((id, value));
    }
    Ok(Frame::Settings { ack: false, values })
}

pub(crate) fn parse_ping(header: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::InvalidStreamId);
    }
    if payload.len() != 8 {
        return Err(FrameError::BadFrameSize);
    }
    let mut data = [0u8; 8];
    data.copy_from_slice(payload);
    Ok(Frame::Ping {
        ack: header.is_ack(),
        payload: data,
    })
}

pub(crate) fn parse_goaway(header: &FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
    if header.stream_id != 0 {
        return Err(FrameError::InvalidStreamId);
    }
    if payload.len() < 8 {
        return Err(FrameError::BadFrameSize);
    }
    let last_stream_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
        & MAX_STREAM_ID;
    let code = Reason::from_u32(u32::from_be_bytes([
        payload[4], payload[5], payload[6], payload[7],
    ]));
    Ok(Frame::GoAway {
        last_stream_id,
        code,
        debug: payload.slice(8..),
    })
}

pub(crate) fn parse_window_update(
    header: &FrameHeader,
    payload: &[u8],
) -> Result<Frame, FrameError> {
    if payload.len() != 4 {
        return Err(FrameError::BadFrameSize);
    }
    let increment =
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & MAX_WINDOW_SIZE;
    if increment == 0 {
        return Err(FrameError::ZeroWindowIncrement);
    }
    Ok(Frame::WindowUpdate {
        stream_id: header.stream_id,
        increment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let head = FrameHeader {
            length: 0x012345,
            kind: Kind::Headers,
            flags: flags::END_HEADERS | flags::END_STREAM,
            stream_id: 77,
        };
        let mut buf = BytesMut::new();
        head.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&buf);
        let parsed = FrameHeader::parse(&raw);
        assert_eq!(parsed.length, 0x012345);
        assert_eq!(parsed.kind, Kind::Headers);
        assert!(parsed.is_end_stream());
        assert!(parsed.is_end_headers());
        assert_eq!(parsed.stream_id, 77);
    }

    #[test]
    fn reserved_bit_is_masked() {
        let raw = [0, 0, 0, 0, 0, 0x80, 0, 0, 1];
        let parsed = FrameHeader::parse(&raw);
        assert_eq!(parsed.stream_id, 1);
    }

    #[test]
    fn padding_strips_and_counts() {
        // pad length 2, data "ab", two pad octets
        let payload = Bytes::from_static(&[2, b'a', b'b', 0, 0]);
        let (data, pad) = strip_padding(payload).unwrap();
        assert_eq!(&data[..], b"ab");
        assert_eq!(pad, 3);
    }

    #[test]
    fn padding_longer_than_payload_rejected() {
        let payload = Bytes::from_static(&[9, b'a']);
        assert_eq!(
            strip_padding(payload).unwrap_err(),
            FrameError::TooMuchPadding
        );
    }

    #[test]
    fn settings_parse_rejects_stray_octets() {
        let header = FrameHeader {
            length: 7,
            kind: Kind::Settings,
            flags: 0,
            stream_id: 0,
        };
        let err = parse_settings(&header, &[0; 7]).unwrap_err();
        assert_eq!(err, FrameError::PartialSettingLength);
    }

    #[test]
    fn window_update_zero_increment_rejected() {
        let header = FrameHeader {
            length: 4,
            kind: Kind::WindowUpdate,
            flags: 0,
            stream_id: 1,
        };
        let err = parse_window_update(&header, &[0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, FrameError::ZeroWindowIncrement);
    }
}
