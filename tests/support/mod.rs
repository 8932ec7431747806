//! A scripted HTTP/2 peer for exercising the client over an in-memory
//! duplex pipe. It speaks raw frames so tests can misbehave on purpose:
//! tiny windows, GOAWAY mid-flight, data past END_STREAM, push promises.
#![allow(dead_code)]

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub mod kind {
    pub const DATA: u8 = 0;
    pub const HEADERS: u8 = 1;
    pub const RST_STREAM: u8 = 3;
    pub const SETTINGS: u8 = 4;
    pub const PUSH_PROMISE: u8 = 5;
    pub const PING: u8 = 6;
    pub const GOAWAY: u8 = 7;
    pub const WINDOW_UPDATE: u8 = 8;
    pub const CONTINUATION: u8 = 9;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
}

/// A raw frame as seen on the wire.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & flags::END_STREAM != 0
    }
}

pub struct Peer {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    decoder: fluke_hpack::Decoder<'static>,
}

impl Peer {
    pub fn new(io: DuplexStream) -> Peer {
        let (read, write) = tokio::io::split(io);
        Peer {
            read,
            write,
            decoder: fluke_hpack::Decoder::new(),
        }
    }

    /// Server side of the connection preface: consumes the client's
    /// greeting and answers with the given SETTINGS.
    pub async fn handshake(io: DuplexStream, settings: &[(u16, u32)]) -> Peer {
        let mut peer = Peer::new(io);
        peer.expect_preface().await;

        let first = peer.expect_frame(kind::SETTINGS).await;
        assert_eq!(first.flags & flags::ACK, 0, "client preface SETTINGS was an ack");
        // the client raises the connection window right after SETTINGS
        let wu = peer.expect_frame(kind::WINDOW_UPDATE).await;
        assert_eq!(wu.stream_id, 0);

        peer.send_settings(settings).await;
        let ack = peer.expect_frame(kind::SETTINGS).await;
        assert_ne!(ack.flags & flags::ACK, 0, "client did not ack our SETTINGS");
        peer.send_settings_ack().await;
        peer
    }

    pub async fn expect_preface(&mut self) {
        let mut buf = [0u8; 24];
        self.read.read_exact(&mut buf).await.expect("preface");
        assert_eq!(&buf, PREFACE, "client preface mismatch");
    }

    pub async fn read_frame(&mut self) -> Frame {
        let mut head = [0u8; 9];
        self.read.read_exact(&mut head).await.expect("frame header");
        let len = ((head[0] as usize) << 16) | ((head[1] as usize) << 8) | head[2] as usize;
        let stream_id = u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff;
        let mut payload = vec![0u8; len];
        self.read.read_exact(&mut payload).await.expect("frame payload");
        Frame {
            kind: head[3],
            flags: head[4],
            stream_id,
            payload,
        }
    }

    pub async fn expect_frame(&mut self, kind: u8) -> Frame {
        let frame = self.read_frame().await;
        assert_eq!(frame.kind, kind, "unexpected frame: {frame:?}");
        frame
    }

    /// Asserts nothing arrives within the window, e.g. "no GOAWAY, no RST".
    pub async fn expect_silence(&mut self, millis: u64) {
        let timeout = std::time::Duration::from_millis(millis);
        if let Ok(frame) = tokio::time::timeout(timeout, self.read_frame()).await {
            panic!("expected silence, peer saw {frame:?}");
        }
    }

    /// Reads a HEADERS frame (plus CONTINUATIONs) and decodes the block.
    /// Returns the stream id, decoded fields and the END_STREAM flag.
    pub async fn recv_headers(&mut self) -> (u32, Vec<(String, String)>, bool) {
        let head = self.expect_frame(kind::HEADERS).await;
        let end_stream = head.is_end_stream();
        let mut block = head.payload;
        let mut end_headers = head.flags & flags::END_HEADERS != 0;
        while !end_headers {
            let cont = self.expect_frame(kind::CONTINUATION).await;
            assert_eq!(cont.stream_id, head.stream_id);
            block.extend_from_slice(&cont.payload);
            end_headers = cont.flags & flags::END_HEADERS != 0;
        }
        let fields = self
            .decoder
            .decode(&block)
            .expect("hpack decode of client header block")
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8_lossy(&n).into_owned(),
                    String::from_utf8_lossy(&v).into_owned(),
                )
            })
            .collect();
        (head.stream_id, fields, end_stream)
    }

    pub async fn send_raw(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        let len = payload.len();
        let head = [
            (len >> 16) as u8,
            (len >> 8) as u8,
            len as u8,
            kind,
            flags,
            (stream_id >> 24) as u8,
            (stream_id >> 16) as u8,
            (stream_id >> 8) as u8,
            stream_id as u8,
        ];
        self.write.write_all(&head).await.expect("frame write");
        self.write.write_all(payload).await.expect("payload write");
        self.write.flush().await.expect("flush");
    }

    pub async fn send_settings(&mut self, values: &[(u16, u32)]) {
        let mut payload = Vec::with_capacity(values.len() * 6);
        for (id, value) in values {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        self.send_raw(kind::SETTINGS, 0, 0, &payload).await;
    }

    pub async fn send_settings_ack(&mut self) {
        self.send_raw(kind::SETTINGS, flags::ACK, 0, &[]).await;
    }

    /// Sends a response header block: `:status` plus extra fields, encoded
    /// as literals without indexing.
    pub async fn send_response(
        &mut self,
        stream_id: u32,
        status: u16,
        fields: &[(&str, &str)],
        end_stream: bool,
    ) {
        let mut block = Vec::new();
        push_literal(&mut block, ":status", &status.to_string());
        for (name, value) in fields {
            push_literal(&mut block, name, value);
        }
        let mut f = flags::END_HEADERS;
        if end_stream {
            f |= flags::END_STREAM;
        }
        self.send_raw(kind::HEADERS, f, stream_id, &block).await;
    }

    /// Sends a raw header block without `:status`, for malformed-response
    /// tests.
    pub async fn send_header_fields(
        &mut self,
        stream_id: u32,
        fields: &[(&str, &str)],
        end_stream: bool,
    ) {
        let mut block = Vec::new();
        for (name, value) in fields {
            push_literal(&mut block, name, value);
        }
        let mut f = flags::END_HEADERS;
        if end_stream {
            f |= flags::END_STREAM;
        }
        self.send_raw(kind::HEADERS, f, stream_id, &block).await;
    }

    pub async fn send_data(&mut self, stream_id: u32, payload: &[u8], end_stream: bool) {
        let f = if end_stream { flags::END_STREAM } else { 0 };
        self.send_raw(kind::DATA, f, stream_id, payload).await;
    }

    pub async fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.send_raw(kind::WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes())
            .await;
    }

    pub async fn send_rst_stream(&mut self, stream_id: u32, code: u32) {
        self.send_raw(kind::RST_STREAM, 0, stream_id, &code.to_be_bytes())
            .await;
    }

    pub async fn send_goaway(&mut self, last_stream_id: u32, code: u32) {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&last_stream_id.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        self.send_raw(kind::GOAWAY, 0, 0, &payload).await;
    }

    pub async fn send_ping(&mut self, ack: bool, payload: [u8; 8]) {
        let f = if ack { flags::ACK } else { 0 };
        self.send_raw(kind::PING, f, 0, &payload).await;
    }

    pub async fn send_push_promise(&mut self, stream_id: u32, promised: u32) {
        let payload = promised.to_be_bytes();
        self.send_raw(kind::PUSH_PROMISE, flags::END_HEADERS, stream_id, &payload)
            .await;
    }
}

/// Literal field without indexing, new name (RFC 7541 section 6.2.2).
/// Long enough for test fields; lengths stay under the 7-bit prefix.
fn push_literal(block: &mut Vec<u8>, name: &str, value: &str) {
    assert!(name.len() < 127 && value.len() < 127);
    block.push(0x00);
    block.push(name.len() as u8);
    block.extend_from_slice(name.as_bytes());
    block.push(value.len() as u8);
    block.extend_from_slice(value.as_bytes());
}

/// Finds a decoded field by name.
pub fn field<'a>(fields: &'a [(String, String)], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}
