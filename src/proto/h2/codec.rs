//! Frame-level byte codec over the connection's transport.
//!
//! The write half is owned by a mutex on the connection, making every
//! `write_*` call atomic with respect to the others: frames never
//! interleave on the wire. The read half is owned exclusively by the
//! connection's reader task, which also owns the HPACK decoder so that
//! header blocks are decoded in wire order.

use std::io;

use bytes::{Bytes, BytesMut};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::{
    self, flags, Frame, FrameHeader, HeaderField, Kind, Reason, SettingId, HEADER_LEN, PREFACE,
};
use super::hpack;
use super::ConnectionError;

pub(crate) type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// Single-owner frame reader with HEADERS/CONTINUATION aggregation.
pub(crate) struct FramedRead {
    io: ReadHalf,
    hpack: hpack::Decoder,
    /// Inbound payload bound: our advertised MAX_FRAME_SIZE.
    max_frame_size: u32,
    /// Decoded header list bound: our advertised MAX_HEADER_LIST_SIZE.
    max_header_list_size: u32,
}

/// A HEADERS frame whose block is still being continued.
struct Partial {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

impl std::fmt::Debug for FramedRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedRead")
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl FramedRead {
    pub(crate) fn new(io: ReadHalf, max_frame_size: u32, max_header_list_size: u32) -> FramedRead {
        FramedRead {
            io,
            hpack: hpack::Decoder::new(),
            max_frame_size,
            max_header_list_size,
        }
    }

    /// Reads the next frame, aggregating header blocks. Returns `None` on a
    /// clean EOF at a frame boundary.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        let mut partial: Option<Partial> = None;

        loop {
            let header = match self.read_frame_header().await? {
                Some(header) => header,
                None => {
                    if partial.is_some() {
                        return Err(ConnectionError::local(
                            Reason::PROTOCOL_ERROR,
                            "eof inside a header block",
                        ));
                    }
                    return Ok(None);
                }
            };

            trace!(
                "recv frame header kind={:?} len={} flags={:#x} stream={}",
                header.kind,
                header.length,
                header.flags,
                header.stream_id
            );

            if header.length > self.max_frame_size {
                return Err(ConnectionError::local(
                    Reason::FRAME_SIZE_ERROR,
                    "frame exceeds advertised MAX_FRAME_SIZE",
                ));
            }

            let payload = self.read_payload(header.length as usize).await?;

            // A header block owns the connection until END_HEADERS.
            if let Some(p) = partial.as_mut() {
                if header.kind != Kind::Continuation || header.stream_id != p.stream_id {
                    return Err(ConnectionError::local(
                        Reason::PROTOCOL_ERROR,
                        "HEADERS not followed by its CONTINUATION",
                    ));
                }
                p.block.extend_from_slice(&payload);
                self.check_block_len(p.block.len())?;
                if header.is_end_headers() {
                    let p = partial.take().unwrap();
                    return Ok(Some(self.finish_headers(p)?));
                }
                continue;
            }

            match header.kind {
                Kind::Data => {
                    if header.stream_id == 0 {
                        return Err(ConnectionError::local(
                            Reason::PROTOCOL_ERROR,
                            "DATA on stream 0",
                        ));
                    }
                    let (data, pad_len) = if header.flags & flags::PADDED != 0 {
                        frame::strip_padding(payload)
                            .map_err(|e| ConnectionError::local(e.reason(), "bad DATA padding"))?
                    } else {
                        (payload, 0)
                    };
                    return Ok(Some(Frame::Data {
                        stream_id: header.stream_id,
                        end_stream: header.is_end_stream(),
                        payload: data,
                        pad_len,
                    }));
                }
                Kind::Headers => {
                    if header.stream_id == 0 {
                        return Err(ConnectionError::local(
                            Reason::PROTOCOL_ERROR,
                            "HEADERS on stream 0",
                        ));
                    }
                    let block = self.strip_headers_payload(&header, payload)?;
                    self.check_block_len(block.len())?;
                    let p = Partial {
                        stream_id: header.stream_id,
                        end_stream: header.is_end_stream(),
                        block: BytesMut::from(&block[..]),
                    };
                    if header.is_end_headers() {
                        return Ok(Some(self.finish_headers(p)?));
                    }
                    partial = Some(p);
                }
                Kind::Continuation => {
                    return Err(ConnectionError::local(
                        Reason::PROTOCOL_ERROR,
                        "CONTINUATION without preceding HEADERS",
                    ));
                }
                Kind::Reset => {
                    return Ok(Some(self.parse(frame::parse_reset(&header, &payload))?));
                }
                Kind::Settings => {
                    return Ok(Some(self.parse(frame::parse_settings(&header, &payload))?));
                }
                Kind::Ping => {
                    return Ok(Some(self.parse(frame::parse_ping(&header, &payload))?));
                }
                Kind::GoAway => {
                    return Ok(Some(self.parse(frame::parse_goaway(&header, payload))?));
                }
                Kind::WindowUpdate => {
                    return Ok(Some(self.parse(frame::parse_window_update(
                        &header, &payload,
                    ))?));
                }
                Kind::PushPromise => {
                    // Push is refused outright, so the promised block is
                    // never fed to the HPACK decoder; the connection dies
                    // before compression state matters.
                    return Ok(Some(Frame::PushPromise {
                        stream_id: header.stream_id,
                    }));
                }
                // PRIORITY is ignored, as are unregistered frame types.
                Kind::Priority | Kind::Unknown(_) => continue,
            }
        }
    }

    fn parse(&self, res: Result<Frame, frame::FrameError>) -> Result<Frame, ConnectionError> {
        res.map_err(|e| ConnectionError::local(e.reason(), "malformed frame"))
    }

    /// An undecoded block bigger than the decoded-size bound can never
    /// decode under it; cut CONTINUATION floods off early.
    fn check_block_len(&self, len: usize) -> Result<(), ConnectionError> {
        if len > self.max_header_list_size as usize {
            return Err(ConnectionError::local(
                Reason::PROTOCOL_ERROR,
                "header block exceeds MAX_HEADER_LIST_SIZE",
            ));
        }
        Ok(())
    }

    fn finish_headers(&mut self, partial: Partial) -> Result<Frame, ConnectionError> {
        let fields = self
            .hpack
            .decode(&partial.block)
            .map_err(|_| ConnectionError::local(Reason::COMPRESSION_ERROR, "hpack decode failed"))?;

        let mut total = 0u64;
        for field in &fields {
            total += HeaderField::size(field.name.as_bytes(), field.value.as_bytes()) as u64;
        }
        if total > self.max_header_list_size as u64 {
            return Err(ConnectionError::local(
                Reason::PROTOCOL_ERROR,
                "decoded header list exceeds MAX_HEADER_LIST_SIZE",
            ));
        }

        Ok(Frame::MetaHeaders {
            stream_id: partial.stream_id,
            end_stream: partial.end_stream,
            fields,
        })
    }

    fn strip_headers_payload(
        &self,
        header: &FrameHeader,
        mut payload: Bytes,
    ) -> Result<Bytes, ConnectionError> {
        if header.flags & flags::PADDED != 0 {
            let (stripped, _) = frame::strip_padding(payload)
                .map_err(|e| ConnectionError::local(e.reason(), "bad HEADERS padding"))?;
            payload = stripped;
        }
        if header.flags & flags::PRIORITY != 0 {
            // stream dependency (4) + weight (1)
            if payload.len() < 5 {
                return Err(ConnectionError::local(
                    Reason::FRAME_SIZE_ERROR,
                    "HEADERS too short for priority fields",
                ));
            }
            let _ = payload.split_to(5);
        }
        Ok(payload)
    }

    async fn read_frame_header(&mut self) -> Result<Option<FrameHeader>, ConnectionError> {
        let mut head = [0u8; HEADER_LEN];
        let mut filled = 0;
        while filled < HEADER_LEN {
            let n = self
                .io
                .read(&mut head[filled..])
                .await
                .map_err(ConnectionError::io)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ConnectionError::io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof inside a frame header",
                )));
            }
            filled += n;
        }
        Ok(Some(FrameHeader::parse(&head)))
    }

    async fn read_payload(&mut self, len: usize) -> Result<Bytes, ConnectionError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut payload = vec![0u8; len];
        self.io
            .read_exact(&mut payload)
            .await
            .map_err(ConnectionError::io)?;
        Ok(Bytes::from(payload))
    }
}

/// Mutex-serialized frame writer. One frame per call; every call flushes.
pub(crate) struct FramedWrite {
    io: WriteHalf,
    buf: BytesMut,
}

impl std::fmt::Debug for FramedWrite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedWrite").finish()
    }
}

impl FramedWrite {
    pub(crate) fn new(io: WriteHalf) -> FramedWrite {
        FramedWrite {
            io,
            buf: BytesMut::with_capacity(512),
        }
    }

    pub(crate) async fn write_preface(&mut self) -> io::Result<()> {
        self.io.write_all(PREFACE).await?;
        self.io.flush().await
    }

    async fn flush_buf(&mut self) -> io::Result<()> {
        let buf = self.buf.split();
        self.io.write_all(&buf).await?;
        self.io.flush().await
    }

    fn put_header(&mut self, kind: Kind, length: usize, flag: u8, stream_id: u32) {
        FrameHeader {
            length: length as u32,
            kind,
            flags: flag,
            stream_id,
        }
        .encode(&mut self.buf);
    }

    pub(crate) async fn write_settings(&mut self, values: &[(SettingId, u32)]) -> io::Result<()> {
        self.put_header(Kind::Settings, values.len() * 6, 0, 0);
        for (id, value) in values {
            self.buf.extend_from_slice(&id.into_u16().to_be_bytes());
            self.buf.extend_from_slice(&value.to_be_bytes());
        }
        trace!("send SETTINGS; {} values", values.len());
        self.flush_buf().await
    }

    pub(crate) async fn write_settings_ack(&mut self) -> io::Result<()> {
        self.put_header(Kind::Settings, 0, flags::ACK, 0);
        trace!("send SETTINGS ack");
        self.flush_buf().await
    }

    pub(crate) async fn write_headers(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_stream: bool,
        end_headers: bool,
    ) -> io::Result<()> {
        let mut flag = 0;
        if end_stream {
            flag |= flags::END_STREAM;
        }
        if end_headers {
            flag |= flags::END_HEADERS;
        }
        self.put_header(Kind::Headers, block.len(), flag, stream_id);
        self.buf.extend_from_slice(block);
        trace!(
            "send HEADERS; stream={stream_id} len={} end_stream={end_stream} end_headers={end_headers}",
            block.len()
        );
        self.flush_buf().await
    }

    pub(crate) async fn write_continuation(
        &mut self,
        stream_id: u32,
        block: &[u8],
        end_headers: bool,
    ) -> io::Result<()> {
        let flag = if end_headers { flags::END_HEADERS } else { 0 };
        self.put_header(Kind::Continuation, block.len(), flag, stream_id);
        self.buf.extend_from_slice(block);
        trace!("send CONTINUATION; stream={stream_id} len={}", block.len());
        self.flush_buf().await
    }

    pub(crate) async fn write_data(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        payload: &[u8],
    ) -> io::Result<()> {
        let flag = if end_stream { flags::END_STREAM } else { 0 };
        self.put_header(Kind::Data, payload.len(), flag, stream_id);
        self.buf.extend_from_slice(payload);
        trace!(
            "send DATA; stream={stream_id} len={} end_stream={end_stream}",
            payload.len()
        );
        self.flush_buf().await
    }

    pub(crate) async fn write_ping(&mut self, ack: bool, payload: [u8; 8]) -> io::Result<()> {
        let flag = if ack { flags::ACK } else { 0 };
        self.put_header(Kind::Ping, 8, flag, 0);
        self.buf.extend_from_slice(&payload);
        trace!("send PING; ack={ack}");
        self.flush_buf().await
    }

    pub(crate) async fn write_rst_stream(&mut self, stream_id: u32, code: Reason) -> io::Result<()> {
        self.put_header(Kind::Reset, 4, 0, stream_id);
        self.buf.extend_from_slice(&code.into_u32().to_be_bytes());
        trace!("send RST_STREAM; stream={stream_id} code={code:?}");
        self.flush_buf().await
    }

    pub(crate) async fn write_goaway(
        &mut self,
        last_stream_id: u32,
        code: Reason,
        debug: &[u8],
    ) -> io::Result<()> {
        self.put_header(Kind::GoAway, 8 + debug.len(), 0, 0);
        self.buf.extend_from_slice(&last_stream_id.to_be_bytes());
        self.buf.extend_from_slice(&code.into_u32().to_be_bytes());
        self.buf.extend_from_slice(debug);
        trace!("send GOAWAY; last={last_stream_id} code={code:?}");
        self.flush_buf().await
    }

    pub(crate) async fn write_window_update(
        &mut self,
        stream_id: u32,
        increment: u32,
    ) -> io::Result<()> {
        self.put_header(Kind::WindowUpdate, 4, 0, stream_id);
        self.buf.extend_from_slice(&increment.to_be_bytes());
        trace!("send WINDOW_UPDATE; stream={stream_id} inc={increment}");
        self.flush_buf().await
    }

    pub(crate) async fn shutdown(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}
