//! Stream lifecycle operations.
//!
//! A [`Stream`] is a lightweight handle; the shared state lives in the
//! connection's stream table and every operation goes back through the
//! connection. Stream ids are assigned lazily at the first header write,
//! under a lock that is held until the HEADERS frame is committed to the
//! wire, which keeps ids ascending in wire order across streams.

use std::cmp;

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use log::trace;
use tokio::sync::{mpsc, watch};

use crate::body::BodyTooLong;
use crate::error::{BoxError, Error};

use super::conn::{Connection, ResponseHeaders, StreamEntry};
use super::flow::{FlowRecv, FlowSend};
use super::frame::{HeaderField, Reason, MAX_STREAM_ID};
use super::{ConnectionError, Origin, StreamError};

/// Everything the request layer needs to emit the pseudo-headers.
#[derive(Debug)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub scheme: &'a str,
    pub authority: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
}

/// The decoded response head delivered once per stream.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub end_stream: bool,
}

/// Channel endpoints created at `open_stream`, registered into the stream
/// table once an id is assigned.
struct PendingChannels {
    headers_tx: mpsc::Sender<ResponseHeaders>,
    body_tx: mpsc::Sender<Bytes>,
    done_tx: watch::Sender<Option<StreamError>>,
}

/// Client-side handle for one logical stream.
pub struct Stream {
    conn: Connection,
    id: Option<u32>,
    headers_rx: mpsc::Receiver<ResponseHeaders>,
    body_rx: Option<mpsc::Receiver<Bytes>>,
    done_rx: watch::Receiver<Option<StreamError>>,
    pending: Option<PendingChannels>,
    finished: bool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("h2::Stream").field("id", &self.id).finish()
    }
}

/// How many response chunks the reader may buffer ahead of the consumer.
const BODY_PIPE_DEPTH: usize = 64;

impl Stream {
    pub(super) fn new(conn: Connection) -> Stream {
        // headers channel has capacity 1: exactly one block per stream
        let (headers_tx, headers_rx) = mpsc::channel(1);
        let (body_tx, body_rx) = mpsc::channel(BODY_PIPE_DEPTH);
        let (done_tx, done_rx) = watch::channel(None);
        Stream {
            conn,
            id: None,
            headers_rx,
            body_rx: Some(body_rx),
            done_rx,
            pending: Some(PendingChannels {
                headers_tx,
                body_tx,
                done_tx,
            }),
            finished: false,
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Encodes and writes the request header block: HEADERS first, sliced
    /// into CONTINUATIONs wherever the block exceeds the peer's
    /// MAX_FRAME_SIZE. `end_stream` marks a request without a body.
    pub async fn send_headers(
        &mut self,
        head: RequestHead<'_>,
        end_stream: bool,
    ) -> crate::Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| Error::request("request headers already sent"))?;

        let is_connect = head.method == Method::CONNECT;
        let mut fields: Vec<(&[u8], &[u8])> = Vec::with_capacity(head.headers.len() + 4);
        fields.push((b":method", head.method.as_str().as_bytes()));
        fields.push((b":authority", head.authority.as_bytes()));
        if !is_connect {
            fields.push((b":scheme", head.scheme.as_bytes()));
            fields.push((b":path", head.path.as_bytes()));
        }
        for (name, value) in head.headers.iter() {
            if !allowed_in_h2(name, value) {
                trace!("dropping connection-specific header {name}");
                continue;
            }
            fields.push((name.as_str().as_bytes(), value.as_bytes()));
        }

        let inner = self.conn.inner.clone();

        // Spans id assignment through the HEADERS write: ids appear on the
        // wire in ascending order.
        let ids_guard = inner.ids.lock().await;
        let peer = inner.settings.use_peer().await;

        // First pass: total size against the peer's limit.
        let mut total = 0u64;
        for (name, value) in &fields {
            total += HeaderField::size(name, value) as u64;
        }
        if total > peer.max_header_list_size() as u64 {
            return Err(Error::request(HeaderListTooLarge));
        }

        let local_initial = inner.settings.use_local().await.advertised().initial_window_size();

        // The sync stream-table lock must not be held across an `.await`, so
        // the lock-holding block below only ever produces a plain value;
        // anything that needs to await (the exhausted-ids path) happens
        // after the block, once the guard is already gone.
        enum IdOutcome {
            Assigned(u32),
            Draining(Error),
            Exhausted,
        }

        let outcome = {
            let mut table = inner.streams.lock();
            if table.shutdown || table.remote_goaway.is_some() {
                let reason = inner.done_reason().unwrap_or_else(|| {
                    ConnectionError::local(Reason::NO_ERROR, "connection draining")
                });
                IdOutcome::Draining(Error::request(StreamError::conn_abort(0, reason, true)))
            } else if table.next_id > MAX_STREAM_ID {
                IdOutcome::Exhausted
            } else {
                let id = table.next_id;
                table.next_id += 2;
                table.highest_assigned = id;
                table.map.insert(
                    id,
                    StreamEntry {
                        headers_tx: pending.headers_tx,
                        body_tx: Some(pending.body_tx),
                        send_flow: std::sync::Arc::new(FlowSend::new(
                            peer.initial_window_size() as i32,
                        )),
                        recv_flow: FlowRecv::new(local_initial),
                        done_tx: pending.done_tx,
                        local_closed: end_stream,
                        remote_closed: false,
                        headers_received: false,
                        content_remaining: None,
                    },
                );
                IdOutcome::Assigned(id)
            }
        };

        let id = match outcome {
            IdOutcome::Draining(err) => return Err(err),
            IdOutcome::Exhausted => {
                drop(peer);
                drop(ids_guard);
                // out of stream ids: this connection is spent
                let _ = self.conn.goaway(Reason::NO_ERROR, "stream ids exhausted").await;
                let reason = ConnectionError::local(Reason::NO_ERROR, "stream ids exhausted");
                return Err(Error::request(StreamError::conn_abort(0, reason, true)));
            }
            IdOutcome::Assigned(id) => id,
        };
        self.id = Some(id);

        // Second pass: the encoder consumes the fields in wire order.
        let block = {
            let mut hpack = inner.hpack.lock().await;
            hpack.encode_block(fields.iter().map(|(n, v)| (*n, *v)))
        };

        let max_frame = peer.max_frame_size() as usize;
        let mut framer = inner.framer.lock().await;
        let first_len = cmp::min(block.len(), max_frame);
        let one_slice = first_len == block.len();
        framer
            .write_headers(id, &block[..first_len], end_stream, one_slice)
            .await
            .map_err(|e| self.write_failed(id, e))?;

        let mut offset = first_len;
        while offset < block.len() {
            let end = cmp::min(offset + max_frame, block.len());
            framer
                .write_continuation(id, &block[offset..end], end == block.len())
                .await
                .map_err(|e| self.write_failed(id, e))?;
            offset = end;
        }

        Ok(())
    }

    /// Streams the request body as DATA frames, gated by both the stream
    /// and connection send windows and sliced by the peer's MAX_FRAME_SIZE.
    /// When `declared_len` is non-negative the source must produce exactly
    /// that many bytes. `last` puts END_STREAM on the final frame.
    pub async fn send_body<S>(
        &mut self,
        mut body: S,
        declared_len: i64,
        last: bool,
    ) -> crate::Result<()>
    where
        S: futures_core::Stream<Item = Result<Bytes, BoxError>> + Unpin,
    {
        let id = self
            .id
            .ok_or_else(|| Error::request("body written before headers"))?;

        let mut sent_total: u64 = 0;
        let mut end_sent = false;
        let mut current: Option<Bytes> = None;

        loop {
            // Look one chunk ahead so END_STREAM rides the final DATA frame.
            let next = loop {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        if !chunk.is_empty() {
                            break Some(chunk);
                        }
                    }
                    Some(Err(err)) => {
                        self.reset_for_write_error(id, Reason::INTERNAL_ERROR).await;
                        return Err(Error::body(err));
                    }
                    None => break None,
                }
            };

            if let Some(chunk) = next.as_ref() {
                if declared_len >= 0 && sent_total + chunk.len() as u64 > declared_len as u64 {
                    self.reset_for_write_error(id, Reason::INTERNAL_ERROR).await;
                    return Err(Error::body(BodyTooLong));
                }
            }

            if let Some(mut chunk) = current.take() {
                sent_total += chunk.len() as u64;
                let end = last && next.is_none();
                self.write_data_slices(id, &mut chunk, end).await?;
                end_sent |= end;
            }

            match next {
                Some(chunk) => current = Some(chunk),
                None => break,
            }
        }

        if declared_len >= 0 && sent_total < declared_len as u64 {
            self.reset_for_write_error(id, Reason::INTERNAL_ERROR).await;
            return Err(Error::body(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "request body ended before its declared content-length",
            )));
        }

        if last && !end_sent {
            let mut framer = self.conn.inner.framer.lock().await;
            framer
                .write_data(id, true, b"")
                .await
                .map_err(|e| self.write_failed(id, e))?;
        }

        if last {
            self.mark_local_closed(id);
        }
        Ok(())
    }

    async fn write_data_slices(
        &mut self,
        id: u32,
        data: &mut Bytes,
        end: bool,
    ) -> crate::Result<()> {
        let inner = self.conn.inner.clone();
        let stream_flow = {
            let table = inner.streams.lock();
            match table.map.get(&id) {
                Some(entry) => std::sync::Arc::clone(&entry.send_flow),
                None => return Err(Error::request(self.done_err(id))),
            }
        };

        while !data.is_empty() {
            let max_frame = { inner.settings.use_peer().await.max_frame_size() } as usize;
            let want = cmp::min(data.len(), max_frame) as u32;

            // The take is atomic across both windows: peel from the stream
            // window, then the connection window; credit the connection
            // could not match goes back to the stream, never lost.
            let stream_take = self.take_flow(&stream_flow, want).await?;
            let conn_take = self.take_flow(&inner.send_flow, stream_take).await?;
            if conn_take < stream_take {
                stream_flow.give_back(stream_take - conn_take);
            }

            let payload = data.split_to(conn_take as usize);
            let end_flag = end && data.is_empty();
            {
                let mut framer = inner.framer.lock().await;
                framer
                    .write_data(id, end_flag, &payload)
                    .await
                    .map_err(|e| self.write_failed(id, e))?;
            }
            super::ConnStats::add(&inner.stats.bytes_sent, payload.len() as u64);
        }
        Ok(())
    }

    /// Waits for send-window credit, aborting if the stream dies first.
    async fn take_flow(&mut self, flow: &FlowSend, want: u32) -> crate::Result<u32> {
        if let Some(err) = self.done_rx.borrow().clone() {
            return Err(Error::request(err));
        }
        let mut done = self.done_rx.clone();
        tokio::select! {
            got = flow.take(want) => Ok(got),
            _ = done.changed() => Err(Error::request(self.done_err(self.id.unwrap_or(0)))),
        }
    }

    /// Awaits the single response header block for this stream.
    pub async fn read_headers(&mut self) -> crate::Result<ResponseHead> {
        let mut done = self.done_rx.clone();
        let head = loop {
            tokio::select! {
                biased;
                head = self.headers_rx.recv() => match head {
                    Some(head) => break head,
                    None => return Err(Error::request(self.done_err(self.id.unwrap_or(0)))),
                },
                _ = done.changed() => {
                    // a block that raced ahead of the failure still counts
                    match self.headers_rx.try_recv() {
                        Ok(head) => break head,
                        Err(_) => return Err(Error::request(self.done_err(self.id.unwrap_or(0)))),
                    }
                }
            }
        };
        self.process_headers(head).await
    }

    async fn process_headers(&mut self, head: ResponseHeaders) -> crate::Result<ResponseHead> {
        let id = self.id.unwrap_or(0);
        let mut status: Option<StatusCode> = None;
        let mut headers = HeaderMap::with_capacity(head.fields.len());
        let mut pseudo_done = false;

        for field in &head.fields {
            if let Some(pseudo) = field.name.strip_prefix(':') {
                // pseudo-headers precede regular fields, and a response
                // carries exactly one of them
                if pseudo_done || pseudo != "status" || status.is_some() {
                    return Err(self.malformed_response(id).await);
                }
                let digits = field.value.as_bytes();
                if digits.len() != 3 || !digits.iter().all(u8::is_ascii_digit) {
                    return Err(self.malformed_response(id).await);
                }
                match StatusCode::from_bytes(digits) {
                    Ok(code) => status = Some(code),
                    Err(_) => return Err(self.malformed_response(id).await),
                }
            } else {
                pseudo_done = true;
                let name = match HeaderName::from_bytes(field.name.as_bytes()) {
                    Ok(name) => name,
                    Err(_) => return Err(self.malformed_response(id).await),
                };
                let value = match HeaderValue::from_str(&field.value) {
                    Ok(value) => value,
                    Err(_) => return Err(self.malformed_response(id).await),
                };
                headers.append(name, value);
            }
        }

        let status = match status {
            Some(status) => status,
            None => return Err(self.malformed_response(id).await),
        };

        Ok(ResponseHead {
            status,
            headers,
            end_stream: head.end_stream,
        })
    }

    async fn malformed_response(&mut self, id: u32) -> Error {
        let _ = self
            .conn
            .inner
            .reset_stream(id, Reason::PROTOCOL_ERROR, Origin::Local)
            .await;
        self.finished = true;
        Error::decode(StreamError::reset_local(id, Reason::PROTOCOL_ERROR))
    }

    /// Converts this handle into the response-body reader. The body reader
    /// takes over the cancel-on-drop duty.
    pub fn into_body(mut self) -> RecvStream {
        self.finished = true;
        RecvStream {
            conn: self.conn.clone(),
            id: self.id.unwrap_or(0),
            body_rx: self.body_rx.take().expect("body reader taken twice"),
            done_rx: self.done_rx.clone(),
            finished: false,
            failed: None,
        }
    }

    /// One-shot cancellation: emits RST_STREAM(CANCEL) if the stream is
    /// still live.
    pub async fn cancel(&mut self) {
        self.finished = true;
        if let Some(id) = self.id {
            let _ = self
                .conn
                .inner
                .reset_stream(id, Reason::CANCEL, Origin::Local)
                .await;
        } else {
            self.release_slot();
        }
    }

    fn mark_local_closed(&self, id: u32) {
        {
            let mut table = self.conn.inner.streams.lock();
            if let Some(entry) = table.map.get_mut(&id) {
                entry.local_closed = true;
            }
        }
        self.conn.inner.maybe_close(id);
    }

    /// Maps a framer I/O failure: the connection is marked done with the
    /// error and this stream's entry is torn down without an RST (the
    /// transport is gone).
    fn write_failed(&self, id: u32, err: std::io::Error) -> Error {
        let reason = self.conn.inner.fatal_io(err);
        let stream_err = StreamError::conn_abort(id, reason, false);
        self.conn.inner.abort_stream(id, stream_err.clone());
        Error::request(stream_err)
    }

    async fn reset_for_write_error(&mut self, id: u32, code: Reason) {
        self.finished = true;
        let _ = self.conn.inner.reset_stream(id, code, Origin::Local).await;
    }

    fn done_err(&self, id: u32) -> StreamError {
        match self.done_rx.borrow().clone() {
            Some(err) => err,
            None => match self.conn.inner.done_reason() {
                Some(conn) => StreamError::conn_abort(id, conn, false),
                None => StreamError::reset_local(id, Reason::INTERNAL_ERROR),
            },
        }
    }

    fn release_slot(&self) {
        let mut table = self.conn.inner.streams.lock();
        if !table.shutdown && table.active > 0 {
            table.active -= 1;
        }
        drop(table);
        self.conn.inner.slots.notify_waiters();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.id {
            Some(id) => spawn_cancel(self.conn.clone(), id),
            None => self.release_slot(),
        }
    }
}

/// Response-body reader: the caller-side end of the body pipe.
pub struct RecvStream {
    conn: Connection,
    id: u32,
    body_rx: mpsc::Receiver<Bytes>,
    done_rx: watch::Receiver<Option<StreamError>>,
    finished: bool,
    /// A failure is sticky: every read after it reports the same reason.
    failed: Option<StreamError>,
}

impl std::fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("h2::RecvStream").field("id", &self.id).finish()
    }
}

impl RecvStream {
    /// The next chunk of DATA payload, `None` at a clean END_STREAM.
    pub async fn data(&mut self) -> Option<Result<Bytes, StreamError>> {
        if let Some(err) = &self.failed {
            return Some(Err(err.clone()));
        }
        if self.finished {
            return None;
        }
        match self.body_rx.recv().await {
            Some(chunk) => Some(Ok(chunk)),
            None => {
                self.finished = true;
                // pipe closure carries either EOF or the failure reason
                self.failed = self.done_rx.borrow().clone();
                self.failed.clone().map(Err)
            }
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.id
    }
}

impl Drop for RecvStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        spawn_cancel(self.conn.clone(), self.id);
    }
}

/// Cancellation from a synchronous drop: the RST_STREAM write is async, so
/// hand it to the runtime. The stream-table entry is the one-shot guard, so
/// a completed or already-reset stream makes this a no-op.
fn spawn_cancel(conn: Connection, id: u32) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            let _ = conn
                .inner
                .reset_stream(id, Reason::CANCEL, Origin::Local)
                .await;
        });
    }
}

/// Connection-specific headers never cross into h2 (RFC 9113 section
/// 8.2.2); `host` travels as `:authority`.
fn allowed_in_h2(name: &HeaderName, value: &HeaderValue) -> bool {
    match name.as_str() {
        "connection" | "proxy-connection" | "keep-alive" | "transfer-encoding" | "upgrade"
        | "host" => false,
        "te" => value.as_bytes() == b"trailers",
        _ => true,
    }
}

#[derive(Debug)]
pub(crate) struct HeaderListTooLarge;

impl std::fmt::Display for HeaderListTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("request header list larger than the peer's advertised limit")
    }
}

impl std::error::Error for HeaderListTooLarge {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_headers_are_stripped() {
        let te_trailers = HeaderValue::from_static("trailers");
        let te_gzip = HeaderValue::from_static("gzip");
        let any = HeaderValue::from_static("x");

        assert!(allowed_in_h2(&HeaderName::from_static("accept"), &any));
        assert!(allowed_in_h2(&HeaderName::from_static("te"), &te_trailers));
        assert!(!allowed_in_h2(&HeaderName::from_static("te"), &te_gzip));
        assert!(!allowed_in_h2(&HeaderName::from_static("connection"), &any));
        assert!(!allowed_in_h2(&HeaderName::from_static("host"), &any));
        assert!(!allowed_in_h2(
            &HeaderName::from_static("transfer-encoding"),
            &any
        ));
    }
}
