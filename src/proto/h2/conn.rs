//! Connection lifecycle and the per-connection reader task.
//!
//! A connection is created over an already-TLS-handshaked byte stream whose
//! ALPN negotiated "h2". The handshake writes the client preface and our
//! SETTINGS, requires the peer's first frame to be SETTINGS, then spawns the
//! single reader task that owns the read half and all frame dispatch. User
//! operations run on caller tasks and synchronize with the reader through
//! the framer mutex, the settings lock, flow-control windows and per-stream
//! channels.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};

use crate::sync::Mutex as SyncMutex;

use super::codec::{FramedRead, FramedWrite};
use super::flow::{FlowRecv, FlowSend};
use super::frame::{Frame, HeaderField, Reason, SettingId, DEFAULT_INITIAL_WINDOW_SIZE};
use super::hpack;
use super::settings::{Settings, SettingsSync};
use super::stream::Stream;
use super::{ConnStats, ConnectionError, Origin, Stats, StreamError};

/// A handle to a multiplexed h2 connection. Cheap to clone; the connection
/// lives until GOAWAY completes or the transport dies.
#[derive(Clone)]
pub struct Connection {
    pub(super) inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("h2::Connection")
            .field("valid", &self.is_valid())
            .finish()
    }
}

pub(super) struct Inner {
    /// Serializes frame writes; nothing interleaves on the wire.
    pub(super) framer: Mutex<FramedWrite>,
    /// Request-header encoder; its dynamic table is tied to wire order.
    pub(super) hpack: Mutex<hpack::Encoder>,
    pub(super) settings: SettingsSync,
    /// Connection-level send window (stream id 0).
    pub(super) send_flow: FlowSend,
    pub(super) streams: SyncMutex<StreamTable>,
    /// Wakes `open_stream` waiters when a slot frees up.
    pub(super) slots: Notify,
    /// Held from stream-id assignment until the first HEADERS frame is on
    /// the wire, so ids appear in ascending order.
    pub(super) ids: Mutex<()>,
    done: watch::Sender<Option<ConnectionError>>,
    goaway_sent: AtomicBool,
    pings: SyncMutex<HashMap<[u8; 8], oneshot::Sender<()>>>,
    ping_seq: AtomicU64,
    pub(super) stats: ConnStats,
}

pub(super) struct StreamTable {
    pub(super) map: HashMap<u32, StreamEntry>,
    /// Next odd stream id to assign.
    pub(super) next_id: u32,
    /// Open streams, including ones not yet assigned an id.
    pub(super) active: usize,
    pub(super) highest_assigned: u32,
    pub(super) remote_goaway: Option<(u32, Reason)>,
    pub(super) shutdown: bool,
}

impl StreamTable {
    /// Removes a registered stream and frees its concurrency slot. The
    /// caller must notify `slots` afterwards.
    fn remove(&mut self, id: u32) -> Option<StreamEntry> {
        let entry = self.map.remove(&id)?;
        self.active -= 1;
        Some(entry)
    }
}

pub(super) struct StreamEntry {
    pub(super) headers_tx: mpsc::Sender<ResponseHeaders>,
    /// Response-body pipe writer; dropped on END_STREAM to signal EOF.
    pub(super) body_tx: Option<mpsc::Sender<Bytes>>,
    pub(super) send_flow: Arc<FlowSend>,
    pub(super) recv_flow: FlowRecv,
    pub(super) done_tx: watch::Sender<Option<StreamError>>,
    pub(super) local_closed: bool,
    pub(super) remote_closed: bool,
    pub(super) headers_received: bool,
    /// Declared response content-length still outstanding.
    pub(super) content_remaining: Option<u64>,
}

/// The single header block a stream's headers channel carries.
#[derive(Debug)]
pub(super) struct ResponseHeaders {
    pub(super) fields: Vec<HeaderField>,
    pub(super) end_stream: bool,
}

enum DataRoute {
    Deliver {
        tx: Option<mpsc::Sender<Bytes>>,
        ended: bool,
    },
    Closed,
    Reset(Reason),
}

impl Connection {
    /// Performs the h2 connection preface over `io` and spawns the reader
    /// task. `io` must already have negotiated "h2" via ALPN.
    pub async fn handshake<T>(io: T) -> Result<Connection, ConnectionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut framer = FramedWrite::new(Box::new(write_half));
        let advertised = Settings::local_default();

        framer.write_preface().await.map_err(ConnectionError::io)?;
        framer
            .write_settings(&advertised.to_list())
            .await
            .map_err(ConnectionError::io)?;

        // SETTINGS cannot alter the connection-level window, so raise it
        // from the RFC default to our stream default explicitly.
        let extra = advertised
            .initial_window_size()
            .saturating_sub(DEFAULT_INITIAL_WINDOW_SIZE);
        if extra > 0 {
            framer
                .write_window_update(0, extra)
                .await
                .map_err(ConnectionError::io)?;
        }

        let mut framed = FramedRead::new(
            Box::new(read_half),
            advertised.max_frame_size(),
            advertised.max_header_list_size(),
        );

        let inner = Arc::new(Inner {
            framer: Mutex::new(framer),
            hpack: Mutex::new(hpack::Encoder::new(
                Settings::peer_default().header_table_size(),
            )),
            settings: SettingsSync::new(),
            send_flow: FlowSend::new(DEFAULT_INITIAL_WINDOW_SIZE as i32),
            streams: SyncMutex::new(StreamTable {
                map: HashMap::new(),
                next_id: 1,
                active: 0,
                highest_assigned: 0,
                remote_goaway: None,
                shutdown: false,
            }),
            slots: Notify::new(),
            ids: Mutex::new(()),
            done: watch::channel(None).0,
            goaway_sent: AtomicBool::new(false),
            pings: SyncMutex::new(HashMap::new()),
            ping_seq: AtomicU64::new(1),
            stats: ConnStats::default(),
        });

        // The server preface is a possibly-empty SETTINGS frame and MUST be
        // the first frame on the connection.
        match framed.read_frame().await? {
            Some(Frame::Settings { ack: false, values }) => {
                if let Err(err) = inner.handle_settings(values).await {
                    inner.mark_done(err.clone());
                    let code = err.code().unwrap_or(Reason::PROTOCOL_ERROR);
                    let mut framer = inner.framer.lock().await;
                    let _ = framer.write_goaway(0, code, b"invalid settings").await;
                    let _ = framer.shutdown().await;
                    return Err(err);
                }
            }
            _ => {
                let err = ConnectionError::local(
                    Reason::PROTOCOL_ERROR,
                    "first frame from server was not SETTINGS",
                );
                inner.mark_done(err.clone());
                let mut framer = inner.framer.lock().await;
                let _ = framer
                    .write_goaway(0, Reason::PROTOCOL_ERROR, b"expected SETTINGS preface")
                    .await;
                let _ = framer.shutdown().await;
                return Err(err);
            }
        }

        let conn_recv = FlowRecv::new(advertised.initial_window_size());
        let reader = Arc::clone(&inner);
        tokio::spawn(async move {
            let reason = reader.read_loop(framed, conn_recv).await;
            reader.shutdown(reason).await;
        });

        Ok(Connection { inner })
    }

    /// Stub: upgrading a plaintext HTTP/1.1 connection to h2c.
    pub async fn upgrade<T>(_io: T, _host: &str) -> Result<Connection, crate::Error>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Err(crate::Error::upgrade("h2c upgrade is not supported"))
    }

    /// Reserves a concurrency slot and returns a stream handle. Blocks
    /// while the peer's MAX_CONCURRENT_STREAMS is exhausted; the stream id
    /// itself is assigned lazily at the first header write.
    pub async fn open_stream(&self) -> Result<Stream, StreamError> {
        let mut done = self.inner.done.subscribe();
        loop {
            if let Some(reason) = done.borrow_and_update().clone() {
                return Err(StreamError::conn_abort(0, reason, true));
            }

            let notified = self.inner.slots.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let peer = self.inner.settings.use_peer().await;
                let max = peer.max_concurrent_streams() as usize;
                let mut table = self.inner.streams.lock();
                if table.shutdown || table.remote_goaway.is_some() {
                    drop(table);
                    drop(peer);
                    let reason = done.borrow().clone().unwrap_or_else(|| {
                        ConnectionError::local(Reason::NO_ERROR, "connection draining")
                    });
                    return Err(StreamError::conn_abort(0, reason, true));
                }
                if table.active < max {
                    table.active += 1;
                    ConnStats::add(&self.inner.stats.streams_opened, 1);
                    drop(table);
                    drop(peer);
                    return Ok(Stream::new(self.clone()));
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = done.changed() => {}
            }
        }
    }

    /// Identity comparison, for pool eviction.
    pub(crate) fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// True while the connection accepts new streams.
    pub fn is_valid(&self) -> bool {
        self.inner.done.borrow().is_none()
            && !self.inner.streams.lock().shutdown
    }

    /// Whether a request that ran on `stream_id` may be transparently
    /// re-submitted on a fresh connection: the peer's GOAWAY declared every
    /// stream above its last-stream-id unprocessed.
    pub fn should_retry(&self, stream_id: u32) -> bool {
        let table = self.inner.streams.lock();
        match table.remote_goaway {
            Some((last, _)) => stream_id > last,
            None => false,
        }
    }

    /// Graceful termination: one-shot. Records the reason, writes GOAWAY
    /// carrying the highest locally-seen stream id and closes the stream.
    pub async fn goaway(&self, code: Reason, debug: &str) -> Result<(), ConnectionError> {
        let reason = ConnectionError::local(code, debug);
        if !self.inner.mark_done(reason.clone()) {
            return Err(ConnectionError::local(
                Reason::INTERNAL_ERROR,
                "connection already terminated",
            ));
        }
        self.inner.shutdown(reason).await;
        Ok(())
    }

    /// Sends a PING and waits for the matching ACK.
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        let seq = self.inner.ping_seq.fetch_add(1, Ordering::Relaxed);
        let payload = seq.to_be_bytes();
        let (tx, rx) = oneshot::channel();
        self.inner.pings.lock().insert(payload, tx);

        let res = async {
            {
                let mut framer = self.inner.framer.lock().await;
                framer
                    .write_ping(false, payload)
                    .await
                    .map_err(|e| self.inner.fatal_io(e))?;
            }
            tokio::time::timeout(std::time::Duration::from_secs(10), rx)
                .await
                .map_err(|_| {
                    ConnectionError::io(io::Error::new(io::ErrorKind::TimedOut, "ping timed out"))
                })?
                .map_err(|_| {
                    self.inner
                        .done_reason()
                        .unwrap_or_else(|| ConnectionError::local(Reason::NO_ERROR, "closed"))
                })
        }
        .await;

        self.inner.pings.lock().remove(&payload);
        res
    }

    pub fn stats(&self) -> Stats {
        self.inner.stats.snapshot()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The reader task holds one reference and every live stream holds
        // another; at two or fewer, this was the last user-facing handle.
        if Arc::strong_count(&self.inner) > 2 || self.inner.done_reason().is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let reason =
                    ConnectionError::local(Reason::NO_ERROR, "connection no longer in use");
                if inner.mark_done(reason.clone()) {
                    inner.shutdown(reason).await;
                }
            });
        }
    }
}

impl Inner {
    pub(super) fn done_reason(&self) -> Option<ConnectionError> {
        self.done.borrow().clone()
    }

    /// Records the termination reason. Returns true on the first call.
    fn mark_done(&self, reason: ConnectionError) -> bool {
        self.done.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Marks the connection done with a transport write failure and hands
    /// the error back for propagation to the caller.
    pub(super) fn fatal_io(&self, err: io::Error) -> ConnectionError {
        let reason = ConnectionError::io(err);
        self.mark_done(reason.clone());
        reason
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut framed: FramedRead,
        mut conn_recv: FlowRecv,
    ) -> ConnectionError {
        loop {
            match framed.read_frame().await {
                Ok(Some(frame)) => {
                    if let Err(err) = self.handle_frame(frame, &mut conn_recv).await {
                        return err;
                    }
                }
                Ok(None) => {
                    // Clean EOF: normal after GOAWAY, abrupt otherwise.
                    return match self.done_reason() {
                        Some(reason) => reason,
                        None => ConnectionError::io(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "server closed the connection",
                        )),
                    };
                }
                Err(err) => return err,
            }
        }
    }

    async fn handle_frame(
        self: &Arc<Self>,
        frame: Frame,
        conn_recv: &mut FlowRecv,
    ) -> Result<(), ConnectionError> {
        match frame {
            Frame::Data {
                stream_id,
                end_stream,
                payload,
                pad_len,
            } => {
                self.handle_data(stream_id, end_stream, payload, pad_len, conn_recv)
                    .await
            }
            Frame::MetaHeaders {
                stream_id,
                end_stream,
                fields,
            } => self.handle_headers(stream_id, end_stream, fields).await,
            Frame::Reset { stream_id, code } => {
                debug!("stream {stream_id} reset by peer: {code:?}");
                self.reset_stream(stream_id, code, Origin::Remote).await
            }
            Frame::Settings { ack: true, .. } => {
                self.settings.ack_local().await;
                Ok(())
            }
            Frame::Settings { ack: false, values } => self.handle_settings(values).await,
            Frame::Ping {
                ack: false,
                payload,
            } => {
                let mut framer = self.framer.lock().await;
                framer
                    .write_ping(true, payload)
                    .await
                    .map_err(|e| self.fatal_io(e))
            }
            Frame::Ping { ack: true, payload } => {
                let waiter = self.pings.lock().remove(&payload);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => warn!("PING ack with unknown payload"),
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                self.handle_goaway(last_stream_id, code, debug);
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.handle_window_update(stream_id, increment).await,
            Frame::PushPromise { stream_id } => {
                debug!("refusing PUSH_PROMISE for stream {stream_id}");
                Err(ConnectionError::local(
                    Reason::PROTOCOL_ERROR,
                    "push is disabled",
                ))
            }
        }
    }

    async fn handle_data(
        self: &Arc<Self>,
        stream_id: u32,
        end_stream: bool,
        payload: Bytes,
        pad_len: u32,
        conn_recv: &mut FlowRecv,
    ) -> Result<(), ConnectionError> {
        let data_len = payload.len() as u32;
        let total = data_len + pad_len;

        if total > 0 && !conn_recv.stage(total) {
            return Err(ConnectionError::local(
                Reason::FLOW_CONTROL_ERROR,
                "connection flow-control window exceeded",
            ));
        }
        ConnStats::add(&self.stats.bytes_received, data_len as u64);

        // Padding is refunded immediately; it never reaches a consumer.
        if pad_len > 0 {
            let inc = conn_recv.grant(pad_len);
            if inc > 0 {
                self.write_window_update(0, inc).await?;
            }
        }

        let route = {
            let mut table = self.streams.lock();
            match table.map.get_mut(&stream_id) {
                None => {
                    if stream_id % 2 == 0 || stream_id >= table.next_id {
                        return Err(ConnectionError::local(
                            Reason::PROTOCOL_ERROR,
                            "DATA on an idle stream",
                        ));
                    }
                    DataRoute::Closed
                }
                Some(entry) => {
                    if entry.remote_closed {
                        DataRoute::Reset(Reason::PROTOCOL_ERROR)
                    } else if total > 0 && !entry.recv_flow.stage(total) {
                        DataRoute::Reset(Reason::FLOW_CONTROL_ERROR)
                    } else if entry
                        .content_remaining
                        .is_some_and(|rem| (data_len as u64) > rem)
                    {
                        // more DATA than the declared content-length
                        DataRoute::Reset(Reason::PROTOCOL_ERROR)
                    } else {
                        if let Some(rem) = entry.content_remaining.as_mut() {
                            *rem -= data_len as u64;
                        }
                        let tx = if end_stream {
                            entry.remote_closed = true;
                            entry.body_tx.take()
                        } else {
                            entry.body_tx.clone()
                        };
                        DataRoute::Deliver {
                            tx,
                            ended: end_stream,
                        }
                    }
                }
            }
        };

        match route {
            DataRoute::Closed => {
                trace!("DATA for closed stream {stream_id}, refunding");
                let inc = conn_recv.grant(data_len);
                if inc > 0 {
                    self.write_window_update(0, inc).await?;
                }
                Ok(())
            }
            DataRoute::Reset(code) => {
                // the discarded bytes still spent connection credit
                let inc = conn_recv.grant(data_len);
                if inc > 0 {
                    self.write_window_update(0, inc).await?;
                }
                self.reset_stream(stream_id, code, Origin::Local).await
            }
            DataRoute::Deliver { tx, ended } => {
                if data_len > 0 {
                    if let Some(tx) = &tx {
                        // A dropped receiver means the consumer abandoned
                        // the body; its drop guard resets the stream.
                        let _ = tx.send(payload).await;
                    }

                    // Refunds fire on the reader's write into the pipe.
                    let inc = conn_recv.grant(data_len);
                    if inc > 0 {
                        self.write_window_update(0, inc).await?;
                    }
                    let stream_inc = {
                        let mut table = self.streams.lock();
                        match table.map.get_mut(&stream_id) {
                            Some(entry) => entry.recv_flow.grant(data_len),
                            None => 0,
                        }
                    };
                    if stream_inc > 0 {
                        self.write_window_update(stream_id, stream_inc).await?;
                    }
                }
                drop(tx);
                if ended {
                    self.maybe_close(stream_id);
                }
                Ok(())
            }
        }
    }

    async fn handle_headers(
        self: &Arc<Self>,
        stream_id: u32,
        end_stream: bool,
        fields: Vec<HeaderField>,
    ) -> Result<(), ConnectionError> {
        enum Route {
            Deliver(mpsc::Sender<ResponseHeaders>),
            Ignore,
            Reset(Reason),
        }

        let route = {
            let mut table = self.streams.lock();
            match table.map.get_mut(&stream_id) {
                None => {
                    if stream_id % 2 == 0 || stream_id >= table.next_id {
                        return Err(ConnectionError::local(
                            Reason::PROTOCOL_ERROR,
                            "HEADERS on an idle stream",
                        ));
                    }
                    Route::Ignore
                }
                Some(entry) => {
                    if entry.remote_closed {
                        Route::Reset(Reason::PROTOCOL_ERROR)
                    } else if entry.headers_received {
                        // trailers are not supported
                        Route::Reset(Reason::PROTOCOL_ERROR)
                    } else {
                        match declared_content_length(&fields) {
                            Err(()) => Route::Reset(Reason::PROTOCOL_ERROR),
                            Ok(declared) => {
                                entry.headers_received = true;
                                entry.content_remaining = declared;
                                if end_stream {
                                    entry.remote_closed = true;
                                    entry.body_tx = None;
                                }
                                Route::Deliver(entry.headers_tx.clone())
                            }
                        }
                    }
                }
            }
        };

        match route {
            Route::Ignore => {
                trace!("late HEADERS for closed stream {stream_id}");
                Ok(())
            }
            Route::Reset(code) => self.reset_stream(stream_id, code, Origin::Local).await,
            Route::Deliver(tx) => {
                let _ = tx.send(ResponseHeaders { fields, end_stream }).await;
                drop(tx);
                if end_stream {
                    self.maybe_close(stream_id);
                }
                Ok(())
            }
        }
    }

    /// Applies a received SETTINGS frame and ACKs it. The peer-settings
    /// write lock is held across the mutation, the window adjustments and
    /// the ACK write, so senders either observe the old values completely
    /// or the new ones.
    pub(super) async fn handle_settings(
        self: &Arc<Self>,
        values: Vec<(u16, u32)>,
    ) -> Result<(), ConnectionError> {
        let mut peer = self.settings.lock_peer_for_update().await;
        let changes = peer
            .apply(&values)
            .map_err(|(reason, msg)| ConnectionError::local(reason, msg))?;

        for change in &changes {
            match change.id {
                SettingId::InitialWindowSize => {
                    // The delta applies to every open stream and may drive
                    // windows negative.
                    let delta = change.new as i64 - change.old as i64;
                    let table = self.streams.lock();
                    for entry in table.map.values() {
                        if !entry.send_flow.put(delta as i32) {
                            return Err(ConnectionError::local(
                                Reason::FLOW_CONTROL_ERROR,
                                "INITIAL_WINDOW_SIZE overflowed a stream window",
                            ));
                        }
                    }
                }
                SettingId::HeaderTableSize => {
                    self.hpack.lock().await.update_max_table_size(change.new);
                }
                _ => {}
            }
        }

        {
            let mut framer = self.framer.lock().await;
            framer
                .write_settings_ack()
                .await
                .map_err(|e| self.fatal_io(e))?;
        }
        drop(peer);
        Ok(())
    }

    fn handle_goaway(self: &Arc<Self>, last_stream_id: u32, code: Reason, debug: Bytes) {
        let reason = ConnectionError::remote_goaway(
            code,
            String::from_utf8_lossy(&debug).into_owned(),
            last_stream_id,
        );
        debug!("GOAWAY received: last={last_stream_id} code={code:?}");
        self.mark_done(reason.clone());

        // Streams above the peer's last-stream-id were not processed and
        // may be retried on a fresh connection. Lower ids run to completion.
        let aborted: Vec<(u32, StreamEntry)> = {
            let mut table = self.streams.lock();
            if table.remote_goaway.is_none() {
                table.remote_goaway = Some((last_stream_id, code));
            }
            let ids: Vec<u32> = table
                .map
                .keys()
                .copied()
                .filter(|id| *id > last_stream_id)
                .collect();
            ids.into_iter()
                .filter_map(|id| table.remove(id).map(|e| (id, e)))
                .collect()
        };

        for (id, entry) in aborted {
            let _ = entry
                .done_tx
                .send(Some(StreamError::conn_abort(id, reason.clone(), true)));
        }
        self.slots.notify_waiters();
    }

    async fn handle_window_update(
        self: &Arc<Self>,
        stream_id: u32,
        increment: u32,
    ) -> Result<(), ConnectionError> {
        if stream_id == 0 {
            if !self.send_flow.put(increment as i32) {
                return Err(ConnectionError::local(
                    Reason::FLOW_CONTROL_ERROR,
                    "connection window overflow",
                ));
            }
            return Ok(());
        }

        let flow = {
            let table = self.streams.lock();
            table.map.get(&stream_id).map(|e| Arc::clone(&e.send_flow))
        };
        match flow {
            Some(flow) => {
                if !flow.put(increment as i32) {
                    return self
                        .reset_stream(stream_id, Reason::FLOW_CONTROL_ERROR, Origin::Local)
                        .await;
                }
                Ok(())
            }
            // late WINDOW_UPDATE for a closed stream
            None => Ok(()),
        }
    }

    /// One-shot stream reset. Removing the table entry is the guard: once a
    /// stream has been reset (or completed) no second RST_STREAM can go out.
    pub(super) async fn reset_stream(
        self: &Arc<Self>,
        stream_id: u32,
        code: Reason,
        origin: Origin,
    ) -> Result<(), ConnectionError> {
        let entry = {
            let mut table = self.streams.lock();
            table.remove(stream_id)
        };
        let Some(entry) = entry else {
            return Ok(());
        };
        self.slots.notify_waiters();
        ConnStats::add(&self.stats.streams_reset, 1);

        let err = match origin {
            Origin::Local if code == Reason::CANCEL => StreamError::cancelled(stream_id),
            Origin::Local => StreamError::reset_local(stream_id, code),
            Origin::Remote => StreamError::reset_remote(stream_id, code),
        };
        let _ = entry.done_tx.send(Some(err));
        drop(entry);

        if origin == Origin::Local {
            let mut framer = self.framer.lock().await;
            framer
                .write_rst_stream(stream_id, code)
                .await
                .map_err(|e| self.fatal_io(e))?;
        }
        Ok(())
    }

    /// Tears a stream down without emitting RST_STREAM, for failures where
    /// the transport itself is gone.
    pub(super) fn abort_stream(self: &Arc<Self>, stream_id: u32, err: StreamError) {
        let entry = {
            let mut table = self.streams.lock();
            table.remove(stream_id)
        };
        if let Some(entry) = entry {
            let _ = entry.done_tx.send(Some(err));
            self.slots.notify_waiters();
        }
    }

    /// Retires a stream once both directions are closed.
    pub(super) fn maybe_close(self: &Arc<Self>, stream_id: u32) {
        let closed = {
            let mut table = self.streams.lock();
            let both_closed = table
                .map
                .get(&stream_id)
                .map(|e| e.local_closed && e.remote_closed)
                .unwrap_or(false);
            if both_closed {
                table.remove(stream_id);
            }
            both_closed
        };
        if closed {
            ConnStats::add(&self.stats.streams_closed, 1);
            self.slots.notify_waiters();
        }
    }

    async fn write_window_update(
        self: &Arc<Self>,
        stream_id: u32,
        increment: u32,
    ) -> Result<(), ConnectionError> {
        let mut framer = self.framer.lock().await;
        framer
            .write_window_update(stream_id, increment)
            .await
            .map_err(|e| self.fatal_io(e))
    }

    /// Terminates the connection: records the reason, sends GOAWAY if we
    /// initiated, closes the transport and aborts every remaining stream.
    async fn shutdown(self: &Arc<Self>, reason: ConnectionError) {
        self.mark_done(reason.clone());

        let initiated_here = reason.code().is_some() && !reason.is_remote();
        if initiated_here && !self.goaway_sent.swap(true, Ordering::SeqCst) {
            let last = self.streams.lock().highest_assigned;
            let code = reason.code().unwrap_or(Reason::INTERNAL_ERROR);
            let mut framer = self.framer.lock().await;
            let _ = framer.write_goaway(last, code, b"").await;
        }

        {
            let mut framer = self.framer.lock().await;
            let _ = framer.shutdown().await;
        }

        let remaining: Vec<(u32, StreamEntry)> = {
            let mut table = self.streams.lock();
            table.shutdown = true;
            table.active = 0;
            table.map.drain().collect()
        };
        debug!(
            "connection shutdown ({reason}); aborting {} streams",
            remaining.len()
        );
        for (id, entry) in remaining {
            let _ = entry
                .done_tx
                .send(Some(StreamError::conn_abort(id, reason.clone(), false)));
        }
        self.slots.notify_waiters();
    }
}

/// Extracts a declared `content-length` from a decoded field list.
/// Duplicate differing values or unparsable digits are an error.
fn declared_content_length(fields: &[HeaderField]) -> Result<Option<u64>, ()> {
    let mut declared: Option<u64> = None;
    for field in fields {
        if field.name != "content-length" {
            continue;
        }
        let value: u64 = field.value.parse().map_err(|_| ())?;
        match declared {
            Some(existing) if existing != value => return Err(()),
            _ => declared = Some(value),
        }
    }
    Ok(declared)
}
