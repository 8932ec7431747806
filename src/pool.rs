//! Per-host connection pooling.
//!
//! Connections are keyed by `host:port`. A semaphore bounds the total
//! connections per host; reusable HTTP/1.1 connections sit in an idle
//! queue, and at most one shared h2 connection per host carries any number
//! of streams. The h2 connection is tried before dialing: a draining or
//! dead one is evicted and replaced transparently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use tokio::io::BufReader;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::connect::{BoxIo, Connector, Dialed, H1Conn};
use crate::error::Error;
use crate::proto::h2;
use crate::sync::Mutex as SyncMutex;

pub(crate) struct Pool {
    hosts: SyncMutex<HashMap<String, Arc<HostPool>>>,
    max_per_host: usize,
    max_idle_per_host: usize,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("max_per_host", &self.max_per_host)
            .finish()
    }
}

/// What `acquire` hands the round-trip driver.
pub(crate) enum Checkout {
    H1(PooledConn),
    H2(h2::Stream),
}

struct HostPool {
    tickets: Arc<Semaphore>,
    idle: SyncMutex<VecDeque<IdleConn>>,
    h2: SyncMutex<Option<(h2::Connection, OwnedSemaphorePermit)>>,
    max_idle: usize,
    idle_timeout: Duration,
}

struct IdleConn {
    conn: H1Conn,
    since: Instant,
}

impl Pool {
    pub(crate) fn new(
        max_per_host: usize,
        max_idle_per_host: usize,
        idle_timeout: Duration,
    ) -> Pool {
        Pool {
            hosts: SyncMutex::new(HashMap::new()),
            max_per_host,
            max_idle_per_host,
            idle_timeout,
        }
    }

    fn host_pool(&self, key: &str) -> Arc<HostPool> {
        let mut hosts = self.hosts.lock();
        Arc::clone(hosts.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(HostPool {
                tickets: Arc::new(Semaphore::new(self.max_per_host)),
                idle: SyncMutex::new(VecDeque::new()),
                h2: SyncMutex::new(None),
                max_idle: self.max_idle_per_host,
                idle_timeout: self.idle_timeout,
            })
        }))
    }

    /// Returns a transport for `host:port`: a stream on the shared h2
    /// connection when one is alive, a pooled or freshly-dialed HTTP/1.1
    /// connection otherwise.
    pub(crate) async fn acquire(
        &self,
        connector: &Connector,
        scheme: &str,
        host: &str,
        port: u16,
    ) -> crate::Result<Checkout> {
        let key = format!("{host}:{port}");
        let pool = self.host_pool(&key);

        if let Some(conn) = pool.h2_conn() {
            if conn.is_valid() {
                match conn.open_stream().await {
                    Ok(stream) => return Ok(Checkout::H2(stream)),
                    Err(err) => {
                        debug!("h2 connection to {key} unusable ({err}), redialing");
                        pool.evict_h2(&conn);
                    }
                }
            } else {
                pool.evict_h2(&conn);
            }
        }

        let permit = Arc::clone(&pool.tickets)
            .acquire_owned()
            .await
            .map_err(|_| Error::request("connection pool closed"))?;

        if let Some(conn) = pool.pop_idle() {
            return Ok(Checkout::H1(PooledConn {
                conn: Some(conn),
                pool: Arc::clone(&pool),
                _permit: permit,
            }));
        }

        match connector.connect(scheme, host, port).await? {
            Dialed::H1(conn) => Ok(Checkout::H1(PooledConn {
                conn: Some(conn),
                pool,
                _permit: permit,
            })),
            Dialed::H2(conn) => {
                let stream = conn
                    .open_stream()
                    .await
                    .map_err(Error::request)?;
                pool.store_h2(conn, permit);
                Ok(Checkout::H2(stream))
            }
        }
    }
}

impl HostPool {
    fn h2_conn(&self) -> Option<h2::Connection> {
        self.h2.lock().as_ref().map(|(conn, _)| conn.clone())
    }

    fn store_h2(&self, conn: h2::Connection, permit: OwnedSemaphorePermit) {
        *self.h2.lock() = Some((conn, permit));
    }

    fn evict_h2(&self, dead: &h2::Connection) {
        let mut slot = self.h2.lock();
        if slot.as_ref().is_some_and(|(conn, _)| conn.same(dead)) {
            *slot = None;
        }
    }

    fn pop_idle(&self) -> Option<H1Conn> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop_front() {
            if entry.since.elapsed() <= self.idle_timeout {
                return Some(entry.conn);
            }
            // stale: dropped, closing the socket
        }
        None
    }

    fn push_idle(&self, conn: H1Conn) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push_back(IdleConn {
                conn,
                since: Instant::now(),
            });
        }
    }
}

/// A checked-out HTTP/1.1 connection holding its pool ticket. Dropping it
/// closes the socket; [`PooledConn::release`] returns it for reuse.
pub(crate) struct PooledConn {
    conn: Option<H1Conn>,
    pool: Arc<HostPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn").finish()
    }
}

impl PooledConn {
    pub(crate) fn io(&mut self) -> &mut BufReader<BoxIo> {
        &mut self.conn.as_mut().expect("connection already released").io
    }

    /// Returns the connection to the idle queue for keep-alive reuse.
    pub(crate) fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.push_idle(conn);
        }
    }
}
