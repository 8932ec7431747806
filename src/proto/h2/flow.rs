//! Flow-control windows (RFC 9113 section 5.2).
//!
//! Each direction is tracked independently, at the connection level
//! (stream id 0) and per stream. The receive side batches refunds and
//! emits a WINDOW_UPDATE once enough credit has accumulated; the send side
//! parks writers until the peer grants credit.

use std::cmp;

use tokio::sync::Notify;

use crate::sync::Mutex;

use super::frame::MAX_WINDOW_SIZE;

/// Refunds below this threshold are batched rather than emitted.
const REFUND_THRESHOLD: u32 = 4096;

/// Receive-direction window: credit the peer still holds toward us.
#[derive(Debug)]
pub(crate) struct FlowRecv {
    /// Credit the peer may still spend sending to us.
    remaining: u32,
    /// Refunds released by the consumer but not yet sent to the peer.
    queued: u32,
}

impl FlowRecv {
    pub(crate) fn new(initial: u32) -> FlowRecv {
        FlowRecv {
            remaining: initial,
            queued: 0,
        }
    }

    /// Charges `sz` octets of received DATA against the window. Returns
    /// false when the peer overshot its credit, which the caller must treat
    /// as a FLOW_CONTROL_ERROR.
    pub(crate) fn stage(&mut self, sz: u32) -> bool {
        if self.remaining < sz {
            return false;
        }
        self.remaining -= sz;
        true
    }

    /// Returns credit to the peer once the octets left our buffers. Yields
    /// the WINDOW_UPDATE increment to emit, or 0 while refunds are still
    /// being batched.
    pub(crate) fn grant(&mut self, sz: u32) -> u32 {
        self.queued += sz;
        if self.queued < REFUND_THRESHOLD {
            return 0;
        }
        let increment = self.queued;
        debug_assert!(increment <= MAX_WINDOW_SIZE - self.remaining);
        self.queued = 0;
        self.remaining += increment;
        increment
    }
}

/// Send-direction window. The remaining credit is signed: a peer shrinking
/// INITIAL_WINDOW_SIZE can push already-open streams negative, and the
/// sender must not transmit until WINDOW_UPDATEs bring it back above zero.
#[derive(Debug)]
pub(crate) struct FlowSend {
    remaining: Mutex<i32>,
    granted: Notify,
}

impl FlowSend {
    pub(crate) fn new(initial: i32) -> FlowSend {
        FlowSend {
            remaining: Mutex::new(initial),
            granted: Notify::new(),
        }
    }

    pub(crate) fn remaining(&self) -> i32 {
        *self.remaining.lock()
    }

    /// Takes up to `want` octets of credit, waiting until the window is
    /// strictly positive. Returns the amount actually taken (at least 1).
    pub(crate) async fn take(&self, want: u32) -> u32 {
        loop {
            let granted = self.granted.notified();
            tokio::pin!(granted);
            // register before checking, so a grant between the check and
            // the await is not lost
            granted.as_mut().enable();
            {
                let mut remaining = self.remaining.lock();
                if *remaining > 0 {
                    let got = cmp::min(want as i32, *remaining);
                    *remaining -= got;
                    return got as u32;
                }
            }
            granted.await;
        }
    }

    /// Returns unused credit taken from this window but never spent, e.g.
    /// when the connection window came up short of the stream's take.
    pub(crate) fn give_back(&self, sz: u32) {
        if sz == 0 {
            return;
        }
        let mut remaining = self.remaining.lock();
        *remaining += sz as i32;
        drop(remaining);
        self.granted.notify_waiters();
    }

    /// Credits the window by `inc`, which may be negative for an
    /// INITIAL_WINDOW_SIZE shrink. Returns false when the window would
    /// exceed 2^31-1, which the caller must treat as FLOW_CONTROL_ERROR.
    pub(crate) fn put(&self, inc: i32) -> bool {
        let mut remaining = self.remaining.lock();
        match remaining.checked_add(inc) {
            Some(sum) if sum <= MAX_WINDOW_SIZE as i32 => {
                *remaining = sum;
                drop(remaining);
                self.granted.notify_waiters();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_batches_small_refunds() {
        let mut flow = FlowRecv::new(65_535);
        assert!(flow.stage(1000));
        assert_eq!(flow.grant(1000), 0);
        assert!(flow.stage(3500));
        // 1000 + 3500 crosses the threshold
        assert_eq!(flow.grant(3500), 4500);
        assert_eq!(flow.remaining, 65_535);
        assert_eq!(flow.queued, 0);
    }

    #[test]
    fn recv_rejects_overshoot() {
        let mut flow = FlowRecv::new(10);
        assert!(flow.stage(10));
        assert!(!flow.stage(1));
    }

    #[tokio::test]
    async fn send_take_clamps_to_remaining() {
        let flow = FlowSend::new(5);
        assert_eq!(flow.take(100).await, 5);
        assert_eq!(flow.remaining(), 0);
    }

    #[tokio::test]
    async fn send_take_waits_for_positive_window() {
        use std::sync::Arc;

        let flow = Arc::new(FlowSend::new(0));
        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.take(4).await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(flow.put(2));
        assert_eq!(waiter.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn send_window_can_go_negative() {
        let flow = FlowSend::new(10);
        // peer shrank INITIAL_WINDOW_SIZE by 25
        assert!(flow.put(-25));
        assert_eq!(flow.remaining(), -15);
        // WINDOW_UPDATE brings it positive again
        assert!(flow.put(20));
        assert_eq!(flow.take(100).await, 5);
    }

    #[test]
    fn send_put_detects_overflow() {
        let flow = FlowSend::new(MAX_WINDOW_SIZE as i32);
        assert!(!flow.put(1));
        assert_eq!(flow.remaining(), MAX_WINDOW_SIZE as i32);
    }
}
