//! SETTINGS state for both endpoints.
//!
//! Two independent bags are kept: *local* (what we advertise) and *peer*
//! (what they advertise). Reads take a shared lock and hold it for as long
//! as the value is in use; the SETTINGS frame handler takes the exclusive
//! lock and keeps it until the ACK has been written, so "peer settings in
//! effect while I send this frame" is well-defined.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::frame::{
    Reason, SettingId, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE,
    MAX_WINDOW_SIZE,
};

/// A bag of the six registered settings values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settings {
    values: [u32; 6],
}

/// A single applied change, reported so the connection can propagate
/// INITIAL_WINDOW_SIZE deltas and HEADER_TABLE_SIZE updates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SettingChange {
    pub(crate) id: SettingId,
    pub(crate) old: u32,
    pub(crate) new: u32,
}

impl Settings {
    /// The values this client advertises.
    pub(crate) fn local_default() -> Settings {
        let mut s = Settings { values: [0; 6] };
        s.set(SettingId::HeaderTableSize, 4096);
        s.set(SettingId::EnablePush, 0);
        s.set(SettingId::MaxConcurrentStreams, 1000);
        s.set(SettingId::InitialWindowSize, 4 << 20);
        // 16 MiB clamped by the wire format's 2^24-1 ceiling
        s.set(SettingId::MaxFrameSize, MAX_MAX_FRAME_SIZE);
        s.set(SettingId::MaxHeaderListSize, 10 << 20);
        s
    }

    /// RFC defaults, in effect for the peer until its SETTINGS arrives.
    pub(crate) fn peer_default() -> Settings {
        let mut s = Settings { values: [0; 6] };
        s.set(SettingId::HeaderTableSize, 4096);
        s.set(SettingId::EnablePush, 1);
        s.set(SettingId::MaxConcurrentStreams, 1000);
        s.set(SettingId::InitialWindowSize, DEFAULT_INITIAL_WINDOW_SIZE);
        s.set(SettingId::MaxFrameSize, DEFAULT_MAX_FRAME_SIZE);
        s.set(SettingId::MaxHeaderListSize, u32::MAX);
        s
    }

    pub(crate) fn get(&self, id: SettingId) -> u32 {
        self.values[id.into_u16() as usize - 1]
    }

    fn set(&mut self, id: SettingId, value: u32) {
        self.values[id.into_u16() as usize - 1] = value;
    }

    pub(crate) fn initial_window_size(&self) -> u32 {
        self.get(SettingId::InitialWindowSize)
    }

    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.get(SettingId::MaxConcurrentStreams)
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.get(SettingId::MaxFrameSize)
            .clamp(DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE)
    }

    pub(crate) fn max_header_list_size(&self) -> u32 {
        self.get(SettingId::MaxHeaderListSize)
    }

    pub(crate) fn header_table_size(&self) -> u32 {
        self.get(SettingId::HeaderTableSize)
    }

    /// All six values, for the initial SETTINGS frame.
    pub(crate) fn to_list(&self) -> Vec<(SettingId, u32)> {
        SettingId::ALL.iter().map(|id| (*id, self.get(*id))).collect()
    }

    /// Validates and applies a received SETTINGS payload, from the client's
    /// perspective. Unknown identifiers are silently ignored. Returns the
    /// changes applied, or the error code the connection must die with.
    pub(crate) fn apply(
        &mut self,
        raw: &[(u16, u32)],
    ) -> Result<Vec<SettingChange>, (Reason, &'static str)> {
        let mut changes = Vec::new();
        for &(raw_id, value) in raw {
            let id = match SettingId::from_u16(raw_id) {
                Some(id) => id,
                None => continue,
            };
            match id {
                SettingId::EnablePush => {
                    // A server never receives pushes, so it must not
                    // advertise push at a client.
                    if value != 0 {
                        return Err((Reason::PROTOCOL_ERROR, "server advertised ENABLE_PUSH"));
                    }
                }
                SettingId::InitialWindowSize => {
                    if value > MAX_WINDOW_SIZE {
                        return Err((
                            Reason::FLOW_CONTROL_ERROR,
                            "INITIAL_WINDOW_SIZE above 2^31-1",
                        ));
                    }
                }
                SettingId::MaxFrameSize => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                        return Err((Reason::PROTOCOL_ERROR, "MAX_FRAME_SIZE out of range"));
                    }
                }
                _ => {}
            }
            let old = self.get(id);
            if old != value {
                self.set(id, value);
                changes.push(SettingChange { id, old, new: value });
            }
        }
        Ok(changes)
    }
}

/// Our settings, split into the acknowledged bag and the advertised values
/// still waiting for the peer's SETTINGS ACK.
#[derive(Debug)]
pub(crate) struct LocalSettings {
    pub(crate) active: Settings,
    pub(crate) pending: Option<Settings>,
}

impl LocalSettings {
    /// The most recently advertised values. Receive-side bounds use these
    /// immediately: the peer may apply them before we see the ACK.
    pub(crate) fn advertised(&self) -> &Settings {
        self.pending.as_ref().unwrap_or(&self.active)
    }
}

/// The synchronized pair of bags shared by the reader task and senders.
#[derive(Debug)]
pub(crate) struct SettingsSync {
    peer: RwLock<Settings>,
    local: RwLock<LocalSettings>,
}

impl SettingsSync {
    pub(crate) fn new() -> SettingsSync {
        SettingsSync {
            peer: RwLock::new(Settings::peer_default()),
            local: RwLock::new(LocalSettings {
                // RFC defaults remain authoritative until the peer ACKs
                // what we advertised.
                active: Settings::peer_default(),
                pending: Some(Settings::local_default()),
            }),
        }
    }

    /// "Use this setting": the guard holds the shared lock until dropped.
    pub(crate) async fn use_peer(&self) -> RwLockReadGuard<'_, Settings> {
        self.peer.read().await
    }

    /// Exclusive access for a received SETTINGS frame. The caller must hold
    /// the guard across the mutation and the ACK write.
    pub(crate) async fn lock_peer_for_update(&self) -> RwLockWriteGuard<'_, Settings> {
        self.peer.write().await
    }

    pub(crate) async fn use_local(&self) -> RwLockReadGuard<'_, LocalSettings> {
        self.local.read().await
    }

    /// Applies the pending advertisement once the peer's ACK arrives.
    pub(crate) async fn ack_local(&self) {
        let mut local = self.local.write().await;
        if let Some(pending) = local.pending.take() {
            local.active = pending;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_ignores_unknown_ids() {
        let mut s = Settings::peer_default();
        let changes = s.apply(&[(0x0a, 7), (0xf00d, 1)]).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn apply_rejects_push_at_client() {
        let mut s = Settings::peer_default();
        let (reason, _) = s.apply(&[(2, 1)]).unwrap_err();
        assert_eq!(reason, Reason::PROTOCOL_ERROR);
    }

    #[test]
    fn apply_accepts_push_disabled() {
        let mut s = Settings::peer_default();
        s.apply(&[(2, 0)]).unwrap();
        assert_eq!(s.get(SettingId::EnablePush), 0);
    }

    #[test]
    fn apply_rejects_oversized_window() {
        let mut s = Settings::peer_default();
        let (reason, _) = s.apply(&[(4, 1 << 31)]).unwrap_err();
        assert_eq!(reason, Reason::FLOW_CONTROL_ERROR);
    }

    #[test]
    fn apply_rejects_bad_frame_size() {
        let mut s = Settings::peer_default();
        assert!(s.apply(&[(5, 1024)]).is_err());
        assert!(s.apply(&[(5, 1 << 24)]).is_err());
        assert!(s.apply(&[(5, 1 << 14)]).is_ok());
    }

    #[test]
    fn apply_reports_window_delta() {
        let mut s = Settings::peer_default();
        let changes = s.apply(&[(4, 5)]).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old, DEFAULT_INITIAL_WINDOW_SIZE);
        assert_eq!(changes[0].new, 5);
    }

    #[tokio::test]
    async fn pending_local_applies_on_ack() {
        let sync = SettingsSync::new();
        {
            let local = sync.use_local().await;
            assert_eq!(local.active.initial_window_size(), 65_535);
            assert_eq!(local.advertised().initial_window_size(), 4 << 20);
        }
        sync.ack_local().await;
        let local = sync.use_local().await;
        assert!(local.pending.is_none());
        assert_eq!(local.active.initial_window_size(), 4 << 20);
    }
}
