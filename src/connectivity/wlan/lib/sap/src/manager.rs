// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        acl::{AclListKind, AclMode},
        acs::{ScanFailure, ScanResult},
        channel::{ChannelRegistry, NolEntry},
        config::SapConfig,
        error::SapError,
        nol_store::NolStore,
        sink::{MlmeStream, NotificationSink},
        state_machine::{SapEvent, SapSme, SapState},
        timer::{EventId, Scheduler, Time},
        MacAddr, ScanTxnId, SessionHandle,
    },
    log::{error, info, warn},
    parking_lot::Mutex,
    std::{
        collections::{BTreeSet, HashMap},
        sync::{
            atomic::{AtomicU32, Ordering},
            Arc,
        },
    },
};

pub type SessionRef = Arc<Mutex<SapSme>>;

/// All SAP sessions of one radio. The channel registry (and with it the NOL) is shared between
/// them; each session has its own lock and at most one session lock is held at a time.
pub struct SapManager {
    registry: Arc<ChannelRegistry>,
    sessions: Mutex<HashMap<SessionHandle, SessionRef>>,
    next_handle: AtomicU32,
    nol_store: Option<Box<dyn NolStore>>,
}

impl SapManager {
    /// Restores any persisted NOL entries that are still live at `now`.
    ///
    /// NOL expiries are absolute `Time`s shared by every session, so `now` and the scheduler of
    /// every session opened here must read one clock: `timer::monotonic_now` (which
    /// `StreamScheduler` uses) in production, or clones of one `ManualScheduler` in tests.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        nol_store: Option<Box<dyn NolStore>>,
        now: Time,
    ) -> Result<Self, SapError> {
        if let Some(store) = &nol_store {
            let entries = store.load(now).map_err(SapError::Persistence)?;
            for entry in entries {
                match registry.extend_nol(entry.channel, entry.expiry) {
                    Ok(expiry) => {
                        info!("Restored NOL entry for {} until {}", entry.channel, expiry)
                    }
                    Err(e) => warn!("Ignoring persisted NOL entry: {}", e),
                }
            }
        }
        Ok(SapManager {
            registry,
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            nol_store,
        })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn open_session(
        &self,
        config: SapConfig,
        notifier: Arc<dyn NotificationSink>,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<(SessionHandle, MlmeStream), SapError> {
        let (sme, mlme_stream) =
            SapSme::new(config, Arc::clone(&self.registry), notifier, scheduler)?;
        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.sessions.lock().insert(handle, Arc::new(Mutex::new(sme)));
        info!("Opened SAP session {:?}", handle);
        Ok((handle, mlme_stream))
    }

    pub fn close_session(&self, handle: SessionHandle) -> Result<(), SapError> {
        let session = self.sessions.lock().remove(&handle).ok_or(SapError::NoSuchSession(handle))?;
        let state = session.lock().state();
        if state != SapState::Disconnected {
            warn!("Closing session {:?} in {:?}", handle, state);
        }
        info!("Closed SAP session {:?}", handle);
        Ok(())
    }

    pub fn session(&self, handle: SessionHandle) -> Result<SessionRef, SapError> {
        self.sessions.lock().get(&handle).cloned().ok_or(SapError::NoSuchSession(handle))
    }

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&mut SapSme) -> Result<T, SapError>,
    ) -> Result<T, SapError> {
        let session = self.session(handle)?;
        let mut sme = session.lock();
        f(&mut sme)
    }

    /// Feeds `event` to the session. Radar indications go through `indicate_radar` so that
    /// every session on the radio sees them.
    pub fn handle_event(&self, handle: SessionHandle, event: SapEvent) -> Result<(), SapError> {
        match event {
            SapEvent::RadarIndicated { channel, at } => {
                self.indicate_radar(handle, channel, at).map(|_| ())
            }
            event => self.with_session(handle, |sme| sme.on_event(event)),
        }
    }

    pub fn state(&self, handle: SessionHandle) -> Result<SapState, SapError> {
        self.with_session(handle, |sme| Ok(sme.state()))
    }

    pub fn start(&self, handle: SessionHandle, config: SapConfig) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::StartRequested { config })
    }

    pub fn stop(&self, handle: SessionHandle) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::StopRequested)
    }

    pub fn acl_add(
        &self,
        handle: SessionHandle,
        addr: MacAddr,
        kind: AclListKind,
    ) -> Result<(), SapError> {
        self.with_session(handle, |sme| sme.acl_add(addr, kind))
    }

    pub fn acl_remove(
        &self,
        handle: SessionHandle,
        addr: &MacAddr,
        kind: AclListKind,
    ) -> Result<(), SapError> {
        self.with_session(handle, |sme| sme.acl_remove(addr, kind))
    }

    pub fn set_acl_mode(&self, handle: SessionHandle, mode: AclMode) -> Result<(), SapError> {
        self.with_session(handle, |sme| {
            sme.set_acl_mode(mode);
            Ok(())
        })
    }

    pub fn on_assoc_request(
        &self,
        handle: SessionHandle,
        addr: &MacAddr,
    ) -> Result<bool, SapError> {
        self.with_session(handle, |sme| sme.on_assoc_request(addr))
    }

    pub fn on_scan_complete(
        &self,
        handle: SessionHandle,
        txn_id: ScanTxnId,
        result: Result<Vec<ScanResult>, ScanFailure>,
    ) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::ScanComplete { txn_id, result })
    }

    pub fn on_timeout(&self, handle: SessionHandle, event_id: EventId) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::Timeout(event_id))
    }

    pub fn on_start_confirm(&self, handle: SessionHandle) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::StartConfirm)
    }

    pub fn on_start_failure(&self, handle: SessionHandle) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::StartFailure)
    }

    pub fn on_teardown_complete(&self, handle: SessionHandle) -> Result<(), SapError> {
        self.handle_event(handle, SapEvent::TeardownComplete)
    }

    /// Applies a radar indication reported by `handle`'s detector. The NOL is updated before
    /// any session reacts, every session using `channel` is moved off it, and the NOL is
    /// persisted afterwards. A `Persistence` error means the in-memory NOL is already current.
    pub fn indicate_radar(
        &self,
        handle: SessionHandle,
        channel: u8,
        now: Time,
    ) -> Result<NolEntry, SapError> {
        let reporter = self.session(handle)?;
        let entry = reporter.lock().on_radar(channel, now)?;

        let others: Vec<(SessionHandle, SessionRef)> = self
            .sessions
            .lock()
            .iter()
            .filter(|(h, _)| **h != handle)
            .map(|(h, session)| (*h, Arc::clone(session)))
            .collect();
        for (other, session) in others {
            let mut sme = session.lock();
            if sme.is_affected_by(channel) {
                info!("Radar on {} also affects session {:?}", channel, other);
                if let Err(e) = sme.on_radar(channel, now) {
                    error!("Session {:?} failed to leave channel {}: {}", other, channel, e);
                }
            }
            if let Err(e) = sme.enforce_nol_invariant() {
                error!("Session {:?}: {}", other, e);
            }
        }

        self.persist_nol(now)?;
        Ok(entry)
    }

    /// Hands the radio's unsafe channel set to every session. Sessions already running keep
    /// their channel; the set applies to their next selection.
    pub fn update_unsafe_channels(&self, channels: BTreeSet<u8>) {
        let sessions: Vec<(SessionHandle, SessionRef)> = self
            .sessions
            .lock()
            .iter()
            .map(|(h, session)| (*h, Arc::clone(session)))
            .collect();
        for (handle, session) in sessions {
            if let Err(e) = session.lock().on_event(SapEvent::UnsafeChannels(channels.clone())) {
                error!("Session {:?}: {}", handle, e);
            }
        }
    }

    pub fn nol(&self, now: Time) -> Vec<NolEntry> {
        self.registry.nol_entries(now)
    }

    fn persist_nol(&self, now: Time) -> Result<(), SapError> {
        match &self.nol_store {
            Some(store) => store.save(&self.registry.nol_entries(now), now).map_err(|e| {
                error!("Failed to persist NOL: {:#}", e);
                SapError::Persistence(e)
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            acs::AcsConfig,
            channel::{test_utils::fake_registry, Band},
            dfs::{DfsTimings, NON_OCCUPANCY_PERIOD},
            nol_store::{test_utils::FakeNolStore, JsonFileNolStore},
            sink::{notification_channel, NotificationStream},
            state_machine::{test_utils::drain, SapNotification},
            timer::{monotonic_now, ManualScheduler, StreamScheduler},
            MlmeRequest,
        },
        anyhow::format_err,
        assert_matches::assert_matches,
        std::time::Duration,
        tempfile::TempDir,
    };

    struct Session {
        handle: SessionHandle,
        mlme: MlmeStream,
        notifications: NotificationStream,
    }

    struct TestHelper {
        manager: SapManager,
        scheduler: ManualScheduler,
    }

    impl TestHelper {
        fn new() -> Self {
            Self::with_store(None)
        }

        fn with_store(store: Option<Box<dyn NolStore>>) -> Self {
            let manager =
                SapManager::new(Arc::new(fake_registry()), store, Time::ZERO).expect("manager");
            TestHelper { manager, scheduler: ManualScheduler::new() }
        }

        fn open(&self, config: SapConfig) -> Session {
            let (sink, notifications) = notification_channel();
            let (handle, mlme) = self
                .manager
                .open_session(config, Arc::new(sink), Box::new(self.scheduler.clone()))
                .expect("open session");
            Session { handle, mlme, notifications }
        }

        /// Fixed-channel start through CAC (when needed) up to `Started`.
        fn bring_up(&self, session: &mut Session, channel: u8) {
            let config = SapConfig { operating_channel: Some(channel), ..SapConfig::default() };
            self.manager.start(session.handle, config).expect("start");
            if self.manager.state(session.handle).expect("state") == SapState::DfsCacWait {
                let deadline = self.scheduler.current() + Duration::from_secs(60);
                for id in self.scheduler.advance_to(deadline) {
                    self.manager.on_timeout(session.handle, id).expect("timeout");
                }
            }
            self.manager.on_start_confirm(session.handle).expect("confirm");
            assert_eq!(self.manager.state(session.handle).expect("state"), SapState::Started);
            drain(&mut session.mlme);
            drain(&mut session.notifications);
        }
    }

    fn radar_count(notifications: &[SapNotification]) -> usize {
        notifications.iter().filter(|n| matches!(n, SapNotification::RadarDetected { .. })).count()
    }

    #[test]
    fn radar_moves_started_session() {
        let h = TestHelper::new();
        let mut s = h.open(SapConfig::default());
        h.bring_up(&mut s, 100);
        let now = h.scheduler.current();

        let entry = h.manager.indicate_radar(s.handle, 100, now).expect("radar");
        assert_eq!(entry, NolEntry { channel: 100, expiry: now + NON_OCCUPANCY_PERIOD });
        assert_eq!(h.manager.state(s.handle).expect("state"), SapState::ChannelSelect);
        assert_eq!(h.manager.nol(now), vec![entry]);
        assert_eq!(radar_count(&drain(&mut s.notifications)), 1);
    }

    #[test]
    fn w53_channel_takes_regular_cac() {
        let h = TestHelper::new();
        let mut s = h.open(SapConfig::default());
        h.manager.indicate_radar(s.handle, 52, Time::ZERO).expect("radar");
        assert_eq!(h.manager.nol(Time::from_secs(30 * 60 - 1)).len(), 1);
        assert!(h.manager.nol(Time::ZERO + NON_OCCUPANCY_PERIOD).is_empty());

        h.scheduler.advance_to(Time::ZERO + NON_OCCUPANCY_PERIOD);
        let config = SapConfig { operating_channel: Some(52), ..SapConfig::default() };
        h.manager.start(s.handle, config).expect("start");
        assert_eq!(
            drain(&mut s.notifications).pop(),
            Some(SapNotification::CacStarted { channel: 52, duration: Duration::from_secs(60) })
        );
    }

    #[test]
    fn allow_list_admission() {
        let h = TestHelper::new();
        let mut s = h.open(SapConfig::default());
        let addr_1: MacAddr = "aa:bb:cc:dd:ee:01".parse().expect("addr");
        let addr_2: MacAddr = "aa:bb:cc:dd:ee:02".parse().expect("addr");
        h.manager.set_acl_mode(s.handle, AclMode::AllowList).expect("mode");
        h.manager.acl_add(s.handle, addr_1, AclListKind::Allow).expect("add");
        h.bring_up(&mut s, 36);

        assert_matches!(h.manager.on_assoc_request(s.handle, &addr_1), Ok(true));
        assert_matches!(h.manager.on_assoc_request(s.handle, &addr_2), Ok(false));
        h.manager.acl_add(s.handle, addr_2, AclListKind::Allow).expect("add");
        assert_matches!(h.manager.on_assoc_request(s.handle, &addr_2), Ok(true));
        h.manager.acl_remove(s.handle, &addr_2, AclListKind::Allow).expect("remove");
        assert_matches!(h.manager.on_assoc_request(s.handle, &addr_2), Ok(false));
    }

    #[test]
    fn stop_during_cac_ignores_late_expiry() {
        let h = TestHelper::new();
        let s = h.open(SapConfig::default());
        let config = SapConfig { operating_channel: Some(100), ..SapConfig::default() };
        h.manager.start(s.handle, config).expect("start");
        assert_eq!(h.manager.state(s.handle).expect("state"), SapState::DfsCacWait);
        let session = h.manager.session(s.handle).expect("session");
        let cac_id = session.lock().pending_cac().map(|c| c.event_id).expect("pending CAC");

        h.manager.stop(s.handle).expect("stop");
        assert!(h.scheduler.advance_to(Time::from_secs(60)).is_empty());
        h.manager.on_timeout(s.handle, cac_id).expect("stale timeout");
        assert_eq!(h.manager.state(s.handle).expect("state"), SapState::Disconnecting);
        h.manager.on_teardown_complete(s.handle).expect("teardown");
        assert_eq!(h.manager.state(s.handle).expect("state"), SapState::Disconnected);
    }

    #[test]
    fn radar_reaches_every_session_on_the_channel() {
        let h = TestHelper::new();
        let mut a = h.open(SapConfig::default());
        let mut b = h.open(SapConfig::default());
        let mut c = h.open(SapConfig::default());
        h.bring_up(&mut a, 100);
        h.bring_up(&mut b, 100);
        h.bring_up(&mut c, 36);

        h.manager.indicate_radar(a.handle, 100, h.scheduler.current()).expect("radar");
        assert_eq!(h.manager.state(a.handle).expect("state"), SapState::ChannelSelect);
        assert_eq!(h.manager.state(b.handle).expect("state"), SapState::ChannelSelect);
        assert_eq!(h.manager.state(c.handle).expect("state"), SapState::Started);
        assert_eq!(radar_count(&drain(&mut a.notifications)), 1);
        assert_eq!(radar_count(&drain(&mut b.notifications)), 1);
        assert_eq!(radar_count(&drain(&mut c.notifications)), 0);
        assert_matches!(
            &drain(&mut b.mlme)[..],
            [MlmeRequest::SuspendBeacon, MlmeRequest::Scan { .. }]
        );
    }

    #[test]
    fn radar_from_unknown_session() {
        let h = TestHelper::new();
        assert_matches!(
            h.manager.indicate_radar(SessionHandle(42), 100, Time::ZERO),
            Err(SapError::NoSuchSession(SessionHandle(42)))
        );
        assert!(h.manager.nol(Time::ZERO).is_empty());
    }

    #[test]
    fn radar_event_is_broadcast() {
        let h = TestHelper::new();
        let mut a = h.open(SapConfig::default());
        let mut b = h.open(SapConfig::default());
        h.bring_up(&mut a, 36);
        h.bring_up(&mut b, 100);
        let radar = SapEvent::RadarIndicated { channel: 100, at: h.scheduler.current() };
        h.manager.handle_event(a.handle, radar).expect("radar");
        assert_eq!(h.manager.state(a.handle).expect("state"), SapState::Started);
        assert_eq!(h.manager.state(b.handle).expect("state"), SapState::ChannelSelect);
    }

    #[test]
    fn nol_is_saved_after_radar() {
        let store = Arc::new(FakeNolStore::default());
        struct Shared(Arc<FakeNolStore>);
        impl NolStore for Shared {
            fn load(&self, now: Time) -> Result<Vec<NolEntry>, anyhow::Error> {
                self.0.load(now)
            }
            fn save(&self, entries: &[NolEntry], now: Time) -> Result<(), anyhow::Error> {
                self.0.save(entries, now)
            }
        }
        let h = TestHelper::with_store(Some(Box::new(Shared(Arc::clone(&store)))));
        let s = h.open(SapConfig::default());
        h.manager.indicate_radar(s.handle, 120, Time::ZERO).expect("radar");
        h.manager.indicate_radar(s.handle, 52, Time::from_secs(10)).expect("radar");
        assert_eq!(*store.saves.lock(), 2);
        assert_eq!(
            *store.saved.lock(),
            vec![
                NolEntry { channel: 52, expiry: Time::from_secs(10) + NON_OCCUPANCY_PERIOD },
                NolEntry { channel: 120, expiry: Time::ZERO + NON_OCCUPANCY_PERIOD },
            ]
        );
    }

    #[test]
    fn nol_is_restored_on_construction() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nol.json");
        {
            let manager = SapManager::new(
                Arc::new(fake_registry()),
                Some(Box::new(JsonFileNolStore::new(&path))),
                Time::ZERO,
            )
            .expect("manager");
            let (sink, _notifications) = notification_channel();
            let scheduler = Box::new(ManualScheduler::new());
            let (handle, _mlme) = manager
                .open_session(SapConfig::default(), Arc::new(sink), scheduler)
                .expect("open");
            manager.indicate_radar(handle, 100, Time::ZERO).expect("radar");
        }

        let manager = SapManager::new(
            Arc::new(fake_registry()),
            Some(Box::new(JsonFileNolStore::new(&path))),
            Time::ZERO,
        )
        .expect("manager");
        let restored: Vec<u8> = manager.nol(Time::ZERO).iter().map(|e| e.channel).collect();
        assert_eq!(restored, vec![100]);
        let (sink, _notifications) = notification_channel();
        let scheduler = Box::new(ManualScheduler::new());
        let (handle, _mlme) =
            manager.open_session(SapConfig::default(), Arc::new(sink), scheduler).expect("open");
        let config = SapConfig { operating_channel: Some(100), ..SapConfig::default() };
        assert_matches!(manager.start(handle, config), Err(SapError::ChannelRestricted(100)));
    }

    #[test]
    fn persistence_failure_is_reported_after_nol_update() {
        struct BrokenStore;
        impl NolStore for BrokenStore {
            fn load(&self, _now: Time) -> Result<Vec<NolEntry>, anyhow::Error> {
                Ok(vec![])
            }
            fn save(&self, _entries: &[NolEntry], _now: Time) -> Result<(), anyhow::Error> {
                Err(format_err!("read-only filesystem"))
            }
        }
        let h = TestHelper::with_store(Some(Box::new(BrokenStore)));
        let s = h.open(SapConfig::default());
        assert_matches!(
            h.manager.indicate_radar(s.handle, 100, Time::ZERO),
            Err(SapError::Persistence(_))
        );
        assert_eq!(h.manager.nol(Time::ZERO).len(), 1);
    }

    #[test]
    fn acs_start_through_manager() {
        let h = TestHelper::new();
        let mut s = h.open(SapConfig::default());
        let config = SapConfig {
            acs: AcsConfig { band: Band::Band5Ghz, ..AcsConfig::default() },
            ..SapConfig::default()
        };
        h.manager.start(s.handle, config).expect("start");
        let txn_id = match drain(&mut s.mlme).pop() {
            Some(MlmeRequest::Scan { txn_id, .. }) => txn_id,
            other => panic!("expected scan request, got {:?}", other),
        };
        h.manager.on_scan_complete(s.handle, txn_id, Ok(vec![])).expect("scan complete");
        assert_eq!(h.manager.state(s.handle).expect("state"), SapState::Starting);
        h.manager.on_start_failure(s.handle).expect("start failure");
        assert_eq!(h.manager.state(s.handle).expect("state"), SapState::Disconnected);
    }

    #[test]
    fn sessions_on_separate_schedulers_share_the_nol() {
        let manager =
            SapManager::new(Arc::new(fake_registry()), None, monotonic_now()).expect("manager");
        let config = SapConfig {
            dfs: DfsTimings {
                non_occupancy_period: Duration::from_secs(1),
                ..DfsTimings::default()
            },
            ..SapConfig::default()
        };
        let open = |config: SapConfig| {
            let (sink, _notifications) = notification_channel();
            let (scheduler, _timeouts) = StreamScheduler::new();
            manager.open_session(config, Arc::new(sink), Box::new(scheduler)).expect("open").0
        };

        let a = open(config.clone());
        std::thread::sleep(Duration::from_millis(600));
        let b = open(config.clone());
        manager.indicate_radar(b, 36, monotonic_now()).expect("radar");
        std::thread::sleep(Duration::from_millis(500));

        // Half a second into a one second NOL, as seen from either session.
        let start = SapConfig { operating_channel: Some(36), ..config };
        assert_matches!(manager.start(a, start), Err(SapError::ChannelRestricted(36)));
        assert_eq!(manager.state(a).expect("state"), SapState::Disconnected);
    }

    #[test]
    fn unsafe_channels_reach_every_session() {
        let h = TestHelper::new();
        let mut a = h.open(SapConfig::default());
        let mut b = h.open(SapConfig::default());
        h.manager.update_unsafe_channels(vec![36, 40].into_iter().collect());
        let config = SapConfig {
            acs: AcsConfig { band: Band::Band5Ghz, ..AcsConfig::default() },
            ..SapConfig::default()
        };
        for session in vec![&mut a, &mut b] {
            h.manager.start(session.handle, config.clone()).expect("start");
            let txn_id = match drain(&mut session.mlme).pop() {
                Some(MlmeRequest::Scan { txn_id, .. }) => txn_id,
                other => panic!("expected scan request, got {:?}", other),
            };
            h.manager.on_scan_complete(session.handle, txn_id, Ok(vec![])).expect("scan");
            let session_ref = h.manager.session(session.handle).expect("session");
            let primary = session_ref.lock().operating_channel().map(|p| p.primary);
            assert_eq!(primary, Some(44));
        }
    }

    #[test]
    fn close_session() {
        let h = TestHelper::new();
        let s = h.open(SapConfig::default());
        h.manager.close_session(s.handle).expect("close");
        assert_matches!(h.manager.state(s.handle), Err(SapError::NoSuchSession(_)));
        assert_matches!(h.manager.close_session(s.handle), Err(SapError::NoSuchSession(_)));
        let other = h.open(SapConfig::default());
        assert_ne!(other.handle, s.handle);
    }
}
