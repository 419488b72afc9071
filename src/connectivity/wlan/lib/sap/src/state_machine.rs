// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        acl::{AclListKind, AclManager, AclMode},
        acs::{self, AvoidChannelInfo, Exclusions, ScanFailure, ScanResult},
        channel::{ChannelParams, ChannelRegistry, NolEntry},
        config::SapConfig,
        dfs::{CacTimer, Dfs, TimedEvent},
        error::SapError,
        sink::{MlmeSink, MlmeStream, NotificationSink},
        timer::{EventId, Scheduler, Time, Timer},
        MacAddr, MlmeRequest, ScanTxnId,
    },
    futures::channel::mpsc,
    log::{debug, error, info, warn},
    std::{collections::BTreeSet, sync::Arc, time::Duration},
};

/// Externally visible lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SapState {
    Disconnected,
    ChannelSelect,
    DfsCacWait,
    Starting,
    Started,
    Disconnecting,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SapEvent {
    StartRequested { config: SapConfig },
    ScanComplete { txn_id: ScanTxnId, result: Result<Vec<ScanResult>, ScanFailure> },
    RadarIndicated { channel: u8, at: Time },
    /// A `Timer` event came due.
    Timeout(EventId),
    StartConfirm,
    StartFailure,
    StopRequested,
    TeardownComplete,
    /// Channels a coexisting AP asked us to avoid. Replaces any earlier set.
    AvoidChannels(AvoidChannelInfo),
    /// Channels the platform marked unsafe for coexistence. Replaces any earlier set.
    UnsafeChannels(BTreeSet<u8>),
}

impl SapEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SapEvent::StartRequested { .. } => "start",
            SapEvent::ScanComplete { .. } => "scan_complete",
            SapEvent::RadarIndicated { .. } => "radar",
            SapEvent::Timeout(_) => "timeout",
            SapEvent::StartConfirm => "start_confirm",
            SapEvent::StartFailure => "start_failure",
            SapEvent::StopRequested => "stop",
            SapEvent::TeardownComplete => "teardown_complete",
            SapEvent::AvoidChannels(_) => "avoid_channels",
            SapEvent::UnsafeChannels(_) => "unsafe_channels",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartFailureReason {
    NoChannelAvailable,
    ChannelRestricted(u8),
    InvalidChannel(u8),
    MalformedScanResult,
    /// The lower layer refused to bring the BSS up.
    Rejected,
    Internal,
}

impl From<&SapError> for StartFailureReason {
    fn from(e: &SapError) -> Self {
        match e {
            SapError::NoChannelAvailable => StartFailureReason::NoChannelAvailable,
            SapError::ChannelRestricted(ch) => StartFailureReason::ChannelRestricted(*ch),
            SapError::InvalidChannel(ch) => StartFailureReason::InvalidChannel(*ch),
            SapError::MalformedScanResult(_) => StartFailureReason::MalformedScanResult,
            _ => StartFailureReason::Internal,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SapNotification {
    ChannelSelected { params: ChannelParams },
    CacStarted { channel: u8, duration: Duration },
    CacEnded { channel: u8 },
    CacAborted { channel: u8 },
    ApStarted { params: ChannelParams },
    ApStopped,
    RadarDetected { channel: u8 },
    StartFailed { reason: StartFailureReason },
}

#[derive(Clone, Debug, PartialEq)]
enum State {
    Disconnected,
    /// `scan_txn` is `None` while a fixed channel is being resolved. `radar_span` holds the
    /// channels radar drove the session off, when that is why it is selecting.
    ChannelSelect { scan_txn: Option<ScanTxnId>, radar_span: Vec<u8> },
    DfsCacWait { params: ChannelParams },
    Starting { params: ChannelParams },
    Started { params: ChannelParams },
    Disconnecting,
}

impl State {
    fn kind(&self) -> SapState {
        match self {
            State::Disconnected => SapState::Disconnected,
            State::ChannelSelect { .. } => SapState::ChannelSelect,
            State::DfsCacWait { .. } => SapState::DfsCacWait,
            State::Starting { .. } => SapState::Starting,
            State::Started { .. } => SapState::Started,
            State::Disconnecting => SapState::Disconnecting,
        }
    }

    /// Channels this session transmits on, or is about to.
    fn params(&self) -> Option<&ChannelParams> {
        match self {
            State::DfsCacWait { params }
            | State::Starting { params }
            | State::Started { params } => Some(params),
            _ => None,
        }
    }
}

pub struct Context {
    pub mlme_sink: MlmeSink,
    pub notifier: Arc<dyn NotificationSink>,
    pub(crate) timer: Timer<TimedEvent>,
    pub(crate) dfs: Dfs,
    next_scan_txn: ScanTxnId,
}

impl Context {
    fn notify(&self, notification: SapNotification) {
        debug!("notification: {:?}", notification);
        self.notifier.notify(notification);
    }

    fn now(&self) -> Time {
        self.timer.now()
    }
}

/// The state machine of a single SAP session. Every method runs to completion without
/// suspending; callers serialize access through the session lock.
pub struct SapSme {
    state: State,
    config: SapConfig,
    acl: AclManager,
    avoid: Option<AvoidChannelInfo>,
    unsafe_channels: BTreeSet<u8>,
    context: Context,
}

impl SapSme {
    pub fn new(
        config: SapConfig,
        registry: Arc<ChannelRegistry>,
        notifier: Arc<dyn NotificationSink>,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<(Self, MlmeStream), SapError> {
        let acl = config.acl.build()?;
        let (mlme_sink, mlme_stream) = mpsc::unbounded();
        let dfs = Dfs::new(registry, config.dfs.clone());
        let sme = SapSme {
            state: State::Disconnected,
            config,
            acl,
            avoid: None,
            unsafe_channels: BTreeSet::new(),
            context: Context {
                mlme_sink: MlmeSink::new(mlme_sink),
                notifier,
                timer: Timer::new(scheduler),
                dfs,
                next_scan_txn: 0,
            },
        };
        Ok((sme, mlme_stream))
    }

    pub fn state(&self) -> SapState {
        self.state.kind()
    }

    /// The operating channel, once the session has reached `Starting`.
    pub fn operating_channel(&self) -> Option<&ChannelParams> {
        match &self.state {
            State::Starting { params } | State::Started { params } => Some(params),
            _ => None,
        }
    }

    /// Whether a radar on `channel` lands on the channels this session uses.
    pub fn is_affected_by(&self, channel: u8) -> bool {
        self.state.params().map_or(false, |params| params.span().contains(&channel))
    }

    pub fn config(&self) -> &SapConfig {
        &self.config
    }

    pub fn pending_cac(&self) -> Option<&CacTimer> {
        self.context.dfs.pending_cac()
    }

    pub fn now(&self) -> Time {
        self.context.now()
    }

    pub fn nol(&self) -> Vec<NolEntry> {
        self.context.dfs.nol(self.context.now())
    }

    pub fn on_event(&mut self, event: SapEvent) -> Result<(), SapError> {
        let name = event.name();
        let result = match event {
            SapEvent::StartRequested { config } => self.on_start_requested(config),
            SapEvent::ScanComplete { txn_id, result } => self.on_scan_complete(txn_id, result),
            SapEvent::RadarIndicated { channel, at } => self.on_radar(channel, at).map(|_| ()),
            SapEvent::Timeout(event_id) => self.on_timeout(event_id),
            SapEvent::StartConfirm => self.on_start_confirm(),
            SapEvent::StartFailure => self.on_start_failure(),
            SapEvent::StopRequested => self.on_stop_requested(),
            SapEvent::TeardownComplete => self.on_teardown_complete(),
            SapEvent::AvoidChannels(info) => {
                info!("Avoid channels updated: {:?}", info.channels);
                self.avoid = Some(info);
                Ok(())
            }
            SapEvent::UnsafeChannels(channels) => {
                info!("Unsafe channels updated: {:?}", channels);
                self.unsafe_channels = channels;
                Ok(())
            }
        };
        if let Err(e) = &result {
            warn!("{} failed in {:?}: {}", name, self.state(), e);
        }
        match self.enforce_nol_invariant() {
            Ok(()) => result,
            Err(e) => Err(e),
        }
    }

    /// Admission decision for a joining client. Only meaningful while the BSS is up.
    pub fn on_assoc_request(&self, addr: &MacAddr) -> Result<bool, SapError> {
        match self.state {
            State::Started { .. } => {
                let allowed = self.acl.is_allowed(addr);
                if !allowed {
                    info!("Association from {} refused by ACL ({:?})", addr, self.acl.mode());
                }
                Ok(allowed)
            }
            _ => Err(self.invalid("assoc")),
        }
    }

    pub fn acl(&self) -> &AclManager {
        &self.acl
    }

    pub fn acl_add(&mut self, addr: MacAddr, kind: AclListKind) -> Result<(), SapError> {
        self.acl.add(addr, kind)
    }

    pub fn acl_remove(&mut self, addr: &MacAddr, kind: AclListKind) -> Result<(), SapError> {
        self.acl.remove(addr, kind)
    }

    pub fn set_acl_mode(&mut self, mode: AclMode) {
        self.acl.set_mode(mode)
    }

    fn invalid(&self, event: &'static str) -> SapError {
        SapError::InvalidTransition { state: self.state(), event }
    }

    fn set_state(&mut self, state: State) {
        if state.kind() != self.state.kind() {
            info!("SAP state {:?} -> {:?}", self.state.kind(), state.kind());
        }
        self.state = state;
    }

    fn fail_start(&mut self, e: &SapError) {
        error!("Start aborted: {}", e);
        self.context.notify(SapNotification::StartFailed { reason: e.into() });
        self.set_state(State::Disconnected);
    }

    fn on_start_requested(&mut self, config: SapConfig) -> Result<(), SapError> {
        if self.state != State::Disconnected {
            return Err(self.invalid("start"));
        }
        self.context.dfs.set_timings(config.dfs.clone());
        self.config = SapConfig { acl: self.config.acl.clone(), ..config };
        match self.config.operating_channel {
            Some(channel) => {
                self.set_state(State::ChannelSelect { scan_txn: None, radar_span: vec![] });
                let now = self.context.now();
                let registry = Arc::clone(self.context.dfs.registry());
                let selected = registry.entry(channel).and_then(|_| {
                    let params =
                        ChannelParams::for_channel(channel, self.config.channel_width, &registry);
                    self.context.dfs.check_usable(&params, now).map(|()| params)
                });
                match selected {
                    Ok(params) => self.enter_selected(params),
                    Err(e) => {
                        self.fail_start(&e);
                        Err(e)
                    }
                }
            }
            None => {
                self.request_scan(vec![]);
                Ok(())
            }
        }
    }

    fn request_scan(&mut self, radar_span: Vec<u8>) {
        self.context.next_scan_txn += 1;
        let txn_id = self.context.next_scan_txn;
        let channels = acs::scan_channels(self.context.dfs.registry(), &self.config.acs);
        debug!("ACS scan {} over {} channels", txn_id, channels.len());
        self.context.mlme_sink.send(MlmeRequest::Scan { txn_id, channels });
        self.set_state(State::ChannelSelect { scan_txn: Some(txn_id), radar_span });
    }

    /// Continues from `ChannelSelect` once a usable channel is known.
    fn enter_selected(&mut self, params: ChannelParams) -> Result<(), SapError> {
        self.context.notify(SapNotification::ChannelSelected { params: params.clone() });
        let needs_cac = match self.context.dfs.needs_cac(&params) {
            Ok(needs_cac) => needs_cac,
            Err(e) => {
                self.fail_start(&e);
                return Err(e);
            }
        };
        if !needs_cac {
            self.context.mlme_sink.send(MlmeRequest::Start { params: params.clone() });
            self.set_state(State::Starting { params });
            return Ok(());
        }
        let now = self.context.now();
        let Context { dfs, timer, .. } = &mut self.context;
        match dfs.start_cac(&params, now, timer) {
            Ok(cac) => {
                self.context.notify(SapNotification::CacStarted {
                    channel: cac.channel(),
                    duration: cac.duration,
                });
                self.set_state(State::DfsCacWait { params });
                Ok(())
            }
            Err(e) => {
                self.fail_start(&e);
                Err(e)
            }
        }
    }

    fn on_scan_complete(
        &mut self,
        txn_id: ScanTxnId,
        result: Result<Vec<ScanResult>, ScanFailure>,
    ) -> Result<(), SapError> {
        let radar_span = match &self.state {
            State::ChannelSelect { scan_txn: Some(pending), radar_span } if *pending == txn_id => {
                radar_span.clone()
            }
            _ => {
                debug!("Discarding stale scan result {} in {:?}", txn_id, self.state());
                return Ok(());
            }
        };
        let exclusions = Exclusions {
            avoid: self.avoid.clone().filter(|_| self.config.avoid_channels_enabled),
            unsafe_channels: self.unsafe_channels.clone(),
            radar_span,
        };
        let now = self.context.now();
        let dfs = &self.context.dfs;
        let (acs_config, cbw) = (&self.config.acs, self.config.channel_width);
        let selection = match result {
            Ok(results) => acs::select_channel(dfs, &results, acs_config, cbw, &exclusions, now),
            Err(failure) => {
                warn!("ACS scan {} failed: {:?}", txn_id, failure);
                acs::select_default_channel(dfs, acs_config, cbw, &exclusions, now)
            }
        };
        match selection {
            Ok(selection) => self.enter_selected(selection.params),
            Err(e) => {
                self.fail_start(&e);
                Err(e)
            }
        }
    }

    /// Records the radar in the NOL and moves the session off the channel if it was using it.
    pub(crate) fn on_radar(&mut self, channel: u8, at: Time) -> Result<NolEntry, SapError> {
        let entry = self.context.dfs.on_radar_indicated(channel, at)?;
        let radar_span = match self.state.params() {
            Some(params) if params.span().contains(&channel) => params.span(),
            _ => {
                debug!("Radar on {} does not affect this session in {:?}", channel, self.state());
                return Ok(entry);
            }
        };
        match &self.state {
            State::DfsCacWait { .. } => {
                let Context { dfs, timer, .. } = &mut self.context;
                if let Some(cac) = dfs.cancel_cac(timer) {
                    self.context.notify(SapNotification::CacAborted { channel: cac.channel() });
                }
            }
            State::Starting { .. } | State::Started { .. } => {
                self.context.mlme_sink.send(MlmeRequest::SuspendBeacon);
            }
            _ => {}
        }
        self.context.notify(SapNotification::RadarDetected { channel });
        self.request_scan(radar_span);
        Ok(entry)
    }

    fn on_timeout(&mut self, event_id: EventId) -> Result<(), SapError> {
        if !matches!(self.state, State::DfsCacWait { .. }) {
            if self.context.timer.triggered(&event_id).is_some() {
                warn!("Dropping timer event {:?} in {:?}", event_id, self.state());
            } else {
                debug!("Discarding stale timer event {:?}", event_id);
            }
            return Ok(());
        }
        let now = self.context.now();
        let Context { dfs, timer, .. } = &mut self.context;
        match dfs.on_cac_elapsed(event_id, now, timer) {
            Ok(Some(cac)) => {
                self.context.notify(SapNotification::CacEnded { channel: cac.channel() });
                self.context.mlme_sink.send(MlmeRequest::Start { params: cac.params.clone() });
                self.set_state(State::Starting { params: cac.params });
                Ok(())
            }
            Ok(None) => {
                debug!("Discarding stale timer event {:?}", event_id);
                Ok(())
            }
            Err(e) => {
                self.fail_start(&e);
                Err(e)
            }
        }
    }

    fn on_start_confirm(&mut self) -> Result<(), SapError> {
        match &self.state {
            State::Starting { params } => {
                let params = params.clone();
                info!("AP started on {}", params);
                self.context.notify(SapNotification::ApStarted { params: params.clone() });
                self.set_state(State::Started { params });
                Ok(())
            }
            _ => Err(self.invalid("start_confirm")),
        }
    }

    fn on_start_failure(&mut self) -> Result<(), SapError> {
        match self.state {
            State::Starting { .. } => {
                self.context.notify(SapNotification::StartFailed {
                    reason: StartFailureReason::Rejected,
                });
                self.set_state(State::Disconnected);
                Ok(())
            }
            _ => Err(self.invalid("start_failure")),
        }
    }

    fn on_stop_requested(&mut self) -> Result<(), SapError> {
        match self.state {
            State::Disconnected | State::Disconnecting => return Err(self.invalid("stop")),
            State::DfsCacWait { .. } => {
                let Context { dfs, timer, .. } = &mut self.context;
                if let Some(cac) = dfs.cancel_cac(timer) {
                    self.context.notify(SapNotification::CacAborted { channel: cac.channel() });
                }
            }
            State::ChannelSelect { .. } | State::Starting { .. } | State::Started { .. } => {}
        }
        self.context.mlme_sink.send(MlmeRequest::Stop);
        self.set_state(State::Disconnecting);
        Ok(())
    }

    fn on_teardown_complete(&mut self) -> Result<(), SapError> {
        match self.state {
            State::Disconnecting => {
                self.context.notify(SapNotification::ApStopped);
                self.set_state(State::Disconnected);
                Ok(())
            }
            _ => Err(self.invalid("teardown_complete")),
        }
    }

    /// Tears the session down if it transmits on a restricted channel. The radar path moves
    /// sessions away before this can happen, so hitting it means the NOL changed underneath us.
    pub fn enforce_nol_invariant(&mut self) -> Result<(), SapError> {
        let params = match &self.state {
            State::Starting { params } | State::Started { params } => params.clone(),
            _ => return Ok(()),
        };
        let now = self.context.now();
        let restricted = match self.context.dfs.check_usable(&params, now) {
            Ok(()) => return Ok(()),
            Err(SapError::ChannelRestricted(ch)) => ch,
            Err(e) => return Err(e),
        };
        error!("Operating on restricted channel {} ({}); shutting down", restricted, params);
        self.context.mlme_sink.send(MlmeRequest::Stop);
        match self.state {
            State::Starting { .. } => self.context.notify(SapNotification::StartFailed {
                reason: StartFailureReason::ChannelRestricted(restricted),
            }),
            _ => self.context.notify(SapNotification::ApStopped),
        }
        self.set_state(State::Disconnected);
        Err(SapError::Invariant(format!("operating channel {} is on the NOL", restricted)))
    }
}
