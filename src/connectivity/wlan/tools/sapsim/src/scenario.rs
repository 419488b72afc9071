// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    anyhow::{format_err, Context, Error},
    serde::Deserialize,
    std::{collections::BTreeSet, convert::TryFrom, path::PathBuf, sync::Arc, time::Duration},
    wlan_sap::{
        acs::{ScanFailure, ScanResult},
        nol_store::{JsonFileNolStore, NolStore},
        sink::{notification_channel, MlmeStream, NotificationStream},
        timer::ManualScheduler,
        AclListKind, AclMode, ChannelEntry, ChannelRegistry, MacAddr, MlmeRequest, SapConfig,
        SapEvent, SapManager, ScanTxnId, SessionHandle, Time,
    },
};

/// 2.4 GHz 1-11 and the FCC/ETSI 5 GHz channels, DFS where required.
#[rustfmt::skip]
const DEFAULT_CHANNELS: [(u8, bool); 36] = [
    (1, false), (2, false), (3, false), (4, false), (5, false), (6, false),
    (7, false), (8, false), (9, false), (10, false), (11, false),
    (36, false), (40, false), (44, false), (48, false),
    (52, true), (56, true), (60, true), (64, true),
    (100, true), (104, true), (108, true), (112, true), (116, true), (120, true),
    (124, true), (128, true), (132, true), (136, true), (140, true), (144, true),
    (149, false), (153, false), (157, false), (161, false), (165, false),
];

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ChannelSpec {
    pub channel: u8,
    #[serde(default)]
    pub dfs: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Starts the session, with the config file's settings unless overridden here.
    Start {
        #[serde(default)]
        config: Option<SapConfig>,
    },
    /// Answers the most recent scan request.
    ScanComplete {
        #[serde(default)]
        results: Vec<ScanResult>,
        #[serde(default)]
        failure: Option<ScanFailure>,
    },
    Radar { channel: u8 },
    Advance { secs: u64 },
    StartConfirm,
    StartFailure,
    Stop,
    TeardownComplete,
    AclAdd { addr: MacAddr, list: AclListKind },
    AclRemove { addr: MacAddr, list: AclListKind },
    AclMode { mode: AclMode },
    Assoc { addr: MacAddr },
    /// Replaces the radio's unsafe channel set.
    UnsafeChannels { channels: BTreeSet<u8> },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Step {
    /// Seconds since the scenario began. The clock is moved forward to this point (firing any
    /// timers that come due) before the action runs.
    #[serde(default)]
    pub at_secs: Option<u64>,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Scenario {
    #[serde(default)]
    pub channels: Option<Vec<ChannelSpec>>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).context("parsing scenario")
    }

    fn registry(&self) -> ChannelRegistry {
        match &self.channels {
            Some(channels) => {
                ChannelRegistry::new(channels.iter().map(|c| ChannelEntry::new(c.channel, c.dfs)))
            }
            None => ChannelRegistry::new(
                DEFAULT_CHANNELS.iter().map(|(channel, dfs)| ChannelEntry::new(*channel, *dfs)),
            ),
        }
    }
}

/// Runs one session through a scenario and records a transcript.
pub struct Runner {
    manager: SapManager,
    handle: SessionHandle,
    scheduler: ManualScheduler,
    mlme: MlmeStream,
    notifications: NotificationStream,
    config: SapConfig,
    last_scan: Option<ScanTxnId>,
    transcript: Vec<String>,
}

impl Runner {
    pub fn new(
        config: SapConfig,
        scenario: &Scenario,
        nol_store: Option<PathBuf>,
    ) -> Result<Self, Error> {
        let scheduler = ManualScheduler::new();
        let store =
            nol_store.map(|path| Box::new(JsonFileNolStore::new(path)) as Box<dyn NolStore>);
        let manager = SapManager::new(Arc::new(scenario.registry()), store, scheduler.current())?;
        let (sink, notifications) = notification_channel();
        let (handle, mlme) =
            manager.open_session(config.clone(), Arc::new(sink), Box::new(scheduler.clone()))?;
        Ok(Runner {
            manager,
            handle,
            scheduler,
            mlme,
            notifications,
            config,
            last_scan: None,
            transcript: vec![],
        })
    }

    pub fn run(&mut self, steps: &[Step]) -> Result<Vec<String>, Error> {
        for step in steps {
            if let Some(at_secs) = step.at_secs {
                let secs = i64::try_from(at_secs)
                    .map_err(|_| format_err!("at_secs {} is out of range", at_secs))?;
                self.advance_to(Time::from_secs(secs))?;
            }
            self.apply(&step.action)?;
            self.collect();
        }
        let state = self.manager.state(self.handle)?;
        self.record(format!("final state: {:?}", state));
        for entry in self.manager.nol(self.scheduler.current()) {
            self.record(format!("nol: channel {} until {}", entry.channel, entry.expiry));
        }
        Ok(std::mem::replace(&mut self.transcript, vec![]))
    }

    fn apply(&mut self, action: &Action) -> Result<(), Error> {
        let handle = self.handle;
        let result = match action {
            Action::Start { config } => {
                let config = config.clone().unwrap_or_else(|| self.config.clone());
                self.manager.start(handle, config)
            }
            Action::ScanComplete { results, failure } => {
                let txn_id = self.last_scan.ok_or_else(|| format_err!("no scan to complete"))?;
                let result = match failure {
                    Some(failure) => Err(*failure),
                    None => Ok(results.clone()),
                };
                self.manager.on_scan_complete(handle, txn_id, result)
            }
            Action::Radar { channel } => {
                self.manager.indicate_radar(handle, *channel, self.scheduler.current()).map(|_| ())
            }
            Action::Advance { secs } => {
                let target = self.scheduler.current() + Duration::from_secs(*secs);
                return self.advance_to(target);
            }
            Action::StartConfirm => self.manager.on_start_confirm(handle),
            Action::StartFailure => self.manager.on_start_failure(handle),
            Action::Stop => self.manager.stop(handle),
            Action::TeardownComplete => self.manager.on_teardown_complete(handle),
            Action::AclAdd { addr, list } => self.manager.acl_add(handle, *addr, *list),
            Action::AclRemove { addr, list } => self.manager.acl_remove(handle, addr, *list),
            Action::AclMode { mode } => self.manager.set_acl_mode(handle, *mode),
            Action::Assoc { addr } => self.manager.on_assoc_request(handle, addr).map(|allowed| {
                let verdict = if allowed { "allowed" } else { "refused" };
                self.record(format!("assoc {}: {}", addr, verdict));
            }),
            Action::UnsafeChannels { channels } => {
                self.manager.update_unsafe_channels(channels.clone());
                Ok(())
            }
        };
        if let Err(e) = result {
            self.record(format!("rejected ({:?}): {}", e.class(), e));
        }
        Ok(())
    }

    fn advance_to(&mut self, target: Time) -> Result<(), Error> {
        for event_id in self.scheduler.advance_to(target) {
            if let Err(e) = self.manager.handle_event(self.handle, SapEvent::Timeout(event_id)) {
                self.record(format!("timeout rejected: {}", e));
            }
            self.collect();
        }
        Ok(())
    }

    /// Moves whatever the session produced into the transcript.
    fn collect(&mut self) {
        while let Ok(Some(req)) = self.mlme.try_next() {
            if let MlmeRequest::Scan { txn_id, .. } = &req {
                self.last_scan = Some(*txn_id);
            }
            self.record(format!("-> {:?}", req));
        }
        while let Ok(Some(notification)) = self.notifications.try_next() {
            self.record(format!("<- {:?}", notification));
        }
    }

    fn record(&mut self, line: String) {
        self.transcript.push(format!("[{}] {}", self.scheduler.current(), line));
    }
}
