// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        channel::{is_etsi_weather_channel, ChannelParams, ChannelRegistry, NolEntry},
        config::duration_secs,
        error::SapError,
        timer::{EventId, Time, Timer},
    },
    log::{info, warn},
    serde::{Deserialize, Serialize},
    std::{sync::Arc, time::Duration},
};

pub const NON_OCCUPANCY_PERIOD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CAC_DURATION: Duration = Duration::from_secs(60);
pub const ETSI_WEATHER_CAC_DURATION: Duration = Duration::from_secs(10 * 60);

/// Regulatory timing. Serialized as whole seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfsTimings {
    #[serde(rename = "non_occupancy_period_secs", with = "duration_secs")]
    pub non_occupancy_period: Duration,
    #[serde(rename = "cac_secs", with = "duration_secs")]
    pub cac: Duration,
    #[serde(rename = "weather_cac_secs", with = "duration_secs")]
    pub weather_cac: Duration,
}

impl Default for DfsTimings {
    fn default() -> Self {
        DfsTimings {
            non_occupancy_period: NON_OCCUPANCY_PERIOD,
            cac: DEFAULT_CAC_DURATION,
            weather_cac: ETSI_WEATHER_CAC_DURATION,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimedEvent {
    CacExpired { channel: u8 },
}

/// A pending channel availability check.
#[derive(Clone, Debug, PartialEq)]
pub struct CacTimer {
    pub params: ChannelParams,
    pub duration: Duration,
    pub started: Time,
    pub deadline: Time,
    pub event_id: EventId,
}

impl CacTimer {
    pub fn channel(&self) -> u8 {
        self.params.primary
    }

    pub fn covers(&self, channel: u8) -> bool {
        self.params.span().contains(&channel)
    }
}

/// Owns the CAC timer of one session and writes radar findings into the radio's shared
/// non-occupancy list. The NOL is authoritative: nothing here picks a replacement channel.
pub struct Dfs {
    registry: Arc<ChannelRegistry>,
    timings: DfsTimings,
    cac: Option<CacTimer>,
}

impl Dfs {
    pub fn new(registry: Arc<ChannelRegistry>, timings: DfsTimings) -> Self {
        Dfs { registry, timings, cac: None }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn timings(&self) -> &DfsTimings {
        &self.timings
    }

    pub fn set_timings(&mut self, timings: DfsTimings) {
        self.timings = timings;
    }

    /// Puts `channel` on the NOL until `now` plus the non-occupancy period. Repeated
    /// indications only ever push the expiry further out.
    pub fn on_radar_indicated(&self, channel: u8, now: Time) -> Result<NolEntry, SapError> {
        let expiry = self.registry.extend_nol(channel, now + self.timings.non_occupancy_period)?;
        info!("Radar on channel {}; non-occupancy until {}", channel, expiry);
        Ok(NolEntry { channel, expiry })
    }

    /// False for restricted channels and for channels outside the regulatory table.
    pub fn is_channel_usable(&self, channel: u8, now: Time) -> bool {
        matches!(self.registry.is_restricted(channel, now), Ok(false))
    }

    pub fn is_span_usable(&self, params: &ChannelParams, now: Time) -> bool {
        params.span().into_iter().all(|ch| self.is_channel_usable(ch, now))
    }

    /// Fails with `ChannelRestricted` naming the first restricted channel of the span.
    pub fn check_usable(&self, params: &ChannelParams, now: Time) -> Result<(), SapError> {
        for ch in params.span() {
            if self.registry.is_restricted(ch, now)? {
                return Err(SapError::ChannelRestricted(ch));
            }
        }
        Ok(())
    }

    pub fn needs_cac(&self, params: &ChannelParams) -> Result<bool, SapError> {
        for ch in params.span() {
            if self.registry.is_dfs(ch)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The weather duration applies as soon as any bonded channel is a weather channel.
    pub fn cac_duration(&self, params: &ChannelParams) -> Duration {
        if params.span().into_iter().any(is_etsi_weather_channel) {
            self.timings.weather_cac
        } else {
            self.timings.cac
        }
    }

    pub fn start_cac(
        &mut self,
        params: &ChannelParams,
        now: Time,
        timer: &mut Timer<TimedEvent>,
    ) -> Result<CacTimer, SapError> {
        if let Some(pending) = &self.cac {
            return Err(SapError::AlreadyPending(pending.channel()));
        }
        self.check_usable(params, now)?;
        let duration = self.cac_duration(params);
        let deadline = now + duration;
        let event_id =
            timer.schedule_event(deadline, TimedEvent::CacExpired { channel: params.primary });
        let cac = CacTimer { params: params.clone(), duration, started: now, deadline, event_id };
        info!("CAC started on {} for {:?}", params, duration);
        self.cac = Some(cac.clone());
        Ok(cac)
    }

    /// Completes the pending CAC if `event_id` belongs to it. Returns `Ok(None)` for stale
    /// expiries, which the caller discards.
    pub fn on_cac_elapsed(
        &mut self,
        event_id: EventId,
        now: Time,
        timer: &mut Timer<TimedEvent>,
    ) -> Result<Option<CacTimer>, SapError> {
        let event = match timer.triggered(&event_id) {
            Some(event) => event,
            None => return Ok(None),
        };
        match self.cac.take() {
            Some(cac) if cac.event_id == event_id => {
                // Radar during the wait cancels the timer, so reaching this with a restricted
                // span means the NOL was written behind this session's back.
                self.check_usable(&cac.params, now)?;
                info!("CAC completed on {}", cac.params);
                Ok(Some(cac))
            }
            other => {
                warn!("Timer event {:?} does not match the pending CAC", event);
                self.cac = other;
                Ok(None)
            }
        }
    }

    pub fn cancel_cac(&mut self, timer: &mut Timer<TimedEvent>) -> Option<CacTimer> {
        let cac = self.cac.take()?;
        timer.cancel_event(cac.event_id);
        info!("CAC on {} cancelled", cac.params);
        Some(cac)
    }

    pub fn pending_cac(&self) -> Option<&CacTimer> {
        self.cac.as_ref()
    }

    pub fn nol(&self, now: Time) -> Vec<NolEntry> {
        self.registry.nol_entries(now)
    }
}
