// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        channel::{
            is_2ghz, is_japan_indoor, is_japan_outdoor, is_japan_w53, Band, Cbw, ChannelParams,
            ChannelRegistry,
        },
        dfs::Dfs,
        error::SapError,
        timer::Time,
        MacAddr,
    },
    log::{debug, info, warn},
    serde::{Deserialize, Serialize},
    std::collections::BTreeSet,
};

/// Score of a channel nobody else is using.
pub const ACS_WEIGHT_MAX: u32 = 10_000;
/// Cost of one co-channel BSS, before its signal strength is taken into account.
const BSS_COUNT_COST: u32 = 300;
/// Cost per dB of a co-channel BSS above -100 dBm.
const RSSI_COST_PER_DB: u32 = 20;
/// Bonus for channels in the preferred (indoor/outdoor) location set.
const PREFERRED_LOCATION_BONUS: u32 = 500;
/// How far apart two 2.4 GHz channels must be to stop interfering.
const OVERLAP_DISTANCE_2GHZ: u8 = 4;

pub const DEFAULT_2GHZ_CHANNEL: u8 = 6;
pub const DEFAULT_5GHZ_CHANNEL: u8 = 40;

const MAX_CHANNEL_NUMBER: u8 = 196;

/// One BSS heard during the ACS scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub bssid: MacAddr,
    pub channel: u8,
    pub rssi_dbm: i8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFailure {
    Timeout,
    Aborted,
    InternalError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPreference {
    None,
    Indoor,
    Outdoor,
}

impl Default for ChannelPreference {
    fn default() -> Self {
        ChannelPreference::None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcsDfsMode {
    Enable,
    Disable,
}

impl Default for AcsDfsMode {
    fn default() -> Self {
        AcsDfsMode::Enable
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcsConfig {
    pub band: Band,
    pub start_channel: u8,
    pub end_channel: u8,
    /// Restricts selection to these channels. Empty means every channel in range.
    pub channel_list: Vec<u8>,
    pub preference: ChannelPreference,
    /// Used when no candidate survives filtering or the scan failed.
    pub default_channel: Option<u8>,
    pub dfs_mode: AcsDfsMode,
    pub disable_w53: bool,
}

impl Default for AcsConfig {
    fn default() -> Self {
        AcsConfig {
            band: Band::Any,
            start_channel: 1,
            end_channel: MAX_CHANNEL_NUMBER,
            channel_list: vec![],
            preference: ChannelPreference::None,
            default_channel: None,
            dfs_mode: AcsDfsMode::Enable,
            disable_w53: false,
        }
    }
}

impl AcsConfig {
    fn in_scope(&self, channel: u8) -> bool {
        self.band.contains(channel)
            && channel >= self.start_channel
            && channel <= self.end_channel
            && (self.channel_list.is_empty() || self.channel_list.contains(&channel))
    }

    pub fn default_channel(&self) -> u8 {
        self.default_channel.unwrap_or_else(|| match self.band {
            Band::Band5Ghz => DEFAULT_5GHZ_CHANNEL,
            Band::Band2Ghz => DEFAULT_2GHZ_CHANNEL,
            Band::Any if self.start_channel > 14 => DEFAULT_5GHZ_CHANNEL,
            Band::Any => DEFAULT_2GHZ_CHANNEL,
        })
    }
}

/// Channels a coexisting peer AP asked us to stay away from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AvoidChannelInfo {
    pub channels: BTreeSet<u8>,
}

impl AvoidChannelInfo {
    pub fn contains(&self, channel: u8) -> bool {
        self.channels.contains(&channel)
    }
}

/// Channels ACS must not pick, whatever their weight.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exclusions {
    /// Peer AP avoid list. Only present while that feature is enabled.
    pub avoid: Option<AvoidChannelInfo>,
    /// Channels the platform reports as unsafe for coexistence with other radios.
    pub unsafe_channels: BTreeSet<u8>,
    /// The bonded span the session was on when radar hit it. The move that follows must leave
    /// this span entirely.
    pub radar_span: Vec<u8>,
}

impl Exclusions {
    fn reason(&self, channel: u8) -> Option<&'static str> {
        if self.radar_span.contains(&channel) {
            Some("inside the span radar was detected on")
        } else if self.unsafe_channels.contains(&channel) {
            Some("unsafe for coexistence")
        } else if self.avoid.as_ref().map_or(false, |avoid| avoid.contains(channel)) {
            Some("avoided by a coexisting AP")
        } else {
            None
        }
    }
}

/// Whether a switch to `target` after radar on `radar_span` keeps clear of every channel the
/// radar was sensed across.
pub fn is_valid_switch_target(radar_span: &[u8], target: &ChannelParams) -> bool {
    target.span().iter().all(|ch| !radar_span.contains(ch))
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcsSelection {
    pub params: ChannelParams,
    /// `None` when the default channel was used.
    pub weight: Option<u32>,
}

impl AcsSelection {
    pub fn channel(&self) -> u8 {
        self.params.primary
    }

    pub fn is_fallback(&self) -> bool {
        self.weight.is_none()
    }
}

/// The channels the ACS scan should cover.
pub fn scan_channels(registry: &ChannelRegistry, config: &AcsConfig) -> Vec<u8> {
    registry
        .list_candidate_channels(config.band)
        .into_iter()
        .map(|entry| entry.channel_number)
        .filter(|ch| config.in_scope(*ch))
        .collect()
}

fn validate(
    registry: &ChannelRegistry,
    scan_results: &[ScanResult],
    config: &AcsConfig,
) -> Result<(), SapError> {
    for result in scan_results {
        if result.channel == 0 || result.channel > MAX_CHANNEL_NUMBER {
            return Err(SapError::MalformedScanResult(format!(
                "{} reported on channel {}",
                result.bssid, result.channel
            )));
        }
        if result.rssi_dbm > 0 {
            return Err(SapError::MalformedScanResult(format!(
                "{} reported with RSSI {} dBm",
                result.bssid, result.rssi_dbm
            )));
        }
    }
    if let Some(ch) = config.channel_list.iter().find(|ch| !registry.contains(**ch)) {
        return Err(SapError::InvalidChannel(*ch));
    }
    Ok(())
}

/// Share (in tenths) of a BSS on `bss_channel` that lands on a candidate occupying `span`.
fn influence(bss_channel: u8, span: &[u8]) -> u32 {
    if span.contains(&bss_channel) {
        return 10;
    }
    if !is_2ghz(bss_channel) {
        return 0;
    }
    span.iter()
        .filter(|ch| is_2ghz(**ch))
        .map(|ch| {
            let distance = if *ch > bss_channel { ch - bss_channel } else { bss_channel - ch };
            if distance <= OVERLAP_DISTANCE_2GHZ {
                u32::from(OVERLAP_DISTANCE_2GHZ + 1 - distance) * 2
            } else {
                0
            }
        })
        .max()
        .unwrap_or(0)
}

fn weight(
    params: &ChannelParams,
    scan_results: &[ScanResult],
    preference: ChannelPreference,
) -> u32 {
    let span = params.span();
    let penalty = scan_results.iter().fold(0u32, |penalty, bss| {
        let share = influence(bss.channel, &span);
        if share == 0 {
            return penalty;
        }
        let above_floor = (i32::from(bss.rssi_dbm) + 100).max(0).min(100) as u32;
        let cost = (BSS_COUNT_COST + above_floor * RSSI_COST_PER_DB) * share / 10;
        penalty.saturating_add(cost)
    });
    let bonus = match preference {
        ChannelPreference::Indoor if is_japan_indoor(params.primary) => PREFERRED_LOCATION_BONUS,
        ChannelPreference::Outdoor if is_japan_outdoor(params.primary) => PREFERRED_LOCATION_BONUS,
        _ => 0,
    };
    ACS_WEIGHT_MAX.saturating_sub(penalty) + bonus
}

/// Bonding for `channel`, narrowed to 20 MHz when a bonded neighbour is restricted or lies in
/// the span radar was just detected on.
fn usable_params(
    dfs: &Dfs,
    channel: u8,
    cbw: Cbw,
    exclusions: &Exclusions,
    now: Time,
) -> ChannelParams {
    let params = ChannelParams::for_channel(channel, cbw, dfs.registry());
    if dfs.is_span_usable(&params, now)
        && is_valid_switch_target(&exclusions.radar_span, &params)
    {
        params
    } else {
        ChannelParams::new_20(channel)
    }
}

/// Picks the least occupied usable channel. The result depends only on the arguments and the
/// NOL contents, so reruns with the same inputs agree.
pub fn select_channel(
    dfs: &Dfs,
    scan_results: &[ScanResult],
    config: &AcsConfig,
    cbw: Cbw,
    exclusions: &Exclusions,
    now: Time,
) -> Result<AcsSelection, SapError> {
    let registry = dfs.registry();
    validate(registry, scan_results, config)?;

    let mut best: Option<AcsSelection> = None;
    for entry in registry.list_candidate_channels(config.band) {
        let ch = entry.channel_number;
        if !config.in_scope(ch) {
            continue;
        }
        if entry.is_dfs && config.dfs_mode == AcsDfsMode::Disable {
            continue;
        }
        if config.disable_w53 && is_japan_w53(ch) {
            continue;
        }
        if let Some(reason) = exclusions.reason(ch) {
            debug!("ACS skips channel {}: {}", ch, reason);
            continue;
        }
        if !dfs.is_channel_usable(ch, now) {
            debug!("ACS skips channel {}: on the NOL", ch);
            continue;
        }
        let params = usable_params(dfs, ch, cbw, exclusions, now);
        let w = weight(&params, scan_results, config.preference);
        registry.set_acs_weight(ch, w);
        // Candidates arrive in ascending order, so strict comparison keeps the lowest channel.
        if best.as_ref().and_then(|b| b.weight).map_or(true, |best_w| w > best_w) {
            best = Some(AcsSelection { params, weight: Some(w) });
        }
    }

    match best {
        Some(selection) => {
            info!(
                "ACS selected channel {} (weight {:?}) from {} scan results",
                selection.params,
                selection.weight,
                scan_results.len()
            );
            Ok(selection)
        }
        None => {
            warn!("ACS found no candidate channel; trying the default channel");
            select_default_channel(dfs, config, cbw, exclusions, now)
        }
    }
}

/// The configured default operating channel, provided it is usable right now. Of the
/// exclusions only the radar span applies here; the avoid and unsafe lists shape the candidate
/// set, not the fallback.
pub fn select_default_channel(
    dfs: &Dfs,
    config: &AcsConfig,
    cbw: Cbw,
    exclusions: &Exclusions,
    now: Time,
) -> Result<AcsSelection, SapError> {
    let ch = config.default_channel();
    if !dfs.is_channel_usable(ch, now) || exclusions.radar_span.contains(&ch) {
        warn!("Default channel {} is not usable", ch);
        return Err(SapError::NoChannelAvailable);
    }
    let params = usable_params(dfs, ch, cbw, exclusions, now);
    info!("Using default channel {}", params);
    Ok(AcsSelection { params, weight: None })
}
