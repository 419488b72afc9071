// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{error::SapError, timer::Time},
    parking_lot::RwLock,
    serde::{Deserialize, Serialize},
    std::{collections::BTreeMap, fmt},
};

/// ETSI weather radar sub-band. A CAC on these channels lasts ten minutes instead of one.
pub fn is_etsi_weather_channel(channel: u8) -> bool {
    channel >= 120 && channel <= 130
}

pub fn is_japan_w53(channel: u8) -> bool {
    channel >= 52 && channel <= 64
}

pub fn is_japan_indoor(channel: u8) -> bool {
    channel >= 36 && channel <= 64
}

pub fn is_japan_outdoor(channel: u8) -> bool {
    channel >= 100 && channel <= 140
}

pub fn is_2ghz(channel: u8) -> bool {
    channel >= 1 && channel <= 14
}

pub fn is_5ghz(channel: u8) -> bool {
    channel >= 36 && channel <= 196
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Any,
    Band2Ghz,
    Band5Ghz,
}

impl Band {
    pub fn contains(&self, channel: u8) -> bool {
        match self {
            Band::Any => true,
            Band::Band2Ghz => is_2ghz(channel),
            Band::Band5Ghz => is_5ghz(channel),
        }
    }
}

impl Default for Band {
    fn default() -> Self {
        Band::Any
    }
}

/// Channel bandwidth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cbw {
    Cbw20,
    Cbw40Above,
    Cbw40Below,
    Cbw80,
}

impl Default for Cbw {
    fn default() -> Self {
        Cbw::Cbw20
    }
}

/// Primary channels of each 80 MHz block in the 5 GHz band, with the block's centre segment.
const VHT80_BLOCKS: [([u8; 4], u8); 6] = [
    ([36, 40, 44, 48], 42),
    ([52, 56, 60, 64], 58),
    ([100, 104, 108, 112], 106),
    ([116, 120, 124, 128], 122),
    ([132, 136, 140, 144], 138),
    ([149, 153, 157, 161], 155),
];

/// The bonding a session operates with, resolved against the registry at selection time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelParams {
    pub primary: u8,
    pub cbw: Cbw,
    pub secondary: Option<u8>,
    pub center_freq_seg0: Option<u8>,
}

impl ChannelParams {
    pub fn new_20(primary: u8) -> Self {
        ChannelParams { primary, cbw: Cbw::Cbw20, secondary: None, center_freq_seg0: None }
    }

    /// Resolves `requested` for `primary`, stepping down to a narrower width whenever the
    /// bonded channels are not all present in `registry`.
    pub fn for_channel(primary: u8, requested: Cbw, registry: &ChannelRegistry) -> Self {
        let mut candidates = vec![];
        if requested == Cbw::Cbw80 {
            candidates.push(Cbw::Cbw80);
        }
        if requested != Cbw::Cbw20 {
            // 40 MHz pairs are fixed in 5 GHz; in 2.4 GHz the requested direction is kept.
            match (is_5ghz(primary), requested) {
                (true, _) => candidates.push(pair_direction_5ghz(primary)),
                (false, Cbw::Cbw80) => {}
                (false, cbw) => candidates.push(cbw),
            }
        }
        candidates
            .into_iter()
            .filter_map(|cbw| Self::build(primary, cbw))
            .find(|params| params.span().iter().all(|ch| registry.contains(*ch)))
            .unwrap_or_else(|| Self::new_20(primary))
    }

    fn build(primary: u8, cbw: Cbw) -> Option<Self> {
        match cbw {
            Cbw::Cbw20 => Some(Self::new_20(primary)),
            Cbw::Cbw40Above => Some(ChannelParams {
                primary,
                cbw,
                secondary: Some(primary.checked_add(4)?),
                center_freq_seg0: Some(primary.checked_add(2)?),
            }),
            Cbw::Cbw40Below => Some(ChannelParams {
                primary,
                cbw,
                secondary: Some(primary.checked_sub(4)?),
                center_freq_seg0: Some(primary.checked_sub(2)?),
            }),
            Cbw::Cbw80 => {
                let (_, center) =
                    VHT80_BLOCKS.iter().find(|(block, _)| block.contains(&primary))?;
                let secondary = match pair_direction_5ghz(primary) {
                    Cbw::Cbw40Below => primary - 4,
                    _ => primary + 4,
                };
                Some(ChannelParams {
                    primary,
                    cbw,
                    secondary: Some(secondary),
                    center_freq_seg0: Some(*center),
                })
            }
        }
    }

    /// Every 20 MHz channel covered by this configuration, primary first.
    pub fn span(&self) -> Vec<u8> {
        match self.cbw {
            Cbw::Cbw20 => vec![self.primary],
            Cbw::Cbw40Above | Cbw::Cbw40Below => {
                let mut span = vec![self.primary];
                span.extend(self.secondary);
                span
            }
            Cbw::Cbw80 => {
                let mut span = vec![self.primary];
                if let Some((block, _)) =
                    VHT80_BLOCKS.iter().find(|(block, _)| block.contains(&self.primary))
                {
                    span.extend(block.iter().copied().filter(|ch| *ch != self.primary));
                }
                span
            }
        }
    }
}

impl fmt::Display for ChannelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cbw {
            Cbw::Cbw20 => write!(f, "{}", self.primary),
            Cbw::Cbw40Above => write!(f, "{}+", self.primary),
            Cbw::Cbw40Below => write!(f, "{}-", self.primary),
            Cbw::Cbw80 => write!(f, "{}(80)", self.primary),
        }
    }
}

fn pair_direction_5ghz(primary: u8) -> Cbw {
    // 36/40, 44/48, ... and 149/153, 157/161 pair upwards from the lower channel.
    let offset = if primary >= 149 { primary.wrapping_sub(149) } else { primary.wrapping_sub(36) };
    if (offset / 4) % 2 == 0 {
        Cbw::Cbw40Above
    } else {
        Cbw::Cbw40Below
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelEntry {
    pub channel_number: u8,
    pub is_dfs: bool,
    pub nol_expiry: Option<Time>,
    pub acs_weight: u32,
}

impl ChannelEntry {
    pub fn new(channel_number: u8, is_dfs: bool) -> Self {
        ChannelEntry { channel_number, is_dfs, nol_expiry: None, acs_weight: 0 }
    }

    pub fn is_restricted(&self, now: Time) -> bool {
        self.nol_expiry.map_or(false, |expiry| expiry > now)
    }
}

/// A channel on the non-occupancy list and the moment it leaves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NolEntry {
    pub channel: u8,
    pub expiry: Time,
}

/// The legally usable channels of a radio. Shared by every SAP session on that radio, so it
/// carries its own lock; each call holds it only for the duration of that call.
pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<u8, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new(entries: impl IntoIterator<Item = ChannelEntry>) -> Self {
        let channels = entries.into_iter().map(|entry| (entry.channel_number, entry)).collect();
        ChannelRegistry { channels: RwLock::new(channels) }
    }

    pub fn contains(&self, channel: u8) -> bool {
        self.channels.read().contains_key(&channel)
    }

    pub fn entry(&self, channel: u8) -> Result<ChannelEntry, SapError> {
        self.channels.read().get(&channel).cloned().ok_or(SapError::InvalidChannel(channel))
    }

    /// Snapshot of the channels in `band_filter`, ascending by channel number.
    pub fn list_candidate_channels(&self, band_filter: Band) -> Vec<ChannelEntry> {
        self.channels
            .read()
            .values()
            .filter(|entry| band_filter.contains(entry.channel_number))
            .cloned()
            .collect()
    }

    pub fn mark_dfs(&self, channel: u8) -> Result<(), SapError> {
        let mut channels = self.channels.write();
        let entry = channels.get_mut(&channel).ok_or(SapError::InvalidChannel(channel))?;
        entry.is_dfs = true;
        Ok(())
    }

    pub fn is_dfs(&self, channel: u8) -> Result<bool, SapError> {
        self.entry(channel).map(|entry| entry.is_dfs)
    }

    pub fn is_restricted(&self, channel: u8, now: Time) -> Result<bool, SapError> {
        self.entry(channel).map(|entry| entry.is_restricted(now))
    }

    /// Moves the NOL expiry of `channel` to `expiry`, never earlier than an existing one.
    /// Returns the expiry now in effect.
    pub(crate) fn extend_nol(&self, channel: u8, expiry: Time) -> Result<Time, SapError> {
        let mut channels = self.channels.write();
        let entry = channels.get_mut(&channel).ok_or(SapError::InvalidChannel(channel))?;
        let expiry = entry.nol_expiry.map_or(expiry, |current| current.max(expiry));
        entry.nol_expiry = Some(expiry);
        Ok(expiry)
    }

    /// Live NOL entries at `now`, ascending by channel. Expired entries are cleared on the way.
    pub fn nol_entries(&self, now: Time) -> Vec<NolEntry> {
        let mut channels = self.channels.write();
        channels
            .values_mut()
            .filter_map(|entry| match entry.nol_expiry {
                Some(expiry) if expiry > now => {
                    Some(NolEntry { channel: entry.channel_number, expiry })
                }
                Some(_) => {
                    entry.nol_expiry = None;
                    None
                }
                None => None,
            })
            .collect()
    }

    pub(crate) fn set_acs_weight(&self, channel: u8, weight: u32) {
        if let Some(entry) = self.channels.write().get_mut(&channel) {
            entry.acs_weight = weight;
        }
    }
}


#[cfg(test)]
mod tests {
    use {
        super::{test_utils::fake_registry, *},
        assert_matches::assert_matches,
        test_case::test_case,
    };

    #[test_case(118, false)]
    #[test_case(120, true)]
    #[test_case(128, true)]
    #[test_case(130, true)]
    #[test_case(132, false)]
    #[test_case(52, false)]
    fn etsi_weather_channel(channel: u8, expected: bool) {
        assert_eq!(is_etsi_weather_channel(channel), expected);
    }

    #[test]
    fn japan_predicates() {
        assert!(is_japan_w53(52) && is_japan_w53(64) && !is_japan_w53(100));
        assert!(is_japan_indoor(36) && !is_japan_indoor(100));
        assert!(is_japan_outdoor(100) && is_japan_outdoor(140) && !is_japan_outdoor(149));
    }

    #[test]
    fn unknown_channel_is_invalid() {
        let registry = fake_registry();
        assert_matches!(registry.is_restricted(14, Time::ZERO), Err(SapError::InvalidChannel(14)));
        assert_matches!(registry.mark_dfs(14), Err(SapError::InvalidChannel(14)));
        assert_matches!(registry.entry(200), Err(SapError::InvalidChannel(200)));
    }

    #[test]
    fn list_candidates_by_band() {
        let registry = fake_registry();
        let two_ghz = registry.list_candidate_channels(Band::Band2Ghz);
        let two_ghz: Vec<u8> = two_ghz.iter().map(|e| e.channel_number).collect();
        assert_eq!(two_ghz, (1..=11).collect::<Vec<_>>());
        let five_ghz = registry.list_candidate_channels(Band::Band5Ghz);
        assert_eq!(five_ghz.first().map(|e| e.channel_number), Some(36));
        assert_eq!(five_ghz.len(), 25);
        assert_eq!(registry.list_candidate_channels(Band::Any).len(), 36);
    }

    #[test]
    fn mark_dfs() {
        let registry = fake_registry();
        assert_matches!(registry.is_dfs(36), Ok(false));
        registry.mark_dfs(36).expect("36 is in the table");
        assert_matches!(registry.is_dfs(36), Ok(true));
    }

    #[test]
    fn nol_expiry_only_moves_forward() {
        let registry = fake_registry();
        let expiry = Time::from_secs(100);
        assert_eq!(registry.extend_nol(100, expiry).expect("extend"), expiry);
        assert_eq!(registry.extend_nol(100, Time::from_secs(50)).expect("extend"), expiry);
        assert_matches!(registry.is_restricted(100, Time::from_secs(99)), Ok(true));
        assert_matches!(registry.is_restricted(100, Time::from_secs(100)), Ok(false));
    }

    #[test]
    fn nol_entries_drop_expired() {
        let registry = fake_registry();
        registry.extend_nol(100, Time::from_secs(10)).expect("extend");
        registry.extend_nol(52, Time::from_secs(20)).expect("extend");
        assert_eq!(
            registry.nol_entries(Time::from_secs(15)),
            vec![NolEntry { channel: 52, expiry: Time::from_secs(20) }]
        );
        assert_eq!(registry.entry(100).expect("entry").nol_expiry, None);
    }

    #[test_case(36, Cbw::Cbw40Above, Some(40), Some(38))]
    #[test_case(40, Cbw::Cbw40Above, Some(36), Some(38))]
    #[test_case(104, Cbw::Cbw80, Some(100), Some(106))]
    #[test_case(149, Cbw::Cbw80, Some(153), Some(155))]
    #[test_case(165, Cbw::Cbw80, None, None)]
    #[test_case(6, Cbw::Cbw40Below, Some(2), Some(4))]
    #[test_case(6, Cbw::Cbw80, None, None)]
    fn channel_params(primary: u8, requested: Cbw, secondary: Option<u8>, center: Option<u8>) {
        let params = ChannelParams::for_channel(primary, requested, &fake_registry());
        assert_eq!(params.secondary, secondary);
        assert_eq!(params.center_freq_seg0, center);
    }

    #[test]
    fn bonding_degrades_when_span_is_incomplete() {
        // Only part of the 132-144 block is present, so 80 MHz is not possible.
        let registry = ChannelRegistry::new(
            [136, 140, 144].iter().map(|ch| ChannelEntry::new(*ch, true)),
        );
        let params = ChannelParams::for_channel(140, Cbw::Cbw80, &registry);
        assert_eq!(params.cbw, Cbw::Cbw40Above);
        assert_eq!(params.span(), vec![140, 144]);
    }

    #[test]
    fn span_of_80mhz_block() {
        let params = ChannelParams::for_channel(116, Cbw::Cbw80, &fake_registry());
        let mut span = params.span();
        assert_eq!(span[0], 116);
        span.sort();
        assert_eq!(span, vec![116, 120, 124, 128]);
    }
}
