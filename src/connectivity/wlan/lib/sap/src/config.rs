// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        acl::{AclListKind, AclManager, AclMode, MAX_ACL_MAC_ADDRESS},
        acs::AcsConfig,
        channel::Cbw,
        dfs::DfsTimings,
        error::SapError,
        MacAddr,
    },
    anyhow::{format_err, Context},
    serde::{Deserialize, Serialize},
};

/// Serializes a `Duration` as a whole number of seconds.
pub(crate) mod duration_secs {
    use {
        serde::{Deserialize, Deserializer, Serializer},
        std::time::Duration,
    };

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AclConfig {
    pub mode: AclMode,
    pub accept_list: Vec<MacAddr>,
    pub deny_list: Vec<MacAddr>,
    /// Capacity of each list.
    pub max_entries: usize,
}

impl Default for AclConfig {
    fn default() -> Self {
        AclConfig {
            mode: AclMode::AllowAll,
            accept_list: vec![],
            deny_list: vec![],
            max_entries: MAX_ACL_MAC_ADDRESS,
        }
    }
}

impl AclConfig {
    pub fn build(&self) -> Result<AclManager, SapError> {
        let mut acl = AclManager::new(self.mode, self.max_entries);
        for addr in &self.accept_list {
            acl.add(*addr, AclListKind::Allow)?;
        }
        for addr in &self.deny_list {
            acl.add(*addr, AclListKind::Deny)?;
        }
        Ok(acl)
    }
}

/// Everything a session needs to bring up an AP.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SapConfig {
    /// Skips ACS and starts on this channel.
    pub operating_channel: Option<u8>,
    pub channel_width: Cbw,
    pub acs: AcsConfig,
    pub acl: AclConfig,
    pub dfs: DfsTimings,
    /// Honour channels a coexisting AP asked us to avoid.
    pub avoid_channels_enabled: bool,
}

impl SapConfig {
    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        let config: SapConfig = serde_json::from_str(json).context("parsing SAP config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.acs.start_channel > self.acs.end_channel {
            return Err(format_err!(
                "ACS range {}..={} is empty",
                self.acs.start_channel,
                self.acs.end_channel
            ));
        }
        if self.acl.accept_list.len() > self.acl.max_entries
            || self.acl.deny_list.len() > self.acl.max_entries
        {
            return Err(format_err!("ACL lists exceed {} entries", self.acl.max_entries));
        }
        if self.dfs.cac.as_secs() == 0 || self.dfs.weather_cac.as_secs() == 0 {
            return Err(format_err!("CAC durations must be at least one second"));
        }
        Ok(())
    }
}
