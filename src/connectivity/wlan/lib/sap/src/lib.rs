// Copyright 2018 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control core of a soft access point: picks the operating channel, runs the DFS channel
//! availability check, reacts to radar and filters joining clients by MAC address.

pub mod acl;
pub mod acs;
pub mod channel;
pub mod config;
pub mod dfs;
pub mod error;
pub mod manager;
pub mod nol_store;
pub mod serve;
pub mod sink;
pub mod state_machine;
pub mod timer;

use {
    serde::{Deserialize, Serialize},
    std::{convert::TryFrom, fmt, str::FromStr},
};

pub use crate::{
    acl::{AclListKind, AclMode},
    channel::{Band, Cbw, ChannelEntry, ChannelParams, ChannelRegistry, NolEntry},
    config::SapConfig,
    error::{ErrorClass, SapError},
    manager::SapManager,
    state_machine::{SapEvent, SapNotification, SapSme, SapState},
    timer::{EventId, Time},
};

/// An IEEE 802 MAC address. Orders by raw bytes.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[0], b[1], b[2], b[3], b[4], b[5])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("invalid MAC address {0:?}")]
pub struct ParseMacAddrError(String);

impl FromStr for MacAddr {
    type Err = ParseMacAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(|c: char| c == ':' || c == '-');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacAddrError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseMacAddrError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacAddrError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacAddrError(s.to_string()));
        }
        Ok(MacAddr(bytes))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = ParseMacAddrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(addr: MacAddr) -> String {
        addr.to_string()
    }
}

/// Identifies one SAP session in a `SapManager`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionHandle(pub u32);

pub type ScanTxnId = u64;

/// Requests from the state machine to the lower (MAC) layer.
#[derive(Clone, Debug, PartialEq)]
pub enum MlmeRequest {
    /// Scan `channels` for neighbouring BSSes; answered by a matching `ScanComplete`.
    Scan { txn_id: ScanTxnId, channels: Vec<u8> },
    /// Bring the BSS up (or move it) on the given channel; answered by `StartConfirm` or
    /// `StartFailure`.
    Start { params: ChannelParams },
    /// Stop transmitting beacons on the current channel until the next `Start`.
    SuspendBeacon,
    /// Tear the BSS down; answered by `TeardownComplete`.
    Stop,
}
