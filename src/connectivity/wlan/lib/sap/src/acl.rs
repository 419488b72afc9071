// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{error::SapError, MacAddr},
    log::{debug, info},
    serde::{Deserialize, Serialize},
};

/// Default number of addresses each list can hold.
pub const MAX_ACL_MAC_ADDRESS: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclMode {
    AllowAll,
    DenyAll,
    /// Only addresses on the allow list may join.
    AllowList,
    /// Everyone except addresses on the deny list may join.
    DenyList,
}

impl Default for AclMode {
    fn default() -> Self {
        AclMode::AllowAll
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclListKind {
    Allow,
    Deny,
}

/// An insertion-ordered set of MAC addresses with a fixed capacity.
#[derive(Clone, Debug, PartialEq)]
pub struct MacList {
    addrs: Vec<MacAddr>,
    capacity: usize,
}

impl MacList {
    pub fn with_capacity(capacity: usize) -> Self {
        MacList { addrs: Vec::with_capacity(capacity), capacity }
    }

    pub fn contains(&self, addr: &MacAddr) -> bool {
        self.addrs.contains(addr)
    }

    pub fn add(&mut self, addr: MacAddr) -> Result<(), SapError> {
        if self.contains(&addr) {
            return Ok(());
        }
        if self.addrs.len() >= self.capacity {
            return Err(SapError::CapacityExceeded(self.capacity));
        }
        self.addrs.push(addr);
        Ok(())
    }

    pub fn remove(&mut self, addr: &MacAddr) -> Result<(), SapError> {
        let index = self.addrs.iter().position(|a| a == addr).ok_or(SapError::NotFound)?;
        self.addrs.remove(index);
        Ok(())
    }

    /// The addresses in ascending byte order. Membership is unaffected.
    pub fn sorted(&self) -> Vec<MacAddr> {
        let mut addrs = self.addrs.clone();
        addrs.sort();
        addrs
    }

    pub fn sort(&mut self) {
        self.addrs.sort();
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacAddr> {
        self.addrs.iter()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AclManager {
    mode: AclMode,
    allow: MacList,
    deny: MacList,
}

impl AclManager {
    pub fn new(mode: AclMode, capacity: usize) -> Self {
        AclManager {
            mode,
            allow: MacList::with_capacity(capacity),
            deny: MacList::with_capacity(capacity),
        }
    }

    pub fn mode(&self) -> AclMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: AclMode) {
        info!("ACL mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
    }

    pub fn is_allowed(&self, addr: &MacAddr) -> bool {
        Self::evaluate(self.mode, &self.allow, &self.deny, addr)
    }

    /// Policy check against an explicit mode. A deny-listed address is refused in every mode
    /// that consults a list.
    pub fn is_allowed_in(&self, addr: &MacAddr, mode: AclMode) -> bool {
        Self::evaluate(mode, &self.allow, &self.deny, addr)
    }

    fn evaluate(mode: AclMode, allow: &MacList, deny: &MacList, addr: &MacAddr) -> bool {
        match mode {
            AclMode::DenyAll => false,
            AclMode::AllowAll => true,
            AclMode::AllowList => !deny.contains(addr) && allow.contains(addr),
            AclMode::DenyList => !deny.contains(addr),
        }
    }

    pub fn add(&mut self, addr: MacAddr, kind: AclListKind) -> Result<(), SapError> {
        self.list_mut(kind).add(addr)?;
        debug!("Added {} to {:?} list", addr, kind);
        Ok(())
    }

    pub fn remove(&mut self, addr: &MacAddr, kind: AclListKind) -> Result<(), SapError> {
        self.list_mut(kind).remove(addr)?;
        debug!("Removed {} from {:?} list", addr, kind);
        Ok(())
    }

    pub fn sort(&mut self, kind: AclListKind) {
        self.list_mut(kind).sort()
    }

    pub fn list(&self, kind: AclListKind) -> &MacList {
        match kind {
            AclListKind::Allow => &self.allow,
            AclListKind::Deny => &self.deny,
        }
    }

    fn list_mut(&mut self, kind: AclListKind) -> &mut MacList {
        match kind {
            AclListKind::Allow => &mut self.allow,
            AclListKind::Deny => &mut self.deny,
        }
    }

    pub fn print(&self, kind: AclListKind) {
        let list = self.list(kind);
        info!("{:?} list ({}/{}):", kind, list.len(), list.capacity());
        for (i, addr) in list.iter().enumerate() {
            info!("  [{}] {}", i, addr);
        }
    }
}
