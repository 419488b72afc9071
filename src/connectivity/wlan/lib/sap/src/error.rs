// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{state_machine::SapState, SessionHandle},
    thiserror::Error,
};

/// How a failure is handled by the caller. Only `Fatal` errors move a session to
/// `Disconnected` on their own; everything else leaves the state untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request was refused by policy. Recovered locally and reported.
    Policy,
    /// No usable resource (channel) remains. Surfaced as a start failure.
    ResourceExhaustion,
    /// An external collaborator handed over bad input.
    ExternalInput,
    /// An internal invariant was found broken.
    Fatal,
}

#[derive(Debug, Error)]
pub enum SapError {
    #[error("event {event} is not valid in state {state:?}")]
    InvalidTransition { state: SapState, event: &'static str },
    #[error("channel {0} is on the non-occupancy list")]
    ChannelRestricted(u8),
    #[error("MAC list is full ({0} entries)")]
    CapacityExceeded(usize),
    #[error("MAC address not found in list")]
    NotFound,
    #[error("a CAC timer is already pending for channel {0}")]
    AlreadyPending(u8),
    #[error("no usable channel available")]
    NoChannelAvailable,
    #[error("channel {0} is not part of the regulatory table")]
    InvalidChannel(u8),
    #[error("malformed scan result: {0}")]
    MalformedScanResult(String),
    #[error("unknown session {0:?}")]
    NoSuchSession(SessionHandle),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    #[error("failed to persist the non-occupancy list: {0}")]
    Persistence(#[source] anyhow::Error),
}

impl SapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SapError::InvalidTransition { .. }
            | SapError::ChannelRestricted(_)
            | SapError::CapacityExceeded(_)
            | SapError::NotFound
            | SapError::AlreadyPending(_)
            | SapError::NoSuchSession(_) => ErrorClass::Policy,
            SapError::NoChannelAvailable => ErrorClass::ResourceExhaustion,
            SapError::InvalidChannel(_)
            | SapError::MalformedScanResult(_)
            | SapError::Persistence(_) => ErrorClass::ExternalInput,
            SapError::Invariant(_) => ErrorClass::Fatal,
        }
    }
}
