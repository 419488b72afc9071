// Copyright 2018 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{state_machine::SapNotification, MlmeRequest},
    futures::channel::mpsc,
};

#[derive(Debug)]
pub struct UnboundedSink<T> {
    sink: mpsc::UnboundedSender<T>,
}

impl<T> UnboundedSink<T> {
    pub fn new(sink: mpsc::UnboundedSender<T>) -> Self {
        UnboundedSink { sink }
    }

    pub fn send(&self, msg: T) {
        match self.sink.unbounded_send(msg) {
            Ok(()) => {}
            Err(e) => {
                if e.is_full() {
                    panic!("Did not expect an unbounded channel to be full: {:?}", e);
                }
                // If the other side has disconnected, we can still technically function,
                // so ignore the error.
            }
        }
    }
}

impl<T> Clone for UnboundedSink<T> {
    fn clone(&self) -> Self {
        UnboundedSink { sink: self.sink.clone() }
    }
}

/// Receives lifecycle notifications. Called with the session lock held, so implementations
/// must return promptly and must not call back into the session.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: SapNotification);
}

impl NotificationSink for UnboundedSink<SapNotification> {
    fn notify(&self, notification: SapNotification) {
        self.send(notification)
    }
}

pub type MlmeSink = UnboundedSink<MlmeRequest>;
pub type MlmeStream = mpsc::UnboundedReceiver<MlmeRequest>;
pub type NotificationStream = mpsc::UnboundedReceiver<SapNotification>;

pub fn notification_channel() -> (UnboundedSink<SapNotification>, NotificationStream) {
    let (sink, stream) = mpsc::unbounded();
    (UnboundedSink::new(sink), stream)
}
