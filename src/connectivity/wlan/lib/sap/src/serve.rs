// Copyright 2018 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    crate::{
        error::{ErrorClass, SapError},
        manager::SapManager,
        state_machine::SapEvent,
        SessionHandle,
    },
    anyhow::format_err,
    futures::{channel::mpsc, select_biased, stream::StreamExt},
    log::{error, info, warn},
    std::sync::Arc,
};

/// Posts events into a session's queue. Radar indications overtake everything else that is
/// still queued.
#[derive(Clone, Debug)]
pub struct EventSender {
    events: mpsc::UnboundedSender<SapEvent>,
    radar: mpsc::UnboundedSender<SapEvent>,
}

impl EventSender {
    pub fn post(&self, event: SapEvent) -> Result<(), anyhow::Error> {
        let sender = match event {
            SapEvent::RadarIndicated { .. } => &self.radar,
            _ => &self.events,
        };
        sender.unbounded_send(event).map_err(|e| format_err!("event queue closed: {}", e))
    }
}

pub struct EventQueue {
    events: mpsc::UnboundedReceiver<SapEvent>,
    radar: mpsc::UnboundedReceiver<SapEvent>,
}

pub fn create_event_queue() -> (EventSender, EventQueue) {
    let (events_sink, events) = mpsc::unbounded();
    let (radar_sink, radar) = mpsc::unbounded();
    (EventSender { events: events_sink, radar: radar_sink }, EventQueue { events, radar })
}

/// Drains `queue` into the session one event at a time. Completes once every `EventSender`
/// is gone, or with an error if the session is closed underneath it.
pub async fn serve(
    manager: Arc<SapManager>,
    handle: SessionHandle,
    queue: EventQueue,
) -> Result<(), anyhow::Error> {
    let EventQueue { events, radar } = queue;
    let mut events = events.fuse();
    let mut radar = radar.fuse();
    loop {
        let event = select_biased! {
            event = radar.next() => event,
            event = events.next() => event,
            complete => break,
        };
        let event = match event {
            Some(event) => event,
            None => continue,
        };
        let name = event.name();
        match manager.handle_event(handle, event) {
            Ok(()) => {}
            Err(SapError::NoSuchSession(_)) => {
                return Err(format_err!("session {:?} closed while serving", handle));
            }
            Err(e) if e.class() == ErrorClass::Fatal => error!("{} on {:?}: {}", name, handle, e),
            Err(e) => warn!("{} on {:?} rejected: {}", name, handle, e),
        }
    }
    info!("Event queue for {:?} closed", handle);
    Ok(())
}
