// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use {
    futures::channel::mpsc,
    log::warn,
    parking_lot::Mutex,
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, HashMap},
        convert::TryFrom,
        fmt,
        ops::{Add, Sub},
        sync::Arc,
        time::{Duration, Instant},
    },
};

/// A point on the monotonic clock, in nanoseconds since an arbitrary origin (usually boot).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Time = Time(0);
    pub const INFINITE: Time = Time(i64::MAX);

    pub const fn from_nanos(nanos: i64) -> Self {
        Time(nanos)
    }

    pub const fn from_secs(secs: i64) -> Self {
        Time(secs.saturating_mul(1_000_000_000))
    }

    pub const fn into_nanos(self) -> i64 {
        self.0
    }

    /// Time left until `deadline`, or zero if it has already passed.
    pub fn until(self, deadline: Time) -> Duration {
        deadline - self
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        let nanos = i64::try_from(rhs.as_nanos()).unwrap_or(i64::MAX);
        Time(self.0.saturating_add(nanos))
    }
}

/// Saturates at zero when `rhs` is later than `self`.
impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(rhs.0).max(0) as u64)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}s", self.0 / 1_000_000_000, (self.0 % 1_000_000_000).abs())
    }
}

lazy_static::lazy_static! {
    static ref MONOTONIC_ORIGIN: Instant = Instant::now();
}

/// Current time on the process-wide monotonic clock. Its origin is fixed the first time any
/// caller reads it, so every reader in the process agrees on what a `Time` means.
pub fn monotonic_now() -> Time {
    Time::ZERO + MONOTONIC_ORIGIN.elapsed()
}

#[derive(PartialEq, Eq, Hash, Debug, Copy, Clone, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

/// Arms and disarms timeouts on behalf of a `Timer`. Implementations deliver expired ids back
/// to the state machine through its event queue; they never call into the state machine
/// themselves.
pub trait Scheduler: Send {
    fn now(&self) -> Time;
    /// Requests to schedule an event. Returns a unique ID used to cancel the scheduled event.
    fn schedule(&mut self, deadline: Time) -> EventId;
    /// Cancels a previously scheduled event.
    fn cancel(&mut self, id: EventId);
}

/// A timer to schedule and cancel timeouts and retrieve triggered events.
pub struct Timer<E> {
    events: HashMap<EventId, E>,
    scheduler: Box<dyn Scheduler>,
}

impl<E> Timer<E> {
    pub fn new(scheduler: Box<dyn Scheduler>) -> Self {
        Self { events: HashMap::default(), scheduler }
    }

    pub fn now(&self) -> Time {
        self.scheduler.now()
    }

    /// Returns the event for `event_id` at most once. Ids which were cancelled, or which never
    /// belonged to this timer, yield `None`.
    pub fn triggered(&mut self, event_id: &EventId) -> Option<E> {
        self.events.remove(event_id)
    }

    pub fn schedule_event(&mut self, deadline: Time, event: E) -> EventId {
        let event_id = self.scheduler.schedule(deadline);
        self.events.insert(event_id, event);
        event_id
    }

    pub fn cancel_event(&mut self, event_id: EventId) {
        self.events.remove(&event_id);
        self.scheduler.cancel(event_id);
    }

    pub fn cancel_all(&mut self) {
        for event_id in self.events.keys() {
            self.scheduler.cancel(*event_id);
        }
        self.events.clear();
    }

    pub fn pending(&self) -> usize {
        self.events.len()
    }
}

#[derive(Default)]
struct ManualState {
    now: Time,
    next_id: u64,
    armed: BTreeMap<EventId, Time>,
}

/// A scheduler driven by hand: the owner moves the clock forward and collects whatever came
/// due. Clones share the same clock.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    inner: Arc<Mutex<ManualState>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: Time) -> Self {
        let scheduler = Self::default();
        scheduler.inner.lock().now = now;
        scheduler
    }

    /// Moves the clock to `now` (never backwards) and returns the ids whose deadline has been
    /// reached, ordered by deadline.
    pub fn advance_to(&self, now: Time) -> Vec<EventId> {
        let mut inner = self.inner.lock();
        if now > inner.now {
            inner.now = now;
        }
        let now = inner.now;
        let mut due: Vec<(Time, EventId)> = inner
            .armed
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        due.sort();
        for (_, id) in &due {
            inner.armed.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn advance_by(&self, delta: Duration) -> Vec<EventId> {
        let now = self.inner.lock().now + delta;
        self.advance_to(now)
    }

    pub fn deadline(&self, id: EventId) -> Option<Time> {
        self.inner.lock().armed.get(&id).copied()
    }

    pub fn armed(&self) -> usize {
        self.inner.lock().armed.len()
    }

    pub fn current(&self) -> Time {
        self.inner.lock().now
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> Time {
        self.inner.lock().now
    }

    fn schedule(&mut self, deadline: Time) -> EventId {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = EventId(inner.next_id);
        inner.armed.insert(id, deadline);
        id
    }

    fn cancel(&mut self, id: EventId) {
        self.inner.lock().armed.remove(&id);
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TimeoutRequest {
    Schedule { id: EventId, deadline: Time },
    Cancel { id: EventId },
}

pub type TimeoutStream = mpsc::UnboundedReceiver<TimeoutRequest>;

/// Forwards timeout requests to a host event loop, which is expected to arm a real timer and
/// post the id back once it fires. Reads time from `monotonic_now`, so NOL expiries written
/// through one session's scheduler hold for every other session in the process.
pub struct StreamScheduler {
    next_id: u64,
    sink: mpsc::UnboundedSender<TimeoutRequest>,
}

impl StreamScheduler {
    pub fn new() -> (Self, TimeoutStream) {
        let (sink, stream) = mpsc::unbounded();
        (StreamScheduler { next_id: 0, sink }, stream)
    }

    fn send(&self, req: TimeoutRequest) {
        if let Err(e) = self.sink.unbounded_send(req) {
            // A dropped receiver means nobody will ever fire the timeout. The state machine
            // still functions; a stop request clears any wait.
            warn!("Failed to forward timeout request {:?}: {}", req, e);
        }
    }
}

impl Scheduler for StreamScheduler {
    fn now(&self) -> Time {
        monotonic_now()
    }

    fn schedule(&mut self, deadline: Time) -> EventId {
        self.next_id += 1;
        let id = EventId(self.next_id);
        self.send(TimeoutRequest::Schedule { id, deadline });
        id
    }

    fn cancel(&mut self, id: EventId) {
        self.send(TimeoutRequest::Cancel { id });
    }
}
