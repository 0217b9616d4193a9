//! Deferred-event scheduler
//!
//! Replaces the heap-based C timer (`timer_do`) with a typed scheduler owned
//! by the game thread. Every callback receives exclusive access to the game
//! context `C` and to the scheduler itself, so it can schedule or cancel
//! further events.
//!
//! Ordering rules:
//! - events fire in non-decreasing due-time order, FIFO among equal due times
//! - an event scheduled while `tick` runs never fires in that same `tick`
//! - recurring events advance from their scheduled due time, not from "now"
//!
//! The only thread-safe entry point is [`RemoteScheduler`], which queues work
//! into an inbox drained at the start of the next `tick`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::ops::Add;
use std::time::Duration;

use tokio::sync::mpsc;

/// Milliseconds since the owning server started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs * 1000)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let ms = u64::try_from(rhs.as_millis()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(ms))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Stable identifier of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

/// Passed to a callback when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firing {
    pub handle: TimerHandle,
    /// The due time the event was scheduled for (not the tick time).
    pub due: Timestamp,
}

type OnceFn<C> = Box<dyn FnOnce(&mut C, &mut TimerScheduler<C>, &Firing)>;
type RepeatFn<C> = Box<dyn FnMut(&mut C, &mut TimerScheduler<C>, &Firing)>;

/// Closure shipped across threads through [`RemoteScheduler`].
pub type RemoteCallback<C> = Box<dyn FnOnce(&mut C, &mut TimerScheduler<C>) + Send>;

enum Callback<C> {
    Once(OnceFn<C>),
    Repeat(RepeatFn<C>, Duration),
}

struct Entry<C> {
    due: Timestamp,
    seq: u64,
    callback: Callback<C>,
}

/// Heap key. Min-ordered on `(due, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    due: Timestamp,
    seq: u64,
    handle: TimerHandle,
}

impl Ord for Slot {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Slot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct RemoteRequest<C> {
    delay: Duration,
    callback: RemoteCallback<C>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("scheduler has shut down")]
    SchedulerClosed,
}

/// Thread-safe handle that queues events into a scheduler's inbox.
pub struct RemoteScheduler<C> {
    tx: mpsc::UnboundedSender<RemoteRequest<C>>,
}

impl<C> Clone for RemoteScheduler<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C> RemoteScheduler<C> {
    /// Queue `callback` to run `delay` after the tick that drains it.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Result<(), TimerError>
    where
        F: FnOnce(&mut C, &mut TimerScheduler<C>) + Send + 'static,
    {
        self.tx
            .send(RemoteRequest {
                delay,
                callback: Box::new(callback),
            })
            .map_err(|_| TimerError::SchedulerClosed)
    }
}

/// Single-threaded scheduler of deferred callbacks over a context `C`.
pub struct TimerScheduler<C> {
    now: Timestamp,
    queue: BinaryHeap<Slot>,
    events: HashMap<TimerHandle, Entry<C>>,
    next_handle: u64,
    next_seq: u64,
    firing: Option<TimerHandle>,
    firing_cancelled: bool,
    inbox_tx: mpsc::UnboundedSender<RemoteRequest<C>>,
    inbox_rx: mpsc::UnboundedReceiver<RemoteRequest<C>>,
}

impl<C: 'static> TimerScheduler<C> {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            now: Timestamp::ZERO,
            queue: BinaryHeap::new(),
            events: HashMap::new(),
            next_handle: 1,
            next_seq: 0,
            firing: None,
            firing_cancelled: false,
            inbox_tx,
            inbox_rx,
        }
    }

    /// The time of the most recent `tick`.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Handle for enqueuing events from other threads.
    pub fn remote(&self) -> RemoteScheduler<C> {
        RemoteScheduler {
            tx: self.inbox_tx.clone(),
        }
    }

    /// Number of live events (excluding undrained remote requests).
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.events.contains_key(&handle)
    }

    /// Due time of the earliest live event.
    pub fn next_due(&self) -> Option<Timestamp> {
        self.events.values().map(|e| e.due).min()
    }

    /// Run `callback` once, `delay` after the current time.
    pub fn schedule<F>(&mut self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut C, &mut TimerScheduler<C>, &Firing) + 'static,
    {
        let due = self.now + delay;
        self.insert(due, Callback::Once(Box::new(callback)))
    }

    /// Run `callback` once at an absolute time. A past `due` fires on the next tick.
    pub fn schedule_at<F>(&mut self, due: Timestamp, callback: F) -> TimerHandle
    where
        F: FnOnce(&mut C, &mut TimerScheduler<C>, &Firing) + 'static,
    {
        self.insert(due, Callback::Once(Box::new(callback)))
    }

    /// Run `callback` every `interval`, first after `delay`.
    ///
    /// A zero interval degrades to a one-shot event.
    pub fn schedule_repeating<F>(
        &mut self,
        delay: Duration,
        interval: Duration,
        mut callback: F,
    ) -> TimerHandle
    where
        F: FnMut(&mut C, &mut TimerScheduler<C>, &Firing) + 'static,
    {
        let due = self.now + delay;
        if interval.is_zero() {
            return self.insert(
                due,
                Callback::Once(Box::new(
                    move |c: &mut C, t: &mut TimerScheduler<C>, f: &Firing| callback(c, t, f),
                )),
            );
        }
        self.insert(due, Callback::Repeat(Box::new(callback), interval))
    }

    /// Cancel a pending event. Returns false when it already fired or is unknown.
    ///
    /// A recurring event may cancel itself from inside its own callback.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if self.events.remove(&handle).is_some() {
            return true;
        }
        if self.firing == Some(handle) && !self.firing_cancelled {
            self.firing_cancelled = true;
            return true;
        }
        false
    }

    /// Fire every event due at or before `now`. Returns the number fired.
    pub fn tick(&mut self, now: Timestamp, ctx: &mut C) -> usize {
        if now > self.now {
            self.now = now;
        }
        self.drain_inbox();

        // Anything inserted from here on waits for a later tick.
        let horizon = self.next_seq;
        let mut deferred = Vec::new();
        let mut fired = 0;

        loop {
            match self.queue.peek() {
                Some(slot) if slot.due <= self.now => {}
                _ => break,
            }
            let Some(slot) = self.queue.pop() else {
                break;
            };

            let live = self
                .events
                .get(&slot.handle)
                .is_some_and(|entry| entry.seq == slot.seq);
            if !live {
                continue;
            }
            if slot.seq >= horizon {
                deferred.push(slot);
                continue;
            }
            let Some(entry) = self.events.remove(&slot.handle) else {
                continue;
            };

            let firing = Firing {
                handle: slot.handle,
                due: entry.due,
            };
            self.firing = Some(slot.handle);
            self.firing_cancelled = false;

            match entry.callback {
                Callback::Once(callback) => {
                    callback(ctx, self, &firing);
                }
                Callback::Repeat(mut callback, interval) => {
                    callback(ctx, self, &firing);
                    if !self.firing_cancelled {
                        let due = entry.due + interval;
                        let seq = self.bump_seq();
                        self.queue.push(Slot {
                            due,
                            seq,
                            handle: slot.handle,
                        });
                        self.events.insert(
                            slot.handle,
                            Entry {
                                due,
                                seq,
                                callback: Callback::Repeat(callback, interval),
                            },
                        );
                    }
                }
            }

            self.firing = None;
            self.firing_cancelled = false;
            fired += 1;
        }

        self.queue.extend(deferred);
        if fired > 0 {
            tracing::trace!("[timer] tick now={} fired={} pending={}", self.now, fired, self.events.len());
        }
        fired
    }

    fn drain_inbox(&mut self) {
        while let Ok(request) = self.inbox_rx.try_recv() {
            let due = self.now + request.delay;
            let callback = request.callback;
            self.insert(
                due,
                Callback::Once(Box::new(
                    move |ctx: &mut C, timers: &mut TimerScheduler<C>, _: &Firing| {
                        callback(ctx, timers)
                    },
                )),
            );
        }
    }

    fn insert(&mut self, due: Timestamp, callback: Callback<C>) -> TimerHandle {
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let seq = self.bump_seq();
        self.queue.push(Slot { due, seq, handle });
        self.events.insert(handle, Entry { due, seq, callback });
        handle
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl<C: 'static> Default for TimerScheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Log of (label, scheduled due) pairs in firing order.
    type Log = Vec<(&'static str, u64)>;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn at(n: u64) -> Timestamp {
        Timestamp::from_millis(n)
    }

    #[test]
    fn test_fires_in_due_order_with_fifo_ties() {
        let mut timers: TimerScheduler<Log> = TimerScheduler::new();
        let mut log = Log::new();

        timers.schedule(ms(30), |log: &mut Log, _, f| log.push(("c", f.due.as_millis())));
        timers.schedule(ms(10), |log: &mut Log, _, f| log.push(("a", f.due.as_millis())));
        timers.schedule(ms(20), |log: &mut Log, _, f| log.push(("b1", f.due.as_millis())));
        timers.schedule(ms(20), |log: &mut Log, _, f| log.push(("b2", f.due.as_millis())));

        assert_eq!(timers.tick(at(100), &mut log), 4);
        assert_eq!(log, vec![("a", 10), ("b1", 20), ("b2", 20), ("c", 30)]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_not_due_events_wait() {
        let mut timers: TimerScheduler<Log> = TimerScheduler::new();
        let mut log = Log::new();

        timers.schedule(ms(50), |log: &mut Log, _, _| log.push(("late", 0)));
        assert_eq!(timers.tick(at(49), &mut log), 0);
        assert!(log.is_empty());
        assert_eq!(timers.tick(at(50), &mut log), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_recurring_does_not_drift_when_ticked_late() {
        let mut timers: TimerScheduler<Vec<u64>> = TimerScheduler::new();
        let mut dues = Vec::new();

        timers.schedule_repeating(ms(100), ms(100), |dues: &mut Vec<u64>, _, f| {
            dues.push(f.due.as_millis())
        });

        // Ticks arrive late and irregularly.
        for now in [130, 250, 470, 480, 490, 500, 610] {
            timers.tick(at(now), &mut dues);
        }

        assert_eq!(dues, vec![100, 200, 300, 400, 500, 600]);
        for (k, due) in dues.iter().enumerate() {
            assert_eq!(*due, 100 + 100 * k as u64);
        }
    }

    #[test]
    fn test_recurring_fires_once_per_tick() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;

        timers.schedule_repeating(ms(10), ms(10), |count: &mut u32, _, _| *count += 1);

        // Three periods overdue, still only one firing this tick.
        assert_eq!(timers.tick(at(35), &mut count), 1);
        assert_eq!(count, 1);
        assert_eq!(timers.tick(at(35), &mut count), 1);
        assert_eq!(timers.tick(at(35), &mut count), 1);
        assert_eq!(timers.tick(at(35), &mut count), 0);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_cancel_before_fire() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;

        let handle = timers.schedule(ms(10), |count: &mut u32, _, _| *count += 1);
        assert!(timers.cancel(handle));
        assert!(!timers.cancel(handle));
        timers.tick(at(100), &mut count);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;

        let handle = timers.schedule(ms(10), |count: &mut u32, _, _| *count += 1);
        timers.tick(at(10), &mut count);
        assert!(!timers.cancel(handle));
        assert!(!timers.cancel(TimerHandle(9999)));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_recurring_can_cancel_itself() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;

        timers.schedule_repeating(ms(10), ms(10), |count: &mut u32, timers, f| {
            *count += 1;
            if *count == 2 {
                assert!(timers.cancel(f.handle));
            }
        });

        for now in (10..=100).step_by(10) {
            timers.tick(at(now), &mut count);
        }
        assert_eq!(count, 2);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_callback_cancels_a_later_event_in_same_tick() {
        let mut timers: TimerScheduler<Log> = TimerScheduler::new();
        let mut log = Log::new();

        let victim = timers.schedule(ms(20), |log: &mut Log, _, _| log.push(("victim", 20)));
        timers.schedule(ms(10), move |log: &mut Log, timers, _| {
            log.push(("killer", 10));
            timers.cancel(victim);
        });

        timers.tick(at(50), &mut log);
        assert_eq!(log, vec![("killer", 10)]);
    }

    #[test]
    fn test_event_scheduled_during_tick_waits_for_next_tick() {
        let mut timers: TimerScheduler<Log> = TimerScheduler::new();
        let mut log = Log::new();

        timers.schedule(ms(10), |log: &mut Log, timers, _| {
            log.push(("outer", 10));
            // Already due, but must not run in this tick.
            timers.schedule_at(at(0), |log: &mut Log, _, _| log.push(("inner", 0)));
        });

        assert_eq!(timers.tick(at(10), &mut log), 1);
        assert_eq!(log, vec![("outer", 10)]);
        assert_eq!(timers.tick(at(10), &mut log), 1);
        assert_eq!(log, vec![("outer", 10), ("inner", 0)]);
    }

    #[test]
    fn test_self_rescheduling_chain_is_bounded_per_tick() {
        fn again(count: &mut u32, timers: &mut TimerScheduler<u32>, _: &Firing) {
            *count += 1;
            timers.schedule(Duration::ZERO, again);
        }

        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;
        timers.schedule(Duration::ZERO, again);

        assert_eq!(timers.tick(at(1), &mut count), 1);
        assert_eq!(timers.tick(at(2), &mut count), 1);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_remote_requests_visible_on_next_tick() {
        let mut timers: TimerScheduler<Log> = TimerScheduler::new();
        let mut log = Log::new();
        let remote = timers.remote();

        let worker = std::thread::spawn(move || {
            remote
                .schedule(Duration::ZERO, |log: &mut Log, _| log.push(("remote", 0)))
                .unwrap();
        });
        worker.join().unwrap();

        assert!(log.is_empty());
        assert_eq!(timers.tick(at(5), &mut log), 1);
        assert_eq!(log, vec![("remote", 0)]);
    }

    #[test]
    fn test_remote_delay_counts_from_drain() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;
        timers.tick(at(100), &mut count);

        timers
            .remote()
            .schedule(ms(50), |count: &mut u32, _| *count += 1)
            .unwrap();

        timers.tick(at(120), &mut count);
        assert_eq!(count, 0);
        assert_eq!(timers.next_due(), Some(at(170)));
        timers.tick(at(170), &mut count);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_remote_after_scheduler_dropped() {
        let timers: TimerScheduler<u32> = TimerScheduler::new();
        let remote = timers.remote();
        drop(timers);
        let result = remote.schedule(Duration::ZERO, |_: &mut u32, _| {});
        assert_eq!(result, Err(TimerError::SchedulerClosed));
    }

    #[test]
    fn test_time_never_runs_backwards() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;
        timers.tick(at(500), &mut count);
        timers.tick(at(100), &mut count);
        assert_eq!(timers.now(), at(500));
    }

    #[test]
    fn test_zero_interval_repeating_is_one_shot() {
        let mut timers: TimerScheduler<u32> = TimerScheduler::new();
        let mut count = 0;
        timers.schedule_repeating(ms(5), Duration::ZERO, |count: &mut u32, _, _| *count += 1);
        for now in [5, 10, 15] {
            timers.tick(at(now), &mut count);
        }
        assert_eq!(count, 1);
    }
}
