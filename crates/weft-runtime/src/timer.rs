//! Millisecond timers
//!
//! Timers live in an ordered set keyed by (absolute deadline, timer
//! id); ids are process-monotonic, so equal deadlines keep creation
//! order and removal always finds the exact entry. The manager hands
//! expired callbacks out in batches and re-arms recurring timers at
//! fire time.
//!
//! A reactor registers itself as the front-insert notifier: when a
//! new timer becomes the earliest deadline, the manager fires the
//! notifier once until the next `get_next_timeout` call re-arms the
//! latch. Deadlines are wall-clock; a backwards jump of more than an
//! hour expires everything rather than stalling it.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use weft_core::SpinLock;

/// Clock jumps further back than this expire every timer
const CLOCK_ROLLBACK_MS: u64 = 60 * 60 * 1000;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type TimerFn = Arc<dyn Fn() + Send + Sync + 'static>;

/// Receiver of "a new earliest deadline exists" notifications
pub trait TimerNotify: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

/// Handle to a registered timer
pub struct Timer {
    deadline_ms: AtomicU64,
    interval_ms: AtomicU64,
    recurring: bool,
    id: u64,
    cb: SpinLock<Option<TimerFn>>,
    mgr: Weak<TimerManager>,
}

impl Timer {
    fn arm(mgr: &Arc<TimerManager>, ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        Arc::new(Timer {
            deadline_ms: AtomicU64::new((mgr.clock)().saturating_add(ms)),
            interval_ms: AtomicU64::new(ms),
            recurring,
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            cb: SpinLock::new(Some(cb)),
            mgr: Arc::downgrade(mgr),
        })
    }

    #[inline]
    fn deadline(&self) -> u64 {
        self.deadline_ms.load(Ordering::Relaxed)
    }

    /// Unregister the timer. Returns false if it already fired, was
    /// cancelled, or its manager is gone.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut inner = mgr.write_inner();
        if self.cb.lock().take().is_none() {
            return false;
        }
        inner.timers.remove(&ByDeadline(Arc::clone(self)));
        true
    }

    /// Push the deadline out to now + interval without changing the
    /// interval. Returns false on an unregistered timer.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let mut inner = mgr.write_inner();
        if self.cb.lock().is_none() {
            return false;
        }
        inner.timers.remove(&ByDeadline(Arc::clone(self)));
        self.deadline_ms
            .store((mgr.clock)().saturating_add(self.interval_ms.load(Ordering::Relaxed)), Ordering::Relaxed);
        inner.timers.insert(ByDeadline(Arc::clone(self)));
        true
    }

    /// Change the interval. With `from_now` the new deadline counts
    /// from the current time, otherwise from the previous start.
    /// Returns false on an unregistered timer.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == self.interval_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(mgr) = self.mgr.upgrade() else {
            return false;
        };
        let at_front = {
            let mut inner = mgr.write_inner();
            if self.cb.lock().is_none() {
                return false;
            }
            inner.timers.remove(&ByDeadline(Arc::clone(self)));
            let start = if from_now {
                (mgr.clock)()
            } else {
                self.deadline()
                    .saturating_sub(self.interval_ms.load(Ordering::Relaxed))
            };
            self.interval_ms.store(ms, Ordering::Relaxed);
            self.deadline_ms.store(start.saturating_add(ms), Ordering::Relaxed);
            mgr.insert_locked(&mut inner, Arc::clone(self))
        };
        if at_front {
            mgr.notify_front();
        }
        true
    }
}

/// Ordering adaptor: (deadline, id)
struct ByDeadline(Arc<Timer>);

impl PartialEq for ByDeadline {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for ByDeadline {}

impl PartialOrd for ByDeadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByDeadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .deadline()
            .cmp(&other.0.deadline())
            .then(self.0.id.cmp(&other.0.id))
    }
}

struct TimerInner {
    timers: BTreeSet<ByDeadline>,
    /// Set when a front insert has been announced and not yet
    /// consumed by `get_next_timeout`
    tickled: bool,
    previous_time: u64,
}

/// Ordered collection of timers
pub struct TimerManager {
    inner: RwLock<TimerInner>,
    notifier: SpinLock<Option<Weak<dyn TimerNotify>>>,
    clock: fn() -> u64,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        Self::with_clock(current_ms)
    }

    /// Manager with an injected clock (tests)
    pub fn with_clock(clock: fn() -> u64) -> TimerManager {
        TimerManager {
            inner: RwLock::new(TimerInner {
                timers: BTreeSet::new(),
                tickled: false,
                previous_time: clock(),
            }),
            notifier: SpinLock::new(None),
            clock,
        }
    }

    /// Install the front-insert notifier. At most one; the reactor
    /// wires itself here right after construction.
    pub fn set_notifier(&self, notifier: Weak<dyn TimerNotify>) {
        *self.notifier.lock() = Some(notifier);
    }

    /// Register a timer firing `cb` after `ms` milliseconds,
    /// repeatedly if `recurring`.
    pub fn add_timer<F>(self: &Arc<Self>, ms: u64, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_fn(ms, Arc::new(cb), recurring)
    }

    /// Register a timer whose callback only runs while `cond` can
    /// still be upgraded.
    pub fn add_condition_timer<T, F>(
        self: &Arc<Self>,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        T: Send + Sync + 'static,
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    fn add_timer_fn(self: &Arc<Self>, ms: u64, cb: TimerFn, recurring: bool) -> Arc<Timer> {
        let timer = Timer::arm(self, ms, cb, recurring);
        let at_front = {
            let mut inner = self.write_inner();
            self.insert_locked(&mut inner, Arc::clone(&timer))
        };
        if at_front {
            self.notify_front();
        }
        timer
    }

    /// Insert under the write lock; true when the timer became the
    /// new earliest deadline and the latch was not already set.
    fn insert_locked(&self, inner: &mut TimerInner, timer: Arc<Timer>) -> bool {
        let id = timer.id;
        inner.timers.insert(ByDeadline(timer));
        let at_front = inner
            .timers
            .first()
            .map(|f| f.0.id == id)
            .unwrap_or(false);
        if at_front && !inner.tickled {
            inner.tickled = true;
            true
        } else {
            false
        }
    }

    fn notify_front(&self) {
        let notifier = self.notifier.lock().clone();
        if let Some(n) = notifier.and_then(|w| w.upgrade()) {
            n.on_timer_inserted_at_front();
        }
    }

    /// Milliseconds until the earliest deadline: `Some(0)` when
    /// overdue, `None` when no timer is registered. Re-arms the
    /// front-insert latch.
    pub fn get_next_timeout(&self) -> Option<u64> {
        let mut inner = self.write_inner();
        inner.tickled = false;
        let first = inner.timers.first()?;
        let deadline = first.0.deadline();
        Some(deadline.saturating_sub((self.clock)()))
    }

    /// Remove every expired timer and return its callback, re-arming
    /// recurring ones. A clock rollback beyond an hour expires all.
    pub fn collect_expired(&self) -> Vec<TimerFn> {
        let now = (self.clock)();
        let mut out = Vec::new();
        let mut inner = self.write_inner();
        if inner.timers.is_empty() {
            inner.previous_time = now;
            return out;
        }
        let rolled_back = now < inner.previous_time.saturating_sub(CLOCK_ROLLBACK_MS);
        inner.previous_time = now;

        let mut expired = Vec::new();
        while let Some(first) = inner.timers.first() {
            if !rolled_back && first.0.deadline() > now {
                break;
            }
            if let Some(t) = inner.timers.pop_first() {
                expired.push(t.0);
            }
        }

        for timer in expired {
            let cb = timer.cb.lock().clone();
            let Some(cb) = cb else { continue };
            out.push(Arc::clone(&cb));
            if timer.recurring {
                timer.deadline_ms.store(
                    now.saturating_add(timer.interval_ms.load(Ordering::Relaxed)),
                    Ordering::Relaxed,
                );
                inner.timers.insert(ByDeadline(timer));
            } else {
                *timer.cb.lock() = None;
            }
        }
        out
    }

    /// Whether any timer is registered
    pub fn has_timer(&self) -> bool {
        !self.read_inner().timers.is_empty()
    }

    #[cfg(test)]
    fn timer_count(&self) -> usize {
        self.read_inner().timers.len()
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, TimerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, TimerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock milliseconds since the Unix epoch
pub fn current_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn next_timeout_tracks_earliest() {
        let mgr = Arc::new(TimerManager::new());
        assert_eq!(mgr.get_next_timeout(), None);
        mgr.add_timer(100, || {}, false);
        mgr.add_timer(30, || {}, false);
        let next = mgr.get_next_timeout().unwrap();
        assert!(next <= 30, "next={}", next);
        assert!(mgr.has_timer());
    }

    static TIE_NOW: AtomicU64 = AtomicU64::new(0);
    fn tie_clock() -> u64 {
        TIE_NOW.load(Ordering::SeqCst)
    }

    #[test]
    fn equal_deadlines_fire_in_creation_order() {
        TIE_NOW.store(1_000, Ordering::SeqCst);
        let mgr = Arc::new(TimerManager::with_clock(tie_clock));
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 1..=3usize {
            let order = Arc::clone(&order);
            mgr.add_timer(50, move || order.lock().unwrap().push(tag), false);
        }
        assert_eq!(mgr.timer_count(), 3);

        TIE_NOW.store(1_050, Ordering::SeqCst);
        let cbs = mgr.collect_expired();
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(!mgr.has_timer());
    }

    static ROLL_NOW: AtomicU64 = AtomicU64::new(0);
    fn roll_clock() -> u64 {
        ROLL_NOW.load(Ordering::SeqCst)
    }

    #[test]
    fn clock_rollback_expires_everything() {
        ROLL_NOW.store(10_000_000, Ordering::SeqCst);
        let mgr = Arc::new(TimerManager::with_clock(roll_clock));
        mgr.add_timer(1_000_000, || {}, false);
        // Touch previous_time at 10_000_000
        assert!(mgr.collect_expired().is_empty());

        // Jump back beyond the one-hour tolerance
        ROLL_NOW.store(5_000_000, Ordering::SeqCst);
        let cbs = mgr.collect_expired();
        assert_eq!(cbs.len(), 1);
        assert!(!mgr.has_timer());
    }

    static REC_NOW: AtomicU64 = AtomicU64::new(0);
    fn rec_clock() -> u64 {
        REC_NOW.load(Ordering::SeqCst)
    }

    #[test]
    fn recurring_rearms_at_fire_time() {
        REC_NOW.store(500, Ordering::SeqCst);
        let mgr = Arc::new(TimerManager::with_clock(rec_clock));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        mgr.add_timer(100, move || { h.fetch_add(1, Ordering::SeqCst); }, true);

        REC_NOW.store(600, Ordering::SeqCst);
        for cb in mgr.collect_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(mgr.has_timer());
        assert_eq!(mgr.get_next_timeout(), Some(100));

        REC_NOW.store(700, Ordering::SeqCst);
        for cb in mgr.collect_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    static CXL_NOW: AtomicU64 = AtomicU64::new(0);
    fn cxl_clock() -> u64 {
        CXL_NOW.load(Ordering::SeqCst)
    }

    #[test]
    fn cancel_refresh_reset() {
        CXL_NOW.store(1_000, Ordering::SeqCst);
        let mgr = Arc::new(TimerManager::with_clock(cxl_clock));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let timer = mgr.add_timer(100, move || { h.fetch_add(1, Ordering::SeqCst); }, false);

        assert!(timer.refresh());
        assert!(timer.reset(200, true));
        assert_eq!(mgr.get_next_timeout(), Some(200));

        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(50, true));

        CXL_NOW.store(10_000, Ordering::SeqCst);
        assert!(mgr.collect_expired().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    static COND_NOW: AtomicU64 = AtomicU64::new(0);
    fn cond_clock() -> u64 {
        COND_NOW.load(Ordering::SeqCst)
    }

    #[test]
    fn condition_timer_skips_dead_guard() {
        COND_NOW.store(1_000, Ordering::SeqCst);
        let mgr = Arc::new(TimerManager::with_clock(cond_clock));
        let hits = Arc::new(AtomicUsize::new(0));

        let live_guard = Arc::new(());
        let h = Arc::clone(&hits);
        mgr.add_condition_timer(
            10,
            move || { h.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&live_guard),
            false,
        );

        let dead_guard = Arc::new(());
        let h = Arc::clone(&hits);
        mgr.add_condition_timer(
            10,
            move || { h.fetch_add(100, Ordering::SeqCst); },
            Arc::downgrade(&dead_guard),
            false,
        );
        drop(dead_guard);

        COND_NOW.store(2_000, Ordering::SeqCst);
        for cb in mgr.collect_expired() {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    struct CountingNotify {
        hits: AtomicUsize,
    }
    impl TimerNotify for CountingNotify {
        fn on_timer_inserted_at_front(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn front_insert_latch_fires_once() {
        let mgr = Arc::new(TimerManager::new());
        let notify = Arc::new(CountingNotify { hits: AtomicUsize::new(0) });
        mgr.set_notifier(Arc::downgrade(&notify) as Weak<dyn TimerNotify>);

        mgr.add_timer(100, || {}, false);
        assert_eq!(notify.hits.load(Ordering::SeqCst), 1);

        // Not at the front: no notification
        mgr.add_timer(200, || {}, false);
        assert_eq!(notify.hits.load(Ordering::SeqCst), 1);

        // At the front but the latch is still set
        mgr.add_timer(50, || {}, false);
        assert_eq!(notify.hits.load(Ordering::SeqCst), 1);

        // get_next_timeout re-arms the latch
        assert!(mgr.get_next_timeout().unwrap() <= 50);
        mgr.add_timer(10, || {}, false);
        assert_eq!(notify.hits.load(Ordering::SeqCst), 2);
    }
}
