//! Coarse timer wheel.
//!
//! # Responsibilities
//! - Track connect, headers, body, keep-alive and retry deadlines
//! - Fire expired callbacks in deadline order
//! - Tell the runtime driver when it has to wake up
//!
//! # Design Decisions
//! - One thread-local wheel shared by every dispatcher on the thread
//! - Timers of a second or more are batched onto 500ms ticks; shorter ones
//!   keep their exact deadline
//! - The wheel is idle when empty: the driver is woken on first
//!   registration and stops once nothing is left
//! - Cancelled timers leave the cached wake-up in place; the driver wakes,
//!   finds nothing due and recomputes

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::dispatcher::tasks;

const TICK: Duration = Duration::from_millis(500);
const COARSE_THRESHOLD: Duration = Duration::from_secs(1);

/// Runtime integration that calls [`advance`] when timers are due.
pub trait TimerDriver {
    /// The earliest wake-up moved earlier, or the wheel became active.
    fn wake(&self);
}

/// Handle for cancelling a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    slot: usize,
    seq: u64,
}

struct Timer {
    seq: u64,
    deadline: Instant,
    wake_at: Instant,
    callback: Box<dyn FnOnce()>,
}

struct Wheel {
    timers: Slab<Timer>,
    seq: u64,
    epoch: Instant,
    earliest: Option<Instant>,
    driver: Option<Rc<dyn TimerDriver>>,
}

impl Wheel {
    fn new() -> Self {
        Self {
            timers: Slab::new(),
            seq: 0,
            epoch: Instant::now(),
            earliest: None,
            driver: None,
        }
    }

    /// Round `deadline` up to the next tick boundary.
    fn coarse(&self, deadline: Instant) -> Instant {
        let since = deadline.saturating_duration_since(self.epoch).as_millis();
        let tick = TICK.as_millis();
        let ticks = since.div_ceil(tick);
        self.epoch + Duration::from_millis((ticks * tick) as u64)
    }

    fn recompute_earliest(&mut self) {
        self.earliest = self.timers.iter().map(|(_, t)| t.wake_at).min();
    }
}

thread_local! {
    static WHEEL: RefCell<Wheel> = RefCell::new(Wheel::new());
}

/// Run `callback` once `delay` has elapsed.
pub fn schedule(delay: Duration, callback: impl FnOnce() + 'static) -> TimerKey {
    let deadline = Instant::now() + delay;
    let (key, driver) = WHEEL.with(|w| {
        let mut wheel = w.borrow_mut();
        let wake_at = if delay >= COARSE_THRESHOLD {
            wheel.coarse(deadline)
        } else {
            deadline
        };
        wheel.seq += 1;
        let seq = wheel.seq;
        let slot = wheel.timers.insert(Timer {
            seq,
            deadline,
            wake_at,
            callback: Box::new(callback),
        });
        let wake = wheel.earliest.map_or(true, |e| wake_at < e);
        if wake {
            wheel.earliest = Some(wake_at);
        }
        let driver = if wake { wheel.driver.clone() } else { None };
        (TimerKey { slot, seq }, driver)
    });
    if let Some(driver) = driver {
        driver.wake();
    }
    key
}

/// Cancel a timer. Unknown or already fired keys are ignored.
pub fn cancel(key: TimerKey) {
    WHEEL.with(|w| {
        let mut wheel = w.borrow_mut();
        if wheel.timers.get(key.slot).is_some_and(|t| t.seq == key.seq) {
            wheel.timers.remove(key.slot);
            if wheel.timers.is_empty() {
                wheel.earliest = None;
            }
        }
    });
}

/// Fire every timer whose deadline is at or before `now`.
///
/// Returns the number of timers fired.
pub fn advance(now: Instant) -> usize {
    let due = WHEEL.with(|w| {
        let mut wheel = w.borrow_mut();
        let mut expired: Vec<usize> = wheel
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(slot, _)| slot)
            .collect();
        expired.sort_by_key(|&slot| (wheel.timers[slot].deadline, wheel.timers[slot].seq));
        let due: Vec<Box<dyn FnOnce()>> = expired
            .into_iter()
            .map(|slot| wheel.timers.remove(slot).callback)
            .collect();
        wheel.recompute_earliest();
        due
    });
    let fired = due.len();
    if fired > 0 {
        tracing::trace!(fired, "timers expired");
        tasks::enter(|| {
            for callback in due {
                tasks::defer(callback);
            }
        });
    }
    fired
}

/// When the driver should next call [`advance`]. `None` when idle.
pub fn next_wakeup() -> Option<Instant> {
    WHEEL.with(|w| {
        let mut wheel = w.borrow_mut();
        wheel.recompute_earliest();
        wheel.earliest
    })
}

/// Number of scheduled timers.
pub fn pending() -> usize {
    WHEEL.with(|w| w.borrow().timers.len())
}

/// Register the runtime driver for this thread.
pub fn install_driver(driver: Rc<dyn TimerDriver>) {
    let active = WHEEL.with(|w| {
        let mut wheel = w.borrow_mut();
        wheel.driver = Some(driver.clone());
        !wheel.timers.is_empty()
    });
    if active {
        driver.wake();
    }
}

/// Drop every timer and the driver.
pub fn shutdown() {
    let dropped = WHEEL.with(|w| {
        let mut wheel = w.borrow_mut();
        wheel.driver = None;
        wheel.earliest = None;
        std::mem::take(&mut wheel.timers)
    });
    drop(dropped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingDriver {
        wakes: Cell<usize>,
    }

    impl TimerDriver for CountingDriver {
        fn wake(&self) {
            self.wakes.set(self.wakes.get() + 1);
        }
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (log.clone(), log.clone());
        schedule(Duration::from_millis(200), move || a.borrow_mut().push("late"));
        schedule(Duration::from_millis(100), move || b.borrow_mut().push("early"));

        assert_eq!(advance(Instant::now()), 0);
        assert_eq!(advance(Instant::now() + Duration::from_millis(300)), 2);
        assert_eq!(*log.borrow(), vec!["early", "late"]);
        assert_eq!(pending(), 0);
        assert_eq!(next_wakeup(), None);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        let key = schedule(Duration::from_millis(10), move || h.set(true));
        cancel(key);
        cancel(key);
        advance(Instant::now() + Duration::from_secs(1));
        assert!(!hit.get());
    }

    #[test]
    fn test_stale_key_does_not_cancel_reused_slot() {
        let first = schedule(Duration::from_millis(10), || {});
        cancel(first);
        let hit = Rc::new(Cell::new(false));
        let h = hit.clone();
        schedule(Duration::from_millis(10), move || h.set(true));
        cancel(first);
        advance(Instant::now() + Duration::from_secs(1));
        assert!(hit.get());
    }

    #[test]
    fn test_long_timers_wake_on_tick_boundaries() {
        let before = Instant::now();
        schedule(Duration::from_millis(1_234), || {});
        let wake = next_wakeup().unwrap();
        assert!(wake >= before + Duration::from_millis(1_234));
        assert!(wake <= before + Duration::from_millis(1_234) + TICK + Duration::from_millis(50));
        shutdown();
    }

    #[test]
    fn test_driver_woken_on_first_registration() {
        let driver = Rc::new(CountingDriver::default());
        install_driver(driver.clone());
        schedule(Duration::from_secs(5), || {});
        schedule(Duration::from_secs(10), || {});
        assert_eq!(driver.wakes.get(), 1);
        schedule(Duration::from_millis(5), || {});
        assert_eq!(driver.wakes.get(), 2);
        shutdown();
        assert_eq!(pending(), 0);
    }

    #[test]
    fn test_callbacks_may_schedule_more_timers() {
        let hit = Rc::new(Cell::new(0));
        let h = hit.clone();
        schedule(Duration::from_millis(1), move || {
            let inner = h.clone();
            h.set(1);
            schedule(Duration::from_millis(1), move || inner.set(2));
        });
        advance(Instant::now() + Duration::from_millis(10));
        assert_eq!(hit.get(), 1);
        advance(Instant::now() + Duration::from_millis(20));
        assert_eq!(hit.get(), 2);
    }
}
