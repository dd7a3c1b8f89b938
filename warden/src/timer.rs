//! Monotonic-millisecond timers for the worker loop.
//!
//! The list answers two questions each round: how long may the event wait
//! sleep (`next_run`), and which callbacks are due (`run`).  Callbacks are
//! plain function pointers over the caller's target type, so the list can
//! be held in one struct field while the target lives in another.

pub type TimerId = u64;

/// Timer callback: receives the target and the current monotonic clock.
pub type Callback<T> = fn(&mut T, u64);

struct Timer<T> {
    id: TimerId,
    interval: u64,
    nextrun: u64,
    oneshot: bool,
    cb: Callback<T>,
}

pub struct TimerList<T> {
    timers: Vec<Timer<T>>,
    next_id: TimerId,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 1,
        }
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `cb` to fire every `interval` ms (or once, for oneshots),
    /// first at `now + interval`.
    pub fn add(&mut self, now: u64, interval: u64, oneshot: bool, cb: Callback<T>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.timers.push(Timer {
            id,
            interval,
            nextrun: now + interval,
            oneshot,
            cb,
        });
        id
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        self.timers.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Milliseconds until the earliest timer fires; `None` when the list
    /// is empty and the event wait may sleep forever.
    pub fn next_run(&self, now: u64) -> Option<u64> {
        self.timers
            .iter()
            .map(|t| t.nextrun.saturating_sub(now))
            .min()
    }

    /// Fire every timer that is due, re-arming periodic ones.
    pub fn run(&mut self, now: u64, target: &mut T) -> usize {
        let mut fired = 0;

        let mut due = Vec::new();
        self.timers.retain_mut(|t| {
            if t.nextrun > now {
                return true;
            }
            due.push(t.cb);
            if t.oneshot {
                false
            } else {
                t.nextrun = now + t.interval;
                true
            }
        });

        for cb in due {
            cb(target, now);
            fired += 1;
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Hits {
        ticks: u32,
        sweeps: u32,
    }

    fn tick(h: &mut Hits, _now: u64) {
        h.ticks += 1;
    }

    fn sweep(h: &mut Hits, _now: u64) {
        h.sweeps += 1;
    }

    #[test]
    fn test_next_run_ordering() {
        let mut list = TimerList::new();
        assert_eq!(list.next_run(0), None);

        list.add(0, 500, false, tick);
        list.add(0, 100, false, sweep);
        assert_eq!(list.next_run(0), Some(100));
        assert_eq!(list.next_run(50), Some(50));
        // overdue timers clamp to zero rather than underflowing
        assert_eq!(list.next_run(1000), Some(0));
    }

    #[test]
    fn test_periodic_rearms() {
        let mut list = TimerList::new();
        let mut hits = Hits::default();

        list.add(0, 100, false, tick);
        assert_eq!(list.run(99, &mut hits), 0);
        assert_eq!(list.run(100, &mut hits), 1);
        assert_eq!(list.run(150, &mut hits), 0);
        assert_eq!(list.run(200, &mut hits), 1);
        assert_eq!(hits.ticks, 2);
        assert!(!list.is_empty());
    }

    #[test]
    fn test_oneshot_fires_once() {
        let mut list = TimerList::new();
        let mut hits = Hits::default();

        list.add(0, 10, true, sweep);
        assert_eq!(list.run(10, &mut hits), 1);
        assert_eq!(list.run(1000, &mut hits), 0);
        assert_eq!(hits.sweeps, 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut list = TimerList::new();
        let id = list.add(0, 10, false, tick);
        assert!(list.remove(id));
        assert!(!list.remove(id));
        assert_eq!(list.next_run(0), None);
    }
}
