use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Weak;
use std::time::Duration;

use slab::Slab;

use super::{EventSource, Inner};
use crate::ready::Ready;
use crate::sys::timerfd::TimerFd;
use crate::timer::TimerCore;

pub(crate) type TimerId = usize;

/// Quantum of the hashed wheel. All deadlines round up to the next tick.
pub(crate) const TICK_MS: u64 = 512;
const TICK: Duration = Duration::from_millis(TICK_MS);
const SLOT_COUNT: usize = 128;
const SLOT_MASK: u64 = (SLOT_COUNT as u64) - 1;

pub(crate) struct TimerEntry {
    interval_ms: u64,
    deadline_tick: u64,
    single_shot: bool,
    active: bool,
    next: Option<TimerId>,
    prev: Option<TimerId>,
    observer: Weak<TimerCore>,
}

/// 128-slot hashed timing wheel driven by one timer descriptor with a
/// 512 ms period. Time is counted in ticks, not wall-clock milliseconds.
pub(crate) struct TimerWheel {
    timer_fd: TimerFd,
    slots: [Option<TimerId>; SLOT_COUNT],
    timers: Slab<TimerEntry>,
    active_count: usize,
    next_tick: u64,
    /// Walk cursor of the tick in progress; `remove` advances it when the
    /// pointed-at timer goes away mid-walk.
    in_flight: Option<TimerId>,
    internal_timer_active: bool,
}

impl TimerWheel {
    pub(crate) fn new() -> io::Result<TimerWheel> {
        Ok(TimerWheel {
            timer_fd: TimerFd::new()?,
            slots: [None; SLOT_COUNT],
            timers: Slab::new(),
            active_count: 0,
            next_tick: 0,
            in_flight: None,
            internal_timer_active: false,
        })
    }

    pub(crate) fn file_descriptor(&self) -> RawFd {
        self.timer_fd.as_raw_fd()
    }

    pub(crate) fn disarm(&self) -> io::Result<()> {
        self.timer_fd.disarm()
    }

    pub(crate) fn create_timer(&mut self, observer: Weak<TimerCore>) -> TimerId {
        self.timers.insert(TimerEntry {
            interval_ms: 0,
            deadline_tick: 0,
            single_shot: false,
            active: false,
            next: None,
            prev: None,
            observer,
        })
    }

    pub(crate) fn destroy_timer(&mut self, id: TimerId) {
        self.remove(id);
        self.timers.remove(id);
    }

    pub(crate) fn is_active(&self, id: TimerId) -> bool {
        self.timers[id].active
    }

    pub(crate) fn interval(&self, id: TimerId) -> u64 {
        self.timers[id].interval_ms
    }

    pub(crate) fn set_interval(&mut self, id: TimerId, interval_ms: u64) {
        self.timers[id].interval_ms = interval_ms;
    }

    pub(crate) fn is_single_shot(&self, id: TimerId) -> bool {
        self.timers[id].single_shot
    }

    pub(crate) fn set_single_shot(&mut self, id: TimerId, single_shot: bool) {
        self.timers[id].single_shot = single_shot;
    }

    /// Activates `id` with `interval_ms`. An already-active timer keeps its
    /// place when the computed deadline does not change, and is re-linked
    /// otherwise.
    pub(crate) fn add(&mut self, id: TimerId, interval_ms: u64) {
        if self.active_count == 0 {
            self.activate_internal_timer();
        }
        self.timers[id].interval_ms = interval_ms;
        let deadline_tick = (interval_ms >> 9) + 1 + self.next_tick;
        if self.timers[id].active {
            if deadline_tick == self.timers[id].deadline_tick {
                return;
            }
            self.remove(id);
        }
        self.active_count += 1;
        let entry = &mut self.timers[id];
        entry.active = true;
        entry.deadline_tick = deadline_tick;
        let slot = (deadline_tick & SLOT_MASK) as usize;
        let old_head = self.slots[slot];
        self.timers[id].next = old_head;
        self.timers[id].prev = None;
        if let Some(head) = old_head {
            self.timers[head].prev = Some(id);
        }
        self.slots[slot] = Some(id);
    }

    pub(crate) fn remove(&mut self, id: TimerId) {
        if !self.timers[id].active {
            return;
        }
        self.active_count -= 1;
        let (prev, next, deadline_tick) = {
            let entry = &mut self.timers[id];
            entry.active = false;
            (entry.prev, entry.next, entry.deadline_tick)
        };
        if let Some(prev) = prev {
            self.timers[prev].next = next;
        }
        if let Some(next) = next {
            self.timers[next].prev = prev;
        }
        let slot = (deadline_tick & SLOT_MASK) as usize;
        if self.slots[slot] == Some(id) {
            self.slots[slot] = next;
        }
        if self.in_flight == Some(id) {
            self.in_flight = next;
        }
        self.timers[id].next = None;
        self.timers[id].prev = None;
    }

    fn activate_internal_timer(&mut self) {
        if self.internal_timer_active {
            return;
        }
        self.internal_timer_active = true;
        self.next_tick = 1;
        if let Err(err) = self.timer_fd.set(TICK, TICK) {
            panic!("failed to arm the timer-wheel descriptor: {err}");
        }
    }

    fn deactivate_internal_timer(&mut self) {
        if !self.internal_timer_active {
            return;
        }
        self.internal_timer_active = false;
        self.timer_fd.read_expirations();
        if let Err(err) = self.timer_fd.disarm() {
            panic!("failed to disarm the timer-wheel descriptor: {err}");
        }
    }
}

pub(crate) struct WheelSource {
    pub(crate) inner: Weak<Inner>,
}

impl EventSource for WheelSource {
    fn on_event(&self, events: Ready) {
        if events.is_readable() {
            if let Some(inner) = self.inner.upgrade() {
                let elapsed_ticks = inner.wheel.borrow().timer_fd.read_expirations();
                if elapsed_ticks > 0 {
                    inner.process_expired_timers(elapsed_ticks);
                }
            }
        }
    }
}

enum WalkStep {
    Done,
    Fire(Weak<TimerCore>),
}

impl Inner {
    /// Walks every tick elapsed since the last fire. Each expiring timer is
    /// unlinked and marked inactive before its observer runs, so observers
    /// that restart or stop their own timer win over the default
    /// reschedule. Observers may add or remove arbitrary timers.
    pub(crate) fn process_expired_timers(&self, elapsed_ticks: u64) {
        let (last_tick, next_tick) = {
            let mut wheel = self.wheel.borrow_mut();
            let last = wheel.next_tick;
            wheel.next_tick += elapsed_ticks;
            (last, wheel.next_tick)
        };
        for tick in last_tick..next_tick {
            {
                let mut wheel = self.wheel.borrow_mut();
                wheel.in_flight = wheel.slots[(tick & SLOT_MASK) as usize];
            }
            loop {
                let step = {
                    let mut wheel = self.wheel.borrow_mut();
                    loop {
                        match wheel.in_flight {
                            None => break WalkStep::Done,
                            Some(id) => {
                                if wheel.timers[id].deadline_tick > tick {
                                    wheel.in_flight = wheel.timers[id].next;
                                    continue;
                                }
                                let observer = wheel.timers[id].observer.clone();
                                wheel.remove(id);
                                break WalkStep::Fire(observer);
                            }
                        }
                    }
                };
                match step {
                    WalkStep::Done => break,
                    WalkStep::Fire(observer) => {
                        if let Some(core) = observer.upgrade() {
                            core.process_timeout();
                        }
                    }
                }
            }
        }
        let mut wheel = self.wheel.borrow_mut();
        wheel.in_flight = None;
        if wheel.active_count == 0 {
            wheel.deactivate_internal_timer();
        }
    }
}
