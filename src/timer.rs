use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::reactor::wheel::TimerId;
use crate::reactor::Reactor;
use crate::signal::Signal;

/// A coarse timer scheduled on the reactor's hashed wheel.
///
/// Deadlines round up to the wheel's 512 ms tick, so a timer started with
/// interval `I` fires somewhere in `[I, I + 1024]` milliseconds. A timer
/// set to 0 ms still waits one full tick.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use kestrel_io::{Reactor, Timer};
///
/// let reactor = Reactor::new().unwrap();
/// let timer = Timer::new(&reactor);
/// timer.set_single_shot(true);
/// let _subscription = timer.timeout().connect(|_| println!("expired"));
/// timer.start_with(3500);
///
/// loop {
///     reactor.turn(Some(Duration::from_millis(100))).unwrap();
/// }
/// ```
pub struct Timer {
    core: Rc<TimerCore>,
}

pub(crate) struct TimerCore {
    reactor: Reactor,
    id: Cell<TimerId>,
    timeout: Signal<()>,
}

impl Timer {
    pub fn new(reactor: &Reactor) -> Timer {
        let core = Rc::new(TimerCore {
            reactor: reactor.clone(),
            id: Cell::new(usize::MAX),
            timeout: Signal::new(),
        });
        let id = reactor
            .inner()
            .wheel
            .borrow_mut()
            .create_timer(Rc::downgrade(&core));
        core.id.set(id);
        Timer { core }
    }

    /// Activates (or re-activates) the timer with the stored interval.
    pub fn start(&self) {
        let interval = self.interval();
        self.core.activate(interval);
    }

    /// Activates (or re-activates) the timer with `interval_ms`, which also
    /// becomes the stored interval.
    pub fn start_with(&self, interval_ms: u64) {
        self.core.activate(interval_ms);
    }

    pub fn stop(&self) {
        self.core.deactivate();
    }

    pub fn is_active(&self) -> bool {
        let inner = self.core.reactor.inner();
        let active = inner.wheel.borrow().is_active(self.core.id.get());
        active
    }

    pub fn interval(&self) -> u64 {
        let inner = self.core.reactor.inner();
        let interval = inner.wheel.borrow().interval(self.core.id.get());
        interval
    }

    /// Stores `interval_ms`; an active timer atomically reschedules with
    /// the new interval.
    pub fn set_interval(&self, interval_ms: u64) {
        if self.is_active() {
            self.core.activate(interval_ms);
        } else {
            let inner = self.core.reactor.inner();
            inner
                .wheel
                .borrow_mut()
                .set_interval(self.core.id.get(), interval_ms);
        }
    }

    pub fn is_single_shot(&self) -> bool {
        let inner = self.core.reactor.inner();
        let single_shot = inner.wheel.borrow().is_single_shot(self.core.id.get());
        single_shot
    }

    /// A single-shot timer stays inactive after expiring; otherwise it is
    /// restarted with the current interval before the timeout observers
    /// run.
    pub fn set_single_shot(&self, single_shot: bool) {
        let inner = self.core.reactor.inner();
        inner
            .wheel
            .borrow_mut()
            .set_single_shot(self.core.id.get(), single_shot);
    }

    /// Emitted on expiry.
    pub fn timeout(&self) -> &Signal<()> {
        &self.core.timeout
    }
}

impl TimerCore {
    fn activate(&self, interval_ms: u64) {
        let inner = self.reactor.inner();
        if inner.is_active() {
            inner.wheel.borrow_mut().add(self.id.get(), interval_ms);
        }
    }

    fn deactivate(&self) {
        let inner = self.reactor.inner();
        if inner.is_active() {
            inner.wheel.borrow_mut().remove(self.id.get());
        }
    }

    /// Called by the wheel after the entry has been unlinked and marked
    /// inactive. Restarting first lets observers that call `stop()` or
    /// `start()` on the timer override the default reschedule.
    pub(crate) fn process_timeout(&self) {
        let (single_shot, interval) = {
            let inner = self.reactor.inner();
            let wheel = inner.wheel.borrow();
            (
                wheel.is_single_shot(self.id.get()),
                wheel.interval(self.id.get()),
            )
        };
        if !single_shot {
            self.activate(interval);
        }
        self.timeout.emit(());
    }
}

impl Drop for TimerCore {
    fn drop(&mut self) {
        let inner = self.reactor.inner();
        if inner.is_active() {
            inner.wheel.borrow_mut().destroy_timer(self.id.get());
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Timer {{ interval: {} ms, active: {} }}",
            self.interval(),
            self.is_active()
        )
    }
}
