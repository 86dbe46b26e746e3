use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use slab::Slab;

type SlotTable<T> = Rc<RefCell<Slab<Rc<dyn Fn(T)>>>>;

/// A named event on an owning type.
///
/// Observers subscribe a callable with [`Signal::connect`] and stay
/// subscribed for as long as they keep the returned [`Subscription`].
/// Dispatch is synchronous on the reactor thread; a callback may re-enter
/// the emitter's public API.
///
/// # Examples
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use kestrel_io::Signal;
///
/// let fired = Rc::new(Cell::new(0));
/// let signal: Signal<usize> = Signal::new();
///
/// let observed = fired.clone();
/// let subscription = signal.connect(move |n| observed.set(observed.get() + n));
///
/// signal.emit(2);
/// signal.emit(3);
/// assert_eq!(fired.get(), 5);
///
/// drop(subscription);
/// signal.emit(7);
/// assert_eq!(fired.get(), 5);
/// ```
pub struct Signal<T: Copy = ()> {
    slots: SlotTable<T>,
}

impl<T: Copy + 'static> Signal<T> {
    pub fn new() -> Signal<T> {
        Signal {
            slots: Rc::new(RefCell::new(Slab::new())),
        }
    }

    /// Subscribes `observer`; dropping the returned token unsubscribes it.
    pub fn connect(&self, observer: impl Fn(T) + 'static) -> Subscription {
        let key = self.slots.borrow_mut().insert(Rc::new(observer));
        let slots = Rc::downgrade(&self.slots);
        Subscription {
            unsubscribe: Box::new(move || {
                if let Some(slots) = slots.upgrade() {
                    let mut slots = slots.borrow_mut();
                    if slots.contains(key) {
                        slots.remove(key);
                    }
                }
            }),
        }
    }

    /// Invokes every observer subscribed at the time of the call.
    /// Observers connected or dropped from within a callback take effect
    /// for the next emission.
    pub fn emit(&self, value: T) {
        let observers: Vec<Rc<dyn Fn(T)>> =
            self.slots.borrow().iter().map(|(_, f)| f.clone()).collect();
        for observer in observers {
            observer(value);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.slots.borrow().len()
    }
}

impl<T: Copy + 'static> Default for Signal<T> {
    fn default() -> Self {
        Signal::new()
    }
}

impl<T: Copy> fmt::Debug for Signal<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Signal({} observers)", self.slots.borrow().len())
    }
}

/// Subscription token returned by [`Signal::connect`]; unsubscribes on drop.
pub struct Subscription {
    unsubscribe: Box<dyn FnOnce()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let unsubscribe = std::mem::replace(&mut self.unsubscribe, Box::new(|| {}));
        unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Subscription")
    }
}

/// Keeps `Weak` observer plumbing out of subscriber code: upgrades the weak
/// reference on every emission and drops the event when the target is gone.
pub(crate) fn connect_weak<S: 'static, T: Copy + 'static>(
    signal: &Signal<T>,
    target: &Weak<S>,
    observer: impl Fn(&S, T) + 'static,
) -> Subscription {
    let target = target.clone();
    signal.connect(move |value| {
        if let Some(target) = target.upgrade() {
            observer(&target, value);
        }
    })
}

#[cfg(test)]
mod test {
    use super::Signal;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[test]
    fn observers_fire_in_subscription_order_independent_state() {
        let signal: Signal<()> = Signal::new();
        let count = Rc::new(Cell::new(0));

        let c1 = count.clone();
        let _s1 = signal.connect(move |_| c1.set(c1.get() + 1));
        let c2 = count.clone();
        let _s2 = signal.connect(move |_| c2.set(c2.get() + 1));

        signal.emit(());
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn dropping_subscription_inside_emission_defers_to_next_emit() {
        let signal: Rc<Signal<()>> = Rc::new(Signal::new());
        let hits = Rc::new(Cell::new(0));
        let held = Rc::new(RefCell::new(None));

        let hits_inner = hits.clone();
        let held_inner = held.clone();
        let subscription = signal.connect(move |_| {
            hits_inner.set(hits_inner.get() + 1);
            // drop ourselves mid-emission
            held_inner.borrow_mut().take();
        });
        *held.borrow_mut() = Some(subscription);

        signal.emit(());
        signal.emit(());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn emit_carries_value() {
        let signal: Signal<usize> = Signal::new();
        let seen = Rc::new(Cell::new(0usize));
        let inner = seen.clone();
        let _s = signal.connect(move |n| inner.set(inner.get() + n));
        signal.emit(41);
        signal.emit(1);
        assert_eq!(seen.get(), 42);
    }
}
