use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::error;
use slab::Slab;

use crate::interest::Interest;
use crate::ready::Ready;
use crate::sys::epoll::{Epoll, Events, INVALID_KEY};
use crate::tls::context::ContextCache;

pub(crate) mod deleter;
pub(crate) mod ready_queue;
pub(crate) mod resolver;
pub(crate) mod wheel;

use deleter::DeferredDeleter;
use ready_queue::ReadyQueue;
use resolver::Resolver;
use wheel::TimerWheel;

const MAX_TRIGGERED_EVENTS: usize = 1 << 16;

/// Stable index of a registered event source in the reactor's slab.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SourceId(pub(crate) usize);

/// The callback half of an event-source registration.
///
/// Implementors are held behind `Rc` by their owner; the reactor keeps only
/// a weak reference and skips dispatch once the handler is gone.
pub trait EventSource: 'static {
    fn on_event(&self, events: Ready);
}

pub(crate) struct SourceSlot {
    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    pub(crate) enabled: bool,
    pub(crate) in_ready_list: bool,
    pub(crate) posted: Ready,
    pub(crate) ready_next: Option<SourceId>,
    pub(crate) ready_prev: Option<SourceId>,
    pub(crate) handler: Weak<dyn EventSource>,
}

pub(crate) struct Inner {
    epoll: Epoll,
    events: RefCell<Events>,
    cursor: Cell<usize>,
    dispatching: Cell<bool>,
    active: Cell<bool>,
    running: Cell<bool>,
    pub(crate) sources: RefCell<Slab<SourceSlot>>,
    pub(crate) wheel: RefCell<TimerWheel>,
    pub(crate) deleter: DeferredDeleter,
    pub(crate) ready_queue: ReadyQueue,
    pub(crate) resolver: RefCell<Option<Resolver>>,
    pub(crate) tls_cache: RefCell<ContextCache>,
    internal_handlers: RefCell<Vec<Rc<dyn EventSource>>>,
}

/// The per-thread reactor: owns the epoll instance, the timer wheel, the
/// deferred deleter and the posted-event queue, and dispatches readiness to
/// registered event sources.
///
/// One reactor lives per worker thread; handles are cheap to clone and all
/// reactor-owned objects must stay on the thread that created them.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use kestrel_io::Reactor;
///
/// let reactor = Reactor::new().unwrap();
/// loop {
///     reactor.turn(Some(Duration::from_millis(100))).unwrap();
/// }
/// ```
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<Inner>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let inner = Rc::new(Inner {
            epoll: Epoll::new()?,
            events: RefCell::new(Events::with_capacity(MAX_TRIGGERED_EVENTS)),
            cursor: Cell::new(0),
            dispatching: Cell::new(false),
            active: Cell::new(true),
            running: Cell::new(false),
            sources: RefCell::new(Slab::new()),
            wheel: RefCell::new(TimerWheel::new()?),
            deleter: DeferredDeleter::new()?,
            ready_queue: ReadyQueue::new()?,
            resolver: RefCell::new(None),
            tls_cache: RefCell::new(ContextCache::new()),
            internal_handlers: RefCell::new(Vec::new()),
        });

        let wheel_fd = inner.wheel.borrow().file_descriptor();
        let wheel_source = Rc::new(wheel::WheelSource {
            inner: Rc::downgrade(&inner),
        });
        inner.attach_internal(wheel_fd, wheel_source);

        let deleter_source = Rc::new(deleter::DeleterSource {
            inner: Rc::downgrade(&inner),
        });
        inner.attach_internal(inner.deleter.file_descriptor(), deleter_source);

        let ready_source = Rc::new(ready_queue::ReadyQueueSource {
            inner: Rc::downgrade(&inner),
        });
        inner.attach_internal(inner.ready_queue.file_descriptor(), ready_source);

        Ok(Reactor { inner })
    }

    /// Waits up to `timeout` for the reactor's own descriptor to become
    /// readable and, if it does, runs one dispatch turn. Returns whether a
    /// turn ran. `None` waits indefinitely.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let timeout_ms = timeout
            .map(|to| to.as_millis().min(libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);
        let mut pollfd = libc::pollfd {
            fd: self.inner.epoll.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let count = loop {
            match syscall!(poll(&mut pollfd, 1, timeout_ms)) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other?,
            }
        };
        if count > 0 {
            self.process_events();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Runs one reactor turn: a non-blocking drain of triggered readiness
    /// followed by dispatch to the affected sources. Re-entrant calls are
    /// no-ops.
    pub fn process_events(&self) {
        self.inner.process_events();
    }

    /// Drives turns until [`quit`](Reactor::quit) is called.
    pub fn run(&self) -> io::Result<()> {
        self.inner.running.set(true);
        while self.inner.running.get() {
            self.turn(Some(Duration::from_millis(100)))?;
        }
        Ok(())
    }

    /// Makes [`run`](Reactor::run) return once the turn in progress has
    /// finished. Callable from within callbacks.
    pub fn quit(&self) {
        self.inner.running.set(false);
    }

    /// Queues `object` for destruction on the next reactor turn. Outside a
    /// turn, or once the reactor has shut down, the object is dropped
    /// immediately.
    pub fn schedule_for_deletion(&self, object: Box<dyn Any>) {
        if self.inner.active.get() && self.inner.dispatching.get() {
            self.inner.deleter.schedule(object);
        } else {
            drop(object);
        }
    }

    pub(crate) fn inner(&self) -> &Rc<Inner> {
        &self.inner
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Reactor {{ sources: {} }}",
            self.inner.sources.borrow().len()
        )
    }
}

impl Inner {
    /// Registers one of the reactor's own sources: enabled from the start,
    /// edge-triggered readable. Failure here is unrecoverable.
    pub(crate) fn attach_internal(&self, fd: RawFd, handler: Rc<dyn EventSource>) -> SourceId {
        let interest = Interest::readable() | Interest::edge();
        let key = self.sources.borrow_mut().insert(SourceSlot {
            fd,
            interest,
            enabled: true,
            in_ready_list: false,
            posted: Ready::empty(),
            ready_next: None,
            ready_prev: None,
            handler: Rc::downgrade(&handler),
        });
        if let Err(err) = self.epoll.add(fd, key as u64, interest) {
            panic!("failed to add internal event source to epoll instance: {err}");
        }
        self.internal_handlers.borrow_mut().push(handler);
        SourceId(key)
    }

    pub(crate) fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: Weak<dyn EventSource>,
    ) -> SourceId {
        let key = self.sources.borrow_mut().insert(SourceSlot {
            fd,
            interest,
            enabled: false,
            in_ready_list: false,
            posted: Ready::empty(),
            ready_next: None,
            ready_prev: None,
            handler,
        });
        SourceId(key)
    }

    pub(crate) fn deregister(&self, id: SourceId) {
        if self.sources.borrow()[id.0].enabled {
            self.set_enabled(id, false);
        }
        self.remove_ready_event(id);
        self.sources.borrow_mut().remove(id.0);
    }

    pub(crate) fn is_enabled(&self, id: SourceId) -> bool {
        self.sources.borrow()[id.0].enabled
    }

    pub(crate) fn set_enabled(&self, id: SourceId, enabled: bool) {
        let (fd, interest) = {
            let mut sources = self.sources.borrow_mut();
            let slot = &mut sources[id.0];
            if slot.enabled == enabled {
                return;
            }
            slot.enabled = enabled;
            (slot.fd, slot.interest)
        };
        if !self.active.get() {
            return;
        }
        if enabled {
            if let Err(err) = self.epoll.add(fd, id.0 as u64, interest) {
                panic!("failed to add event source to epoll instance: {err}");
            }
        } else {
            if let Err(err) = self.epoll.delete(fd) {
                panic!("failed to remove event source from epoll instance: {err}");
            }
            self.invalidate_pending(id);
        }
    }

    pub(crate) fn interest(&self, id: SourceId) -> Interest {
        self.sources.borrow()[id.0].interest
    }

    pub(crate) fn set_interest(&self, id: SourceId, interest: Interest) {
        let (fd, enabled) = {
            let mut sources = self.sources.borrow_mut();
            let slot = &mut sources[id.0];
            if slot.interest == interest {
                return;
            }
            slot.interest = interest;
            (slot.fd, slot.enabled)
        };
        if enabled && self.active.get() {
            if let Err(err) = self.epoll.modify(fd, id.0 as u64, interest) {
                panic!("failed to modify event source of epoll instance: {err}");
            }
            self.invalidate_pending(id);
        }
    }

    pub(crate) fn file_descriptor(&self, id: SourceId) -> RawFd {
        self.sources.borrow()[id.0].fd
    }

    pub(crate) fn set_file_descriptor(&self, id: SourceId, fd: RawFd) {
        let mut sources = self.sources.borrow_mut();
        let slot = &mut sources[id.0];
        debug_assert!(!slot.enabled, "file descriptor changed while enabled");
        slot.fd = fd;
    }

    pub(crate) fn is_dispatching(&self) -> bool {
        self.dispatching.get()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.get()
    }

    fn process_events(&self) {
        if !self.active.get() || self.dispatching.get() {
            return;
        }
        self.dispatching.set(true);
        // no problem if the wait gets interrupted by a signal
        let count = {
            let mut events = self.events.borrow_mut();
            self.epoll.wait(&mut events, 0).unwrap_or(0)
        };
        for i in 0..count {
            self.cursor.set(i);
            let entry = self.events.borrow().get(i);
            let Some((key, ready)) = entry else { continue };
            if key == INVALID_KEY {
                continue;
            }
            let handler = {
                let sources = self.sources.borrow();
                match sources.get(key as usize) {
                    Some(slot) if slot.enabled => slot.handler.clone(),
                    _ => continue,
                }
            };
            if let Some(handler) = handler.upgrade() {
                handler.on_event(ready);
            }
        }
        self.dispatching.set(false);
    }

    /// Nulls out not-yet-dispatched slots referring to `id`. The only
    /// cross-slot mutation allowed while a turn is in progress.
    fn invalidate_pending(&self, id: SourceId) {
        if self.dispatching.get() {
            self.events
                .borrow_mut()
                .invalidate_from(self.cursor.get() + 1, id.0 as u64);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.dispatching.get() {
            panic!("destroying the reactor while a turn is in progress");
        }
        self.active.set(false);
        // teardown order: timer wheel, object deleter, ready queue
        let _ = self.epoll.delete(self.wheel.borrow().file_descriptor());
        let _ = self.wheel.borrow().disarm();
        let _ = self.epoll.delete(self.deleter.file_descriptor());
        let _ = self.epoll.delete(self.ready_queue.file_descriptor());
        if let Some(resolver) = self.resolver.borrow_mut().take() {
            let _ = self.epoll.delete(resolver.file_descriptor());
        }
    }
}

/// One slot in the reactor's source table: a file descriptor plus an
/// interest mask, owned by whoever owns the handler object.
///
/// Dropping an enabled registration is a programming error; it is reported
/// and the source is force-disabled.
pub struct Registration {
    inner: Rc<Inner>,
    id: SourceId,
}

impl Registration {
    /// Registers `handler` for `fd`. The registration starts disabled;
    /// call [`set_enabled`](Registration::set_enabled) to arm it.
    pub fn new<S: EventSource>(
        reactor: &Reactor,
        handler: &Rc<S>,
        fd: RawFd,
        interest: Interest,
    ) -> Registration {
        let handler: Rc<dyn EventSource> = handler.clone();
        Registration::from_weak(reactor, Rc::downgrade(&handler), fd, interest)
    }

    pub(crate) fn from_weak(
        reactor: &Reactor,
        handler: Weak<dyn EventSource>,
        fd: RawFd,
        interest: Interest,
    ) -> Registration {
        let inner = reactor.inner().clone();
        let id = inner.register(fd, interest, handler);
        Registration { inner, id }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_enabled(self.id)
    }

    /// `true` registers the descriptor with the multiplexer under the
    /// current interest mask; `false` deregisters it. No-op when already in
    /// the requested state.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.set_enabled(self.id, enabled);
    }

    pub fn interest(&self) -> Interest {
        self.inner.interest(self.id)
    }

    /// Re-registers under the new mask when enabled. Also drops any not yet
    /// dispatched readiness for this source from the current turn.
    pub fn set_interest(&self, interest: Interest) {
        self.inner.set_interest(self.id, interest);
    }

    pub fn file_descriptor(&self) -> RawFd {
        self.inner.file_descriptor(self.id)
    }

    /// Swaps the registered descriptor. Only legal while disabled.
    pub(crate) fn set_file_descriptor(&self, fd: RawFd) {
        self.inner.set_file_descriptor(self.id, fd);
    }

    /// Posts a software readiness event, delivered on the next turn.
    pub fn post_event(&self, events: Ready) {
        self.inner.add_ready_event(self.id, events);
    }

    pub fn remove_posted_events(&self) {
        self.inner.remove_ready_event(self.id);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.inner.sources.borrow()[self.id.0].enabled {
            error!("dropping an enabled event source; event sources must be disabled before they are dropped");
        }
        self.inner.deregister(self.id);
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Registration {{ fd: {}, enabled: {} }}",
            self.file_descriptor(),
            self.is_enabled()
        )
    }
}
