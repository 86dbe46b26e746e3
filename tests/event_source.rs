use std::cell::{Cell, RefCell};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use kestrel_io::sys::eventfd::EventFd;
use kestrel_io::{EventSource, Interest, Reactor, Ready, Registration};

struct Recorder {
    hits: Cell<usize>,
    last_events: Cell<Ready>,
    // registration of a sibling this source tears down when it fires
    victim: RefCell<Option<Registration>>,
}

impl Recorder {
    fn new() -> Recorder {
        Recorder {
            hits: Cell::new(0),
            last_events: Cell::new(Ready::empty()),
            victim: RefCell::new(None),
        }
    }
}

impl EventSource for Recorder {
    fn on_event(&self, events: Ready) {
        self.hits.set(self.hits.get() + 1);
        self.last_events.set(events);
        self.victim.borrow_mut().take();
    }
}

#[test]
fn readable_event_is_delivered_once_per_turn() {
    let reactor = Reactor::new().unwrap();
    let eventfd = EventFd::new().unwrap();
    let source = Rc::new(Recorder::new());
    let registration = Registration::new(
        &reactor,
        &source,
        eventfd.as_raw_fd(),
        Interest::readable(),
    );
    registration.set_enabled(true);

    eventfd.write(1).unwrap();
    reactor.process_events();

    assert_eq!(source.hits.get(), 1);
    assert!(source.last_events.get().is_readable());

    registration.set_enabled(false);
}

#[test]
fn edge_triggered_source_fires_once() {
    let reactor = Reactor::new().unwrap();
    let eventfd = EventFd::new().unwrap();
    let source = Rc::new(Recorder::new());
    let registration = Registration::new(
        &reactor,
        &source,
        eventfd.as_raw_fd(),
        Interest::readable() | Interest::edge(),
    );

    // write first, then enable: the registration reports the pending level
    // exactly once
    eventfd.write(1).unwrap();
    registration.set_enabled(true);

    reactor.process_events();
    assert_eq!(source.hits.get(), 1);

    reactor.process_events();
    assert_eq!(source.hits.get(), 1);

    registration.set_enabled(false);
}

#[test]
fn callback_can_tear_down_a_pending_sibling() {
    let reactor = Reactor::new().unwrap();
    let eventfd_a = EventFd::new().unwrap();
    let eventfd_b = EventFd::new().unwrap();

    let source_a = Rc::new(Recorder::new());
    let source_b = Rc::new(Recorder::new());

    let registration_a = Registration::new(
        &reactor,
        &source_a,
        eventfd_a.as_raw_fd(),
        Interest::readable(),
    );
    registration_a.set_enabled(true);

    let registration_b = Registration::new(
        &reactor,
        &source_b,
        eventfd_b.as_raw_fd(),
        Interest::readable(),
    );
    registration_b.set_enabled(true);
    *source_a.victim.borrow_mut() = Some(registration_b);

    // both descriptors are ready in the same turn; A fires first and takes
    // B's registration down, so B's callback must never run
    eventfd_a.write(1).unwrap();
    eventfd_b.write(1).unwrap();
    reactor.process_events();

    assert_eq!(source_a.hits.get(), 1);
    assert_eq!(source_b.hits.get(), 0);

    registration_a.set_enabled(false);
}

#[test]
fn enable_and_interest_are_idempotent() {
    let reactor = Reactor::new().unwrap();
    let eventfd = EventFd::new().unwrap();
    let source = Rc::new(Recorder::new());
    let registration = Registration::new(
        &reactor,
        &source,
        eventfd.as_raw_fd(),
        Interest::readable(),
    );

    registration.set_enabled(true);
    registration.set_enabled(true);
    assert!(registration.is_enabled());

    registration.set_interest(Interest::readable());
    registration.set_interest(Interest::readable());
    assert_eq!(registration.interest(), Interest::readable());

    eventfd.write(1).unwrap();
    reactor.process_events();
    assert_eq!(source.hits.get(), 1);

    registration.set_enabled(false);
    registration.set_enabled(false);
    assert!(!registration.is_enabled());
}

#[test]
fn posted_events_coalesce_and_fire_next_turn() {
    let reactor = Reactor::new().unwrap();
    let eventfd = EventFd::new().unwrap();
    let source = Rc::new(Recorder::new());
    let registration = Registration::new(
        &reactor,
        &source,
        eventfd.as_raw_fd(),
        Interest::readable() | Interest::edge(),
    );
    registration.set_enabled(true);

    registration.post_event(Ready::readable());
    registration.post_event(Ready::writable());
    assert_eq!(source.hits.get(), 0);

    reactor.process_events();
    assert_eq!(source.hits.get(), 1);
    assert!(source.last_events.get().is_readable());
    assert!(source.last_events.get().is_writable());

    reactor.process_events();
    assert_eq!(source.hits.get(), 1);

    registration.set_enabled(false);
}

#[test]
fn removed_posted_events_never_fire() {
    let reactor = Reactor::new().unwrap();
    let eventfd = EventFd::new().unwrap();
    let source = Rc::new(Recorder::new());
    let registration = Registration::new(
        &reactor,
        &source,
        eventfd.as_raw_fd(),
        Interest::readable() | Interest::edge(),
    );
    registration.set_enabled(true);

    registration.post_event(Ready::readable());
    registration.remove_posted_events();
    reactor.process_events();
    assert_eq!(source.hits.get(), 0);

    registration.set_enabled(false);
}
