use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Weak;

use super::{EventSource, Inner};
use crate::ready::Ready;
use crate::sys::eventfd::EventFd;

/// FIFO of objects awaiting destruction on the next reactor turn. Lets an
/// object be destroyed from within its own callback: ownership moves here
/// and the drop happens once the dispatch stack has unwound.
pub(crate) struct DeferredDeleter {
    event_fd: EventFd,
    queue: RefCell<VecDeque<Box<dyn Any>>>,
    is_set: Cell<bool>,
}

impl DeferredDeleter {
    pub(crate) fn new() -> io::Result<DeferredDeleter> {
        Ok(DeferredDeleter {
            event_fd: EventFd::new()?,
            queue: RefCell::new(VecDeque::new()),
            is_set: Cell::new(false),
        })
    }

    pub(crate) fn file_descriptor(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    pub(crate) fn schedule(&self, object: Box<dyn Any>) {
        self.queue.borrow_mut().push_back(object);
        if !self.is_set.get() {
            self.is_set.set(true);
            let _ = self.event_fd.set();
        }
    }

    fn drain(&self) {
        self.is_set.set(false);
        let _ = self.event_fd.reset();
        // destructors may schedule further deletions; those land on the
        // fresh queue and are destroyed on the turn after this one
        let drained = std::mem::take(&mut *self.queue.borrow_mut());
        for object in drained {
            drop(object);
        }
    }
}

pub(crate) struct DeleterSource {
    pub(crate) inner: Weak<Inner>,
}

impl EventSource for DeleterSource {
    fn on_event(&self, events: Ready) {
        if events.is_readable() {
            if let Some(inner) = self.inner.upgrade() {
                inner.deleter.drain();
            }
        }
    }
}
