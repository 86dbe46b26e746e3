use std::cell::Cell;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Weak;

use super::{EventSource, Inner, SourceId};
use crate::ready::Ready;
use crate::sys::eventfd::EventFd;

/// Coalesces software-posted readiness events. The list itself is threaded
/// through the source slots (`ready_next`/`ready_prev`); the queue holds the
/// head pointers and the wakeup descriptor, which is set iff the list is
/// non-empty.
pub(crate) struct ReadyQueue {
    event_fd: EventFd,
    head: Cell<Option<SourceId>>,
    firing: Cell<Option<SourceId>>,
    is_set: Cell<bool>,
}

impl ReadyQueue {
    pub(crate) fn new() -> io::Result<ReadyQueue> {
        Ok(ReadyQueue {
            event_fd: EventFd::new()?,
            head: Cell::new(None),
            firing: Cell::new(None),
            is_set: Cell::new(false),
        })
    }

    pub(crate) fn file_descriptor(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    fn raise(&self) {
        if !self.is_set.get() {
            self.is_set.set(true);
            let _ = self.event_fd.set();
        }
    }

    fn reset(&self) {
        if self.is_set.get() {
            self.is_set.set(false);
            let _ = self.event_fd.reset();
        }
    }
}

impl Inner {
    /// Posts `events` for `id`; a source already in the list gets the mask
    /// unioned instead of a second entry.
    pub(crate) fn add_ready_event(&self, id: SourceId, events: Ready) {
        let mut sources = self.sources.borrow_mut();
        if !sources[id.0].in_ready_list {
            let old_head = self.ready_queue.head.get();
            {
                let slot = &mut sources[id.0];
                slot.in_ready_list = true;
                slot.posted = events;
                slot.ready_next = old_head;
                slot.ready_prev = None;
            }
            if let Some(head) = old_head {
                sources[head.0].ready_prev = Some(id);
            }
            self.ready_queue.head.set(Some(id));
            drop(sources);
            self.ready_queue.raise();
        } else {
            let slot = &mut sources[id.0];
            slot.posted = slot.posted | events;
        }
    }

    pub(crate) fn remove_ready_event(&self, id: SourceId) {
        let mut sources = self.sources.borrow_mut();
        if !sources[id.0].in_ready_list {
            return;
        }
        let (prev, next) = {
            let slot = &mut sources[id.0];
            slot.in_ready_list = false;
            slot.posted = Ready::empty();
            (slot.ready_prev.take(), slot.ready_next.take())
        };
        if let Some(prev) = prev {
            sources[prev.0].ready_next = next;
        }
        if let Some(next) = next {
            sources[next.0].ready_prev = prev;
        }
        if self.ready_queue.head.get() == Some(id) {
            self.ready_queue.head.set(next);
        } else if self.ready_queue.firing.get() == Some(id) {
            self.ready_queue.firing.set(next);
        }
    }

    /// Delivers the posted events queued before this turn. The list head is
    /// snapshotted first, so posts made from inside the callbacks land on a
    /// fresh list and fire on the next turn.
    fn process_ready_events(&self) {
        self.ready_queue.reset();
        self.ready_queue.firing.set(self.ready_queue.head.take());
        loop {
            let fired = {
                let mut sources = self.sources.borrow_mut();
                match self.ready_queue.firing.get() {
                    None => None,
                    Some(id) => {
                        let (next, events, handler) = {
                            let slot = &mut sources[id.0];
                            let next = slot.ready_next.take();
                            slot.ready_prev = None;
                            slot.in_ready_list = false;
                            let events = slot.posted;
                            slot.posted = Ready::empty();
                            (next, events, slot.handler.clone())
                        };
                        if let Some(next) = next {
                            sources[next.0].ready_prev = None;
                        }
                        self.ready_queue.firing.set(next);
                        Some((handler, events))
                    }
                }
            };
            match fired {
                None => break,
                Some((handler, events)) => {
                    if let Some(handler) = handler.upgrade() {
                        handler.on_event(events);
                    }
                }
            }
        }
    }
}

pub(crate) struct ReadyQueueSource {
    pub(crate) inner: Weak<Inner>,
}

impl EventSource for ReadyQueueSource {
    fn on_event(&self, events: Ready) {
        if events.is_readable() {
            if let Some(inner) = self.inner.upgrade() {
                inner.process_ready_events();
            }
        }
    }
}
