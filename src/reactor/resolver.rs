use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use concurrent_queue::ConcurrentQueue;
use log::debug;

use super::{EventSource, Inner};
use crate::ready::Ready;
use crate::sys::eventfd::EventFd;

type LookupCallback = Box<dyn FnOnce(Vec<IpAddr>)>;

struct Request {
    id: u64,
    host: String,
}

/// Asynchronous name→addresses lookup service. Requests go to a worker
/// thread over a channel; results come back through a lock-free queue plus
/// an eventfd wakeup and are delivered on the next reactor turn.
pub(crate) struct Resolver {
    requests: mpsc::Sender<Request>,
    results: Arc<ConcurrentQueue<(u64, Vec<IpAddr>)>>,
    wakeup: Arc<EventFd>,
    pending: RefCell<HashMap<u64, LookupCallback>>,
    next_id: Cell<u64>,
}

impl Resolver {
    fn new() -> io::Result<Resolver> {
        let (tx, rx) = mpsc::channel::<Request>();
        let results = Arc::new(ConcurrentQueue::unbounded());
        let wakeup = Arc::new(EventFd::new()?);

        let worker_results = results.clone();
        let worker_wakeup = wakeup.clone();
        thread::Builder::new()
            .name("kestrel-resolver".into())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    let addresses = resolve(&request.host);
                    if worker_results.push((request.id, addresses)).is_err() {
                        break;
                    }
                    let _ = worker_wakeup.set();
                }
            })?;

        Ok(Resolver {
            requests: tx,
            results,
            wakeup,
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        })
    }

    pub(crate) fn file_descriptor(&self) -> RawFd {
        self.wakeup.as_raw_fd()
    }
}

fn resolve(host: &str) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    if let Ok(addrs) = (host, 0u16).to_socket_addrs() {
        for addr in addrs {
            if !addresses.contains(&addr.ip()) {
                addresses.push(addr.ip());
            }
        }
    }
    addresses
}

impl Inner {
    /// Kicks off an asynchronous lookup of `host`; `callback` runs on this
    /// thread with the resolved addresses (empty on failure) unless the
    /// lookup is cancelled first.
    pub(crate) fn lookup_host(
        inner: &Rc<Inner>,
        host: &str,
        callback: LookupCallback,
    ) -> io::Result<u64> {
        if inner.resolver.borrow().is_none() {
            let resolver = Resolver::new()?;
            let source = Rc::new(ResolverSource {
                inner: Rc::downgrade(inner),
            });
            inner.attach_internal(resolver.file_descriptor(), source);
            *inner.resolver.borrow_mut() = Some(resolver);
        }
        let resolver_ref = inner.resolver.borrow();
        let resolver = resolver_ref.as_ref().unwrap();
        let id = resolver.next_id.get();
        resolver.next_id.set(id + 1);
        resolver.pending.borrow_mut().insert(id, callback);
        resolver
            .requests
            .send(Request {
                id,
                host: host.to_string(),
            })
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "resolver thread is gone"))?;
        debug!("looking up host {host}");
        Ok(id)
    }

    pub(crate) fn cancel_lookup(&self, id: u64) {
        if let Some(resolver) = self.resolver.borrow().as_ref() {
            resolver.pending.borrow_mut().remove(&id);
        }
    }

    fn process_lookup_results(&self) {
        loop {
            let popped = {
                let resolver_ref = self.resolver.borrow();
                let Some(resolver) = resolver_ref.as_ref() else {
                    return;
                };
                let _ = resolver.wakeup.reset();
                match resolver.results.pop() {
                    Ok((id, addresses)) => resolver
                        .pending
                        .borrow_mut()
                        .remove(&id)
                        .map(|callback| (callback, addresses)),
                    Err(_) => return,
                }
            };
            if let Some((callback, addresses)) = popped {
                callback(addresses);
            }
        }
    }
}

pub(crate) struct ResolverSource {
    pub(crate) inner: Weak<Inner>,
}

impl EventSource for ResolverSource {
    fn on_event(&self, events: Ready) {
        if events.is_readable() {
            if let Some(inner) = self.inner.upgrade() {
                inner.process_lookup_results();
            }
        }
    }
}
