//! A single-threaded, edge-triggered reactor with timers and non-blocking
//! TCP/TLS sockets, for building high-throughput servers one worker thread
//! at a time.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! kestrel-io = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use kestrel_io::net::{TcpListener, TcpSocket};
//! use kestrel_io::Reactor;
//!
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let reactor = Reactor::new().unwrap();
//!
//! // Accept connections and echo whatever arrives.
//! let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
//! let connections = Rc::new(RefCell::new(Vec::new()));
//! let accept_reactor = reactor.clone();
//! let held = connections.clone();
//! let _on_incoming = listener.incoming().connect(move |descriptor| {
//!     let peer = Rc::new(TcpSocket::from_descriptor(&accept_reactor, descriptor));
//!     let observed = Rc::downgrade(&peer);
//!     let on_data = peer.received_data().connect(move |_| {
//!         if let Some(socket) = observed.upgrade() {
//!             let data = socket.read_all();
//!             socket.write(&data);
//!         }
//!     });
//!     held.borrow_mut().push((peer, on_data));
//! });
//!
//! loop {
//!     reactor.turn(Some(Duration::from_millis(100))).unwrap();
//! }
//! ```

#[macro_use]
mod macros;

mod buffer;
mod error;
mod interest;
mod reactor;
mod ready;
mod signal;
mod timer;

pub mod net;
pub mod sys;
pub mod tls;

pub use buffer::{DataSink, DataSource, RingBuffer};

pub use error::posix_error;

pub use interest::Interest;

pub use ready::Ready;

pub use reactor::{EventSource, Reactor, Registration};

pub use signal::{Signal, Subscription};

pub use timer::Timer;
