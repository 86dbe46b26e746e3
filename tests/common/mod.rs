use std::time::{Duration, Instant};

use kestrel_io::Reactor;

/// Drives the reactor until `done` holds or `timeout` elapses, returning
/// whether the condition was met.
pub fn run_until(reactor: &Reactor, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return done();
        }
        let _ = reactor.turn(Some(Duration::from_millis(25)));
    }
}
