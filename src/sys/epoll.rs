use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::interest::Interest;
use crate::ready::Ready;

/// Sentinel stored in a triggered event's data word when the slot has been
/// invalidated mid-turn.
pub const INVALID_KEY: u64 = u64::MAX;

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Epoll { epfd })
    }

    /// Non-blocking when `timeout_ms` is zero.
    pub fn wait(&self, evts: &mut Events, timeout_ms: c_int) -> io::Result<usize> {
        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout_ms
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: key,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, key: u64, interest: Interest) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: key,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    if interest.is_hup() {
        kind |= EPOLLRDHUP;
    }

    if interest.is_priority() {
        kind |= EPOLLPRI;
    }

    if interest.is_edge() {
        kind |= EPOLLET;
    }

    kind as u32
}

fn epoll_to_ready(epoll: c_int) -> Ready {
    let mut kind = Ready::empty();

    if (epoll & EPOLLIN) != 0 {
        kind = kind | Ready::readable();
    }

    if (epoll & EPOLLOUT) != 0 {
        kind = kind | Ready::writable();
    }

    // EPOLLERR usually means a socket error happened
    if (epoll & EPOLLERR) != 0 {
        kind = kind | Ready::error();
    }

    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        kind = kind | Ready::hup();
    }

    if (epoll & EPOLLPRI) != 0 {
        kind = kind | Ready::priority();
    }

    kind
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

/// Scratch array the dispatch loop fills once per turn.
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<(u64, Ready)> {
        self.events
            .get(idx)
            .map(|event| (event.u64, epoll_to_ready(event.events as c_int)))
    }

    /// Nulls out every pending slot in `from..` that refers to `key`. Called
    /// while a turn is in progress and a source's registration just changed.
    pub fn invalidate_from(&mut self, from: usize, key: u64) {
        for event in self.events.iter_mut().skip(from) {
            if event.u64 == key {
                event.u64 = INVALID_KEY;
            }
        }
    }
}
