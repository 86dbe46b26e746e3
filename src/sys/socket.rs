use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use libc::{self, c_int, c_void, sockaddr, sockaddr_storage, socklen_t};

pub fn setsockopt<T>(fd: RawFd, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        opt,
        val,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    Ok(slot)
}

fn to_sockaddr(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            (storage, mem::size_of::<libc::sockaddr_in>() as socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: a.ip().octets(),
            };
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_scope_id = a.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as socklen_t)
        }
    }
}

pub fn sockaddr_to_addr(storage: &sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                sin.sin_addr.s_addr.to_ne_bytes().into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                sin6.sin6_addr.s6_addr.into(),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid argument")),
    }
}

/// Creates a non-blocking stream socket of the given family.
pub fn new_stream_socket(family: c_int) -> io::Result<RawFd> {
    syscall!(socket(
        family,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0
    ))
}

pub fn family_of(addr: &IpAddr) -> c_int {
    match addr {
        IpAddr::V4(_) => libc::AF_INET,
        IpAddr::V6(_) => libc::AF_INET6,
    }
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    syscall!(bind(fd, &storage as *const _ as *const sockaddr, len))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// Issues `connect(2)`, restarting on `EINTR`. `EINPROGRESS` is surfaced to
/// the caller as an error with `raw_os_error() == EINPROGRESS`.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    loop {
        match syscall!(connect(fd, &storage as *const _ as *const sockaddr, len)) {
            Ok(_) => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Accepts one pending connection, restarting on `EINTR`. The returned
/// descriptor is non-blocking and close-on-exec.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    let accepted = loop {
        match syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        )) {
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            other => break other?,
        }
    };
    let addr = sockaddr_to_addr(&storage, len as usize)?;
    Ok((accepted, addr))
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;
    sockaddr_to_addr(&storage, len as usize)
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;
    sockaddr_to_addr(&storage, len as usize)
}

pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR))?;
    Ok(())
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as c_int)
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL, 0))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

/// Bytes queued in the kernel receive buffer.
pub fn bytes_available(fd: RawFd) -> usize {
    let mut count: c_int = 0;
    let res = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) };
    if res == -1 || count < 0 {
        0
    } else {
        count as usize
    }
}

/// Closes `fd`, restarting on `EINTR`. A negative descriptor is a no-op.
pub fn safe_close(fd: RawFd) {
    if fd >= 0 {
        loop {
            let result = unsafe { libc::close(fd) };
            if result == -1 && Error::last_os_error().kind() == ErrorKind::Interrupted {
                continue;
            }
            break;
        }
    }
}

/// Receives into `buf` until it is filled or the kernel has nothing more to
/// give. `EINTR` is retried; every other condition ends the loop with a
/// short count.
pub fn safe_recv(fd: RawFd, buf: &mut [u8]) -> usize {
    let mut bytes_read = 0;
    while bytes_read < buf.len() {
        let result = unsafe {
            libc::recv(
                fd,
                buf[bytes_read..].as_mut_ptr() as *mut c_void,
                buf.len() - bytes_read,
                0,
            )
        };
        if result > 0 {
            bytes_read += result as usize;
        } else if result == -1 && Error::last_os_error().kind() == ErrorKind::Interrupted {
            continue;
        } else {
            return bytes_read;
        }
    }
    bytes_read
}

/// Dual of [`safe_recv`] for the send direction.
pub fn safe_send(fd: RawFd, data: &[u8]) -> usize {
    let mut bytes_written = 0;
    while bytes_written < data.len() {
        let result = unsafe {
            libc::send(
                fd,
                data[bytes_written..].as_ptr() as *const c_void,
                data.len() - bytes_written,
                libc::MSG_NOSIGNAL,
            )
        };
        if result > 0 {
            bytes_written += result as usize;
        } else if result == -1 && Error::last_os_error().kind() == ErrorKind::Interrupted {
            continue;
        } else {
            return bytes_written;
        }
    }
    bytes_written
}

/// Checks that `fd` is a connected TCP stream socket of a supported family
/// and switches it to non-blocking mode.
pub fn validate_stream_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let ty: c_int = match getsockopt(fd, libc::SOL_SOCKET, libc::SO_TYPE) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let protocol: c_int = match getsockopt(fd, libc::SOL_SOCKET, libc::SO_PROTOCOL) {
        Ok(v) => v,
        Err(_) => return false,
    };
    let domain: c_int = match getsockopt(fd, libc::SOL_SOCKET, libc::SO_DOMAIN) {
        Ok(v) => v,
        Err(_) => return false,
    };
    ty == libc::SOCK_STREAM
        && protocol == libc::IPPROTO_TCP
        && (domain == libc::AF_INET || domain == libc::AF_INET6)
        && matches!(take_error(fd), Ok(None))
        && set_nonblocking(fd).is_ok()
}
