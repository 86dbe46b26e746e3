use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::Once;

use crate::buffer::{DataSink, DataSource, RingBuffer};
use crate::error::posix_error;
use crate::interest::Interest;
use crate::reactor::{EventSource, Inner, Reactor, Registration};
use crate::ready::Ready;
use crate::signal::{connect_weak, Signal, Subscription};
use crate::sys::socket as sys;
use crate::timer::Timer;

use super::tls::TlsState;

pub(crate) const CONNECT_TIMEOUT_MS: u64 = 60_000;
pub(crate) const DISCONNECT_TIMEOUT_MS: u64 = 10_000;
const READ_BUFFER_CAPACITY: usize = 128 * 1024;
const LISTEN_BACKLOG: libc::c_int = 128;

/// Connection state of a [`TcpSocket`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// The kernel options a socket exposes. Values outside the allowed domain
/// (negative buffer sizes) are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOption {
    /// `TCP_NODELAY`; on by default.
    LowDelay,
    /// `SO_KEEPALIVE`.
    KeepAlive,
    /// `SO_SNDBUF`.
    SendBufferSize,
    /// `SO_RCVBUF`.
    ReceiveBufferSize,
}

fn install_sigpipe_guard() {
    static SIGPIPE_ONCE: Once = Once::new();
    SIGPIPE_ONCE.call_once(|| unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = libc::SIG_IGN;
        if libc::sigaction(libc::SIGPIPE, &action, ptr::null_mut()) != 0 {
            panic!("failed to disable the SIGPIPE signal");
        }
    });
}

pub(crate) struct FdSource(pub(crate) RawFd);

impl DataSource for FdSource {
    fn data_available(&self) -> usize {
        if self.0 < 0 {
            0
        } else {
            sys::bytes_available(self.0)
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.0 < 0 {
            0
        } else {
            sys::safe_recv(self.0, buf)
        }
    }
}

pub(crate) struct FdSink(pub(crate) RawFd);

impl DataSink for FdSink {
    fn write(&mut self, data: &[u8]) -> usize {
        if self.0 < 0 {
            0
        } else {
            sys::safe_send(self.0, data)
        }
    }
}

fn format_endpoint(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

pub(crate) struct SocketInner {
    pub(crate) reactor: Reactor,
    pub(crate) weak_self: Weak<SocketInner>,
    pub(crate) registration: Registration,
    pub(crate) fd: Cell<RawFd>,
    pub(crate) state: Cell<SocketState>,
    pub(crate) context_id: Cell<u64>,
    peer_name: RefCell<String>,
    bind_address: RefCell<String>,
    bind_port: Cell<u16>,
    peer_address: RefCell<String>,
    peer_port: Cell<u16>,
    local_address: RefCell<String>,
    local_port: Cell<u16>,
    proxy_address: RefCell<String>,
    proxy_port: Cell<u16>,
    error_message: RefCell<String>,
    host_addresses: RefCell<Vec<IpAddr>>,
    pub(crate) read_buffer: RefCell<RingBuffer>,
    pub(crate) write_buffer: RefCell<RingBuffer>,
    connect_timer: Timer,
    pub(crate) disconnect_timer: Timer,
    lookup_id: Cell<Option<u64>>,
    read_posted_after_drain: Cell<bool>,
    pub(crate) write_event_scheduled: Cell<bool>,
    connected: Signal<()>,
    disconnected: Signal<()>,
    error: Signal<()>,
    received_data: Signal<()>,
    sent_data: Signal<usize>,
    pub(crate) tls: Option<TlsState>,
    _timer_subscriptions: Vec<Subscription>,
}

impl SocketInner {
    pub(crate) fn new(reactor: &Reactor, tls: Option<TlsState>) -> Rc<SocketInner> {
        install_sigpipe_guard();
        Rc::new_cyclic(|weak: &Weak<SocketInner>| {
            let handler: Weak<dyn EventSource> = weak.clone();
            let registration = Registration::from_weak(reactor, handler, -1, Interest::stream());
            let connect_timer = Timer::new(reactor);
            connect_timer.set_single_shot(true);
            let disconnect_timer = Timer::new(reactor);
            disconnect_timer.set_single_shot(true);
            let mut subscriptions = Vec::new();
            subscriptions.push(connect_weak(connect_timer.timeout(), weak, |inner, _| {
                inner.on_connect_timeout()
            }));
            subscriptions.push(connect_weak(disconnect_timer.timeout(), weak, |inner, _| {
                inner.on_disconnect_timeout()
            }));
            if let Some(tls) = &tls {
                subscriptions.push(connect_weak(tls.handshake_timer.timeout(), weak, |inner, _| {
                    inner.on_handshake_timeout()
                }));
            }
            SocketInner {
                reactor: reactor.clone(),
                weak_self: weak.clone(),
                registration,
                fd: Cell::new(-1),
                state: Cell::new(SocketState::Unconnected),
                context_id: Cell::new(1),
                peer_name: RefCell::new(String::new()),
                bind_address: RefCell::new(String::new()),
                bind_port: Cell::new(0),
                peer_address: RefCell::new(String::new()),
                peer_port: Cell::new(0),
                local_address: RefCell::new(String::new()),
                local_port: Cell::new(0),
                proxy_address: RefCell::new(String::new()),
                proxy_port: Cell::new(0),
                error_message: RefCell::new(String::new()),
                host_addresses: RefCell::new(Vec::new()),
                read_buffer: RefCell::new(RingBuffer::with_capacity(READ_BUFFER_CAPACITY)),
                write_buffer: RefCell::new(RingBuffer::new()),
                connect_timer,
                disconnect_timer,
                lookup_id: Cell::new(None),
                read_posted_after_drain: Cell::new(false),
                write_event_scheduled: Cell::new(false),
                connected: Signal::new(),
                disconnected: Signal::new(),
                error: Signal::new(),
                received_data: Signal::new(),
                sent_data: Signal::new(),
                tls,
                _timer_subscriptions: subscriptions,
            }
        })
    }

    pub(crate) fn abort(&self) {
        self.registration.set_enabled(false);
        self.registration.remove_posted_events();
        self.registration.set_interest(Interest::stream());
        if self.fd.get() >= 0 {
            sys::safe_close(self.fd.get());
        }
        if let Some(lookup) = self.lookup_id.take() {
            self.reactor.inner().cancel_lookup(lookup);
        }
        self.peer_name.borrow_mut().clear();
        self.bind_address.borrow_mut().clear();
        self.peer_address.borrow_mut().clear();
        self.local_address.borrow_mut().clear();
        self.proxy_address.borrow_mut().clear();
        self.error_message.borrow_mut().clear();
        self.host_addresses.borrow_mut().clear();
        self.fd.set(-1);
        self.registration.set_file_descriptor(-1);
        self.connect_timer.stop();
        self.disconnect_timer.stop();
        self.context_id.set(self.context_id.get() + 1);
        self.bind_port.set(0);
        self.peer_port.set(0);
        self.local_port.set(0);
        self.proxy_port.set(0);
        self.state.set(SocketState::Unconnected);
        self.read_posted_after_drain.set(false);
        self.write_event_scheduled.set(false);
        self.read_buffer.borrow_mut().clear();
        self.write_buffer.borrow_mut().clear();
        self.abort_tls();
    }

    pub(crate) fn bind(&self, address: &str, port: u16) {
        *self.bind_address.borrow_mut() = address.to_string();
        self.bind_port.set(port);
    }

    pub(crate) fn connect(&self, host: &str, port: u16) {
        let bind_address = self.bind_address.borrow().clone();
        let bind_port = self.bind_port.get();
        self.abort();
        *self.bind_address.borrow_mut() = bind_address;
        self.bind_port.set(bind_port);
        if let Some(tls) = &self.tls {
            if let Err(message) = tls.ensure_client_context(&self.reactor) {
                self.set_error(message);
                return;
            }
        }
        if host.is_empty() {
            self.set_error("Failed to connect to host. Given host is empty.".to_string());
            return;
        }
        if port == 0 {
            self.set_error(format!("Failed to connect to {host}. Given port is 0."));
            return;
        }
        self.state.set(SocketState::Connecting);
        self.peer_port.set(port);
        if let Ok(address) = host.parse::<IpAddr>() {
            *self.host_addresses.borrow_mut() = vec![address];
            if let Err(message) = self.on_connecting() {
                self.set_error(message);
                return;
            }
            self.connect_to_host();
        } else {
            *self.peer_name.borrow_mut() = host.to_string();
            if let Err(message) = self.on_connecting() {
                self.set_error(message);
                return;
            }
            let weak = self.weak_self.clone();
            match Inner::lookup_host(
                self.reactor.inner(),
                host,
                Box::new(move |addresses| {
                    if let Some(inner) = weak.upgrade() {
                        inner.lookup_id.set(None);
                        inner.on_host_found(addresses);
                    }
                }),
            ) {
                Ok(lookup) => self.lookup_id.set(Some(lookup)),
                Err(err) => self.set_error(format!(
                    "Failed to connect to {host}. {}",
                    posix_error(&err)
                )),
            }
        }
    }

    fn on_host_found(&self, addresses: Vec<IpAddr>) {
        if !addresses.is_empty() {
            *self.host_addresses.borrow_mut() = addresses;
            self.connect_to_host();
        } else {
            let peer_name = self.peer_name.borrow().clone();
            self.set_error(format!(
                "Failed to connect to {peer_name}. Could not fetch any address for domain."
            ));
        }
    }

    /// Tries the resolved candidates in order until one accepts the
    /// connection attempt. Bind failures stop the walk; per-candidate
    /// connect failures move on to the next candidate.
    fn connect_to_host(&self) {
        loop {
            let peer_ip = {
                let mut addresses = self.host_addresses.borrow_mut();
                if addresses.is_empty() {
                    break;
                }
                addresses.remove(0)
            };
            if self.fd.get() >= 0 {
                self.registration.set_enabled(false);
                sys::safe_close(self.fd.get());
            }
            self.fd.set(-1);
            self.registration.set_file_descriptor(-1);
            self.error_message.borrow_mut().clear();
            *self.peer_address.borrow_mut() = peer_ip.to_string();
            let bind_address = self.bind_address.borrow().clone();
            let fd = if !bind_address.is_empty() {
                let bind_ip = match bind_address.parse::<IpAddr>() {
                    Ok(ip) => ip,
                    Err(_) => continue,
                };
                if bind_ip.is_ipv6() && peer_ip.is_ipv4() {
                    continue;
                }
                let endpoint = format_endpoint(&bind_address, self.bind_port.get());
                let fd = match sys::new_stream_socket(sys::family_of(&bind_ip)) {
                    Ok(fd) => fd,
                    Err(err) => {
                        self.set_error(format!(
                            "Failed to bind socket to {endpoint}. {}",
                            posix_error(&err)
                        ));
                        return;
                    }
                };
                self.fd.set(fd);
                self.registration.set_file_descriptor(fd);
                let _ = sys::set_reuseaddr(fd);
                if let Err(err) = sys::bind(fd, &SocketAddr::new(bind_ip, self.bind_port.get())) {
                    self.set_error(format!(
                        "Failed to bind socket to {endpoint}. {}",
                        posix_error(&err)
                    ));
                    return;
                }
                fd
            } else {
                match sys::new_stream_socket(sys::family_of(&peer_ip)) {
                    Ok(fd) => {
                        self.fd.set(fd);
                        self.registration.set_file_descriptor(fd);
                        fd
                    }
                    Err(err) => {
                        let peer = self.peer_address.borrow().clone();
                        self.set_error(format!(
                            "Failed to connect to {peer}. {}",
                            posix_error(&err)
                        ));
                        return;
                    }
                }
            };
            self.set_socket_option(SocketOption::LowDelay, 1);
            let peer = SocketAddr::new(peer_ip, self.peer_port.get());
            match sys::connect(fd, &peer) {
                Ok(()) => {}
                Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
                Err(_) => continue,
            }
            self.connect_timer.start_with(CONNECT_TIMEOUT_MS);
            self.registration.set_enabled(true);
            return;
        }
        let peer_address = self.peer_address.borrow().clone();
        let peer_name = self.peer_name.borrow().clone();
        let endpoint = format_endpoint(&peer_address, self.peer_port.get());
        if peer_name.is_empty() {
            self.set_error(format!("Failed to connect to {endpoint}."));
        } else {
            self.set_error(format!("Failed to connect to {peer_name} at {endpoint}."));
        }
    }

    pub(crate) fn disconnect_from_peer(&self) {
        match self.state.get() {
            SocketState::Unconnected | SocketState::Disconnecting => {}
            SocketState::Connecting => self.abort(),
            SocketState::Connected => {
                if self.tls.is_some() {
                    self.disconnect_from_peer_tls();
                } else {
                    self.registration
                        .set_interest(self.registration.interest() - Interest::readable());
                    self.state.set(SocketState::Disconnecting);
                    self.disconnect_timer.start_with(DISCONNECT_TIMEOUT_MS);
                    if self.write_buffer.borrow().is_empty() {
                        self.registration
                            .set_interest(self.registration.interest() - Interest::writable());
                        if sys::shutdown_write(self.fd.get()).is_err() {
                            self.force_close();
                            self.disconnected.emit(());
                        }
                    }
                }
            }
        }
    }

    /// Closes the descriptor while keeping any already-received data
    /// readable; with nothing buffered the whole socket state is reset.
    pub(crate) fn force_close(&self) {
        if self.read_buffer.borrow().size() > 0 {
            self.registration.set_enabled(false);
            sys::safe_close(self.fd.get());
            self.fd.set(-1);
            self.registration.set_file_descriptor(-1);
            self.write_buffer.borrow_mut().clear();
            if let Some(tls) = &self.tls {
                tls.enc_out.borrow_mut().clear();
            }
            self.abort_tls();
            self.state.set(SocketState::Unconnected);
        } else {
            self.abort();
        }
    }

    pub(crate) fn set_socket_descriptor(&self, descriptor: RawFd) {
        self.abort();
        if descriptor < 0 {
            return;
        }
        self.fd.set(descriptor);
        self.registration.set_file_descriptor(descriptor);
        if sys::validate_stream_socket(descriptor) && self.fetch_connection_parameters() {
            self.set_socket_option(SocketOption::LowDelay, 1);
            self.state.set(SocketState::Connected);
            self.registration.set_enabled(true);
            if let Err(message) = self.on_connected() {
                self.set_error(message);
            }
        } else {
            self.abort();
        }
    }

    fn fetch_connection_parameters(&self) -> bool {
        match sys::local_addr(self.fd.get()) {
            Ok(addr) => {
                *self.local_address.borrow_mut() = addr.ip().to_string();
                self.local_port.set(addr.port());
            }
            Err(err) => {
                *self.error_message.borrow_mut() =
                    format!("Failed to fetch local IP/port. {}", posix_error(&err));
                return false;
            }
        }
        match sys::peer_addr(self.fd.get()) {
            Ok(addr) => {
                *self.peer_address.borrow_mut() = addr.ip().to_string();
                self.peer_port.set(addr.port());
            }
            Err(err) => {
                *self.error_message.borrow_mut() =
                    format!("Failed to fetch peer IP/port. {}", posix_error(&err));
                return false;
            }
        }
        true
    }

    /// Publishes `message` through the error signal, then aborts. The
    /// message survives the abort so observers can read it afterwards.
    pub(crate) fn set_error(&self, message: String) {
        *self.error_message.borrow_mut() = message.clone();
        let context_id = self.context_id.get();
        self.error.emit(());
        if context_id == self.context_id.get() {
            self.abort();
            *self.error_message.borrow_mut() = message;
        }
    }

    fn on_connecting(&self) -> Result<(), String> {
        if self.tls.is_some() {
            self.setup_tls()
        } else {
            Ok(())
        }
    }

    fn on_connected(&self) -> Result<(), String> {
        if let Some(tls) = &self.tls {
            if tls.engine.borrow().is_none() {
                self.setup_tls()?;
            }
            let context_id = self.context_id.get();
            self.connected.emit(());
            if context_id == self.context_id.get() {
                self.do_handshake()?;
            }
            Ok(())
        } else {
            self.connected.emit(());
            Ok(())
        }
    }

    fn on_connect_timeout(&self) {
        if self.state.get() == SocketState::Connecting {
            self.connect_to_host();
        }
    }

    fn on_disconnect_timeout(&self) {
        if self.state.get() == SocketState::Disconnecting {
            self.force_close();
            self.disconnected.emit(());
        }
    }

    fn read_from_channel(&self) -> Result<usize, String> {
        if self.tls.is_some() {
            return self.read_from_channel_tls();
        }
        let mut source = FdSource(self.fd.get());
        let bytes_read = self.read_buffer.borrow_mut().write_from(&mut source);
        if source.data_available() > 0 {
            if !self.read_buffer.borrow().is_full() {
                self.registration.post_event(Ready::readable());
            } else {
                self.read_posted_after_drain.set(true);
            }
        }
        Ok(bytes_read)
    }

    fn write_to_channel(&self) -> Result<usize, String> {
        if self.tls.is_some() {
            return self.write_to_channel_tls();
        }
        let mut sink = FdSink(self.fd.get());
        let bytes_written = self.write_buffer.borrow_mut().read_into(&mut sink);
        self.write_event_scheduled.set(false);
        Ok(bytes_written)
    }

    /// Bytes still pending between the kernel queue and the decryption
    /// pipeline; drained before a close is surfaced.
    fn residual_available(&self) -> usize {
        let mut available = if self.fd.get() >= 0 {
            sys::bytes_available(self.fd.get())
        } else {
            0
        };
        if let Some(tls) = &self.tls {
            available += tls.enc_in.borrow().size();
        }
        available
    }

    fn handle_event(&self, events: Ready) -> Result<(), String> {
        let mut received = 0usize;
        let mut sent = 0usize;
        let mut has_disconnected = false;
        if events.is_readable() && self.state.get() == SocketState::Connected {
            received = self.read_from_channel()?;
            if let Some(tls) = &self.tls {
                if !tls.handshake_complete.get() {
                    let context_id = self.context_id.get();
                    self.do_handshake()?;
                    if context_id != self.context_id.get() {
                        return Ok(());
                    }
                }
            }
        }
        if events.is_writable() {
            match self.state.get() {
                SocketState::Connected => {
                    sent = self.write_to_channel()?;
                }
                SocketState::Disconnecting => {
                    sent = self.write_to_channel()?;
                    if self.write_buffer.borrow().is_empty() {
                        if self.tls.is_some() {
                            if self.finish_tls_shutdown()? {
                                self.disconnect_timer.stop();
                                has_disconnected = true;
                            }
                        } else {
                            self.registration
                                .set_interest(self.registration.interest() - Interest::writable());
                            if sys::shutdown_write(self.fd.get()).is_err() {
                                self.disconnect_timer.stop();
                                has_disconnected = true;
                            }
                        }
                    }
                }
                SocketState::Connecting => {
                    self.connect_timer.stop();
                    let sane = matches!(sys::take_error(self.fd.get()), Ok(None))
                        && self.fetch_connection_parameters();
                    if sane {
                        self.state.set(SocketState::Connected);
                        self.registration.set_enabled(true);
                        let context_id = self.context_id.get();
                        self.on_connected()?;
                        if context_id != self.context_id.get() {
                            return Ok(());
                        }
                    } else {
                        self.connect_to_host();
                        return Ok(());
                    }
                }
                SocketState::Unconnected => {}
            }
        }
        if events.intersects(Ready::hup() | Ready::error() | Ready::priority()) {
            self.disconnect_timer.stop();
            has_disconnected = true;
        }
        let context_id = self.context_id.get();
        if received > 0 {
            self.received_data.emit(());
        }
        if context_id == self.context_id.get() && sent > 0 {
            self.sent_data.emit(sent);
        }
        if context_id == self.context_id.get() && has_disconnected {
            while context_id == self.context_id.get() && self.residual_available() > 0 {
                if self.read_from_channel()? == 0 {
                    break;
                }
                self.received_data.emit(());
            }
            self.read_posted_after_drain.set(false);
            self.registration.remove_posted_events();
            let emit_disconnected = matches!(
                self.state.get(),
                SocketState::Connected | SocketState::Disconnecting
            );
            if context_id == self.context_id.get() {
                self.force_close();
                if emit_disconnected {
                    self.disconnected.emit(());
                }
            }
        }
        Ok(())
    }

    pub(crate) fn user_write(&self, data: &[u8]) -> usize {
        if self.state.get() == SocketState::Connected {
            self.write_buffer.borrow_mut().write(data);
            if !self.write_event_scheduled.get() {
                self.registration.post_event(Ready::writable());
                self.write_event_scheduled.set(true);
            }
            data.len()
        } else {
            0
        }
    }

    pub(crate) fn user_read(&self, buf: &mut [u8]) -> usize {
        let was_full = self.read_buffer.borrow().is_full();
        let bytes_read = self.read_buffer.borrow_mut().read(buf);
        self.after_user_drain(was_full, bytes_read);
        bytes_read
    }

    pub(crate) fn user_peek(&self, buf: &mut [u8]) -> usize {
        self.read_buffer.borrow().peek(buf)
    }

    pub(crate) fn user_read_all(&self) -> Vec<u8> {
        let was_full = self.read_buffer.borrow().is_full();
        let data = self.read_buffer.borrow_mut().read_all();
        self.after_user_drain(was_full, data.len());
        data
    }

    pub(crate) fn user_pop_front(&self, count: usize) -> usize {
        let was_full = self.read_buffer.borrow().is_full();
        let popped = self.read_buffer.borrow_mut().pop_front(count);
        self.after_user_drain(was_full, popped);
        popped
    }

    /// Re-arms a posted read once a drain frees space in a previously full
    /// read buffer.
    fn after_user_drain(&self, was_full: bool, freed: usize) {
        if self.read_posted_after_drain.get() || (was_full && freed > 0) {
            self.read_posted_after_drain.set(false);
            self.registration.post_event(Ready::readable());
        }
    }

    pub(crate) fn set_socket_option(&self, option: SocketOption, value: i32) {
        let fd = self.fd.get();
        if fd < 0 {
            return;
        }
        match option {
            SocketOption::LowDelay => {
                let value: libc::c_int = (value != 0) as libc::c_int;
                let _ = sys::setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, value);
            }
            SocketOption::KeepAlive => {
                let value: libc::c_int = (value != 0) as libc::c_int;
                let _ = sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, value);
            }
            SocketOption::SendBufferSize => {
                if value >= 0 {
                    let _ = sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, value);
                }
            }
            SocketOption::ReceiveBufferSize => {
                if value >= 0 {
                    let _ = sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, value);
                }
            }
        }
    }

    pub(crate) fn socket_option(&self, option: SocketOption) -> i32 {
        let fd = self.fd.get();
        if fd < 0 {
            return -1;
        }
        let fetched: io::Result<libc::c_int> = match option {
            SocketOption::LowDelay => sys::getsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY),
            SocketOption::KeepAlive => sys::getsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE),
            SocketOption::SendBufferSize => sys::getsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF),
            SocketOption::ReceiveBufferSize => {
                sys::getsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF)
            }
        };
        fetched.unwrap_or(-1)
    }

    pub(crate) fn peer_name(&self) -> String {
        self.peer_name.borrow().clone()
    }

    pub(crate) fn first_host_address(&self) -> String {
        self.host_addresses
            .borrow()
            .first()
            .map(|address| address.to_string())
            .unwrap_or_default()
    }

    pub(crate) fn peer_address(&self) -> String {
        self.peer_address.borrow().clone()
    }

    pub(crate) fn peer_port(&self) -> u16 {
        self.peer_port.get()
    }

    pub(crate) fn local_address(&self) -> String {
        self.local_address.borrow().clone()
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port.get()
    }

    pub(crate) fn proxy_address(&self) -> String {
        self.proxy_address.borrow().clone()
    }

    pub(crate) fn proxy_port(&self) -> u16 {
        self.proxy_port.get()
    }

    pub(crate) fn error_message(&self) -> String {
        self.error_message.borrow().clone()
    }

    pub(crate) fn emit_disconnected(&self) {
        self.disconnected.emit(());
    }

    /// Records a failure without emitting the error signal, for
    /// constructor paths where no observer can exist yet.
    pub(crate) fn store_error_message(&self, message: String) {
        *self.error_message.borrow_mut() = message;
    }

    pub(crate) fn peer_endpoint(&self) -> String {
        let peer_address = self.peer_address.borrow().clone();
        let peer_name = self.peer_name.borrow().clone();
        let endpoint = format_endpoint(&peer_address, self.peer_port.get());
        if peer_name.is_empty() {
            endpoint
        } else {
            format!("{peer_name} at {endpoint}")
        }
    }
}

impl EventSource for SocketInner {
    fn on_event(&self, events: Ready) {
        if let Err(message) = self.handle_event(events) {
            self.set_error(message);
        }
    }
}

/// A non-blocking TCP socket driven by a [`Reactor`].
///
/// All I/O is buffered: reads land in the socket's read buffer and are
/// announced through the `received_data` signal; writes are queued in the
/// write buffer and flushed when the kernel accepts them.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use kestrel_io::net::TcpSocket;
/// use kestrel_io::Reactor;
///
/// let reactor = Reactor::new().unwrap();
/// let socket = TcpSocket::new(&reactor);
/// let _on_connect = socket.connected().connect(|_| println!("connected"));
/// socket.connect("127.0.0.1", 8080);
///
/// loop {
///     reactor.turn(Some(Duration::from_millis(100))).unwrap();
/// }
/// ```
pub struct TcpSocket {
    pub(crate) inner: Rc<SocketInner>,
}

impl TcpSocket {
    pub fn new(reactor: &Reactor) -> TcpSocket {
        TcpSocket {
            inner: SocketInner::new(reactor, None),
        }
    }

    /// Adopts an already-connected descriptor, for example one handed out
    /// by [`TcpListener`]. A descriptor that is not a connected TCP stream
    /// socket is closed and the socket stays `Unconnected`.
    pub fn from_descriptor(reactor: &Reactor, descriptor: RawFd) -> TcpSocket {
        let socket = TcpSocket::new(reactor);
        socket.inner.set_socket_descriptor(descriptor);
        socket
    }

    /// Records the preferred local endpoint; applied at the next
    /// [`connect`](TcpSocket::connect).
    pub fn bind(&self, address: &str, port: u16) {
        self.inner.bind(address, port);
    }

    /// Starts connecting to `host:port`. `host` may be an IPv4/IPv6
    /// literal or a name to resolve. Any previous connection is aborted
    /// first; the recorded bind endpoint is preserved.
    pub fn connect(&self, host: &str, port: u16) {
        self.inner.connect(host, port);
    }

    /// Starts a graceful disconnect: stops reading, drains the write
    /// buffer, shuts down the write side and waits for the peer to close.
    /// A no-op unless the socket is `Connecting` or `Connected`.
    pub fn disconnect_from_peer(&self) {
        self.inner.disconnect_from_peer();
    }

    /// Drops the connection on the floor: closes the descriptor, cancels
    /// any in-flight name lookup and timers, and clears both buffers.
    pub fn abort(&self) {
        self.inner.abort();
    }

    /// Queues `data` for sending and returns `data.len()`, or 0 when the
    /// socket is not connected.
    pub fn write(&self, data: &[u8]) -> usize {
        self.inner.user_write(data)
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        self.inner.user_read(buf)
    }

    pub fn peek(&self, buf: &mut [u8]) -> usize {
        self.inner.user_peek(buf)
    }

    pub fn read_all(&self) -> Vec<u8> {
        self.inner.user_read_all()
    }

    /// Discards up to `count` buffered bytes, returning the number
    /// discarded.
    pub fn pop_front(&self, count: usize) -> usize {
        self.inner.user_pop_front(count)
    }

    /// Bytes currently readable from the read buffer.
    pub fn data_available(&self) -> usize {
        self.inner.read_buffer.borrow().size()
    }

    /// Bytes still buffered to send.
    pub fn data_to_write(&self) -> usize {
        let mut pending = self.inner.write_buffer.borrow().size();
        if let Some(tls) = &self.inner.tls {
            pending += tls.enc_out.borrow().size();
        }
        pending
    }

    pub fn state(&self) -> SocketState {
        self.inner.state.get()
    }

    pub fn error_message(&self) -> String {
        self.inner.error_message()
    }

    pub fn peer_name(&self) -> String {
        self.inner.peer_name()
    }

    pub fn peer_address(&self) -> String {
        self.inner.peer_address()
    }

    pub fn peer_port(&self) -> u16 {
        self.inner.peer_port()
    }

    pub fn local_address(&self) -> String {
        self.inner.local_address()
    }

    pub fn local_port(&self) -> u16 {
        self.inner.local_port()
    }

    /// The proxy endpoint in use, empty unless a proxied connection set
    /// one up.
    pub fn proxy_address(&self) -> String {
        self.inner.proxy_address()
    }

    pub fn proxy_port(&self) -> u16 {
        self.inner.proxy_port()
    }

    pub fn set_socket_option(&self, option: SocketOption, value: i32) {
        self.inner.set_socket_option(option, value);
    }

    pub fn socket_option(&self, option: SocketOption) -> i32 {
        self.inner.socket_option(option)
    }

    /// Emitted once the connection is established.
    pub fn connected(&self) -> &Signal<()> {
        &self.inner.connected
    }

    /// Emitted when the connection goes away, gracefully or not.
    pub fn disconnected(&self) -> &Signal<()> {
        &self.inner.disconnected
    }

    /// Emitted when an operation fails; [`error_message`](TcpSocket::error_message)
    /// carries the details. The socket aborts right after the emission.
    pub fn error(&self) -> &Signal<()> {
        &self.inner.error
    }

    /// Emitted at most once per reactor turn after new data landed in the
    /// read buffer.
    pub fn received_data(&self) -> &Signal<()> {
        &self.inner.received_data
    }

    /// Emitted at most once per reactor turn with the number of bytes
    /// handed to the kernel.
    pub fn sent_data(&self) -> &Signal<usize> {
        &self.inner.sent_data
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.inner.abort();
        if self.inner.reactor.inner().is_dispatching() {
            let reactor = self.inner.reactor.clone();
            reactor.schedule_for_deletion(Box::new(self.inner.clone()));
        }
    }
}

impl fmt::Debug for TcpSocket {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "TcpSocket {{ state: {:?}, fd: {} }}",
            self.state(),
            self.inner.fd.get()
        )
    }
}

struct ListenerInner {
    fd: RawFd,
    registration: Registration,
    incoming: Signal<RawFd>,
}

impl EventSource for ListenerInner {
    fn on_event(&self, events: Ready) {
        if !events.is_readable() {
            return;
        }
        loop {
            match sys::accept(self.fd) {
                Ok((accepted, _peer)) => {
                    if self.incoming.observer_count() > 0 {
                        self.incoming.emit(accepted);
                    } else {
                        sys::safe_close(accepted);
                    }
                }
                Err(_) => break,
            }
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        self.registration.set_enabled(false);
        sys::safe_close(self.fd);
    }
}

/// A non-blocking accept source. Pending connections are accepted in a
/// loop and handed to the `incoming` observers as raw descriptors, ready
/// to be adopted with [`TcpSocket::from_descriptor`] or
/// [`TlsSocket::from_descriptor`](super::TlsSocket::from_descriptor).
/// Descriptors nobody claims are closed.
pub struct TcpListener {
    inner: Rc<ListenerInner>,
}

impl TcpListener {
    /// Binds and listens on `address:port`; `address` must be an IP
    /// literal. Port 0 picks an ephemeral port, readable through
    /// [`local_port`](TcpListener::local_port).
    pub fn bind(reactor: &Reactor, address: &str, port: u16) -> io::Result<TcpListener> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid address literal"))?;
        let fd = sys::new_stream_socket(sys::family_of(&ip))?;
        if let Err(err) = sys::set_reuseaddr(fd)
            .and_then(|_| sys::bind(fd, &SocketAddr::new(ip, port)))
            .and_then(|_| sys::listen(fd, LISTEN_BACKLOG))
        {
            sys::safe_close(fd);
            return Err(err);
        }
        let inner = Rc::new_cyclic(|weak: &Weak<ListenerInner>| {
            let handler: Weak<dyn EventSource> = weak.clone();
            let registration = Registration::from_weak(
                reactor,
                handler,
                fd,
                Interest::readable() | Interest::edge(),
            );
            ListenerInner {
                fd,
                registration,
                incoming: Signal::new(),
            }
        });
        inner.registration.set_enabled(true);
        Ok(TcpListener { inner })
    }

    pub fn local_port(&self) -> u16 {
        sys::local_addr(self.inner.fd)
            .map(|addr| addr.port())
            .unwrap_or(0)
    }

    /// Emitted once per accepted connection with the accepted descriptor.
    /// The observer takes ownership of the descriptor.
    pub fn incoming(&self) -> &Signal<RawFd> {
        &self.inner.incoming
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "TcpListener {{ port: {} }}", self.local_port())
    }
}
