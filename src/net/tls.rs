use std::cell::{Cell, RefCell};
use std::fmt;
use std::ops::Deref;
use std::os::unix::io::RawFd;

use crate::buffer::{DataSource, RingBuffer};
use crate::interest::Interest;
use crate::reactor::Reactor;
use crate::ready::Ready;
use crate::signal::Signal;
use crate::sys::socket as sys;
use crate::timer::Timer;
use crate::tls::context::{TlsContext, TlsRole};
use crate::tls::engine::TlsEngine;
use crate::tls::TlsConfiguration;

use super::tcp::{FdSink, FdSource, SocketInner, SocketState, TcpSocket, DISCONNECT_TIMEOUT_MS};

pub(crate) const HANDSHAKE_TIMEOUT_MS: u64 = 60_000;

/// The TLS overlay carried by a socket: the engine, the two ciphertext
/// buffers it is fed through, and the handshake bookkeeping. The plaintext
/// buffers are the socket's ordinary read and write buffers.
pub(crate) struct TlsState {
    configuration: TlsConfiguration,
    context: RefCell<Option<TlsContext>>,
    context_error: RefCell<String>,
    pub(crate) engine: RefCell<Option<TlsEngine>>,
    pub(crate) enc_in: RefCell<RingBuffer>,
    pub(crate) enc_out: RefCell<RingBuffer>,
    pub(crate) handshake_timer: Timer,
    pub(crate) handshake_complete: Cell<bool>,
    encrypted: Signal<()>,
}

impl TlsState {
    pub(crate) fn new(
        reactor: &Reactor,
        configuration: TlsConfiguration,
        role: TlsRole,
    ) -> TlsState {
        let handshake_timer = Timer::new(reactor);
        handshake_timer.set_single_shot(true);
        let (context, context_error) = {
            let mut cache = reactor.inner().tls_cache.borrow_mut();
            match TlsContext::from_configuration(&mut cache, &configuration, role) {
                Ok(context) => (Some(context), String::new()),
                Err(message) => (None, message),
            }
        };
        TlsState {
            configuration,
            context: RefCell::new(context),
            context_error: RefCell::new(context_error),
            engine: RefCell::new(None),
            enc_in: RefCell::new(RingBuffer::new()),
            enc_out: RefCell::new(RingBuffer::new()),
            handshake_timer,
            handshake_complete: Cell::new(false),
            encrypted: Signal::new(),
        }
    }

    pub(crate) fn configuration(&self) -> &TlsConfiguration {
        &self.configuration
    }

    pub(crate) fn context_error(&self) -> String {
        self.context_error.borrow().clone()
    }

    /// Client connects re-derive the context when the socket was built for
    /// the server role (an adopted descriptor that is reused to connect
    /// out).
    pub(crate) fn ensure_client_context(&self, reactor: &Reactor) -> Result<(), String> {
        let role = self.context.borrow().as_ref().map(|ctx| ctx.role());
        match role {
            None => Err(self.fallback_error()),
            Some(TlsRole::Client) => Ok(()),
            Some(TlsRole::Server) => {
                let rebuilt = {
                    let mut cache = reactor.inner().tls_cache.borrow_mut();
                    TlsContext::from_configuration(&mut cache, &self.configuration, TlsRole::Client)
                };
                match rebuilt {
                    Ok(context) => {
                        *self.context.borrow_mut() = Some(context);
                        Ok(())
                    }
                    Err(message) => {
                        *self.context.borrow_mut() = None;
                        *self.context_error.borrow_mut() = message.clone();
                        Err(message)
                    }
                }
            }
        }
    }

    fn fallback_error(&self) -> String {
        let message = self.context_error.borrow().clone();
        if message.is_empty() {
            "Failed to create TLS context from TlsConfiguration. Unknown TLS error.".to_string()
        } else {
            message
        }
    }
}

impl SocketInner {
    /// Builds a fresh engine from the cached context and wires it to the
    /// ciphertext buffers.
    pub(crate) fn setup_tls(&self) -> Result<(), String> {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        self.abort_tls();
        let context = tls
            .context
            .borrow()
            .clone()
            .ok_or_else(|| tls.fallback_error())?;
        let engine = match context.role() {
            TlsRole::Client => {
                let peer_name = self.peer_name();
                let peer_address = self.peer_address();
                let server_name = if !peer_name.is_empty() {
                    peer_name
                } else if !peer_address.is_empty() {
                    peer_address
                } else {
                    self.first_host_address()
                };
                let config = context
                    .client_config()
                    .expect("client context carries a client config")
                    .clone();
                TlsEngine::new_client(config, &server_name)?
            }
            TlsRole::Server => {
                let config = context
                    .server_config()
                    .expect("server context carries a server config")
                    .clone();
                TlsEngine::new_server(config)?
            }
        };
        *tls.engine.borrow_mut() = Some(engine);
        Ok(())
    }

    pub(crate) fn abort_tls(&self) {
        if let Some(tls) = &self.tls {
            *tls.engine.borrow_mut() = None;
            tls.handshake_complete.set(false);
            tls.handshake_timer.stop();
            tls.enc_in.borrow_mut().clear();
            tls.enc_out.borrow_mut().clear();
        }
    }

    /// Drives the handshake one step. On completion: stop the timer, flush
    /// what the engine queued, mark complete, post a writable event so
    /// buffered plaintext goes out, and emit `encrypted`.
    pub(crate) fn do_handshake(&self) -> Result<(), String> {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        if tls.handshake_complete.get() {
            return Ok(());
        }
        if !tls.handshake_timer.is_active() {
            tls.handshake_timer.start_with(HANDSHAKE_TIMEOUT_MS);
        }
        let handshaking = {
            let mut engine_ref = tls.engine.borrow_mut();
            let engine = engine_ref
                .as_mut()
                .ok_or_else(|| "TLS handshake failed.".to_string())?;
            engine.pump(
                &mut tls.enc_in.borrow_mut(),
                &mut tls.enc_out.borrow_mut(),
                &mut self.read_buffer.borrow_mut(),
            )?;
            engine.is_handshaking()
        };
        if !handshaking {
            tls.handshake_timer.stop();
            self.write_to_channel_tls()?;
            tls.handshake_complete.set(true);
            self.registration.post_event(Ready::writable());
            tls.encrypted.emit(());
        } else {
            self.write_to_channel_tls()?;
        }
        Ok(())
    }

    pub(crate) fn read_from_channel_tls(&self) -> Result<usize, String> {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        if self.read_buffer.borrow().is_full() {
            return Ok(0);
        }
        let (bytes_read, post_writable, peer_closed) = {
            let mut engine_ref = tls.engine.borrow_mut();
            let Some(engine) = engine_ref.as_mut() else {
                return Ok(0);
            };
            let had_pending_write = engine.wants_write();
            let mut source = FdSource(self.fd.get());
            tls.enc_in.borrow_mut().write_from(&mut source);
            if source.data_available() > 0 {
                self.registration.post_event(Ready::readable());
            }
            let enc_out_before = tls.enc_out.borrow().size();
            let bytes_read = engine.pump(
                &mut tls.enc_in.borrow_mut(),
                &mut tls.enc_out.borrow_mut(),
                &mut self.read_buffer.borrow_mut(),
            )?;
            let enc_out_grew = tls.enc_out.borrow().size() > enc_out_before;
            let peer_closed = tls.handshake_complete.get() && engine.peer_closed();
            (bytes_read, had_pending_write || enc_out_grew, peer_closed)
        };
        if post_writable {
            self.registration.post_event(Ready::writable());
        }
        if peer_closed {
            self.disconnect_from_peer();
        }
        Ok(bytes_read)
    }

    pub(crate) fn write_to_channel_tls(&self) -> Result<usize, String> {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        {
            let mut engine_ref = tls.engine.borrow_mut();
            if let Some(engine) = engine_ref.as_mut() {
                if tls.handshake_complete.get() {
                    engine.encrypt(
                        &mut self.write_buffer.borrow_mut(),
                        &mut tls.enc_out.borrow_mut(),
                    )?;
                } else {
                    engine.flush(&mut tls.enc_out.borrow_mut())?;
                }
            }
        }
        let mut sink = FdSink(self.fd.get());
        let bytes_written = tls.enc_out.borrow_mut().read_into(&mut sink);
        self.write_event_scheduled.set(false);
        Ok(bytes_written)
    }

    pub(crate) fn disconnect_from_peer_tls(&self) {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        if !tls.handshake_complete.get() {
            self.abort();
            return;
        }
        self.state.set(SocketState::Disconnecting);
        self.disconnect_timer.start_with(DISCONNECT_TIMEOUT_MS);
        if self.write_buffer.borrow().is_empty() {
            self.queue_close_notify();
            if tls.enc_out.borrow().is_empty() {
                self.registration.set_interest(
                    self.registration.interest() - Interest::readable() - Interest::writable(),
                );
                if sys::shutdown_write(self.fd.get()).is_err() {
                    self.force_close();
                    self.emit_disconnected();
                }
            }
        }
    }

    /// Write-side step of the TLS shutdown sequence, run while
    /// `Disconnecting` once the plaintext buffer is drained. Returns true
    /// when the transport itself reported the connection gone.
    pub(crate) fn finish_tls_shutdown(&self) -> Result<bool, String> {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        self.queue_close_notify();
        if tls.enc_out.borrow().is_empty() {
            self.registration.set_interest(
                self.registration.interest() - Interest::readable() - Interest::writable(),
            );
            if sys::shutdown_write(self.fd.get()).is_err() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn queue_close_notify(&self) {
        let tls = self.tls.as_ref().expect("socket has no TLS overlay");
        let queued = {
            let mut engine_ref = tls.engine.borrow_mut();
            match engine_ref.as_mut() {
                Some(engine) if !engine.close_notify_sent() => {
                    engine.send_close_notify();
                    let _ = engine.flush(&mut tls.enc_out.borrow_mut());
                    true
                }
                _ => false,
            }
        };
        if queued {
            self.registration.post_event(Ready::writable());
        }
    }

    pub(crate) fn on_handshake_timeout(&self) {
        let endpoint = self.peer_endpoint();
        self.set_error(format!(
            "Failed to connect to {endpoint}. TLS handshake timed out."
        ));
    }
}

/// A TLS socket: the same state machine, signals and buffers as
/// [`TcpSocket`], with a TLS engine between the buffers and the wire.
/// Ciphertext flows through two in-memory buffers; the kernel socket only
/// ever sees encrypted bytes.
///
/// `connected` fires when the transport is up; `encrypted` fires once the
/// handshake is done and application data may flow.
pub struct TlsSocket {
    socket: TcpSocket,
}

impl TlsSocket {
    /// A client socket that will run the TLS handshake after
    /// [`connect`](TcpSocket::connect) establishes the transport.
    pub fn new(reactor: &Reactor, configuration: TlsConfiguration) -> TlsSocket {
        let tls = TlsState::new(reactor, configuration, TlsRole::Client);
        TlsSocket {
            socket: TcpSocket {
                inner: SocketInner::new(reactor, Some(tls)),
            },
        }
    }

    /// Adopts an accepted descriptor and drives the server side of the
    /// handshake. A descriptor that fails validation, or a configuration
    /// the context cannot be built from, leaves the socket `Unconnected`
    /// with the failure in [`error_message`](TcpSocket::error_message).
    pub fn from_descriptor(
        reactor: &Reactor,
        descriptor: RawFd,
        configuration: TlsConfiguration,
    ) -> TlsSocket {
        let tls = TlsState::new(reactor, configuration, TlsRole::Server);
        let context_error = tls.context_error();
        let socket = TlsSocket {
            socket: TcpSocket {
                inner: SocketInner::new(reactor, Some(tls)),
            },
        };
        if context_error.is_empty() {
            socket.socket.inner.set_socket_descriptor(descriptor);
        } else {
            if descriptor >= 0 {
                sys::safe_close(descriptor);
            }
            socket.socket.inner.store_error_message(context_error);
        }
        socket
    }

    /// Whether the connection is established and the handshake has
    /// completed.
    pub fn is_encrypted(&self) -> bool {
        let inner = &self.socket.inner;
        inner.state.get() == SocketState::Connected
            && inner
                .tls
                .as_ref()
                .map(|tls| tls.handshake_complete.get())
                .unwrap_or(false)
    }

    pub fn tls_configuration(&self) -> &TlsConfiguration {
        self.socket
            .inner
            .tls
            .as_ref()
            .expect("TLS socket carries a TLS overlay")
            .configuration()
    }

    /// Emitted once the handshake completes, strictly after `connected`.
    pub fn encrypted(&self) -> &Signal<()> {
        &self
            .socket
            .inner
            .tls
            .as_ref()
            .expect("TLS socket carries a TLS overlay")
            .encrypted
    }
}

impl Deref for TlsSocket {
    type Target = TcpSocket;

    fn deref(&self) -> &TcpSocket {
        &self.socket
    }
}

impl fmt::Debug for TlsSocket {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "TlsSocket {{ state: {:?}, encrypted: {} }}",
            self.state(),
            self.is_encrypted()
        )
    }
}
