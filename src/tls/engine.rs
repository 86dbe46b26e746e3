use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::buffer::RingBuffer;

/// The TLS state machine, fed exclusively through in-memory buffers:
/// ciphertext from the peer goes into `enc_in`, ciphertext for the peer
/// comes out of `enc_out`, decrypted application data lands in `plain_in`.
/// The kernel socket never touches the engine directly.
pub(crate) struct TlsEngine {
    conn: Connection,
    close_notify_sent: bool,
    peer_closed: bool,
}

impl TlsEngine {
    pub(crate) fn new_client(config: Arc<ClientConfig>, server_name: &str) -> Result<TlsEngine, String> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| format!("Failed to create TLS session for {server_name}."))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|err| format!("Failed to create TLS session. {err}"))?;
        Ok(TlsEngine {
            conn: Connection::Client(conn),
            close_notify_sent: false,
            peer_closed: false,
        })
    }

    pub(crate) fn new_server(config: Arc<ServerConfig>) -> Result<TlsEngine, String> {
        let conn = ServerConnection::new(config)
            .map_err(|err| format!("Failed to create TLS session. {err}"))?;
        Ok(TlsEngine {
            conn: Connection::Server(conn),
            close_notify_sent: false,
            peer_closed: false,
        })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Ciphertext is queued inside the engine awaiting a flush.
    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// The peer's close-notify has been observed.
    pub(crate) fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub(crate) fn close_notify_sent(&self) -> bool {
        self.close_notify_sent
    }

    /// Queues a close-notify alert; flush it with [`flush`](Self::flush).
    pub(crate) fn send_close_notify(&mut self) {
        if !self.close_notify_sent {
            self.close_notify_sent = true;
            self.conn.send_close_notify();
        }
    }

    /// Pumps ciphertext from `enc_in` through the engine: handshake
    /// progress, decrypted bytes into `plain_in` (bounded by its capacity),
    /// and any produced ciphertext into `enc_out`. Returns the number of
    /// plaintext bytes moved into `plain_in`.
    pub(crate) fn pump(
        &mut self,
        enc_in: &mut RingBuffer,
        enc_out: &mut RingBuffer,
        plain_in: &mut RingBuffer,
    ) -> Result<usize, String> {
        let mut produced = 0;
        loop {
            let mut progressed = false;
            while self.conn.wants_read() && !enc_in.is_empty() {
                match self.conn.read_tls(enc_in) {
                    Ok(0) => break,
                    Ok(_) => progressed = true,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(format!("TLS transport failed. {err}")),
                }
                let state = self
                    .conn
                    .process_new_packets()
                    .map_err(|err| format!("TLS error: {err}."))?;
                if state.peer_has_closed() {
                    self.peer_closed = true;
                }
                produced += self.drain_plaintext(plain_in)?;
            }
            progressed |= self.flush(enc_out)?;
            if !progressed {
                break;
            }
        }
        Ok(produced)
    }

    /// Encrypts as much of `plain_out` as the engine accepts, flushing the
    /// resulting ciphertext into `enc_out`. Returns the plaintext bytes
    /// consumed.
    pub(crate) fn encrypt(
        &mut self,
        plain_out: &mut RingBuffer,
        enc_out: &mut RingBuffer,
    ) -> Result<usize, String> {
        let mut consumed = 0;
        let mut chunk = [0u8; 4096];
        while !plain_out.is_empty() {
            let peeked = plain_out.peek(&mut chunk);
            let written = self
                .conn
                .writer()
                .write(&chunk[..peeked])
                .map_err(|err| format!("TLS error: {err}."))?;
            plain_out.pop_front(written);
            consumed += written;
            if written < peeked {
                break;
            }
        }
        self.flush(enc_out)?;
        Ok(consumed)
    }

    /// Moves ciphertext queued in the engine into `enc_out`. Returns whether
    /// anything moved.
    pub(crate) fn flush(&mut self, enc_out: &mut RingBuffer) -> Result<bool, String> {
        let mut moved = false;
        while self.conn.wants_write() {
            match self.conn.write_tls(enc_out) {
                Ok(0) => break,
                Ok(_) => moved = true,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(format!("TLS transport failed. {err}")),
            }
        }
        Ok(moved)
    }

    fn drain_plaintext(&mut self, plain_in: &mut RingBuffer) -> Result<usize, String> {
        let mut moved = 0;
        let mut chunk = [0u8; 4096];
        while !plain_in.is_full() {
            let want = chunk.len().min(plain_in.free_space());
            match self.conn.reader().read(&mut chunk[..want]) {
                Ok(0) => break,
                Ok(count) => {
                    plain_in.write(&chunk[..count]);
                    moved += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(format!("TLS error: {err}.")),
            }
        }
        Ok(moved)
    }
}
