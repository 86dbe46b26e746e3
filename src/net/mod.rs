pub mod tcp;
pub mod tls;

pub use tcp::{SocketOption, SocketState, TcpListener, TcpSocket};
pub use tls::TlsSocket;
