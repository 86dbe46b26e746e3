pub mod config;
pub(crate) mod context;
pub(crate) mod engine;

pub use config::{Cipher, Curve, PeerVerifyMode, TlsConfiguration, TlsVersion};
pub use context::TlsRole;
