use std::collections::BTreeSet;
use std::sync::Arc;

/// Cipher suites a [`TlsConfiguration`] can restrict a context to.
///
/// The TLS 1.2 entries are the ECDHE AEAD suites; the last three are the
/// TLS 1.3 suites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum Cipher {
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    TLS_AES_128_GCM_SHA256,
    TLS_AES_256_GCM_SHA384,
    TLS_CHACHA20_POLY1305_SHA256,
}

impl Cipher {
    pub fn is_tls13(self) -> bool {
        matches!(
            self,
            Cipher::TLS_AES_128_GCM_SHA256
                | Cipher::TLS_AES_256_GCM_SHA384
                | Cipher::TLS_CHACHA20_POLY1305_SHA256
        )
    }
}

/// Elliptic curves a [`TlsConfiguration`] can restrict key exchange to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum Curve {
    /// A 256-bit Montgomery curve.
    X25519,
    /// A 256-bit prime field Weierstrass curve (P-256).
    prime256v1,
    /// A 384-bit prime field Weierstrass curve (P-384).
    secp384r1,
    /// A 521-bit prime field Weierstrass curve (P-521).
    secp521r1,
}

/// TLS protocol version bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum TlsVersion {
    TLS_1_2,
    TLS_1_2_or_newer,
    TLS_1_3,
    TLS_1_3_or_newer,
}

/// Peer verification mode for TLS connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerVerifyMode {
    /// Verify the peer when establishing the TLS connection.
    On,
    /// Do not verify the peer.
    Off,
    /// Verify servers but not clients.
    Auto,
}

#[derive(Clone, PartialEq, Eq, Debug)]
struct TlsConfigurationData {
    certificate: String,
    private_key: String,
    private_key_password: String,
    tls_version: TlsVersion,
    ciphers: BTreeSet<Cipher>,
    curves: BTreeSet<Curve>,
    ca_certificates: BTreeSet<String>,
    peer_verify_depth: u32,
    peer_verify_mode: PeerVerifyMode,
    use_system_certificates: bool,
}

impl Default for TlsConfigurationData {
    fn default() -> Self {
        TlsConfigurationData {
            certificate: String::new(),
            private_key: String::new(),
            private_key_password: String::new(),
            tls_version: TlsVersion::TLS_1_2_or_newer,
            ciphers: BTreeSet::new(),
            curves: BTreeSet::new(),
            ca_certificates: BTreeSet::new(),
            peer_verify_depth: 0,
            peer_verify_mode: PeerVerifyMode::Auto,
            use_system_certificates: true,
        }
    }
}

/// A value-semantics description of how to configure TLS encryption:
/// certificate/key pair, protocol version bounds, cipher and curve
/// restrictions, trust anchors, and peer verification policy.
///
/// Cloning is cheap (shared data, copied on write). Contexts built from
/// equal configurations are shared through the reactor's per-thread cache.
#[derive(Clone, Default, Debug)]
pub struct TlsConfiguration {
    data: Arc<TlsConfigurationData>,
}

impl TlsConfiguration {
    /// Creates an empty TLS configuration: TLS 1.2 or newer, library
    /// default ciphers and curves, system trust store, automatic peer
    /// verification.
    pub fn new() -> TlsConfiguration {
        TlsConfiguration::default()
    }

    /// Sets the certificate chain and private key files, both in PEM
    /// format. `key_password` is kept for encrypted keys; the engine
    /// rejects encrypted keys when it cannot decrypt them.
    pub fn set_certificate_key_pair(
        &mut self,
        certificate: impl Into<String>,
        key: impl Into<String>,
        key_password: impl Into<String>,
    ) {
        let data = Arc::make_mut(&mut self.data);
        data.certificate = certificate.into();
        data.private_key = key.into();
        data.private_key_password = key_password.into();
    }

    pub fn set_tls_version(&mut self, tls_version: TlsVersion) {
        Arc::make_mut(&mut self.data).tls_version = tls_version;
    }

    /// Restricts the cipher suites. An empty set is ignored (library
    /// defaults stay in effect). A set containing only TLS 1.3 suites
    /// implicitly keeps the TLS 1.2 defaults so 1.2 handshakes remain
    /// possible.
    pub fn set_ciphers(&mut self, ciphers: BTreeSet<Cipher>) {
        if !ciphers.is_empty() {
            Arc::make_mut(&mut self.data).ciphers = ciphers;
        }
    }

    pub fn supported_ciphers() -> BTreeSet<Cipher> {
        [
            Cipher::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            Cipher::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            Cipher::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            Cipher::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            Cipher::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            Cipher::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            Cipher::TLS_AES_128_GCM_SHA256,
            Cipher::TLS_AES_256_GCM_SHA384,
            Cipher::TLS_CHACHA20_POLY1305_SHA256,
        ]
        .into_iter()
        .collect()
    }

    /// Restricts the key-exchange curves. An empty set is ignored (all
    /// supported curves stay enabled).
    pub fn set_curves(&mut self, curves: BTreeSet<Curve>) {
        if !curves.is_empty() {
            Arc::make_mut(&mut self.data).curves = curves;
        }
    }

    pub fn supported_curves() -> BTreeSet<Curve> {
        [
            Curve::X25519,
            Curve::prime256v1,
            Curve::secp384r1,
            Curve::secp521r1,
        ]
        .into_iter()
        .collect()
    }

    /// Adds one PEM file to the set of CA certificate files.
    pub fn add_ca_certificate(&mut self, certificate: impl Into<String>) {
        Arc::make_mut(&mut self.data)
            .ca_certificates
            .insert(certificate.into());
    }

    /// Replaces the CA certificate file set. A non-empty set also turns
    /// the system trust store off.
    pub fn set_ca_certificates(&mut self, certificates: BTreeSet<String>) {
        if !certificates.is_empty() {
            let data = Arc::make_mut(&mut self.data);
            data.use_system_certificates = false;
            data.ca_certificates = certificates;
        }
    }

    /// Maximum certificate-chain depth; 0 is treated as unlimited, capped
    /// at 65536.
    pub fn set_peer_verify_depth(&mut self, depth: u32) {
        Arc::make_mut(&mut self.data).peer_verify_depth = depth.min(65535);
    }

    pub fn set_peer_verify_mode(&mut self, mode: PeerVerifyMode) {
        Arc::make_mut(&mut self.data).peer_verify_mode = mode;
    }

    pub fn set_use_system_certificates(&mut self, use_system_certificates: bool) {
        Arc::make_mut(&mut self.data).use_system_certificates = use_system_certificates;
    }

    pub fn certificate(&self) -> &str {
        &self.data.certificate
    }

    pub fn private_key(&self) -> &str {
        &self.data.private_key
    }

    pub fn private_key_password(&self) -> &str {
        &self.data.private_key_password
    }

    pub fn tls_version(&self) -> TlsVersion {
        self.data.tls_version
    }

    pub fn ciphers(&self) -> &BTreeSet<Cipher> {
        &self.data.ciphers
    }

    pub fn curves(&self) -> &BTreeSet<Curve> {
        &self.data.curves
    }

    pub fn ca_certificates(&self) -> &BTreeSet<String> {
        &self.data.ca_certificates
    }

    pub fn peer_verify_depth(&self) -> u32 {
        self.data.peer_verify_depth
    }

    pub fn peer_verify_mode(&self) -> PeerVerifyMode {
        self.data.peer_verify_mode
    }

    pub fn use_system_certificates(&self) -> bool {
        self.data.use_system_certificates
    }
}

impl PartialEq for TlsConfiguration {
    fn eq(&self, other: &TlsConfiguration) -> bool {
        Arc::ptr_eq(&self.data, &other.data) || *self.data == *other.data
    }
}

impl Eq for TlsConfiguration {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clones_share_until_written() {
        let mut a = TlsConfiguration::new();
        a.set_tls_version(TlsVersion::TLS_1_3);
        let b = a.clone();
        assert_eq!(a, b);

        a.set_peer_verify_mode(PeerVerifyMode::Off);
        assert_ne!(a, b);
        assert_eq!(b.peer_verify_mode(), PeerVerifyMode::Auto);
    }

    #[test]
    fn empty_cipher_and_curve_sets_are_ignored() {
        let mut config = TlsConfiguration::new();
        config.set_ciphers(BTreeSet::new());
        config.set_curves(BTreeSet::new());
        assert!(config.ciphers().is_empty());
        assert!(config.curves().is_empty());

        config.set_ciphers([Cipher::TLS_AES_128_GCM_SHA256].into_iter().collect());
        assert_eq!(config.ciphers().len(), 1);
    }

    #[test]
    fn explicit_ca_set_disables_system_store() {
        let mut config = TlsConfiguration::new();
        assert!(config.use_system_certificates());
        config.set_ca_certificates(["ca.pem".to_string()].into_iter().collect());
        assert!(!config.use_system_certificates());
        assert_eq!(config.ca_certificates().len(), 1);
    }

    #[test]
    fn verify_depth_is_capped() {
        let mut config = TlsConfiguration::new();
        config.set_peer_verify_depth(1_000_000);
        assert_eq!(config.peer_verify_depth(), 65535);
    }
}
