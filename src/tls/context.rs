use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use log::warn;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::{ring, CryptoProvider, SupportedKxGroup, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{NoServerSessionStorage, WebPkiClientVerifier};
use rustls::version::{TLS12, TLS13};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
    SupportedCipherSuite, SupportedProtocolVersion,
};

use super::config::{Cipher, Curve, PeerVerifyMode, TlsConfiguration, TlsVersion};

/// Whether a context drives the connecting or the accepting side of the
/// handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

#[derive(Clone)]
pub(crate) enum ContextKind {
    Client(Arc<ClientConfig>),
    Server(Arc<ServerConfig>),
}

/// A built TLS context: the configuration it came from plus the engine
/// configuration derived from it. Contexts are cached per reactor, keyed by
/// (role, configuration).
#[derive(Clone)]
pub(crate) struct TlsContext {
    role: TlsRole,
    configuration: TlsConfiguration,
    kind: ContextKind,
}

impl TlsContext {
    pub(crate) fn role(&self) -> TlsRole {
        self.role
    }

    pub(crate) fn configuration(&self) -> &TlsConfiguration {
        &self.configuration
    }

    pub(crate) fn client_config(&self) -> Option<&Arc<ClientConfig>> {
        match &self.kind {
            ContextKind::Client(config) => Some(config),
            ContextKind::Server(_) => None,
        }
    }

    pub(crate) fn server_config(&self) -> Option<&Arc<ServerConfig>> {
        match &self.kind {
            ContextKind::Server(config) => Some(config),
            ContextKind::Client(_) => None,
        }
    }

    /// Returns the cached context for (role, configuration), building and
    /// caching a fresh one on the first request.
    pub(crate) fn from_configuration(
        cache: &mut ContextCache,
        configuration: &TlsConfiguration,
        role: TlsRole,
    ) -> Result<TlsContext, String> {
        if let Some(context) = cache
            .contexts
            .iter()
            .find(|ctx| ctx.role == role && ctx.configuration == *configuration)
        {
            return Ok(context.clone());
        }
        let context = build_context(cache, configuration, role)?;
        cache.contexts.push(context.clone());
        Ok(context)
    }
}

/// Per-reactor cache of built contexts plus the lazily loaded platform
/// trust store.
pub(crate) struct ContextCache {
    contexts: Vec<TlsContext>,
    system_roots: Option<Arc<Vec<CertificateDer<'static>>>>,
}

impl ContextCache {
    pub(crate) fn new() -> ContextCache {
        ContextCache {
            contexts: Vec::new(),
            system_roots: None,
        }
    }

    fn system_roots(&mut self) -> Result<Arc<Vec<CertificateDer<'static>>>, String> {
        if let Some(roots) = &self.system_roots {
            return Ok(roots.clone());
        }
        let certs = rustls_native_certs::load_native_certs()
            .map_err(|err| format!("Failed to load system certificates. {err}"))?;
        let roots = Arc::new(certs);
        self.system_roots = Some(roots.clone());
        Ok(roots)
    }
}

const DEFAULT_TLS12_SUITES: [Cipher; 6] = [
    Cipher::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    Cipher::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    Cipher::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    Cipher::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    Cipher::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    Cipher::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
];

fn map_cipher(cipher: Cipher) -> SupportedCipherSuite {
    use ring::cipher_suite;
    match cipher {
        Cipher::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        }
        Cipher::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
        }
        Cipher::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => {
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        }
        Cipher::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256
        }
        Cipher::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        }
        Cipher::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => {
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
        }
        Cipher::TLS_AES_128_GCM_SHA256 => cipher_suite::TLS13_AES_128_GCM_SHA256,
        Cipher::TLS_AES_256_GCM_SHA384 => cipher_suite::TLS13_AES_256_GCM_SHA384,
        Cipher::TLS_CHACHA20_POLY1305_SHA256 => cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    }
}

/// Expands the configured cipher set into suites, applying the rule that a
/// set containing only TLS 1.3 suites keeps the TLS 1.2 defaults.
/// Returns the suites and whether any TLS 1.3 suite is present.
fn build_cipher_suites(configuration: &TlsConfiguration) -> (Vec<SupportedCipherSuite>, bool) {
    let chosen = configuration.ciphers();
    if chosen.is_empty() {
        return (ring::DEFAULT_CIPHER_SUITES.to_vec(), true);
    }
    let mut tls12: Vec<Cipher> = chosen.iter().copied().filter(|c| !c.is_tls13()).collect();
    let tls13: Vec<Cipher> = chosen.iter().copied().filter(|c| c.is_tls13()).collect();
    if tls12.is_empty() {
        tls12 = DEFAULT_TLS12_SUITES.to_vec();
    }
    let has_tls13 = !tls13.is_empty();
    let suites = tls13
        .into_iter()
        .chain(tls12)
        .map(map_cipher)
        .collect::<Vec<_>>();
    (suites, has_tls13)
}

fn build_kx_groups(configuration: &TlsConfiguration) -> Result<Vec<&'static dyn SupportedKxGroup>, String> {
    let chosen = configuration.curves();
    if chosen.is_empty() {
        return Ok(ring::ALL_KX_GROUPS.to_vec());
    }
    let mut groups: Vec<&'static dyn SupportedKxGroup> = Vec::new();
    for curve in chosen {
        match curve {
            Curve::X25519 => groups.push(ring::kx_group::X25519),
            Curve::prime256v1 => groups.push(ring::kx_group::SECP256R1),
            Curve::secp384r1 => groups.push(ring::kx_group::SECP384R1),
            Curve::secp521r1 => {
                warn!("the TLS engine does not support secp521r1; skipping it");
            }
        }
    }
    if groups.is_empty() {
        return Err("Failed to set curves. No configured curve is supported.".to_string());
    }
    Ok(groups)
}

fn build_versions(
    configuration: &TlsConfiguration,
    has_tls13_suites: bool,
) -> Result<Vec<&'static SupportedProtocolVersion>, String> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = match configuration.tls_version() {
        TlsVersion::TLS_1_2 => vec![&TLS12],
        TlsVersion::TLS_1_2_or_newer => vec![&TLS12, &TLS13],
        TlsVersion::TLS_1_3 | TlsVersion::TLS_1_3_or_newer => vec![&TLS13],
    };
    if !has_tls13_suites {
        versions.retain(|version| !std::ptr::eq(*version, &TLS13));
    }
    if versions.is_empty() {
        return Err(
            "Failed to configure TLS protocol. No cipher suite matches the configured version."
                .to_string(),
        );
    }
    Ok(versions)
}

fn build_provider(configuration: &TlsConfiguration) -> Result<(Arc<CryptoProvider>, bool), String> {
    let (cipher_suites, has_tls13) = build_cipher_suites(configuration);
    let kx_groups = build_kx_groups(configuration)?;
    let provider = CryptoProvider {
        cipher_suites,
        kx_groups,
        ..ring::default_provider()
    };
    Ok((Arc::new(provider), has_tls13))
}

fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let file =
        File::open(path).map_err(|_| format!("Failed to open CA certificate {path}."))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|_| format!("Failed to load CA certificate {path}."))?;
    if certs.is_empty() {
        return Err(format!("Failed to load CA certificate {path}."));
    }
    Ok(certs)
}

fn load_certificate_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let file = File::open(path)
        .map_err(|_| format!("Failed to load certificate chain from {path}."))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|_| format!("Failed to load certificate chain from {path}."))?;
    if certs.is_empty() {
        return Err(format!("Failed to load certificate chain from {path}."));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, String> {
    let file = File::open(path).map_err(|_| format!("Failed to load private key from {path}."))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .ok()
        .flatten()
        .ok_or_else(|| format!("Failed to load private key from {path}."))
}

fn build_root_store(
    cache: &mut ContextCache,
    configuration: &TlsConfiguration,
) -> Result<RootCertStore, String> {
    let mut roots = RootCertStore::empty();
    if configuration.use_system_certificates() {
        for cert in cache.system_roots()?.iter() {
            // tolerate the occasional stale certificate in the platform store
            let _ = roots.add(cert.clone());
        }
    }
    for path in configuration.ca_certificates() {
        for cert in load_certificates(path)? {
            roots
                .add(cert)
                .map_err(|_| format!("Failed to add CA certificate {path} to certificate store."))?;
        }
    }
    Ok(roots)
}

/// Server-certificate verifier for `PeerVerifyMode::Off`: accepts any
/// certificate while keeping signature checks delegated to the provider's
/// scheme list.
#[derive(Debug)]
struct AcceptAnyServerCert(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

fn build_context(
    cache: &mut ContextCache,
    configuration: &TlsConfiguration,
    role: TlsRole,
) -> Result<TlsContext, String> {
    let (provider, has_tls13) = build_provider(configuration)?;
    let versions = build_versions(configuration, has_tls13)?;

    let kind = match role {
        TlsRole::Client => {
            let builder = ClientConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(&versions)
                .map_err(|err| format!("Failed to configure TLS protocol. {err}"))?;
            let builder = match configuration.peer_verify_mode() {
                PeerVerifyMode::On | PeerVerifyMode::Auto => {
                    let roots = build_root_store(cache, configuration)?;
                    builder.with_root_certificates(roots)
                }
                PeerVerifyMode::Off => builder.dangerous().with_custom_certificate_verifier(
                    Arc::new(AcceptAnyServerCert(
                        provider.signature_verification_algorithms,
                    )),
                ),
            };
            let mut config = if configuration.certificate().is_empty() {
                builder.with_no_client_auth()
            } else {
                let chain = load_certificate_chain(configuration.certificate())?;
                let key = load_private_key(configuration.private_key())?;
                builder.with_client_auth_cert(chain, key).map_err(|_| {
                    format!(
                        "Failed to validate private key {}.",
                        configuration.private_key()
                    )
                })?
            };
            config.resumption = Resumption::disabled();
            ContextKind::Client(Arc::new(config))
        }
        TlsRole::Server => {
            let builder = ServerConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(&versions)
                .map_err(|err| format!("Failed to configure TLS protocol. {err}"))?;
            let builder = match configuration.peer_verify_mode() {
                PeerVerifyMode::On => {
                    let roots = build_root_store(cache, configuration)?;
                    let verifier = WebPkiClientVerifier::builder_with_provider(
                        Arc::new(roots),
                        provider.clone(),
                    )
                    .build()
                    .map_err(|err| format!("Failed to configure peer verification. {err}"))?;
                    builder.with_client_cert_verifier(verifier)
                }
                PeerVerifyMode::Off | PeerVerifyMode::Auto => builder.with_no_client_auth(),
            };
            if configuration.certificate().is_empty() || configuration.private_key().is_empty() {
                return Err(
                    "Failed to create TLS context. A server requires a certificate and a private key."
                        .to_string(),
                );
            }
            let chain = load_certificate_chain(configuration.certificate())?;
            let key = load_private_key(configuration.private_key())?;
            let mut config = builder.with_single_cert(chain, key).map_err(|_| {
                format!(
                    "Failed to validate private key {}.",
                    configuration.private_key()
                )
            })?;
            config.session_storage = Arc::new(NoServerSessionStorage {});
            config.send_tls13_tickets = 0;
            ContextKind::Server(Arc::new(config))
        }
    };

    Ok(TlsContext {
        role,
        configuration: configuration.clone(),
        kind,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn tls13_only_cipher_set_keeps_tls12_defaults() {
        let mut configuration = TlsConfiguration::new();
        configuration.set_ciphers(
            [Cipher::TLS_AES_128_GCM_SHA256]
                .into_iter()
                .collect::<BTreeSet<_>>(),
        );
        let (suites, has_tls13) = build_cipher_suites(&configuration);
        assert!(has_tls13);
        // one chosen 1.3 suite plus the six 1.2 defaults
        assert_eq!(suites.len(), 7);
    }

    #[test]
    fn tls12_only_cipher_set_disables_tls13() {
        let mut configuration = TlsConfiguration::new();
        configuration.set_ciphers(
            [Cipher::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256]
                .into_iter()
                .collect::<BTreeSet<_>>(),
        );
        let (suites, has_tls13) = build_cipher_suites(&configuration);
        assert!(!has_tls13);
        assert_eq!(suites.len(), 1);
        let versions = build_versions(&configuration, has_tls13).unwrap();
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn tls13_only_version_with_tls12_only_ciphers_is_rejected() {
        let mut configuration = TlsConfiguration::new();
        configuration.set_tls_version(TlsVersion::TLS_1_3);
        assert!(build_versions(&configuration, false).is_err());
    }

    #[test]
    fn unsupported_curve_alone_is_rejected() {
        let mut configuration = TlsConfiguration::new();
        configuration.set_curves([Curve::secp521r1].into_iter().collect::<BTreeSet<_>>());
        assert!(build_kx_groups(&configuration).is_err());

        configuration.set_curves(
            [Curve::secp521r1, Curve::X25519]
                .into_iter()
                .collect::<BTreeSet<_>>(),
        );
        assert_eq!(build_kx_groups(&configuration).unwrap().len(), 1);
    }
}
