mod common;

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use common::run_until;
use kestrel_io::net::{SocketState, TcpListener, TlsSocket};
use kestrel_io::tls::{PeerVerifyMode, TlsConfiguration, TlsVersion};
use kestrel_io::{Reactor, Subscription};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

/// CA plus a leaf certificate for "localhost", written out as PEM files.
struct TestPki {
    dir: PathBuf,
    ca_path: String,
    cert_path: String,
    key_path: String,
}

impl TestPki {
    fn generate(tag: &str) -> TestPki {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        let dir = std::env::temp_dir().join(format!(
            "kestrel-io-test-pki-{tag}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let ca_path = dir.join("ca.pem");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        fs::write(&ca_path, ca_cert.pem()).unwrap();
        fs::write(&cert_path, leaf_cert.pem()).unwrap();
        fs::write(&key_path, leaf_key.serialize_pem()).unwrap();

        TestPki {
            dir,
            ca_path: ca_path.to_string_lossy().into_owned(),
            cert_path: cert_path.to_string_lossy().into_owned(),
            key_path: key_path.to_string_lossy().into_owned(),
        }
    }

    fn server_configuration(&self) -> TlsConfiguration {
        let mut configuration = TlsConfiguration::new();
        configuration.set_certificate_key_pair(&self.cert_path, &self.key_path, "");
        configuration
    }

    fn client_configuration(&self) -> TlsConfiguration {
        let mut configuration = TlsConfiguration::new();
        configuration
            .set_ca_certificates([self.ca_path.clone()].into_iter().collect::<BTreeSet<_>>());
        configuration
    }
}

impl Drop for TestPki {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

struct TlsPeer {
    socket: Rc<TlsSocket>,
    encrypted: Rc<Cell<bool>>,
    disconnected: Rc<Cell<bool>>,
    errored: Rc<Cell<bool>>,
    received: Rc<RefCell<Vec<u8>>>,
    received_at_disconnect: Rc<Cell<usize>>,
    _subscriptions: Vec<Subscription>,
}

fn observe(socket: Rc<TlsSocket>, echo: bool) -> TlsPeer {
    let encrypted = Rc::new(Cell::new(false));
    let disconnected = Rc::new(Cell::new(false));
    let errored = Rc::new(Cell::new(false));
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let received_at_disconnect = Rc::new(Cell::new(0usize));

    let mut subscriptions = Vec::new();
    let observed = encrypted.clone();
    subscriptions.push(socket.encrypted().connect(move |_| observed.set(true)));
    let observed = errored.clone();
    subscriptions.push(socket.error().connect(move |_| observed.set(true)));

    let observed = received.clone();
    let reader = Rc::downgrade(&socket);
    subscriptions.push(socket.received_data().connect(move |_| {
        if let Some(socket) = reader.upgrade() {
            let data = socket.read_all();
            observed.borrow_mut().extend_from_slice(&data);
            if echo {
                socket.write(&data);
            }
        }
    }));

    let observed = disconnected.clone();
    let counted = received.clone();
    let at_disconnect = received_at_disconnect.clone();
    subscriptions.push(socket.disconnected().connect(move |_| {
        observed.set(true);
        at_disconnect.set(counted.borrow().len());
    }));

    TlsPeer {
        socket,
        encrypted,
        disconnected,
        errored,
        received,
        received_at_disconnect,
        _subscriptions: subscriptions,
    }
}

fn spawn_tls_acceptor(
    reactor: &Reactor,
    listener: &TcpListener,
    configuration: TlsConfiguration,
    echo: bool,
) -> Rc<RefCell<Vec<TlsPeer>>> {
    let peers: Rc<RefCell<Vec<TlsPeer>>> = Rc::new(RefCell::new(Vec::new()));
    let accept_reactor = reactor.clone();
    let held = peers.clone();
    let subscription = listener.incoming().connect(move |descriptor| {
        let socket = Rc::new(TlsSocket::from_descriptor(
            &accept_reactor,
            descriptor,
            configuration.clone(),
        ));
        let peer = observe(socket, echo);
        held.borrow_mut().push(peer);
    });
    std::mem::forget(subscription);
    peers
}

#[test]
fn tls_echo_round_trip() {
    let pki = TestPki::generate("echo");
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let peers = spawn_tls_acceptor(&reactor, &listener, pki.server_configuration(), true);

    let client = Rc::new(TlsSocket::new(&reactor, pki.client_configuration()));
    let client_connected = Rc::new(Cell::new(false));
    let observed = client_connected.clone();
    let _on_connect = client.connected().connect(move |_| observed.set(true));
    let client_peer = observe(client.clone(), false);

    client_peer.socket.connect("localhost", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.encrypted.get()
    }));
    // transport comes up strictly before encryption
    assert!(client_connected.get());
    assert!(client_peer.socket.is_encrypted());

    client_peer.socket.write(b"over the wire");
    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.received.borrow().as_slice() == b"over the wire"
    }));

    assert!(!client_peer.errored.get());
    assert!(!peers.borrow()[0].errored.get());
}

#[test]
fn tls13_only_server_rejects_tls12_only_client() {
    let pki = TestPki::generate("version-mismatch");
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();

    let mut server_configuration = pki.server_configuration();
    server_configuration.set_tls_version(TlsVersion::TLS_1_3);
    let peers = spawn_tls_acceptor(&reactor, &listener, server_configuration, false);

    let mut client_configuration = pki.client_configuration();
    client_configuration.set_tls_version(TlsVersion::TLS_1_2);
    let client = Rc::new(TlsSocket::new(&reactor, client_configuration));
    let client_connected = Rc::new(Cell::new(false));
    let observed = client_connected.clone();
    let _on_connect = client.connected().connect(move |_| observed.set(true));
    let client_peer = observe(client.clone(), false);

    client_peer.socket.connect("localhost", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.disconnected.get() || client_peer.errored.get()
    }));
    assert!(client_connected.get());
    assert!(!client_peer.encrypted.get());
    assert!(!client_peer.socket.is_encrypted());

    // the failed connection is gone on the server side as well
    assert!(run_until(&reactor, Duration::from_secs(10), || {
        let peers = peers.borrow();
        !peers.is_empty()
            && peers
                .iter()
                .all(|peer| peer.socket.state() == SocketState::Unconnected)
    }));
}

#[test]
fn tls_graceful_close_delivers_every_byte_first() {
    const PAYLOAD: usize = 256 * 1024;

    let pki = TestPki::generate("graceful-close");
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();

    let mut server_configuration = pki.server_configuration();
    server_configuration.set_tls_version(TlsVersion::TLS_1_3);
    let peers = spawn_tls_acceptor(&reactor, &listener, server_configuration, false);

    let mut client_configuration = pki.client_configuration();
    client_configuration.set_tls_version(TlsVersion::TLS_1_3);
    let client = Rc::new(TlsSocket::new(&reactor, client_configuration));
    let client_peer = observe(client.clone(), false);

    client_peer.socket.connect("localhost", listener.local_port());
    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.encrypted.get()
    }));

    let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 239) as u8).collect();
    assert_eq!(client_peer.socket.write(&payload), PAYLOAD);
    client_peer.socket.disconnect_from_peer();

    assert!(run_until(&reactor, Duration::from_secs(30), || {
        !peers.borrow().is_empty() && peers.borrow()[0].disconnected.get()
    }));
    {
        let peers = peers.borrow();
        let server_peer = &peers[0];
        assert_eq!(server_peer.received_at_disconnect.get(), PAYLOAD);
        assert_eq!(server_peer.received.borrow().as_slice(), &payload[..]);
        assert!(!server_peer.errored.get());
    }

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.disconnected.get()
    }));
    assert!(!client_peer.errored.get());
}

#[test]
fn client_rejects_a_server_it_cannot_verify() {
    let pki = TestPki::generate("untrusted");
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let _peers = spawn_tls_acceptor(&reactor, &listener, pki.server_configuration(), false);

    // default configuration trusts only the platform store, not our CA
    let client = Rc::new(TlsSocket::new(&reactor, TlsConfiguration::new()));
    let client_peer = observe(client.clone(), false);
    client_peer.socket.connect("localhost", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.errored.get()
    }));
    assert!(!client_peer.encrypted.get());
    assert_eq!(client_peer.socket.state(), SocketState::Unconnected);
}

#[test]
fn disabling_peer_verification_accepts_an_untrusted_server() {
    let pki = TestPki::generate("verify-off");
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let _peers = spawn_tls_acceptor(&reactor, &listener, pki.server_configuration(), true);

    let mut client_configuration = TlsConfiguration::new();
    client_configuration.set_peer_verify_mode(PeerVerifyMode::Off);
    let client = Rc::new(TlsSocket::new(&reactor, client_configuration));
    let client_peer = observe(client.clone(), false);
    client_peer.socket.connect("localhost", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.encrypted.get()
    }));

    client_peer.socket.write(b"ping");
    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_peer.received.borrow().as_slice() == b"ping"
    }));
    assert!(!client_peer.errored.get());
}
