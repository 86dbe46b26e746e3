mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use common::run_until;
use kestrel_io::net::{SocketOption, SocketState, TcpListener, TcpSocket};
use kestrel_io::{Reactor, Subscription};

/// One accepted server-side connection that echoes everything it receives.
struct EchoPeer {
    socket: Rc<TcpSocket>,
    disconnected: Rc<Cell<bool>>,
    _subscriptions: Vec<Subscription>,
}

fn spawn_echo_acceptor(
    reactor: &Reactor,
    listener: &TcpListener,
) -> Rc<RefCell<Vec<EchoPeer>>> {
    let peers: Rc<RefCell<Vec<EchoPeer>>> = Rc::new(RefCell::new(Vec::new()));
    let accept_reactor = reactor.clone();
    let held = peers.clone();
    let subscription = listener.incoming().connect(move |descriptor| {
        let socket = Rc::new(TcpSocket::from_descriptor(&accept_reactor, descriptor));
        let mut subscriptions = Vec::new();

        let echo = Rc::downgrade(&socket);
        subscriptions.push(socket.received_data().connect(move |_| {
            if let Some(socket) = echo.upgrade() {
                let data = socket.read_all();
                socket.write(&data);
            }
        }));

        let disconnected = Rc::new(Cell::new(false));
        let observed = disconnected.clone();
        subscriptions.push(socket.disconnected().connect(move |_| observed.set(true)));

        held.borrow_mut().push(EchoPeer {
            socket,
            disconnected,
            _subscriptions: subscriptions,
        });
    });
    // the acceptor lives as long as the peer list
    std::mem::forget(subscription);
    peers
}

struct ClientProbe {
    connected: Rc<Cell<bool>>,
    disconnected: Rc<Cell<bool>>,
    errored: Rc<Cell<bool>>,
    received: Rc<RefCell<Vec<u8>>>,
    sent: Rc<Cell<usize>>,
    _subscriptions: Vec<Subscription>,
}

fn probe(socket: &Rc<TcpSocket>) -> ClientProbe {
    let connected = Rc::new(Cell::new(false));
    let disconnected = Rc::new(Cell::new(false));
    let errored = Rc::new(Cell::new(false));
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sent = Rc::new(Cell::new(0usize));

    let mut subscriptions = Vec::new();
    let observed = connected.clone();
    subscriptions.push(socket.connected().connect(move |_| observed.set(true)));
    let observed = disconnected.clone();
    subscriptions.push(socket.disconnected().connect(move |_| observed.set(true)));
    let observed = errored.clone();
    subscriptions.push(socket.error().connect(move |_| observed.set(true)));
    let observed = received.clone();
    let reader = Rc::downgrade(socket);
    subscriptions.push(socket.received_data().connect(move |_| {
        if let Some(socket) = reader.upgrade() {
            observed.borrow_mut().extend_from_slice(&socket.read_all());
        }
    }));
    let observed = sent.clone();
    subscriptions.push(
        socket
            .sent_data()
            .connect(move |count| observed.set(observed.get() + count)),
    );

    ClientProbe {
        connected,
        disconnected,
        errored,
        received,
        sent,
        _subscriptions: subscriptions,
    }
}

#[test]
fn echo_round_trip_and_graceful_disconnect() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let peers = spawn_echo_acceptor(&reactor, &listener);

    let client = Rc::new(TcpSocket::new(&reactor));
    let client_probe = probe(&client);
    client.connect("127.0.0.1", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(5), || {
        client_probe.connected.get()
    }));
    assert_eq!(client.state(), SocketState::Connected);
    assert!(!client.local_address().is_empty());
    assert_eq!(client.peer_port(), listener.local_port());

    assert_eq!(client.write(b"Hello"), 5);
    assert!(run_until(&reactor, Duration::from_secs(5), || {
        client_probe.received.borrow().as_slice() == b"Hello"
    }));
    assert!(client_probe.sent.get() >= 5);

    // server-initiated graceful shutdown reaches both sides
    peers.borrow()[0].socket.disconnect_from_peer();
    assert!(run_until(&reactor, Duration::from_secs(5), || {
        client_probe.disconnected.get() && peers.borrow()[0].disconnected.get()
    }));
    assert_eq!(client.state(), SocketState::Unconnected);
    assert!(!client_probe.errored.get());
}

#[test]
fn write_requires_a_connected_socket() {
    let reactor = Reactor::new().unwrap();
    let socket = TcpSocket::new(&reactor);
    assert_eq!(socket.write(b"data"), 0);
    assert_eq!(socket.data_to_write(), 0);
}

#[test]
fn abort_is_idempotent_and_disconnect_is_a_no_op_when_unconnected() {
    let reactor = Reactor::new().unwrap();
    let socket = TcpSocket::new(&reactor);

    socket.abort();
    socket.abort();
    assert_eq!(socket.state(), SocketState::Unconnected);

    socket.disconnect_from_peer();
    assert_eq!(socket.state(), SocketState::Unconnected);
}

#[test]
fn connecting_to_a_dead_port_reports_an_error() {
    let reactor = Reactor::new().unwrap();
    let port = {
        let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
        listener.local_port()
    };

    let client = Rc::new(TcpSocket::new(&reactor));
    let client_probe = probe(&client);
    client.connect("127.0.0.1", port);

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_probe.errored.get()
    }));
    assert_eq!(client.state(), SocketState::Unconnected);
    assert!(client.error_message().contains("Failed to connect to"));
}

#[test]
fn connect_with_port_zero_is_rejected() {
    let reactor = Reactor::new().unwrap();
    let client = Rc::new(TcpSocket::new(&reactor));
    let client_probe = probe(&client);
    client.connect("127.0.0.1", 0);
    assert!(client_probe.errored.get());
    assert_eq!(
        client.error_message(),
        "Failed to connect to 127.0.0.1. Given port is 0."
    );
}

#[test]
fn peek_and_pop_front_work_against_the_read_buffer() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();

    // acceptor that just keeps the connection open
    let peers: Rc<RefCell<Vec<TcpSocket>>> = Rc::new(RefCell::new(Vec::new()));
    let accept_reactor = reactor.clone();
    let held = peers.clone();
    let _acceptor = listener.incoming().connect(move |descriptor| {
        let socket = TcpSocket::from_descriptor(&accept_reactor, descriptor);
        socket.write(b"abcdef");
        held.borrow_mut().push(socket);
    });

    let client = Rc::new(TcpSocket::new(&reactor));
    let connected = Rc::new(Cell::new(false));
    let observed = connected.clone();
    let _on_connect = client.connected().connect(move |_| observed.set(true));
    client.connect("127.0.0.1", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(5), || {
        client.data_available() == 6
    }));

    let mut peeked = [0u8; 3];
    assert_eq!(client.peek(&mut peeked), 3);
    assert_eq!(&peeked, b"abc");
    assert_eq!(client.data_available(), 6);

    assert_eq!(client.pop_front(2), 2);
    let mut rest = [0u8; 8];
    let count = client.read(&mut rest);
    assert_eq!(&rest[..count], b"cdef");
    assert_eq!(client.data_available(), 0);
}

#[test]
fn a_large_transfer_survives_read_buffer_backpressure() {
    const PAYLOAD: usize = 1024 * 1024;

    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let peers = spawn_echo_acceptor(&reactor, &listener);

    let client = Rc::new(TcpSocket::new(&reactor));
    let client_probe = probe(&client);
    client.connect("127.0.0.1", listener.local_port());
    assert!(run_until(&reactor, Duration::from_secs(5), || {
        client_probe.connected.get()
    }));

    let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 251) as u8).collect();
    assert_eq!(client.write(&payload), PAYLOAD);

    assert!(run_until(&reactor, Duration::from_secs(30), || {
        client_probe.received.borrow().len() == PAYLOAD
    }));
    assert_eq!(client_probe.received.borrow().as_slice(), &payload[..]);
    assert_eq!(client.data_to_write(), 0);
    drop(peers);
}

#[test]
fn connecting_by_name_resolves_localhost() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let _peers = spawn_echo_acceptor(&reactor, &listener);

    let client = Rc::new(TcpSocket::new(&reactor));
    let client_probe = probe(&client);
    client.connect("localhost", listener.local_port());

    assert!(run_until(&reactor, Duration::from_secs(10), || {
        client_probe.connected.get()
    }));
    assert_eq!(client.peer_name(), "localhost");
}

#[test]
fn socket_options_round_trip() {
    let reactor = Reactor::new().unwrap();
    let listener = TcpListener::bind(&reactor, "127.0.0.1", 0).unwrap();
    let _peers = spawn_echo_acceptor(&reactor, &listener);

    let client = Rc::new(TcpSocket::new(&reactor));
    let client_probe = probe(&client);
    client.connect("127.0.0.1", listener.local_port());
    assert!(run_until(&reactor, Duration::from_secs(5), || {
        client_probe.connected.get()
    }));

    // low delay is on by default
    assert_eq!(client.socket_option(SocketOption::LowDelay), 1);

    client.set_socket_option(SocketOption::KeepAlive, 1);
    assert_eq!(client.socket_option(SocketOption::KeepAlive), 1);

    // out-of-domain values are ignored
    client.set_socket_option(SocketOption::SendBufferSize, -5);
    assert!(client.socket_option(SocketOption::SendBufferSize) > 0);
}
