//! In-memory TCP
//!
//! One [`SimWire`] connects every simulated stack in a test. Sockets are
//! full-duplex pairs; writes become `Data` events in the peer stack's
//! inbox and complete with `WriteDone` in the writer's.
//!
//! Events are stamped with the shared clock and delivered only on a
//! strictly later tick. Delivery latency is therefore one clock step in
//! every direction, independent of the order nodes are stepped in — which
//! keeps timing-sensitive scenarios (time sync) symmetric. Within one
//! stack, events still arrive in queue order, so a frame written before a
//! close always precedes the disconnect.
//!
//! The wire also polices the socket lifecycle: freeing a socket twice, or
//! freeing one that was never closed, panics the test.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::rc::Rc;

use bytes::Bytes;
use canopy_core::{
    ConnectToken, ManualClock, MonotonicClock, SocketHandle, TcpEvent, TcpStack, TransportError,
};

struct StackState {
    events: VecDeque<(u64, TcpEvent)>,
    ips: Vec<Ipv4Addr>,
    listening: HashSet<u16>,
    alive: bool,
}

struct SockState {
    owner: u64,
    peer: Option<u64>,
    open: bool,
}

struct WireInner {
    clock: ManualClock,
    next_stack: u64,
    next_socket: u64,
    next_token: u64,
    stacks: HashMap<u64, StackState>,
    sockets: HashMap<u64, SockState>,
    freed: HashSet<u64>,
    free_log: Vec<(SocketHandle, u64)>,
    /// (ip, port) -> remaining connect attempts to refuse
    refuse: HashMap<(Ipv4Addr, u16), u32>,
}

impl WireInner {
    fn push_event(&mut self, stack_id: u64, event: TcpEvent) {
        let stamp = self.clock.now_us();
        if let Some(stack) = self.stacks.get_mut(&stack_id) {
            if stack.alive {
                stack.events.push_back((stamp, event));
            }
        }
    }
}

/// Shared wire handle
#[derive(Clone)]
pub struct SimWire {
    inner: Rc<RefCell<WireInner>>,
}

impl SimWire {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            inner: Rc::new(RefCell::new(WireInner {
                clock,
                next_stack: 0,
                next_socket: 0,
                next_token: 0,
                stacks: HashMap::new(),
                sockets: HashMap::new(),
                freed: HashSet::new(),
                free_log: Vec::new(),
                refuse: HashMap::new(),
            })),
        }
    }

    fn register_stack(&self) -> u64 {
        let mut inner = self.inner.borrow_mut();
        inner.next_stack += 1;
        let id = inner.next_stack;
        inner.stacks.insert(
            id,
            StackState {
                events: VecDeque::new(),
                ips: Vec::new(),
                listening: HashSet::new(),
                alive: true,
            },
        );
        id
    }

    /// Refuse the next `count` connects to an endpoint
    pub fn refuse_next(&self, ip: Ipv4Addr, port: u16, count: u32) {
        self.inner.borrow_mut().refuse.insert((ip, port), count);
    }

    /// Kill a stack: every peer of its open sockets sees an error
    pub fn kill(&self, stack_id: u64) {
        let mut inner = self.inner.borrow_mut();
        if let Some(stack) = inner.stacks.get_mut(&stack_id) {
            stack.alive = false;
            stack.listening.clear();
            stack.events.clear();
        }
        let owned: Vec<u64> = inner
            .sockets
            .iter()
            .filter(|(_, s)| s.owner == stack_id && s.open)
            .map(|(id, _)| *id)
            .collect();
        for sock in owned {
            close_socket(&mut inner, sock, true);
        }
    }

    /// `(socket, freed_at_us)` log, for release-spacing assertions
    pub fn free_log(&self) -> Vec<(SocketHandle, u64)> {
        self.inner.borrow().free_log.clone()
    }

    /// Number of sockets that are allocated and not yet freed
    pub fn live_sockets(&self) -> usize {
        self.inner.borrow().sockets.len()
    }
}

fn close_socket(inner: &mut WireInner, sock: u64, as_error: bool) {
    let peer = match inner.sockets.get_mut(&sock) {
        Some(state) if state.open => {
            state.open = false;
            state.peer
        }
        _ => return,
    };
    if let Some(peer_sock) = peer {
        let peer_owner = inner.sockets.get(&peer_sock).map(|s| s.owner);
        if let Some(state) = inner.sockets.get_mut(&peer_sock) {
            state.peer = None;
        }
        if let Some(owner) = peer_owner {
            let event = if as_error {
                TcpEvent::Error {
                    socket: SocketHandle(peer_sock),
                    error: "connection reset".into(),
                }
            } else {
                TcpEvent::Disconnected {
                    socket: SocketHandle(peer_sock),
                }
            };
            inner.push_event(owner, event);
        }
    }
}

/// One node's view of the wire
#[derive(Clone)]
pub struct SimTcp {
    wire: SimWire,
    id: u64,
}

impl SimTcp {
    pub fn new(wire: SimWire) -> Self {
        let id = wire.register_stack();
        Self { wire, id }
    }

    pub fn stack_id(&self) -> u64 {
        self.id
    }

    /// Claim an IP for this stack (the node's AP address)
    pub fn add_ip(&self, ip: Ipv4Addr) {
        let mut inner = self.wire.inner.borrow_mut();
        if let Some(stack) = inner.stacks.get_mut(&self.id) {
            stack.ips.push(ip);
        }
    }
}

impl TcpStack for SimTcp {
    fn listen(&mut self, port: u16) -> Result<(), TransportError> {
        let mut inner = self.wire.inner.borrow_mut();
        match inner.stacks.get_mut(&self.id) {
            Some(stack) => {
                stack.listening.insert(port);
                Ok(())
            }
            None => Err(TransportError::ListenFailed {
                port,
                reason: "stack gone".into(),
            }),
        }
    }

    fn connect(&mut self, ip: Ipv4Addr, port: u16) -> Result<ConnectToken, TransportError> {
        let mut inner = self.wire.inner.borrow_mut();
        inner.next_token += 1;
        let token = ConnectToken(inner.next_token);

        let mut refused = false;
        if let Some(remaining) = inner.refuse.get_mut(&(ip, port)) {
            if *remaining > 0 {
                *remaining -= 1;
                refused = true;
            }
        }
        if refused {
            inner.push_event(
                self.id,
                TcpEvent::ConnectFailed {
                    token,
                    error: "connection refused".into(),
                },
            );
            return Ok(token);
        }

        let server = inner
            .stacks
            .iter()
            .find(|(_, s)| s.alive && s.listening.contains(&port) && s.ips.contains(&ip))
            .map(|(id, _)| *id);

        match server {
            Some(server_id) => {
                inner.next_socket += 1;
                let client_sock = inner.next_socket;
                inner.next_socket += 1;
                let server_sock = inner.next_socket;
                inner.sockets.insert(
                    client_sock,
                    SockState {
                        owner: self.id,
                        peer: Some(server_sock),
                        open: true,
                    },
                );
                inner.sockets.insert(
                    server_sock,
                    SockState {
                        owner: server_id,
                        peer: Some(client_sock),
                        open: true,
                    },
                );
                let remote_ip = inner
                    .stacks
                    .get(&self.id)
                    .and_then(|s| s.ips.first().copied())
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                inner.push_event(
                    server_id,
                    TcpEvent::Accepted {
                        socket: SocketHandle(server_sock),
                        remote_ip,
                    },
                );
                inner.push_event(
                    self.id,
                    TcpEvent::Connected {
                        token,
                        socket: SocketHandle(client_sock),
                    },
                );
            }
            None => {
                inner.push_event(
                    self.id,
                    TcpEvent::ConnectFailed {
                        token,
                        error: "no listener".into(),
                    },
                );
            }
        }
        Ok(token)
    }

    fn write(&mut self, socket: SocketHandle, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.wire.inner.borrow_mut();
        let (peer, open) = match inner.sockets.get(&socket.0) {
            Some(state) if state.owner == self.id => (state.peer, state.open),
            _ => return Err(TransportError::UnknownSocket),
        };
        if !open {
            return Err(TransportError::ConnectionClosed);
        }
        match peer {
            Some(peer_sock) => {
                let peer_owner = inner.sockets.get(&peer_sock).map(|s| s.owner);
                let payload = Bytes::copy_from_slice(data);
                if let Some(owner) = peer_owner {
                    inner.push_event(
                        owner,
                        TcpEvent::Data {
                            socket: SocketHandle(peer_sock),
                            data: payload,
                        },
                    );
                }
                inner.push_event(self.id, TcpEvent::WriteDone { socket });
                Ok(())
            }
            None => {
                inner.push_event(
                    self.id,
                    TcpEvent::Error {
                        socket,
                        error: "broken pipe".into(),
                    },
                );
                Ok(())
            }
        }
    }

    fn close(&mut self, socket: SocketHandle, _graceful: bool) {
        let mut inner = self.wire.inner.borrow_mut();
        close_socket(&mut inner, socket.0, false);
    }

    fn abort(&mut self, socket: SocketHandle) {
        let mut inner = self.wire.inner.borrow_mut();
        close_socket(&mut inner, socket.0, true);
    }

    fn free(&mut self, socket: SocketHandle) {
        let mut inner = self.wire.inner.borrow_mut();
        let now = inner.clock.now_us();
        assert!(inner.freed.insert(socket.0), "double free of {socket}");
        match inner.sockets.remove(&socket.0) {
            Some(state) => assert!(!state.open, "{socket} freed while still open"),
            None => panic!("free of unknown {socket}"),
        }
        inner.free_log.push((socket, now));
    }

    fn poll_events(&mut self) -> Vec<TcpEvent> {
        let mut inner = self.wire.inner.borrow_mut();
        let now = inner.clock.now_us();
        match inner.stacks.get_mut(&self.id) {
            Some(stack) => {
                let due = stack
                    .events
                    .iter()
                    .take_while(|(stamp, _)| *stamp < now)
                    .count();
                stack.events.drain(..due).map(|(_, e)| e).collect()
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pair() -> (SimWire, ManualClock, SimTcp, SimTcp) {
        let clock = ManualClock::new();
        let wire = SimWire::new(clock.clone());
        let a = SimTcp::new(wire.clone());
        let b = SimTcp::new(wire.clone());
        (wire, clock, a, b)
    }

    fn step(clock: &ManualClock) {
        clock.advance(Duration::from_millis(100));
    }

    fn established(
        clock: &ManualClock,
        a: &mut SimTcp,
        b: &mut SimTcp,
    ) -> (SocketHandle, SocketHandle) {
        b.add_ip(Ipv4Addr::new(10, 0, 2, 1));
        b.listen(5555).unwrap();
        a.connect(Ipv4Addr::new(10, 0, 2, 1), 5555).unwrap();
        step(clock);
        let a_sock = match &a.poll_events()[0] {
            TcpEvent::Connected { socket, .. } => *socket,
            other => panic!("unexpected {other:?}"),
        };
        let b_sock = match &b.poll_events()[0] {
            TcpEvent::Accepted { socket, .. } => *socket,
            other => panic!("unexpected {other:?}"),
        };
        (a_sock, b_sock)
    }

    #[test]
    fn test_connect_accept_write() {
        let (_wire, clock, mut a, mut b) = pair();
        let (a_sock, b_sock) = established(&clock, &mut a, &mut b);

        a.write(a_sock, b"hello\n").unwrap();
        // Nothing is visible on the same tick.
        assert!(a.poll_events().is_empty());
        assert!(b.poll_events().is_empty());

        step(&clock);
        assert!(matches!(a.poll_events()[0], TcpEvent::WriteDone { .. }));
        match &b.poll_events()[0] {
            TcpEvent::Data { socket, data } => {
                assert_eq!(*socket, b_sock);
                assert_eq!(&data[..], b"hello\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_connect_without_listener_fails() {
        let (_wire, clock, mut a, _b) = pair();
        a.connect(Ipv4Addr::new(10, 9, 9, 1), 5555).unwrap();
        step(&clock);
        assert!(matches!(a.poll_events()[0], TcpEvent::ConnectFailed { .. }));
    }

    #[test]
    fn test_refuse_next_injects_failures() {
        let (wire, clock, mut a, mut b) = pair();
        let ip = Ipv4Addr::new(10, 0, 2, 1);
        b.add_ip(ip);
        b.listen(5555).unwrap();
        wire.refuse_next(ip, 5555, 2);

        a.connect(ip, 5555).unwrap();
        a.connect(ip, 5555).unwrap();
        a.connect(ip, 5555).unwrap();
        step(&clock);
        let events = a.poll_events();
        assert!(matches!(events[0], TcpEvent::ConnectFailed { .. }));
        assert!(matches!(events[1], TcpEvent::ConnectFailed { .. }));
        assert!(matches!(events[2], TcpEvent::Connected { .. }));
    }

    #[test]
    fn test_close_notifies_peer_after_pending_data() {
        let (_wire, clock, mut a, mut b) = pair();
        let (a_sock, _b_sock) = established(&clock, &mut a, &mut b);

        a.write(a_sock, b"last\n").unwrap();
        a.close(a_sock, true);
        step(&clock);

        let events = b.poll_events();
        assert!(matches!(events[0], TcpEvent::Data { .. }));
        assert!(matches!(events[1], TcpEvent::Disconnected { .. }));
    }

    #[test]
    fn test_free_lifecycle_enforced() {
        let (wire, clock, mut a, mut b) = pair();
        let (a_sock, _) = established(&clock, &mut a, &mut b);
        clock.advance(Duration::from_millis(5));
        a.close(a_sock, true);
        a.free(a_sock);
        assert_eq!(wire.free_log(), vec![(a_sock, 105_000)]);
    }

    #[test]
    #[should_panic(expected = "freed while still open")]
    fn test_free_before_close_panics() {
        let (_wire, clock, mut a, mut b) = pair();
        let (a_sock, _) = established(&clock, &mut a, &mut b);
        a.free(a_sock);
    }

    #[test]
    fn test_kill_errors_peers() {
        let (wire, clock, mut a, mut b) = pair();
        let (_a_sock, _b_sock) = established(&clock, &mut a, &mut b);

        wire.kill(b.stack_id());
        step(&clock);
        let events = a.poll_events();
        assert!(matches!(events[0], TcpEvent::Error { .. }));
    }
}
