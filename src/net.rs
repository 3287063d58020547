//! Raw stream sockets over the event queue.
//!
//! This is the transport the coroutine socket adapter wraps: bounded
//! full-duplex byte pipes between two endpoints, with a listener table for
//! connection establishment and callback-based notifications. Delivery and
//! notification always go through the simulator queue, so a caller never
//! re-enters its own callbacks synchronously.
//!
//! Backpressure is the free space of the peer's receive buffer: `send`
//! copies at most `tx_available()` bytes and the writer is notified with a
//! send-room callback once the reader drains.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use fnv::FnvHashMap;

use crate::error::SockErr;
use crate::sim::Simulator;

/// First port handed out to unbound connecting sockets.
const EPHEMERAL_PORT_BASE: u16 = 49_152;

/// A network address: host id plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Addr {
    pub host: u32,
    pub port: u16,
}

impl Addr {
    pub const NULL: Addr = Addr { host: 0, port: 0 };

    pub const fn new(host: u32, port: u16) -> Self {
        Addr { host, port }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    Fresh,
    Bound,
    Listening,
    Connecting,
    Connected,
    Closed,
}

#[derive(Default)]
struct Callbacks {
    accept: RefCell<Option<Box<dyn Fn(StreamSocket, Addr)>>>,
    connect_ok: RefCell<Option<Box<dyn Fn()>>>,
    connect_fail: RefCell<Option<Box<dyn Fn(SockErr)>>>,
    send_room: RefCell<Option<Box<dyn Fn(usize)>>>,
    recv_ready: RefCell<Option<Box<dyn Fn()>>>,
    close_normal: RefCell<Option<Box<dyn Fn()>>>,
    close_error: RefCell<Option<Box<dyn Fn(SockErr)>>>,
}

struct NetInner {
    sim: Simulator,
    listeners: RefCell<FnvHashMap<Addr, Weak<SockInner>>>,
    next_port: Cell<u16>,
}

/// Handle to the network fabric: the listener table plus socket factory.
#[derive(Clone)]
pub struct Network {
    inner: Rc<NetInner>,
}

impl Network {
    pub fn new(sim: &Simulator) -> Self {
        Network {
            inner: Rc::new(NetInner {
                sim: sim.clone(),
                listeners: RefCell::new(FnvHashMap::default()),
                next_port: Cell::new(EPHEMERAL_PORT_BASE),
            }),
        }
    }

    /// The scheduler this network delivers through.
    pub fn simulator(&self) -> Simulator {
        self.inner.sim.clone()
    }

    fn ephemeral_port(&self) -> u16 {
        let port = self.inner.next_port.get();
        self.inner.next_port.set(port.wrapping_add(1).max(EPHEMERAL_PORT_BASE));
        port
    }
}

struct SockInner {
    sim: Simulator,
    net: Weak<NetInner>,
    host: u32,
    local: Cell<Addr>,
    state: Cell<SockState>,
    errno: Cell<SockErr>,
    rx: RefCell<BytesMut>,
    rx_capacity: usize,
    peer: RefCell<Option<Weak<SockInner>>>,
    send_shutdown: Cell<bool>,
    recv_shutdown: Cell<bool>,
    peer_closed: Cell<bool>,
    callbacks: Callbacks,
}

impl SockInner {
    fn fresh(net: &Rc<NetInner>, host: u32, rx_capacity: usize) -> Rc<SockInner> {
        Rc::new(SockInner {
            sim: net.sim.clone(),
            net: Rc::downgrade(net),
            host,
            local: Cell::new(Addr::NULL),
            state: Cell::new(SockState::Fresh),
            errno: Cell::new(SockErr::NotError),
            rx: RefCell::new(BytesMut::new()),
            rx_capacity,
            peer: RefCell::new(None),
            send_shutdown: Cell::new(false),
            recv_shutdown: Cell::new(false),
            peer_closed: Cell::new(false),
            callbacks: Callbacks::default(),
        })
    }

    fn peer_upgrade(&self) -> Option<Rc<SockInner>> {
        self.peer.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn fail(&self, errno: SockErr) -> SockErr {
        self.errno.set(errno);
        errno
    }
}

/// A raw stream socket endpoint. Cheap to clone; clones share the endpoint.
#[derive(Clone)]
pub struct StreamSocket {
    inner: Rc<SockInner>,
}

impl StreamSocket {
    /// Create an unconnected socket on `host`.
    pub fn new(net: &Network, host: u32, rx_capacity: usize) -> Self {
        StreamSocket {
            inner: SockInner::fresh(&net.inner, host, rx_capacity),
        }
    }

    /// Last error observed on this socket.
    #[inline]
    pub fn errno(&self) -> SockErr {
        self.inner.errno.get()
    }

    /// The locally bound (or assigned) address.
    #[inline]
    pub fn local_addr(&self) -> Addr {
        self.inner.local.get()
    }

    /// True once the peer endpoint has closed.
    #[inline]
    pub fn peer_closed(&self) -> bool {
        self.inner.peer_closed.get()
    }

    /// Bind to a local address.
    pub fn bind(&self, addr: Addr) -> SockErr {
        if self.inner.state.get() != SockState::Fresh {
            return self.inner.fail(SockErr::Inval);
        }
        if addr.host != self.inner.host {
            return self.inner.fail(SockErr::AddrNotAvail);
        }
        self.inner.local.set(addr);
        self.inner.state.set(SockState::Bound);
        SockErr::NotError
    }

    /// Start listening on the bound address.
    pub fn listen(&self) -> SockErr {
        if self.inner.state.get() != SockState::Bound {
            return self.inner.fail(SockErr::Inval);
        }
        let Some(net) = self.inner.net.upgrade() else {
            return self.inner.fail(SockErr::Badf);
        };
        let addr = self.inner.local.get();
        let mut listeners = net.listeners.borrow_mut();
        if let Some(existing) = listeners.get(&addr) {
            if existing.upgrade().is_some() {
                return self.inner.fail(SockErr::AddrInUse);
            }
        }
        listeners.insert(addr, Rc::downgrade(&self.inner));
        self.inner.state.set(SockState::Listening);
        SockErr::NotError
    }

    /// Start connecting to `addr`. Completion is reported through the
    /// connect callbacks.
    pub fn connect(&self, addr: Addr) -> SockErr {
        match self.inner.state.get() {
            SockState::Fresh | SockState::Bound => {}
            SockState::Listening => return self.inner.fail(SockErr::OpNotSupp),
            SockState::Connecting | SockState::Connected => return self.inner.fail(SockErr::IsConn),
            SockState::Closed => return self.inner.fail(SockErr::Badf),
        }
        let Some(net) = self.inner.net.upgrade() else {
            return self.inner.fail(SockErr::Badf);
        };
        if self.inner.local.get() == Addr::NULL {
            let port = Network { inner: net.clone() }.ephemeral_port();
            self.inner.local.set(Addr::new(self.inner.host, port));
        }
        self.inner.state.set(SockState::Connecting);

        let client = Rc::downgrade(&self.inner);
        let net_weak = self.inner.net.clone();
        self.inner.sim.schedule_now(move || {
            let Some(client) = client.upgrade() else {
                return;
            };
            if client.state.get() != SockState::Connecting {
                return;
            }
            let net = net_weak.upgrade();
            let listener = net
                .as_ref()
                .and_then(|net| net.listeners.borrow().get(&addr).cloned())
                .and_then(|weak| weak.upgrade())
                .filter(|listener| listener.state.get() == SockState::Listening);
            match listener {
                Some(listener) => {
                    let net = net.expect("listener implies a live network");
                    let server = SockInner::fresh(&net, listener.host, listener.rx_capacity);
                    server.local.set(listener.local.get());
                    server.state.set(SockState::Connected);
                    *server.peer.borrow_mut() = Some(Rc::downgrade(&client));
                    *client.peer.borrow_mut() = Some(Rc::downgrade(&server));
                    client.state.set(SockState::Connected);
                    if let Some(accept) = &*listener.callbacks.accept.borrow() {
                        accept(StreamSocket { inner: server }, client.local.get());
                    }
                    if let Some(connected) = &*client.callbacks.connect_ok.borrow() {
                        connected();
                    }
                }
                None => {
                    client.state.set(SockState::Closed);
                    client.errno.set(SockErr::NoRouteToHost);
                    if let Some(failed) = &*client.callbacks.connect_fail.borrow() {
                        failed(SockErr::NoRouteToHost);
                    }
                }
            }
        });
        SockErr::NotError
    }

    /// Copy up to `tx_available()` bytes into the peer's receive buffer.
    pub fn send(&self, data: &[u8]) -> Result<usize, SockErr> {
        if self.inner.state.get() != SockState::Connected {
            return Err(self.inner.fail(SockErr::NotConn));
        }
        if self.inner.send_shutdown.get() {
            return Err(self.inner.fail(SockErr::Shutdown));
        }
        let Some(peer) = self.inner.peer_upgrade() else {
            return Err(self.inner.fail(SockErr::Shutdown));
        };
        if peer.state.get() == SockState::Closed || peer.recv_shutdown.get() {
            return Err(self.inner.fail(SockErr::Shutdown));
        }
        let mut rx = peer.rx.borrow_mut();
        let space = peer.rx_capacity.saturating_sub(rx.len());
        let n = space.min(data.len());
        rx.extend_from_slice(&data[..n]);
        drop(rx);
        if n > 0 {
            let weak = Rc::downgrade(&peer);
            self.inner.sim.schedule_now(move || {
                if let Some(peer) = weak.upgrade() {
                    if let Some(ready) = &*peer.callbacks.recv_ready.borrow() {
                        ready();
                    }
                }
            });
        }
        Ok(n)
    }

    /// Take up to `max` buffered bytes (all available when `max` is 0).
    pub fn recv(&self, max: usize) -> Bytes {
        let mut rx = self.inner.rx.borrow_mut();
        let n = if max == 0 { rx.len() } else { max.min(rx.len()) };
        let data = rx.split_to(n).freeze();
        drop(rx);
        if n > 0 {
            if let Some(peer) = self.inner.peer_upgrade() {
                let room = self.inner.rx_capacity.saturating_sub(self.inner.rx.borrow().len());
                let weak = Rc::downgrade(&peer);
                self.inner.sim.schedule_now(move || {
                    if let Some(peer) = weak.upgrade() {
                        if let Some(send_room) = &*peer.callbacks.send_room.borrow() {
                            send_room(room);
                        }
                    }
                });
            }
        }
        data
    }

    /// Free space in the peer's receive buffer.
    pub fn tx_available(&self) -> usize {
        if self.inner.state.get() != SockState::Connected || self.inner.send_shutdown.get() {
            return 0;
        }
        match self.inner.peer_upgrade() {
            Some(peer) if peer.state.get() == SockState::Connected => {
                peer.rx_capacity.saturating_sub(peer.rx.borrow().len())
            }
            _ => 0,
        }
    }

    /// Bytes buffered for reading.
    pub fn rx_available(&self) -> usize {
        self.inner.rx.borrow().len()
    }

    /// Stop the send half.
    pub fn shutdown_send(&self) -> SockErr {
        self.inner.send_shutdown.set(true);
        SockErr::NotError
    }

    /// Stop the receive half.
    pub fn shutdown_recv(&self) -> SockErr {
        self.inner.recv_shutdown.set(true);
        SockErr::NotError
    }

    /// Close the socket. Idempotent. The peer observes the close through
    /// its close callback; this end's callback is not invoked.
    pub fn close(&self) -> SockErr {
        match self.inner.state.get() {
            SockState::Closed => SockErr::NotError,
            SockState::Listening => {
                if let Some(net) = self.inner.net.upgrade() {
                    net.listeners.borrow_mut().remove(&self.inner.local.get());
                }
                self.inner.state.set(SockState::Closed);
                SockErr::NotError
            }
            _ => {
                self.inner.state.set(SockState::Closed);
                if let Some(peer) = self.inner.peer_upgrade() {
                    let weak = Rc::downgrade(&peer);
                    self.inner.sim.schedule_now(move || {
                        let Some(peer) = weak.upgrade() else {
                            return;
                        };
                        if peer.state.get() == SockState::Closed || peer.peer_closed.get() {
                            return;
                        }
                        peer.peer_closed.set(true);
                        let cb = peer.callbacks.close_normal.borrow();
                        if let Some(closed) = &*cb {
                            closed();
                        }
                    });
                }
                SockErr::NotError
            }
        }
    }

    // Callback registration. Each setter replaces the previous callback.

    pub fn set_accept_callback<F: Fn(StreamSocket, Addr) + 'static>(&self, f: F) {
        *self.inner.callbacks.accept.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_connect_callbacks<S, E>(&self, ok: S, fail: E)
    where
        S: Fn() + 'static,
        E: Fn(SockErr) + 'static,
    {
        *self.inner.callbacks.connect_ok.borrow_mut() = Some(Box::new(ok));
        *self.inner.callbacks.connect_fail.borrow_mut() = Some(Box::new(fail));
    }

    pub fn set_send_callback<F: Fn(usize) + 'static>(&self, f: F) {
        *self.inner.callbacks.send_room.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_recv_callback<F: Fn() + 'static>(&self, f: F) {
        *self.inner.callbacks.recv_ready.borrow_mut() = Some(Box::new(f));
    }

    pub fn set_close_callbacks<N, E>(&self, normal: N, error: E)
    where
        N: Fn() + 'static,
        E: Fn(SockErr) + 'static,
    {
        *self.inner.callbacks.close_normal.borrow_mut() = Some(Box::new(normal));
        *self.inner.callbacks.close_error.borrow_mut() = Some(Box::new(error));
    }

    /// Drop all registered callbacks.
    pub fn clear_callbacks(&self) {
        *self.inner.callbacks.accept.borrow_mut() = None;
        *self.inner.callbacks.connect_ok.borrow_mut() = None;
        *self.inner.callbacks.connect_fail.borrow_mut() = None;
        *self.inner.callbacks.send_room.borrow_mut() = None;
        *self.inner.callbacks.recv_ready.borrow_mut() = None;
        *self.inner.callbacks.close_normal.borrow_mut() = None;
        *self.inner.callbacks.close_error.borrow_mut() = None;
    }
}
