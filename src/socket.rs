//! The coroutine-friendly socket.
//!
//! [`SimSocket`] wraps a raw [`StreamSocket`] behind operations: accept,
//! connect, send and receive each return an [`Operation`] that pending
//! callers await. Per-kind FIFO queues order concurrent operations; the
//! head operation drains as much as currently fits, then yields until the
//! next transport callback resumes it.
//!
//! A socket without an underlying stream is a loopback: sends deposit into
//! an in-memory byte cache (bounded by `cache_limit`) and wake pending
//! receives on the same simulated tick, which is how a rank talks to
//! itself without touching the network stack.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use bytes::{Buf, Bytes, BytesMut};
use tracing::debug;

use crate::config::DEFAULT_CACHE_LIMIT;
use crate::error::SockErr;
use crate::net::{Addr, Network, StreamSocket};
use crate::op::Operation;
use crate::packet::Packet;
use crate::sim::Simulator;

/// Result of an accept: the connected socket, the peer address, and errno.
pub type AcceptResult = (SimSocket, Addr, SockErr);

/// Result of a send: bytes fully transferred, and errno.
pub type SendResult = (usize, SockErr);

/// Result of a receive: the accumulated bytes, and errno.
pub type ReceiveResult = (Packet, SockErr);

struct SocketInner {
    sim: Simulator,
    raw: RefCell<Option<StreamSocket>>,
    cache_limit: usize,
    blocked: Cell<bool>,
    connected: Cell<bool>,
    listening: Cell<bool>,
    closed: Cell<bool>,
    pending_accept: RefCell<VecDeque<Operation<AcceptResult>>>,
    pending_connect: RefCell<VecDeque<Operation<SockErr>>>,
    pending_send: RefCell<VecDeque<Operation<SendResult>>>,
    pending_receive: RefCell<VecDeque<Operation<ReceiveResult>>>,
    cache: RefCell<BytesMut>,
    tx_bytes: Cell<usize>,
    rx_bytes: Cell<usize>,
}

impl SocketInner {
    fn new(sim: &Simulator, raw: Option<StreamSocket>, cache_limit: usize) -> Rc<SocketInner> {
        let inner = Rc::new(SocketInner {
            sim: sim.clone(),
            raw: RefCell::new(raw),
            cache_limit,
            blocked: Cell::new(false),
            connected: Cell::new(false),
            listening: Cell::new(false),
            closed: Cell::new(false),
            pending_accept: RefCell::new(VecDeque::new()),
            pending_connect: RefCell::new(VecDeque::new()),
            pending_send: RefCell::new(VecDeque::new()),
            pending_receive: RefCell::new(VecDeque::new()),
            cache: RefCell::new(BytesMut::new()),
            tx_bytes: Cell::new(0),
            rx_bytes: Cell::new(0),
        });
        SocketInner::register_callbacks(&inner);
        inner
    }

    /// Install transport callbacks. They capture a weak reference, so a
    /// dropped adapter leaves no live capture behind.
    fn register_callbacks(inner: &Rc<SocketInner>) {
        let raw_ref = inner.raw.borrow();
        let Some(raw) = raw_ref.as_ref() else {
            return;
        };
        let weak = Rc::downgrade(inner);
        raw.set_accept_callback({
            let weak = weak.clone();
            move |stream, from| {
                if let Some(inner) = weak.upgrade() {
                    SocketInner::on_accept(&inner, stream, from);
                }
            }
        });
        raw.set_connect_callbacks(
            {
                let weak = weak.clone();
                move || {
                    if let Some(inner) = weak.upgrade() {
                        SocketInner::on_connect(&inner, SockErr::NotError);
                    }
                }
            },
            {
                let weak = weak.clone();
                move |errno| {
                    if let Some(inner) = weak.upgrade() {
                        SocketInner::on_connect(&inner, errno);
                    }
                }
            },
        );
        raw.set_send_callback({
            let weak = weak.clone();
            move |_room| {
                if let Some(inner) = weak.upgrade() {
                    SocketInner::on_send(&inner);
                }
            }
        });
        raw.set_recv_callback({
            let weak = weak.clone();
            move || {
                if let Some(inner) = weak.upgrade() {
                    SocketInner::on_receive(&inner);
                }
            }
        });
        raw.set_close_callbacks(
            {
                let weak = weak.clone();
                move || {
                    if let Some(inner) = weak.upgrade() {
                        SocketInner::on_close(&inner, SockErr::NotError);
                    }
                }
            },
            {
                move |errno| {
                    if let Some(inner) = weak.upgrade() {
                        SocketInner::on_close(&inner, errno);
                    }
                }
            },
        );
    }

    fn on_accept(inner: &Rc<SocketInner>, stream: StreamSocket, from: Addr) {
        let op = inner
            .pending_accept
            .borrow()
            .front()
            .cloned()
            .unwrap_or_else(|| panic!("inbound connection received but no pending accept"));
        let errno = inner
            .raw
            .borrow()
            .as_ref()
            .map_or(SockErr::Badf, |raw| raw.errno());
        let socket = SimSocket::from_stream(&inner.sim, stream, inner.cache_limit);
        op.terminate((socket, from, errno));
    }

    fn on_connect(inner: &Rc<SocketInner>, errno: SockErr) {
        let op = inner
            .pending_connect
            .borrow()
            .front()
            .cloned()
            .unwrap_or_else(|| panic!("connection established but no pending connect"));
        op.terminate(errno);
    }

    fn on_send(inner: &Rc<SocketInner>) {
        // Snapshot: completed operations unlink themselves from the queue.
        let ops: Vec<_> = inner.pending_send.borrow().iter().cloned().collect();
        for op in ops {
            if !op.resume() {
                break;
            }
        }
    }

    fn on_receive(inner: &Rc<SocketInner>) {
        let ops: Vec<_> = inner.pending_receive.borrow().iter().cloned().collect();
        for op in ops {
            if !op.resume() {
                break;
            }
        }
    }

    /// Terminal: mark closed and fan the shutdown out to every pending
    /// operation, FIFO per queue.
    fn on_close(inner: &Rc<SocketInner>, errno: SockErr) {
        if inner.closed.get() {
            return;
        }
        inner.closed.set(true);
        let errno = if errno.is_error() {
            errno
        } else {
            SockErr::Shutdown
        };
        debug!(target: "simmpi::socket", %errno, "socket closed, terminating pending operations");

        let accepts: Vec<_> = inner.pending_accept.borrow().iter().cloned().collect();
        for op in accepts {
            op.terminate((
                SimSocket::loopback(&inner.sim, inner.cache_limit),
                Addr::NULL,
                errno,
            ));
        }
        let connects: Vec<_> = inner.pending_connect.borrow().iter().cloned().collect();
        for op in connects {
            op.terminate(errno);
        }
        let sends: Vec<_> = inner.pending_send.borrow().iter().cloned().collect();
        for op in sends {
            op.terminate((0, errno));
        }
        let receives: Vec<_> = inner.pending_receive.borrow().iter().cloned().collect();
        for op in receives {
            op.terminate((Bytes::new(), errno));
        }
    }
}

/// Cooperative async socket. Cheap to clone; clones share the endpoint.
#[derive(Clone)]
pub struct SimSocket {
    inner: Rc<SocketInner>,
}

impl SimSocket {
    /// A loopback socket: no underlying stream, an in-memory byte cache.
    pub fn loopback(sim: &Simulator, cache_limit: usize) -> Self {
        SimSocket {
            inner: SocketInner::new(sim, None, cache_limit),
        }
    }

    /// A loopback socket with the default cache limit.
    pub fn loopback_default(sim: &Simulator) -> Self {
        Self::loopback(sim, DEFAULT_CACHE_LIMIT)
    }

    /// A socket over a fresh stream endpoint on `host`.
    pub fn open(net: &Network, host: u32, cache_limit: usize) -> Self {
        let raw = StreamSocket::new(net, host, cache_limit);
        SimSocket {
            inner: SocketInner::new(&net.simulator(), Some(raw), cache_limit),
        }
    }

    /// Wrap an already-connected stream endpoint (an accepted connection).
    pub fn from_stream(sim: &Simulator, stream: StreamSocket, cache_limit: usize) -> Self {
        let socket = SimSocket {
            inner: SocketInner::new(sim, Some(stream), cache_limit),
        };
        socket.inner.connected.set(true);
        socket
    }

    /// Bind the underlying stream to a local address.
    pub fn bind(&self, addr: Addr) -> SockErr {
        match &*self.inner.raw.borrow() {
            Some(raw) => raw.bind(addr),
            None => SockErr::Badf,
        }
    }

    /// Await one inbound connection. The first call transitions the socket
    /// to listening; concurrent accepts are satisfied in FIFO order.
    pub fn accept(&self) -> Operation<AcceptResult> {
        let inner = &self.inner;
        let raw = inner.raw.borrow().clone();
        let Some(raw) = raw.filter(|_| !inner.connected.get() && !inner.closed.get()) else {
            return Operation::completed((
                SimSocket::loopback(&inner.sim, inner.cache_limit),
                Addr::NULL,
                SockErr::Badf,
            ));
        };
        let op = Operation::pending();
        inner.pending_accept.borrow_mut().push_back(op.clone());
        if !inner.listening.get() {
            let errno = raw.listen();
            if errno.is_error() {
                inner.pending_accept.borrow_mut().pop_back();
                op.terminate((
                    SimSocket::loopback(&inner.sim, inner.cache_limit),
                    Addr::NULL,
                    errno,
                ));
                return op;
            }
        }
        inner.listening.set(true);
        let weak = Rc::downgrade(inner);
        op.on_complete(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                inner.pending_accept.borrow_mut().pop_front();
            }
        });
        op
    }

    /// Connect to `addr`. Single-use: a connected socket cannot listen.
    pub fn connect(&self, addr: Addr) -> Operation<SockErr> {
        let inner = &self.inner;
        let raw = inner.raw.borrow().clone();
        let Some(raw) = raw.filter(|_| !inner.listening.get() && !inner.closed.get()) else {
            return Operation::completed(SockErr::Badf);
        };
        let op = Operation::pending();
        inner.pending_connect.borrow_mut().push_back(op.clone());
        let errno = raw.connect(addr);
        if errno.is_error() {
            inner.pending_connect.borrow_mut().pop_back();
            op.terminate(errno);
            return op;
        }
        inner.connected.set(true);
        let weak = Rc::downgrade(inner);
        op.on_complete(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                inner.pending_connect.borrow_mut().pop_front();
            }
        });
        op
    }

    /// Send a packet. Resolves once every byte is transferred, or with the
    /// terminal errno. Concurrent sends drain in FIFO order.
    pub fn send(&self, packet: Packet) -> Operation<SendResult> {
        let inner = &self.inner;
        if inner.closed.get() {
            return Operation::completed((0, SockErr::Badf));
        }
        let total = packet.len();
        let remaining = Rc::new(RefCell::new(packet));
        let weak = Rc::downgrade(inner);

        let op = if inner.raw.borrow().is_none() {
            let step_weak = weak.clone();
            let step_rem = remaining.clone();
            let done_rem = remaining.clone();
            Operation::poll_with(
                move || loopback_send_step(&step_weak, &step_rem),
                move || (total - done_rem.borrow().len(), SockErr::NotError),
            )
        } else {
            let step_weak = weak.clone();
            let step_rem = remaining.clone();
            let done_weak = weak.clone();
            let done_rem = remaining.clone();
            Operation::poll_with(
                move || raw_send_step(&step_weak, &step_rem),
                move || (total - done_rem.borrow().len(), final_errno(&done_weak)),
            )
        };
        if op.done() {
            return op;
        }
        inner.pending_send.borrow_mut().push_back(op.clone());
        op.on_complete(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                inner.pending_send.borrow_mut().pop_front();
            }
        });
        op
    }

    /// Receive bytes. With `size == 0`, resolves with whatever is available
    /// at the next arrival; with `size > 0`, accumulates exactly `size`
    /// bytes (or the terminal errno). FIFO across concurrent receives.
    pub fn receive(&self, size: usize) -> Operation<ReceiveResult> {
        let inner = &self.inner;
        if inner.closed.get() {
            return Operation::completed((Bytes::new(), SockErr::Badf));
        }
        let data = Rc::new(RefCell::new(BytesMut::new()));
        let weak = Rc::downgrade(inner);

        let op = if inner.raw.borrow().is_none() {
            let step_weak = weak.clone();
            let step_data = data.clone();
            let done_data = data.clone();
            Operation::poll_with(
                move || loopback_receive_step(&step_weak, &step_data, size),
                move || (done_data.borrow_mut().split().freeze(), SockErr::NotError),
            )
        } else {
            let step_weak = weak.clone();
            let step_data = data.clone();
            let done_weak = weak.clone();
            let done_data = data.clone();
            Operation::poll_with(
                move || raw_receive_step(&step_weak, &step_data, size),
                move || (done_data.borrow_mut().split().freeze(), final_errno(&done_weak)),
            )
        };
        if op.done() {
            return op;
        }
        inner.pending_receive.borrow_mut().push_back(op.clone());
        op.on_complete(move |_, _| {
            if let Some(inner) = weak.upgrade() {
                inner.pending_receive.borrow_mut().pop_front();
            }
        });
        op
    }

    /// Close the socket. Idempotent and terminal; on success the shutdown
    /// is fanned out to every pending operation.
    pub fn close(&self) -> SockErr {
        let inner = &self.inner;
        if !(inner.connected.get() || inner.listening.get()) || inner.closed.get() {
            return SockErr::NotError;
        }
        let raw = inner.raw.borrow().clone();
        let Some(raw) = raw else {
            return SockErr::NotError;
        };
        let errno = raw.close();
        if errno.is_error() {
            return errno;
        }
        SocketInner::on_close(inner, SockErr::NotError);
        SockErr::NotError
    }

    /// Shut down the send half of the underlying stream.
    pub fn close_send(&self) -> SockErr {
        let inner = &self.inner;
        if inner.closed.get() {
            return SockErr::NotError;
        }
        match &*inner.raw.borrow() {
            Some(raw) => raw.shutdown_send(),
            None => SockErr::NotError,
        }
    }

    /// Shut down the receive half of the underlying stream.
    pub fn close_receive(&self) -> SockErr {
        let inner = &self.inner;
        if inner.closed.get() {
            return SockErr::NotError;
        }
        match &*inner.raw.borrow() {
            Some(raw) => raw.shutdown_recv(),
            None => SockErr::NotError,
        }
    }

    /// Cooperative pause: sends and receives stop draining until unblocked.
    pub fn block(&self) {
        self.inner.blocked.set(true);
    }

    /// Undo [`block`](Self::block) and re-kick both FIFOs.
    pub fn unblock(&self) {
        self.inner.blocked.set(false);
        SocketInner::on_send(&self.inner);
        SocketInner::on_receive(&self.inner);
    }

    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.get()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.get()
    }

    #[inline]
    pub fn is_listening(&self) -> bool {
        self.inner.listening.get()
    }

    /// Total bytes sent through this socket.
    #[inline]
    pub fn tx_bytes(&self) -> usize {
        self.inner.tx_bytes.get()
    }

    /// Total bytes received through this socket.
    #[inline]
    pub fn rx_bytes(&self) -> usize {
        self.inner.rx_bytes.get()
    }
}

fn final_errno(weak: &Weak<SocketInner>) -> SockErr {
    match weak.upgrade() {
        Some(inner) if !inner.closed.get() => inner
            .raw
            .borrow()
            .as_ref()
            .map_or(SockErr::Badf, |raw| raw.errno()),
        _ => SockErr::NotError,
    }
}

fn loopback_send_step(weak: &Weak<SocketInner>, remaining: &Rc<RefCell<Bytes>>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return true;
    };
    if inner.closed.get() {
        return true;
    }
    let mut cache = inner.cache.borrow_mut();
    let available = inner.cache_limit.saturating_sub(cache.len());
    if inner.blocked.get() || available == 0 {
        return false;
    }
    let mut rem = remaining.borrow_mut();
    let n = available.min(rem.len());
    let chunk = rem.split_to(n);
    cache.extend_from_slice(&chunk);
    inner.tx_bytes.set(inner.tx_bytes.get() + n);
    let empty = rem.is_empty();
    drop(rem);
    drop(cache);
    let wake = weak.clone();
    inner.sim.schedule_now(move || {
        if let Some(inner) = wake.upgrade() {
            SocketInner::on_receive(&inner);
        }
    });
    empty
}

fn raw_send_step(weak: &Weak<SocketInner>, remaining: &Rc<RefCell<Bytes>>) -> bool {
    let Some(inner) = weak.upgrade() else {
        return true;
    };
    loop {
        if inner.closed.get() {
            return true;
        }
        let raw_ref = inner.raw.borrow();
        let Some(raw) = raw_ref.as_ref() else {
            return true;
        };
        let available = raw.tx_available();
        if inner.blocked.get() || available == 0 {
            return false;
        }
        let mut rem = remaining.borrow_mut();
        let n = available.min(rem.len());
        match raw.send(&rem[..n]) {
            Err(_) => return true,
            Ok(sent) => {
                rem.advance(sent);
                inner.tx_bytes.set(inner.tx_bytes.get() + sent);
            }
        }
        if rem.is_empty() {
            return true;
        }
    }
}

fn loopback_receive_step(
    weak: &Weak<SocketInner>,
    data: &Rc<RefCell<BytesMut>>,
    size: usize,
) -> bool {
    let Some(inner) = weak.upgrade() else {
        return true;
    };
    if inner.closed.get() {
        return true;
    }
    let mut cache = inner.cache.borrow_mut();
    if inner.blocked.get() || cache.is_empty() {
        return false;
    }
    let mut out = data.borrow_mut();
    let required = if size == 0 {
        cache.len()
    } else {
        size - out.len()
    };
    let n = required.min(cache.len());
    let chunk = cache.split_to(n);
    out.extend_from_slice(&chunk);
    inner.rx_bytes.set(inner.rx_bytes.get() + n);
    let filled = out.len() >= size;
    drop(out);
    drop(cache);
    let wake = weak.clone();
    inner.sim.schedule_now(move || {
        if let Some(inner) = wake.upgrade() {
            SocketInner::on_send(&inner);
        }
    });
    filled
}

fn raw_receive_step(weak: &Weak<SocketInner>, data: &Rc<RefCell<BytesMut>>, size: usize) -> bool {
    let Some(inner) = weak.upgrade() else {
        return true;
    };
    loop {
        if inner.closed.get() {
            return true;
        }
        let raw_ref = inner.raw.borrow();
        let Some(raw) = raw_ref.as_ref() else {
            return true;
        };
        if inner.blocked.get() || raw.rx_available() == 0 {
            return false;
        }
        let mut out = data.borrow_mut();
        let required = if size == 0 {
            raw.rx_available()
        } else {
            size - out.len()
        };
        let chunk = raw.recv(required);
        if chunk.is_empty() {
            return true;
        }
        inner.rx_bytes.set(inner.rx_bytes.get() + chunk.len());
        out.extend_from_slice(&chunk);
        if out.len() >= size {
            return true;
        }
    }
}
