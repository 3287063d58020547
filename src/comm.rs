//! The MPI-style communicator.
//!
//! A [`Communicator`] owns one coroutine socket per member rank (a loopback
//! for itself) and builds every collective out of ordered point-to-point
//! send/receive pairs. All collectives are cooperative: each returns an
//! [`Operation`] and composes with any other, and a collective fails as a
//! whole on the first failing sub-operation.
//!
//! Point-to-point delivery between a fixed pair of ranks is FIFO because
//! all messages between that pair traverse the same socket. Root-side loops
//! iterate the sorted rank vector, so the order of sub-operations is
//! deterministic.

use std::any::type_name;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use fnv::FnvHashMap;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::op::Operation;
use crate::packet::{self, Packet};
use crate::socket::SimSocket;
use crate::wire::{self, FixedWire, Wire};

/// A member identifier within a communicator.
pub type Rank = u64;

/// Built-in reduction operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Product,
    Max,
    Min,
    BitAnd,
    BitOr,
    BitXor,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
}

/// A value reducible under the built-in operators: an identity element plus
/// an associative combine. Reduction folds left-associatively from the
/// identity in sorted-rank order.
pub trait Reducible: Sized {
    fn identity(op: ReduceOp) -> Result<Self>;

    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;
}

macro_rules! reducible_int {
    ($($t:ty),* $(,)?) => {
        $(
            impl Reducible for $t {
                fn identity(op: ReduceOp) -> Result<Self> {
                    Ok(match op {
                        ReduceOp::Sum
                        | ReduceOp::BitOr
                        | ReduceOp::BitXor
                        | ReduceOp::LogicalOr
                        | ReduceOp::LogicalXor => 0,
                        ReduceOp::Product => 1,
                        ReduceOp::BitAnd | ReduceOp::LogicalAnd => !0,
                        ReduceOp::Max => <$t>::MIN,
                        ReduceOp::Min => <$t>::MAX,
                    })
                }

                fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Product => a * b,
                        ReduceOp::Max => a.max(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::BitAnd => a & b,
                        ReduceOp::BitOr => a | b,
                        ReduceOp::BitXor => a ^ b,
                        ReduceOp::LogicalAnd => ((a != 0) && (b != 0)) as $t,
                        ReduceOp::LogicalOr => ((a != 0) || (b != 0)) as $t,
                        ReduceOp::LogicalXor => ((a != 0) ^ (b != 0)) as $t,
                    }
                }
            }
        )*
    };
}

reducible_int!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128);

macro_rules! reducible_float {
    ($($t:ty),* $(,)?) => {
        $(
            impl Reducible for $t {
                fn identity(op: ReduceOp) -> Result<Self> {
                    match op {
                        ReduceOp::Sum => Ok(0.0),
                        ReduceOp::Product => Ok(1.0),
                        ReduceOp::Max => Ok(<$t>::NEG_INFINITY),
                        ReduceOp::Min => Ok(<$t>::INFINITY),
                        other => Err(Error::Protocol(format!(
                            "{other:?} is not defined for floating-point values"
                        ))),
                    }
                }

                fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Product => a * b,
                        ReduceOp::Max => a.max(b),
                        ReduceOp::Min => a.min(b),
                        _ => unreachable!("rejected by identity()"),
                    }
                }
            }
        )*
    };
}

reducible_float!(f32, f64);

struct CommInner {
    rank: Rank,
    rng: Rc<RefCell<StdRng>>,
    /// Member ranks, sorted. Ring algorithms and root-side loops use this.
    ranks: Vec<Rank>,
    sockets: FnvHashMap<Rank, SimSocket>,
}

/// The collective-communication object for a fixed group of ranks.
/// Cheap to clone; clones share sockets.
#[derive(Clone)]
pub struct Communicator {
    inner: Rc<CommInner>,
}

impl Communicator {
    /// Build a communicator over `sockets`. The local rank's entry must be
    /// a loopback socket.
    pub fn new(
        rank: Rank,
        rng: Rc<RefCell<StdRng>>,
        sockets: FnvHashMap<Rank, SimSocket>,
    ) -> Self {
        let mut ranks: Vec<Rank> = sockets.keys().copied().collect();
        ranks.sort_unstable();
        Communicator {
            inner: Rc::new(CommInner {
                rank,
                rng,
                ranks,
                sockets,
            }),
        }
    }

    /// The null communicator: no members, no sockets.
    pub fn empty(rng: Rc<RefCell<StdRng>>) -> Self {
        Self::new(0, rng, FnvHashMap::default())
    }

    /// The local rank.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    /// Number of member ranks.
    #[inline]
    pub fn group_size(&self) -> usize {
        self.inner.sockets.len()
    }

    /// The member ranks.
    pub fn group_members(&self) -> BTreeSet<Rank> {
        self.inner.ranks.iter().copied().collect()
    }

    #[inline]
    fn ranks(&self) -> &[Rank] {
        &self.inner.ranks
    }

    fn socket(&self, rank: Rank) -> Result<SimSocket> {
        self.inner
            .sockets
            .get(&rank)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("rank {rank} is not a member of this group")))
    }

    // -- point to point ----------------------------------------------------

    /// Typed point-to-point send.
    pub fn send<T: Wire>(&self, rank: Rank, value: T) -> Operation<()> {
        debug!(target: "simmpi::comm", from = self.rank(), to = rank, ty = type_name::<T>(), "send");
        let this = self.clone();
        Operation::spawn(async move {
            let socket = this.socket(rank)?;
            T::write(&socket, value)
                .await
                .map_err(|e| Error::send_to(rank, e))
        })
    }

    /// Typed point-to-point receive.
    pub fn recv<T: Wire>(&self, rank: Rank) -> Operation<T> {
        debug!(target: "simmpi::comm", at = self.rank(), from = rank, ty = type_name::<T>(), "recv");
        let this = self.clone();
        Operation::spawn(async move {
            let socket = this.socket(rank)?;
            T::read(&socket).await.map_err(|e| Error::recv_from(rank, e))
        })
    }

    /// Send a raw packet.
    pub fn send_raw(&self, rank: Rank, data: Packet) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let socket = this.socket(rank)?;
            let (_sent, errno) = socket.send(data).await.map_err(|e| Error::send_to(rank, e))?;
            if errno.is_error() {
                return Err(Error::send_to(rank, Error::Socket { errno }));
            }
            Ok(())
        })
    }

    /// Receive exactly `size` raw bytes.
    pub fn recv_raw(&self, rank: Rank, size: usize) -> Operation<Packet> {
        let this = self.clone();
        Operation::spawn(async move {
            let socket = this.socket(rank)?;
            let (data, errno) = socket
                .receive(size)
                .await
                .map_err(|e| Error::recv_from(rank, e))?;
            if errno.is_error() {
                return Err(Error::recv_from(rank, Error::Socket { errno }));
            }
            Ok(data)
        })
    }

    /// Send `size` bytes of fake payload.
    pub fn send_fake(&self, rank: Rank, size: usize) -> Operation<()> {
        debug!(target: "simmpi::comm", from = self.rank(), to = rank, size, "send fake");
        self.send_raw(rank, packet::zeroed(size))
    }

    /// Receive and discard `size` bytes of fake payload.
    pub fn recv_fake(&self, rank: Rank, size: usize) -> Operation<()> {
        debug!(target: "simmpi::comm", at = self.rank(), from = rank, size, "recv fake");
        self.recv_raw(rank, size).then(|_| ())
    }

    /// Send a fake vector of `count` elements of `T`.
    pub fn send_fake_vec<T: FixedWire>(&self, rank: Rank, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let socket = this.socket(rank)?;
            wire::send_fake_vec::<T>(&socket, count)
                .await
                .map_err(|e| Error::send_to(rank, e))
        })
    }

    /// Receive and discard a fake vector of `count` elements of `T`.
    pub fn recv_fake_vec<T: FixedWire>(&self, rank: Rank, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let socket = this.socket(rank)?;
            wire::recv_fake_vec::<T>(&socket, count)
                .await
                .map_err(|e| Error::recv_from(rank, e))
        })
    }

    /// Concurrent send to `destination` and receive from `source`.
    pub fn sendrecv<S: Wire, R: Wire>(
        &self,
        destination: Rank,
        value: S,
        source: Rank,
    ) -> Operation<R> {
        let send = self.send(destination, value);
        let recv = self.recv::<R>(source);
        Operation::spawn(async move {
            send.await?;
            recv.await
        })
    }

    // -- collectives -------------------------------------------------------

    /// Gather one value from every member at `root`. Non-root ranks return
    /// an empty map.
    pub fn gather<T: Wire>(&self, root: Rank, value: T) -> Operation<FnvHashMap<Rank, T>> {
        debug!(target: "simmpi::comm", at = self.rank(), root, ty = type_name::<T>(), "gather");
        let this = self.clone();
        Operation::spawn(async move {
            let send = this.send(root, value);
            let mut result = FnvHashMap::default();
            if this.rank() == root {
                let receives: Vec<(Rank, Operation<T>)> = this
                    .ranks()
                    .iter()
                    .map(|&rank| (rank, this.recv::<T>(rank)))
                    .collect();
                for (rank, op) in receives {
                    result.insert(rank, op.await?);
                }
            }
            send.await?;
            Ok(result)
        })
    }

    /// Gather at every rank concurrently; return the map gathered at self.
    pub fn all_gather<T: Wire>(&self, value: T) -> Operation<FnvHashMap<Rank, T>> {
        debug!(target: "simmpi::comm", at = self.rank(), ty = type_name::<T>(), "all gather");
        let this = self.clone();
        Operation::spawn(async move {
            let gathers: Vec<(Rank, Operation<FnvHashMap<Rank, T>>)> = this
                .ranks()
                .iter()
                .map(|&rank| (rank, this.gather(rank, value.clone())))
                .collect();
            let mut own = None;
            for (rank, op) in gathers {
                let gathered = op.await?;
                if rank == this.rank() {
                    own = Some(gathered);
                }
            }
            own.ok_or_else(|| Error::Protocol("rank is not a member of its own group".into()))
        })
    }

    /// Distribute per-rank values from `root`; return the value for self.
    pub fn scatter<T: Wire>(&self, root: Rank, data: FnvHashMap<Rank, T>) -> Operation<T> {
        debug!(target: "simmpi::comm", at = self.rank(), root, ty = type_name::<T>(), "scatter");
        let this = self.clone();
        Operation::spawn(async move {
            let recv = this.recv::<T>(root);
            if this.rank() == root {
                let mut sends = Vec::with_capacity(this.group_size());
                for &rank in this.ranks() {
                    let value = data.get(&rank).cloned().ok_or_else(|| {
                        Error::Protocol(format!("scatter map is missing rank {rank}"))
                    })?;
                    sends.push(this.send(rank, value));
                }
                for op in sends {
                    op.await?;
                }
            }
            recv.await
        })
    }

    /// Broadcast a value from `root`. Only the root provides `data`.
    pub fn broadcast<T: Wire>(&self, root: Rank, data: Option<T>) -> Operation<T> {
        debug!(target: "simmpi::comm", at = self.rank(), root, ty = type_name::<T>(), "broadcast");
        let this = self.clone();
        Operation::spawn(async move {
            let recv = this.recv::<T>(root);
            if this.rank() == root {
                let value = data
                    .ok_or_else(|| Error::Protocol("broadcast root holds no value".into()))?;
                let sends: Vec<_> = this
                    .ranks()
                    .iter()
                    .map(|&rank| this.send(rank, value.clone()))
                    .collect();
                for op in sends {
                    op.await?;
                }
            }
            recv.await
        })
    }

    /// Block until every member has entered the barrier.
    pub fn barrier(&self) -> Operation<()> {
        debug!(target: "simmpi::comm", at = self.rank(), "barrier");
        let this = self.clone();
        Operation::spawn(async move {
            let gathers: Vec<_> = this
                .ranks()
                .iter()
                .map(|&rank| this.gather(rank, this.rank()))
                .collect();
            for op in gathers {
                op.await?;
            }
            Ok(())
        })
    }

    /// Reduce values at `root` under `op`. The root returns `Some(folded)`,
    /// every other rank `None`.
    pub fn reduce<T>(&self, op: ReduceOp, root: Rank, value: T) -> Operation<Option<T>>
    where
        T: Wire + Reducible,
    {
        debug!(target: "simmpi::comm", at = self.rank(), root, ?op, ty = type_name::<T>(), "reduce");
        let this = self.clone();
        Operation::spawn(async move {
            let gathered = this.gather(root, value).await?;
            if this.rank() != root {
                return Ok(None);
            }
            let mut acc = T::identity(op)?;
            for &rank in this.ranks() {
                let value = gathered.get(&rank).cloned().ok_or_else(|| {
                    Error::Protocol(format!("gather result is missing rank {rank}"))
                })?;
                acc = T::combine(op, acc, value);
            }
            Ok(Some(acc))
        })
    }

    /// Reduce with a caller-provided identity and associative combine, for
    /// types outside the built-in operator vocabulary.
    pub fn reduce_with<T, F>(
        &self,
        root: Rank,
        value: T,
        identity: T,
        combine: F,
    ) -> Operation<Option<T>>
    where
        T: Wire,
        F: Fn(T, T) -> T + 'static,
    {
        let this = self.clone();
        Operation::spawn(async move {
            let gathered = this.gather(root, value).await?;
            if this.rank() != root {
                return Ok(None);
            }
            let mut acc = identity;
            for &rank in this.ranks() {
                let value = gathered.get(&rank).cloned().ok_or_else(|| {
                    Error::Protocol(format!("gather result is missing rank {rank}"))
                })?;
                acc = combine(acc, value);
            }
            Ok(Some(acc))
        })
    }

    /// Run one reduce per member rank concurrently; return the reduction
    /// rooted at self.
    pub fn reduce_scatter<T>(&self, op: ReduceOp, data: FnvHashMap<Rank, T>) -> Operation<T>
    where
        T: Wire + Reducible,
    {
        debug!(target: "simmpi::comm", at = self.rank(), ?op, ty = type_name::<T>(), "reduce scatter");
        let this = self.clone();
        Operation::spawn(async move {
            let mut reduces = Vec::with_capacity(this.group_size());
            for &rank in this.ranks() {
                let value = data.get(&rank).cloned().ok_or_else(|| {
                    Error::Protocol(format!("reduce-scatter map is missing rank {rank}"))
                })?;
                reduces.push((rank, this.reduce(op, rank, value)));
            }
            let mut own = None;
            for (rank, operation) in reduces {
                let reduced = operation.await?;
                if rank == this.rank() {
                    own = reduced;
                }
            }
            own.ok_or_else(|| Error::Protocol("reduce-scatter produced no local value".into()))
        })
    }

    /// Elect a root: every rank draws a 64-bit vote from its seeded RNG and
    /// the lexicographic maximum of `(vote, rank)` wins, so ties break
    /// toward the higher rank.
    pub fn elect(&self) -> Operation<Rank> {
        let vote: u64 = self.inner.rng.borrow_mut().gen();
        self.elect_with(vote)
    }

    /// Elect with an explicit vote.
    pub fn elect_with(&self, vote: u64) -> Operation<Rank> {
        debug!(target: "simmpi::comm", at = self.rank(), vote, "electing");
        let this = self.clone();
        Operation::spawn(async move {
            let votes = this.all_gather(vote).await?;
            votes
                .iter()
                .map(|(&rank, &vote)| (vote, rank))
                .max()
                .map(|(_, rank)| rank)
                .ok_or_else(|| Error::Protocol("election over an empty group".into()))
        })
    }

    /// Reduce everywhere: elect a root, reduce there, broadcast the result.
    pub fn all_reduce<T>(&self, op: ReduceOp, value: T) -> Operation<T>
    where
        T: Wire + Reducible,
    {
        debug!(target: "simmpi::comm", at = self.rank(), ?op, ty = type_name::<T>(), "all reduce");
        let this = self.clone();
        Operation::spawn(async move {
            let root = this.elect().await?;
            let partial = this.reduce(op, root, value).await?;
            this.broadcast(root, partial).await
        })
    }

    /// Exchange one value with every member; returns the values received.
    pub fn all_to_all<S: Wire, R: Wire>(
        &self,
        data: FnvHashMap<Rank, S>,
    ) -> Operation<FnvHashMap<Rank, R>> {
        debug!(target: "simmpi::comm", at = self.rank(), "all to all");
        let this = self.clone();
        Operation::spawn(async move {
            let mut sends = Vec::with_capacity(this.group_size());
            let mut receives = Vec::with_capacity(this.group_size());
            for &rank in this.ranks() {
                let value = data.get(&rank).cloned().ok_or_else(|| {
                    Error::Protocol(format!("all-to-all map is missing rank {rank}"))
                })?;
                sends.push(this.send(rank, value));
                receives.push((rank, this.recv::<R>(rank)));
            }
            for op in sends {
                op.await?;
            }
            let mut result = FnvHashMap::default();
            for (rank, op) in receives {
                result.insert(rank, op.await?);
            }
            Ok(result)
        })
    }

    // -- fake-payload collectives -----------------------------------------

    /// Fake gather: the byte traffic of gathering a `count`-element vector
    /// of `T` at `root`, with no values materialized.
    pub fn gather_fake<T: FixedWire>(&self, root: Rank, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let send = this.send_fake_vec::<T>(root, count);
            if this.rank() == root {
                let receives: Vec<_> = this
                    .ranks()
                    .iter()
                    .map(|&rank| this.recv_fake_vec::<T>(rank, count))
                    .collect();
                for op in receives {
                    op.await?;
                }
            }
            send.await
        })
    }

    /// Fake all-gather.
    pub fn all_gather_fake<T: FixedWire>(&self, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let gathers: Vec<_> = this
                .ranks()
                .iter()
                .map(|&rank| this.gather_fake::<T>(rank, count))
                .collect();
            for op in gathers {
                op.await?;
            }
            Ok(())
        })
    }

    /// Fake scatter.
    pub fn scatter_fake<T: FixedWire>(&self, root: Rank, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let recv = this.recv_fake_vec::<T>(root, count);
            if this.rank() == root {
                let sends: Vec<_> = this
                    .ranks()
                    .iter()
                    .map(|&rank| this.send_fake_vec::<T>(rank, count))
                    .collect();
                for op in sends {
                    op.await?;
                }
            }
            recv.await
        })
    }

    /// Fake broadcast: same traffic shape as a fake scatter.
    pub fn broadcast_fake<T: FixedWire>(&self, root: Rank, count: usize) -> Operation<()> {
        self.scatter_fake::<T>(root, count)
    }

    /// Fake reduce: the traffic of a reduce is the traffic of its gather.
    pub fn reduce_fake<T: FixedWire>(&self, root: Rank, count: usize) -> Operation<()> {
        self.gather_fake::<T>(root, count)
    }

    /// Fake all-reduce: elect, reduce at the root, broadcast back.
    pub fn all_reduce_fake<T: FixedWire>(&self, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let root = this.elect().await?;
            this.reduce_fake::<T>(root, count).await?;
            this.broadcast_fake::<T>(root, count).await
        })
    }

    /// Fake all-to-all.
    pub fn all_to_all_fake<T: FixedWire>(&self, count: usize) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let mut ops = Vec::with_capacity(this.group_size() * 2);
            for &rank in this.ranks() {
                ops.push(this.send_fake_vec::<T>(rank, count));
            }
            for &rank in this.ranks() {
                ops.push(this.recv_fake_vec::<T>(rank, count));
            }
            for op in ops {
                op.await?;
            }
            Ok(())
        })
    }

    /// Ring all-reduce over fake payload: a ring scatter-reduce followed by
    /// a ring all-gather, `2 * (N - 1)` rounds in total. `size` elements of
    /// `T` are partitioned evenly across the group.
    pub fn ring_all_reduce_fake<T: FixedWire>(&self, size: usize) -> Operation<()> {
        debug!(target: "simmpi::comm", at = self.rank(), size, "ring all reduce");
        let this = self.clone();
        Operation::spawn(async move {
            let n = this.group_size();
            if n <= 1 {
                return Ok(());
            }
            let partition = size.div_ceil(n);
            let ranks = this.ranks().to_vec();
            let index = ranks
                .iter()
                .position(|&rank| rank == this.rank())
                .ok_or_else(|| Error::Protocol("rank is not a member of its own group".into()))?;
            let send_target = ranks[(index + n - 1) % n];
            let recv_target = ranks[(index + 1) % n];

            let chunk = |slot: usize| -> usize {
                partition.min(size.saturating_sub(partition * slot))
            };

            // Scatter-reduce: after round i each rank holds one partially
            // reduced partition more.
            for i in 0..n - 1 {
                let send_size = chunk((index + i) % n);
                let recv_size = chunk((index + i + 1) % n);
                let send = this.send_fake_vec::<T>(send_target, send_size);
                let recv = this.recv_fake_vec::<T>(recv_target, recv_size);
                send.await?;
                recv.await?;
            }
            // All-gather: circulate the fully reduced partitions.
            for i in 0..n - 1 {
                let send_size = chunk((index + i + n - 1) % n);
                let recv_size = chunk((index + i) % n);
                let send = this.send_fake_vec::<T>(send_target, send_size);
                let recv = this.recv_fake_vec::<T>(recv_target, recv_size);
                send.await?;
                recv.await?;
            }
            Ok(())
        })
    }

    // -- lifecycle ---------------------------------------------------------

    /// Pause every member socket.
    pub fn block(&self) {
        for socket in self.inner.sockets.values() {
            socket.block();
        }
    }

    /// Resume every member socket.
    pub fn unblock(&self) {
        for socket in self.inner.sockets.values() {
            socket.unblock();
        }
    }

    /// Bytes sent to peers, excluding loopback traffic.
    pub fn tx_bytes(&self) -> usize {
        self.inner
            .sockets
            .iter()
            .filter(|(&rank, _)| rank != self.rank())
            .map(|(_, socket)| socket.tx_bytes())
            .sum()
    }

    /// Bytes received from peers, excluding loopback traffic.
    pub fn rx_bytes(&self) -> usize {
        self.inner
            .sockets
            .iter()
            .filter(|(&rank, _)| rank != self.rank())
            .map(|(_, socket)| socket.rx_bytes())
            .sum()
    }

    /// Close every member socket. A surfaced close error is fatal to the
    /// communicator.
    pub fn close(&self) -> Result<()> {
        for (&rank, socket) in &self.inner.sockets {
            let errno = socket.close();
            if errno.is_error() {
                error!(target: "simmpi::comm", rank, %errno, "closing peer socket failed");
                return Err(Error::Protocol(format!(
                    "closing socket to rank {rank} failed, reason: {errno}"
                )));
            }
        }
        Ok(())
    }
}
