//! Per-rank application lifecycle.
//!
//! An [`MpiApplication`] owns the rank/address tables, the communicator
//! registry and a queue of user functions. On initialization it brings up a
//! full mesh of peer sockets: every rank listens on its own address,
//! accepts from lower ranks and connects to higher ranks, which keeps the
//! pair ordering deterministic and duplicate-free. User functions then run
//! as coroutines, strictly one after another.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use fnv::FnvHashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::comm::{Communicator, Rank};
use crate::config::SimConfig;
use crate::error::Error;
use crate::net::{Addr, Network};
use crate::op::Operation;
use crate::sim::{Simulator, Time};
use crate::socket::SimSocket;

/// Communicator registry identifier.
pub type CommId = u64;

pub const ERROR_COMMUNICATOR: CommId = 0;
pub const NULL_COMMUNICATOR: CommId = 1;
pub const WORLD_COMMUNICATOR: CommId = 2;
pub const SELF_COMMUNICATOR: CommId = 3;

/// Identifiers below this are reserved.
pub const FIRST_USER_COMMUNICATOR: CommId = 4;

/// Base seed for per-rank RNGs; each rank uses `DEFAULT_SEED ^ rank`.
pub const DEFAULT_SEED: u64 = 5489;

/// A queued user function: runs as a coroutine against the application.
pub type MpiFunction = Box<dyn FnOnce(MpiApplication) -> Operation<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Initial,
    Working,
    Finalized,
}

struct AppInner {
    sim: Simulator,
    net: Network,
    config: SimConfig,
    rank: Rank,
    addresses: BTreeMap<Rank, Addr>,
    ranks_by_host: FnvHashMap<u32, Rank>,
    functions: RefCell<VecDeque<MpiFunction>>,
    rng: Rc<RefCell<StdRng>>,
    communicators: RefCell<FnvHashMap<CommId, Communicator>>,
    status: Cell<Status>,
    running: Cell<bool>,
}

/// A per-rank MPI application. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MpiApplication {
    inner: Rc<AppInner>,
}

impl MpiApplication {
    /// Create an application for `rank` with the default per-rank seed.
    pub fn new(
        net: &Network,
        config: SimConfig,
        rank: Rank,
        addresses: BTreeMap<Rank, Addr>,
        functions: VecDeque<MpiFunction>,
    ) -> Self {
        Self::with_seed(net, config, rank, addresses, functions, DEFAULT_SEED ^ rank)
    }

    /// Create an application with an explicit RNG seed.
    pub fn with_seed(
        net: &Network,
        config: SimConfig,
        rank: Rank,
        addresses: BTreeMap<Rank, Addr>,
        functions: VecDeque<MpiFunction>,
        seed: u64,
    ) -> Self {
        let ranks_by_host = addresses
            .iter()
            .map(|(&rank, &addr)| (addr.host, rank))
            .collect();
        MpiApplication {
            inner: Rc::new(AppInner {
                sim: net.simulator(),
                net: net.clone(),
                config,
                rank,
                addresses,
                ranks_by_host,
                functions: RefCell::new(functions),
                rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
                communicators: RefCell::new(FnvHashMap::default()),
                status: Cell::new(Status::Initial),
                running: Cell::new(false),
            }),
        }
    }

    /// The local rank.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    /// The scheduler this application runs on.
    pub fn simulator(&self) -> Simulator {
        self.inner.sim.clone()
    }

    #[inline]
    pub fn initialized(&self) -> bool {
        self.inner.status.get() == Status::Working
    }

    #[inline]
    pub fn finalized(&self) -> bool {
        self.inner.status.get() == Status::Finalized
    }

    /// Enqueue another user function. Functions run in insertion order.
    pub fn push_function(&self, function: MpiFunction) {
        self.inner.functions.borrow_mut().push_back(function);
    }

    /// Start the run loop: user functions are awaited sequentially, each
    /// completing before the next begins.
    pub fn start(&self) -> Operation<()> {
        self.inner.running.set(true);
        let this = self.clone();
        Operation::spawn(async move {
            let total = this.inner.functions.borrow().len();
            info!(target: "simmpi::app", rank = this.inner.rank, total, "application started");
            let began = this.inner.sim.now();
            loop {
                if !this.inner.running.get() {
                    break;
                }
                let next = this.inner.functions.borrow_mut().pop_front();
                let Some(function) = next else {
                    break;
                };
                function(this.clone()).await?;
                debug!(
                    target: "simmpi::app",
                    rank = this.inner.rank,
                    remaining = this.inner.functions.borrow().len(),
                    now = %this.inner.sim.now(),
                    "user function complete"
                );
            }
            this.inner.running.set(false);
            info!(
                target: "simmpi::app",
                rank = this.inner.rank,
                started = %began,
                ended = %this.inner.sim.now(),
                "application finished"
            );
            Ok(())
        })
    }

    /// Request a stop. The in-progress function runs to its next
    /// cooperative yield; queued functions are skipped.
    pub fn stop(&self) {
        self.inner.running.set(false);
    }

    /// Bring up the peer mesh and the WORLD/SELF/NULL communicators.
    pub fn initialize(&self) -> Operation<()> {
        let this = self.clone();
        Operation::spawn(async move {
            let inner = &this.inner;
            if inner.status.get() != Status::Initial {
                return Err(Error::Protocol("initialize may only be called once".into()));
            }
            let cache_limit = inner.config.connection_cache_limit();
            let mut world = this.connect_mesh(cache_limit).await?;
            world.insert(inner.rank, SimSocket::loopback(&inner.sim, cache_limit));
            if world.len() != inner.addresses.len() {
                return Err(Error::Protocol(format!(
                    "mesh has {} sockets for {} ranks",
                    world.len(),
                    inner.addresses.len()
                )));
            }
            let mut self_sockets = FnvHashMap::default();
            self_sockets.insert(inner.rank, SimSocket::loopback(&inner.sim, cache_limit));

            let mut communicators = inner.communicators.borrow_mut();
            communicators.insert(NULL_COMMUNICATOR, Communicator::empty(inner.rng.clone()));
            communicators.insert(
                WORLD_COMMUNICATOR,
                Communicator::new(inner.rank, inner.rng.clone(), world),
            );
            communicators.insert(
                SELF_COMMUNICATOR,
                Communicator::new(inner.rank, inner.rng.clone(), self_sockets),
            );
            drop(communicators);
            inner.status.set(Status::Working);
            info!(target: "simmpi::app", rank = inner.rank, "initialized");
            Ok(())
        })
    }

    /// Open one socket per peer: accept from lower ranks, connect to
    /// higher. Peers are identified by the source host of the connection.
    fn connect_mesh(&self, cache_limit: usize) -> Operation<FnvHashMap<Rank, SimSocket>> {
        let this = self.clone();
        Operation::spawn(async move {
            let inner = &this.inner;
            let self_addr = *inner.addresses.get(&inner.rank).ok_or_else(|| {
                Error::Protocol(format!("no address for local rank {}", inner.rank))
            })?;
            let listener = SimSocket::open(&inner.net, self_addr.host, cache_limit);
            let errno = listener.bind(self_addr);
            if errno.is_error() {
                return Err(Error::Protocol(format!(
                    "binding {self_addr} failed, reason: {errno}"
                )));
            }

            let sockets = Rc::new(RefCell::new(FnvHashMap::default()));
            let mut pending: Vec<Operation<()>> = Vec::new();
            for (&rank, &addr) in inner.addresses.iter() {
                if rank < inner.rank {
                    let accept = listener.accept();
                    let sockets = sockets.clone();
                    let hosts = inner.ranks_by_host.clone();
                    pending.push(Operation::spawn(async move {
                        let (socket, from, errno) = accept.await?;
                        if errno.is_error() {
                            return Err(Error::Accept { errno });
                        }
                        let peer = hosts.get(&from.host).copied().ok_or_else(|| {
                            Error::Protocol(format!("no rank listens at host {}", from.host))
                        })?;
                        sockets.borrow_mut().insert(peer, socket);
                        Ok(())
                    }));
                } else if rank > inner.rank {
                    let socket = SimSocket::open(&inner.net, self_addr.host, cache_limit);
                    sockets.borrow_mut().insert(rank, socket.clone());
                    pending.push(Operation::spawn(async move {
                        let errno = socket.connect(addr).await?;
                        if errno.is_error() {
                            return Err(Error::Connect { errno });
                        }
                        Ok(())
                    }));
                }
            }
            for op in pending {
                op.await?;
            }
            listener.close();
            let map = match Rc::try_unwrap(sockets) {
                Ok(cell) => cell.into_inner(),
                Err(shared) => shared.borrow().clone(),
            };
            Ok(map)
        })
    }

    /// Close every registered communicator.
    ///
    /// # Panics
    /// If called before initialization, or if a socket close fails.
    pub fn finalize(&self) {
        assert!(
            self.inner.status.get() == Status::Working,
            "finalize requires an initialized application"
        );
        let communicators: Vec<_> = self.inner.communicators.borrow().values().cloned().collect();
        for communicator in communicators {
            communicator
                .close()
                .expect("closing a communicator at finalize");
        }
        self.inner.status.set(Status::Finalized);
        info!(target: "simmpi::app", rank = self.inner.rank, "finalized");
    }

    /// Pause all communicator sockets.
    pub fn block(&self) {
        for communicator in self.inner.communicators.borrow().values() {
            communicator.block();
        }
    }

    /// Resume all communicator sockets.
    pub fn unblock(&self) {
        for communicator in self.inner.communicators.borrow().values() {
            communicator.unblock();
        }
    }

    /// Look up a registered communicator.
    ///
    /// # Panics
    /// If the application is not initialized or the id is unknown.
    pub fn communicator(&self, id: CommId) -> Communicator {
        assert!(
            self.initialized(),
            "the communicator registry requires an initialized application"
        );
        self.inner
            .communicators
            .borrow()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("communicator {id} is not registered"))
    }

    /// Register a copy of `old` under `new`, sharing its sockets.
    ///
    /// # Panics
    /// If the application is not initialized, `old` is unknown, or `new`
    /// already exists.
    pub fn duplicate_communicator(&self, old: CommId, new: CommId) -> Communicator {
        assert!(
            self.initialized(),
            "the communicator registry requires an initialized application"
        );
        let mut communicators = self.inner.communicators.borrow_mut();
        let source = communicators
            .get(&old)
            .cloned()
            .unwrap_or_else(|| panic!("communicator {old} is not registered"));
        assert!(
            !communicators.contains_key(&new),
            "communicator {new} already exists"
        );
        communicators.insert(new, source.clone());
        source
    }

    /// Close and remove a registered communicator.
    ///
    /// # Panics
    /// If the id is unknown or closing fails.
    pub fn free_communicator(&self, id: CommId) {
        let communicator = self
            .inner
            .communicators
            .borrow_mut()
            .remove(&id)
            .unwrap_or_else(|| panic!("communicator {id} is not registered"));
        communicator.close().expect("closing a freed communicator");
    }

    /// Modeled CPU work: an operation the simulator resolves after
    /// `duration`.
    pub fn compute(&self, duration: Time) -> Operation<()> {
        let op = Operation::pending();
        let done = op.clone();
        self.inner.sim.schedule(duration, move || done.terminate(()));
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_rank_app(sim: &Simulator) -> (Network, MpiApplication) {
        let net = Network::new(sim);
        let mut addresses = BTreeMap::new();
        addresses.insert(0, Addr::new(1, 9000));
        let app = MpiApplication::new(&net, SimConfig::default(), 0, addresses, VecDeque::new());
        (net, app)
    }

    #[test]
    fn test_single_rank_lifecycle() {
        let sim = Simulator::new();
        let (_net, app) = single_rank_app(&sim);

        let run = app.clone();
        app.push_function(Box::new(move |app| {
            Operation::spawn(async move {
                app.initialize().await?;
                let world = app.communicator(WORLD_COMMUNICATOR);
                assert_eq!(world.group_size(), 1);
                // Self-communication goes through the loopback socket.
                let gathered = world.gather(0, 123u64).await?;
                assert_eq!(gathered[&0], 123);
                let own = app.communicator(SELF_COMMUNICATOR);
                assert_eq!(own.group_size(), 1);
                app.finalize();
                Ok(())
            })
        }));
        let done = run.start();
        sim.run();
        assert!(done.result().is_ok());
        assert!(run.finalized());
    }

    #[test]
    fn test_compute_advances_simulated_time() {
        let sim = Simulator::new();
        let (_net, app) = single_rank_app(&sim);
        let op = app.compute(Time::from_millis(3));
        assert!(!op.done());
        sim.run();
        assert!(op.done());
        assert_eq!(sim.now(), Time::from_millis(3));
    }

    #[test]
    fn test_duplicate_and_free_communicator() {
        let sim = Simulator::new();
        let (_net, app) = single_rank_app(&sim);
        let init = app.initialize();
        sim.run();
        assert!(init.result().is_ok());

        app.duplicate_communicator(WORLD_COMMUNICATOR, FIRST_USER_COMMUNICATOR);
        assert_eq!(app.communicator(FIRST_USER_COMMUNICATOR).group_size(), 1);
        app.free_communicator(FIRST_USER_COMMUNICATOR);
    }

    #[test]
    #[should_panic(expected = "requires an initialized application")]
    fn test_registry_requires_initialization() {
        let sim = Simulator::new();
        let (_net, app) = single_rank_app(&sim);
        app.communicator(WORLD_COMMUNICATOR);
    }

    #[test]
    fn test_stop_skips_queued_functions() {
        let sim = Simulator::new();
        let (_net, app) = single_rank_app(&sim);
        let ran = Rc::new(Cell::new(0u32));

        let first_ran = ran.clone();
        let stopper = app.clone();
        app.push_function(Box::new(move |app| {
            Operation::spawn(async move {
                first_ran.set(first_ran.get() + 1);
                stopper.stop();
                // Modeled work after the stop request still completes.
                app.compute(Time::from_micros(1)).await?;
                Ok(())
            })
        }));
        let second_ran = ran.clone();
        app.push_function(Box::new(move |_app| {
            Operation::spawn(async move {
                second_ran.set(second_ran.get() + 10);
                Ok(())
            })
        }));

        let done = app.start();
        sim.run();
        assert!(done.result().is_ok());
        assert_eq!(ran.get(), 1);
    }
}
