//! End-to-end collective scenarios over a full rank mesh.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use fnv::FnvHashMap;

use simmpi::{
    Addr, Communicator, MpiApplication, MpiFunction, Network, Operation, Rank, ReduceOp,
    SimConfig, Simulator, Time, WORLD_COMMUNICATOR,
};

// =============================================================================
// Harness
// =============================================================================

/// Run one user function per rank to completion over a full mesh.
fn run_ranks(functions: Vec<MpiFunction>) -> Simulator {
    let sim = Simulator::new();
    let net = Network::new(&sim);
    let addresses: BTreeMap<Rank, Addr> = (0..functions.len() as Rank)
        .map(|rank| (rank, Addr::new(rank as u32 + 1, 9000)))
        .collect();

    let mut runs = Vec::new();
    for (rank, function) in functions.into_iter().enumerate() {
        let app = MpiApplication::new(
            &net,
            SimConfig::default(),
            rank as Rank,
            addresses.clone(),
            VecDeque::from([function]),
        );
        runs.push((rank, app.start()));
    }
    sim.run();
    for (rank, run) in &runs {
        run.result().unwrap_or_else(|e| panic!("rank {rank} failed: {e}"));
    }
    sim
}

/// Build a per-rank function that initializes, runs `body` against the
/// WORLD communicator, synchronizes, and finalizes.
fn world_function<F, Fut>(body: F) -> MpiFunction
where
    F: FnOnce(MpiApplication, Communicator) -> Fut + 'static,
    Fut: std::future::Future<Output = simmpi::Result<()>> + 'static,
{
    Box::new(move |app: MpiApplication| {
        Operation::spawn(async move {
            app.initialize().await?;
            let world = app.communicator(WORLD_COMMUNICATOR);
            body(app.clone(), world.clone()).await?;
            world.barrier().await?;
            app.finalize();
            Ok(())
        })
    })
}

// =============================================================================
// Gather / scatter / broadcast (S1, S2, S3)
// =============================================================================

#[test]
fn test_three_rank_gather() {
    let results: Rc<RefCell<BTreeMap<Rank, FnvHashMap<Rank, u64>>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let gathered = world.gather(0, (rank + 1) * 100).await?;
                results.borrow_mut().insert(rank, gathered);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    let results = results.borrow();
    assert_eq!(results[&0][&0], 100);
    assert_eq!(results[&0][&1], 200);
    assert_eq!(results[&0][&2], 300);
    assert!(results[&1].is_empty());
    assert!(results[&2].is_empty());
}

#[test]
fn test_three_rank_scatter() {
    let results: Rc<RefCell<BTreeMap<Rank, u64>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let mut data = FnvHashMap::default();
                if rank == 0 {
                    data.insert(0, 4u64);
                    data.insert(1, 5);
                    data.insert(2, 6);
                }
                let received = world.scatter(0, data).await?;
                results.borrow_mut().insert(rank, received);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    assert_eq!(
        *results.borrow(),
        BTreeMap::from([(0, 4), (1, 5), (2, 6)])
    );
}

#[test]
fn test_three_rank_broadcast() {
    let results: Rc<RefCell<BTreeMap<Rank, u64>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let data = (rank == 0).then_some(1u64);
                let received = world.broadcast(0, data).await?;
                results.borrow_mut().insert(rank, received);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    assert!(results.borrow().values().all(|&v| v == 1));
    assert_eq!(results.borrow().len(), 3);
}

#[test]
fn test_all_gather_agrees_everywhere() {
    let results: Rc<RefCell<BTreeMap<Rank, FnvHashMap<Rank, u64>>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let gathered = world.all_gather(rank * rank + 1).await?;
                results.borrow_mut().insert(rank, gathered);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    let results = results.borrow();
    for rank in 0..3 {
        assert_eq!(results[&rank][&0], 1);
        assert_eq!(results[&rank][&1], 2);
        assert_eq!(results[&rank][&2], 5);
    }
}

// =============================================================================
// Reductions (S4, S5, P6, P7)
// =============================================================================

#[test]
fn test_reduce_max_and_sum() {
    let max_results: Rc<RefCell<BTreeMap<Rank, Option<u64>>>> = Rc::default();
    let sum_results: Rc<RefCell<BTreeMap<Rank, Option<u64>>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let max_results = max_results.clone();
            let sum_results = sum_results.clone();
            world_function(move |_app, world| async move {
                let max = world.reduce(ReduceOp::Max, 0, rank + 1).await?;
                max_results.borrow_mut().insert(rank, max);
                let sum = world.reduce(ReduceOp::Sum, 0, rank + 1).await?;
                sum_results.borrow_mut().insert(rank, sum);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    assert_eq!(
        *max_results.borrow(),
        BTreeMap::from([(0, Some(3)), (1, None), (2, None)])
    );
    assert_eq!(
        *sum_results.borrow(),
        BTreeMap::from([(0, Some(6)), (1, None), (2, None)])
    );
}

#[test]
fn test_all_reduce_consensus() {
    let results: Rc<RefCell<BTreeMap<Rank, u64>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let sum = world.all_reduce(ReduceOp::Sum, rank + 1).await?;
                results.borrow_mut().insert(rank, sum);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    // Every rank agrees on the same total.
    assert!(results.borrow().values().all(|&v| v == 6));
    assert_eq!(results.borrow().len(), 3);
}

#[test]
fn test_reduce_scatter() {
    let results: Rc<RefCell<BTreeMap<Rank, u64>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let mut data = FnvHashMap::default();
                for peer in 0..3 {
                    data.insert(peer, rank * 10 + peer);
                }
                let reduced = world.reduce_scatter(ReduceOp::Sum, data).await?;
                results.borrow_mut().insert(rank, reduced);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    // Rank p receives sum over r of (r * 10 + p) = 30 + 3p.
    assert_eq!(
        *results.borrow(),
        BTreeMap::from([(0, 30), (1, 33), (2, 36)])
    );
}

#[test]
fn test_reduce_with_custom_operator() {
    let results: Rc<RefCell<BTreeMap<Rank, Option<u64>>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                // Concatenate decimal digits: associative over this input.
                let folded = world
                    .reduce_with(0, rank + 1, 0u64, |acc, v| acc * 10 + v)
                    .await?;
                results.borrow_mut().insert(rank, folded);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    assert_eq!(results.borrow()[&0], Some(123));
    assert_eq!(results.borrow()[&1], None);
}

// =============================================================================
// Point-to-point and all-to-all (S6, P4)
// =============================================================================

#[test]
fn test_all_to_all() {
    let results: Rc<RefCell<BTreeMap<Rank, FnvHashMap<Rank, u64>>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let mut data = FnvHashMap::default();
                for peer in 0..3 {
                    data.insert(peer, rank + peer);
                }
                let received = world.all_to_all::<u64, u64>(data).await?;
                results.borrow_mut().insert(rank, received);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    let results = results.borrow();
    for rank in 0..3u64 {
        for peer in 0..3u64 {
            assert_eq!(results[&rank][&peer], peer + rank);
        }
    }
}

#[test]
fn test_point_to_point_fifo() {
    let received: Rc<RefCell<Vec<u64>>> = Rc::default();

    let sender = world_function(move |_app, world| async move {
        for value in [10u64, 20, 30] {
            world.send(1, value).await?;
        }
        Ok(())
    });
    let log = received.clone();
    let receiver = world_function(move |_app, world| async move {
        for _ in 0..3 {
            let value = world.recv::<u64>(0).await?;
            log.borrow_mut().push(value);
        }
        Ok(())
    });
    run_ranks(vec![sender, receiver]);

    assert_eq!(*received.borrow(), vec![10, 20, 30]);
}

#[test]
fn test_sendrecv_exchanges() {
    let results: Rc<RefCell<BTreeMap<Rank, u64>>> = Rc::default();

    let functions = (0..2)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let peer = 1 - rank;
                let received = world.sendrecv::<u64, u64>(peer, rank + 40, peer).await?;
                results.borrow_mut().insert(rank, received);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    assert_eq!(*results.borrow(), BTreeMap::from([(0, 41), (1, 40)]));
}

// =============================================================================
// Barrier and election (P9)
// =============================================================================

#[test]
fn test_barrier_global_ordering() {
    let pre: Rc<RefCell<BTreeMap<Rank, Time>>> = Rc::default();
    let post: Rc<RefCell<BTreeMap<Rank, Time>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let pre = pre.clone();
            let post = post.clone();
            world_function(move |app, world| async move {
                // Stagger arrival so the barrier actually has to wait.
                app.compute(Time::from_micros(rank * 50)).await?;
                pre.borrow_mut().insert(rank, app.simulator().now());
                world.barrier().await?;
                post.borrow_mut().insert(rank, app.simulator().now());
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    let last_entry = *pre.borrow().values().max().unwrap();
    let first_exit = *post.borrow().values().min().unwrap();
    assert!(last_entry <= first_exit);
    // The slowest rank entered 100us in; nobody left before that.
    assert!(first_exit >= Time::from_micros(100));
}

#[test]
fn test_election_is_unanimous() {
    let results: Rc<RefCell<BTreeMap<Rank, Rank>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let root = world.elect().await?;
                results.borrow_mut().insert(rank, root);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    let results = results.borrow();
    let elected = results[&0];
    assert!(elected < 3);
    assert!(results.values().all(|&root| root == elected));
}

#[test]
fn test_election_tie_breaks_on_rank() {
    let results: Rc<RefCell<BTreeMap<Rank, Rank>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                // Identical votes: the highest rank must win.
                let root = world.elect_with(7).await?;
                results.borrow_mut().insert(rank, root);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    assert!(results.borrow().values().all(|&root| root == 2));
}

// =============================================================================
// Fake payloads and the ring (P8)
// =============================================================================

#[test]
fn test_ring_all_reduce_byte_count() {
    const SIZE: usize = 999;
    let tx: Rc<RefCell<BTreeMap<Rank, usize>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let tx = tx.clone();
            world_function(move |_app, world| async move {
                let before = world.tx_bytes();
                world.ring_all_reduce_fake::<u8>(SIZE).await?;
                tx.borrow_mut().insert(rank, world.tx_bytes() - before);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    // Each rank moves 2 * (N - 1) * SIZE / N payload bytes, plus one u64
    // count prefix per round.
    let rounds = 2 * (3 - 1);
    let expected = rounds * (SIZE / 3) + rounds * 8;
    for (&rank, &bytes) in tx.borrow().iter() {
        assert_eq!(bytes, expected, "rank {rank}");
    }
}

#[test]
fn test_fake_collectives_move_the_right_bytes() {
    let functions = (0..3)
        .map(|rank| {
            world_function(move |_app, world| async move {
                world.gather_fake::<u64>(0, 64).await?;
                world.all_reduce_fake::<u64>(32).await?;
                world.all_to_all_fake::<u8>(100).await?;
                let _ = rank;
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);
}

#[test]
fn test_vector_payloads() {
    let results: Rc<RefCell<BTreeMap<Rank, FnvHashMap<Rank, Vec<u32>>>>> = Rc::default();

    let functions = (0..3)
        .map(|rank| {
            let results = results.clone();
            world_function(move |_app, world| async move {
                let payload: Vec<u32> = (0..rank as u32 + 1).collect();
                let gathered = world.gather(2, payload).await?;
                results.borrow_mut().insert(rank, gathered);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    let results = results.borrow();
    assert_eq!(results[&2][&0], vec![0]);
    assert_eq!(results[&2][&1], vec![0, 1]);
    assert_eq!(results[&2][&2], vec![0, 1, 2]);
}

// =============================================================================
// Communicator lifecycle
// =============================================================================

#[test]
fn test_counters_exclude_loopback() {
    let counters: Rc<RefCell<BTreeMap<Rank, (usize, usize)>>> = Rc::default();

    let functions = (0..2)
        .map(|rank| {
            let counters = counters.clone();
            world_function(move |_app, world| async move {
                // A u64 to the peer and one to self; only the former counts.
                let peer = 1 - rank;
                let send_peer = world.send(peer, 5u64);
                let send_self = world.send(rank, 6u64);
                let from_peer = world.recv::<u64>(peer).await?;
                let from_self = world.recv::<u64>(rank).await?;
                send_peer.await?;
                send_self.await?;
                assert_eq!(from_peer, 5);
                assert_eq!(from_self, 6);
                counters
                    .borrow_mut()
                    .insert(rank, (world.tx_bytes(), world.rx_bytes()));
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);

    for (_, &(tx, rx)) in counters.borrow().iter() {
        assert_eq!(tx, 8);
        assert_eq!(rx, 8);
    }
}

#[test]
fn test_group_members() {
    let functions = (0..3)
        .map(|rank| {
            world_function(move |_app, world| async move {
                assert_eq!(world.group_size(), 3);
                assert_eq!(world.rank(), rank);
                let members: Vec<Rank> = world.group_members().into_iter().collect();
                assert_eq!(members, vec![0, 1, 2]);
                Ok(())
            })
        })
        .collect();
    run_ranks(functions);
}
