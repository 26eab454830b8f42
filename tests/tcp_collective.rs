use std::{
    net::{SocketAddr, TcpListener},
    num::NonZeroUsize,
    thread,
    time::{Duration, Instant},
};

use ddp_trainer::{Collective, RendezvousConfig, TcpCollective, TrainError};

/// Grabs a currently free localhost port. A small race window remains after
/// the probe listener drops, which is acceptable for tests.
fn free_addr() -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").unwrap();
    probe.local_addr().unwrap()
}

fn rendezvous(world_size: usize, addr: SocketAddr, timeout: Duration) -> RendezvousConfig {
    RendezvousConfig {
        world_size: NonZeroUsize::new(world_size).unwrap(),
        addr,
        join_timeout: timeout,
        sync_timeout: timeout,
    }
}

#[test]
fn two_ranks_reduce_and_synchronize() {
    let cfg = rendezvous(2, free_addr(), Duration::from_secs(10));

    let worker = {
        let cfg = cfg.clone();
        thread::spawn(move || {
            let mut collective = TcpCollective::new(1, &cfg).unwrap();
            collective.join().unwrap();

            let mut buf = vec![3.0, 4.0];
            collective.all_reduce_average(&mut buf).unwrap();
            collective.barrier().unwrap();

            let mut second = vec![10.0];
            collective.all_reduce_average(&mut second).unwrap();
            (buf, second)
        })
    };

    let mut coordinator = TcpCollective::new(0, &cfg).unwrap();
    coordinator.join().unwrap();

    let mut buf = vec![1.0, 2.0];
    coordinator.all_reduce_average(&mut buf).unwrap();
    assert_eq!(buf, vec![2.0, 3.0]);

    coordinator.barrier().unwrap();

    let mut second = vec![20.0];
    coordinator.all_reduce_average(&mut second).unwrap();
    assert_eq!(second, vec![15.0]);

    let (peer_buf, peer_second) = worker.join().unwrap();
    assert_eq!(peer_buf, vec![2.0, 3.0]);
    assert_eq!(peer_second, vec![15.0]);
}

#[test]
fn coordinator_join_times_out_without_peers() {
    let cfg = rendezvous(2, free_addr(), Duration::from_millis(200));
    let mut coordinator = TcpCollective::new(0, &cfg).unwrap();

    let start = Instant::now();
    let err = coordinator.join().unwrap_err();
    assert!(matches!(err, TrainError::JoinTimeout { .. }), "{err}");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn single_rank_world_needs_no_network() {
    // an unroutable address proves nothing is dialed
    let cfg = rendezvous(1, "192.0.2.1:1".parse().unwrap(), Duration::from_millis(200));
    let mut solo = TcpCollective::new(0, &cfg).unwrap();

    solo.join().unwrap();
    let mut buf = vec![1.0, 2.0];
    solo.all_reduce_average(&mut buf).unwrap();
    assert_eq!(buf, vec![1.0, 2.0]);
    solo.barrier().unwrap();
}
