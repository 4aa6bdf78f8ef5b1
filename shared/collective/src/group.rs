use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::wire::{
    bytes_to_f32s, bytes_to_f64, bytes_to_u64, expect_frame, f32s_to_bytes, f64_to_bytes,
    u64_to_bytes, write_frame, CollectiveError, OP_ALL_GATHER, OP_ALL_REDUCE, OP_BARRIER, OP_JOIN,
    OP_LEAVE, OP_REDUCE_SCALAR,
};

pub const COORD_ADDR_ENV: &str = "CLASP_COORD_ADDR";
pub const COORD_PORT_ENV: &str = "CLASP_COORD_PORT";
pub const DEFAULT_COORD_ADDR: &str = "127.0.0.1";
pub const DEFAULT_COORD_PORT: u16 = 29450;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Coordinator endpoint for the collective group. Single-node only: the
/// default is localhost on a fixed port, overridable through
/// `CLASP_COORD_ADDR` / `CLASP_COORD_PORT`.
pub fn coordinator_addr_from_env() -> Result<SocketAddr, CollectiveError> {
    let host =
        std::env::var(COORD_ADDR_ENV).unwrap_or_else(|_| DEFAULT_COORD_ADDR.to_string());
    let port = match std::env::var(COORD_PORT_ENV) {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|_| CollectiveError::BadCoordinatorAddr(format!("{host}:{raw}")))?,
        Err(_) => DEFAULT_COORD_PORT,
    };
    format!("{host}:{port}")
        .parse()
        .map_err(|_| CollectiveError::BadCoordinatorAddr(format!("{host}:{port}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

/// Fixed-size group of worker processes on one node.
///
/// Rank 0 is the hub: it accepts one connection per peer rank at join time
/// and relays every collective. Streams are serialized behind mutexes so the
/// single-threaded trainer can call collectives through `&self`; the
/// position-sensitivity contract (identical call order on every rank) is the
/// caller's responsibility.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    links: Links,
    torn_down: AtomicBool,
}

#[derive(Debug)]
enum Links {
    /// world_size == 1: every collective is the identity.
    Solo,
    /// Rank 0; `peers[r - 1]` is the stream to rank `r`.
    Hub { peers: Vec<Mutex<TcpStream>> },
    /// Rank > 0; one stream to the hub.
    Spoke { hub: Mutex<TcpStream> },
}

impl ProcessGroup {
    /// Register this process into the group, blocking until all
    /// `world_size` members have joined or `timeout` elapses.
    ///
    /// Rank 0 binds `addr` and fails fast if the address is already taken
    /// (a colliding run). Other ranks retry the connection until the hub is
    /// up, then wait for the hub's group-complete acknowledgement.
    pub fn join(
        rank: usize,
        world_size: usize,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Self, CollectiveError> {
        if rank >= world_size {
            return Err(CollectiveError::InvalidRank { rank, world_size });
        }
        if world_size == 1 {
            return Ok(Self {
                rank,
                world_size,
                links: Links::Solo,
                torn_down: AtomicBool::new(false),
            });
        }

        let links = if rank == 0 {
            Links::Hub {
                peers: Self::accept_peers(world_size, addr, timeout)?,
            }
        } else {
            Links::Spoke {
                hub: Mutex::new(Self::connect_to_hub(rank, addr, timeout)?),
            }
        };
        debug!(rank, world_size, %addr, "process group formed");
        Ok(Self {
            rank,
            world_size,
            links,
            torn_down: AtomicBool::new(false),
        })
    }

    fn accept_peers(
        world_size: usize,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Vec<Mutex<TcpStream>>, CollectiveError> {
        let listener =
            TcpListener::bind(addr).map_err(|source| CollectiveError::Bind { addr, source })?;
        listener.set_nonblocking(true)?;

        let deadline = Instant::now() + timeout;
        let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
        let mut joined = 1; // ourselves
        while joined < world_size {
            if Instant::now() >= deadline {
                return Err(CollectiveError::JoinTimeout {
                    waited: timeout,
                    joined,
                    world_size,
                });
            }
            match listener.accept() {
                Ok((mut stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(remaining(deadline)))?;
                    let peer_rank =
                        bytes_to_u64(&expect_frame(&mut stream, OP_JOIN)?)? as usize;
                    if peer_rank == 0 || peer_rank >= world_size {
                        return Err(CollectiveError::InvalidRank {
                            rank: peer_rank,
                            world_size,
                        });
                    }
                    let slot = &mut slots[peer_rank - 1];
                    if slot.is_some() {
                        return Err(CollectiveError::DuplicateRank(peer_rank));
                    }
                    *slot = Some(stream);
                    joined += 1;
                    debug!(peer_rank, joined, world_size, "peer joined");
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Group is complete: release every spoke and drop the join deadline.
        let mut peers = Vec::with_capacity(world_size - 1);
        for slot in slots {
            let mut stream = slot.expect("all slots filled once joined == world_size");
            write_frame(&mut stream, OP_JOIN, &[])?;
            stream.set_read_timeout(None)?;
            peers.push(Mutex::new(stream));
        }
        Ok(peers)
    }

    fn connect_to_hub(
        rank: usize,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<TcpStream, CollectiveError> {
        let deadline = Instant::now() + timeout;
        let mut stream = loop {
            match TcpStream::connect_timeout(&addr, CONNECT_RETRY_INTERVAL) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(CONNECT_RETRY_INTERVAL);
                }
                Err(_) => {
                    return Err(CollectiveError::ConnectTimeout {
                        addr,
                        waited: timeout,
                    });
                }
            }
        };
        stream.set_nodelay(true)?;
        write_frame(&mut stream, OP_JOIN, &u64_to_bytes(rank as u64))?;
        // Block until the hub reports the group complete.
        stream.set_read_timeout(Some(remaining(deadline)))?;
        expect_frame(&mut stream, OP_JOIN)?;
        stream.set_read_timeout(None)?;
        Ok(stream)
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    fn check_live(&self) -> Result<(), CollectiveError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(CollectiveError::TornDown);
        }
        Ok(())
    }

    /// Block until every rank has reached this call.
    pub fn barrier(&self) -> Result<(), CollectiveError> {
        self.check_live()?;
        match &self.links {
            Links::Solo => Ok(()),
            Links::Hub { peers } => {
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    expect_frame(&mut stream, OP_BARRIER)?;
                }
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    write_frame(&mut stream, OP_BARRIER, &[])?;
                }
                Ok(())
            }
            Links::Spoke { hub } => {
                let mut stream = hub.lock().expect("hub stream lock");
                write_frame(&mut stream, OP_BARRIER, &[])?;
                expect_frame(&mut stream, OP_BARRIER)?;
                Ok(())
            }
        }
    }

    /// Element-wise reduction of `data` across all ranks, in place.
    /// Accumulates in f64 before casting back.
    pub fn all_reduce(&self, data: &mut [f32], op: ReduceOp) -> Result<(), CollectiveError> {
        self.check_live()?;
        match &self.links {
            Links::Solo => Ok(()),
            Links::Hub { peers } => {
                let mut acc: Vec<f64> = data.iter().map(|&v| v as f64).collect();
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    let payload = expect_frame(&mut stream, OP_ALL_REDUCE)?;
                    let values = bytes_to_f32s(&payload)?;
                    if values.len() != data.len() {
                        return Err(CollectiveError::LengthMismatch {
                            expected: data.len(),
                            got: values.len(),
                        });
                    }
                    merge(&mut acc, &values, op);
                }
                if op == ReduceOp::Mean {
                    let n = self.world_size as f64;
                    for v in &mut acc {
                        *v /= n;
                    }
                }
                for (dst, src) in data.iter_mut().zip(&acc) {
                    *dst = *src as f32;
                }
                let payload = f32s_to_bytes(data);
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    write_frame(&mut stream, OP_ALL_REDUCE, &payload)?;
                }
                Ok(())
            }
            Links::Spoke { hub } => {
                let mut stream = hub.lock().expect("hub stream lock");
                write_frame(&mut stream, OP_ALL_REDUCE, &f32s_to_bytes(data))?;
                let payload = expect_frame(&mut stream, OP_ALL_REDUCE)?;
                let values = bytes_to_f32s(&payload)?;
                if values.len() != data.len() {
                    return Err(CollectiveError::LengthMismatch {
                        expected: data.len(),
                        got: values.len(),
                    });
                }
                data.copy_from_slice(&values);
                Ok(())
            }
        }
    }

    /// Reduce a single scalar across all ranks and return the agreed value.
    /// With `ReduceOp::Mean` this is the sum over ranks divided by the world
    /// size. Full f64 precision end to end.
    pub fn all_reduce_scalar(&self, value: f64, op: ReduceOp) -> Result<f64, CollectiveError> {
        self.check_live()?;
        match &self.links {
            Links::Solo => Ok(value),
            Links::Hub { peers } => {
                let mut acc = value;
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    let v = bytes_to_f64(&expect_frame(&mut stream, OP_REDUCE_SCALAR)?)?;
                    acc = match op {
                        ReduceOp::Sum | ReduceOp::Mean => acc + v,
                        ReduceOp::Max => acc.max(v),
                    };
                }
                if op == ReduceOp::Mean {
                    acc /= self.world_size as f64;
                }
                let payload = f64_to_bytes(acc);
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    write_frame(&mut stream, OP_REDUCE_SCALAR, &payload)?;
                }
                Ok(acc)
            }
            Links::Spoke { hub } => {
                let mut stream = hub.lock().expect("hub stream lock");
                write_frame(&mut stream, OP_REDUCE_SCALAR, &f64_to_bytes(value))?;
                bytes_to_f64(&expect_frame(&mut stream, OP_REDUCE_SCALAR)?)
            }
        }
    }

    /// Concatenate each rank's `data` in rank order. Every rank must pass
    /// the same length; the result has `world_size * data.len()` values.
    pub fn all_gather(&self, data: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        self.check_live()?;
        match &self.links {
            Links::Solo => Ok(data.to_vec()),
            Links::Hub { peers } => {
                let mut gathered = vec![0f32; self.world_size * data.len()];
                gathered[..data.len()].copy_from_slice(data);
                for (index, peer) in peers.iter().enumerate() {
                    let mut stream = peer.lock().expect("peer stream lock");
                    let payload = expect_frame(&mut stream, OP_ALL_GATHER)?;
                    let values = bytes_to_f32s(&payload)?;
                    if values.len() != data.len() {
                        return Err(CollectiveError::LengthMismatch {
                            expected: data.len(),
                            got: values.len(),
                        });
                    }
                    let offset = (index + 1) * data.len();
                    gathered[offset..offset + data.len()].copy_from_slice(&values);
                }
                let payload = f32s_to_bytes(&gathered);
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    write_frame(&mut stream, OP_ALL_GATHER, &payload)?;
                }
                Ok(gathered)
            }
            Links::Spoke { hub } => {
                let mut stream = hub.lock().expect("hub stream lock");
                write_frame(&mut stream, OP_ALL_GATHER, &f32s_to_bytes(data))?;
                let payload = expect_frame(&mut stream, OP_ALL_GATHER)?;
                let values = bytes_to_f32s(&payload)?;
                if values.len() != self.world_size * data.len() {
                    return Err(CollectiveError::LengthMismatch {
                        expected: self.world_size * data.len(),
                        got: values.len(),
                    });
                }
                Ok(values)
            }
        }
    }

    /// Tear the group down. Must be called exactly once per process after
    /// all collective operations complete, on every exit path. Performs a
    /// final leave handshake so no rank closes a stream a peer is still
    /// reading, then shuts the sockets down.
    pub fn cleanup(&self) -> Result<(), CollectiveError> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Err(CollectiveError::TornDown);
        }
        match &self.links {
            Links::Solo => Ok(()),
            Links::Hub { peers } => {
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    expect_frame(&mut stream, OP_LEAVE)?;
                }
                for peer in peers {
                    let mut stream = peer.lock().expect("peer stream lock");
                    write_frame(&mut stream, OP_LEAVE, &[])?;
                    let _ = stream.shutdown(std::net::Shutdown::Both);
                }
                debug!(rank = self.rank, "process group torn down");
                Ok(())
            }
            Links::Spoke { hub } => {
                let mut stream = hub.lock().expect("hub stream lock");
                write_frame(&mut stream, OP_LEAVE, &[])?;
                expect_frame(&mut stream, OP_LEAVE)?;
                let _ = stream.shutdown(std::net::Shutdown::Both);
                debug!(rank = self.rank, "process group torn down");
                Ok(())
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::SeqCst) && !matches!(self.links, Links::Solo) {
            warn!(
                rank = self.rank,
                "process group dropped without cleanup(); peers may block on a dead stream"
            );
        }
    }
}

/// Time left until `deadline`, floored at 1ms: a zero read timeout is
/// rejected by the standard library.
fn remaining(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .max(Duration::from_millis(1))
}

fn merge(acc: &mut [f64], values: &[f32], op: ReduceOp) {
    for (a, &v) in acc.iter_mut().zip(values) {
        match op {
            ReduceOp::Sum | ReduceOp::Mean => *a += v as f64,
            ReduceOp::Max => *a = a.max(v as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    /// Run `f` on every rank of a freshly formed group, one thread per rank,
    /// and return the per-rank results in rank order.
    fn run_group<T, F>(world_size: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(usize, &ProcessGroup) -> T + Clone + Send + 'static,
    {
        let addr = free_addr();
        let handles: Vec<_> = (0..world_size)
            .map(|rank| {
                let f = f.clone();
                std::thread::spawn(move || {
                    let group =
                        ProcessGroup::join(rank, world_size, addr, Duration::from_secs(10))
                            .unwrap();
                    let out = f(rank, &group);
                    group.cleanup().unwrap();
                    out
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_scalar_mean_agrees_across_world_sizes() {
        for world_size in [1usize, 2, 4] {
            let results = run_group(world_size, |rank, group| {
                group
                    .all_reduce_scalar((rank + 1) as f64 * 1.5, ReduceOp::Mean)
                    .unwrap()
            });
            let expected =
                (1..=world_size).map(|r| r as f64 * 1.5).sum::<f64>() / world_size as f64;
            for value in results {
                assert!((value - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_scalar_sum() {
        let results = run_group(3, |rank, group| {
            group.all_reduce_scalar(rank as f64, ReduceOp::Sum).unwrap()
        });
        for value in results {
            assert_eq!(value, 3.0);
        }
    }

    #[test]
    fn test_vector_mean() {
        let results = run_group(2, |rank, group| {
            let mut data = vec![rank as f32, 10.0 * (rank + 1) as f32];
            group.all_reduce(&mut data, ReduceOp::Mean).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![0.5, 15.0]);
        }
    }

    #[test]
    fn test_vector_max() {
        let results = run_group(4, |rank, group| {
            let mut data = vec![rank as f32; 3];
            group.all_reduce(&mut data, ReduceOp::Max).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![3.0, 3.0, 3.0]);
        }
    }

    #[test]
    fn test_all_gather_is_rank_ordered() {
        let results = run_group(4, |rank, group| {
            group.all_gather(&[rank as f32, -(rank as f32)]).unwrap()
        });
        for data in results {
            assert_eq!(data, vec![0.0, -0.0, 1.0, -1.0, 2.0, -2.0, 3.0, -3.0]);
        }
    }

    #[test]
    fn test_barriers_do_not_deadlock() {
        run_group(3, |_, group| {
            for _ in 0..5 {
                group.barrier().unwrap();
            }
        });
    }

    #[test]
    fn test_solo_group_is_identity() {
        let group = ProcessGroup::join(0, 1, free_addr(), Duration::from_millis(100)).unwrap();
        assert_eq!(group.all_reduce_scalar(7.5, ReduceOp::Mean).unwrap(), 7.5);
        let mut data = vec![1.0, 2.0];
        group.all_reduce(&mut data, ReduceOp::Sum).unwrap();
        assert_eq!(data, vec![1.0, 2.0]);
        assert_eq!(group.all_gather(&data).unwrap(), data);
        group.barrier().unwrap();
        group.cleanup().unwrap();
    }

    #[test]
    fn test_join_times_out_when_a_peer_never_arrives() {
        let addr = free_addr();
        let err = ProcessGroup::join(0, 2, addr, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(
            err,
            CollectiveError::JoinTimeout {
                joined: 1,
                world_size: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_rank_is_rejected() {
        let err =
            ProcessGroup::join(2, 2, free_addr(), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, CollectiveError::InvalidRank { .. }));
    }

    #[test]
    fn test_collectives_fail_after_cleanup() {
        let group = ProcessGroup::join(0, 1, free_addr(), Duration::from_millis(100)).unwrap();
        group.cleanup().unwrap();
        assert!(matches!(
            group.all_reduce_scalar(1.0, ReduceOp::Sum),
            Err(CollectiveError::TornDown)
        ));
        assert!(matches!(group.cleanup(), Err(CollectiveError::TornDown)));
    }
}
