use std::{
    io,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    runtime::Runtime,
    time::{sleep, timeout},
};

use super::Collective;
use crate::config::RendezvousConfig;
use crate::error::{Result, TrainError};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const KIND_CONTROL: Header = 1;
const KIND_GRADIENT: Header = 2;
const KIND_AVERAGE: Header = 3;

const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// Control frames for the rendezvous protocol.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
enum Command {
    Join { rank: usize, world_size: usize },
    JoinAck,
    Barrier,
    BarrierAck,
}

/// TCP-backed worker group.
///
/// Rank 0 is the coordinator: it binds the rendezvous address, accepts one
/// connection per peer rank, and drives every collective round (receive all
/// contributions, average, broadcast). Every other rank holds a single
/// connection to the coordinator.
///
/// The async plumbing is an implementation detail: an owned runtime is
/// `block_on`'d per operation so callers get the blocking semantics the
/// training loop expects, and `tokio::time::timeout` gives each operation a
/// hard deadline instead of an indefinite hang when a peer dies.
pub struct TcpCollective {
    rank: usize,
    world_size: usize,
    addr: SocketAddr,
    join_timeout: Duration,
    sync_timeout: Duration,
    runtime: Runtime,
    /// Coordinator: one stream per peer, indexed by `rank - 1`.
    /// Other ranks: a single stream to the coordinator.
    peers: Vec<TcpStream>,
    /// f32-backed receive buffer, so payload bytes are always 4-aligned for
    /// the cast back to floats.
    scratch: Vec<f32>,
}

impl TcpCollective {
    /// Creates the collective; no connections are made until `join`.
    ///
    /// # Panics
    /// If `rank` is out of range for the configured world size.
    pub fn new(rank: usize, rendezvous: &RendezvousConfig) -> io::Result<Self> {
        let world_size = rendezvous.world_size.get();
        assert!(rank < world_size, "rank out of range");

        Ok(Self {
            rank,
            world_size,
            addr: rendezvous.addr,
            join_timeout: rendezvous.join_timeout,
            sync_timeout: rendezvous.sync_timeout,
            runtime: Runtime::new()?,
            peers: Vec::new(),
            scratch: Vec::new(),
        })
    }
}

async fn write_frame(stream: &mut TcpStream, kind: Header, payload: &[u8]) -> io::Result<()> {
    let len = (payload.len() + HEADER_SIZE) as Header;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&kind.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

async fn write_control(stream: &mut TcpStream, cmd: &Command) -> io::Result<()> {
    let payload = serde_json::to_vec(cmd)?;
    write_frame(stream, KIND_CONTROL, &payload).await
}

/// Reads one frame into `scratch`, returning `(kind, payload bytes)`.
async fn read_frame(stream: &mut TcpStream, scratch: &mut Vec<f32>) -> io::Result<(Header, usize)> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await?;
    let len = Header::from_be_bytes(header) as usize;
    if len < HEADER_SIZE {
        return Err(bad_frame(format!("frame length {len} is too short")));
    }

    stream.read_exact(&mut header).await?;
    let kind = Header::from_be_bytes(header);

    let payload_len = len - HEADER_SIZE;
    scratch.resize(payload_len.div_ceil(size_of::<f32>()), 0.0);
    let bytes = &mut bytemuck::cast_slice_mut::<f32, u8>(scratch)[..payload_len];
    stream.read_exact(bytes).await?;

    Ok((kind, payload_len))
}

async fn read_control(stream: &mut TcpStream, scratch: &mut Vec<f32>) -> io::Result<Command> {
    let (kind, payload_len) = read_frame(stream, scratch).await?;
    if kind != KIND_CONTROL {
        return Err(bad_frame(format!("expected control frame, got kind {kind}")));
    }
    let bytes = &bytemuck::cast_slice::<f32, u8>(scratch)[..payload_len];
    serde_json::from_slice(bytes).map_err(|e| bad_frame(format!("bad control frame: {e}")))
}

fn bad_frame(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Coordinator side of `join`: accept and validate one connection per peer.
async fn accept_group(
    addr: SocketAddr,
    world_size: usize,
    scratch: &mut Vec<f32>,
) -> io::Result<Vec<TcpStream>> {
    let listener = TcpListener::bind(addr).await?;
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut pending = world_size - 1;

    while pending > 0 {
        let (mut stream, _) = listener.accept().await?;
        match read_control(&mut stream, scratch).await? {
            Command::Join { rank, world_size: peer_world } => {
                if peer_world != world_size {
                    return Err(bad_frame(format!(
                        "peer rank {rank} disagrees on world size: {peer_world} != {world_size}"
                    )));
                }
                if rank == 0 || rank >= world_size {
                    return Err(bad_frame(format!("peer announced invalid rank {rank}")));
                }
                if slots[rank - 1].is_some() {
                    return Err(bad_frame(format!("duplicate join for rank {rank}")));
                }
                slots[rank - 1] = Some(stream);
                pending -= 1;
            }
            other => {
                return Err(bad_frame(format!("expected join, got {other:?}")));
            }
        }
    }

    // every slot was filled above
    let mut peers = Vec::with_capacity(world_size - 1);
    for mut stream in slots.into_iter().flatten() {
        write_control(&mut stream, &Command::JoinAck).await?;
        peers.push(stream);
    }

    Ok(peers)
}

/// Worker side of `join`: dial the coordinator with bounded retry, announce
/// the rank, wait for the ack.
async fn join_group(
    addr: SocketAddr,
    rank: usize,
    world_size: usize,
    scratch: &mut Vec<f32>,
) -> io::Result<TcpStream> {
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            // the coordinator may not be listening yet
            Err(_) => sleep(CONNECT_RETRY).await,
        }
    };

    write_control(&mut stream, &Command::Join { rank, world_size }).await?;
    match read_control(&mut stream, scratch).await? {
        Command::JoinAck => Ok(stream),
        other => Err(bad_frame(format!("expected join ack, got {other:?}"))),
    }
}

impl Collective for TcpCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn join(&mut self) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        let Self {
            rank,
            world_size,
            addr,
            join_timeout,
            runtime,
            peers,
            scratch,
            ..
        } = self;

        let start = Instant::now();
        let joined = runtime.block_on(async {
            if *rank == 0 {
                timeout(*join_timeout, accept_group(*addr, *world_size, scratch)).await
            } else {
                timeout(*join_timeout, async {
                    join_group(*addr, *rank, *world_size, scratch)
                        .await
                        .map(|stream| vec![stream])
                })
                .await
            }
        });

        match joined {
            Ok(streams) => {
                *peers = streams?;
                Ok(())
            }
            Err(_) => Err(TrainError::JoinTimeout {
                waited: start.elapsed(),
            }),
        }
    }

    fn all_reduce_average(&mut self, buf: &mut [f32]) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        let Self {
            rank,
            world_size,
            sync_timeout,
            runtime,
            peers,
            scratch,
            ..
        } = self;

        let start = Instant::now();
        // the timeout's timer must be created inside the runtime
        let round = runtime.block_on(async {
            timeout(*sync_timeout, async {
                if *rank == 0 {
                    // gather
                    for peer in peers.iter_mut() {
                        let (kind, payload_len) = read_frame(peer, scratch).await?;
                        if kind != KIND_GRADIENT {
                            return Err(bad_frame(format!("expected gradient, got kind {kind}")));
                        }
                        let floats = payload_len / size_of::<f32>();
                        if floats != buf.len() || payload_len % size_of::<f32>() != 0 {
                            return Err(bad_frame(format!(
                                "gradient frame holds {floats} floats, expected {}",
                                buf.len()
                            )));
                        }
                        for (b, v) in buf.iter_mut().zip(&scratch[..floats]) {
                            *b += v;
                        }
                    }

                    let world = *world_size as f32;
                    for b in buf.iter_mut() {
                        *b /= world;
                    }

                    // broadcast
                    for peer in peers.iter_mut() {
                        write_frame(peer, KIND_AVERAGE, bytemuck::cast_slice(buf)).await?;
                    }
                    Ok(())
                } else {
                    let peer = &mut peers[0];
                    write_frame(peer, KIND_GRADIENT, bytemuck::cast_slice(buf)).await?;

                    let (kind, payload_len) = read_frame(peer, scratch).await?;
                    if kind != KIND_AVERAGE {
                        return Err(bad_frame(format!("expected average, got kind {kind}")));
                    }
                    if payload_len != buf.len() * size_of::<f32>() {
                        return Err(bad_frame(format!(
                            "average frame is {payload_len} bytes, expected {}",
                            buf.len() * size_of::<f32>()
                        )));
                    }
                    buf.copy_from_slice(&scratch[..buf.len()]);
                    Ok(())
                }
            })
            .await
        });

        match round {
            Ok(result) => Ok(result?),
            Err(_) => Err(TrainError::SyncStall {
                op: "gradient all-reduce",
                waited: start.elapsed(),
            }),
        }
    }

    fn barrier(&mut self) -> Result<()> {
        if self.world_size == 1 {
            return Ok(());
        }

        let Self {
            rank,
            sync_timeout,
            runtime,
            peers,
            scratch,
            ..
        } = self;

        let start = Instant::now();
        // the timeout's timer must be created inside the runtime
        let round = runtime.block_on(async {
            timeout(*sync_timeout, async {
                if *rank == 0 {
                    for peer in peers.iter_mut() {
                        match read_control(peer, scratch).await? {
                            Command::Barrier => {}
                            other => {
                                return Err(bad_frame(format!("expected barrier, got {other:?}")));
                            }
                        }
                    }
                    for peer in peers.iter_mut() {
                        write_control(peer, &Command::BarrierAck).await?;
                    }
                    Ok(())
                } else {
                    let peer = &mut peers[0];
                    write_control(peer, &Command::Barrier).await?;
                    match read_control(peer, scratch).await? {
                        Command::BarrierAck => Ok(()),
                        other => Err(bad_frame(format!("expected barrier ack, got {other:?}"))),
                    }
                }
            })
            .await
        });

        match round {
            Ok(result) => Ok(result?),
            Err(_) => Err(TrainError::SyncStall {
                op: "barrier",
                waited: start.elapsed(),
            }),
        }
    }
}
