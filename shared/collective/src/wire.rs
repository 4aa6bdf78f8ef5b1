//! Length-prefixed binary frames: `[u32 opcode][u64 payload len][payload]`,
//! all little-endian. Payloads carry raw f32/f64/u64 values.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;

pub(crate) const OP_JOIN: u32 = 1;
pub(crate) const OP_BARRIER: u32 = 2;
pub(crate) const OP_ALL_REDUCE: u32 = 3;
pub(crate) const OP_REDUCE_SCALAR: u32 = 4;
pub(crate) const OP_ALL_GATHER: u32 = 5;
pub(crate) const OP_LEAVE: u32 = 6;

#[derive(Debug, Error)]
pub enum CollectiveError {
    #[error("failed to bind coordinator address {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error(
        "timed out after {waited:?} waiting for the group to form: \
         {joined} of {world_size} ranks joined"
    )]
    JoinTimeout {
        waited: Duration,
        joined: usize,
        world_size: usize,
    },

    #[error("timed out after {waited:?} connecting to coordinator at {addr}")]
    ConnectTimeout { addr: SocketAddr, waited: Duration },

    #[error("two processes joined claiming rank {0}")]
    DuplicateRank(usize),

    #[error("rank {rank} is outside [0, {world_size})")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("peer sent opcode {got} where {expected} was expected")]
    UnexpectedOpcode { expected: u32, got: u32 },

    #[error("payload length mismatch: expected {expected} values, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("collective operation issued after the group was torn down")]
    TornDown,

    #[error("invalid coordinator address in environment: {0}")]
    BadCoordinatorAddr(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub(crate) fn write_frame(
    stream: &mut TcpStream,
    op: u32,
    payload: &[u8],
) -> Result<(), CollectiveError> {
    stream.write_all(&op.to_le_bytes())?;
    stream.write_all(&(payload.len() as u64).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_frame(stream: &mut TcpStream) -> Result<(u32, Vec<u8>), CollectiveError> {
    let mut op_buf = [0u8; 4];
    stream.read_exact(&mut op_buf)?;
    let mut len_buf = [0u8; 8];
    stream.read_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok((u32::from_le_bytes(op_buf), payload))
}

/// Read one frame and insist on its opcode.
pub(crate) fn expect_frame(
    stream: &mut TcpStream,
    expected: u32,
) -> Result<Vec<u8>, CollectiveError> {
    let (op, payload) = read_frame(stream)?;
    if op != expected {
        return Err(CollectiveError::UnexpectedOpcode { expected, got: op });
    }
    Ok(payload)
}

pub(crate) fn f32s_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

pub(crate) fn bytes_to_f32s(bytes: &[u8]) -> Result<Vec<f32>, CollectiveError> {
    if bytes.len() % 4 != 0 {
        return Err(CollectiveError::LengthMismatch {
            expected: bytes.len() / 4,
            got: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub(crate) fn f64_to_bytes(value: f64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub(crate) fn bytes_to_f64(bytes: &[u8]) -> Result<f64, CollectiveError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CollectiveError::LengthMismatch {
            expected: 1,
            got: bytes.len() / 8,
        })?;
    Ok(f64::from_le_bytes(arr))
}

pub(crate) fn u64_to_bytes(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub(crate) fn bytes_to_u64(bytes: &[u8]) -> Result<u64, CollectiveError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CollectiveError::LengthMismatch {
            expected: 1,
            got: bytes.len() / 8,
        })?;
    Ok(u64::from_le_bytes(arr))
}
