//! Generic alltoallv-style bulk relocation (§4.7), shared by `ReconMove`.
//!
//! Grounded in `original_source/mesh/src/mesh-kidmom.cpp`'s `ReconMove` and
//! the `Move<T>` primitive it's built on
//! (`comm/include/comm-patterns.hpp`).

use mpi::request::{multiple_scope, RequestCollection};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::diagnostics::{Error, Result};
use crate::tags::MOVE;
use crate::token::TokenElement;

/// Relocates `send_data` into `recv_data` according to per-peer
/// `send_start/send_length` and `recv_start/recv_length` descriptors (each
/// of length `comm_size`). Self-traffic is a plain slice copy; everything
/// else is one `isend`/`irecv` pair per non-self peer with nonzero length.
///
/// `send_data` and `recv_data` must not alias — the original source
/// materialises a read-only shadow of the source before starting for the
/// same reason; here that's enforced structurally by taking disjoint `&`
/// and `&mut` borrows.
pub fn move_data<T: TokenElement>(
    comm: &SimpleCommunicator,
    send_start: &[usize],
    send_length: &[usize],
    send_data: &[T],
    recv_start: &[usize],
    recv_length: &[usize],
    recv_data: &mut [T],
) -> Result<()> {
    let size = comm.size() as usize;
    if send_start.len() != size || send_length.len() != size || recv_start.len() != size || recv_length.len() != size {
        return Err(Error::precondition(format!("Move descriptor arrays must all have length comm_size ({size})")));
    }

    let self_rank = comm.rank() as usize;
    if send_length[self_rank] != recv_length[self_rank] {
        return Err(Error::precondition("Move requires send_length[self] == recv_length[self]"));
    }

    if send_length[self_rank] > 0 {
        let s = send_start[self_rank];
        let l = send_length[self_rank];
        let r = recv_start[self_rank];
        recv_data[r..r + l].copy_from_slice(&send_data[s..s + l]);
    }

    let send_peers: Vec<usize> = (0..size).filter(|&p| p != self_rank && send_length[p] > 0).collect();
    let recv_peers: Vec<usize> = (0..size).filter(|&p| p != self_rank && recv_length[p] > 0).collect();

    multiple_scope(send_peers.len() + recv_peers.len(), |scope, coll: &mut RequestCollection<[T]>| {
        let mut recv_slices: Vec<&mut [T]> = Vec::new();
        let mut remaining: &mut [T] = recv_data;
        let mut cursor = 0usize;
        for &peer in &recv_peers {
            let start = recv_start[peer];
            let length = recv_length[peer];
            let gap = start - cursor;
            let (_skip, rest) = remaining.split_at_mut(gap);
            let (slice, rest) = rest.split_at_mut(length);
            recv_slices.push(slice);
            remaining = rest;
            cursor = start + length;
        }

        for (slot, &peer) in recv_peers.iter().enumerate() {
            let req = comm.process_at_rank(peer as i32).immediate_receive_into_with_tag(scope, recv_slices[slot], MOVE);
            coll.add(req);
        }
        for &peer in &send_peers {
            let s = send_start[peer];
            let l = send_length[peer];
            let req = comm.process_at_rank(peer as i32).immediate_send_with_tag(scope, &send_data[s..s + l], MOVE);
            coll.add(req);
        }

        while coll.incomplete() > 0 {
            coll.wait_any();
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    // `move_data` needs a real multi-rank communicator; covered by
    // `tests/token_exchange.rs`, run under `mpirun` the way rsmpi's own
    // examples are.
}
