//! Sparse count exchange driven by a to-peers/from-peers bitmap (§4.3).
//!
//! Grounded in `original_source/comm/include/comm-patterns.hpp`'s
//! `SomeToSome<T>` and, for the rsmpi non-blocking call shapes, the
//! multi-request pattern in `rsmpi-rsmpi/examples/immediate_multiple_requests.rs`.

use mpi::request::{multiple_scope, RequestCollection};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::diagnostics::{Error, Result};
use crate::tags::SOME_TO_SOME;

/// `recv[r] = send[r]` for every `r` with `from_peers[r]`, and sends
/// `send[r]` to every `r` with `to_peers[r]`. Replaces an O(comm_size)
/// dense all-to-all with O(neighbours) messages when the peer set is known
/// in advance (typically via [`crate::addressing::flag_pes`]).
pub fn exchange(comm: &SimpleCommunicator, to_peers: &[bool], from_peers: &[bool], send: &[i32], recv: &mut [i32]) -> Result<()> {
    let size = comm.size() as usize;
    if to_peers.len() != size || from_peers.len() != size || send.len() != size || recv.len() != size {
        return Err(Error::precondition(format!(
            "SomeToSome buffers must all have length comm_size ({size})"
        )));
    }

    let self_rank = comm.rank() as usize;
    if from_peers[self_rank] {
        recv[self_rank] = send[self_rank];
    }

    let recv_peers: Vec<usize> = from_peers
        .iter()
        .enumerate()
        .filter(|&(peer, &want)| peer != self_rank && want)
        .map(|(peer, _)| peer)
        .collect();
    let send_peers: Vec<usize> = to_peers
        .iter()
        .enumerate()
        .filter(|&(peer, &want)| peer != self_rank && want)
        .map(|(peer, _)| peer)
        .collect();

    let mut recv_values = vec![0i32; recv_peers.len()];

    multiple_scope(recv_peers.len() + send_peers.len(), |scope, coll: &mut RequestCollection<i32>| {
        // One mutable reference per `iter_mut()` step, not a re-indexed
        // `&mut recv_values[slot]` per iteration — the latter re-borrows the
        // same `Vec` on every pass and the borrow checker can't see that the
        // resulting borrows (each held alive by its own request in `coll`)
        // are disjoint.
        for (&peer, value) in recv_peers.iter().zip(recv_values.iter_mut()) {
            let req = comm.process_at_rank(peer as i32).immediate_receive_into_with_tag(scope, value, SOME_TO_SOME);
            coll.add(req);
        }

        for &peer in &send_peers {
            let req = comm
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(scope, &send[peer], SOME_TO_SOME);
            coll.add(req);
        }

        while coll.incomplete() > 0 {
            coll.wait_any();
        }
    });

    for (&peer, &value) in recv_peers.iter().zip(recv_values.iter()) {
        recv[peer] = value;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    // Exercising `exchange` requires a real multi-rank communicator;
    // covered by `tests/token_exchange.rs`, run under `mpirun` the way
    // rsmpi's own examples are.
}
