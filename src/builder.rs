//! `TokenBuilder` (§4.4): resolves addresses, negotiates per-peer counts,
//! runs the index handshake, and produces a [`Token`].
//!
//! Grounded in `original_source/comm/src/comm-token.cpp`'s
//! `TokenBuilder::BuildLocal`/`BuildGlobal`.

use std::sync::Arc;

use mpi::request::{multiple_scope, RequestCollection};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::addressing::{self, BaseTable};
use crate::diagnostics::{Error, Result};
use crate::rma::RmaAllToAll;
use crate::some_to_some;
use crate::tags::BUILD_GLOBAL;
use crate::token::{CopyPlan, Segment, Token};
use crate::types::{GlobalIndex, LocalIndex, OptionalGlobalIndex, OptionalLocalIndex, OptionalRankId, RankId};

/// Mutable configuration consumed by `build_global`/`build_local` to
/// produce one or more [`Token`]s. Cheap to clone; the `BaseTable` is
/// shared by reference (`Arc`) across Tokens built from the same builder,
/// per the Design Notes' guidance against a Cells/KidMom back-pointer.
#[derive(Clone)]
pub struct TokenBuilder<'c> {
    comm: &'c SimpleCommunicator,
    bases: Option<Arc<BaseTable>>,
    to_peers: Option<Vec<bool>>,
    from_peers: Option<Vec<bool>>,
    max_recv_scratch_bytes: Option<usize>,
    require_rank_order_completion: bool,
    use_rma: bool,
}

impl<'c> TokenBuilder<'c> {
    pub fn comm(&self) -> &'c SimpleCommunicator {
        self.comm
    }

    pub fn from_comm(comm: &'c SimpleCommunicator) -> Self {
        TokenBuilder {
            comm,
            bases: None,
            to_peers: None,
            from_peers: None,
            max_recv_scratch_bytes: None,
            require_rank_order_completion: false,
            use_rma: false,
        }
    }

    /// Collective: all-gathers the local cell count and rebuilds the
    /// `BaseTable` from the resulting per-rank counts.
    pub fn set_num_cells(&mut self, local_count: u32) -> Result<()> {
        let size = self.comm.size() as usize;
        let mut counts = vec![0u32; size];
        self.comm.all_gather_into(&local_count, &mut counts[..]);
        self.bases = Some(Arc::new(BaseTable::from_counts(&counts)));
        Ok(())
    }

    /// Not collective: adopts an externally computed `BaseTable` (length
    /// `comm_size`, see `addressing` for the resolved length convention).
    pub fn set_cell_bases(&mut self, bases: Vec<GlobalIndex>) {
        self.bases = Some(Arc::new(BaseTable::from_bases(bases)));
    }

    pub fn use_rma_all_to_all(&mut self) {
        self.use_rma = true;
    }

    pub fn disable_rma_all_to_all(&mut self) {
        self.use_rma = false;
    }

    /// Not collective: records the caller's outgoing neighbour bitmap, then
    /// derives `from_peers` with a dense all-to-all on `to` — `to_peers`
    /// is known locally, but whether a given peer will push data *to* self
    /// can only be learned from that peer.
    pub fn set_to_pes(&mut self, to: Vec<bool>) -> Result<()> {
        let size = self.comm.size() as usize;
        if to.len() != size {
            return Err(Error::precondition(format!("to_peers must have length comm_size ({size})")));
        }
        let send: Vec<u8> = to.iter().map(|&b| b as u8).collect();
        let mut recv = vec![0u8; size];
        self.comm.all_to_all_into(&send, &mut recv[..]);
        self.from_peers = Some(recv.iter().map(|&b| b != 0).collect());
        self.to_peers = Some(to);
        Ok(())
    }

    /// Not collective: records both bitmaps without communication.
    pub fn set_to_and_from_pes(&mut self, to: Vec<bool>, from: Vec<bool>) -> Result<()> {
        let size = self.comm.size() as usize;
        if to.len() != size || from.len() != size {
            return Err(Error::precondition(format!("to/from_peers must have length comm_size ({size})")));
        }
        self.to_peers = Some(to);
        self.from_peers = Some(from);
        Ok(())
    }

    pub fn clear_to_and_from_pes(&mut self) {
        self.to_peers = None;
        self.from_peers = None;
    }

    pub fn set_max_gs_receive_size(&mut self, bytes: usize) {
        self.max_recv_scratch_bytes = Some(bytes);
    }

    pub fn clear_max_gs_receive_size(&mut self) {
        self.max_recv_scratch_bytes = None;
    }

    pub fn require_rank_order_request_completion(&mut self, require: bool) {
        self.require_rank_order_completion = require;
    }

    fn bases(&self) -> Result<&BaseTable> {
        self.bases.as_deref().ok_or_else(|| Error::precondition("TokenBuilder has no BaseTable; call set_num_cells or set_cell_bases first"))
    }

    /// Vectorised §4.1 resolution.
    pub fn pes_and_addresses(
        &self,
        away_globals: &[OptionalGlobalIndex],
        out_pes: &mut [OptionalRankId],
        out_addrs: &mut [OptionalLocalIndex],
    ) -> Result<()> {
        addressing::pes_and_addresses(self.bases()?, away_globals, out_pes, out_addrs)
    }

    /// ORs `1` into `flags[owner(g)]` for each non-null `g`.
    pub fn flag_pes(&self, away_globals: &[OptionalGlobalIndex], flags: &mut [bool]) -> Result<()> {
        addressing::flag_pes(self.bases()?, away_globals, flags)
    }

    /// Collective: resolves `away_globals` to `(rank, local)` pairs, then
    /// calls [`TokenBuilder::build_local`].
    pub fn build_global(&self, home_addresses: &[LocalIndex], away_globals: &[OptionalGlobalIndex]) -> Result<Token<'c>> {
        if home_addresses.len() != away_globals.len() {
            return Err(Error::precondition("home_addresses and away_globals must have the same length"));
        }
        let mut away_pe = vec![OptionalRankId::NONE; away_globals.len()];
        let mut away_address = vec![OptionalLocalIndex::NONE; away_globals.len()];
        self.pes_and_addresses(away_globals, &mut away_pe, &mut away_address)?;
        self.build_local(home_addresses, &away_pe, &away_address)
    }

    /// Collective: the main build algorithm (§4.4).
    pub fn build_local(&self, home_addresses: &[LocalIndex], away_pe: &[OptionalRankId], away_address: &[OptionalLocalIndex]) -> Result<Token<'c>> {
        let _span = tracing::info_span!("token_build_local", n = home_addresses.len()).entered();

        let n = home_addresses.len();
        if away_pe.len() != n || away_address.len() != n {
            return Err(Error::precondition("home_addresses, away_pe, and away_address must all have the same length"));
        }

        let size = self.comm.size() as usize;
        let self_rank = self.comm.rank();

        // Step 1: count per peer, excluding self (same-rank traffic is
        // handled by CopyPlan below).
        let mut count_to = vec![0i32; size];
        for i in 0..n {
            if let (Some(pe), Some(_)) = (away_pe[i].get(), away_address[i].get()) {
                if pe.get() != self_rank {
                    count_to[pe.as_usize()] += 1;
                }
            }
        }

        // Step 3: exchange counts. (Step 2's local CopyPlan is computed
        // once, alongside the segment tables, in `build_local_with_counts`
        // below — it's shared with the RMA-negotiated path.)
        let mut count_from = vec![0i32; size];
        if let (Some(to), Some(from)) = (&self.to_peers, &self.from_peers) {
            some_to_some::exchange(self.comm, to, from, &count_to, &mut count_from)?;
        } else if self.use_rma {
            return Err(Error::precondition(
                "RMA count exchange requires a caller-owned RmaAllToAll instance; use build_local_with_rma",
            ));
        } else {
            self.comm.all_to_all_into(&count_to, &mut count_from[..]);
        }

        self.build_local_with_counts(home_addresses, away_pe, away_address, count_to, count_from)
    }

    /// Variant of [`TokenBuilder::build_local`] that negotiates counts
    /// through a caller-owned [`RmaAllToAll`] instead of a dense
    /// `all_to_all`. Kept separate because the RMA primitive's lifetime is
    /// owned by the caller, not the builder (§5: one `RmaAllToAll` instance
    /// must not have two calls interleaved on it).
    pub fn build_local_with_rma(
        &self,
        home_addresses: &[LocalIndex],
        away_pe: &[OptionalRankId],
        away_address: &[OptionalLocalIndex],
        rma: &mut RmaAllToAll<'c>,
    ) -> Result<Token<'c>> {
        if !self.use_rma {
            return Err(Error::precondition("build_local_with_rma called without use_rma_all_to_all()"));
        }
        let size = self.comm.size() as usize;
        let mut count_to = vec![0i32; size];
        for (pe, addr) in away_pe.iter().zip(away_address.iter()) {
            if let (Some(pe), Some(_)) = (pe.get(), addr.get()) {
                if pe.get() != self.comm.rank() {
                    count_to[pe.as_usize()] += 1;
                }
            }
        }
        let mut count_from = vec![0i32; size];
        rma.all_to_all(&count_to, &mut count_from)?;

        // Re-run the rest of build_local's algorithm with the externally
        // negotiated counts, by delegating through a count-aware private
        // helper that both paths share.
        self.build_local_with_counts(home_addresses, away_pe, away_address, count_to, count_from)
    }

    fn build_local_with_counts(
        &self,
        home_addresses: &[LocalIndex],
        away_pe: &[OptionalRankId],
        away_address: &[OptionalLocalIndex],
        count_to: Vec<i32>,
        count_from: Vec<i32>,
    ) -> Result<Token<'c>> {
        let self_rank = self.comm.rank();
        let n = home_addresses.len();

        let mut copy_plan = CopyPlan::default();
        for i in 0..n {
            match (away_pe[i].get(), away_address[i].get()) {
                (Some(pe), Some(addr)) if pe.get() == self_rank => {
                    copy_plan.copy_from.push(addr.as_usize());
                    copy_plan.copy_to.push(home_addresses[i].as_usize());
                }
                (None, _) | (_, None) => {
                    copy_plan.zero.push(home_addresses[i].as_usize());
                }
                _ => {}
            }
        }

        let home_segments = build_segments(&count_to, self_rank);
        let away_segments = build_segments(&count_from, self_rank);
        let home_size: usize = home_segments.iter().map(|s| s.length).sum();
        let away_size: usize = away_segments.iter().map(|s| s.length).sum();

        let mut wire_index = vec![0u32; home_size];
        let mut home_index = vec![LocalIndex::new(0); home_size];
        let mut cursors: Vec<usize> = home_segments.iter().map(|s| s.begin).collect();
        let peer_to_segment: Vec<Option<usize>> = (0..count_to.len())
            .map(|p| home_segments.iter().position(|s| s.rank.as_usize() == p))
            .collect();

        for i in 0..n {
            if let (Some(pe), Some(addr)) = (away_pe[i].get(), away_address[i].get()) {
                if pe.get() == self_rank {
                    continue;
                }
                let seg_idx = peer_to_segment[pe.as_usize()].ok_or_else(|| Error::logic("count_to/peer mismatch during index handshake"))?;
                let cursor = cursors[seg_idx];
                wire_index[cursor] = addr.get();
                home_index[cursor] = home_addresses[i];
                cursors[seg_idx] = cursor + 1;
            }
        }

        let mut away_wire = vec![0u32; away_size];
        // `away_segments` is built by `build_segments` with ascending,
        // gap-free `begin`s, so a straight sequence of `split_at_mut` calls
        // carves one disjoint receive slice per segment — each escapes the
        // loop below into `coll` for the closure's lifetime, so indexing
        // `away_wire` by runtime range per iteration won't borrow-check.
        let mut away_slices: Vec<&mut [u32]> = Vec::with_capacity(away_segments.len());
        {
            let mut remaining: &mut [u32] = &mut away_wire[..];
            for segment in &away_segments {
                let (slice, rest) = remaining.split_at_mut(segment.length);
                away_slices.push(slice);
                remaining = rest;
            }
        }

        multiple_scope(home_segments.len() + away_segments.len(), |scope, coll: &mut RequestCollection<[u32]>| {
            for (segment, slice) in away_segments.iter().zip(away_slices.into_iter()) {
                let req = self.comm.process_at_rank(segment.rank.get()).immediate_receive_into_with_tag(scope, slice, BUILD_GLOBAL);
                coll.add(req);
            }
            for segment in &home_segments {
                let slice = &wire_index[segment.begin..segment.begin + segment.length];
                let req = self.comm.process_at_rank(segment.rank.get()).immediate_send_with_tag(scope, slice, BUILD_GLOBAL);
                coll.add(req);
            }
            while coll.incomplete() > 0 {
                coll.wait_any();
            }
        });

        let away_index: Vec<LocalIndex> = away_wire.into_iter().map(LocalIndex::new).collect();

        let min_gather_size = 1 + home_addresses.iter().map(|a| a.as_usize()).max().unwrap_or(0);
        let min_scatter_size = 1 + copy_plan.copy_from.iter().copied().chain(away_index.iter().map(|a| a.as_usize())).max().unwrap_or(0);

        Ok(Token::new(
            self.comm,
            min_gather_size,
            min_scatter_size,
            copy_plan,
            home_segments,
            home_index,
            away_segments,
            away_index,
            self.max_recv_scratch_bytes,
            self.require_rank_order_completion,
        ))
    }
}

/// Scans ranks in ascending order, emitting one [`Segment`] per rank with a
/// non-zero count (excluding `self_rank`), with contiguous, disjoint spans.
fn build_segments(counts: &[i32], self_rank: i32) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut running = 0usize;
    for (rank, &count) in counts.iter().enumerate() {
        if rank as i32 == self_rank || count <= 0 {
            continue;
        }
        segments.push(Segment { rank: RankId::new(rank as i32), begin: running, length: count as usize });
        running += count as usize;
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_segments_skips_self_and_empty() {
        let counts = vec![3, 0, 5, 2];
        let segments = build_segments(&counts, 1);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment { rank: RankId::new(0), begin: 0, length: 3 });
        assert_eq!(segments[1], Segment { rank: RankId::new(2), begin: 3, length: 5 });
        assert_eq!(segments[2], Segment { rank: RankId::new(3), begin: 8, length: 2 });
    }

    #[test]
    fn copy_plan_matches_scenario_6() {
        // spec.md §8 scenario 6
        let home: Vec<LocalIndex> = (0..8).map(LocalIndex::new).collect();
        let away_pe: Vec<OptionalRankId> = [0, 0, 1, 1, 2, 2, 3, 3].iter().map(|&r| OptionalRankId::some(RankId::new(r))).collect();
        let away_address: Vec<OptionalLocalIndex> = [6u32, 9, 2, 8, 3, 7, 4, 9].iter().map(|&a| OptionalLocalIndex::some(LocalIndex::new(a))).collect();
        let self_rank = 2;

        let mut copy_plan = CopyPlan::default();
        for i in 0..8 {
            match (away_pe[i].get(), away_address[i].get()) {
                (Some(pe), Some(addr)) if pe.get() == self_rank => {
                    copy_plan.copy_from.push(addr.as_usize());
                    copy_plan.copy_to.push(home[i].as_usize());
                }
                (None, _) | (_, None) => copy_plan.zero.push(home[i].as_usize()),
                _ => {}
            }
        }

        assert_eq!(copy_plan.copy_from, vec![3, 7]);
        assert_eq!(copy_plan.copy_to, vec![4, 5]);
        assert!(copy_plan.zero.is_empty());
    }
}
