//! AMR-aware kid↔mother token pools (§4.6).
//!
//! Grounded in `original_source/mesh/include/mesh-kidmom.hpp` and
//! `mesh/src/mesh-kidmom.cpp` (`BuildTop`, `BuildPack`, `KidMomBuild`,
//! `MomKidBuild`, `MomKidsBuild`, `ResetMothersAndDaughters[New]`).
//!
//! Daughter siblings (`mom_kids_token_[L][i]`) are addressed as
//! `cell_daughter[l] + i`: the original source lays a mother's `2^num_dims`
//! daughters out at contiguous global ids starting at the first daughter,
//! which is the only assumption that makes `mom_kids_build` representable
//! from the single `cell_daughter` field this crate's data model keeps (see
//! DESIGN.md).

use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::builder::TokenBuilder;
use crate::diagnostics::Result;
use crate::token::{Token, TokenOperation};
use crate::types::{GlobalIndex, LocalIndex, OptionalGlobalIndex};

/// Per-family switch for routing a level's count exchange through
/// [`crate::some_to_some`] instead of a dense all-to-all — restores
/// `mesh-kidmom.hpp`'s `KidMomOptions`, which the distilled spec only
/// alludes to as "optionally pre-flagging neighbour peers".
#[derive(Debug, Clone, Copy, Default)]
pub struct KidMomOptions {
    pub kid_mom_use_s2s: bool,
    pub mom_kid_use_s2s: bool,
    pub mom_kids_use_s2s: bool,
}

/// Per-rank AMR bookkeeping: mother/daughter tables, a level-indexed
/// partitioning of local cells, and one Token pool per level per
/// direction.
pub struct KidMom<'c> {
    num_dims: usize,
    cell_mother: Vec<OptionalGlobalIndex>,
    cell_daughter: Vec<OptionalGlobalIndex>,
    ltop: Vec<LocalIndex>,
    lpoint: Vec<LocalIndex>,
    lopack: Vec<usize>,
    kid_tokens: Vec<Token<'c>>,
    mom_tokens: Vec<Token<'c>>,
    mom_kids_tokens: Vec<Vec<Token<'c>>>,
}

impl<'c> KidMom<'c> {
    pub fn new(num_dims: usize, num_local_cells: usize) -> Self {
        KidMom {
            num_dims,
            cell_mother: vec![OptionalGlobalIndex::NONE; num_local_cells],
            cell_daughter: vec![OptionalGlobalIndex::NONE; num_local_cells],
            ltop: Vec::new(),
            lpoint: Vec::new(),
            lopack: Vec::new(),
            kid_tokens: Vec::new(),
            mom_tokens: Vec::new(),
            mom_kids_tokens: Vec::new(),
        }
    }

    pub fn cell_mother(&self) -> &[OptionalGlobalIndex] {
        &self.cell_mother
    }

    pub fn cell_daughter(&self) -> &[OptionalGlobalIndex] {
        &self.cell_daughter
    }

    pub fn set_cell_mother(&mut self, l: LocalIndex, mother: OptionalGlobalIndex) {
        self.cell_mother[l.as_usize()] = mother;
    }

    pub fn set_cell_daughter(&mut self, l: LocalIndex, daughter: OptionalGlobalIndex) {
        self.cell_daughter[l.as_usize()] = daughter;
    }

    pub fn num_levels(&self) -> usize {
        self.lopack.len().saturating_sub(1)
    }

    pub fn cells_at_level(&self, level: usize) -> &[LocalIndex] {
        &self.lpoint[self.lopack[level]..self.lopack[level + 1]]
    }

    /// Leaf cells (no daughter) — the compact list a kid/mom exchange
    /// participates with. Grounded in `mesh-kidmom.cpp`'s `IsTop`/`BuildTop`.
    pub fn ltop(&self) -> &[LocalIndex] {
        &self.ltop
    }

    pub fn build_top(&mut self) {
        self.ltop = (0..self.cell_daughter.len())
            .filter(|&l| self.cell_daughter[l].get().is_none())
            .map(|l| LocalIndex::new(l as u32))
            .collect();
    }

    /// Computes `num_levels` (globally reduced), per-level counts, the
    /// `lopack` prefix sum, and the `lpoint` stable bucket-sort.
    pub fn build_pack(&mut self, comm: &SimpleCommunicator, cell_level: &[u32]) -> Result<()> {
        let local_max = cell_level.iter().copied().max().unwrap_or(0);
        let mut global_max = 0u32;
        comm.all_reduce_into(&local_max, &mut global_max, mpi::collective::SystemOperation::max());
        let num_levels = global_max as usize + 1;

        let mut counts = vec![0usize; num_levels];
        for &level in cell_level {
            counts[level as usize] += 1;
        }

        let mut lopack = Vec::with_capacity(num_levels + 1);
        let mut running = 0usize;
        for &count in &counts {
            lopack.push(running);
            running += count;
        }
        lopack.push(running);

        let mut cursors = lopack[..num_levels].to_vec();
        let mut lpoint = vec![LocalIndex::new(0); cell_level.len()];
        for (l, &level) in cell_level.iter().enumerate() {
            let cursor = &mut cursors[level as usize];
            lpoint[*cursor] = LocalIndex::new(l as u32);
            *cursor += 1;
        }

        self.lopack = lopack;
        self.lpoint = lpoint;
        Ok(())
    }

    fn maybe_flag(&self, template: &TokenBuilder<'c>, away_globals: &[OptionalGlobalIndex], use_s2s: bool) -> Result<TokenBuilder<'c>> {
        let mut builder = template.clone();
        if use_s2s {
            let mut flags = vec![false; template.comm().size() as usize];
            template.flag_pes(away_globals, &mut flags)?;
            builder.set_to_pes(flags)?;
        }
        Ok(builder)
    }

    /// Builds `kid_token_[L]` for every level: home = itself, away = its
    /// mother.
    pub fn kid_mom_build(&mut self, template: &TokenBuilder<'c>, options: &KidMomOptions) -> Result<()> {
        let _span = tracing::info_span!("kidmom_kid_mom_build").entered();
        self.kid_tokens.clear();
        for level in 0..self.num_levels() {
            let cells = self.cells_at_level(level).to_vec();
            let home_addresses = cells.clone();
            let away_globals: Vec<OptionalGlobalIndex> = cells.iter().map(|&l| self.cell_mother[l.as_usize()]).collect();
            let builder = self.maybe_flag(template, &away_globals, options.kid_mom_use_s2s)?;
            self.kid_tokens.push(builder.build_global(&home_addresses, &away_globals)?);
        }
        Ok(())
    }

    /// Builds `mom_token_[L]` for every level: home = itself, away = first
    /// daughter. Only cells that have a daughter participate.
    pub fn mom_kid_build(&mut self, template: &TokenBuilder<'c>, options: &KidMomOptions) -> Result<()> {
        let _span = tracing::info_span!("kidmom_mom_kid_build").entered();
        self.mom_tokens.clear();
        for level in 0..self.num_levels() {
            let (home_addresses, away_globals) = self.moms_at_level(level, 0);
            let builder = self.maybe_flag(template, &away_globals, options.mom_kid_use_s2s)?;
            self.mom_tokens.push(builder.build_global(&home_addresses, &away_globals)?);
        }
        Ok(())
    }

    /// Builds `mom_kids_token_[L][i]` for every level and every daughter
    /// slot `0 <= i < 2^num_dims`.
    pub fn mom_kids_build(&mut self, template: &TokenBuilder<'c>, options: &KidMomOptions) -> Result<()> {
        let _span = tracing::info_span!("kidmom_mom_kids_build").entered();
        let num_daughters = 1usize << self.num_dims;
        self.mom_kids_tokens.clear();
        for level in 0..self.num_levels() {
            let mut per_slot = Vec::with_capacity(num_daughters);
            for slot in 0..num_daughters {
                let (home_addresses, away_globals) = self.moms_at_level(level, slot as u64);
                let builder = self.maybe_flag(template, &away_globals, options.mom_kids_use_s2s)?;
                per_slot.push(builder.build_global(&home_addresses, &away_globals)?);
            }
            self.mom_kids_tokens.push(per_slot);
        }
        Ok(())
    }

    fn moms_at_level(&self, level: usize, daughter_offset: u64) -> (Vec<LocalIndex>, Vec<OptionalGlobalIndex>) {
        let mut home = Vec::new();
        let mut away = Vec::new();
        for &l in self.cells_at_level(level) {
            if let Some(first_daughter) = self.cell_daughter[l.as_usize()].get() {
                home.push(l);
                away.push(OptionalGlobalIndex::some(GlobalIndex::new(first_daughter.get() + daughter_offset)));
            }
        }
        (home, away)
    }

    /// Refreshes `cell_mother`/`cell_daughter` from peers' `cell_address`
    /// after a global-id relabelling, via `Copy` through the kid/mom
    /// token pools.
    pub fn reset_mothers_and_daughters(&mut self, cell_address: &[GlobalIndex]) -> Result<()> {
        let addr_u64: Vec<u64> = cell_address.iter().map(|g| g.get()).collect();

        let mut mother_u64: Vec<u64> = self.cell_mother.iter().map(optional_global_as_wire).collect();
        for token in &self.kid_tokens {
            token.get(TokenOperation::Copy, &addr_u64, &mut mother_u64)?;
        }
        self.cell_mother = mother_u64.into_iter().map(wire_as_optional_global).collect();

        let mut daughter_u64: Vec<u64> = self.cell_daughter.iter().map(optional_global_as_wire).collect();
        for token in &self.mom_tokens {
            token.get(TokenOperation::Copy, &addr_u64, &mut daughter_u64)?;
        }
        self.cell_daughter = daughter_u64.into_iter().map(wire_as_optional_global).collect();

        Ok(())
    }

    /// Sets the mother/daughter of newly-appended cells (indices
    /// `[old_count, new_count)`) to null.
    pub fn reset_mothers_and_daughters_new(&mut self, old_count: usize, new_count: usize) {
        self.cell_mother.resize(new_count, OptionalGlobalIndex::NONE);
        self.cell_daughter.resize(new_count, OptionalGlobalIndex::NONE);
        for l in old_count..new_count {
            self.cell_mother[l] = OptionalGlobalIndex::NONE;
            self.cell_daughter[l] = OptionalGlobalIndex::NONE;
        }
    }

    /// Relocates the KidMom-owned level-parallel arrays (`cell_mother`,
    /// `cell_daughter`, `ltop`, `lpoint`) during AMR reconstruction, using
    /// one shared descriptor set. Cells-owned parallel arrays (`flag`,
    /// `flag_tag`, `amr_tag`, `cell_level`, `levelmx`) are out of this
    /// crate's scope (§1) — callers relocate them with the same
    /// descriptors via [`crate::move_data::move_data`] directly.
    pub fn recon_move(
        &mut self,
        comm: &SimpleCommunicator,
        send_start: &[usize],
        send_length: &[usize],
        recv_start: &[usize],
        recv_length: &[usize],
        new_local_count: usize,
    ) -> Result<()> {
        let mother_send: Vec<u64> = self.cell_mother.iter().map(optional_global_as_wire).collect();
        let mut mother_recv = vec![u64::MAX; new_local_count];
        crate::move_data::move_data(comm, send_start, send_length, &mother_send, recv_start, recv_length, &mut mother_recv)?;
        self.cell_mother = mother_recv.into_iter().map(wire_as_optional_global).collect();

        let daughter_send: Vec<u64> = self.cell_daughter.iter().map(optional_global_as_wire).collect();
        let mut daughter_recv = vec![u64::MAX; new_local_count];
        crate::move_data::move_data(comm, send_start, send_length, &daughter_send, recv_start, recv_length, &mut daughter_recv)?;
        self.cell_daughter = daughter_recv.into_iter().map(wire_as_optional_global).collect();

        let ltop_send: Vec<u32> = self.ltop.iter().map(|l| l.get()).collect();
        let mut ltop_recv = vec![0u32; recv_length.iter().sum()];
        crate::move_data::move_data(comm, send_start, send_length, &ltop_send, recv_start, recv_length, &mut ltop_recv)?;
        self.ltop = ltop_recv.into_iter().map(LocalIndex::new).collect();

        let lpoint_send: Vec<u32> = self.lpoint.iter().map(|l| l.get()).collect();
        let mut lpoint_recv = vec![0u32; new_local_count];
        crate::move_data::move_data(comm, send_start, send_length, &lpoint_send, recv_start, recv_length, &mut lpoint_recv)?;
        self.lpoint = lpoint_recv.into_iter().map(LocalIndex::new).collect();

        Ok(())
    }
}

fn optional_global_as_wire(value: &OptionalGlobalIndex) -> u64 {
    value.get().map(|g| g.get()).unwrap_or(u64::MAX)
}

fn wire_as_optional_global(value: u64) -> OptionalGlobalIndex {
    if value == u64::MAX {
        OptionalGlobalIndex::NONE
    } else {
        OptionalGlobalIndex::some(GlobalIndex::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_top_collects_leaves() {
        let mut km = KidMom::new(2, 4);
        km.set_cell_daughter(LocalIndex::new(0), OptionalGlobalIndex::some(GlobalIndex::new(10)));
        km.build_top();
        let leaves: Vec<u32> = km.ltop().iter().map(|l| l.get()).collect();
        assert_eq!(leaves, vec![1, 2, 3]);
    }

    #[test]
    fn reset_mothers_and_daughters_new_nulls_appended_range() {
        let mut km = KidMom::new(2, 3);
        km.set_cell_mother(LocalIndex::new(0), OptionalGlobalIndex::some(GlobalIndex::new(5)));
        km.reset_mothers_and_daughters_new(3, 5);
        assert_eq!(km.cell_mother()[0].get(), Some(GlobalIndex::new(5)));
        assert_eq!(km.cell_mother()[3].get(), None);
        assert_eq!(km.cell_mother()[4].get(), None);
    }
}
