//! §4.1 — GlobalAddressing: resolving a global cell id into (rank, local
//! address) and back, via a per-rank base-address table.
//!
//! Grounded in `original_source/comm/src/comm-token.cpp`'s
//! `internal::BuildGlobalBase` and `internal::PeAndLocalAddress`.
//!
//! `BaseTable` holds one entry per rank — `base[r]` is the smallest global
//! id owned by rank `r` — rather than an extra trailing "total cell count"
//! sentinel. `TokenBuilder::set_cell_bases` names this exact shape
//! ("a BaseTable of length comm_size"), and it is what the worked example
//! in the spec's test scenarios exercises: `bases = [0, 7, 16, 22]` is a
//! 4-rank table, and a query of `80` resolves against the open-ended last
//! rank (see DESIGN.md for this as a resolved Open Question).

use crate::diagnostics::{Error, Result};
use crate::types::{GlobalIndex, LocalIndex, OptionalGlobalIndex, OptionalLocalIndex, OptionalRankId, RankId};

/// Tracks whether [`BaseTable`] needs to be rebuilt because the local cell
/// count changed underneath it (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseTableState {
    Consistent,
    NeedsRebase,
    NeedsResize,
}

/// `base[r]` is the smallest global id owned by rank `r`. Monotonically
/// non-decreasing — an empty rank `r` has `base[r] == base[r+1]`. The last
/// rank absorbs every global id `>= base[comm_size - 1]`.
#[derive(Debug, Clone)]
pub struct BaseTable {
    base: Vec<GlobalIndex>,
}

impl BaseTable {
    /// Builds a `BaseTable` from each rank's local cell count, in rank
    /// order, via an exclusive prefix sum — the local (non-collective) half
    /// of `internal::BuildGlobalBase`. The all-gather that produces
    /// `counts` lives in [`crate::builder::TokenBuilder::set_num_cells`].
    pub fn from_counts(counts: &[u32]) -> Self {
        let mut base = Vec::with_capacity(counts.len());
        let mut running: u64 = 0;
        for &count in counts {
            base.push(GlobalIndex::new(running));
            running += u64::from(count);
        }
        BaseTable { base }
    }

    /// Adopts an externally computed table (`TokenBuilder::set_cell_bases`).
    /// `bases` must have length `comm_size`.
    pub fn from_bases(bases: Vec<GlobalIndex>) -> Self {
        BaseTable { base: bases }
    }

    pub fn comm_size(&self) -> usize {
        self.base.len()
    }

    pub fn base_of(&self, rank: RankId) -> GlobalIndex {
        self.base[rank.as_usize()]
    }

    /// Resolves a global id to `(rank, local index)` by binary search for
    /// the greatest `r` with `base[r] <= g`, then advancing past empty
    /// ranks with `base[r] == base[r+1]`. The only rejection case is `g`
    /// smaller than every rank's base (equivalently, smaller than
    /// `base[0]`, which is always `0` in a table built from cell counts).
    pub fn resolve(&self, global: GlobalIndex) -> Result<(RankId, LocalIndex)> {
        if self.base.is_empty() || global < self.base[0] {
            return Err(Error::precondition(format!(
                "global id {global} has no owning rank in this BaseTable"
            )));
        }

        // `partition_point` finds the first index where `base[i] > g`;
        // one step back is the greatest `r` with `base[r] <= g`.
        let upper = self.base.partition_point(|&b| b <= global);
        let mut rank = upper - 1;

        let last = self.comm_size() - 1;
        while rank != last && self.base[rank] == self.base[rank + 1] {
            rank += 1;
        }

        let local = global.get() - self.base[rank].get();
        Ok((RankId::new(rank as i32), LocalIndex::from(local as u32)))
    }

    pub fn global_of(&self, rank: RankId, local: LocalIndex) -> GlobalIndex {
        GlobalIndex::new(self.base_of(rank).get() + u64::from(local.get()))
    }
}

/// Resolves many (possibly null) global ids at once — `TokenBuilder::pes_and_addresses`.
pub fn pes_and_addresses(
    bases: &BaseTable,
    away_globals: &[OptionalGlobalIndex],
    out_pes: &mut [OptionalRankId],
    out_addrs: &mut [OptionalLocalIndex],
) -> Result<()> {
    if away_globals.len() != out_pes.len() || away_globals.len() != out_addrs.len() {
        return Err(Error::precondition(
            "away_globals, out_pes, and out_addrs must all have the same length",
        ));
    }

    for (i, &global) in away_globals.iter().enumerate() {
        match global.get() {
            Some(global) => {
                let (rank, local) = bases.resolve(global)?;
                out_pes[i] = OptionalRankId::some(rank);
                out_addrs[i] = OptionalLocalIndex::some(local);
            }
            None => {
                out_pes[i] = OptionalRankId::NONE;
                out_addrs[i] = OptionalLocalIndex::NONE;
            }
        }
    }

    Ok(())
}

/// ORs `1` into `flags_out[owner(g)]` for each non-null `g` —
/// `TokenBuilder::flag_pes`. Seeds the sparse count exchange.
pub fn flag_pes(bases: &BaseTable, away_globals: &[OptionalGlobalIndex], flags_out: &mut [bool]) -> Result<()> {
    if flags_out.len() != bases.comm_size() {
        return Err(Error::precondition(format!(
            "flags_out must have length comm_size ({}), got {}",
            bases.comm_size(),
            flags_out.len()
        )));
    }

    for &global in away_globals {
        if let Some(global) = global.get() {
            let (rank, _) = bases.resolve(global)?;
            flags_out[rank.as_usize()] = true;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bases(values: &[u64]) -> BaseTable {
        BaseTable::from_bases(values.iter().map(|&v| GlobalIndex::new(v)).collect())
    }

    #[test]
    fn resolves_scenario_5_from_spec() {
        // spec.md §8 scenario 5
        let table = bases(&[0, 7, 16, 22]);
        let queries = [0u64, 3, 7, 15, 16, 17, 22, 80];
        let expected = [(0, 0), (0, 3), (1, 0), (1, 8), (2, 0), (2, 1), (3, 0), (3, 58)];

        for (&q, &(rank, local)) in queries.iter().zip(expected.iter()) {
            let (r, l) = table.resolve(GlobalIndex::new(q)).unwrap();
            assert_eq!((r.get(), l.get()), (rank, local), "query {q}");
        }
    }

    #[test]
    fn rejects_id_below_every_rank() {
        let mut raw = vec![GlobalIndex::new(0); 0];
        raw.push(GlobalIndex::new(5));
        raw.push(GlobalIndex::new(10));
        let table = BaseTable::from_bases(raw);
        assert!(table.resolve(GlobalIndex::new(2)).is_err());
        assert!(table.resolve(GlobalIndex::new(5)).is_ok());
    }

    #[test]
    fn skips_empty_ranks() {
        // rank 1 owns no cells: base = [0, 5, 5]
        let table = bases(&[0, 5, 5]);
        let (rank, local) = table.resolve(GlobalIndex::new(5)).unwrap();
        assert_eq!(rank.get(), 2);
        assert_eq!(local.get(), 0);
    }

    #[test]
    fn from_counts_builds_exclusive_prefix_sum() {
        let table = BaseTable::from_counts(&[10, 11, 12, 13]);
        assert_eq!(table.base_of(RankId::new(0)).get(), 0);
        assert_eq!(table.base_of(RankId::new(1)).get(), 10);
        assert_eq!(table.base_of(RankId::new(2)).get(), 21);
        assert_eq!(table.base_of(RankId::new(3)).get(), 33);
    }

    #[test]
    fn null_propagates_through_pes_and_addresses() {
        let table = bases(&[0, 7, 16, 22]);
        let globals = [OptionalGlobalIndex::NONE, OptionalGlobalIndex::some(GlobalIndex::new(10))];
        let mut pes = [OptionalRankId::NONE; 2];
        let mut addrs = [OptionalLocalIndex::NONE; 2];
        pes_and_addresses(&table, &globals, &mut pes, &mut addrs).unwrap();
        assert_eq!(pes[0].get(), None);
        assert_eq!(addrs[0].get(), None);
        assert_eq!(pes[1].get().unwrap().get(), 1);
    }

    #[test]
    fn flag_pes_ors_owner_bits() {
        let table = bases(&[0, 7, 16, 22]);
        let globals = [OptionalGlobalIndex::some(GlobalIndex::new(3)), OptionalGlobalIndex::some(GlobalIndex::new(20))];
        let mut flags = vec![false; 4];
        flag_pes(&table, &globals, &mut flags).unwrap();
        assert_eq!(flags, vec![true, false, false, true]);
    }
}
