//! Integration contracts with the external Cells/Levels collaborators
//! (§6). Neither is implemented here — this module is only the seam
//! `kidmom` builds against, grounded in `mesh/ffi/include/library/
//! mesh-ffi-cells.cpp` and `mesh-ffi-levels.cpp`'s consumed surface.

use crate::types::{GlobalIndex, LocalIndex};

/// The narrow slice of a Cells data store this crate consumes: the
/// per-rank cell count, the clone-cell bookkeeping, and the
/// local-to-global address mapping.
pub trait CellStore {
    fn num_local_cells(&self) -> usize;
    fn num_local_cells_with_clones(&self) -> usize;
    fn num_clone_cells(&self) -> usize;
    fn cell_address(&self, local: LocalIndex) -> GlobalIndex;
    fn global_base_address(&self, rank: crate::types::RankId) -> GlobalIndex;
    fn is_active(&self, local: LocalIndex) -> bool;
}

/// The narrow slice of a Levels structure `kidmom` needs: iteration over
/// local cells at a given refinement level.
pub trait LevelSource {
    fn cells_at_level(&self, level: usize) -> &[LocalIndex];
}

impl<'a> LevelSource for crate::kidmom::KidMom<'a> {
    fn cells_at_level(&self, level: usize) -> &[LocalIndex] {
        crate::kidmom::KidMom::cells_at_level(self, level)
    }
}
