//! Row/column shaped access over [`ndarray`] views.
//!
//! The original source's Design Notes call for a `StridedView<T, Rank>`
//! abstraction over Kokkos's multi-dimensional views: extents, strides,
//! pointer access, and a transpose query. `ndarray::ArrayView2` /
//! `ArrayViewMut2` already provide exactly that (`.shape()`, `.strides()`,
//! `.t()`), so this module is a thin set of helpers rather than a new type —
//! the two free functions below are what `token::Token::get_v_inv` /
//! `put_v_inv` need and nothing more.

use ndarray::{ArrayView2, ArrayViewMut2};

/// Width of the fixed-size row each cell carries in a row-wise (`GetV`/`PutV`)
/// exchange — `view.shape()[1]`.
pub fn row_width<T>(view: &ArrayView2<'_, T>) -> usize {
    view.shape()[1]
}

/// Logical transpose used by `GetVInv`/`PutVInv`: swaps the roles of rows
/// and columns without copying. `ndarray`'s `.t()` already returns a view
/// with swapped strides, so this is a named pass-through rather than new
/// logic — kept as a function (not an inline `.t()` at each call site) so
/// the "this is the transpose seam" intent reads at the call site.
pub fn transpose<'a, T>(view: ArrayView2<'a, T>) -> ArrayView2<'a, T> {
    view.reversed_axes()
}

pub fn transpose_mut<'a, T>(view: ArrayViewMut2<'a, T>) -> ArrayViewMut2<'a, T> {
    view.reversed_axes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn transpose_swaps_shape() {
        let a = Array2::<f64>::zeros((3, 5));
        let t = transpose(a.view());
        assert_eq!(t.shape(), &[5, 3]);
    }

    #[test]
    fn row_width_reads_second_extent() {
        let a = Array2::<f64>::zeros((4, 7));
        assert_eq!(row_width(&a.view()), 7);
    }
}
