//! The exchange engine (§4.5): `Token::get`/`put` and their `V`/`VInv`
//! shapes, built on the segment tables `builder::TokenBuilder::build_local`
//! produces.
//!
//! Grounded in `original_source/comm/include/comm-token.hpp`'s
//! `GatherScatter` engine (pack → bound receive scratch → apply CopyPlan →
//! post receives/sends → drain completions → apply op) and, for the rsmpi
//! call shapes, `rsmpi-rsmpi/examples/immediate_multiple_requests.rs`.

use std::mem::size_of;

use mpi::request::{multiple_scope, RequestCollection};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use ndarray::{ArrayView2, ArrayViewMut2};

use crate::diagnostics::{Error, Result};
use crate::tags::TOKEN_GS;
use crate::types::{LocalIndex, RankId};
use crate::view;

/// A contiguous run of index-array entries destined to or received from a
/// single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub rank: RankId,
    pub begin: usize,
    pub length: usize,
}

/// Same-rank traffic and null-destination bookkeeping, computed once by
/// `build_local` and replayed on every exchange instead of going through
/// the network.
#[derive(Debug, Clone, Default)]
pub struct CopyPlan {
    pub copy_from: Vec<usize>,
    pub copy_to: Vec<usize>,
    pub zero: Vec<usize>,
}

/// The operation applied at the destination when a value arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOperation {
    Copy,
    Add,
    Sub,
    Min,
    Max,
}

/// Element types a [`Token`] exchange can carry. Blanket-implemented for
/// anything `Copy`-able, MPI-equivalent, and ordered/summable — the closed
/// set the original primitive dispatches over (`i32`, `i64`, `f32`, `f64`,
/// and `bool` exchanged as `u8` per §9's wire-compatibility note).
pub trait TokenElement:
    Copy + Equivalence + PartialOrd + std::ops::Add<Output = Self> + std::ops::Sub<Output = Self>
{
}

impl<T> TokenElement for T where
    T: Copy + Equivalence + PartialOrd + std::ops::Add<Output = T> + std::ops::Sub<Output = T>
{
}

fn combine<T: TokenElement>(op: TokenOperation, dst: T, src: T) -> T {
    match op {
        TokenOperation::Copy => src,
        TokenOperation::Add => dst + src,
        TokenOperation::Sub => dst - src,
        TokenOperation::Min => {
            if src < dst {
                src
            } else {
                dst
            }
        }
        TokenOperation::Max => {
            if src > dst {
                src
            } else {
                dst
            }
        }
    }
}

/// An immutable neighbour-exchange plan built over a fixed communicator.
pub struct Token<'c> {
    comm: &'c SimpleCommunicator,
    min_gather_size: usize,
    min_scatter_size: usize,
    copy_plan: CopyPlan,
    home_segments: Vec<Segment>,
    home_index: Vec<LocalIndex>,
    away_segments: Vec<Segment>,
    away_index: Vec<LocalIndex>,
    max_recv_scratch_bytes: Option<usize>,
    require_rank_order_completion: bool,
}

impl<'c> Token<'c> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        comm: &'c SimpleCommunicator,
        min_gather_size: usize,
        min_scatter_size: usize,
        copy_plan: CopyPlan,
        home_segments: Vec<Segment>,
        home_index: Vec<LocalIndex>,
        away_segments: Vec<Segment>,
        away_index: Vec<LocalIndex>,
        max_recv_scratch_bytes: Option<usize>,
        require_rank_order_completion: bool,
    ) -> Self {
        Token {
            comm,
            min_gather_size,
            min_scatter_size,
            copy_plan,
            home_segments,
            home_index,
            away_segments,
            away_index,
            max_recv_scratch_bytes,
            require_rank_order_completion,
        }
    }

    pub fn min_gather_size(&self) -> usize {
        self.min_gather_size
    }

    pub fn min_scatter_size(&self) -> usize {
        self.min_scatter_size
    }

    pub fn home_segments(&self) -> &[Segment] {
        &self.home_segments
    }

    pub fn away_segments(&self) -> &[Segment] {
        &self.away_segments
    }

    pub fn copy_plan(&self) -> &CopyPlan {
        &self.copy_plan
    }

    /// Gather: fetch data from peers' away-side positions into local slots
    /// named by `home_index`.
    pub fn get<T: TokenElement>(&self, op: TokenOperation, input: &[T], output: &mut [T]) -> Result<()> {
        self.get_rows(op, 1, input, output)
    }

    /// Scatter: push data at `home_index` positions out to peers' away-side
    /// positions, combining under `op`.
    pub fn put<T: TokenElement>(&self, op: TokenOperation, input: &[T], output: &mut [T]) -> Result<()> {
        self.put_rows(op, 1, input, output)
    }

    /// Row-wise gather: each cell carries a fixed-width row of `row`
    /// values.
    pub fn get_v<T: TokenElement>(&self, op: TokenOperation, input: ArrayView2<'_, T>, mut output: ArrayViewMut2<'_, T>) -> Result<()> {
        let row = view::row_width(&input);
        if row != output.shape()[1] {
            return Err(Error::logic(format!(
                "GetV row-width mismatch: input has {} columns, output has {}",
                row,
                output.shape()[1]
            )));
        }
        let input_flat: Vec<T> = input.iter().copied().collect();
        let mut output_flat = vec![zero_element::<T>(); output.shape()[0] * row];
        self.get_rows(op, row, &input_flat, &mut output_flat)?;
        unflatten_into(&output_flat, &mut output);
        Ok(())
    }

    /// Row-wise scatter, the dual of [`Token::get_v`].
    pub fn put_v<T: TokenElement>(&self, op: TokenOperation, input: ArrayView2<'_, T>, mut output: ArrayViewMut2<'_, T>) -> Result<()> {
        let row = view::row_width(&input);
        if row != output.shape()[1] {
            return Err(Error::logic(format!(
                "PutV row-width mismatch: input has {} columns, output has {}",
                row,
                output.shape()[1]
            )));
        }
        let input_flat: Vec<T> = input.iter().copied().collect();
        let mut output_flat: Vec<T> = output.iter().copied().collect();
        self.put_rows(op, row, &input_flat, &mut output_flat)?;
        unflatten_into(&output_flat, &mut output);
        Ok(())
    }

    /// Column-wise gather: the logical transpose of [`Token::get_v`] — rows
    /// and columns exchange roles before delegating to the row-wise form.
    pub fn get_v_inv<T: TokenElement>(&self, op: TokenOperation, input: ArrayView2<'_, T>, output: ArrayViewMut2<'_, T>) -> Result<()> {
        self.get_v(op, view::transpose(input), view::transpose_mut(output))
    }

    /// Column-wise scatter, the dual of [`Token::get_v_inv`].
    pub fn put_v_inv<T: TokenElement>(&self, op: TokenOperation, input: ArrayView2<'_, T>, output: ArrayViewMut2<'_, T>) -> Result<()> {
        self.put_v(op, view::transpose(input), view::transpose_mut(output))
    }

    fn get_rows<T: TokenElement>(&self, op: TokenOperation, row: usize, input: &[T], output: &mut [T]) -> Result<()> {
        let _span = tracing::info_span!("token_get", op = ?op, row).entered();
        self.run_exchange(
            op,
            row,
            &self.away_segments,
            &self.away_index,
            input,
            &self.home_segments,
            &self.home_index,
            output,
            &self.copy_plan.copy_from,
            &self.copy_plan.copy_to,
            Some(&self.copy_plan.zero),
        )
    }

    fn put_rows<T: TokenElement>(&self, op: TokenOperation, row: usize, input: &[T], output: &mut [T]) -> Result<()> {
        let _span = tracing::info_span!("token_put", op = ?op, row).entered();
        self.run_exchange(
            op,
            row,
            &self.home_segments,
            &self.home_index,
            input,
            &self.away_segments,
            &self.away_index,
            output,
            &self.copy_plan.copy_to,
            &self.copy_plan.copy_from,
            None,
        )
    }

    /// The shared skeleton for Get and Put: pack, bound/batch the receive
    /// scratch, apply the CopyPlan, post messages, drain completions,
    /// apply `op`.
    #[allow(clippy::too_many_arguments)]
    fn run_exchange<T: TokenElement>(
        &self,
        op: TokenOperation,
        row: usize,
        send_segments: &[Segment],
        send_index: &[LocalIndex],
        send_source: &[T],
        recv_segments: &[Segment],
        recv_index: &[LocalIndex],
        recv_dest: &mut [T],
        copy_src: &[usize],
        copy_dst: &[usize],
        zero: Option<&[usize]>,
    ) -> Result<()> {
        if send_index.len() != send_segments.iter().map(|s| s.length).sum::<usize>() {
            return Err(Error::logic("send segment lengths do not sum to send index length"));
        }
        if recv_index.len() != recv_segments.iter().map(|s| s.length).sum::<usize>() {
            return Err(Error::logic("recv segment lengths do not sum to recv index length"));
        }

        // Step 3: local work concurrent with messages. Zeroing is a
        // Gather-only action; `zero` is `None` for Put.
        if let Some(zero) = zero {
            if op == TokenOperation::Copy {
                for &z in zero {
                    for j in 0..row {
                        recv_dest[z * row + j] = copy_default::<T>();
                    }
                }
            }
        }
        for (&src, &dst) in copy_src.iter().zip(copy_dst.iter()) {
            for j in 0..row {
                let value = send_source[src * row + j];
                recv_dest[dst * row + j] = combine(op, recv_dest[dst * row + j], value);
            }
        }

        // Step 1: pack send scratch.
        let total_send_length: usize = send_segments.iter().map(|s| s.length).sum();
        let mut send_scratch = vec![zero_element::<T>(); total_send_length * row];
        let mut send_offsets = Vec::with_capacity(send_segments.len());
        {
            let mut out = 0usize;
            for segment in send_segments {
                send_offsets.push(out);
                for k in 0..segment.length {
                    let slot = send_index[segment.begin + k].as_usize();
                    for j in 0..row {
                        send_scratch[out] = send_source[slot * row + j];
                        out += 1;
                    }
                }
            }
        }

        // Step 2: bound/batch the receive scratch.
        let unit = size_of::<T>().max(1);
        let batch_cap_elems = match self.max_recv_scratch_bytes {
            None => None,
            Some(bytes) => {
                let from_bytes = (bytes + unit - 1) / unit;
                let widest_segment = recv_segments.iter().map(|s| s.length * row).max().unwrap_or(0);
                Some(from_bytes.max(widest_segment))
            }
        };
        let batches = build_batches(recv_segments, row, batch_cap_elems);

        let self_rank = self.comm.rank();
        let send_order = send_order_higher_rank_first(send_segments, self_rank);

        for (batch_index, (batch_start, batch_end)) in batches.into_iter().enumerate() {
            let batch_segments = &recv_segments[batch_start..batch_end];
            let batch_len: usize = batch_segments.iter().map(|s| s.length).sum();
            let mut recv_scratch = vec![zero_element::<T>(); batch_len * row];

            // Carve `recv_scratch` into one disjoint `&mut [T]` per segment
            // up front — each request posted below escapes the loop body
            // into `coll` for the whole `multiple_scope` closure, so the
            // borrow checker needs slices it can see are non-overlapping
            // rather than repeated runtime-range indexing into one buffer
            // (the same shape `move_data::move_data` uses for its receives).
            let mut recv_slices: Vec<&mut [T]> = Vec::with_capacity(batch_segments.len());
            {
                let mut remaining: &mut [T] = &mut recv_scratch[..];
                for segment in batch_segments {
                    let (slice, rest) = remaining.split_at_mut(segment.length * row);
                    recv_slices.push(slice);
                    remaining = rest;
                }
            }

            // Step 5's send buffers only need disjoint immutable slices,
            // which don't alias under the borrow checker — but they're
            // built the same structural way, and only on the first batch,
            // since the send scratch is fully packed up front.
            let send_slices: Vec<&[T]> = if batch_index == 0 {
                send_order
                    .iter()
                    .map(|&idx| {
                        let segment = &send_segments[idx];
                        let offset = send_offsets[idx];
                        &send_scratch[offset..offset + segment.length * row]
                    })
                    .collect()
            } else {
                Vec::new()
            };

            multiple_scope(batch_segments.len() + send_slices.len(), |scope, coll: &mut RequestCollection<[T]>| {
                // Step 4: post receives for the current batch.
                for (segment, slice) in batch_segments.iter().zip(recv_slices.into_iter()) {
                    let req = self
                        .comm
                        .process_at_rank(segment.rank.get())
                        .immediate_receive_into_with_tag(scope, slice, TOKEN_GS);
                    coll.add(req);
                }

                // Step 5: post sends, higher rank first.
                for (&idx, slice) in send_order.iter().zip(send_slices.iter()) {
                    let segment = &send_segments[idx];
                    let req = self
                        .comm
                        .process_at_rank(segment.rank.get())
                        .immediate_send_with_tag(scope, *slice, TOKEN_GS);
                    coll.add(req);
                }

                // Step 6/7: consume completions, waiting sends as well as
                // receives before this closure (and the requests it holds)
                // goes out of scope.
                if self.require_rank_order_completion {
                    drain_rank_ordered(coll, batch_segments, row, op, recv_index, recv_dest);
                } else {
                    drain_any_order(coll, batch_segments, row, op, recv_index, recv_dest);
                }
            });
        }

        Ok(())
    }
}

fn zero_element<T: TokenElement>() -> T {
    // SAFETY-free zero: every element type here is a plain numeric type
    // with an all-zero-bits valid representation (i32/i64/f32/f64/u8).
    // Built via `Default`-free arithmetic so no extra trait bound is
    // needed beyond what `TokenElement` already requires.
    unsafe { std::mem::zeroed() }
}

fn copy_default<T: TokenElement>() -> T {
    zero_element()
}

fn unflatten_into<T: TokenElement>(flat: &[T], view: &mut ArrayViewMut2<'_, T>) {
    for (dst, &src) in view.iter_mut().zip(flat.iter()) {
        *dst = src;
    }
}

/// Greedily groups `segments` into batches whose cumulative `length * row`
/// does not exceed `cap_elems` (an already-widened cap, or unbounded if
/// `None`). Returns `(start, end)` index ranges into `segments`.
fn build_batches(segments: &[Segment], row: usize, cap_elems: Option<usize>) -> Vec<(usize, usize)> {
    if segments.is_empty() {
        return Vec::new();
    }
    let Some(cap) = cap_elems else {
        return vec![(0, segments.len())];
    };

    let mut batches = Vec::new();
    let mut start = 0usize;
    let mut running = 0usize;
    for (i, segment) in segments.iter().enumerate() {
        let size = segment.length * row;
        if running > 0 && running + size > cap {
            batches.push((start, i));
            start = i;
            running = 0;
        }
        running += size;
    }
    batches.push((start, segments.len()));
    batches
}

/// Order segment indices so peers with rank higher than `self_rank` are
/// served first, then peers with lower rank — reduces hotspotting on low
/// ranks when many peers send at once.
fn send_order_higher_rank_first(segments: &[Segment], self_rank: i32) -> Vec<usize> {
    let mut higher: Vec<usize> = (0..segments.len()).filter(|&i| segments[i].rank.get() > self_rank).collect();
    let lower: Vec<usize> = (0..segments.len()).filter(|&i| segments[i].rank.get() < self_rank).collect();
    higher.extend(lower);
    higher
}

/// Applies one arrived segment's data straight from the buffer rsmpi handed
/// back (no separately-tracked scratch offset): `data` is the exact slice
/// that was posted for this segment's receive.
fn apply_completed_segment<T: TokenElement>(
    segment: &Segment,
    data: &[T],
    row: usize,
    op: TokenOperation,
    recv_index: &[LocalIndex],
    recv_dest: &mut [T],
) {
    for k in 0..segment.length {
        let dest_slot = recv_index[segment.begin + k].as_usize();
        for j in 0..row {
            let value = data[k * row + j];
            recv_dest[dest_slot * row + j] = combine(op, recv_dest[dest_slot * row + j], value);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn drain_any_order<T: TokenElement>(
    coll: &mut RequestCollection<[T]>,
    batch_segments: &[Segment],
    row: usize,
    op: TokenOperation,
    recv_index: &[LocalIndex],
    recv_dest: &mut [T],
) {
    let receive_slot_count = batch_segments.len();
    while coll.incomplete() > 0 {
        if let Some((index, _status, data)) = coll.wait_any() {
            if index < receive_slot_count {
                apply_completed_segment(&batch_segments[index], data, row, op, recv_index, recv_dest);
            }
        }
    }
}

/// Same drain as [`drain_any_order`], but applies segments to `recv_dest` in
/// ascending segment-table order even when network completions arrive out
/// of order. `completed[i]` holds the arrived payload for segment `i` once
/// its receive finishes, independent of whether it has been applied yet;
/// `next_expected` is the separate "applied up to here" cursor. Every
/// completion — including send completions, which fall outside
/// `receive_slot_count` — is drained before returning, so the caller's
/// `multiple_scope` closure never returns with requests still attached.
#[allow(clippy::too_many_arguments)]
fn drain_rank_ordered<T: TokenElement>(
    coll: &mut RequestCollection<[T]>,
    batch_segments: &[Segment],
    row: usize,
    op: TokenOperation,
    recv_index: &[LocalIndex],
    recv_dest: &mut [T],
) {
    let receive_slot_count = batch_segments.len();
    let mut completed: Vec<Option<&[T]>> = vec![None; receive_slot_count];
    let mut next_expected = 0usize;

    while coll.incomplete() > 0 {
        if let Some((index, _status, data)) = coll.wait_any() {
            if index < receive_slot_count {
                completed[index] = Some(data);
                while next_expected < receive_slot_count {
                    let Some(data) = completed[next_expected].take() else {
                        break;
                    };
                    apply_completed_segment(&batch_segments[next_expected], data, row, op, recv_index, recv_dest);
                    next_expected += 1;
                }
            }
        }
    }

    debug_assert_eq!(next_expected, receive_slot_count, "rank-ordered drain must apply every segment");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(rank: i32, begin: usize, length: usize) -> Segment {
        Segment { rank: RankId::new(rank), begin, length }
    }

    #[test]
    fn build_batches_unbounded_is_one_batch() {
        let segments = vec![seg(0, 0, 3), seg(1, 3, 5)];
        let batches = build_batches(&segments, 1, None);
        assert_eq!(batches, vec![(0, 2)]);
    }

    #[test]
    fn build_batches_splits_on_cap() {
        let segments = vec![seg(0, 0, 3), seg(1, 3, 3), seg(2, 6, 3)];
        let batches = build_batches(&segments, 1, Some(4));
        assert_eq!(batches, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn build_batches_widens_cap_to_largest_segment() {
        let segments = vec![seg(0, 0, 10)];
        let batches = build_batches(&segments, 1, Some(1));
        assert_eq!(batches, vec![(0, 1)]);
    }

    #[test]
    fn send_order_puts_higher_ranks_first() {
        let segments = vec![seg(0, 0, 1), seg(1, 1, 1), seg(3, 2, 1), seg(4, 3, 1)];
        let order = send_order_higher_rank_first(&segments, 2);
        let ranks: Vec<i32> = order.iter().map(|&i| segments[i].rank.get()).collect();
        assert_eq!(ranks, vec![3, 4, 0, 1]);
    }

    #[test]
    fn combine_matches_operation_semantics() {
        assert_eq!(combine(TokenOperation::Copy, 5, 9), 9);
        assert_eq!(combine(TokenOperation::Add, 5, 9), 14);
        assert_eq!(combine(TokenOperation::Sub, 9, 5), 4);
        assert_eq!(combine(TokenOperation::Min, 9, 5), 5);
        assert_eq!(combine(TokenOperation::Max, 9, 5), 9);
    }
}
