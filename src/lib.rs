//! Neighbour-exchange communication plans ("Token") for adaptive mesh
//! refinement simulations over MPI.
//!
//! The Token pattern is a precomputed, reusable plan that exchanges data
//! between a rank and the subset of remote ranks holding its logical
//! neighbours (ghost/clone cells, AMR mother/daughter cells, or arbitrary
//! remote addresses). A [`builder::TokenBuilder`] resolves addresses and
//! negotiates per-peer counts; the resulting [`token::Token`] then performs
//! repeated `get`/`put` exchanges without re-deriving its segment tables.
//!
//! This crate does not install a `tracing` subscriber — it only emits
//! spans. Wire one up in the binary that embeds this crate if you want
//! readable output (see the `tracing-subscriber` dev-dependency used by
//! this crate's own tests).

pub mod addressing;
pub mod builder;
pub mod diagnostics;
pub mod integration;
pub mod kidmom;
pub mod move_data;
pub mod rma;
pub mod some_to_some;
pub mod tags;
pub mod token;
pub mod types;
pub mod view;

pub use builder::TokenBuilder;
pub use diagnostics::{Error, Result};
pub use kidmom::{KidMom, KidMomOptions};
pub use move_data::move_data;
pub use rma::RmaAllToAll;
pub use token::{Token, TokenOperation};
pub use types::{GlobalIndex, LocalIndex, OptionalGlobalIndex, OptionalLocalIndex, OptionalRankId, RankId};
