//! Reserved MPI tags used by this crate's wire protocol (§6).
//!
//! Each Token-family exchange uses a fixed tag so concurrent in-flight
//! exchanges on the same communicator can be told apart by the underlying
//! MPI implementation's `(comm, tag, sender, receiver)` ordering guarantee.
//! The crate-level contract (§5) is still that only one exchange is ever
//! in flight per communicator at a time; the tags exist so a debugger or
//! packet trace can identify which family produced a given message.

use mpi::Tag;

/// Index handshake in [`crate::builder::TokenBuilder::build_local`].
pub const BUILD_GLOBAL: Tag = 1001;

/// [`crate::token::Token`] `get`/`put` exchanges.
pub const TOKEN_GS: Tag = 1002;

/// [`crate::some_to_some`] sparse count exchange.
pub const SOME_TO_SOME: Tag = 1003;

/// [`crate::move_data::move_data`] / `ReconMove`.
pub const MOVE: Tag = 1004;
