//! Error taxonomy and propagation-frame chain.
//!
//! The original source (`error/include/error-macros.hpp`) carries errors as
//! C++ exceptions annotated at each frame with `file:function:line`. This
//! crate replaces that with an explicit [`Error`] that accumulates the same
//! frames as it is propagated with `?`, following
//! `Anuj0x-Distributed-Scientific-Visualization`'s single `thiserror::Error`
//! enum (its `lib.rs`) rather than a grab-bag of `anyhow`/`Box<dyn Error>`.

use std::fmt;

/// One site a [`Error`] passed through on its way up the call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
    pub detail: Option<String>,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.line, self.function)?;
        if let Some(detail) = &self.detail {
            write!(f, " — {detail}")?;
        }
        Ok(())
    }
}

/// Everything that can go wrong in a Token build or exchange.
///
/// Every variant is fatal by crate convention (§7): nothing here is
/// recovered locally. [`Error::trace`] carries the propagation chain; call
/// [`abort_on_error`] at a collective boundary to print it and terminate,
/// or inspect/log it yourself if you have a reason to survive the error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A caller-supplied precondition didn't hold (mismatched lengths, an
    /// out-of-range global id, rank-order completion requested on an empty
    /// request set, ...).
    #[error("precondition violation: {message}")]
    Precondition { message: String, trace: Vec<Frame> },

    /// An MPI call returned a non-success code.
    #[error("MPI failure: {message}")]
    Mpi { message: String, trace: Vec<Frame> },

    /// A scratch allocation could not be satisfied.
    #[error("resource exhaustion: {message}")]
    Resource { message: String, trace: Vec<Frame> },

    /// An internal consistency check failed (extent mismatch between two
    /// views passed to the same exchange, a segment table invariant
    /// broken, ...).
    #[error("logic failure: {message}")]
    Logic { message: String, trace: Vec<Frame> },
}

impl Error {
    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Precondition { message: message.into(), trace: Vec::new() }
    }

    pub fn mpi(message: impl Into<String>) -> Self {
        Error::Mpi { message: message.into(), trace: Vec::new() }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Error::Resource { message: message.into(), trace: Vec::new() }
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Error::Logic { message: message.into(), trace: Vec::new() }
    }

    pub fn trace(&self) -> &[Frame] {
        match self {
            Error::Precondition { trace, .. }
            | Error::Mpi { trace, .. }
            | Error::Resource { trace, .. }
            | Error::Logic { trace, .. } => trace,
        }
    }

    /// Append a propagation frame. Called by the [`trace_err!`] macro at
    /// every `?` site that wants to record where it passed through.
    pub fn push_frame(mut self, frame: Frame) -> Self {
        match &mut self {
            Error::Precondition { trace, .. }
            | Error::Mpi { trace, .. }
            | Error::Resource { trace, .. }
            | Error::Logic { trace, .. } => trace.push(frame),
        }
        self
    }
}

/// Records a [`Frame`] at the call site and appends it to `$err`.
///
/// ```ignore
/// some_fallible_call().map_err(|e| trace_err!(e))?;
/// ```
#[macro_export]
macro_rules! trace_err {
    ($err:expr) => {
        $crate::diagnostics::Error::push_frame(
            $err,
            $crate::diagnostics::Frame {
                file: file!(),
                function: {
                    fn f() {}
                    fn type_name_of<T>(_: T) -> &'static str {
                        std::any::type_name::<T>()
                    }
                    type_name_of(f)
                },
                line: line!(),
                detail: None,
            },
        )
    };
    ($err:expr, $detail:expr) => {
        $crate::diagnostics::Error::push_frame(
            $err,
            $crate::diagnostics::Frame {
                file: file!(),
                function: {
                    fn f() {}
                    fn type_name_of<T>(_: T) -> &'static str {
                        std::any::type_name::<T>()
                    }
                    type_name_of(f)
                },
                line: line!(),
                detail: Some($detail.to_string()),
            },
        )
    };
}

/// Fails the process: prints the message and propagation chain to stderr
/// and aborts. This is the one place §7's "errors abort the process"
/// policy is carried out; everything else in the crate just returns
/// `Result`. A driver that wants the spec's default behavior calls this
/// at its outermost collective boundary:
///
/// ```ignore
/// if let Err(e) = builder.build_global(&home, &away) {
///     amr_token::diagnostics::abort_on_error(&e);
/// }
/// ```
pub fn abort_on_error(error: &Error) -> ! {
    eprintln!("amr-token: fatal error: {error}");
    for frame in error.trace() {
        eprintln!("  at {frame}");
    }
    std::process::abort()
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_display_includes_detail() {
        let frame = Frame { file: "a.rs", function: "f", line: 7, detail: Some("x=1".into()) };
        assert_eq!(frame.to_string(), "a.rs:7 (f) — x=1");
    }

    #[test]
    fn push_frame_accumulates() {
        let err = Error::precondition("bad input");
        let err = trace_err!(err, "while building token");
        assert_eq!(err.trace().len(), 1);
    }
}
