//! Error type.
//!
//! This is the shared error type for the whole crate.

use std::{error, fmt};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// A null handle or out-of-range id was passed to a public entry point.
    InvalidArguments,
    /// A state-machine violation, e.g. `end_subgraph` without `begin_subgraph`.
    InvalidOperation,
    /// The program body produced a structurally inconsistent stream
    /// (mismatched block markers, overlapping semantics, access out of the
    /// declared range).
    InvalidProgram,
    /// Arena or allocator failure.
    OutOfMemory,
    /// Array parameter access beyond the declared size.
    IndexOutOfBounds,
    /// Span or counter overflow.
    IntegerOverflow,
    /// Argument type size mismatch on a typed accessor.
    TypeMismatch,
    /// Bind-by-name of a non-existent node declaration.
    UnknownNode,
    /// `DISALLOW_UNBOUND_NODES` is set and no callback or default was found.
    UnrecognizedCommand,
    /// Placeholder for incomplete backend features.
    NotImplemented,
    /// An invariant was broken inside the core.
    InternalError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Error::InvalidArguments => "invalid arguments",
            Error::InvalidOperation => "invalid operation",
            Error::InvalidProgram => "invalid program",
            Error::OutOfMemory => "out of memory",
            Error::IndexOutOfBounds => "index out of bounds",
            Error::IntegerOverflow => "integer overflow",
            Error::TypeMismatch => "type mismatch",
            Error::UnknownNode => "unknown node",
            Error::UnrecognizedCommand => "unrecognized command",
            Error::NotImplemented => "not implemented",
            Error::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

impl error::Error for Error {}

pub type Result<T> = ::std::result::Result<T, Error>;
