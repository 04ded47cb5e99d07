//! Error model shared by both allocator cores.
//!
//! Mirrors the three result kinds of the classic C contract (`OK = 0`,
//! `NOT_FOUND = 4`, `INTERNAL = -1`) while reading as ordinary Rust `Result`s
//! at the API boundary.

use core::fmt::{self, Display, Formatter};

/// Failure modes a `get`/`free`/`extend` call can return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// The pointer is not owned by this arena, is misaligned, or has already
    /// been freed. Corresponds to the wire-level status code `4`.
    NotFound,
    /// No block large enough is available (and, for a buddy arena with an
    /// emergency heap, the fallback also failed).
    OutOfMemory,
    /// An invariant that must hold under correct usage was violated — the
    /// heap should be considered compromised. Corresponds to the wire-level
    /// status code `-1`.
    Corruption,
}

impl AllocError {
    /// The numeric status code an FFI-facing wrapper would hand back to a C
    /// caller, per the original `free`/`extend` contract. `OutOfMemory` has
    /// no code of its own in that contract: it is signalled by a null
    /// pointer, not a status code, so callers needing the wire format only
    /// ever observe this for `NotFound`/`Corruption`.
    #[must_use]
    pub const fn status_code(self) -> i32 {
        match self {
            AllocError::NotFound => 4,
            AllocError::Corruption => -1,
            AllocError::OutOfMemory => 0,
        }
    }
}

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::NotFound => f.write_str("pointer not owned by this arena"),
            AllocError::OutOfMemory => f.write_str("no block large enough is available"),
            AllocError::Corruption => f.write_str("heap invariant violated"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

pub type Result<T> = core::result::Result<T, AllocError>;
