//! Shared introspection helpers: the `(total, used, free)` byte counters and
//! the ANSI-colored block-size visualisation used by both arena's `stats`/
//! `print` operations (§4.4 and §6 "Print format").
//!
//! Rendering never allocates: decimal block sizes are converted digit-by-digit
//! with [`numtoa`], the same no-alloc integer-to-ASCII approach the teacher
//! crate already depends on for BIOS-stage status output
//! (`src/bios/flib/src/mem/mod.rs`, `src/bios/flib/src/graphics/image.rs`).

use core::fmt::{self, Write};

use numtoa::NumToA;

const SGR_USED: &str = "\x1b[31m";
const SGR_FREE: &str = "\x1b[32m";
const SGR_RESET: &str = "\x1b[0m";

/// Byte counters produced by a linear walk over an arena's blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total managed byte count.
    pub mem: u32,
    /// Bytes currently handed out to callers.
    pub used: u32,
    /// Bytes currently available for allocation.
    pub free: u32,
    /// Blocks found during the walk that belong to neither the in-use
    /// accounting nor any avail list — a bookkeeping-views-disagree
    /// corruption signal (§4.4 "lost block" diagnostic).
    pub lost: u32,
}

impl HeapStats {
    /// `used + free == mem`, ignoring any lost bytes — the property
    /// asserted by §8 invariant 6 when no prior operation returned
    /// `INTERNAL`.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.used + self.free + self.lost == self.mem
    }

    /// Percentage of `mem` currently in use, rounded down.
    #[must_use]
    pub const fn used_percent(&self) -> u32 {
        if self.mem == 0 {
            0
        } else {
            self.used.saturating_mul(100) / self.mem
        }
    }
}

/// Writes `value` in decimal, without allocating.
pub fn write_decimal<W: Write>(w: &mut W, value: u32) -> fmt::Result {
    let mut buf = [0u8; 10];
    let digits = value.numtoa(10, &mut buf);
    // `numtoa` only ever writes ASCII digits into `buf`.
    w.write_str(unsafe { core::str::from_utf8_unchecked(digits) })
}

/// Writes one `|`-separated, SGR-colored token for a single block.
pub fn write_block_token<W: Write>(w: &mut W, size: u32, used: bool) -> fmt::Result {
    w.write_str(if used { SGR_USED } else { SGR_FREE })?;
    write_decimal(w, size)?;
    w.write_str(SGR_RESET)
}

/// Writes the trailing `Total | Used (n%) | Free [| missing: N]` summary.
pub fn write_summary<W: Write>(w: &mut W, stats: HeapStats) -> fmt::Result {
    w.write_str("Total ")?;
    write_decimal(w, stats.mem)?;
    w.write_str(" | Used ")?;
    write_decimal(w, stats.used)?;
    w.write_str(" (")?;
    write_decimal(w, stats.used_percent())?;
    w.write_str("%) | Free ")?;
    write_decimal(w, stats.free)?;

    if stats.lost != 0 {
        w.write_str(" | missing: ")?;
        write_decimal(w, stats.lost)?;
        log::error!(
            "heap walk found {} lost byte(s): present in neither the tag/size-area accounting nor any avail list",
            stats.lost
        );
    }

    Ok(())
}
