//! ---
//! fleet_section: "05-observability"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Launch progress tracking."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use crate::tick::TickPattern;

/// Result of a line matching a tick at or after the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    /// Index of the matched tick.
    pub index: usize,
    /// Ticks passed over without being matched.
    pub skipped: usize,
}

/// Forward-only position in an ordered tick list.
///
/// Only ticks at or after the position are considered, so progress never
/// moves backwards unless the owner rewinds explicitly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickCursor {
    position: usize,
}

impl TickCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Match `line` against the remaining ticks; on a match the cursor moves
    /// just past the matched tick.
    pub fn advance(&mut self, ticks: &[TickPattern], line: &str) -> Option<Advance> {
        let remaining = ticks.get(self.position..)?;
        let offset = remaining.iter().position(|tick| tick.matches(line))?;
        let index = self.position + offset;
        self.position = index + 1;
        Some(Advance {
            index,
            skipped: offset,
        })
    }

    pub fn rewind_to(&mut self, position: usize) {
        self.position = position;
    }
}
