//! Per-frame plot cursor over an immutable roster snapshot.
//!
//! The renderer drives one cycle per frame:
//!
//! ```text
//! plot_start ─► ( plot_end? ─► plot_x/plot_y/plot_color ─► plot_next )* ─► plot_done
//! ```
//!
//! The cycle owns its copy of the roster, so inbound updates that land
//! mid-frame show up in the next cycle, never in the open one.

use crate::protocol::ProtocolError;
use crate::roster::Participant;

/// Immutable roster copy plus the local participant's color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotSnapshot {
    participants: Vec<Participant>,
    my_color: u32,
}

impl PlotSnapshot {
    pub fn new(participants: Vec<Participant>, my_color: u32) -> Self {
        Self {
            participants,
            my_color,
        }
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn my_color(&self) -> u32 {
        self.my_color
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }
}

/// Owned cursor over one snapshot.
#[derive(Debug)]
pub struct PlotCursor {
    snapshot: PlotSnapshot,
    index: usize,
}

impl PlotCursor {
    pub fn new(snapshot: PlotSnapshot) -> Self {
        Self { snapshot, index: 0 }
    }

    pub fn is_end(&self) -> bool {
        self.index >= self.snapshot.len()
    }

    pub fn current(&self) -> Result<&Participant, ProtocolError> {
        self.snapshot
            .participants
            .get(self.index)
            .ok_or(ProtocolError::CursorExhausted)
    }

    pub fn advance(&mut self) -> Result<(), ProtocolError> {
        if self.is_end() {
            return Err(ProtocolError::CursorExhausted);
        }
        self.index += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> &PlotSnapshot {
        &self.snapshot
    }
}

/// Holds at most one open plot cycle.
#[derive(Debug, Default)]
pub struct Plotter {
    cycle: Option<PlotCursor>,
}

impl Plotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.cycle.is_some()
    }

    /// Open a cycle over `snapshot`.
    pub fn start(&mut self, snapshot: PlotSnapshot) -> Result<(), ProtocolError> {
        if self.cycle.is_some() {
            return Err(ProtocolError::PlotAlreadyOpen);
        }
        self.cycle = Some(PlotCursor::new(snapshot));
        Ok(())
    }

    fn cursor(&self) -> Result<&PlotCursor, ProtocolError> {
        self.cycle.as_ref().ok_or(ProtocolError::NoOpenPlot)
    }

    pub fn end(&self) -> Result<bool, ProtocolError> {
        Ok(self.cursor()?.is_end())
    }

    pub fn x(&self) -> Result<i32, ProtocolError> {
        Ok(self.cursor()?.current()?.x)
    }

    pub fn y(&self) -> Result<i32, ProtocolError> {
        Ok(self.cursor()?.current()?.y)
    }

    pub fn color(&self) -> Result<u32, ProtocolError> {
        Ok(self.cursor()?.current()?.color)
    }

    /// Local color captured when the open cycle started.
    pub fn my_color(&self) -> Result<u32, ProtocolError> {
        Ok(self.cursor()?.snapshot().my_color())
    }

    pub fn next(&mut self) -> Result<(), ProtocolError> {
        self.cycle
            .as_mut()
            .ok_or(ProtocolError::NoOpenPlot)?
            .advance()
    }

    /// Close the open cycle and drop its snapshot.
    pub fn done(&mut self) -> Result<(), ProtocolError> {
        self.cycle.take().map(|_| ()).ok_or(ProtocolError::NoOpenPlot)
    }
}
