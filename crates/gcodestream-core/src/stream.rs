//! Stream reader contract
//!
//! A stream reader yields the rows of a program lazily as [`GcodeCommand`]s.
//! Concrete readers (in-memory and file-backed) live in `gcodestream-gcode`.

use crate::command::GcodeCommand;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Lazy, finite producer of program rows
pub trait GcodeStreamReader: Send {
    /// Next row, or `None` once the program is exhausted.
    ///
    /// Rows with nothing to send after comment stripping are still returned;
    /// the flow controller marks them skipped.
    fn next_command(&mut self) -> Result<Option<GcodeCommand>>;

    /// Total rows in the program
    fn num_rows(&self) -> usize;

    /// Rows handed out so far, including rows skipped by a start row
    fn rows_read(&self) -> usize;

    /// Rows not yet handed out
    fn rows_remaining(&self) -> usize {
        self.num_rows().saturating_sub(self.rows_read())
    }

    /// Modal setup line to send before the first row, when streaming starts
    /// part-way into the program
    fn preamble(&self) -> Option<String> {
        None
    }
}

/// Row counters of a stream, monotonically increasing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProgress {
    /// Rows in the program
    pub total_rows: usize,
    /// Rows written to the transport
    pub sent_rows: usize,
    /// Rows completed, skipped rows included
    pub completed_rows: usize,
    /// Rows that completed with an error
    pub error_rows: usize,
}

impl StreamProgress {
    /// Completed fraction in percent
    pub fn percent_complete(&self) -> f64 {
        if self.total_rows == 0 {
            return 100.0;
        }
        (self.completed_rows as f64 / self.total_rows as f64) * 100.0
    }
}
