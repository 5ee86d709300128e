//! Cursor resynchronization against a beat grid
//!
//! Binary searches instead of walking from the first beat, so seeks deep
//! into long tracks stay cheap.

use crate::beatgrid::BeatGrid;

pub struct CursorSync;

impl CursorSync {
    /// Index of the first beat at or after `time` (`grid.len()` past the end)
    pub fn locate(grid: &BeatGrid, time: f64) -> usize {
        grid.events().partition_point(|e| e.time < time)
    }

    /// Index of the last beat at or before `time`
    pub fn current(grid: &BeatGrid, time: f64) -> Option<usize> {
        grid.events()
            .partition_point(|e| e.time <= time)
            .checked_sub(1)
    }

    /// Cursor to continue from after a pause at `time`.
    ///
    /// Beats already announced ahead of the playhead are not announced again.
    pub fn resume(grid: &BeatGrid, cursor: usize, time: f64) -> usize {
        cursor.max(Self::locate(grid, time)).min(grid.len())
    }
}
