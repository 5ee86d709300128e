//! Beat grid construction for the spoken dance count
//!
//! A grid is built in two passes. The skeleton pass lays down one event per
//! beat interval from the track offset to its end and never looks at
//! structural metadata. The labeling pass then assigns the 1-8 count and
//! bridge flags on top of the skeleton without moving any timestamp.

use tracing::{debug, warn};

/// Tolerance when matching a beat against a layout segment window (seconds)
pub const SEGMENT_TOLERANCE_SECS: f64 = 0.05;
/// Segments spanning fewer beats than this are treated as analysis noise
pub const MIN_SEGMENT_BEATS: usize = 4;
/// Length of a bridge in beats
pub const BRIDGE_BEATS: usize = 4;
/// Length of the verse that resumes after a bridge
pub const VERSE_BEATS: usize = 8;
/// Beats in one count cycle
pub const COUNT_LENGTH: usize = 8;

/// Tempo and first-beat position of a track
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackTiming {
    /// Beats per minute
    pub bpm: f64,
    /// Time of the first beat in seconds
    pub offset: f64,
}

impl TrackTiming {
    pub fn new(bpm: f64, offset: f64) -> Self {
        Self { bpm, offset }
    }

    /// Seconds between beats, or `None` when the tempo is unusable
    pub fn interval(&self) -> Option<f64> {
        if self.bpm.is_finite() && self.bpm > 0.0 {
            Some(60.0 / self.bpm)
        } else {
            None
        }
    }
}

/// A single labeled beat
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatEvent {
    /// Position in the track (seconds)
    pub time: f64,
    /// Count number, 1..=8
    pub number: u8,
    /// Whether the beat lies inside a bridge
    pub is_bridge: bool,
}

/// Count number a layout segment restarts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStart {
    One,
    Five,
}

impl RowStart {
    /// Parse the analyzer's `row1_start` value
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::One),
            5 => Some(Self::Five),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Five => 5,
        }
    }
}

/// A time window of the track with a resolved count phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayoutSegment {
    pub from_beat: u32,
    pub to_beat: u32,
    pub time_start: f64,
    pub time_end: f64,
    pub row1_start: RowStart,
}

impl LayoutSegment {
    /// Number of beats the segment declares
    pub fn beat_span(&self) -> usize {
        if self.to_beat < self.from_beat {
            0
        } else {
            (self.to_beat - self.from_beat) as usize + 1
        }
    }

    fn contains(&self, time: f64) -> bool {
        time >= self.time_start - SEGMENT_TOLERANCE_SECS
            && time <= self.time_end + SEGMENT_TOLERANCE_SECS
    }
}

/// Optional structure of a track produced by upstream analysis
///
/// When both lists are present the layout is authoritative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuralMetadata {
    /// Bridge start times in seconds
    pub bridges: Vec<f64>,
    /// Precomputed count layout
    pub layout: Vec<LayoutSegment>,
}

impl StructuralMetadata {
    pub fn with_bridges(bridges: Vec<f64>) -> Self {
        Self {
            bridges,
            layout: Vec::new(),
        }
    }

    pub fn with_layout(layout: Vec<LayoutSegment>) -> Self {
        Self {
            bridges: Vec::new(),
            layout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty() && self.layout.is_empty()
    }
}

/// Which labeling path produced a grid's numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Labeling {
    /// Plain modulo-8 counting over the whole track
    #[default]
    Uniform,
    /// Count restarts synthesized from bridge timestamps
    Bridges,
    /// Count phases taken from a layout segment list
    Layout,
}

/// Ordered, immutable sequence of beats covering a track
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BeatGrid {
    events: Vec<BeatEvent>,
    interval: f64,
    labeling: Labeling,
}

impl BeatGrid {
    /// A grid with no beats
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[BeatEvent] {
        &self.events
    }

    pub fn get(&self, index: usize) -> Option<&BeatEvent> {
        self.events.get(index)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Seconds between consecutive beats (0.0 for an empty grid)
    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn labeling(&self) -> Labeling {
        self.labeling
    }

    pub fn iter(&self) -> impl Iterator<Item = &BeatEvent> {
        self.events.iter()
    }
}

/// A point where the bridge path restarts the count at 1
#[derive(Debug, Clone, Copy)]
struct Restart {
    index: usize,
    declared_beats: usize,
    is_bridge: bool,
}

/// Builds beat grids from track timing and optional structure
#[derive(Debug, Clone)]
pub struct BeatGridBuilder {
    min_segment_beats: usize,
}

impl Default for BeatGridBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BeatGridBuilder {
    pub fn new() -> Self {
        Self {
            min_segment_beats: MIN_SEGMENT_BEATS,
        }
    }

    /// Build the grid for a track of `duration` seconds
    ///
    /// Never fails: unusable input yields an empty grid and unusable
    /// structure yields plain modulo-8 counting.
    pub fn build(
        &self,
        timing: TrackTiming,
        duration: f64,
        structure: Option<&StructuralMetadata>,
    ) -> BeatGrid {
        let Some(interval) = timing.interval() else {
            debug!(bpm = timing.bpm, "unusable tempo, empty beat grid");
            return BeatGrid::empty();
        };
        if !(duration.is_finite() && duration > 0.0) {
            debug!(duration, "unusable duration, empty beat grid");
            return BeatGrid::empty();
        }

        let offset = if timing.offset.is_finite() && timing.offset >= 0.0 {
            timing.offset
        } else {
            warn!(offset = timing.offset, "invalid beat offset, counting from 0");
            0.0
        };

        let mut events = Self::skeleton(offset, interval, duration);

        // A layout, even an unusable one, takes the bridges out of play
        let labeling = match structure {
            Some(s) if !s.layout.is_empty() => {
                if self.label_by_layout(&mut events, &s.layout, interval) {
                    Labeling::Layout
                } else {
                    Labeling::Uniform
                }
            }
            Some(s) if !s.bridges.is_empty() && self.label_by_bridges(&mut events, &s.bridges, offset, interval) => {
                Labeling::Bridges
            }
            _ => Labeling::Uniform,
        };

        debug!(
            beats = events.len(),
            interval,
            ?labeling,
            "beat grid built"
        );

        BeatGrid {
            events,
            interval,
            labeling,
        }
    }

    /// One event per interval, numbered 1-8 from the first beat.
    ///
    /// Times are `offset + i * interval` so long tracks never accumulate drift.
    fn skeleton(offset: f64, interval: f64, duration: f64) -> Vec<BeatEvent> {
        let mut events = Vec::with_capacity(initial_capacity(offset, interval, duration));

        let mut index = 0usize;
        loop {
            let time = offset + index as f64 * interval;
            if time > duration {
                break;
            }
            events.push(BeatEvent {
                time,
                number: count_number(1, index as i64),
                is_bridge: false,
            });
            index += 1;
        }

        events
    }

    /// Label from a layout segment list. Leaves `events` untouched and
    /// returns false when no usable segment covers any beat.
    fn label_by_layout(
        &self,
        events: &mut [BeatEvent],
        layout: &[LayoutSegment],
        interval: f64,
    ) -> bool {
        let mut segments: Vec<&LayoutSegment> = layout
            .iter()
            .filter(|s| {
                let usable = s.time_start.is_finite()
                    && s.time_end.is_finite()
                    && s.time_end >= s.time_start
                    && s.beat_span() >= self.min_segment_beats;
                if !usable {
                    warn!(
                        from_beat = s.from_beat,
                        to_beat = s.to_beat,
                        "ignoring inconsistent layout segment"
                    );
                }
                usable
            })
            .collect();
        segments.sort_by(|a, b| a.time_start.total_cmp(&b.time_start));

        let covers_any = events
            .iter()
            .any(|e| segments.iter().any(|s| s.contains(e.time)));
        if !covers_any {
            warn!(
                segments = layout.len(),
                "layout covers no beat, falling back"
            );
            return false;
        }

        for event in events.iter_mut() {
            let segment = Self::segment_for(&segments, event.time);
            let local_index = ((event.time - segment.time_start) / interval).round() as i64;
            event.number = count_number(segment.row1_start.number(), local_index);
            event.is_bridge = false;
        }

        true
    }

    /// Segment owning `time`: the containing one, else the nearest earlier
    /// one, clamping to the first segment for beats before the layout.
    fn segment_for<'a>(segments: &[&'a LayoutSegment], time: f64) -> &'a LayoutSegment {
        if let Some(segment) = segments.iter().find(|s| s.contains(time)) {
            return segment;
        }
        segments
            .iter()
            .rev()
            .find(|s| s.time_start <= time)
            .unwrap_or(&segments[0])
    }

    /// Label from bridge timestamps. Leaves `events` untouched and returns
    /// false when no bridge survives validation.
    fn label_by_bridges(
        &self,
        events: &mut [BeatEvent],
        bridges: &[f64],
        offset: f64,
        interval: f64,
    ) -> bool {
        let len = events.len();
        let mut restarts: Vec<Restart> = Vec::with_capacity(bridges.len() * 2);
        let mut previous: Option<f64> = None;

        for &time in bridges {
            if !time.is_finite() || previous.is_some_and(|p| time <= p) {
                warn!(time, "bridge timestamp out of order, ignored");
                continue;
            }
            previous = Some(time);

            let Some(bridge_index) = nearest_index(len, offset, interval, time) else {
                warn!(time, "bridge outside the track, ignored");
                continue;
            };
            // A new bridge supersedes whatever an earlier one scheduled from here on
            restarts.retain(|r| r.index < bridge_index);
            restarts.push(Restart {
                index: bridge_index,
                declared_beats: BRIDGE_BEATS,
                is_bridge: true,
            });

            let verse_start = time + BRIDGE_BEATS as f64 * interval;
            if let Some(verse_index) = nearest_index(len, offset, interval, verse_start) {
                restarts.push(Restart {
                    index: verse_index,
                    declared_beats: VERSE_BEATS,
                    is_bridge: false,
                });
            }
        }

        let kept: Vec<(Restart, usize)> = restarts
            .iter()
            .enumerate()
            .filter_map(|(i, restart)| {
                let next = restarts.get(i + 1).map_or(len, |n| n.index);
                let span = restart.declared_beats.min(next - restart.index);
                if span < self.min_segment_beats {
                    warn!(
                        beat = restart.index,
                        span,
                        "segment shorter than {} beats, ignored",
                        self.min_segment_beats
                    );
                    None
                } else {
                    Some((*restart, span))
                }
            })
            .collect();

        if kept.is_empty() {
            return false;
        }

        let mut count_start = 0usize;
        let mut pending = kept.iter().peekable();
        for (index, event) in events.iter_mut().enumerate() {
            if pending.next_if(|(r, _)| r.index == index).is_some() {
                count_start = index;
            }
            event.number = count_number(1, (index - count_start) as i64);
            event.is_bridge = false;
        }

        for (restart, span) in kept.iter().filter(|(r, _)| r.is_bridge) {
            for event in &mut events[restart.index..restart.index + span] {
                event.is_bridge = true;
            }
        }

        true
    }
}

/// Upper bound on the up-front allocation, longer grids grow as needed
const MAX_PREALLOCATED_BEATS: usize = 1 << 16;

/// Expected beat count, bounded so absurd durations cannot overflow the allocation
fn initial_capacity(offset: f64, interval: f64, duration: f64) -> usize {
    let estimate = ((duration - offset) / interval).max(0.0) as usize;
    estimate.saturating_add(1).min(MAX_PREALLOCATED_BEATS)
}

/// Count number `local_index` beats after a beat numbered `first`
fn count_number(first: u8, local_index: i64) -> u8 {
    let cycle = COUNT_LENGTH as i64;
    ((((first as i64 - 1 + local_index) % cycle) + cycle) % cycle + 1) as u8
}

/// Index of the skeleton beat nearest `time`, if it falls within the grid
fn nearest_index(len: usize, offset: f64, interval: f64, time: f64) -> Option<usize> {
    let position = ((time - offset) / interval).round();
    if position < 0.0 || position >= len as f64 {
        None
    } else {
        Some(position as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers(grid: &BeatGrid) -> Vec<u8> {
        grid.iter().map(|e| e.number).collect()
    }

    fn segment(from_beat: u32, to_beat: u32, start: f64, end: f64, row: RowStart) -> LayoutSegment {
        LayoutSegment {
            from_beat,
            to_beat,
            time_start: start,
            time_end: end,
            row1_start: row,
        }
    }

    #[test]
    fn test_example_track() {
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.2), 4.2, None);

        assert_eq!(grid.len(), 9);
        let expected = [0.2, 0.7, 1.2, 1.7, 2.2, 2.7, 3.2, 3.7, 4.2];
        for (event, want) in grid.iter().zip(expected) {
            assert!((event.time - want).abs() < 1e-9, "{} != {}", event.time, want);
            assert!(!event.is_bridge);
        }
        assert_eq!(numbers(&grid), vec![1, 2, 3, 4, 5, 6, 7, 8, 1]);
        assert_eq!(grid.labeling(), Labeling::Uniform);
    }

    #[test]
    fn test_uniform_spacing_and_coverage() {
        let builder = BeatGridBuilder::new();
        for (bpm, offset, duration) in [(97.3, 0.37, 600.0), (128.0, 0.0, 3600.0), (60.5, 1.9, 45.0)] {
            let grid = builder.build(TrackTiming::new(bpm, offset), duration, None);
            let interval = 60.0 / bpm;

            for pair in grid.events().windows(2) {
                let gap = pair[1].time - pair[0].time;
                assert!((gap - interval).abs() < 1e-9, "gap {} at bpm {}", gap, bpm);
            }

            let last = grid.events().last().unwrap();
            assert!(last.time <= duration);
            assert!(last.time + interval > duration);
        }
    }

    #[test]
    fn test_cyclic_numbering() {
        let grid = BeatGridBuilder::new().build(TrackTiming::new(132.0, 0.5), 120.0, None);
        for (i, event) in grid.iter().enumerate() {
            assert_eq!(event.number as usize, i % 8 + 1);
        }
    }

    #[test]
    fn test_invalid_input_gives_empty_grid() {
        let builder = BeatGridBuilder::new();
        assert!(builder.build(TrackTiming::new(0.0, 0.0), 10.0, None).is_empty());
        assert!(builder.build(TrackTiming::new(-90.0, 0.0), 10.0, None).is_empty());
        assert!(builder.build(TrackTiming::new(f64::NAN, 0.0), 10.0, None).is_empty());
        assert!(builder.build(TrackTiming::new(120.0, 0.0), 0.0, None).is_empty());
        assert!(builder.build(TrackTiming::new(120.0, 0.0), -3.0, None).is_empty());
    }

    #[test]
    fn test_offset_past_end_gives_empty_grid() {
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 12.0), 10.0, None);
        assert!(grid.is_empty());
    }

    #[test]
    fn test_negative_offset_counts_from_zero() {
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, -1.0), 2.0, None);
        assert_eq!(grid.get(0).map(|e| e.time), Some(0.0));
    }

    #[test]
    fn test_bridge_resets_count() {
        // interval 0.5s; bridge lands on beat index 21 (t = 10.5)
        let structure = StructuralMetadata::with_bridges(vec![10.52]);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 30.0, Some(&structure));
        assert_eq!(grid.labeling(), Labeling::Bridges);

        let nearest = grid
            .iter()
            .position(|e| (e.time - 10.5).abs() < 1e-9)
            .unwrap();
        let events = grid.events();

        assert_eq!(events[nearest].number, 1);
        for event in &events[nearest..nearest + 4] {
            assert!(event.is_bridge);
        }
        assert_eq!(
            events[nearest..nearest + 4].iter().map(|e| e.number).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        let verse = &events[nearest + 4];
        assert_eq!(verse.number, 1);
        assert!(!verse.is_bridge);
        assert!(!events[nearest - 1].is_bridge);

        // Count before the bridge is untouched
        assert_eq!(events[nearest - 1].number as usize, (nearest - 1) % 8 + 1);
        // Verse continues cycling after its 8 beats
        assert_eq!(events[nearest + 12].number, 1);
    }

    #[test]
    fn test_bridges_never_move_timestamps() {
        let builder = BeatGridBuilder::new();
        let timing = TrackTiming::new(123.4, 0.81);
        let plain = builder.build(timing, 200.0, None);
        let structure = StructuralMetadata::with_bridges(vec![31.3, 77.0, 140.2]);
        let bridged = builder.build(timing, 200.0, Some(&structure));

        assert_eq!(plain.len(), bridged.len());
        for (a, b) in plain.iter().zip(bridged.iter()) {
            assert_eq!(a.time, b.time);
        }
        assert_eq!(bridged.iter().filter(|e| e.is_bridge).count(), 12);
    }

    #[test]
    fn test_out_of_order_bridge_ignored() {
        let structure = StructuralMetadata::with_bridges(vec![20.0, 10.0]);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 40.0, Some(&structure));

        assert_eq!(grid.iter().filter(|e| e.is_bridge).count(), 4);
        let first_bridge = grid.iter().position(|e| e.is_bridge).unwrap();
        assert!((grid.events()[first_bridge].time - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_bridge_too_close_to_next_is_noise() {
        // Second bridge starts two beats into the first one
        let structure = StructuralMetadata::with_bridges(vec![10.0, 11.0]);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 40.0, Some(&structure));

        let flagged: Vec<f64> = grid.iter().filter(|e| e.is_bridge).map(|e| e.time).collect();
        assert_eq!(flagged, vec![11.0, 11.5, 12.0, 12.5]);
    }

    #[test]
    fn test_bridges_outside_track_fall_back_to_uniform() {
        let structure = StructuralMetadata::with_bridges(vec![500.0]);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 20.0, Some(&structure));
        assert_eq!(grid.labeling(), Labeling::Uniform);
        assert!(grid.iter().all(|e| !e.is_bridge));
    }

    #[test]
    fn test_layout_row_five_and_clamping() {
        let layout = vec![
            segment(5, 12, 2.2, 5.7, RowStart::One),
            segment(13, 20, 6.2, 9.7, RowStart::Five),
        ];
        let structure = StructuralMetadata::with_layout(layout);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.2), 12.0, Some(&structure));
        assert_eq!(grid.labeling(), Labeling::Layout);

        let number_at = |t: f64| grid.iter().find(|e| (e.time - t).abs() < 1e-9).unwrap().number;

        // Before the first segment: counted backwards from its phase
        assert_eq!(number_at(0.2), 5);
        assert_eq!(number_at(2.2), 1);
        assert_eq!(number_at(5.7), 8);
        // Second segment restarts on 5
        assert_eq!(number_at(6.2), 5);
        assert_eq!(number_at(7.7), 8);
        assert_eq!(number_at(8.2), 1);
        // Past the last segment: its phase continues
        assert_eq!(number_at(10.2), 5);
    }

    #[test]
    fn test_layout_wins_over_bridges() {
        let structure = StructuralMetadata {
            bridges: vec![4.0],
            layout: vec![segment(1, 40, 0.0, 19.5, RowStart::Five)],
        };
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 20.0, Some(&structure));

        assert_eq!(grid.labeling(), Labeling::Layout);
        assert_eq!(grid.get(0).map(|e| e.number), Some(5));
        assert!(grid.iter().all(|e| !e.is_bridge));
    }

    #[test]
    fn test_layout_outside_track_falls_through() {
        let structure = StructuralMetadata {
            bridges: vec![5.0],
            layout: vec![segment(1, 16, 100.0, 107.5, RowStart::One)],
        };
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 20.0, Some(&structure));
        assert_eq!(grid.labeling(), Labeling::Uniform);
        assert!(grid.iter().all(|e| !e.is_bridge));
        for (i, event) in grid.iter().enumerate() {
            assert_eq!(event.number, (i % 8) as u8 + 1);
        }
    }

    fn layout_phase_at_boundary(second_start: f64) -> u8 {
        let layout = vec![
            segment(1, 7, 0.0, 3.4, RowStart::One),
            segment(8, 16, second_start, 7.5, RowStart::Five),
        ];
        let structure = StructuralMetadata::with_layout(layout);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 8.0, Some(&structure));
        assert_eq!(grid.labeling(), Labeling::Layout);
        grid.get(7).map(|e| e.number).unwrap()
    }

    #[test]
    fn test_layout_tolerance_claims_early_beat() {
        // Beat at 3.5 s lies 30 ms before the second segment
        assert_eq!(layout_phase_at_boundary(3.53), 5);
    }

    #[test]
    fn test_layout_tolerance_is_bounded() {
        // 60 ms early is outside the window, the first segment's phase continues
        assert_eq!(layout_phase_at_boundary(3.56), 8);
    }

    #[test]
    fn test_initial_capacity_is_bounded() {
        assert_eq!(initial_capacity(0.0, 0.5, 4.0), 9);
        assert_eq!(initial_capacity(10.0, 0.5, 4.0), 1);
        assert_eq!(initial_capacity(0.0, 0.5, 1e15), MAX_PREALLOCATED_BEATS);
        assert_eq!(initial_capacity(0.0, 1e-300, f64::MAX), MAX_PREALLOCATED_BEATS);
    }

    #[test]
    fn test_short_layout_segment_ignored() {
        let structure = StructuralMetadata::with_layout(vec![segment(1, 2, 0.0, 0.5, RowStart::Five)]);
        let grid = BeatGridBuilder::new().build(TrackTiming::new(120.0, 0.0), 10.0, Some(&structure));
        assert_eq!(grid.labeling(), Labeling::Uniform);
        assert_eq!(grid.get(0).map(|e| e.number), Some(1));
    }

    #[test]
    fn test_count_number_wraps_both_ways() {
        assert_eq!(count_number(1, 0), 1);
        assert_eq!(count_number(1, 8), 1);
        assert_eq!(count_number(5, 3), 8);
        assert_eq!(count_number(5, 4), 1);
        assert_eq!(count_number(1, -1), 8);
        assert_eq!(count_number(5, -12), 1);
    }
}
