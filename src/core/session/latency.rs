//! Per-turn pipeline latency measurement.
//!
//! Each conversational turn passes four boundaries after capture:
//! transcription start, generation start, reply request, audio start.
//! The tracker records the delta between consecutive boundaries and
//! keeps a bounded ring of finalized entries per session.

use std::collections::HashMap;
use std::collections::VecDeque;

use serde::Serialize;
use tracing::warn;

/// Default number of finalized entries retained per session.
pub const DEFAULT_RING_CAPACITY: usize = 50;

/// The four ordered pipeline boundaries after capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    TranscriptionStart,
    GenerationStart,
    /// Synthesis request issued by a segmented pipeline. Native
    /// realtime providers infer the reply from the audio commit, so
    /// they never mark this boundary and the field stays `None`.
    ReplyRequest,
    AudioStart,
}

impl Stage {
    fn index(self) -> usize {
        match self {
            Stage::TranscriptionStart => 0,
            Stage::GenerationStart => 1,
            Stage::ReplyRequest => 2,
            Stage::AudioStart => 3,
        }
    }
}

/// Opaque reference to an open turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnRef(u64);

/// Stage durations for one completed turn. Missing stages are `None`,
/// never zero: a skipped boundary must stay distinguishable from an
/// instant one. Each filled field is the delta from the previous
/// *reached* boundary, so when a stage is skipped the next filled field
/// spans the gap and `total_ms` stays whole.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyEntry {
    pub captured_to_transcription_start_ms: Option<u64>,
    pub transcription_to_generation_start_ms: Option<u64>,
    pub generation_to_reply_request_ms: Option<u64>,
    pub reply_request_to_audio_start_ms: Option<u64>,
    pub total_ms: u64,
}

/// Running per-stage averages over the retained ring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyAverages {
    pub captured_to_transcription_start_ms: Option<f64>,
    pub transcription_to_generation_start_ms: Option<f64>,
    pub generation_to_reply_request_ms: Option<f64>,
    pub reply_request_to_audio_start_ms: Option<f64>,
    pub total_ms: Option<f64>,
    /// Number of finalized turns the averages cover
    pub sample_count: usize,
}

#[derive(Debug)]
struct OpenTurn {
    /// Timestamp of the most recent accepted mark (capture time until
    /// the first stage lands)
    last_mark_ms: u64,
    stages: [Option<u64>; 4],
}

/// Tracks latency boundaries per conversational turn.
#[derive(Debug)]
pub struct LatencyTracker {
    capacity: usize,
    next_turn: u64,
    open: HashMap<u64, OpenTurn>,
    ring: VecDeque<LatencyEntry>,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_turn: 0,
            open: HashMap::new(),
            ring: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Open a new turn captured at the given wall-clock instant.
    pub fn begin_turn(&mut self, captured_at_ms: u64) -> TurnRef {
        let id = self.next_turn;
        self.next_turn += 1;
        self.open.insert(
            id,
            OpenTurn {
                last_mark_ms: captured_at_ms,
                stages: [None; 4],
            },
        );
        TurnRef(id)
    }

    /// Record one pipeline boundary. The duration stored is the delta
    /// from the previous accepted mark (capture time for the first).
    /// Marks that run backwards in wall-clock order, or re-mark a filled
    /// stage, are rejected and logged rather than corrupting the total.
    /// Returns whether the mark was applied.
    pub fn mark_stage(&mut self, turn: TurnRef, stage: Stage, at_ms: u64) -> bool {
        let Some(open) = self.open.get_mut(&turn.0) else {
            warn!("Latency mark for unknown turn {:?}", turn);
            return false;
        };
        let idx = stage.index();
        if open.stages[idx].is_some() {
            warn!("Duplicate latency mark {stage:?} for turn {:?}, ignoring", turn);
            return false;
        }
        if at_ms < open.last_mark_ms {
            warn!(
                "Out-of-order latency mark {stage:?} for turn {:?} ({at_ms} < {}), ignoring",
                turn, open.last_mark_ms
            );
            return false;
        }
        open.stages[idx] = Some(at_ms - open.last_mark_ms);
        open.last_mark_ms = at_ms;
        true
    }

    /// Close a turn, computing `total_ms` as the sum of filled stages and
    /// appending the entry to the ring. Turns abandoned by barge-in are
    /// finalized with whatever stages were reached.
    pub fn finalize(&mut self, turn: TurnRef) -> Option<LatencyEntry> {
        let open = self.open.remove(&turn.0)?;
        let entry = LatencyEntry {
            captured_to_transcription_start_ms: open.stages[0],
            transcription_to_generation_start_ms: open.stages[1],
            generation_to_reply_request_ms: open.stages[2],
            reply_request_to_audio_start_ms: open.stages[3],
            total_ms: open.stages.iter().flatten().sum(),
        };
        if self.ring.len() >= self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(entry.clone());
        Some(entry)
    }

    /// Discard a turn without recording it (e.g. session teardown).
    pub fn abandon(&mut self, turn: TurnRef) {
        self.open.remove(&turn.0);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LatencyEntry> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Running averages over the retained ring. Each stage averages over
    /// the entries where that stage was actually reached.
    pub fn averages(&self) -> LatencyAverages {
        fn avg(values: impl Iterator<Item = u64>) -> Option<f64> {
            let mut sum = 0u64;
            let mut count = 0usize;
            for v in values {
                sum += v;
                count += 1;
            }
            (count > 0).then(|| sum as f64 / count as f64)
        }

        LatencyAverages {
            captured_to_transcription_start_ms: avg(
                self.ring
                    .iter()
                    .filter_map(|e| e.captured_to_transcription_start_ms),
            ),
            transcription_to_generation_start_ms: avg(
                self.ring
                    .iter()
                    .filter_map(|e| e.transcription_to_generation_start_ms),
            ),
            generation_to_reply_request_ms: avg(
                self.ring
                    .iter()
                    .filter_map(|e| e.generation_to_reply_request_ms),
            ),
            reply_request_to_audio_start_ms: avg(
                self.ring
                    .iter()
                    .filter_map(|e| e.reply_request_to_audio_start_ms),
            ),
            total_ms: avg(self.ring.iter().map(|e| e.total_ms)),
            sample_count: self.ring.len(),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_record_deltas_from_previous_mark() {
        let mut tracker = LatencyTracker::default();
        let turn = tracker.begin_turn(0);
        assert!(tracker.mark_stage(turn, Stage::TranscriptionStart, 120));
        assert!(tracker.mark_stage(turn, Stage::GenerationStart, 340));
        assert!(tracker.mark_stage(turn, Stage::ReplyRequest, 410));
        assert!(tracker.mark_stage(turn, Stage::AudioStart, 900));

        let entry = tracker.finalize(turn).unwrap();
        assert_eq!(entry.captured_to_transcription_start_ms, Some(120));
        assert_eq!(entry.transcription_to_generation_start_ms, Some(220));
        assert_eq!(entry.generation_to_reply_request_ms, Some(70));
        assert_eq!(entry.reply_request_to_audio_start_ms, Some(490));
        assert_eq!(entry.total_ms, 900);
    }

    #[test]
    fn abandoned_turn_keeps_reached_stages_and_nulls_rest() {
        let mut tracker = LatencyTracker::default();
        let turn = tracker.begin_turn(1000);
        tracker.mark_stage(turn, Stage::TranscriptionStart, 1150);

        let entry = tracker.finalize(turn).unwrap();
        assert_eq!(entry.captured_to_transcription_start_ms, Some(150));
        assert_eq!(entry.transcription_to_generation_start_ms, None);
        assert_eq!(entry.reply_request_to_audio_start_ms, None);
        assert_eq!(entry.total_ms, 150);
    }

    #[test]
    fn skipped_boundary_folds_into_the_next_delta() {
        let mut tracker = LatencyTracker::default();
        let turn = tracker.begin_turn(0);
        tracker.mark_stage(turn, Stage::TranscriptionStart, 100);
        tracker.mark_stage(turn, Stage::GenerationStart, 250);
        // Reply request never marked (native realtime): the audio delta
        // anchors to generation start and the skipped field stays None
        tracker.mark_stage(turn, Stage::AudioStart, 700);

        let entry = tracker.finalize(turn).unwrap();
        assert_eq!(entry.captured_to_transcription_start_ms, Some(100));
        assert_eq!(entry.transcription_to_generation_start_ms, Some(150));
        assert_eq!(entry.generation_to_reply_request_ms, None);
        assert_eq!(entry.reply_request_to_audio_start_ms, Some(450));
        assert_eq!(entry.total_ms, 700);
    }

    #[test]
    fn out_of_order_marks_are_rejected_not_applied() {
        let mut tracker = LatencyTracker::default();
        let turn = tracker.begin_turn(500);
        assert!(tracker.mark_stage(turn, Stage::TranscriptionStart, 700));
        // Walks backwards in wall-clock time
        assert!(!tracker.mark_stage(turn, Stage::GenerationStart, 600));
        // Duplicate
        assert!(!tracker.mark_stage(turn, Stage::TranscriptionStart, 800));

        let entry = tracker.finalize(turn).unwrap();
        assert_eq!(entry.captured_to_transcription_start_ms, Some(200));
        assert_eq!(entry.transcription_to_generation_start_ms, None);
        assert_eq!(entry.total_ms, 200);
    }

    #[test]
    fn ring_evicts_oldest_first_at_capacity() {
        let mut tracker = LatencyTracker::new(3);
        for i in 0..5u64 {
            let turn = tracker.begin_turn(i * 1000);
            tracker.mark_stage(turn, Stage::AudioStart, i * 1000 + 10 + i);
            tracker.finalize(turn);
        }
        assert_eq!(tracker.len(), 3);
        let totals: Vec<u64> = tracker.entries().map(|e| e.total_ms).collect();
        // The two oldest entries (10, 11) were evicted
        assert_eq!(totals, vec![12, 13, 14]);
    }

    #[test]
    fn averages_skip_missing_stages() {
        let mut tracker = LatencyTracker::default();
        let a = tracker.begin_turn(0);
        tracker.mark_stage(a, Stage::TranscriptionStart, 100);
        tracker.finalize(a);
        let b = tracker.begin_turn(0);
        tracker.mark_stage(b, Stage::TranscriptionStart, 300);
        tracker.mark_stage(b, Stage::GenerationStart, 400);
        tracker.finalize(b);

        let avgs = tracker.averages();
        assert_eq!(avgs.sample_count, 2);
        assert_eq!(avgs.captured_to_transcription_start_ms, Some(200.0));
        // Only one sample reached generation start
        assert_eq!(avgs.transcription_to_generation_start_ms, Some(100.0));
        assert_eq!(avgs.total_ms, Some(250.0));
    }

    #[test]
    fn unknown_turn_marks_are_ignored() {
        let mut tracker = LatencyTracker::default();
        let turn = tracker.begin_turn(0);
        tracker.finalize(turn);
        assert!(!tracker.mark_stage(turn, Stage::AudioStart, 100));
        assert!(tracker.finalize(turn).is_none());
    }
}
