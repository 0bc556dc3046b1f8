//! Viseme timeline processing.
//!
//! Turns the provider's raw `(viseme id, audio offset)` stream into timed
//! blend-shape targets.

use colloquy_core::types::{ProcessedViseme, VisemeEvent};

/// Provider offsets are expressed in 100-ns ticks.
pub const TICKS_PER_SECOND: f64 = 10_000_000.0;

/// Duration given to the last viseme of an utterance.
pub const DEFAULT_VISEME_DURATION: f64 = 0.1;

/// Blend shape and peak weight for each provider viseme id (0..=21).
const VISEME_TABLE: [(&str, f64); 22] = [
    ("viseme_sil", 0.0),
    ("viseme_aa", 1.0),
    ("viseme_aa", 1.0),
    ("viseme_O", 0.9),
    ("viseme_E", 0.9),
    ("viseme_RR", 0.8),
    ("viseme_I", 0.9),
    ("viseme_U", 0.9),
    ("viseme_O", 1.0),
    ("viseme_aa", 0.9),
    ("viseme_O", 0.9),
    ("viseme_aa", 0.9),
    ("viseme_kk", 0.6),
    ("viseme_RR", 0.8),
    ("viseme_nn", 0.7),
    ("viseme_SS", 0.8),
    ("viseme_CH", 0.9),
    ("viseme_TH", 0.8),
    ("viseme_FF", 0.9),
    ("viseme_DD", 0.7),
    ("viseme_kk", 0.7),
    ("viseme_PP", 1.0),
];

/// Every blend shape the timeline can address.
pub const BLEND_SHAPES: [&str; 15] = [
    "viseme_sil",
    "viseme_PP",
    "viseme_FF",
    "viseme_TH",
    "viseme_DD",
    "viseme_kk",
    "viseme_CH",
    "viseme_SS",
    "viseme_nn",
    "viseme_RR",
    "viseme_aa",
    "viseme_E",
    "viseme_I",
    "viseme_O",
    "viseme_U",
];

/// Blend shape and weight for a provider viseme id; unknown ids map to silence.
pub fn blend_shape_for(viseme_id: u32) -> (&'static str, f64) {
    VISEME_TABLE
        .get(viseme_id as usize)
        .copied()
        .unwrap_or(VISEME_TABLE[0])
}

/// Convert raw viseme events into a timeline.
///
/// The duration of event *i* is the offset delta to event *i + 1*; the last
/// event gets [`DEFAULT_VISEME_DURATION`]. Start times never go backwards and
/// durations are never negative, even for out-of-order input.
pub fn process_queue(events: &[VisemeEvent]) -> Vec<ProcessedViseme> {
    let mut timeline = Vec::with_capacity(events.len());
    let mut floor_ticks = 0u64;

    for (i, event) in events.iter().enumerate() {
        let start_ticks = event.audio_offset_ticks.max(floor_ticks);
        floor_ticks = start_ticks;

        let duration_seconds = match events.get(i + 1) {
            Some(next) => next.audio_offset_ticks.saturating_sub(start_ticks) as f64 / TICKS_PER_SECOND,
            None => DEFAULT_VISEME_DURATION,
        };

        let (blend_shape, weight) = blend_shape_for(event.viseme_id);
        timeline.push(ProcessedViseme {
            blend_shape: blend_shape.to_string(),
            start_seconds: start_ticks as f64 / TICKS_PER_SECOND,
            duration_seconds,
            weight,
        });
    }

    timeline
}
