//! Frame-based signal descriptors from a decoded mono buffer.
//!
//! All levels are dBFS of 10 ms frames. Scores are 0..1. When the buffer is
//! shorter than `MIN_FRAMES` the result is entirely `None`.

use serde::{Deserialize, Serialize};

use crate::math::{clamp01, lin_to_db, mean, median, percentile};

const FRAME_SECS: f64 = 0.010;
/// Fewer frames than this and nothing is estimated.
pub const MIN_FRAMES: usize = 20;
const DB_FLOOR: f64 = -120.0;

// Noise floor / speech mask
const NOISE_BASE_PERCENTILE: f64 = 0.20;
const NON_SPEECH_PERCENTILE: f64 = 0.65;
const NEAR_SPEECH_PERCENTILE: f64 = 0.72;
const NEAR_SPEECH_RADIUS_FRAMES: usize = 35;
const SPEECH_MARGIN_DB: f64 = 11.0;

// Reverb tails
const TAIL_MIN_FRAMES: usize = 8;
const TAIL_PRE_FRAMES: usize = 5;
const TAIL_SHORT_FRAMES: usize = 3;
const REVERB_FALLBACK_MAX: f64 = 0.5;

// Echo
const ECHO_MIN_LAG_FRAMES: usize = 4;
const ECHO_MAX_LAG_FRAMES: usize = 18;
const ECHO_CORR_LOW: f64 = 0.16;
const ECHO_CORR_HIGH: f64 = 0.50;

// Room score weights
const ROOM_W_REVERB: f64 = 0.62;
const ROOM_W_ECHO: f64 = 0.28;
const ROOM_W_FLOOR: f64 = 0.10;

// Confidence
const CONFIDENCE_FULL_EVENTS: f64 = 6.0;
const CONFIDENCE_FULL_COVERAGE: f64 = 0.25;

// Instability: deltas between consecutive 100 ms loudness blocks inside
// speech, not frame-to-frame. The P85/P95 thresholds below were tuned on
// block deltas and need retuning if the block size changes.
const BLOCK_FRAMES: usize = 10;
const BLOCK_ACTIVE_RATIO: f64 = 0.6;
const MIN_INSTABILITY_DELTAS: usize = 4;
const INSTABILITY_P85_LOW: f64 = 1.7;
const INSTABILITY_P85_SPAN: f64 = 3.8;
const INSTABILITY_P95_LOW: f64 = 2.7;
const INSTABILITY_P95_SPAN: f64 = 5.4;
const INSTABILITY_LOW_COVERAGE: f64 = 0.2;

// Clicks
const CLICK_CREST_DB: f64 = 20.0;
const CLICK_MIN_PEAK_DB: f64 = -20.0;
const CLICK_SPEECH_WEIGHT: f64 = 0.5;
const CLICK_DENSITY_FULL: f64 = 0.025;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub noise_floor_db: Option<f64>,
    pub near_speech_floor_db: Option<f64>,
    pub speech_threshold_db: Option<f64>,
    pub speech_coverage: Option<f64>,
    pub reverb_score: Option<f64>,
    pub echo_score: Option<f64>,
    pub echo_lag_ms: Option<f64>,
    pub room_score: Option<f64>,
    pub analysis_confidence: Option<f64>,
    pub dryness_score: Option<f64>,
    pub instability_score: Option<f64>,
    pub click_score: Option<f64>,
    pub reverb_events: usize,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    rms: f64,
    rms_db: f64,
    peak_db: f64,
}

fn split_frames(samples: &[f32], sample_rate: u32) -> Vec<Frame> {
    let frame_len = ((sample_rate as f64 * FRAME_SECS).round() as usize).max(1);
    samples
        .chunks_exact(frame_len)
        .map(|chunk| {
            let mut sum_sq = 0.0f64;
            let mut peak = 0.0f64;
            for &s in chunk {
                let s = if s.is_finite() { s as f64 } else { 0.0 };
                sum_sq += s * s;
                peak = peak.max(s.abs());
            }
            let rms = (sum_sq / chunk.len() as f64).sqrt();
            Frame {
                rms,
                rms_db: lin_to_db(rms, DB_FLOOR),
                peak_db: lin_to_db(peak, DB_FLOOR),
            }
        })
        .collect()
}

/// Analyze a mono buffer. Never fails; short input yields an all-`None` record.
pub fn analyze_frames(samples: &[f32], sample_rate: u32) -> FrameMetrics {
    if sample_rate == 0 {
        return FrameMetrics::default();
    }
    let frames = split_frames(samples, sample_rate);
    if frames.len() < MIN_FRAMES {
        return FrameMetrics::default();
    }
    let levels: Vec<f64> = frames.iter().map(|f| f.rms_db).collect();

    let floor = estimate_noise_floor(&levels);
    let speech_threshold = floor.floor_db + SPEECH_MARGIN_DB;
    let mask: Vec<bool> = levels.iter().map(|&l| l > speech_threshold).collect();
    let speech_frames = mask.iter().filter(|&&m| m).count();
    let coverage = speech_frames as f64 / frames.len() as f64;

    let events = reverb_events(&levels, &mask, floor.floor_db);
    let reverb = match median(&events) {
        Some(m) => m,
        None => reverb_fallback(&levels),
    };

    let (echo, echo_lag) = echo_score(&frames);
    let floor_indicator = clamp01((floor.floor_db + 70.0) / 25.0);
    let room = clamp01(ROOM_W_REVERB * reverb + ROOM_W_ECHO * echo + ROOM_W_FLOOR * floor_indicator);

    let confidence = clamp01(
        0.6 * (events.len() as f64 / CONFIDENCE_FULL_EVENTS).min(1.0)
            + 0.4 * (coverage / CONFIDENCE_FULL_COVERAGE).min(1.0),
    );
    let dryness = 1.0 - clamp01(0.7 * reverb + 0.3 * echo);

    FrameMetrics {
        noise_floor_db: Some(floor.floor_db),
        near_speech_floor_db: floor.near_speech_db,
        speech_threshold_db: Some(speech_threshold),
        speech_coverage: Some(coverage),
        reverb_score: Some(clamp01(reverb)),
        echo_score: Some(echo),
        echo_lag_ms: echo_lag.map(|lag| lag as f64 * FRAME_SECS * 1000.0),
        room_score: Some(room),
        analysis_confidence: Some(confidence),
        dryness_score: Some(dryness),
        instability_score: instability_score(&levels, &mask, coverage),
        click_score: Some(click_score(&frames, &mask)),
        reverb_events: events.len(),
    }
}

// ── Noise floor ───────────────────────────────────────────────────────
// 20th percentile of all frames is the starting point. It is refined upward
// from the non-speech frames overall and from non-speech frames close to
// speech: noise sampled far away from any word tends to sit lower than what
// is heard in the pauses between words. The maximum of the three wins.

struct FloorEstimate {
    floor_db: f64,
    near_speech_db: Option<f64>,
}

fn estimate_noise_floor(levels: &[f64]) -> FloorEstimate {
    let base = percentile(levels, NOISE_BASE_PERCENTILE).unwrap_or(DB_FLOOR);
    let provisional: Vec<bool> = levels.iter().map(|&l| l > base + SPEECH_MARGIN_DB).collect();
    let near = near_speech(&provisional, NEAR_SPEECH_RADIUS_FRAMES);

    let non_speech: Vec<f64> = levels
        .iter()
        .zip(&provisional)
        .filter(|&(_, &speech)| !speech)
        .map(|(&l, _)| l)
        .collect();
    let near_levels: Vec<f64> = levels
        .iter()
        .enumerate()
        .filter(|&(i, _)| !provisional[i] && near[i])
        .map(|(_, &l)| l)
        .collect();

    let all_candidate = percentile(&non_speech, NON_SPEECH_PERCENTILE);
    let near_candidate = percentile(&near_levels, NEAR_SPEECH_PERCENTILE);

    let floor_db = [Some(base), all_candidate, near_candidate]
        .into_iter()
        .flatten()
        .fold(DB_FLOOR, f64::max);

    FloorEstimate {
        floor_db,
        near_speech_db: near_candidate,
    }
}

/// `true` for frames within `radius` frames of a speech frame.
fn near_speech(mask: &[bool], radius: usize) -> Vec<bool> {
    let n = mask.len();
    let mut dist = vec![usize::MAX; n];
    let mut last: Option<usize> = None;
    for i in 0..n {
        if mask[i] {
            last = Some(i);
        }
        if let Some(j) = last {
            dist[i] = i - j;
        }
    }
    let mut next: Option<usize> = None;
    for i in (0..n).rev() {
        if mask[i] {
            next = Some(i);
        }
        if let Some(j) = next {
            dist[i] = dist[i].min(j - i);
        }
    }
    dist.into_iter().map(|d| d <= radius).collect()
}

// ── Reverb ────────────────────────────────────────────────────────────
// At each speech→silence transition followed by a sustained pause, look at
// the decay. Dry rooms drop straight to the floor; reverberant rooms drop a
// little, keep decaying slowly, and the tail still sits above the floor.

fn reverb_events(levels: &[f64], mask: &[bool], floor_db: f64) -> Vec<f64> {
    let n = levels.len();
    let mut scores = Vec::new();

    for i in 1..n {
        if !(mask[i - 1] && !mask[i]) {
            continue;
        }
        if i + TAIL_MIN_FRAMES > n || mask[i..i + TAIL_MIN_FRAMES].iter().any(|&m| m) {
            continue;
        }

        let pre_start = i.saturating_sub(TAIL_PRE_FRAMES);
        let (Some(pre), Some(short), Some(long)) = (
            mean(&levels[pre_start..i]),
            mean(&levels[i..i + TAIL_SHORT_FRAMES]),
            mean(&levels[i + TAIL_SHORT_FRAMES..i + TAIL_MIN_FRAMES]),
        ) else {
            continue;
        };

        let drop = pre - short;
        let decay = short - long;
        let above_floor = long - floor_db;

        let drop_score = 1.0 - clamp01((drop - 6.0) / 18.0);
        let decay_score = 1.0 - clamp01(decay / 10.0);
        let tail_score = clamp01(above_floor / 12.0);
        // No tail above the floor means nothing rang out, however the drop looked.
        let tail_presence = clamp01(above_floor / 4.0);

        scores.push(clamp01(
            0.45 * tail_score + tail_presence * (0.30 * drop_score + 0.25 * decay_score),
        ));
    }

    scores
}

/// With no observable tails, a compressed level distribution is mild evidence of a live room.
fn reverb_fallback(levels: &[f64]) -> f64 {
    let spread = match (percentile(levels, 0.95), percentile(levels, 0.10)) {
        (Some(hi), Some(lo)) => hi - lo,
        _ => return 0.0,
    };
    REVERB_FALLBACK_MAX * (1.0 - clamp01((spread - 15.0) / 25.0))
}

// ── Echo ──────────────────────────────────────────────────────────────
// Autocorrelation of the differenced RMS envelope over 40-180 ms lags.
// Differencing removes the slow syllable envelope so only repeated onsets
// (discrete reflections) correlate.

fn echo_score(frames: &[Frame]) -> (f64, Option<usize>) {
    let diffs: Vec<f64> = frames.windows(2).map(|w| w[1].rms - w[0].rms).collect();
    let Some(m) = mean(&diffs) else {
        return (0.0, None);
    };
    let d: Vec<f64> = diffs.iter().map(|x| x - m).collect();
    let energy: f64 = d.iter().map(|x| x * x).sum();
    if energy <= 1e-12 {
        return (0.0, None);
    }

    let mut best: Option<(usize, f64)> = None;
    for lag in ECHO_MIN_LAG_FRAMES..=ECHO_MAX_LAG_FRAMES {
        if lag >= d.len() {
            break;
        }
        let r: f64 = d.iter().zip(&d[lag..]).map(|(a, b)| a * b).sum::<f64>() / energy;
        if best.is_none_or(|(_, br)| r > br) {
            best = Some((lag, r));
        }
    }

    match best {
        Some((lag, r)) => (
            clamp01((r - ECHO_CORR_LOW) / (ECHO_CORR_HIGH - ECHO_CORR_LOW)),
            Some(lag),
        ),
        None => (0.0, None),
    }
}

// ── Instability ───────────────────────────────────────────────────────
// Level jumps between consecutive 100 ms blocks inside speech. The 85th and
// 95th percentile of the jumps are rescaled and blended; low speech coverage
// damps the result since a handful of blocks is weak evidence.

fn instability_score(levels: &[f64], mask: &[bool], coverage: f64) -> Option<f64> {
    let blocks: Vec<Option<f64>> = levels
        .chunks(BLOCK_FRAMES)
        .zip(mask.chunks(BLOCK_FRAMES))
        .map(|(lv, mk)| {
            let active: Vec<f64> = lv.iter().zip(mk).filter(|&(_, &m)| m).map(|(&l, _)| l).collect();
            if active.len() as f64 >= BLOCK_ACTIVE_RATIO * lv.len() as f64 {
                mean(&active)
            } else {
                None
            }
        })
        .collect();

    let deltas: Vec<f64> = blocks
        .windows(2)
        .filter_map(|w| match (w[0], w[1]) {
            (Some(a), Some(b)) => Some((b - a).abs()),
            _ => None,
        })
        .collect();
    if deltas.len() < MIN_INSTABILITY_DELTAS {
        return None;
    }

    let p85 = percentile(&deltas, 0.85)?;
    let p95 = percentile(&deltas, 0.95)?;
    let s85 = clamp01((p85 - INSTABILITY_P85_LOW) / INSTABILITY_P85_SPAN);
    let s95 = clamp01((p95 - INSTABILITY_P95_LOW) / INSTABILITY_P95_SPAN);
    let mut score = 0.55 * s85 + 0.45 * s95;

    if coverage < INSTABILITY_LOW_COVERAGE {
        score *= 0.6 + 0.4 * (coverage / INSTABILITY_LOW_COVERAGE);
    }
    Some(clamp01(score))
}

// ── Clicks ────────────────────────────────────────────────────────────
// Loud frames with a very high crest factor. Clicks in pauses count fully,
// inside speech half (plosives look similar). Normalized by pause length.

fn click_score(frames: &[Frame], mask: &[bool]) -> f64 {
    let non_speech = mask.iter().filter(|&&m| !m).count().max(1);
    let weighted: f64 = frames
        .iter()
        .zip(mask)
        .filter(|(f, _)| f.peak_db - f.rms_db > CLICK_CREST_DB && f.peak_db > CLICK_MIN_PEAK_DB)
        .map(|(_, &speech)| if speech { CLICK_SPEECH_WEIGHT } else { 1.0 })
        .sum();
    clamp01(weighted / non_speech as f64 / CLICK_DENSITY_FULL)
}
