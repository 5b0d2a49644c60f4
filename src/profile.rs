//! Adaptive profile synthesis: measurements + batch reference + toggles →
//! concrete, range-clamped processing parameters.
//!
//! `build_profile` is a pure function composed of small scoring stages
//! (tonal, dynamics, risk, cleanup, scene). Every numeric output passes
//! through `clamp_finite`, so no input (including NaN) can produce an
//! out-of-range parameter.

use serde::{Deserialize, Serialize};

use crate::analyzer::SignalMetrics;
use crate::math::{clamp01, clamp_finite, finite};
use crate::reference::BatchReference;

// Defaults when no batch reference exists
const DEFAULT_LOW_MID_TILT: f64 = -3.0;
const DEFAULT_HIGH_MID_TILT: f64 = -14.0;
const DEFAULT_LOUDNESS_RANGE: f64 = 7.0;

// Tonal nudges
const HIGHPASS_BASE_HZ: f64 = 80.0;
const HIGHPASS_HZ_PER_DB: f64 = 4.0;
pub const HIGHPASS_RANGE: (f64, f64) = (65.0, 105.0);
pub const LOW_MID_GAIN_RANGE: (f64, f64) = (-3.0, 1.5);
pub const PRESENCE_GAIN_RANGE: (f64, f64) = (-2.5, 2.5);
pub const AIR_GAIN_RANGE: (f64, f64) = (-2.0, 2.0);
pub const HARSH_PRESENCE_RANGE: (f64, f64) = (0.0, 4.0);
pub const HARSH_AIR_RANGE: (f64, f64) = (0.0, 3.0);

// Dynamics
pub const COMP_RATIO_OFFSET_RANGE: (f64, f64) = (-1.0, 0.5);
pub const COMP_THRESHOLD_OFFSET_RANGE: (f64, f64) = (-3.0, 4.0);
pub const LEVELER_TRIM_RANGE: (f64, f64) = (-4.0, 2.0);
const LEVELER_TRIM_REF_LUFS: f64 = -20.0;
const HOT_PEAK_FLOOR_DB: f64 = -6.0;

// Noise risk
const NOISE_HIGH_DB: f64 = -52.0;
const NOISE_MEDIUM_DB: f64 = -62.0;
const SPEECH_THRESHOLD_BUMP_DB: f64 = -44.0;
const SPEECH_THRESHOLD_BUMP2_DB: f64 = -40.0;

// Room risk
const ROOM_HIGH: f64 = 0.55;
const ROOM_MEDIUM: f64 = 0.32;
pub const MIN_CONFIDENCE: f64 = 0.35;

// Cleanup gates
const PRESERVE_INSTABILITY: f64 = 0.55;
const PRESERVE_MAX_ECHO: f64 = 0.7;
const ECHO_NOTCH_MIN: f64 = 0.3;
pub const ECHO_NOTCH_RANGE: (f64, f64) = (0.0, 6.0);
const CLICK_TAMER_MIN: f64 = 0.25;

// Scene blend
const SCENE_EARLY_GAIN: f64 = 0.22;
const SCENE_LATE_GAIN: f64 = 0.12;
pub const SCENE_EARLY_DELAY_RANGE: (f64, f64) = (8.0, 30.0);
pub const SCENE_LATE_DELAY_RANGE: (f64, f64) = (35.0, 90.0);

// Floor levels carried to the compiler
pub const NOISE_FLOOR_RANGE: (f64, f64) = (-90.0, -20.0);
pub const SPEECH_THRESHOLD_RANGE: (f64, f64) = (-80.0, -10.0);
const FALLBACK_NOISE_FLOOR_DB: f64 = -70.0;
const FALLBACK_SPEECH_THRESHOLD_DB: f64 = -50.0;

/// Tone/dynamics match strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SmartMatch {
    Off,
    Gentle,
    #[default]
    Balanced,
    Strong,
}

impl SmartMatch {
    pub fn tone_strength(self) -> f64 {
        match self {
            SmartMatch::Off => 0.0,
            SmartMatch::Gentle => 0.35,
            SmartMatch::Balanced => 0.6,
            SmartMatch::Strong => 0.85,
        }
    }

    pub fn dynamics_strength(self) -> f64 {
        match self {
            SmartMatch::Off => 0.0,
            SmartMatch::Gentle => 0.3,
            SmartMatch::Balanced => 0.55,
            SmartMatch::Strong => 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    fn raise(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            _ => RiskLevel::High,
        }
    }

    fn lower(self) -> Self {
        match self {
            RiskLevel::High => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FloorGuard {
    Off,
    Soft,
    Firm,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileOptions {
    pub smart_match: SmartMatch,
    pub room_cleanup: bool,
    pub scene_blend: bool,
    pub noise_guard: bool,
}

impl ProfileOptions {
    pub fn any_enabled(&self) -> bool {
        self.smart_match != SmartMatch::Off || self.room_cleanup || self.scene_blend || self.noise_guard
    }
}

/// Two simulated reflection paths.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SceneBlend {
    pub early_gain: f64,
    pub early_delay_ms: f64,
    pub late_gain: f64,
    pub late_delay_ms: f64,
}

impl SceneBlend {
    const AUDIBLE_GAIN: f64 = 0.005;

    pub fn is_audible(&self) -> bool {
        self.early_gain >= Self::AUDIBLE_GAIN || self.late_gain >= Self::AUDIBLE_GAIN
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveProfile {
    pub highpass_hz: f64,
    pub low_mid_gain_db: f64,
    pub presence_gain_db: f64,
    pub air_gain_db: f64,
    pub harsh_presence_cut_db: f64,
    pub harsh_air_cut_db: f64,

    pub leveling_need: f64,
    pub emotion_protection: f64,
    pub comp_ratio_offset: f64,
    pub comp_threshold_offset_db: f64,
    pub leveler_trim_db: f64,

    pub floor_guard: FloorGuard,
    pub noise_risk: RiskLevel,
    pub room_risk: RiskLevel,
    pub tail_gate: bool,
    pub tail_gate_strength: f64,
    pub echo_notch_db: f64,
    pub click_tamer_strength: f64,

    pub room_score: f64,
    pub echo_score: f64,
    pub instability: f64,
    pub click_score: f64,
    pub noise_floor_db: f64,
    pub speech_threshold_db: f64,

    pub scene: SceneBlend,
}

impl AdaptiveProfile {
    /// Profile with no adaptive modifiers. Used when no profile exists and
    /// for the stability-safe strategy.
    pub fn neutral() -> Self {
        Self {
            highpass_hz: HIGHPASS_BASE_HZ,
            low_mid_gain_db: 0.0,
            presence_gain_db: 0.0,
            air_gain_db: 0.0,
            harsh_presence_cut_db: 0.0,
            harsh_air_cut_db: 0.0,
            leveling_need: 0.0,
            emotion_protection: 0.0,
            comp_ratio_offset: 0.0,
            comp_threshold_offset_db: 0.0,
            leveler_trim_db: 0.0,
            floor_guard: FloorGuard::Off,
            noise_risk: RiskLevel::Low,
            room_risk: RiskLevel::Low,
            tail_gate: false,
            tail_gate_strength: 0.0,
            echo_notch_db: 0.0,
            click_tamer_strength: 0.0,
            room_score: 0.0,
            echo_score: 0.0,
            instability: 0.0,
            click_score: 0.0,
            noise_floor_db: FALLBACK_NOISE_FLOOR_DB,
            speech_threshold_db: FALLBACK_SPEECH_THRESHOLD_DB,
            scene: SceneBlend::default(),
        }
    }
}

struct Tonal {
    highpass_hz: f64,
    low_mid_gain_db: f64,
    presence_gain_db: f64,
    air_gain_db: f64,
    harsh_presence_cut_db: f64,
    harsh_air_cut_db: f64,
    /// Brightness relative to the reference, dB (positive = brighter).
    high_delta: f64,
}

/// Move tonal parameters proportionally to the deviation from the reference.
fn tonal(metrics: &SignalMetrics, reference: Option<&BatchReference>, tone: f64) -> Tonal {
    let ref_low = reference.map(|r| r.low_mid_tilt).unwrap_or(DEFAULT_LOW_MID_TILT);
    let ref_high = reference.map(|r| r.high_mid_tilt).unwrap_or(DEFAULT_HIGH_MID_TILT);
    let low_delta = finite(metrics.low_mid_tilt()).map(|t| t - ref_low).unwrap_or(0.0);
    let high_delta = finite(metrics.high_mid_tilt()).map(|t| t - ref_high).unwrap_or(0.0);

    let hp = HIGHPASS_BASE_HZ + low_delta * HIGHPASS_HZ_PER_DB * tone;
    Tonal {
        highpass_hz: clamp_finite(hp, HIGHPASS_RANGE.0, HIGHPASS_RANGE.1, HIGHPASS_BASE_HZ),
        low_mid_gain_db: clamp_finite(-0.5 * low_delta * tone, LOW_MID_GAIN_RANGE.0, LOW_MID_GAIN_RANGE.1, 0.0),
        presence_gain_db: clamp_finite(-0.4 * high_delta * tone, PRESENCE_GAIN_RANGE.0, PRESENCE_GAIN_RANGE.1, 0.0),
        air_gain_db: clamp_finite(-0.3 * high_delta * tone, AIR_GAIN_RANGE.0, AIR_GAIN_RANGE.1, 0.0),
        harsh_presence_cut_db: clamp_finite(
            0.35 * high_delta.max(0.0) * tone,
            HARSH_PRESENCE_RANGE.0,
            HARSH_PRESENCE_RANGE.1,
            0.0,
        ),
        harsh_air_cut_db: clamp_finite(0.25 * high_delta.max(0.0) * tone, HARSH_AIR_RANGE.0, HARSH_AIR_RANGE.1, 0.0),
        high_delta,
    }
}

struct Dynamics {
    leveling_need: f64,
    emotion_protection: f64,
    comp_ratio_offset: f64,
    comp_threshold_offset_db: f64,
    leveler_trim_db: f64,
}

/// Loud, bright, wide files get gentler leveling; flat, narrow files more.
fn dynamics(metrics: &SignalMetrics, reference: Option<&BatchReference>, high_delta: f64, strength: f64) -> Dynamics {
    let ref_lra = reference
        .and_then(|r| finite(r.loudness_range))
        .unwrap_or(DEFAULT_LOUDNESS_RANGE);
    let lra = finite(metrics.loudness_range).unwrap_or(ref_lra);

    let hot = finite(metrics.true_peak_db)
        .map(|tp| clamp01((tp - HOT_PEAK_FLOOR_DB) / -HOT_PEAK_FLOOR_DB))
        .unwrap_or(0.0);
    let bright = clamp01(high_delta / 6.0);
    let wide = clamp01((lra - ref_lra) / 6.0);
    let narrow = clamp01((ref_lra - lra) / 4.0);

    let emotion = clamp01((0.4 * hot + 0.25 * bright + 0.35 * wide) * strength);
    let leveling = clamp01(strength * (0.6 - 0.6 * emotion + 0.4 * narrow));

    let trim = finite(metrics.integrated_lufs)
        .map(|i| (LEVELER_TRIM_REF_LUFS - i) * 0.3 * strength)
        .unwrap_or(0.0);

    Dynamics {
        leveling_need: leveling,
        emotion_protection: emotion,
        comp_ratio_offset: clamp_finite(
            strength * (0.5 * narrow - emotion),
            COMP_RATIO_OFFSET_RANGE.0,
            COMP_RATIO_OFFSET_RANGE.1,
            0.0,
        ),
        comp_threshold_offset_db: clamp_finite(
            strength * (4.0 * emotion - 2.0 * narrow),
            COMP_THRESHOLD_OFFSET_RANGE.0,
            COMP_THRESHOLD_OFFSET_RANGE.1,
            0.0,
        ),
        leveler_trim_db: clamp_finite(trim, LEVELER_TRIM_RANGE.0, LEVELER_TRIM_RANGE.1, 0.0),
    }
}

/// Noise risk from the louder of the two floor estimates, escalated when the
/// speech threshold itself sits high.
pub fn noise_risk(metrics: &SignalMetrics) -> RiskLevel {
    let f = &metrics.frames;
    let floor = match (finite(f.noise_floor_db), finite(f.near_speech_floor_db)) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    let mut risk = match floor {
        Some(db) if db > NOISE_HIGH_DB => RiskLevel::High,
        Some(db) if db > NOISE_MEDIUM_DB => RiskLevel::Medium,
        _ => RiskLevel::Low,
    };
    if let Some(t) = finite(f.speech_threshold_db) {
        if t > SPEECH_THRESHOLD_BUMP_DB {
            risk = risk.raise();
        }
        if t > SPEECH_THRESHOLD_BUMP2_DB {
            risk = risk.raise();
        }
    }
    risk
}

/// Room risk from the confidence-scaled room score; low confidence
/// always downgrades one level.
pub fn room_risk(metrics: &SignalMetrics) -> RiskLevel {
    let f = &metrics.frames;
    let confidence = finite(f.analysis_confidence).map(clamp01).unwrap_or(0.0);
    let Some(room) = finite(f.room_score).map(clamp01) else {
        return RiskLevel::Low;
    };
    let scaled = room * (0.5 + 0.5 * confidence);
    let risk = if scaled >= ROOM_HIGH {
        RiskLevel::High
    } else if scaled >= ROOM_MEDIUM {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    };
    if confidence < MIN_CONFIDENCE { risk.lower() } else { risk }
}

struct Cleanup {
    tail_gate: bool,
    tail_gate_strength: f64,
    echo_notch_db: f64,
    click_tamer_strength: f64,
    floor_guard: FloorGuard,
}

fn cleanup(metrics: &SignalMetrics, options: &ProfileOptions, noise: RiskLevel, room: RiskLevel) -> Cleanup {
    let f = &metrics.frames;
    let confidence = finite(f.analysis_confidence).map(clamp01).unwrap_or(0.0);
    let room_score = finite(f.room_score).map(clamp01).unwrap_or(0.0);
    let echo = finite(f.echo_score).map(clamp01).unwrap_or(0.0);
    let instability = finite(f.instability_score).map(clamp01).unwrap_or(0.0);
    let clicks = finite(f.click_score).map(clamp01).unwrap_or(0.0);

    // Unstable but clean speech keeps its sentence endings.
    let preserve_endings =
        noise == RiskLevel::Low && instability >= PRESERVE_INSTABILITY && echo < PRESERVE_MAX_ECHO;
    let room_allowed = options.room_cleanup && confidence >= MIN_CONFIDENCE && !preserve_endings;

    let tail_gate = room_allowed && room != RiskLevel::Low;
    let echo_notch_db = if room_allowed && echo >= ECHO_NOTCH_MIN {
        (echo - ECHO_NOTCH_MIN) / (1.0 - ECHO_NOTCH_MIN) * ECHO_NOTCH_RANGE.1
    } else {
        0.0
    };

    let floor_guard = if !options.noise_guard {
        FloorGuard::Off
    } else {
        match noise {
            RiskLevel::High => FloorGuard::Firm,
            RiskLevel::Medium => FloorGuard::Soft,
            RiskLevel::Low => FloorGuard::Off,
        }
    };

    Cleanup {
        tail_gate,
        tail_gate_strength: if tail_gate {
            clamp01(room_score * (0.5 + 0.5 * confidence))
        } else {
            0.0
        },
        echo_notch_db: clamp_finite(echo_notch_db, ECHO_NOTCH_RANGE.0, ECHO_NOTCH_RANGE.1, 0.0),
        click_tamer_strength: if clicks >= CLICK_TAMER_MIN { clicks } else { 0.0 },
        floor_guard,
    }
}

/// Reflection gains collapse toward zero when any risk axis is high.
fn scene(metrics: &SignalMetrics, options: &ProfileOptions, noise: RiskLevel, room: RiskLevel) -> SceneBlend {
    if !options.scene_blend {
        return SceneBlend::default();
    }
    let f = &metrics.frames;
    let echo = finite(f.echo_score).map(clamp01).unwrap_or(0.0);
    let instability = finite(f.instability_score).map(clamp01).unwrap_or(0.0);
    let dryness = finite(f.dryness_score).map(clamp01).unwrap_or(0.5);

    let room_factor = match room {
        RiskLevel::High => 0.15,
        RiskLevel::Medium => 0.55,
        RiskLevel::Low => 1.0,
    };
    let noise_factor = match noise {
        RiskLevel::High => 0.2,
        RiskLevel::Medium => 0.6,
        RiskLevel::Low => 1.0,
    };
    let damp = room_factor * noise_factor * (1.0 - 0.8 * echo) * (1.0 - 0.7 * instability);

    SceneBlend {
        early_gain: clamp_finite(SCENE_EARLY_GAIN * damp, 0.0, SCENE_EARLY_GAIN, 0.0),
        early_delay_ms: clamp_finite(
            12.0 + 18.0 * dryness,
            SCENE_EARLY_DELAY_RANGE.0,
            SCENE_EARLY_DELAY_RANGE.1,
            SCENE_EARLY_DELAY_RANGE.0,
        ),
        late_gain: clamp_finite(SCENE_LATE_GAIN * damp, 0.0, SCENE_LATE_GAIN, 0.0),
        late_delay_ms: clamp_finite(
            45.0 + 45.0 * dryness,
            SCENE_LATE_DELAY_RANGE.0,
            SCENE_LATE_DELAY_RANGE.1,
            SCENE_LATE_DELAY_RANGE.0,
        ),
    }
}

/// Build the per-file profile. `None` when no adaptive feature is enabled.
pub fn build_profile(
    metrics: &SignalMetrics,
    reference: Option<&BatchReference>,
    options: &ProfileOptions,
) -> Option<AdaptiveProfile> {
    if !options.any_enabled() {
        return None;
    }
    let f = &metrics.frames;

    let tonal = tonal(metrics, reference, options.smart_match.tone_strength());
    let dynamics = dynamics(metrics, reference, tonal.high_delta, options.smart_match.dynamics_strength());
    let noise = noise_risk(metrics);
    let room = room_risk(metrics);
    let cleanup = cleanup(metrics, options, noise, room);
    let scene = scene(metrics, options, noise, room);

    Some(AdaptiveProfile {
        highpass_hz: tonal.highpass_hz,
        low_mid_gain_db: tonal.low_mid_gain_db,
        presence_gain_db: tonal.presence_gain_db,
        air_gain_db: tonal.air_gain_db,
        harsh_presence_cut_db: tonal.harsh_presence_cut_db,
        harsh_air_cut_db: tonal.harsh_air_cut_db,
        leveling_need: dynamics.leveling_need,
        emotion_protection: dynamics.emotion_protection,
        comp_ratio_offset: dynamics.comp_ratio_offset,
        comp_threshold_offset_db: dynamics.comp_threshold_offset_db,
        leveler_trim_db: dynamics.leveler_trim_db,
        floor_guard: cleanup.floor_guard,
        noise_risk: noise,
        room_risk: room,
        tail_gate: cleanup.tail_gate,
        tail_gate_strength: cleanup.tail_gate_strength,
        echo_notch_db: cleanup.echo_notch_db,
        click_tamer_strength: cleanup.click_tamer_strength,
        room_score: finite(f.room_score).map(clamp01).unwrap_or(0.0),
        echo_score: finite(f.echo_score).map(clamp01).unwrap_or(0.0),
        instability: finite(f.instability_score).map(clamp01).unwrap_or(0.0),
        click_score: finite(f.click_score).map(clamp01).unwrap_or(0.0),
        noise_floor_db: clamp_finite(
            f.noise_floor_db.unwrap_or(FALLBACK_NOISE_FLOOR_DB),
            NOISE_FLOOR_RANGE.0,
            NOISE_FLOOR_RANGE.1,
            FALLBACK_NOISE_FLOOR_DB,
        ),
        speech_threshold_db: clamp_finite(
            f.speech_threshold_db.unwrap_or(FALLBACK_SPEECH_THRESHOLD_DB),
            SPEECH_THRESHOLD_RANGE.0,
            SPEECH_THRESHOLD_RANGE.1,
            FALLBACK_SPEECH_THRESHOLD_DB,
        ),
        scene,
    })
}
