//! Filter-chain compiler: profile + toggles + strategy flags → ordered,
//! conflict-free stage list for the rendering engine.
//!
//! Stage order is fixed:
//! highpass → low-mid EQ → noise reduction → click tamer → one floor-control
//! stage → presence/air EQ → echo notches → room cut → leveler → compressor →
//! scene reflections → limiter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::{clamp_finite, db_to_lin, nearest_odd};
use crate::profile::{AdaptiveProfile, FloorGuard, RiskLevel};

// Tonal cleanup
const LOW_MID_HZ: f64 = 250.0;
const PRESENCE_HZ: f64 = 3500.0;
const AIR_HZ: f64 = 8000.0;
const MIN_EQ_GAIN_DB: f64 = 0.1;
/// Static cuts applied by the soften-harshness toggle.
const SOFTEN_PRESENCE_CUT_DB: f64 = 1.5;
const SOFTEN_AIR_CUT_DB: f64 = 1.0;
const PRESENCE_NET_RANGE: (f64, f64) = (-6.0, 3.0);
const AIR_NET_RANGE: (f64, f64) = (-5.0, 3.0);

// Room
const ECHO_NOTCH_HZ: f64 = 400.0;
const ECHO_NOTCH_MIN_DB: f64 = 0.5;
const ECHO_SECOND_NOTCH_DB: f64 = 2.5;
const ECHO_THIRD_NOTCH_DB: f64 = 4.0;
const TAIL_GATE_MEDIUM_ECHO: f64 = 0.3;
const ROOM_CUT_HZ: f64 = 500.0;
const ROOM_CUT_MIN_SCORE: f64 = 0.32;

// Leveler (dynaudnorm)
const LEVELER_FRAME_MS: u32 = 250;
const LEVELER_WINDOW_BASE: f64 = 31.0;
const LEVELER_WINDOW_RANGE: (u32, u32) = (11, 61);
const LEVELER_MAX_GAIN_BASE: f64 = 10.0;
const LEVELER_MAX_GAIN_RANGE: (f64, f64) = (2.0, 20.0);
const LEVELER_PEAK_DB: f64 = -3.0;
const NOISE_MEDIUM_MIN_WINDOW: f64 = 27.0;
const NOISE_MEDIUM_MAX_GAIN: f64 = 10.0;
const NOISE_HIGH_MIN_WINDOW: f64 = 41.0;
const NOISE_HIGH_MAX_GAIN: f64 = 6.0;

// Compressor
const COMP_THRESHOLD_DB: f64 = -20.0;
const COMP_RATIO: f64 = 3.0;
const COMP_ATTACK_MS: f64 = 12.0;
const COMP_RELEASE_MS: f64 = 120.0;
const COMP_PER_STAGE_THRESHOLD_DB: f64 = 0.75;
const COMP_PER_STAGE_RATIO: f64 = 0.15;
pub const COMP_THRESHOLD_RANGE: (f64, f64) = (-30.0, -8.0);
pub const COMP_RATIO_RANGE: (f64, f64) = (1.5, 4.5);
pub const COMP_ATTACK_RANGE: (f64, f64) = (5.0, 40.0);
pub const COMP_RELEASE_RANGE: (f64, f64) = (60.0, 400.0);
pub const COMP_MIX_RANGE: (f64, f64) = (0.6, 1.0);

const LIMITER_CEILING_DB: f64 = -1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Highpass,
    LowMidEq,
    NoiseReduction,
    ClickTamer,
    TailGate,
    BreathCompand,
    FloorGuard,
    PresenceEq,
    AirEq,
    EchoNotch,
    RoomCut,
    Leveler,
    Compressor,
    SceneBlend,
    Limiter,
}

impl StageKind {
    pub fn is_floor_control(self) -> bool {
        matches!(self, StageKind::TailGate | StageKind::BreathCompand | StageKind::FloorGuard)
    }

    /// Corrective stages ahead of the compressor that it compensates for.
    fn relaxes_compressor(self) -> bool {
        !matches!(
            self,
            StageKind::Highpass
                | StageKind::Leveler
                | StageKind::Compressor
                | StageKind::SceneBlend
                | StageKind::Limiter
        )
    }
}

/// One engine filter with its parameter string.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub filter: &'static str,
    pub params: String,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.filter, self.params)
    }
}

/// User-facing processing toggles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RenderToggles {
    pub noise_reduction: bool,
    pub breath_control: bool,
    pub soften_harshness: bool,
    pub room_cleanup: bool,
}

impl Default for RenderToggles {
    fn default() -> Self {
        Self {
            noise_reduction: true,
            breath_control: false,
            soften_harshness: true,
            room_cleanup: true,
        }
    }
}

/// Force-disable flags set by the fallback cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompileOptions {
    pub disable_room_cleanup: bool,
    pub disable_noise_reduction: bool,
    /// Leveler, compressor and limiter only, with neutral parameters.
    pub stability_safe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MixTarget {
    Clean,
    Scene,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterChain {
    stages: Vec<Stage>,
}

/// The three passes of a split render.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitChain {
    pub pre: FilterChain,
    pub noise_reduction: FilterChain,
    pub limiter: FilterChain,
}

impl FilterChain {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn has(&self, kind: StageKind) -> bool {
        self.stages.iter().any(|s| s.kind == kind)
    }

    pub fn count(&self, kind: StageKind) -> usize {
        self.stages.iter().filter(|s| s.kind == kind).count()
    }

    pub fn floor_controls(&self) -> usize {
        self.stages.iter().filter(|s| s.kind.is_floor_control()).count()
    }

    /// Comma-joined graph. An empty chain renders as a pass-through.
    pub fn graph(&self) -> String {
        if self.stages.is_empty() {
            return "anull".to_string();
        }
        self.stages.iter().map(Stage::to_string).collect::<Vec<_>>().join(",")
    }

    /// Everything except noise reduction and the limiter, then noise
    /// reduction alone, then the limiter. `None` without a noise-reduction stage.
    pub fn split(&self) -> Option<SplitChain> {
        if !self.has(StageKind::NoiseReduction) {
            return None;
        }
        let pick = |f: &dyn Fn(StageKind) -> bool| FilterChain {
            stages: self.stages.iter().filter(|s| f(s.kind)).cloned().collect(),
        };
        Some(SplitChain {
            pre: pick(&|k| k != StageKind::NoiseReduction && k != StageKind::Limiter),
            noise_reduction: pick(&|k| k == StageKind::NoiseReduction),
            limiter: pick(&|k| k == StageKind::Limiter),
        })
    }

    fn push(&mut self, kind: StageKind, filter: &'static str, params: String) {
        self.stages.push(Stage { kind, filter, params });
    }

    fn upstream_corrections(&self) -> usize {
        self.stages.iter().filter(|s| s.kind.relaxes_compressor()).count()
    }
}

fn equalizer(freq: f64, width: f64, gain_db: f64) -> String {
    format!("f={freq:.0}:t=q:w={width:.2}:g={gain_db:.2}")
}

fn floor_control(profile: &AdaptiveProfile, toggles: &RenderToggles, room_active: bool) -> Option<(StageKind, &'static str, String)> {
    let tail_gate_wins = room_active
        && profile.tail_gate
        && (profile.room_risk == RiskLevel::High
            || (profile.room_risk == RiskLevel::Medium && profile.echo_score >= TAIL_GATE_MEDIUM_ECHO));
    if tail_gate_wins {
        let s = profile.tail_gate_strength;
        let threshold = db_to_lin(profile.speech_threshold_db - 4.0);
        let range = db_to_lin(-(6.0 + 12.0 * s));
        return Some((
            StageKind::TailGate,
            "agate",
            format!(
                "threshold={threshold:.6}:ratio={:.2}:range={range:.4}:attack=5:release={:.0}",
                2.0 + 2.0 * s,
                120.0 + 130.0 * s
            ),
        ));
    }

    let guard_preferred = profile.floor_guard != FloorGuard::Off
        && (profile.noise_risk != RiskLevel::Low || !toggles.breath_control);
    if guard_preferred {
        let (above_floor, range_db, ratio) = match profile.floor_guard {
            FloorGuard::Firm => (6.0, -14.0, 2.5),
            _ => (4.0, -8.0, 1.5),
        };
        let threshold = db_to_lin(profile.noise_floor_db + above_floor);
        return Some((
            StageKind::FloorGuard,
            "agate",
            format!(
                "threshold={threshold:.6}:ratio={ratio:.2}:range={:.4}:attack=10:release=250",
                db_to_lin(range_db)
            ),
        ));
    }

    if toggles.breath_control {
        let knee = clamp_finite(profile.noise_floor_db + 12.0, -70.0, -35.0, -55.0);
        return Some((
            StageKind::BreathCompand,
            "compand",
            format!(
                "attacks=0.01:decays=0.2:points=-90/-90|{knee:.1}/{:.1}|{:.1}/{:.1}|0/0",
                knee - 8.0,
                knee + 8.0,
                knee + 8.0
            ),
        ));
    }
    None
}

/// Leveler window (odd, frames) and gain ceiling. Instability widens first,
/// noise risk then clamps.
pub fn leveler_window(profile: &AdaptiveProfile) -> (u32, f64) {
    let mut g = LEVELER_WINDOW_BASE - 10.0 * profile.leveling_need - 8.0 * profile.instability;
    let mut m = LEVELER_MAX_GAIN_BASE + 6.0 * profile.leveling_need + 4.0 * profile.instability;
    match profile.noise_risk {
        RiskLevel::High => {
            g = g.max(NOISE_HIGH_MIN_WINDOW);
            m = m.min(NOISE_HIGH_MAX_GAIN);
        }
        RiskLevel::Medium => {
            g = g.max(NOISE_MEDIUM_MIN_WINDOW);
            m = m.min(NOISE_MEDIUM_MAX_GAIN);
        }
        RiskLevel::Low => {}
    }
    (
        nearest_odd(g, LEVELER_WINDOW_RANGE.0, LEVELER_WINDOW_RANGE.1),
        clamp_finite(m, LEVELER_MAX_GAIN_RANGE.0, LEVELER_MAX_GAIN_RANGE.1, LEVELER_MAX_GAIN_BASE),
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorParams {
    pub threshold_db: f64,
    pub ratio: f64,
    pub attack_ms: f64,
    pub release_ms: f64,
    pub mix: f64,
}

/// Base preset, relaxed by every upstream correction and by room, echo and
/// instability pressure.
pub fn compressor_params(profile: &AdaptiveProfile, upstream: usize) -> CompressorParams {
    let n = upstream as f64;
    let mut threshold = COMP_THRESHOLD_DB + COMP_PER_STAGE_THRESHOLD_DB * n + profile.comp_threshold_offset_db;
    let mut ratio = COMP_RATIO - COMP_PER_STAGE_RATIO * n + profile.comp_ratio_offset;
    let mut attack = COMP_ATTACK_MS;
    let mut release = COMP_RELEASE_MS;
    let mut mix = 1.0;

    match profile.room_risk {
        RiskLevel::High => {
            threshold += 2.0;
            ratio -= 0.4;
            release += 60.0;
        }
        RiskLevel::Medium => {
            threshold += 1.0;
            ratio -= 0.2;
            release += 30.0;
        }
        RiskLevel::Low => {}
    }

    threshold += 1.5 * profile.echo_score;
    ratio -= 0.3 * profile.echo_score;

    ratio -= 0.5 * profile.instability;
    attack += 8.0 * profile.instability;
    release += 80.0 * profile.instability;
    mix -= 0.25 * profile.instability;

    CompressorParams {
        threshold_db: clamp_finite(threshold, COMP_THRESHOLD_RANGE.0, COMP_THRESHOLD_RANGE.1, COMP_THRESHOLD_DB),
        ratio: clamp_finite(ratio, COMP_RATIO_RANGE.0, COMP_RATIO_RANGE.1, COMP_RATIO),
        attack_ms: clamp_finite(attack, COMP_ATTACK_RANGE.0, COMP_ATTACK_RANGE.1, COMP_ATTACK_MS),
        release_ms: clamp_finite(release, COMP_RELEASE_RANGE.0, COMP_RELEASE_RANGE.1, COMP_RELEASE_MS),
        mix: clamp_finite(mix, COMP_MIX_RANGE.0, COMP_MIX_RANGE.1, 1.0),
    }
}

/// Compile the chain. Deterministic for identical inputs.
pub fn compile(
    profile: Option<&AdaptiveProfile>,
    toggles: &RenderToggles,
    options: &CompileOptions,
    target: MixTarget,
) -> FilterChain {
    let neutral = AdaptiveProfile::neutral();
    let p = match profile {
        Some(p) if !options.stability_safe => p,
        _ => &neutral,
    };
    let mut chain = FilterChain::default();

    if !options.stability_safe {
        let room_active = toggles.room_cleanup && !options.disable_room_cleanup;

        chain.push(StageKind::Highpass, "highpass", format!("f={:.0}:poles=2", p.highpass_hz));
        if p.low_mid_gain_db.abs() >= MIN_EQ_GAIN_DB {
            chain.push(StageKind::LowMidEq, "equalizer", equalizer(LOW_MID_HZ, 1.0, p.low_mid_gain_db));
        }

        if toggles.noise_reduction && !options.disable_noise_reduction {
            let nr = match p.noise_risk {
                RiskLevel::High => 18,
                RiskLevel::Medium => 12,
                RiskLevel::Low => 8,
            };
            let nf = clamp_finite(p.noise_floor_db, -80.0, -20.0, -70.0);
            chain.push(StageKind::NoiseReduction, "afftdn", format!("nr={nr}:nf={nf:.0}:tn=1"));
        }

        if p.click_tamer_strength > 0.0 {
            let limit = db_to_lin(-1.0 - 5.0 * p.click_tamer_strength);
            chain.push(
                StageKind::ClickTamer,
                "alimiter",
                format!("limit={limit:.4}:attack=0.1:release=5:level=0"),
            );
        }

        if let Some((kind, filter, params)) = floor_control(p, toggles, room_active) {
            chain.push(kind, filter, params);
        }

        // Harshness softening and tone match merged into one gain per band.
        let soften = |base: f64, extra: f64| if toggles.soften_harshness { base + extra } else { 0.0 };
        let presence = clamp_finite(
            p.presence_gain_db - soften(SOFTEN_PRESENCE_CUT_DB, p.harsh_presence_cut_db),
            PRESENCE_NET_RANGE.0,
            PRESENCE_NET_RANGE.1,
            0.0,
        );
        let air = clamp_finite(
            p.air_gain_db - soften(SOFTEN_AIR_CUT_DB, p.harsh_air_cut_db),
            AIR_NET_RANGE.0,
            AIR_NET_RANGE.1,
            0.0,
        );
        if presence.abs() >= MIN_EQ_GAIN_DB {
            chain.push(StageKind::PresenceEq, "equalizer", equalizer(PRESENCE_HZ, 1.2, presence));
        }
        if air.abs() >= MIN_EQ_GAIN_DB {
            chain.push(StageKind::AirEq, "equalizer", equalizer(AIR_HZ, 1.0, air));
        }

        if room_active && p.echo_notch_db >= ECHO_NOTCH_MIN_DB {
            let d = p.echo_notch_db;
            chain.push(StageKind::EchoNotch, "equalizer", equalizer(ECHO_NOTCH_HZ, 2.0, -d));
            if d >= ECHO_SECOND_NOTCH_DB {
                chain.push(StageKind::EchoNotch, "equalizer", equalizer(ECHO_NOTCH_HZ * 2.0, 2.0, -0.6 * d));
            }
            if d >= ECHO_THIRD_NOTCH_DB {
                chain.push(StageKind::EchoNotch, "equalizer", equalizer(ECHO_NOTCH_HZ * 3.0, 2.0, -0.4 * d));
            }
        }

        if room_active && p.room_risk != RiskLevel::Low && p.room_score >= ROOM_CUT_MIN_SCORE {
            let cut = match p.room_risk {
                RiskLevel::High => clamp_finite(3.0 * p.room_score, 0.5, 3.0, 1.0),
                _ => clamp_finite(2.0 * p.room_score, 0.5, 1.5, 0.5),
            };
            chain.push(StageKind::RoomCut, "equalizer", equalizer(ROOM_CUT_HZ, 0.8, -cut));
        }
    }

    let (window, max_gain) = leveler_window(p);
    let peak = clamp_finite(db_to_lin(LEVELER_PEAK_DB + p.leveler_trim_db), 0.3, 0.95, 0.7);
    let gate = clamp_finite(db_to_lin(p.noise_floor_db + 3.0), 0.0, 0.1, 0.0);
    chain.push(
        StageKind::Leveler,
        "dynaudnorm",
        format!("f={LEVELER_FRAME_MS}:g={window}:p={peak:.3}:m={max_gain:.2}:t={gate:.6}"),
    );

    let c = compressor_params(p, chain.upstream_corrections());
    chain.push(
        StageKind::Compressor,
        "acompressor",
        format!(
            "threshold={:.6}:ratio={:.2}:attack={:.1}:release={:.0}:makeup=1:mix={:.2}",
            db_to_lin(c.threshold_db),
            c.ratio,
            c.attack_ms,
            c.release_ms,
            c.mix
        ),
    );

    if target == MixTarget::Scene && !options.stability_safe && p.scene.is_audible() {
        let s = &p.scene;
        let out_gain = 1.0 / (1.0 + s.early_gain + s.late_gain);
        chain.push(
            StageKind::SceneBlend,
            "aecho",
            format!(
                "in_gain=1:out_gain={out_gain:.3}:delays={:.0}|{:.0}:decays={:.3}|{:.3}",
                s.early_delay_ms,
                s.late_delay_ms,
                s.early_gain.max(0.001),
                s.late_gain.max(0.001)
            ),
        );
    }

    // Always last. Split renders run it as their own pass.
    chain.push(
        StageKind::Limiter,
        "alimiter",
        format!("limit={:.4}:attack=5:release=50:level=0", db_to_lin(LIMITER_CEILING_DB)),
    );

    chain
}
