//! Per-file render orchestration against one engine instance.
//!
//! A file walks `Idle → WritingInput → Rendering(strategy) → Rendered | Failed`.
//! Strategies are tried in `Strategy::CASCADE` order. Inside a strategy the
//! single pass may be followed by a split render (stage incompatibility) and
//! a segmented render (long input, non-fatal failure). A fatal fault poisons
//! the engine slot; the fresh instance is used by the next strategy.

pub mod loudness;
pub mod rolling;

use std::fmt;

use serde::Serialize;

use crate::analyzer::{analyze_input, AnalyzeError, SignalMetrics};
use crate::chain::{compile, CompileOptions, FilterChain, MixTarget, RenderToggles};
use crate::engine::{EngineError, EngineFactory, EngineRequest, EngineSlot, RenderEngine, Span};
use crate::profile::AdaptiveProfile;
use rolling::{classify_failure, run_logged, summarize_failure, FailureKind, RollingLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Primary,
    NoRoomCleanup,
    NoNoiseReduction,
    NoRoomNoNoise,
    StabilitySafe,
}

impl Strategy {
    pub const CASCADE: [Strategy; 5] = [
        Strategy::Primary,
        Strategy::NoRoomCleanup,
        Strategy::NoNoiseReduction,
        Strategy::NoRoomNoNoise,
        Strategy::StabilitySafe,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Primary => "primary",
            Strategy::NoRoomCleanup => "no-room-cleanup",
            Strategy::NoNoiseReduction => "no-noise-reduction",
            Strategy::NoRoomNoNoise => "no-room-no-noise",
            Strategy::StabilitySafe => "stability-safe",
        }
    }

    pub fn compile_options(self) -> CompileOptions {
        CompileOptions {
            disable_room_cleanup: matches!(self, Strategy::NoRoomCleanup | Strategy::NoRoomNoNoise),
            disable_noise_reduction: matches!(self, Strategy::NoNoiseReduction | Strategy::NoRoomNoNoise),
            stability_safe: self == Strategy::StabilitySafe,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderPath {
    Single,
    Split,
    Segmented,
}

/// One try of one path of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attempt {
    pub strategy: Strategy,
    pub path: RenderPath,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderState {
    Idle,
    WritingInput,
    Rendering(Strategy),
    Rendered,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub state: RenderState,
    pub output: Option<Vec<u8>>,
    /// `None` for a clean primary pass.
    pub fallback_applied: Option<String>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub sample_rate: u32,
    /// Inputs at least this long get a segmented retry.
    pub segment_min_secs: f64,
    pub segment_secs: f64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            segment_min_secs: 600.0,
            segment_secs: 120.0,
        }
    }
}

/// One mix of one file.
pub struct RenderJob<'a> {
    /// Prefix for temporary virtual files.
    pub base: &'a str,
    pub input_name: &'a str,
    pub input: &'a [u8],
    pub duration_secs: Option<f64>,
    pub profile: Option<&'a AdaptiveProfile>,
    pub toggles: RenderToggles,
    pub target: MixTarget,
}

/// A failed step, already classified.
#[derive(Debug, Clone)]
struct Failure {
    kind: FailureKind,
    reason: String,
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure {
            kind: FailureKind::Render,
            reason: e.to_string(),
        }
    }
}

/// Owns the engine slot and the rolling log. All engine work for a batch
/// goes through one orchestrator, one request at a time.
pub struct RenderOrchestrator<F: EngineFactory> {
    slot: EngineSlot<F>,
    log: RollingLog,
    settings: RenderSettings,
    /// Input currently present in the engine, with the generation it was written to.
    loaded: Option<(String, u64)>,
}

impl<F: EngineFactory> RenderOrchestrator<F> {
    pub fn new(factory: F, settings: RenderSettings, log_capacity: usize) -> Self {
        Self {
            slot: EngineSlot::new(factory),
            log: RollingLog::new(log_capacity),
            settings,
            loaded: None,
        }
    }

    /// Start the engine eagerly so an unusable engine is reported up front.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        self.slot.acquire().await.map(|_| ())
    }

    /// Periodic teardown + reinit.
    pub async fn recycle(&mut self) -> Result<(), EngineError> {
        self.loaded = None;
        self.slot.recycle().await
    }

    pub fn recycle_count(&self) -> u64 {
        self.slot.recycle_count()
    }

    pub async fn shutdown(&mut self) {
        self.loaded = None;
        self.slot.release().await;
    }

    /// Make sure `name` holds `bytes` in the current engine instance.
    /// A recycled instance starts empty, so the input is written again.
    async fn ensure_input(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        self.slot.acquire().await?;
        let generation = self.slot.generation();
        let present = matches!(&self.loaded, Some((n, g)) if n == name && *g == generation);
        if !present {
            self.slot.acquire().await?.write_file(name, bytes).await?;
            self.loaded = Some((name.to_string(), generation));
        }
        Ok(())
    }

    /// Delete the input from the engine once the caller is done with it.
    pub async fn release_input(&mut self, name: &str) {
        if matches!(&self.loaded, Some((n, _)) if n == name) {
            self.loaded = None;
            if let Ok(engine) = self.slot.acquire().await {
                engine.delete_file(name).await.ok();
            }
        }
    }

    /// Measure one input. A fatal fault poisons the engine before returning.
    pub async fn analyze(&mut self, name: &str, bytes: &[u8]) -> Result<SignalMetrics, AnalyzeError> {
        self.ensure_input(name, bytes).await?;
        let engine = self.slot.acquire().await?;
        let result = analyze_input(engine, name, &mut self.log).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                self.slot.mark_poisoned();
            }
        }
        result
    }

    /// Run one engine request that must succeed.
    async fn step(&mut self, label: &str, request: EngineRequest) -> Result<(), Failure> {
        let engine = self.slot.acquire().await?;
        let output = run_logged(engine, label, &request, &mut self.log).await?;
        if output.success() {
            return Ok(());
        }
        let kind = classify_failure(&output);
        if kind == FailureKind::Fatal {
            self.slot.mark_poisoned();
        }
        Err(Failure {
            kind,
            reason: summarize_failure(self.log.since_mark()),
        })
    }

    async fn render_to(
        &mut self,
        label: &str,
        input: &str,
        output: &str,
        chain: &FilterChain,
        span: Option<Span>,
    ) -> Result<(), Failure> {
        let request = EngineRequest::Render {
            input: input.to_string(),
            output: output.to_string(),
            graph: chain.graph(),
            span,
            sample_rate: self.settings.sample_rate,
        };
        self.step(label, request).await
    }

    async fn read_and_clean(&mut self, output: &str, temps: &[String]) -> Result<Vec<u8>, Failure> {
        let engine = self.slot.acquire().await?;
        let bytes = engine.read_file(output).await;
        for name in temps {
            engine.delete_file(name).await.ok();
        }
        Ok(bytes?)
    }

    /// Best-effort cleanup after a failed path. A poisoned instance is about
    /// to be discarded along with its files.
    async fn discard(&mut self, temps: &[String]) {
        if self.slot.is_poisoned() {
            return;
        }
        if let Ok(engine) = self.slot.acquire().await {
            for name in temps {
                engine.delete_file(name).await.ok();
            }
        }
    }

    /// Expects the input to be present already.
    async fn single_pass(&mut self, job: &RenderJob<'_>, prefix: &str, chain: &FilterChain) -> Result<Vec<u8>, Failure> {
        let out = format!("{prefix}.wav");
        let temps = [out.clone()];
        match self.render_to(prefix, job.input_name, &out, chain, None).await {
            Ok(()) => self.read_and_clean(&out, &temps).await,
            Err(f) => {
                self.discard(&temps).await;
                Err(f)
            }
        }
    }

    /// Pre-processing pass, then noise reduction alone, then the limiter.
    async fn split_pass(&mut self, job: &RenderJob<'_>, prefix: &str, chain: &FilterChain) -> Result<Vec<u8>, Failure> {
        let Some(split) = chain.split() else {
            return Err(Failure {
                kind: FailureKind::Render,
                reason: "chain has no noise-reduction stage to split".to_string(),
            });
        };
        self.ensure_input(job.input_name, job.input).await?;

        let pre = format!("{prefix}.split-pre.wav");
        let nr = format!("{prefix}.split-nr.wav");
        let out = format!("{prefix}.split.wav");
        let temps = [pre.clone(), nr.clone(), out.clone()];

        let passes = async {
            self.render_to("split pre", job.input_name, &pre, &split.pre, None).await?;
            self.render_to("split noise reduction", &pre, &nr, &split.noise_reduction, None)
                .await?;
            self.render_to("split limiter", &nr, &out, &split.limiter, None).await
        }
        .await;

        match passes {
            Ok(()) => self.read_and_clean(&out, &temps).await,
            Err(f) => {
                self.discard(&temps).await;
                Err(f)
            }
        }
    }

    /// Fixed-length spans rendered independently, then losslessly joined.
    async fn segmented_pass(
        &mut self,
        job: &RenderJob<'_>,
        prefix: &str,
        chain: &FilterChain,
        duration: f64,
    ) -> Result<Vec<u8>, Failure> {
        self.ensure_input(job.input_name, job.input).await?;
        let spans = segment_spans(duration, self.settings.segment_secs);
        let out = format!("{prefix}.segmented.wav");
        let mut temps: Vec<String> = Vec::with_capacity(spans.len() + 1);

        let mut result = Ok(());
        for (i, span) in spans.into_iter().enumerate() {
            let seg = format!("{prefix}.seg{i:03}.wav");
            temps.push(seg.clone());
            result = self
                .render_to(&format!("segment {i}"), job.input_name, &seg, chain, Some(span))
                .await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            let request = EngineRequest::Concat {
                inputs: temps.clone(),
                output: out.clone(),
            };
            temps.push(out.clone());
            result = self.step("concat", request).await;
        } else {
            temps.push(out.clone());
        }

        match result {
            Ok(()) => self.read_and_clean(&out, &temps).await,
            Err(f) => {
                self.discard(&temps).await;
                Err(f)
            }
        }
    }

    /// Render one mix through the fallback cascade. Never fails outright;
    /// an exhausted cascade ends in `RenderState::Failed`.
    pub async fn render(&mut self, job: &RenderJob<'_>) -> RenderOutcome {
        let mut state = RenderState::Idle;
        let mut attempts = Vec::new();
        let mut last_reason = String::from("no strategy attempted");
        let target = match job.target {
            MixTarget::Clean => "clean",
            MixTarget::Scene => "scene",
        };
        log::debug!("{}: {:?}", job.base, state);

        for strategy in Strategy::CASCADE {
            let chain = compile(job.profile, &job.toggles, &strategy.compile_options(), job.target);
            let prefix = format!("{}.{}.{}", job.base, target, strategy.name());

            state = RenderState::WritingInput;
            log::debug!("{}: {:?}", job.base, state);
            if let Err(e) = self.ensure_input(job.input_name, job.input).await {
                let f = Failure::from(e);
                log::warn!("{}: cannot write input for {}: {}", job.base, strategy, f.reason);
                attempts.push(attempt(strategy, RenderPath::Single, Some(&f)));
                last_reason = f.reason;
                continue;
            }
            state = RenderState::Rendering(strategy);
            log::debug!("{}: {:?} {}", job.base, state, chain.graph());

            let mut produced = None;
            let mut failure = match self.single_pass(job, &prefix, &chain).await {
                Ok(bytes) => {
                    attempts.push(attempt(strategy, RenderPath::Single, None));
                    produced = Some((bytes, None));
                    None
                }
                Err(f) => {
                    attempts.push(attempt(strategy, RenderPath::Single, Some(&f)));
                    Some(f)
                }
            };

            let rejected_stage = failure
                .as_ref()
                .filter(|f| f.kind == FailureKind::StageIncompatible)
                .map(|f| f.reason.clone());
            if let Some(reason) = rejected_stage {
                if chain.split().is_some() {
                    log::warn!("{}: {} rejected a stage ({}), trying split render", job.base, strategy, reason);
                    match self.split_pass(job, &prefix, &chain).await {
                        Ok(bytes) => {
                            attempts.push(attempt(strategy, RenderPath::Split, None));
                            produced = Some((bytes, Some("split")));
                            failure = None;
                        }
                        Err(f) => {
                            attempts.push(attempt(strategy, RenderPath::Split, Some(&f)));
                            failure = Some(f);
                        }
                    }
                }
            }

            let segmentable = match (&failure, job.duration_secs) {
                (Some(f), Some(d)) if f.kind != FailureKind::Fatal && d.is_finite() && d >= self.settings.segment_min_secs => {
                    Some((d, f.reason.clone()))
                }
                _ => None,
            };
            if let Some((duration, reason)) = segmentable {
                log::warn!("{}: {} failed ({}), trying segmented render", job.base, strategy, reason);
                match self.segmented_pass(job, &prefix, &chain, duration).await {
                    Ok(bytes) => {
                        attempts.push(attempt(strategy, RenderPath::Segmented, None));
                        produced = Some((bytes, Some("segmented")));
                        failure = None;
                    }
                    Err(f) => {
                        attempts.push(attempt(strategy, RenderPath::Segmented, Some(&f)));
                        failure = Some(f);
                    }
                }
            }

            if let Some((bytes, path)) = produced {
                let fallback_applied = match (strategy, path) {
                    (Strategy::Primary, None) => None,
                    (s, None) => Some(s.name().to_string()),
                    (s, Some(p)) => Some(format!("{}+{}", s.name(), p)),
                };
                if let Some(fallback) = &fallback_applied {
                    log::warn!("{}: {} mix rendered with fallback {}", job.base, target, fallback);
                }
                return RenderOutcome {
                    state: RenderState::Rendered,
                    output: Some(bytes),
                    fallback_applied,
                    attempts,
                };
            }

            if let Some(f) = failure {
                if f.kind == FailureKind::Fatal {
                    log::warn!("{}: fatal engine fault under {}, engine will be reinitialized", job.base, strategy);
                } else {
                    log::warn!("{}: {} failed: {}", job.base, strategy, f.reason);
                }
                last_reason = f.reason;
            }
        }

        log::error!("{}: all render strategies failed: {}", job.base, last_reason);
        state = RenderState::Failed { reason: last_reason };
        RenderOutcome {
            state,
            output: None,
            fallback_applied: None,
            attempts,
        }
    }
}

fn attempt(strategy: Strategy, path: RenderPath, failure: Option<&Failure>) -> Attempt {
    Attempt {
        strategy,
        path,
        ok: failure.is_none(),
        failure: failure.map(|f| f.kind),
        reason: failure.map(|f| f.reason.clone()),
    }
}

/// Split `duration` into consecutive spans of `segment` seconds; the last
/// span takes the remainder.
pub fn segment_spans(duration: f64, segment: f64) -> Vec<Span> {
    if !(duration.is_finite() && duration > 0.0) {
        return Vec::new();
    }
    let segment = if segment.is_finite() && segment > 0.0 { segment } else { duration };
    let count = (duration / segment).ceil().max(1.0) as usize;
    (0..count)
        .map(|i| {
            let start = i as f64 * segment;
            Span {
                start_secs: start,
                duration_secs: segment.min(duration - start),
            }
        })
        .collect()
}
