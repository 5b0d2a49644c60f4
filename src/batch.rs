//! Batch sequencing: discover inputs, analyze every file, derive the batch
//! reference, render every file, write the manifest.
//!
//! Files are processed strictly in submission order against one engine.
//! A file's failure is recorded and the batch moves on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::analyzer::SignalMetrics;
use crate::chain::{MixTarget, RenderToggles};
use crate::engine::{EngineError, EngineFactory};
use crate::profile::{build_profile, AdaptiveProfile, ProfileOptions};
use crate::reference::BatchReference;
use crate::render::loudness::LoudnessTarget;
use crate::render::{Attempt, RenderJob, RenderOrchestrator, RenderState};
use crate::SUPPORTED_EXTENSIONS;

pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("no supported audio files in the given paths")]
    NoInputs,
}

/// Periodic engine teardown for memory hygiene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecyclePolicy {
    /// Recycle after this many completed files (0 = never).
    pub every_files: usize,
    /// Only batches larger than this are recycled.
    pub min_batch: usize,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        Self {
            every_files: 4,
            min_batch: 6,
        }
    }
}

impl RecyclePolicy {
    pub fn due(&self, completed: usize, total: usize) -> bool {
        total > self.min_batch && self.every_files > 0 && completed % self.every_files == 0 && completed < total
    }
}

/// One file's unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub source: PathBuf,
    pub base: String,
    /// Name of the input inside the engine's file system.
    pub input_name: String,
    pub clean_output: String,
    pub scene_output: String,
}

impl Job {
    fn new(source: PathBuf, base: String) -> Self {
        let ext = source
            .extension()
            .and_then(|e| e.to_str())
            .map(sanitize_base)
            .unwrap_or_else(|| "bin".to_string());
        Self {
            input_name: format!("{base}.src.{ext}"),
            clean_output: format!("{base}_clean.wav"),
            scene_output: format!("{base}_scene.wav"),
            source,
            base,
        }
    }

    fn output(&self, target: MixTarget) -> &str {
        match target {
            MixTarget::Clean => &self.clean_output,
            MixTarget::Scene => &self.scene_output,
        }
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`. Runs of `.`
/// collapse to one and leading `.`/`-` are dropped, so every derived name is
/// a valid engine file name and never parses as an engine option.
pub fn sanitize_base(stem: &str) -> String {
    let mut cleaned = String::with_capacity(stem.len());
    for c in stem.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' };
        if c == '.' && cleaned.ends_with('.') {
            continue;
        }
        cleaned.push(c);
    }
    let trimmed = cleaned.trim_start_matches(['.', '-']).trim_end_matches('.');
    if trimmed.is_empty() { "audio".to_string() } else { trimmed.to_string() }
}

fn is_supported(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

/// Expand directories recursively (supported extensions only, sorted by
/// name). Files named explicitly are kept as given.
pub fn collect_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut inputs = Vec::new();
    for path in paths {
        if path.is_file() {
            inputs.push(path.clone());
            continue;
        }
        for entry in WalkDir::new(path)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() && is_supported(entry.path()) {
                inputs.push(entry.into_path());
            }
        }
    }
    inputs
}

/// Assign unique base names: `take`, `take_2`, `take_3`, ...
pub fn plan_jobs(inputs: Vec<PathBuf>) -> Vec<Job> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut jobs = Vec::with_capacity(inputs.len());
    for source in inputs {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut base = sanitize_base(&stem);
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            let mut n = *count;
            // A literal "take_2" may already exist.
            while seen.contains_key(&format!("{base}_{n}")) {
                n += 1;
            }
            base = format!("{base}_{n}");
            seen.insert(base.clone(), 1);
        }
        jobs.push(Job::new(source, base));
    }
    jobs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Done,
    DoneWithWarnings,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct MixReport {
    pub target: MixTarget,
    pub output: Option<PathBuf>,
    pub normalized: Option<PathBuf>,
    pub fallback_applied: Option<String>,
    pub attempts: Vec<Attempt>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source: PathBuf,
    pub base: String,
    pub analysis_degraded: bool,
    pub metrics: SignalMetrics,
    pub profile: Option<AdaptiveProfile>,
    pub mixes: Vec<MixReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub file: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub files: Vec<FileReport>,
    pub failures: Vec<FileFailure>,
    pub warnings: Vec<String>,
    pub reference: Option<BatchReference>,
    pub engine_recycles: u64,
}

impl BatchReport {
    fn failed(started_at: DateTime<Utc>, reason: String) -> Self {
        log::error!("Batch failed: {}", reason);
        Self {
            status: BatchStatus::Failed,
            started_at,
            finished_at: Utc::now(),
            files: Vec::new(),
            failures: Vec::new(),
            warnings: vec![reason],
            reference: None,
            engine_recycles: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub output_dir: PathBuf,
    pub profile: ProfileOptions,
    pub toggles: RenderToggles,
    /// `Some` to also write loudness-normalized variants.
    pub loudness: Option<LoudnessTarget>,
    pub recycle: RecyclePolicy,
    pub show_progress: bool,
}

/// Per-job state carried from the analysis phase to the render phase.
struct Analyzed {
    metrics: SignalMetrics,
    degraded: bool,
    duration_secs: Option<f64>,
}

pub struct BatchRunner<F: EngineFactory> {
    orchestrator: RenderOrchestrator<F>,
    options: BatchOptions,
}

impl<F: EngineFactory> BatchRunner<F> {
    pub fn new(orchestrator: RenderOrchestrator<F>, options: BatchOptions) -> Self {
        Self { orchestrator, options }
    }

    fn progress(&self, len: usize, message: &'static str) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(message);
        pb
    }

    async fn after_file(&mut self, completed: usize, total: usize, warnings: &mut Vec<String>) {
        if !self.options.recycle.due(completed, total) {
            return;
        }
        log::info!("Recycling engine after {} files", completed);
        if let Err(e) = self.orchestrator.recycle().await {
            warnings.push(format!("engine recycle failed: {e}"));
        }
        release_heap();
    }

    /// Analyze everything, derive the reference, render everything.
    /// Always returns a report; `status` says how it went.
    pub async fn run(&mut self, paths: &[PathBuf]) -> BatchReport {
        let started_at = Utc::now();
        let jobs = plan_jobs(collect_inputs(paths));
        if jobs.is_empty() {
            return BatchReport::failed(started_at, BatchError::NoInputs.to_string());
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.options.output_dir).await {
            return BatchReport::failed(started_at, BatchError::from(e).to_string());
        }
        if let Err(e) = self.orchestrator.start().await {
            return BatchReport::failed(started_at, BatchError::from(e).to_string());
        }
        log::info!("Batch of {} files", jobs.len());

        let mut failures = Vec::new();
        let mut warnings = Vec::new();

        let analyzed = self.analysis_phase(&jobs, &mut failures, &mut warnings).await;
        let reference = BatchReference::from_metrics(
            analyzed
                .iter()
                .flatten()
                .filter(|a| !a.degraded)
                .map(|a| &a.metrics),
        );
        match &reference {
            Some(r) => log::info!(
                "Batch reference from {} files: low/mid {:.1} dB, high/mid {:.1} dB",
                r.file_count,
                r.low_mid_tilt,
                r.high_mid_tilt
            ),
            None => log::info!("Too few measured files for a batch reference, using defaults"),
        }

        let files = self
            .render_phase(&jobs, analyzed, reference.as_ref(), &mut failures, &mut warnings)
            .await;
        self.orchestrator.shutdown().await;

        let status = if failures.is_empty() && warnings.is_empty() {
            BatchStatus::Done
        } else {
            BatchStatus::DoneWithWarnings
        };
        BatchReport {
            status,
            started_at,
            finished_at: Utc::now(),
            files,
            failures,
            warnings,
            reference,
            engine_recycles: self.orchestrator.recycle_count(),
        }
    }

    /// `None` entries are files that could not even be read.
    async fn analysis_phase(
        &mut self,
        jobs: &[Job],
        failures: &mut Vec<FileFailure>,
        warnings: &mut Vec<String>,
    ) -> Vec<Option<Analyzed>> {
        let pb = self.progress(jobs.len(), "Analyzing...");
        let mut analyzed = Vec::with_capacity(jobs.len());

        for (i, job) in jobs.iter().enumerate() {
            pb.set_message(job.base.clone());
            let entry = match tokio::fs::read(&job.source).await {
                Ok(bytes) => {
                    let result = self.orchestrator.analyze(&job.input_name, &bytes).await;
                    self.orchestrator.release_input(&job.input_name).await;
                    Some(match result {
                        Ok(metrics) => Analyzed {
                            duration_secs: metrics.duration_secs,
                            metrics,
                            degraded: false,
                        },
                        Err(e) => {
                            log::warn!("Analysis of {} failed, using neutral metrics: {}", job.source.display(), e);
                            warnings.push(format!("{}: analysis degraded: {}", job.base, e));
                            Analyzed {
                                metrics: SignalMetrics::default(),
                                degraded: true,
                                duration_secs: None,
                            }
                        }
                    })
                }
                Err(e) => {
                    log::warn!("Cannot read {}: {}", job.source.display(), e);
                    failures.push(FileFailure {
                        file: job.source.display().to_string(),
                        reason: e.to_string(),
                    });
                    None
                }
            };
            analyzed.push(entry);
            pb.inc(1);
            self.after_file(i + 1, jobs.len(), warnings).await;
        }

        pb.finish_with_message("Analysis done");
        analyzed
    }

    async fn render_phase(
        &mut self,
        jobs: &[Job],
        analyzed: Vec<Option<Analyzed>>,
        reference: Option<&BatchReference>,
        failures: &mut Vec<FileFailure>,
        warnings: &mut Vec<String>,
    ) -> Vec<FileReport> {
        let pb = self.progress(jobs.len(), "Rendering...");
        let mut files = Vec::with_capacity(jobs.len());

        for (i, (job, analysis)) in jobs.iter().zip(analyzed).enumerate() {
            pb.set_message(job.base.clone());
            if let Some(analysis) = analysis {
                match tokio::fs::read(&job.source).await {
                    Ok(bytes) => {
                        let report = self.render_file(job, analysis, reference, &bytes, failures, warnings).await;
                        self.orchestrator.release_input(&job.input_name).await;
                        files.push(report);
                    }
                    Err(e) => failures.push(FileFailure {
                        file: job.source.display().to_string(),
                        reason: e.to_string(),
                    }),
                }
            }
            pb.inc(1);
            self.after_file(i + 1, jobs.len(), warnings).await;
        }

        pb.finish_with_message(format!("Done: {} files, {} failures", files.len(), failures.len()));
        files
    }

    async fn render_file(
        &mut self,
        job: &Job,
        analysis: Analyzed,
        reference: Option<&BatchReference>,
        bytes: &[u8],
        failures: &mut Vec<FileFailure>,
        warnings: &mut Vec<String>,
    ) -> FileReport {
        let profile = build_profile(&analysis.metrics, reference, &self.options.profile);
        let mut targets = vec![MixTarget::Clean];
        if self.options.profile.scene_blend && profile.as_ref().is_some_and(|p| p.scene.is_audible()) {
            targets.push(MixTarget::Scene);
        }

        let mut mixes = Vec::new();
        for target in targets {
            let render_job = RenderJob {
                base: &job.base,
                input_name: &job.input_name,
                input: bytes,
                duration_secs: analysis.duration_secs,
                profile: profile.as_ref(),
                toggles: self.options.toggles,
                target,
            };
            let outcome = self.orchestrator.render(&render_job).await;
            let mut mix = MixReport {
                target,
                output: None,
                normalized: None,
                fallback_applied: outcome.fallback_applied,
                attempts: outcome.attempts,
            };

            let rendered = match (outcome.state, outcome.output) {
                (RenderState::Rendered, Some(rendered)) => rendered,
                (RenderState::Failed { reason }, _) => {
                    failures.push(FileFailure {
                        file: job.source.display().to_string(),
                        reason: format!("{} mix: {}", target_name(target), reason),
                    });
                    mixes.push(mix);
                    continue;
                }
                (state, _) => {
                    failures.push(FileFailure {
                        file: job.source.display().to_string(),
                        reason: format!("{} mix ended in {:?}", target_name(target), state),
                    });
                    mixes.push(mix);
                    continue;
                }
            };

            let path = self.options.output_dir.join(job.output(target));
            match tokio::fs::write(&path, &rendered).await {
                Ok(()) => mix.output = Some(path),
                Err(e) => {
                    failures.push(FileFailure {
                        file: job.source.display().to_string(),
                        reason: format!("writing {}: {}", path.display(), e),
                    });
                    mixes.push(mix);
                    continue;
                }
            }

            if let Some(loudness) = self.options.loudness {
                let prefix = format!("{}.{}", job.base, target_name(target));
                match self.orchestrator.normalize_loudness(&prefix, &rendered, &loudness).await {
                    Ok(normalized) => {
                        if !normalized.two_pass {
                            warnings.push(format!("{}: {} mix normalized in one pass", job.base, target_name(target)));
                        }
                        let norm_path = self
                            .options
                            .output_dir
                            .join(format!("{}_{}_norm.wav", job.base, target_name(target)));
                        match tokio::fs::write(&norm_path, &normalized.bytes).await {
                            Ok(()) => mix.normalized = Some(norm_path),
                            Err(e) => warnings.push(format!("writing {}: {}", norm_path.display(), e)),
                        }
                    }
                    Err(reason) => {
                        log::warn!("{}: loudness normalization failed: {}", job.base, reason);
                        warnings.push(format!("{}: loudness normalization failed: {}", job.base, reason));
                    }
                }
            }
            mixes.push(mix);
        }

        FileReport {
            source: job.source.clone(),
            base: job.base.clone(),
            analysis_degraded: analysis.degraded,
            metrics: analysis.metrics,
            profile,
            mixes,
        }
    }
}

fn target_name(target: MixTarget) -> &'static str {
    match target {
        MixTarget::Clean => "clean",
        MixTarget::Scene => "scene",
    }
}

/// Write `manifest.json` into `dir`.
pub async fn write_manifest(report: &BatchReport, dir: &Path) -> Result<PathBuf, BatchError> {
    let path = dir.join(MANIFEST_NAME);
    let json = serde_json::to_vec_pretty(report)?;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, json).await?;
    Ok(path)
}

/// Ask the allocator to hand freed pages back to the OS.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn release_heap() {
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn release_heap() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::frames::tests::synth;
    use crate::engine::ffmpeg::is_valid_file_name;
    use crate::profile::SmartMatch;
    use crate::render::RenderSettings;
    use crate::testing::{MockFactory, MockScript, SharedScript};

    fn runner(script: &SharedScript, out: &Path, profile: ProfileOptions) -> BatchRunner<MockFactory> {
        let orchestrator = RenderOrchestrator::new(MockFactory::new(script.clone()), RenderSettings::default(), 200);
        BatchRunner::new(
            orchestrator,
            BatchOptions {
                output_dir: out.to_path_buf(),
                profile,
                toggles: RenderToggles::default(),
                loudness: None,
                recycle: RecyclePolicy::default(),
                show_progress: false,
            },
        )
    }

    fn measured_script() -> SharedScript {
        let script = MockScript::shared();
        {
            let mut s = script.lock().unwrap();
            let mut segs = Vec::new();
            for _ in 0..6 {
                segs.push((0.3, 400));
                segs.push((0.0, 300));
            }
            s.decoded = synth(&segs, 0.0003, 3);
            s.measure_logs = vec![
                ("lowpass=f=250".into(), vec!["RMS level dB: -26.0".into()]),
                ("lowpass=f=2000".into(), vec!["RMS level dB: -20.0".into()]),
                ("lowpass=f=10000".into(), vec!["RMS level dB: -33.0".into()]),
            ];
        }
        script
    }

    fn write_inputs(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                std::fs::write(&p, vec![7u8; 500]).unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_sanitize_and_dedupe() {
        assert_eq!(sanitize_base("Interview #3 (final)"), "Interview__3__final_");
        assert_eq!(sanitize_base("..."), "audio");
        assert_eq!(sanitize_base("ünï"), "___");

        let jobs = plan_jobs(vec![
            PathBuf::from("a/take.wav"),
            PathBuf::from("b/take.mp3"),
            PathBuf::from("take_2.wav"),
            PathBuf::from("c/take.flac"),
        ]);
        let bases: Vec<&str> = jobs.iter().map(|j| j.base.as_str()).collect();
        assert_eq!(bases, vec!["take", "take_2", "take_2_2", "take_3"]);
        assert_eq!(jobs[1].clean_output, "take_2_clean.wav");
        assert_eq!(jobs[1].scene_output, "take_2_scene.wav");
        assert_eq!(jobs[1].input_name, "take_2.src.mp3");
    }

    #[test]
    fn test_job_names_are_valid_engine_files() {
        assert_eq!(sanitize_base("take..final"), "take.final");
        assert_eq!(sanitize_base("-take"), "take");
        assert_eq!(sanitize_base("--..x..y.."), "x.y");

        let jobs = plan_jobs(vec![
            PathBuf::from("take..final.wav"),
            PathBuf::from("-take.wav"),
            PathBuf::from("..hidden.flac"),
            PathBuf::from("a...b.m4a"),
            PathBuf::from("-.wav"),
        ]);
        for job in &jobs {
            let temps = [
                format!("{}.clean.primary.wav", job.base),
                format!("{}.scene.stability-safe.seg000.wav", job.base),
                format!("{}.clean.norm-src.wav", job.base),
            ];
            for name in [&job.input_name, &job.clean_output, &job.scene_output]
                .into_iter()
                .chain(temps.iter())
            {
                assert!(is_valid_file_name(name), "{name}");
            }
        }
    }

    #[test]
    fn test_collect_inputs_filters_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/b.FLAC"), b"x").unwrap();
        let explicit = dir.path().join("notes.txt");

        let found = collect_inputs(&[dir.path().to_path_buf()]);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().unwrap() != "txt"));
        assert_eq!(collect_inputs(&[explicit.clone()]), vec![explicit]);
    }

    #[test]
    fn test_recycle_policy() {
        let p = RecyclePolicy::default();
        assert!(!p.due(4, 6));
        assert!(p.due(4, 7));
        assert!(!p.due(5, 7));
        assert!(!p.due(8, 8));
        assert!(!RecyclePolicy { every_files: 0, min_batch: 0 }.due(1, 3));
    }

    #[tokio::test]
    async fn test_batch_of_three_renders_and_references() {
        let input_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(input_dir.path(), &["one.wav", "two.wav", "three.wav"]);
        let script = measured_script();
        let profile = ProfileOptions {
            room_cleanup: true,
            ..Default::default()
        };

        let report = runner(&script, out_dir.path(), profile).run(&inputs).await;
        assert_eq!(report.status, BatchStatus::Done, "{:?}", report.warnings);
        assert_eq!(report.files.len(), 3);
        let reference = report.reference.unwrap();
        assert_eq!(reference.file_count, 3);
        assert!((reference.low_mid_tilt + 6.0).abs() < 1e-9);
        assert!((reference.high_mid_tilt + 13.0).abs() < 1e-9);

        for name in ["one_clean.wav", "two_clean.wav", "three_clean.wav"] {
            assert!(out_dir.path().join(name).exists(), "{name}");
        }
        // scene blend is off
        assert!(!out_dir.path().join("one_scene.wav").exists());
        assert_eq!(report.engine_recycles, 0);

        let manifest = write_manifest(&report, out_dir.path()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(manifest).unwrap()).unwrap();
        assert_eq!(json["status"], "done");
        assert_eq!(json["files"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_outlier_file_does_not_shift_batch_reference() {
        let input_dir = tempfile::tempdir().unwrap();
        let script = measured_script();
        {
            let mut s = script.lock().unwrap();
            for (prefix, low) in [("two.src", "-25.0"), ("three.src", "-27.0"), ("boomy.src", "-10.0")] {
                s.input_measure_logs.push((
                    prefix.into(),
                    "lowpass=f=250".into(),
                    vec![format!("RMS level dB: {low}")],
                ));
            }
        }
        let profile = ProfileOptions {
            smart_match: SmartMatch::Balanced,
            room_cleanup: true,
            ..Default::default()
        };

        let out_dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(input_dir.path(), &["one.wav", "two.wav", "three.wav"]);
        let report = runner(&script, out_dir.path(), profile).run(&inputs).await;
        assert_eq!(report.status, BatchStatus::Done, "{:?}", report.warnings);
        let clean = report.reference.unwrap();
        assert_eq!(clean.file_count, 3);
        assert!((clean.low_mid_tilt + 6.0).abs() < 1e-9);

        // +16 dB above the others in the low band
        let out_dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(input_dir.path(), &["one.wav", "two.wav", "three.wav", "boomy.wav"]);
        let report = runner(&script, out_dir.path(), profile).run(&inputs).await;
        assert_eq!(report.status, BatchStatus::Done, "{:?}", report.warnings);
        let with_outlier = report.reference.unwrap();
        assert_eq!(with_outlier.file_count, 4);
        assert!((with_outlier.low_mid_tilt - clean.low_mid_tilt).abs() < 1e-9);
        assert!((with_outlier.high_mid_tilt + 13.0).abs() < 1e-9);

        let boomy = report.files.iter().find(|f| f.base == "boomy").unwrap();
        assert!((boomy.metrics.low_mid_tilt().unwrap() - 10.0).abs() < 1e-9);
        assert!(boomy.profile.as_ref().unwrap().low_mid_gain_db < 0.0);
    }

    #[tokio::test]
    async fn test_scene_mix_and_loudness_variants() {
        let input_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(input_dir.path(), &["voice.wav"]);
        let script = measured_script();
        script.lock().unwrap().measure_logs.push((
            "loudnorm".into(),
            ["{", "\"input_i\" : \"-23.00\",", "\"input_tp\" : \"-4.00\",", "\"input_lra\" : \"6.00\",", "\"input_thresh\" : \"-33.00\",", "\"target_offset\" : \"0.10\"", "}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        ));
        let mut runner = runner(
            &script,
            out_dir.path(),
            ProfileOptions {
                scene_blend: true,
                ..Default::default()
            },
        );
        runner.options.loudness = Some(LoudnessTarget::default());

        let report = runner.run(&inputs).await;
        assert_eq!(report.status, BatchStatus::Done, "{:?}", report.warnings);
        for name in ["voice_clean.wav", "voice_scene.wav", "voice_clean_norm.wav", "voice_scene_norm.wav"] {
            assert!(out_dir.path().join(name).exists(), "{name}");
        }
        let graphs = script.lock().unwrap().render_graphs();
        assert!(graphs.iter().any(|g| g.contains("aecho")));
        assert!(graphs.iter().any(|g| g.contains("measured_I=-23.00")));
        // single file: no reference
        assert!(report.reference.is_none());
    }

    #[tokio::test]
    async fn test_failed_files_do_not_abort_batch() {
        let input_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(input_dir.path(), &["a.wav", "b.wav"]);
        let script = measured_script();
        script
            .lock()
            .unwrap()
            .fail_when("dynaudnorm", &["Conversion failed!"], false, None);

        let report = runner(&script, out_dir.path(), ProfileOptions::default()).run(&inputs).await;
        assert_eq!(report.status, BatchStatus::DoneWithWarnings);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].file.ends_with("a.wav"));
        assert!(report.failures[0].reason.contains("Conversion failed!"));
        assert_eq!(report.files.len(), 2);
    }

    #[tokio::test]
    async fn test_periodic_recycling() {
        let input_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..7).map(|i| format!("f{i}.wav")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let inputs = write_inputs(input_dir.path(), &refs);
        let script = measured_script();

        let report = runner(&script, out_dir.path(), ProfileOptions::default()).run(&inputs).await;
        assert_eq!(report.status, BatchStatus::Done, "{:?}", report.warnings);
        // once per phase, after the fourth file
        assert_eq!(report.engine_recycles, 2);
        assert_eq!(report.files.len(), 7);
    }

    #[tokio::test]
    async fn test_engine_that_never_starts_fails_batch() {
        let input_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let inputs = write_inputs(input_dir.path(), &["a.wav"]);
        let script = MockScript::shared();
        script.lock().unwrap().fail_create = true;

        let report = runner(&script, out_dir.path(), ProfileOptions::default()).run(&inputs).await;
        assert_eq!(report.status, BatchStatus::Failed);
        assert!(report.warnings[0].contains("rendering engine not found"));

        let empty = runner(&MockScript::shared(), out_dir.path(), ProfileOptions::default())
            .run(&[])
            .await;
        assert_eq!(empty.status, BatchStatus::Failed);
    }
}
