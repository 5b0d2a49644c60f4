use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use voxlevel::analyzer::SignalMetrics;
use voxlevel::batch::{collect_inputs, plan_jobs, write_manifest, BatchOptions, BatchRunner, BatchStatus};
use voxlevel::config::AppConfig;
use voxlevel::engine::FfmpegFactory;
use voxlevel::profile::{noise_risk, room_risk, SmartMatch};
use voxlevel::reference::BatchReference;
use voxlevel::render::RenderOrchestrator;

#[derive(Parser)]
#[command(name = "voxlevel", version, about = "Adaptive voice leveling for batches of recordings")]
struct Cli {
    /// Config file (defaults to ~/.config/voxlevel/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Rendering engine binary (overrides config engine_path)
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze and render a batch of recordings
    Render {
        /// Files or directories (searched recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Output directory (defaults to config output_dir, then ./voxlevel-out)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Tone/dynamics match strength
        #[arg(long, value_enum)]
        smart_match: Option<SmartMatch>,

        /// Also render the scene-blend mix
        #[arg(long)]
        scene_blend: bool,

        /// Also write loudness-normalized variants
        #[arg(long)]
        normalize: bool,

        /// Disable room cleanup (tail gate, echo notches, room cut)
        #[arg(long)]
        no_room_cleanup: bool,

        /// Disable spectral noise reduction
        #[arg(long)]
        no_noise_reduction: bool,

        /// Disable the noise floor guard
        #[arg(long)]
        no_noise_guard: bool,

        /// Use breath compand as the floor control when nothing else applies
        #[arg(long)]
        breath_control: bool,

        /// Keep presence/air bands unsoftened
        #[arg(long)]
        no_soften: bool,

        /// Hide progress bars
        #[arg(long)]
        quiet: bool,
    },

    /// Measure recordings and print their metrics without rendering
    Analyze {
        /// Files or directories (searched recursively)
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let engine_path = cli.engine.clone().unwrap_or_else(|| config.engine_path.clone());
    log::info!("Engine: {}", engine_path.display());
    let orchestrator = RenderOrchestrator::new(
        FfmpegFactory::new(engine_path),
        config.render_settings(),
        config.render.log_capacity,
    );

    match cli.command {
        Commands::Render {
            paths,
            output,
            smart_match,
            scene_blend,
            normalize,
            no_room_cleanup,
            no_noise_reduction,
            no_noise_guard,
            breath_control,
            no_soften,
            quiet,
        } => {
            // CLI flags override config
            let mut profile = config.profile_options();
            let mut toggles = config.toggles();
            if let Some(mode) = smart_match {
                profile.smart_match = mode;
            }
            profile.scene_blend |= scene_blend;
            if no_room_cleanup {
                profile.room_cleanup = false;
                toggles.room_cleanup = false;
            }
            profile.noise_guard &= !no_noise_guard;
            toggles.noise_reduction &= !no_noise_reduction;
            toggles.breath_control |= breath_control;
            toggles.soften_harshness &= !no_soften;

            let output_dir = output
                .or(config.output_dir.clone())
                .unwrap_or_else(|| PathBuf::from("voxlevel-out"));
            let loudness = (normalize || config.loudness.enabled).then(|| config.loudness.target());

            let mut runner = BatchRunner::new(
                orchestrator,
                BatchOptions {
                    output_dir: output_dir.clone(),
                    profile,
                    toggles,
                    loudness,
                    recycle: config.recycle,
                    show_progress: !quiet,
                },
            );
            let report = runner.run(&paths).await;
            let manifest = write_manifest(&report, &output_dir)
                .await
                .context("Failed to write manifest")?;

            let rendered = report
                .files
                .iter()
                .filter(|f| f.mixes.iter().any(|m| m.output.is_some()))
                .count();
            println!(
                "Render complete: {} rendered, {} failures, {} warnings, {} engine recycles",
                rendered,
                report.failures.len(),
                report.warnings.len(),
                report.engine_recycles
            );
            for failure in &report.failures {
                println!("  FAILED {}: {}", failure.file, failure.reason);
            }
            println!("Manifest: {}", manifest.display());

            if report.status == BatchStatus::Failed {
                anyhow::bail!(
                    "Batch failed: {}",
                    report.warnings.first().map(String::as_str).unwrap_or("unknown error")
                );
            }
        }

        Commands::Analyze { paths, json } => {
            let jobs = plan_jobs(collect_inputs(&paths));
            if jobs.is_empty() {
                anyhow::bail!("No supported audio files in the given paths.");
            }
            let mut orchestrator = orchestrator;
            orchestrator.start().await.context("Failed to start rendering engine")?;

            let mut measured: Vec<(String, SignalMetrics)> = Vec::new();
            for job in &jobs {
                let bytes = tokio::fs::read(&job.source)
                    .await
                    .with_context(|| format!("Failed to read {}", job.source.display()))?;
                match orchestrator.analyze(&job.input_name, &bytes).await {
                    Ok(metrics) => measured.push((job.base.clone(), metrics)),
                    Err(e) => {
                        log::warn!("Analysis of {} failed: {}", job.source.display(), e);
                        measured.push((job.base.clone(), SignalMetrics::default()));
                    }
                }
                orchestrator.release_input(&job.input_name).await;
            }
            orchestrator.shutdown().await;

            let reference = BatchReference::from_metrics(measured.iter().map(|(_, m)| m));
            if json {
                let value = serde_json::json!({
                    "files": measured
                        .iter()
                        .map(|(base, m)| serde_json::json!({ "file": base, "metrics": m }))
                        .collect::<Vec<_>>(),
                    "reference": reference,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
                return Ok(());
            }

            println!(
                "{:<28} {:>7} {:>7} {:>7} {:>7} {:>6} {:>6} {:>6}  {:<6} {:<6}",
                "File", "LUFS", "LRA", "Floor", "L/M", "Room", "Echo", "Inst", "Noise", "Room"
            );
            for (base, m) in &measured {
                println!(
                    "{:<28} {:>7} {:>7} {:>7} {:>7} {:>6} {:>6} {:>6}  {:<6} {:<6}",
                    truncate(base, 28),
                    fmt_opt(m.integrated_lufs, 1),
                    fmt_opt(m.loudness_range, 1),
                    fmt_opt(m.frames.noise_floor_db, 1),
                    fmt_opt(m.low_mid_tilt(), 1),
                    fmt_opt(m.frames.room_score, 2),
                    fmt_opt(m.frames.echo_score, 2),
                    fmt_opt(m.frames.instability_score, 2),
                    format!("{:?}", noise_risk(m)).to_lowercase(),
                    format!("{:?}", room_risk(m)).to_lowercase(),
                );
            }
            match reference {
                Some(r) => println!(
                    "\nBatch reference ({} files): low/mid {:.1} dB, high/mid {:.1} dB, LRA {}",
                    r.file_count,
                    r.low_mid_tilt,
                    r.high_mid_tilt,
                    fmt_opt(r.loudness_range, 1)
                ),
                None => println!("\nToo few measured files for a batch reference."),
            }
        }
    }

    Ok(())
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(x) => format!("{:.*}", decimals, x),
        None => "-".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let t: String = s.chars().take(max - 1).collect();
        format!("{}…", t)
    }
}
