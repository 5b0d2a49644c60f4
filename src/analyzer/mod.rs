pub mod decode;
pub mod frames;
pub mod stats;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{EngineError, EngineOutput, EngineRequest, RenderEngine};
use crate::render::rolling::{classify_failure, run_logged, summarize_failure, FailureKind, RollingLog};
use frames::FrameMetrics;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Decode error: {0}")]
    Decode(#[from] decode::DecodeError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("{step} pass failed: {reason}")]
    Step {
        step: &'static str,
        kind: FailureKind,
        reason: String,
    },
}

impl AnalyzeError {
    /// True when the engine instance must be replaced before further use.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AnalyzeError::Step {
                kind: FailureKind::Fatal,
                ..
            }
        )
    }
}

/// Band-limited RMS passes: name and the band-limiting part of the graph.
pub const BANDS: [(&str, &str); 3] = [
    ("low", "highpass=f=60,lowpass=f=250"),
    ("mid", "highpass=f=500,lowpass=f=2000"),
    ("high", "highpass=f=4000,lowpass=f=10000"),
];

const RMS_STATS: &str = "astats=metadata=0";
const LOUDNESS_MEASURE: &str = "loudnorm=I=-16:TP=-1.5:LRA=11:print_format=json";

/// Everything measured about one file. Immutable once built; fields are
/// `None` when the underlying measurement was unavailable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalMetrics {
    pub duration_secs: Option<f64>,

    // Loudness pass
    pub integrated_lufs: Option<f64>,
    pub loudness_range: Option<f64>,
    pub true_peak_db: Option<f64>,
    pub gating_threshold_db: Option<f64>,

    // Band RMS passes
    pub low_rms_db: Option<f64>,
    pub mid_rms_db: Option<f64>,
    pub high_rms_db: Option<f64>,

    // Frame analysis
    pub frames: FrameMetrics,
}

impl SignalMetrics {
    /// Low band minus mid band, dB.
    pub fn low_mid_tilt(&self) -> Option<f64> {
        Some(self.low_rms_db? - self.mid_rms_db?).filter(|v| v.is_finite())
    }

    /// High band minus mid band, dB.
    pub fn high_mid_tilt(&self) -> Option<f64> {
        Some(self.high_rms_db? - self.mid_rms_db?).filter(|v| v.is_finite())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Run a step and turn a non-zero exit into an `AnalyzeError::Step`.
pub(crate) async fn run_step<E: RenderEngine>(
    engine: &mut E,
    step: &'static str,
    request: &EngineRequest,
    log: &mut RollingLog,
) -> Result<EngineOutput, AnalyzeError> {
    let output = run_logged(engine, step, request, log).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(AnalyzeError::Step {
            step,
            kind: classify_failure(&output),
            reason: summarize_failure(output.log.iter().map(String::as_str)),
        })
    }
}

/// Measure one input already present in the engine's file system:
/// probe → decode + frame analysis → band RMS passes → loudness pass.
///
/// Unparseable statistics leave their fields `None`; a failed engine run is
/// an error the caller recovers from.
pub async fn analyze_input<E: RenderEngine>(
    engine: &mut E,
    input: &str,
    log: &mut RollingLog,
) -> Result<SignalMetrics, AnalyzeError> {
    let probe = run_step(engine, "probe", &EngineRequest::Probe { input: input.to_string() }, log).await?;
    let duration_secs = stats::parse_duration(&probe.log);

    let samples = decode::decode_mono(engine, input, log).await?;
    let frames = frames::analyze_frames(&samples, decode::ANALYSIS_SAMPLE_RATE);
    drop(samples);

    let mut band_rms = [None; 3];
    for (slot, (band, limits)) in band_rms.iter_mut().zip(BANDS) {
        let request = EngineRequest::Measure {
            input: input.to_string(),
            graph: format!("{limits},{RMS_STATS}"),
        };
        let output = run_step(engine, band, &request, log).await?;
        *slot = stats::parse_rms_db(&output.log);
        if slot.is_none() {
            log::debug!("{}: no RMS figure in {} band output", input, band);
        }
    }

    let request = EngineRequest::Measure {
        input: input.to_string(),
        graph: LOUDNESS_MEASURE.to_string(),
    };
    let output = run_step(engine, "loudness", &request, log).await?;
    let loudness = stats::parse_loudness(&output.log);
    if loudness.is_none() {
        log::debug!("{}: loudness statistics missing or malformed", input);
    }

    Ok(SignalMetrics {
        duration_secs,
        integrated_lufs: loudness.map(|l| l.integrated),
        loudness_range: loudness.map(|l| l.range),
        true_peak_db: loudness.map(|l| l.true_peak),
        gating_threshold_db: loudness.map(|l| l.threshold),
        low_rms_db: band_rms[0],
        mid_rms_db: band_rms[1],
        high_rms_db: band_rms[2],
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, RenderEngine};
    use crate::testing::{MockFactory, MockScript};
    use frames::tests::synth;

    fn loudness_log() -> Vec<String> {
        [
            "{",
            "\"input_i\" : \"-24.00\",",
            "\"input_tp\" : \"-3.10\",",
            "\"input_lra\" : \"9.50\",",
            "\"input_thresh\" : \"-34.20\",",
            "\"target_offset\" : \"0.20\"",
            "}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn scripted() -> crate::testing::SharedScript {
        let script = MockScript::shared();
        {
            let mut s = script.lock().unwrap();
            let mut segs = Vec::new();
            for _ in 0..10 {
                segs.push((0.3, 300));
                segs.push((0.0, 300));
            }
            s.decoded = synth(&segs, 0.001, 1);
            s.measure_logs = vec![
                ("lowpass=f=250".into(), vec!["RMS level dB: -30.0".into()]),
                ("lowpass=f=2000".into(), vec!["RMS level dB: -22.0".into()]),
                ("lowpass=f=10000".into(), vec!["RMS level dB: -36.5".into()]),
                ("loudnorm".into(), loudness_log()),
            ];
        }
        script
    }

    #[tokio::test]
    async fn test_analyze_input_populates_everything() {
        let script = scripted();
        let mut engine = MockFactory::new(script.clone()).create(1).await.unwrap();
        engine.write_file("in.wav", b"data").await.unwrap();
        let mut log = RollingLog::new(100);

        let m = analyze_input(&mut engine, "in.wav", &mut log).await.unwrap();
        assert_eq!(m.duration_secs, Some(10.0));
        assert_eq!(m.integrated_lufs, Some(-24.0));
        assert_eq!(m.loudness_range, Some(9.5));
        assert_eq!(m.low_mid_tilt(), Some(-8.0));
        assert_eq!(m.high_mid_tilt(), Some(-14.5));
        assert!(m.frames.noise_floor_db.is_some());
        // decoded scratch file cleaned up
        assert!(engine.files.keys().all(|k| !k.ends_with(".f32")));
    }

    #[tokio::test]
    async fn test_missing_statistics_degrade_to_none() {
        let script = scripted();
        script.lock().unwrap().measure_logs.clear();
        let mut engine = MockFactory::new(script).create(1).await.unwrap();
        engine.write_file("in.wav", b"data").await.unwrap();
        let mut log = RollingLog::new(100);

        let m = analyze_input(&mut engine, "in.wav", &mut log).await.unwrap();
        assert_eq!(m.integrated_lufs, None);
        assert_eq!(m.low_mid_tilt(), None);
        assert!(m.frames.noise_floor_db.is_some());
    }

    #[tokio::test]
    async fn test_failed_pass_is_an_error() {
        let script = scripted();
        script
            .lock()
            .unwrap()
            .fail_when("loudnorm", &["Segmentation fault"], true, None);
        let mut engine = MockFactory::new(script).create(1).await.unwrap();
        engine.write_file("in.wav", b"data").await.unwrap();
        let mut log = RollingLog::new(100);

        let err = analyze_input(&mut engine, "in.wav", &mut log).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_empty_metrics() {
        assert!(SignalMetrics::default().is_empty());
        let m = SignalMetrics {
            low_rms_db: Some(-20.0),
            ..Default::default()
        };
        assert!(!m.is_empty());
        assert_eq!(m.low_mid_tilt(), None);
    }
}
