//! Two-pass loudness normalization of an already-rendered mix.

use serde::{Deserialize, Serialize};

use super::{Failure, RenderOrchestrator};
use crate::analyzer::stats::{parse_loudness, LoudnessStats};
use crate::engine::{EngineFactory, EngineRequest, RenderEngine};
use crate::render::rolling::{classify_failure, run_logged, summarize_failure, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoudnessTarget {
    pub integrated: f64,
    pub true_peak: f64,
    pub range: f64,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated: -16.0,
            true_peak: -1.5,
            range: 11.0,
        }
    }
}

impl LoudnessTarget {
    fn base(&self) -> String {
        format!("loudnorm=I={:.1}:TP={:.1}:LRA={:.1}", self.integrated, self.true_peak, self.range)
    }

    pub fn measure_graph(&self) -> String {
        format!("{}:print_format=json", self.base())
    }

    /// Second pass with the first pass's measurement, or a dynamic one-pass
    /// normalization when nothing usable was measured.
    pub fn apply_graph(&self, measured: Option<&LoudnessStats>) -> String {
        match measured {
            Some(m) => format!(
                "{}:measured_I={:.2}:measured_TP={:.2}:measured_LRA={:.2}:measured_thresh={:.2}:offset={:.2}:linear=true:print_format=summary",
                self.base(),
                m.integrated,
                m.true_peak,
                m.range,
                m.threshold,
                m.target_offset.unwrap_or(0.0)
            ),
            None => self.base(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizedMix {
    pub bytes: Vec<u8>,
    pub two_pass: bool,
}

impl<F: EngineFactory> RenderOrchestrator<F> {
    /// Normalize `rendered` toward `target`. Errors carry a short reason.
    pub async fn normalize_loudness(
        &mut self,
        prefix: &str,
        rendered: &[u8],
        target: &LoudnessTarget,
    ) -> Result<NormalizedMix, String> {
        let src = format!("{prefix}.norm-src.wav");
        let out = format!("{prefix}.norm.wav");
        let temps = [src.clone(), out.clone()];

        let result = self.normalize_inner(&src, &out, rendered, target).await;
        self.discard(&temps).await;
        result.map_err(|f| f.reason)
    }

    async fn normalize_inner(
        &mut self,
        src: &str,
        out: &str,
        rendered: &[u8],
        target: &LoudnessTarget,
    ) -> Result<NormalizedMix, Failure> {
        self.slot.acquire().await?.write_file(src, rendered).await?;

        let request = EngineRequest::Measure {
            input: src.to_string(),
            graph: target.measure_graph(),
        };
        let engine = self.slot.acquire().await?;
        let output = run_logged(engine, "loudness measure", &request, &mut self.log).await?;
        if !output.success() && classify_failure(&output) == FailureKind::Fatal {
            self.slot.mark_poisoned();
            return Err(Failure {
                kind: FailureKind::Fatal,
                reason: summarize_failure(self.log.since_mark()),
            });
        }
        let measured = Some(&output)
            .filter(|o| o.success())
            .and_then(|o| parse_loudness(&o.log));
        if measured.is_none() {
            log::warn!("{}: loudness measurement unusable, normalizing in one pass", src);
        }

        let request = EngineRequest::Render {
            input: src.to_string(),
            output: out.to_string(),
            graph: target.apply_graph(measured.as_ref()),
            span: None,
            sample_rate: self.settings.sample_rate,
        };
        self.step("loudness apply", request).await?;
        let bytes = self.slot.acquire().await?.read_file(out).await?;
        Ok(NormalizedMix {
            bytes,
            two_pass: measured.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderSettings;
    use crate::testing::{MockFactory, MockScript};

    fn measured() -> LoudnessStats {
        LoudnessStats {
            integrated: -24.0,
            range: 9.5,
            true_peak: -3.1,
            threshold: -34.2,
            target_offset: Some(0.2),
        }
    }

    #[test]
    fn test_graphs() {
        let t = LoudnessTarget::default();
        assert_eq!(t.measure_graph(), "loudnorm=I=-16.0:TP=-1.5:LRA=11.0:print_format=json");
        assert_eq!(t.apply_graph(None), "loudnorm=I=-16.0:TP=-1.5:LRA=11.0");
        let two = t.apply_graph(Some(&measured()));
        assert!(two.contains("measured_I=-24.00"));
        assert!(two.contains("offset=0.20"));
        assert!(two.contains("linear=true"));
    }

    #[tokio::test]
    async fn test_unparseable_measurement_falls_back_to_one_pass() {
        let script = MockScript::shared();
        script.lock().unwrap().measure_logs = vec![("loudnorm".into(), vec!["garbage {".into()])];
        let mut orch = RenderOrchestrator::new(MockFactory::new(script.clone()), RenderSettings::default(), 100);

        let mix = orch
            .normalize_loudness("take.clean", b"abc", &LoudnessTarget::default())
            .await
            .unwrap();
        assert!(!mix.two_pass);
        assert_eq!(
            script.lock().unwrap().render_graphs(),
            vec!["loudnorm=I=-16.0:TP=-1.5:LRA=11.0".to_string()]
        );
        assert!(orch.slot.instance().unwrap().files.is_empty());
    }

    #[tokio::test]
    async fn test_fatal_measure_poisons_engine_before_apply() {
        let script = MockScript::shared();
        script
            .lock()
            .unwrap()
            .fail_when("print_format=json", &["Segmentation fault"], true, Some(1));
        let mut orch = RenderOrchestrator::new(MockFactory::new(script.clone()), RenderSettings::default(), 100);

        let err = orch
            .normalize_loudness("take.clean", b"abc", &LoudnessTarget::default())
            .await
            .unwrap_err();
        assert_eq!(err, "Segmentation fault");
        assert!(orch.slot.is_poisoned());
        assert!(script.lock().unwrap().render_graphs().is_empty());

        // the next request runs on a fresh instance
        let mix = orch
            .normalize_loudness("take.clean", b"abc", &LoudnessTarget::default())
            .await
            .unwrap();
        assert!(!mix.two_pass);
        assert_eq!(orch.recycle_count(), 1);
        let s = script.lock().unwrap();
        assert_eq!(s.created, 2);
        assert_eq!(s.shutdowns, 1);
    }

    #[tokio::test]
    async fn test_failed_apply_reports_reason() {
        let script = MockScript::shared();
        script
            .lock()
            .unwrap()
            .fail_when("loudnorm", &["Invalid argument"], false, None);
        let mut orch = RenderOrchestrator::new(MockFactory::new(script), RenderSettings::default(), 100);

        let err = orch
            .normalize_loudness("take.clean", b"abc", &LoudnessTarget::default())
            .await
            .unwrap_err();
        assert_eq!(err, "Invalid argument");
    }
}
