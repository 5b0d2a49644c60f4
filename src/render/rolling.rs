use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::engine::{EngineError, EngineOutput, EngineRequest, RenderEngine};

/// Default number of engine log lines kept.
pub const DEFAULT_LOG_CAPACITY: usize = 400;

/// How many matching lines make up a failure summary.
const SUMMARY_LINES: usize = 3;

/// Bounded engine log. Oldest lines are dropped first.
#[derive(Debug)]
pub struct RollingLog {
    lines: VecDeque<String>,
    capacity: usize,
}

impl RollingLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.push(line);
        }
    }

    /// Mark where a new unit of work starts, so summaries don't mix requests.
    pub fn mark(&mut self, label: &str) {
        self.push(format!("--- {label}"));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Lines pushed since the most recent `mark`.
    pub fn since_mark(&self) -> Vec<&str> {
        let start = self
            .lines
            .iter()
            .rposition(|l| l.starts_with("--- "))
            .map(|i| i + 1)
            .unwrap_or(0);
        self.lines.iter().skip(start).map(String::as_str).collect()
    }
}

/// What kind of failure an engine run ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Memory/runtime fault; the instance must be replaced.
    Fatal,
    /// A filter in the graph was rejected at setup.
    StageIncompatible,
    /// Any other non-zero exit.
    Render,
}

static FATAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(segmentation fault|memory access out of bounds|out of memory|cannot allocate memory|aborted\(\)|runtimeerror|stack overflow|unreachable executed)",
    )
    .unwrap()
});

static STAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(no such filter|error initializing filter|error reinitializing filters|failed to configure (input|output) pad|option '[^']*' not found|error applying option)",
    )
    .unwrap()
});

static ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(error|invalid|failed|cannot|unable|no such|abort)").unwrap());

pub fn classify_failure(output: &EngineOutput) -> FailureKind {
    if output.exit_code.is_none() || output.log.iter().any(|l| FATAL_RE.is_match(l)) {
        FailureKind::Fatal
    } else if output.log.iter().any(|l| STAGE_RE.is_match(l)) {
        FailureKind::StageIncompatible
    } else {
        FailureKind::Render
    }
}

/// Short human-readable reason: the last few error-looking lines.
pub fn summarize_failure<'a, I>(lines: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let lines: Vec<&str> = lines.into_iter().map(str::trim).filter(|l| !l.is_empty()).collect();
    let matching: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| !l.starts_with("--- ") && ERROR_RE.is_match(l))
        .collect();

    if !matching.is_empty() {
        let start = matching.len().saturating_sub(SUMMARY_LINES);
        return matching[start..].join(" | ");
    }
    lines
        .iter()
        .rev()
        .find(|l| !l.starts_with("--- "))
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unknown engine failure".to_string())
}

/// Run one request, recording its log lines under `label`.
pub async fn run_logged<E: RenderEngine>(
    engine: &mut E,
    label: &str,
    request: &EngineRequest,
    log: &mut RollingLog,
) -> Result<EngineOutput, EngineError> {
    log.mark(label);
    log::debug!("engine {} ({})", request.kind(), label);
    let output = engine.run(request).await?;
    log.extend(output.log.iter().cloned());
    if !output.success() {
        log::debug!("engine {} ({}) exited with {:?}", request.kind(), label, output.exit_code);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(code: Option<i32>, log: &[&str]) -> EngineOutput {
        EngineOutput {
            exit_code: code,
            log: log.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_rolling_log_drops_oldest() {
        let mut log = RollingLog::new(3);
        log.extend(["a", "b", "c", "d"]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.lines().collect::<Vec<_>>(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_since_mark() {
        let mut log = RollingLog::new(10);
        log.push("old error");
        log.mark("render primary");
        log.push("fresh");
        assert_eq!(log.since_mark(), vec!["fresh"]);
    }

    #[test]
    fn test_signal_exit_is_fatal() {
        assert_eq!(classify_failure(&output(None, &[])), FailureKind::Fatal);
    }

    #[test]
    fn test_fatal_signature_wins_over_stage() {
        let out = output(Some(1), &["Error initializing filter 'afftdn'", "RuntimeError: memory access out of bounds"]);
        assert_eq!(classify_failure(&out), FailureKind::Fatal);
    }

    #[test]
    fn test_stage_incompatibility() {
        let out = output(Some(1), &["[AVFilterGraph @ 0x1] No such filter: 'afftdn'"]);
        assert_eq!(classify_failure(&out), FailureKind::StageIncompatible);
    }

    #[test]
    fn test_generic_render_failure() {
        let out = output(Some(1), &["in.wav: Invalid data found when processing input"]);
        assert_eq!(classify_failure(&out), FailureKind::Render);
    }

    #[test]
    fn test_summary_keeps_last_error_lines() {
        let lines = ["ok", "Error one", "fine", "error two", "failed three", "error four", "tail"];
        assert_eq!(summarize_failure(lines), "error two | failed three | error four");
    }

    #[test]
    fn test_summary_fallbacks() {
        assert_eq!(summarize_failure(["just text", "last"]), "last");
        assert_eq!(summarize_failure(Vec::<&str>::new()), "unknown engine failure");
    }
}
