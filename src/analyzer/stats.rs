//! Defensive parsers for the engine's statistics text.
//!
//! Everything here returns `None` on malformed or missing text; callers
//! degrade instead of failing.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Loudness measurement reported by the engine's loudness pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoudnessStats {
    pub integrated: f64,
    pub range: f64,
    pub true_peak: f64,
    pub threshold: f64,
    /// Present on a normalization pass; used for the second pass of two-pass normalization.
    pub target_offset: Option<f64>,
}

static RMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RMS level dB:\s*(-?(?:inf|\d+(?:\.\d+)?))").unwrap());

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,3}):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

/// Extract the last JSON object printed in the log and read the loudness fields.
pub fn parse_loudness(log: &[String]) -> Option<LoudnessStats> {
    let start = log.iter().rposition(|l| l.trim() == "{")?;
    let end = start + log[start..].iter().position(|l| l.trim() == "}")?;
    let body = log[start..=end].join("\n");
    let fields: HashMap<String, serde_json::Value> = serde_json::from_str(&body).ok()?;

    let get = |key: &str| -> Option<f64> {
        match fields.get(key)? {
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok().and_then(finite),
            serde_json::Value::Number(n) => n.as_f64().and_then(finite),
            _ => None,
        }
    };

    Some(LoudnessStats {
        integrated: get("input_i")?,
        range: get("input_lra")?,
        true_peak: get("input_tp")?,
        threshold: get("input_thresh")?,
        target_offset: get("target_offset"),
    })
}

/// Last "RMS level dB" value in the log (the overall figure comes last).
pub fn parse_rms_db(log: &[String]) -> Option<f64> {
    log.iter().rev().find_map(|line| {
        let caps = RMS_RE.captures(line)?;
        caps[1].parse::<f64>().ok().and_then(finite)
    })
}

/// Duration in seconds from the first `Duration: HH:MM:SS[.fraction]` style line.
pub fn parse_duration(log: &[String]) -> Option<f64> {
    log.iter()
        .filter(|l| l.contains("Duration"))
        .find_map(|line| {
            let caps = DURATION_RE.captures(line)?;
            let h: f64 = caps[1].parse().ok()?;
            let m: f64 = caps[2].parse().ok()?;
            let s: f64 = caps[3].parse().ok()?;
            if m >= 60.0 || s >= 60.0 {
                return None;
            }
            finite(h * 3600.0 + m * 60.0 + s)
        })
}
