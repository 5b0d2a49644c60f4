//! Scripted in-memory engine for orchestrator and batch tests.
//!
//! Rendering is a stateless byte transform keyed on the filter graph, and
//! spans slice the input at `MOCK_BYTES_PER_SEC`, so segment splices are
//! exact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::engine::{EngineError, EngineFactory, EngineOutput, EngineRequest, RenderEngine};

pub const MOCK_BYTES_PER_SEC: f64 = 100.0;

pub type SharedScript = Arc<Mutex<MockScript>>;

/// Makes every request whose graph contains `graph_contains` fail.
#[derive(Debug, Clone)]
pub struct FailRule {
    pub graph_contains: String,
    pub log: Vec<String>,
    pub signal: bool,
    /// `None` = fail forever.
    pub remaining: Option<usize>,
}

#[derive(Debug, Default)]
pub struct MockScript {
    pub created: u64,
    pub shutdowns: u64,
    pub fail_create: bool,
    pub fail_writes: bool,
    pub requests: Vec<EngineRequest>,
    pub rules: Vec<FailRule>,
    pub decoded: Vec<f32>,
    pub probe_log: Vec<String>,
    pub measure_logs: Vec<(String, Vec<String>)>,
    /// Like `measure_logs`, but only for inputs whose name starts with the
    /// first element. Checked before `measure_logs`.
    pub input_measure_logs: Vec<(String, String, Vec<String>)>,
}

impl MockScript {
    pub fn shared() -> SharedScript {
        Arc::new(Mutex::new(MockScript {
            probe_log: vec!["  Duration: 00:00:10.00, start: 0.000000, bitrate: 768 kb/s".into()],
            ..Default::default()
        }))
    }

    pub fn fail_when(&mut self, graph_contains: &str, log: &[&str], signal: bool, remaining: Option<usize>) {
        self.rules.push(FailRule {
            graph_contains: graph_contains.to_string(),
            log: log.iter().map(|s| s.to_string()).collect(),
            signal,
            remaining,
        });
    }

    pub fn render_graphs(&self) -> Vec<String> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                EngineRequest::Render { graph, .. } => Some(graph.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct MockFactory {
    script: SharedScript,
}

impl MockFactory {
    pub fn new(script: SharedScript) -> Self {
        Self { script }
    }
}

impl EngineFactory for MockFactory {
    type Engine = MockEngine;

    async fn create(&self, _generation: u64) -> Result<MockEngine, EngineError> {
        let mut s = self.script.lock().unwrap();
        if s.fail_create {
            return Err(EngineError::NotFound("mock".into()));
        }
        s.created += 1;
        Ok(MockEngine {
            files: HashMap::new(),
            script: self.script.clone(),
        })
    }
}

pub struct MockEngine {
    pub files: HashMap<String, Vec<u8>>,
    script: SharedScript,
}

/// Deterministic, position-independent transform for a graph.
pub fn mock_transform(graph: &str, bytes: &[u8]) -> Vec<u8> {
    let key = graph.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    bytes.iter().map(|b| b.wrapping_add(key)).collect()
}

fn failed(log: &str) -> EngineOutput {
    EngineOutput {
        exit_code: Some(1),
        log: vec![log.to_string()],
    }
}

fn ok(log: Vec<String>) -> EngineOutput {
    EngineOutput {
        exit_code: Some(0),
        log,
    }
}

impl RenderEngine for MockEngine {
    async fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        if self.script.lock().unwrap().fail_writes {
            return Err(EngineError::Io(std::io::Error::other("No space left on device")));
        }
        self.files.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::MissingFile(name.to_string()))
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        self.files.remove(name);
        Ok(())
    }

    async fn run(&mut self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        let mut s = self.script.lock().unwrap();
        s.requests.push(request.clone());

        let graph = match request {
            EngineRequest::Render { graph, .. } | EngineRequest::Measure { graph, .. } => Some(graph.as_str()),
            _ => None,
        };
        if let Some(graph) = graph {
            for rule in s.rules.iter_mut() {
                if rule.remaining == Some(0) || !graph.contains(&rule.graph_contains) {
                    continue;
                }
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                return Ok(EngineOutput {
                    exit_code: if rule.signal { None } else { Some(1) },
                    log: rule.log.clone(),
                });
            }
        }

        match request {
            EngineRequest::Render { input, output, graph, span, .. } => {
                let Some(src) = self.files.get(input) else {
                    return Ok(failed("No such file or directory"));
                };
                let slice = match span {
                    Some(sp) => {
                        let start = ((sp.start_secs * MOCK_BYTES_PER_SEC).round() as usize).min(src.len());
                        let len = (sp.duration_secs * MOCK_BYTES_PER_SEC).round() as usize;
                        &src[start..(start + len).min(src.len())]
                    }
                    None => &src[..],
                };
                let rendered = mock_transform(graph, slice);
                self.files.insert(output.clone(), rendered);
                Ok(ok(vec!["size=N/A time=00:00:01.00".into()]))
            }
            EngineRequest::Measure { input, graph } => {
                let per_input = s
                    .input_measure_logs
                    .iter()
                    .find(|(prefix, pattern, _)| input.starts_with(prefix.as_str()) && graph.contains(pattern.as_str()))
                    .map(|(_, _, log)| log.clone());
                let log = per_input
                    .or_else(|| {
                        s.measure_logs
                            .iter()
                            .find(|(pattern, _)| graph.contains(pattern.as_str()))
                            .map(|(_, log)| log.clone())
                    })
                    .unwrap_or_default();
                Ok(ok(log))
            }
            EngineRequest::Decode { output, .. } => {
                let bytes: Vec<u8> = s.decoded.iter().flat_map(|x| x.to_le_bytes()).collect();
                self.files.insert(output.clone(), bytes);
                Ok(ok(Vec::new()))
            }
            EngineRequest::Probe { .. } => Ok(ok(s.probe_log.clone())),
            EngineRequest::Concat { inputs, output } => {
                let mut joined = Vec::new();
                for name in inputs {
                    match self.files.get(name) {
                        Some(b) => joined.extend_from_slice(b),
                        None => return Ok(failed("concat input missing")),
                    }
                }
                self.files.insert(output.clone(), joined);
                Ok(ok(Vec::new()))
            }
        }
    }

    async fn shutdown(&mut self) {
        self.script.lock().unwrap().shutdowns += 1;
        self.files.clear();
    }
}
