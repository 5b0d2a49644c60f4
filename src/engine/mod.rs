pub mod ffmpeg;
pub mod slot;

use thiserror::Error;

pub use ffmpeg::{FfmpegEngine, FfmpegFactory};
pub use slot::EngineSlot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("rendering engine not found: {0}")]
    NotFound(String),
    #[error("engine failed to start: {0}")]
    Spawn(String),
    #[error("virtual file not found: {0}")]
    MissingFile(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sub-range of an input, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub start_secs: f64,
    pub duration_secs: f64,
}

/// One unit of work for the engine. File names refer to the engine's virtual file system.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    /// Run `graph` over `input` and write mono PCM WAV to `output`.
    Render {
        input: String,
        output: String,
        graph: String,
        span: Option<Span>,
        sample_rate: u32,
    },
    /// Run `graph` for its statistics only; nothing is written.
    Measure { input: String, graph: String },
    /// Decode to raw little-endian mono f32 at `sample_rate`.
    Decode {
        input: String,
        output: String,
        sample_rate: u32,
    },
    /// Report container information (duration line) without rendering.
    Probe { input: String },
    /// Losslessly join already-rendered files in order.
    Concat { inputs: Vec<String>, output: String },
}

impl EngineRequest {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Render { .. } => "render",
            Self::Measure { .. } => "measure",
            Self::Decode { .. } => "decode",
            Self::Probe { .. } => "probe",
            Self::Concat { .. } => "concat",
        }
    }
}

/// What the engine reported back. A `None` exit code means it died on a signal.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    pub exit_code: Option<i32>,
    pub log: Vec<String>,
}

impl EngineOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An external audio-rendering engine that executes textual filter graphs.
///
/// Instances are not safe to share across concurrent invocations; callers hold
/// `&mut` for the duration of every call.
#[allow(async_fn_in_trait)]
pub trait RenderEngine {
    async fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError>;
    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError>;
    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError>;
    async fn run(&mut self, request: &EngineRequest) -> Result<EngineOutput, EngineError>;
    /// Release everything the instance holds. The instance is not used afterwards.
    async fn shutdown(&mut self);
}

/// Builds fresh engine instances (initial start-up and every recycle).
#[allow(async_fn_in_trait)]
pub trait EngineFactory {
    type Engine: RenderEngine;

    async fn create(&self, generation: u64) -> Result<Self::Engine, EngineError>;
}
