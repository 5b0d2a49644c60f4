use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use super::{EngineError, EngineFactory, EngineOutput, EngineRequest, RenderEngine, Span};

/// Starts ffmpeg-backed engine instances, each with its own scratch directory.
#[derive(Debug, Clone)]
pub struct FfmpegFactory {
    binary: PathBuf,
}

impl FfmpegFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }
}

impl EngineFactory for FfmpegFactory {
    type Engine = FfmpegEngine;

    async fn create(&self, generation: u64) -> Result<FfmpegEngine, EngineError> {
        // Check ffmpeg is available
        let check = Command::new(&self.binary)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match check {
            Ok(status) if status.success() => {}
            _ => return Err(EngineError::NotFound(self.binary.display().to_string())),
        }

        let dir = std::env::temp_dir().join(format!(
            "voxlevel_{}_{}",
            std::process::id(),
            generation
        ));
        tokio::fs::create_dir_all(&dir).await?;
        log::debug!("engine generation {} scratch: {}", generation, dir.display());

        Ok(FfmpegEngine {
            binary: self.binary.clone(),
            dir,
            concat_lists: 0,
        })
    }
}

/// One ffmpeg "instance": a binary plus a private scratch directory acting as
/// the virtual file system. Every request is a separate ffmpeg process run
/// inside that directory.
#[derive(Debug)]
pub struct FfmpegEngine {
    binary: PathBuf,
    dir: PathBuf,
    concat_lists: u64,
}

/// A plain file name inside the scratch directory. A leading `-` would be
/// read as an ffmpeg option when the name is passed as an output.
pub(crate) fn is_valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

impl FfmpegEngine {
    fn resolve(&self, name: &str) -> Result<PathBuf, EngineError> {
        if !is_valid_file_name(name) {
            return Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid virtual file name: {name:?}"),
            )));
        }
        Ok(self.dir.join(name))
    }
}

impl RenderEngine for FfmpegEngine {
    async fn write_file(&mut self, name: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    async fn read_file(&mut self, name: &str) -> Result<Vec<u8>, EngineError> {
        let path = self.resolve(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::MissingFile(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&mut self, name: &str) -> Result<(), EngineError> {
        let path = self.resolve(name)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn run(&mut self, request: &EngineRequest) -> Result<EngineOutput, EngineError> {
        let list_name = if let EngineRequest::Concat { inputs, .. } = request {
            self.concat_lists += 1;
            let name = format!("concat_{}.txt", self.concat_lists);
            self.write_file(&name, concat_list(inputs).as_bytes()).await?;
            Some(name)
        } else {
            None
        };

        let args = ffmpeg_args(request, list_name.as_deref());
        log::trace!("ffmpeg {}", args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        if let Some(name) = list_name {
            self.delete_file(&name).await.ok();
        }

        let log = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::to_string)
            .collect();

        Ok(EngineOutput {
            exit_code: output.status.code(),
            log,
        })
    }

    async fn shutdown(&mut self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.dir).await {
            log::debug!("failed to remove scratch {}: {}", self.dir.display(), e);
        }
    }
}

/// Concat-demuxer list file body.
fn concat_list(inputs: &[String]) -> String {
    inputs
        .iter()
        .map(|name| format!("file '{}'\n", name.replace('\'', "'\\''")))
        .collect()
}

/// Prefix that cuts a sample-accurate window out of the input before `graph` runs.
fn span_graph(span: Option<Span>, graph: &str) -> String {
    match span {
        Some(s) => {
            let trim = format!(
                "atrim=start={:.6}:duration={:.6},asetpts=PTS-STARTPTS",
                s.start_secs, s.duration_secs
            );
            if graph.is_empty() {
                trim
            } else {
                format!("{trim},{graph}")
            }
        }
        None if graph.is_empty() => "anull".to_string(),
        None => graph.to_string(),
    }
}

/// Translate a request into an ffmpeg argument vector.
pub fn ffmpeg_args(request: &EngineRequest, concat_list_name: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match request {
        EngineRequest::Render {
            input,
            output,
            graph,
            span,
            sample_rate,
        } => {
            args.extend([
                "-i".to_string(),
                input.clone(),
                "-af".to_string(),
                span_graph(*span, graph),
                "-ac".to_string(),
                "1".to_string(),
                "-ar".to_string(),
                sample_rate.to_string(),
                "-c:a".to_string(),
                "pcm_s16le".to_string(),
                output.clone(),
            ]);
        }
        EngineRequest::Measure { input, graph } => {
            args.extend([
                "-i".to_string(),
                input.clone(),
                "-af".to_string(),
                span_graph(None, graph),
                "-f".to_string(),
                "null".to_string(),
                "-".to_string(),
            ]);
        }
        EngineRequest::Decode {
            input,
            output,
            sample_rate,
        } => {
            args.extend([
                "-i".to_string(),
                input.clone(),
                "-ac".to_string(),
                "1".to_string(),
                "-ar".to_string(),
                sample_rate.to_string(),
                "-f".to_string(),
                "f32le".to_string(),
                "-c:a".to_string(),
                "pcm_f32le".to_string(),
                output.clone(),
            ]);
        }
        EngineRequest::Probe { input } => {
            args.extend([
                "-i".to_string(),
                input.clone(),
                "-t".to_string(),
                "0".to_string(),
                "-f".to_string(),
                "null".to_string(),
                "-".to_string(),
            ]);
        }
        EngineRequest::Concat { output, .. } => {
            args.extend([
                "-f".to_string(),
                "concat".to_string(),
                "-safe".to_string(),
                "0".to_string(),
                "-i".to_string(),
                concat_list_name.unwrap_or("concat.txt").to_string(),
                "-c".to_string(),
                "copy".to_string(),
                output.clone(),
            ]);
        }
    }

    args
}
