use thiserror::Error;

use super::{run_step, AnalyzeError};
use crate::engine::{EngineRequest, RenderEngine};
use crate::render::rolling::RollingLog;

/// Sample rate every input is decoded to for frame analysis.
pub const ANALYSIS_SAMPLE_RATE: u32 = 16_000;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("decoded stream of {0} bytes is not whole f32 samples")]
    Misaligned(usize),
}

/// Decode `input` to mono f32 at the analysis rate through the engine.
/// The intermediate raw file is always deleted.
pub async fn decode_mono<E: RenderEngine>(
    engine: &mut E,
    input: &str,
    log: &mut RollingLog,
) -> Result<Vec<f32>, AnalyzeError> {
    let raw_name = format!("{input}.analysis.f32");
    let request = EngineRequest::Decode {
        input: input.to_string(),
        output: raw_name.clone(),
        sample_rate: ANALYSIS_SAMPLE_RATE,
    };

    let result = async {
        run_step(engine, "decode", &request, log).await?;
        let bytes = engine.read_file(&raw_name).await?;
        Ok::<_, AnalyzeError>(samples_from_f32le(&bytes)?)
    }
    .await;

    // Clean up temp file
    engine.delete_file(&raw_name).await.ok();

    result
}

/// Raw little-endian f32 → samples. Non-finite samples become silence.
pub fn samples_from_f32le(bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if bytes.len() % 4 != 0 {
        return Err(DecodeError::Misaligned(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| {
            let s = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if s.is_finite() { s } else { 0.0 }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_from_bytes() {
        let bytes: Vec<u8> = [0.5f32, -0.25, f32::NAN]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(samples_from_f32le(&bytes).unwrap(), vec![0.5, -0.25, 0.0]);
    }

    #[test]
    fn test_misaligned_stream() {
        assert!(matches!(samples_from_f32le(&[0, 0, 0]), Err(DecodeError::Misaligned(3))));
        assert!(samples_from_f32le(&[]).unwrap().is_empty());
    }
}
