//! WAV export of synthesized session audio.

use crate::defaults::{BYTES_PER_SAMPLE, SAMPLE_RATE};
use crate::error::{Result, SayshError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// 16 kHz, mono, 16-bit signed integer.
pub fn wav_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: (BYTES_PER_SAMPLE * 8) as u16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// `saysh_audio_YYYYmmdd_HHMMSS.wav`
pub fn audio_file_name(at: DateTime<Local>) -> String {
    format!("saysh_audio_{}.wav", at.format("%Y%m%d_%H%M%S"))
}

/// Write little-endian 16-bit PCM to `path`. A trailing odd byte is ignored.
pub fn write_wav(path: &Path, pcm: &[u8]) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, wav_spec()).map_err(|e| {
        SayshError::AudioOutput {
            message: format!("Failed to create WAV file {}: {}", path.display(), e),
        }
    })?;

    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        writer
            .write_sample(sample)
            .map_err(|e| SayshError::AudioOutput {
                message: format!("Failed to write WAV sample: {}", e),
            })?;
    }

    writer.finalize().map_err(|e| SayshError::AudioOutput {
        message: format!("Failed to finalize WAV file {}: {}", path.display(), e),
    })
}

/// Save `pcm` under `dir` with a timestamped name, creating `dir` if needed.
pub fn save_session_audio(dir: &Path, pcm: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(audio_file_name(Local::now()));
    write_wav(&path, pcm)?;
    Ok(path)
}
