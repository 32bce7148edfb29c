use std::io::Cursor;

/// Format produced by the default capture command.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;
pub const CAPTURE_CHANNELS: u16 = 1;

/// Interprets little-endian bytes as i16 PCM samples. A trailing odd byte is
/// ignored.
pub fn decode_i16_le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Root-mean-square level of normalised samples in dB relative to full
/// scale. Silence reads as negative infinity.
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    if mean_square == 0.0 {
        return f32::NEG_INFINITY;
    }
    10.0 * mean_square.log10()
}

/// Level in dBFS of a block of raw little-endian PCM16.
pub fn block_level_db(bytes: &[u8]) -> f32 {
    rms_dbfs(&convert_i16_to_f32(&decode_i16_le(bytes)))
}

/// Wraps raw little-endian PCM16 in a WAV container.
pub fn encode_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for sample in decode_i16_le(pcm) {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
