//! Minimal WAV container for transformation requests, and raw PCM decoding
//! for responses.

use std::io::Cursor;

/// Size of the canonical RIFF/WAVE header for 16-bit PCM.
pub const WAV_HEADER_LEN: usize = 44;

/// Encodes mono 16-bit PCM as a canonical 44-byte-header WAV file.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        let mut sample_writer = writer.get_i16_writer(samples.len() as u32);
        for &sample in samples {
            sample_writer.write_sample(sample);
        }
        sample_writer.flush()?;
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Decodes little-endian 16-bit PCM. A trailing odd byte is dropped.
pub fn decode_pcm_s16le(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Folds interleaved multi-channel audio down to mono by averaging.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(usize::from(channels))
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / i32::from(channels)) as i16
        })
        .collect()
}
