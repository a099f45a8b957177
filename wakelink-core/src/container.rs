//! Uncompressed audio container framing.
//!
//! A container is a fixed 44-byte RIFF/WAVE header followed by little-endian
//! 16-bit mono PCM. The header is the only framing the remote service sees,
//! so `payload_len + HEADER_LEN` must always equal the bytes on the wire.

use crate::error::{Result, WakeError};

/// Size of the container header in bytes.
pub const HEADER_LEN: usize = 44;

const PCM_FORMAT: u16 = 1;
const CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;
const BLOCK_ALIGN: u16 = CHANNELS * BITS_PER_SAMPLE / 8;

/// Fields read back from a validated header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Declared payload size in bytes.
    pub data_len: u32,
    /// RIFF chunk size (total length minus 8).
    pub riff_len: u32,
}

impl WavHeader {
    /// Total container length declared by the header.
    pub fn total_len(&self) -> usize {
        self.riff_len as usize + 8
    }
}

/// Write the header for `payload_bytes` of mono 16-bit PCM at `sample_rate`
/// into `out`.
pub fn write_header(out: &mut [u8; HEADER_LEN], payload_bytes: u32, sample_rate: u32) {
    let byte_rate = sample_rate * u32::from(BLOCK_ALIGN);

    out[0..4].copy_from_slice(b"RIFF");
    out[4..8].copy_from_slice(&(36 + payload_bytes).to_le_bytes());
    out[8..12].copy_from_slice(b"WAVE");
    out[12..16].copy_from_slice(b"fmt ");
    out[16..20].copy_from_slice(&16u32.to_le_bytes());
    out[20..22].copy_from_slice(&PCM_FORMAT.to_le_bytes());
    out[22..24].copy_from_slice(&CHANNELS.to_le_bytes());
    out[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    out[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    out[32..34].copy_from_slice(&BLOCK_ALIGN.to_le_bytes());
    out[34..36].copy_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    out[36..40].copy_from_slice(b"data");
    out[40..44].copy_from_slice(&payload_bytes.to_le_bytes());
}

/// Convenience wrapper around [`write_header`] returning an owned header.
pub fn build_header(payload_bytes: u32, sample_rate: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    write_header(&mut header, payload_bytes, sample_rate);
    header
}

/// Check the magic markers and minimum length of a container.
///
/// Only `RIFF` at offset 0 and `WAVE` at offset 8 are enforced; the format
/// fields are decoded but not required to match what this crate writes, since
/// the reply service may produce other sample rates.
pub fn validate(bytes: &[u8]) -> Result<WavHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(WakeError::InvalidContainer("shorter than header"));
    }
    if &bytes[0..4] != b"RIFF" {
        return Err(WakeError::InvalidContainer("missing RIFF marker"));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(WakeError::InvalidContainer("missing WAVE marker"));
    }

    let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
    let u32_at =
        |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);

    Ok(WavHeader {
        riff_len: u32_at(4),
        channels: u16_at(22),
        sample_rate: u32_at(24),
        bits_per_sample: u16_at(34),
        data_len: u32_at(40),
    })
}

/// Serialise `samples` as little-endian PCM, handing the bytes to `emit`
/// in pieces no larger than `scratch`.
///
/// Lets the uploader stream a large buffer without materialising a second
/// copy of it.
pub fn pcm_to_le_bytes<F>(samples: &[i16], scratch: &mut [u8], mut emit: F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    let per_pass = (scratch.len() / 2).max(1);
    for block in samples.chunks(per_pass) {
        let len = block.len() * 2;
        for (dst, s) in scratch[..len].chunks_exact_mut(2).zip(block) {
            dst.copy_from_slice(&s.to_le_bytes());
        }
        emit(&scratch[..len])?;
    }
    Ok(())
}

/// Decode little-endian PCM following the header.
pub fn decode_pcm(payload: &[u8]) -> Vec<i16> {
    payload
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_declares_total_and_payload() {
        let header = build_header(96_000, 16_000);
        let parsed = validate(&header).unwrap();
        assert_eq!(parsed.total_len(), 96_000 + HEADER_LEN);
        assert_eq!(parsed.data_len, 96_000);
        assert_eq!(parsed.sample_rate, 16_000);
        assert_eq!(parsed.channels, 1);
        assert_eq!(parsed.bits_per_sample, 16);
        assert_eq!(&header[28..32], &32_000u32.to_le_bytes());
    }

    #[test]
    fn validate_rejects_bad_magic_and_short_input() {
        let mut header = build_header(10, 16_000);
        header[8] = b'X';
        assert!(matches!(
            validate(&header),
            Err(WakeError::InvalidContainer(_))
        ));
        assert!(matches!(
            validate(&[0u8; 43]),
            Err(WakeError::InvalidContainer(_))
        ));
    }

    #[test]
    fn framed_bytes_are_readable_by_hound() {
        let samples: Vec<i16> = (0..800).map(|i| (i * 40 - 16_000) as i16).collect();
        let mut bytes = build_header(samples.len() as u32 * 2, 16_000).to_vec();
        let mut scratch = [0u8; 64];
        pcm_to_le_bytes(&samples, &mut scratch, |b| {
            bytes.extend_from_slice(b);
            Ok(())
        })
        .unwrap();

        let reader = hound::WavReader::new(std::io::Cursor::new(bytes)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }

    #[test]
    fn pcm_pieces_respect_scratch_size() {
        let samples = vec![1i16; 100];
        let mut scratch = [0u8; 30];
        let mut sizes = Vec::new();
        pcm_to_le_bytes(&samples, &mut scratch, |b| {
            sizes.push(b.len());
            Ok(())
        })
        .unwrap();
        assert!(sizes.iter().all(|&n| n <= 30));
        assert_eq!(sizes.iter().sum::<usize>(), 200);
        assert_eq!(decode_pcm(&[1, 0, 0xff, 0xff]), vec![1, -1]);
    }
}
