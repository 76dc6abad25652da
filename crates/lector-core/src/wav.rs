//! WAV helpers — header parsing, duration, size fix-up and a minimal writer.
//!
//! Both backends hand back complete WAV files; the engine needs their duration
//! for elapsed-time reporting and rejects anything it cannot parse.

use thiserror::Error;

/// Size field value Kokoro writes when it streams WAV of unknown length.
const SIZE_UNKNOWN: u32 = u32::MAX;
const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;
const FMT_PCM_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WavError {
    #[error("too short for a RIFF header")]
    TooShort,
    #[error("not a RIFF/WAVE file")]
    NotWave,
    #[error("fmt chunk truncated")]
    FmtTruncated,
    #[error("unsupported audio format {0} (PCM only)")]
    NotPcm(u16),
    #[error("data chunk before fmt chunk")]
    DataBeforeFmt,
    #[error("data chunk not found")]
    NoData,
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// One sub-chunk header inside the RIFF body.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    id: [u8; 4],
    size: u32,
    /// Offset of the chunk header.
    at: usize,
}

impl Chunk {
    fn body(&self) -> usize {
        self.at + CHUNK_HEADER_LEN
    }
}

/// Walk the sub-chunks after the RIFF header.
///
/// An unknown-size `fmt ` chunk is assumed to be plain PCM; any other
/// unknown-size chunk ends the walk after it is yielded.
fn chunks(buf: &[u8]) -> impl Iterator<Item = Chunk> + '_ {
    let mut pos = Some(RIFF_HEADER_LEN);
    std::iter::from_fn(move || {
        let at = pos?;
        if at + CHUNK_HEADER_LEN > buf.len() {
            pos = None;
            return None;
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&buf[at..at + 4]);
        let size = le_u32(buf, at + 4);
        let chunk = Chunk { id, size, at };

        pos = match (size, &id) {
            (SIZE_UNKNOWN, b"fmt ") => Some(chunk.body() + FMT_PCM_LEN),
            (SIZE_UNKNOWN, _) => None,
            // RIFF pads odd-sized chunks to an even length.
            (n, _) => Some(chunk.body() + n as usize + (n as usize & 1)),
        };
        Some(chunk)
    })
}

fn check_riff(buf: &[u8]) -> Result<(), WavError> {
    if buf.len() < RIFF_HEADER_LEN {
        return Err(WavError::TooShort);
    }
    if &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err(WavError::NotWave);
    }
    Ok(())
}

/// Write a 16-bit mono PCM WAV file.
pub fn write_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut buf = Vec::with_capacity(44 + data_len as usize);

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&(FMT_PCM_LEN as u32).to_le_bytes());
    for field in [1u16, 1] {
        // format tag, channels
        buf.extend_from_slice(&field.to_le_bytes());
    }
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    for field in [2u16, 16] {
        // block align, bits per sample
        buf.extend_from_slice(&field.to_le_bytes());
    }

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend(samples.iter().flat_map(|s| s.to_le_bytes()));
    buf
}

/// Parsed WAV header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    /// Byte offset in the buffer where raw PCM data begins.
    pub data_offset: usize,
    /// Length of the PCM payload actually present in the buffer.
    pub data_len: usize,
}

impl WavHeader {
    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        let frame_bytes = self.channels as usize * (self.bits_per_sample as usize / 8);
        if frame_bytes == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        (self.data_len / frame_bytes) as f64 / self.sample_rate as f64
    }
}

/// Format fields from a `fmt ` chunk: channels, sample rate, bits per sample.
fn read_fmt(buf: &[u8], chunk: &Chunk) -> Result<(u16, u32, u16), WavError> {
    let body = chunk.body();
    if body + FMT_PCM_LEN > buf.len() {
        return Err(WavError::FmtTruncated);
    }
    let format = le_u16(buf, body);
    if format != 1 {
        return Err(WavError::NotPcm(format));
    }
    Ok((
        le_u16(buf, body + 2),
        le_u32(buf, body + 4),
        le_u16(buf, body + 14),
    ))
}

/// Parse the header of a WAV buffer.
///
/// Unknown-size (`0xFFFFFFFF`) fields are tolerated: the data payload then
/// runs to the end of the buffer. A declared size larger than the buffer is
/// clipped to what is present.
pub fn parse_wav_header(buf: &[u8]) -> Result<WavHeader, WavError> {
    check_riff(buf)?;

    let mut format = None;
    for chunk in chunks(buf) {
        match &chunk.id {
            b"fmt " => format = Some(read_fmt(buf, &chunk)?),
            b"data" => {
                let (channels, sample_rate, bits_per_sample) =
                    format.ok_or(WavError::DataBeforeFmt)?;
                let available = buf.len() - chunk.body();
                let data_len = match chunk.size {
                    SIZE_UNKNOWN => available,
                    n => (n as usize).min(available),
                };
                return Ok(WavHeader {
                    channels,
                    sample_rate,
                    bits_per_sample,
                    data_offset: chunk.body(),
                    data_len,
                });
            }
            _ => {}
        }
    }
    Err(WavError::NoData)
}

/// Duration in seconds of a complete WAV buffer.
pub fn wav_duration(buf: &[u8]) -> Result<f64, WavError> {
    parse_wav_header(buf).map(|h| h.duration())
}

/// Rewrite the RIFF and `data` sizes of a fully buffered WAV file.
///
/// Kokoro streams WAV with chunked transfer encoding and writes `0xFFFFFFFF`
/// for both. Buffers that are not RIFF are returned untouched.
pub fn fix_wav_sizes(mut wav: Vec<u8>) -> Vec<u8> {
    if check_riff(&wav).is_err() {
        return wav;
    }
    let riff_size = (wav.len() - 8) as u32;
    wav[4..8].copy_from_slice(&riff_size.to_le_bytes());

    let data = chunks(&wav).find(|c| &c.id == b"data");
    if let Some(data) = data {
        let data_size = (wav.len() - data.body()) as u32;
        wav[data.at + 4..data.body()].copy_from_slice(&data_size.to_le_bytes());
    }
    wav
}
