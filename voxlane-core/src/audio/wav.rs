//! WAV file source: replays a recording into a stream writer.

use std::path::Path;

use tracing::{debug, info};

use crate::error::{Result, VoxlaneError};
use crate::stream::Writer;

/// Frames handed to `Writer::write` per call.
const BLOCK_FRAMES: usize = 4096;

/// Bytes per interleaved frame of `spec`.
pub fn frame_size(spec: &hound::WavSpec) -> usize {
    usize::from(spec.channels) * usize::from(spec.bits_per_sample).div_ceil(8)
}

/// Stream every frame of the WAV file at `path` into `writer`, one frame per
/// word, as little-endian PCM in the file's own format.
///
/// Returns the number of words the writer accepted. With a `Nonblocking` or
/// `AllOrNothing` writer that may be fewer than the file holds.
///
/// # Errors
/// - `IncompatibleFormat` if the file's frame size differs from the stream's
///   word size or its sample format is not supported.
/// - `Wav` on a malformed file; `StreamClosed` if the writer closes mid-file.
pub fn write_wav_file(writer: &Writer, path: impl AsRef<Path>) -> Result<usize> {
    let path = path.as_ref();
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let frame = frame_size(&spec);
    if frame != writer.word_size() {
        return Err(VoxlaneError::IncompatibleFormat(format!(
            "{}: {} ch × {} bit = {frame} bytes per frame, stream words are {} bytes",
            path.display(),
            spec.channels,
            spec.bits_per_sample,
            writer.word_size()
        )));
    }
    info!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels = spec.channels,
        bits = spec.bits_per_sample,
        frames = reader.duration(),
        "replaying wav into stream"
    );

    let block_bytes = BLOCK_FRAMES * frame;
    let mut block: Vec<u8> = Vec::with_capacity(block_bytes);
    let mut accepted = 0usize;
    let mut flush = |block: &mut Vec<u8>| -> Result<()> {
        let words = block.len() / frame;
        if words > 0 {
            let n = writer.write(block, words)?;
            if n < words {
                debug!(offered = words, accepted = n, "wav block truncated by writer");
            }
            accepted += n;
        }
        block.clear();
        Ok(())
    };

    match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, 32) => {
            for sample in reader.samples::<f32>() {
                block.extend_from_slice(&sample?.to_le_bytes());
                if block.len() >= block_bytes {
                    flush(&mut block)?;
                }
            }
        }
        (hound::SampleFormat::Int, bits @ (8 | 16 | 24 | 32)) => {
            for sample in reader.samples::<i32>() {
                let sample = sample?;
                match bits {
                    // 8-bit WAV is unsigned on disk; hound hands it back signed.
                    8 => block.push((sample + 128) as u8),
                    16 => block.extend_from_slice(&(sample as i16).to_le_bytes()),
                    24 => block.extend_from_slice(&sample.to_le_bytes()[..3]),
                    _ => block.extend_from_slice(&sample.to_le_bytes()),
                }
                if block.len() >= block_bytes {
                    flush(&mut block)?;
                }
            }
        }
        (format, bits) => {
            return Err(VoxlaneError::IncompatibleFormat(format!(
                "unsupported wav sample format: {format:?} {bits}-bit"
            )))
        }
    }
    flush(&mut block)?;

    info!(words = accepted, "wav replay complete");
    Ok(accepted)
}
