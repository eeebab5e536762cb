//! Symphonia-backed file decoder.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder as CodecDecoder, DecoderOptions};
use symphonia::core::errors::Error;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use symphonia::default::{get_codecs, get_probe};

use crate::backend::{PcmFormat, SampleEncoding};
use crate::error::{Result, SonaraError};

use super::decoder::Decoder;

/// Decoder over any container/codec pair symphonia can probe (wav, flac,
/// ogg/vorbis, mp3).
pub struct SymphoniaDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    format: PcmFormat,
    duration: Option<f64>,
    /// Interleaved samples decoded past what the last `decode` call could
    /// take.
    leftover: Vec<f32>,
}

impl SymphoniaDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| SonaraError::Decode(format!("failed to probe {:?}: {}", path, e)))?;

        let reader = probed.format;
        let track = reader
            .default_track()
            .ok_or_else(|| SonaraError::Decode(format!("no default track in {:?}", path)))?;
        let track_id = track.id;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| SonaraError::Decode("sample rate not reported".to_string()))?;
        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| SonaraError::Decode("channel count not reported".to_string()))?
            .count() as u16;
        let duration = track
            .codec_params
            .n_frames
            .map(|frames| frames as f64 / sample_rate as f64);

        let decoder = get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| SonaraError::Decode(format!("failed to create decoder: {}", e)))?;

        Ok(Self {
            reader,
            decoder,
            track_id,
            format: PcmFormat {
                channels,
                sample_rate,
                bits_per_sample: 32,
                encoding: SampleEncoding::Float,
            },
            duration,
            leftover: Vec::new(),
        })
    }

    fn take_leftover(&mut self, out: &mut [f32], written: usize) -> usize {
        let take = self.leftover.len().min(out.len() - written);
        out[written..written + take].copy_from_slice(&self.leftover[..take]);
        self.leftover.drain(..take);
        take
    }
}

impl Decoder for SymphoniaDecoder {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn decode(&mut self, out: &mut [f32]) -> Result<usize> {
        let channels = self.format.channels.max(1) as usize;
        let capacity = out.len() - out.len() % channels;
        let mut written = self.take_leftover(&mut out[..capacity], 0);

        while written < capacity {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                // End of file; some formats signal it as an IO error.
                Err(Error::IoError(_)) => break,
                Err(e) => {
                    return Err(SonaraError::Decode(format!("error reading packet: {}", e)));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => break,
                // Recoverable corruption: skip the packet.
                Err(Error::DecodeError(_)) => continue,
                Err(e) => {
                    return Err(SonaraError::Decode(format!("error decoding packet: {}", e)));
                }
            };

            let spec = *decoded.spec();
            let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buf.copy_interleaved_ref(decoded);
            self.leftover.extend_from_slice(buf.samples());

            written += self.take_leftover(&mut out[..capacity], written);
        }

        Ok(written / channels)
    }

    fn seek(&mut self, seconds: f64) -> Result<()> {
        self.reader
            .seek(
                SeekMode::Accurate,
                SeekTo::Time {
                    time: Time::from(seconds.max(0.0)),
                    track_id: Some(self.track_id),
                },
            )
            .map_err(|e| SonaraError::Decode(format!("seek failed: {}", e)))?;
        self.decoder.reset();
        self.leftover.clear();
        Ok(())
    }
}
