//! Source inputs accepted by `load_track`, and the `symphonia` glue that
//! turns them into PCM float frames.
//!
//! Generalized from spottedcat's two separate decode entrypoints
//! (`Track::from_path`, file-based; `decode_sound_from_bytes`,
//! memory-based) into one tagged variant resolved at the API boundary,
//! plus two pre-decoded buffer variants for callers that already have
//! PCM float samples in hand.

use std::path::PathBuf;
use std::sync::Arc;

use symphonia::core::audio::{AudioBufferRef, Signal};
use symphonia::core::codecs::{CODEC_TYPE_NULL, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Source handed to `load_track`, resolved at the API boundary.
#[derive(Clone)]
pub enum AudioSource {
    /// A file path, decoded via `symphonia`. Format support is whatever
    /// `symphonia`'s enabled codecs cover.
    File(PathBuf),
    /// An in-memory mono PCM float buffer and its sample rate.
    BufferMono(Arc<[f32]>, u32),
    /// An in-memory interleaved stereo PCM float buffer and its sample rate.
    BufferStereo(Arc<[f32]>, u32),
}

/// Fully decoded PCM audio, used for preloaded-mode tracks.
pub struct DecodedAudio {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decode an [`AudioSource`] entirely into memory (preloaded mode).
pub fn decode_preloaded(source: &AudioSource) -> Result<DecodedAudio, SymphoniaError> {
    match source {
        AudioSource::BufferMono(samples, rate) => Ok(DecodedAudio {
            samples: samples.clone(),
            sample_rate: *rate,
            channels: 1,
        }),
        AudioSource::BufferStereo(samples, rate) => Ok(DecodedAudio {
            samples: samples.clone(),
            sample_rate: *rate,
            channels: 2,
        }),
        AudioSource::File(path) => {
            let file = std::fs::File::open(path).map_err(SymphoniaError::IoError)?;
            let mss = MediaSourceStream::new(Box::new(file), Default::default());
            let mut hint = Hint::new();
            if let Some(ext) = path.extension().and_then(std::ffi::OsStr::to_str) {
                hint.with_extension(ext);
            }
            let mut decoder = StreamDecoder::open(mss, &hint)?;
            let mut all_samples = Vec::new();
            loop {
                match decoder.next_chunk(usize::MAX) {
                    Ok(chunk) if chunk.is_empty() => break,
                    Ok(chunk) => all_samples.extend_from_slice(&chunk),
                    Err(StreamEnd::Eof) => break,
                    Err(StreamEnd::Error(err)) => return Err(err),
                }
            }
            Ok(DecodedAudio {
                samples: Arc::from(all_samples),
                sample_rate: decoder.sample_rate(),
                channels: decoder.channels(),
            })
        }
    }
}

/// Result of asking a [`StreamDecoder`] for another chunk.
pub enum StreamEnd {
    /// The underlying source reached end-of-stream.
    Eof,
    /// A real decode/IO error occurred.
    Error(SymphoniaError),
}

/// Incremental decoder used by the streaming loader thread to pull bounded
/// chunks instead of decoding a whole file up front, generalizing the
/// packet loop in spottedcat's `Track::from_path`.
pub struct StreamDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
}

impl StreamDecoder {
    pub fn open(mss: MediaSourceStream, hint: &Hint) -> Result<Self, SymphoniaError> {
        let probed = symphonia::default::get_probe().format(
            hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;
        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(SymphoniaError::Unsupported("no supported audio track found"))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or(SymphoniaError::Unsupported("missing sample rate"))?;
        let channels = track
            .codec_params
            .channels
            .ok_or(SymphoniaError::Unsupported("missing channel spec"))?
            .count() as u16;
        let track_id = track.id;

        let decoder = symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
        })
    }

    pub fn open_path(path: &std::path::Path) -> Result<Self, SymphoniaError> {
        let file = std::fs::File::open(path).map_err(SymphoniaError::IoError)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(std::ffi::OsStr::to_str) {
            hint.with_extension(ext);
        }
        Self::open(mss, &hint)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Decode packets until at least one yields samples or the stream
    /// ends. `max_frames` is advisory (symphonia yields whole packets);
    /// pass `usize::MAX` to drain a single packet's worth regardless of
    /// size.
    pub fn next_chunk(&mut self, max_frames: usize) -> Result<Vec<f32>, StreamEnd> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Err(StreamEnd::Eof);
                }
                Err(err) => return Err(StreamEnd::Error(err)),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let mut samples = interleave(&decoded);
                    if max_frames != usize::MAX {
                        let cap = max_frames * self.channels as usize;
                        samples.truncate(cap);
                    }
                    return Ok(samples);
                }
                Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
                Err(err) => return Err(StreamEnd::Error(err)),
            }
        }
    }

    /// Rewind to the start of the stream for loop playback.
    pub fn rewind(&mut self) -> Result<(), SymphoniaError> {
        self.format.seek(
            symphonia::core::formats::SeekMode::Accurate,
            symphonia::core::formats::SeekTo::Time {
                time: symphonia::core::units::Time::new(0, 0.0),
                track_id: Some(self.track_id),
            },
        )?;
        Ok(())
    }
}

fn interleave(buf: &AudioBufferRef) -> Vec<f32> {
    match buf {
        AudioBufferRef::F32(b) => {
            let channels = b.spec().channels.count();
            let mut out = Vec::with_capacity(b.frames() * channels);
            for i in 0..b.frames() {
                for ch in 0..channels {
                    out.push(b.chan(ch)[i]);
                }
            }
            out
        }
        AudioBufferRef::U8(b) => {
            let channels = b.spec().channels.count();
            let mut out = Vec::with_capacity(b.frames() * channels);
            for i in 0..b.frames() {
                for ch in 0..channels {
                    out.push((b.chan(ch)[i] as f32 - 128.0) / 128.0);
                }
            }
            out
        }
        AudioBufferRef::S16(b) => {
            let channels = b.spec().channels.count();
            let mut out = Vec::with_capacity(b.frames() * channels);
            for i in 0..b.frames() {
                for ch in 0..channels {
                    out.push(b.chan(ch)[i] as f32 / 32768.0);
                }
            }
            out
        }
        AudioBufferRef::S32(b) => {
            let channels = b.spec().channels.count();
            let mut out = Vec::with_capacity(b.frames() * channels);
            for i in 0..b.frames() {
                for ch in 0..channels {
                    out.push(b.chan(ch)[i] as f32 / 2_147_483_648.0);
                }
            }
            out
        }
        _ => Vec::new(),
    }
}

/// Compute a scalar such that `peak(|sample|) * scalar ~= 0.95`, used by
/// `load_track`'s `auto_normalize` option.
pub fn auto_normalize_scalar(samples: &[f32]) -> f32 {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 1e-9 { 0.95 / peak } else { 1.0 }
}
