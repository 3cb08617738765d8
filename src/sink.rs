//! Sink render path: pulling, resampling and mixing input streams into one
//! output buffer.
//!
//! The substrate mixes in a single canonical format, interleaved `f32`
//! samples. Each [`SinkInput`] wraps a [`RenderSource`] plus a per-input
//! volume; inputs whose rate differs from the sink's are run through a
//! linear [`Resampler`] transparently. [`Sink::render`] produces a chunk of
//! exactly the requested length, padding short or missing contributions
//! with silence.

use crate::error::Result;
use crate::memory::{BlockStats, MemBlock, MemChunk};
use std::sync::Arc;
use std::time::Duration;

/// Bytes per sample of the canonical format (`f32`).
pub const SAMPLE_SIZE: usize = 4;

/// Sample rate and channel count of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampleSpec {
    /// Frames per second.
    pub rate: u32,
    /// Interleaved channels per frame.
    pub channels: u8,
}

impl SampleSpec {
    /// Bytes per frame.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * SAMPLE_SIZE
    }

    /// Wall-clock duration covered by `bytes` of audio in this spec.
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let bytes_per_sec = self.rate as f64 * self.frame_size() as f64;
        Duration::from_secs_f64(bytes as f64 / bytes_per_sec)
    }
}

/// Something a sink can pull audio from.
pub trait RenderSource: Send {
    /// Produce up to `max_bytes` of interleaved `f32` audio, or `None` when
    /// nothing is available right now (the sink substitutes silence).
    fn pull(&mut self, max_bytes: usize) -> Option<MemChunk>;
}

/// Linear interpolation resampler with phase carry across calls.
///
/// Keeps the last frame of each processed block so interpolation is
/// continuous over block boundaries, and holds on to produced samples the
/// caller did not consume so no resampled audio is ever discarded.
struct Resampler {
    /// Input frames consumed per output frame.
    ratio: f64,
    /// Fractional read position, relative to the carried frame.
    pos: f64,
    channels: usize,
    prev: Option<Vec<f32>>,
    /// Output produced beyond what the last caller consumed.
    pending: Vec<f32>,
}

impl Resampler {
    fn new(in_rate: u32, out_rate: u32, channels: u8) -> Self {
        Self {
            ratio: in_rate as f64 / out_rate as f64,
            pos: 0.0,
            channels: channels as usize,
            prev: None,
            pending: Vec::new(),
        }
    }

    /// Hand out up to `want` carried samples from the previous call.
    fn take_pending(&mut self, want: usize) -> Vec<f32> {
        if self.pending.len() <= want {
            std::mem::take(&mut self.pending)
        } else {
            let rest = self.pending.split_off(want);
            std::mem::replace(&mut self.pending, rest)
        }
    }

    /// Keep everything beyond `want` for the next call.
    fn stash_excess(&mut self, out: &mut Vec<f32>, want: usize) {
        if out.len() > want {
            self.pending = out.split_off(want);
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let ch = self.channels;
        if input.len() < ch {
            return Vec::new();
        }
        let data: Vec<f32> = match self.prev.take() {
            Some(mut prev) => {
                prev.extend_from_slice(input);
                prev
            }
            None => input.to_vec(),
        };
        let frames = data.len() / ch;

        let mut out = Vec::new();
        let mut pos = self.pos;
        while pos <= (frames - 1) as f64 {
            let i = pos as usize;
            let frac = (pos - i as f64) as f32;
            for c in 0..ch {
                let a = data[i * ch + c];
                let b = if i + 1 < frames {
                    data[(i + 1) * ch + c]
                } else {
                    a
                };
                out.push(a + (b - a) * frac);
            }
            pos += self.ratio;
        }

        self.prev = Some(data[(frames - 1) * ch..frames * ch].to_vec());
        self.pos = pos - (frames - 1) as f64;
        out
    }
}

/// One stream connected to a sink.
pub struct SinkInput {
    source: Box<dyn RenderSource>,
    spec: SampleSpec,
    volume: f32,
    resampler: Option<Resampler>,
}

impl SinkInput {
    /// Wrap a source with its stream spec and initial volume (1.0 =
    /// unattenuated).
    pub fn new(source: Box<dyn RenderSource>, spec: SampleSpec, volume: f32) -> Self {
        Self {
            source,
            spec,
            volume,
            resampler: None,
        }
    }
}

/// Mixes connected inputs into output buffers of the sink's format.
pub struct Sink {
    spec: SampleSpec,
    stats: Arc<BlockStats>,
    inputs: Vec<SinkInput>,
}

impl Sink {
    /// Create a sink rendering in `spec`, allocating from `stats`.
    pub fn new(spec: SampleSpec, stats: Arc<BlockStats>) -> Self {
        Self {
            spec,
            stats,
            inputs: Vec::new(),
        }
    }

    /// The sink's output format.
    pub fn spec(&self) -> &SampleSpec {
        &self.spec
    }

    /// Connect an input; returns its index for later volume changes or
    /// removal.
    ///
    /// A resampler is instantiated when the input's rate differs from the
    /// sink's. The channel counts must match.
    pub fn add_input(&mut self, mut input: SinkInput) -> usize {
        assert_eq!(
            input.spec.channels, self.spec.channels,
            "channel remixing is not supported"
        );
        if input.spec.rate != self.spec.rate {
            input.resampler = Some(Resampler::new(
                input.spec.rate,
                self.spec.rate,
                self.spec.channels,
            ));
        }
        self.inputs.push(input);
        self.inputs.len() - 1
    }

    /// Disconnect the input at `index`.
    pub fn remove_input(&mut self, index: usize) {
        self.inputs.remove(index);
        tracing::debug!(index, remaining = self.inputs.len(), "sink input removed");
    }

    /// Number of connected inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Change an input's volume (1.0 = unattenuated).
    pub fn set_volume(&mut self, index: usize, volume: f32) {
        self.inputs[index].volume = volume;
    }

    /// Render exactly `requested` bytes of output.
    ///
    /// With no inputs the result is pure silence. Otherwise each input is
    /// pulled, resampled if needed, volume-scaled and summed sample-wise
    /// with saturation to [-1.0, 1.0]; inputs that deliver less than
    /// requested contribute silence for the remainder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`](crate::Error::AllocationFailed)
    /// when the output block cannot be allocated.
    pub fn render(&mut self, requested: usize) -> Result<MemChunk> {
        debug_assert_eq!(requested % self.spec.frame_size(), 0);

        // Fresh heap blocks come back zeroed, which is canonical silence.
        let mut block = MemBlock::new(Some(&self.stats), requested)?;
        if self.inputs.is_empty() {
            return Ok(MemChunk::from_block(block));
        }

        let out_samples = requested / SAMPLE_SIZE;
        let out_frames = requested / self.spec.frame_size();
        let mut mix = vec![0.0f32; out_samples];

        for input in &mut self.inputs {
            let samples: Vec<f32> = match input.resampler.as_mut() {
                None => {
                    let Some(chunk) = input.source.pull(out_frames * input.spec.frame_size())
                    else {
                        continue;
                    };
                    samples_from(chunk.as_slice())
                }
                Some(resampler) => {
                    // Serve carried output first, then pull only what the
                    // remaining deficit needs; the (at most one frame of)
                    // overshoot is stashed for the next render.
                    let mut out = resampler.take_pending(out_samples);
                    while out.len() < out_samples {
                        let deficit_frames =
                            (out_samples - out.len()) / self.spec.channels as usize;
                        let exact = deficit_frames as u64 * input.spec.rate as u64;
                        let in_frames = exact.div_ceil(self.spec.rate as u64) as usize + 1;
                        let Some(chunk) =
                            input.source.pull(in_frames * input.spec.frame_size())
                        else {
                            break;
                        };
                        let produced = resampler.process(&samples_from(chunk.as_slice()));
                        if produced.is_empty() {
                            break;
                        }
                        out.extend_from_slice(&produced);
                    }
                    resampler.stash_excess(&mut out, out_samples);
                    out
                }
            };

            for (acc, &s) in mix.iter_mut().zip(samples.iter()) {
                *acc += s * input.volume;
            }
        }

        let data = block
            .as_mut_slice()
            .expect("freshly created block is exclusive and writable");
        for (bytes, &s) in data.chunks_exact_mut(SAMPLE_SIZE).zip(mix.iter()) {
            bytes.copy_from_slice(&s.clamp(-1.0, 1.0).to_ne_bytes());
        }

        Ok(MemChunk::from_block(block))
    }

    /// The wall-clock interval covered by a render of `requested` bytes,
    /// suitable as an [`RtPoll`](crate::rtpoll::RtPoll) timer period.
    pub fn period(&self, requested: usize) -> Duration {
        self.spec.bytes_to_duration(requested)
    }
}

fn samples_from(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(SAMPLE_SIZE)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant {
        value: f32,
        available: usize,
    }

    impl RenderSource for Constant {
        fn pull(&mut self, max_bytes: usize) -> Option<MemChunk> {
            let n = (self.available.min(max_bytes) / SAMPLE_SIZE) * SAMPLE_SIZE;
            if n == 0 {
                return None;
            }
            let mut data = Vec::with_capacity(n);
            for _ in 0..n / SAMPLE_SIZE {
                data.extend_from_slice(&self.value.to_ne_bytes());
            }
            Some(MemChunk::from_block(MemBlock::from_vec(None, data).unwrap()))
        }
    }

    fn samples_of(chunk: &MemChunk) -> Vec<f32> {
        chunk
            .as_slice()
            .chunks_exact(SAMPLE_SIZE)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    const SPEC: SampleSpec = SampleSpec {
        rate: 48000,
        channels: 2,
    };

    #[test]
    fn test_render_without_inputs_is_silence() {
        let mut sink = Sink::new(SPEC, Arc::new(BlockStats::new()));
        let chunk = sink.render(960).unwrap();
        assert_eq!(chunk.len(), 960);
        assert!(chunk.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mix_two_inputs_clamps() {
        let mut sink = Sink::new(SPEC, Arc::new(BlockStats::new()));
        for _ in 0..2 {
            sink.add_input(SinkInput::new(
                Box::new(Constant {
                    value: 0.75,
                    available: usize::MAX,
                }),
                SPEC,
                1.0,
            ));
        }

        let chunk = sink.render(64).unwrap();
        for s in samples_of(&chunk) {
            assert_eq!(s, 1.0, "0.75 + 0.75 saturates at 1.0");
        }
    }

    #[test]
    fn test_volume_scales_samples() {
        let mut sink = Sink::new(SPEC, Arc::new(BlockStats::new()));
        let idx = sink.add_input(SinkInput::new(
            Box::new(Constant {
                value: 1.0,
                available: usize::MAX,
            }),
            SPEC,
            1.0,
        ));
        sink.set_volume(idx, 0.25);

        let chunk = sink.render(64).unwrap();
        for s in samples_of(&chunk) {
            assert!((s - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_short_input_padded_with_silence() {
        let mut sink = Sink::new(SPEC, Arc::new(BlockStats::new()));
        sink.add_input(SinkInput::new(
            Box::new(Constant {
                value: 0.5,
                available: 32,
            }),
            SPEC,
            1.0,
        ));

        let chunk = sink.render(64).unwrap();
        let samples = samples_of(&chunk);
        assert_eq!(chunk.len(), 64, "output length is exactly as requested");
        assert!(samples[..8].iter().all(|&s| s == 0.5));
        assert!(samples[8..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_resampled_input_mixes_at_sink_rate() {
        let mut sink = Sink::new(
            SampleSpec {
                rate: 48000,
                channels: 1,
            },
            Arc::new(BlockStats::new()),
        );
        sink.add_input(SinkInput::new(
            Box::new(Constant {
                value: 0.5,
                available: usize::MAX,
            }),
            SampleSpec {
                rate: 24000,
                channels: 1,
            },
            1.0,
        ));

        // Linear interpolation of a constant signal is the constant.
        let chunk = sink.render(480).unwrap();
        for s in samples_of(&chunk) {
            assert!((s - 0.5).abs() < 1e-6);
        }
    }

    struct Ramp {
        next: u64,
        step: f32,
    }

    impl RenderSource for Ramp {
        fn pull(&mut self, max_bytes: usize) -> Option<MemChunk> {
            let n = max_bytes / SAMPLE_SIZE;
            let mut data = Vec::with_capacity(n * SAMPLE_SIZE);
            for _ in 0..n {
                data.extend_from_slice(&(self.next as f32 * self.step).to_ne_bytes());
                self.next += 1;
            }
            Some(MemChunk::from_block(MemBlock::from_vec(None, data).unwrap()))
        }
    }

    #[test]
    fn test_resampled_stream_continuous_across_renders() {
        let mut sink = Sink::new(
            SampleSpec {
                rate: 48000,
                channels: 1,
            },
            Arc::new(BlockStats::new()),
        );
        sink.add_input(SinkInput::new(
            Box::new(Ramp {
                next: 0,
                step: 1e-4,
            }),
            SampleSpec {
                rate: 24000,
                channels: 1,
            },
            1.0,
        ));

        // A linear ramp upsampled 2x must step uniformly by half the input
        // step, in particular across the render boundary: no resampled
        // audio may be dropped between calls.
        let first = sink.render(480).unwrap();
        let second = sink.render(480).unwrap();
        let all: Vec<f32> = samples_of(&first)
            .into_iter()
            .chain(samples_of(&second))
            .collect();
        for pair in all.windows(2) {
            let step = pair[1] - pair[0];
            assert!(
                (step - 5e-5).abs() < 1e-6,
                "uniform step across renders, got {} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_period() {
        let sink = Sink::new(SPEC, Arc::new(BlockStats::new()));
        // 960 bytes at 48 kHz stereo f32 is exactly 2.5 ms.
        assert_eq!(sink.period(960), Duration::from_micros(2500));
    }

    #[test]
    fn test_render_allocates_from_sink_stats() {
        let stats = Arc::new(BlockStats::new());
        let mut sink = Sink::new(SPEC, Arc::clone(&stats));
        let chunk = sink.render(128).unwrap();
        assert_eq!(stats.allocated(), 1);
        drop(chunk);
        assert_eq!(stats.allocated(), 0);
    }
}
