//! Per-bin spectral gate
//!
//! Downward expansion applied independently to every FFT bin inside a
//! configurable frequency range. Bin gains are smoothed by attack/release
//! envelopes whose state is advanced on a decimated 64-sample schedule
//! rather than per sample.
//!
//! Latency is the STFT framing delay plus the lookahead time. Lookahead is
//! currently a pure output delay reserved for future pre-analysis; it does
//! not feed the envelopes.

use rustfft::num_complex::Complex;

use chimera_core::{db_to_linear, ChimeraError, ChimeraResult, NormalizedValue, Sample};

use crate::integrity::sanitize;
use crate::smoothing::SmoothedParam;
use crate::stft::SpectralFrameProcessor;
use crate::{AudioEngine, Processor};

/// Default FFT size
const DEFAULT_FRAME_SIZE: usize = 2048;
/// Default hop size (overlap factor of 4)
const DEFAULT_HOP_SIZE: usize = 512;
/// Envelope state advances once per this many samples
const ENV_DECIMATION: usize = 64;
/// Upper bound of the lookahead range in milliseconds
const MAX_LOOKAHEAD_MS: f64 = 10.0;

/// Parameter indices for [`SpectralGateEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateParam {
    /// Gate threshold, -60..0 dB
    Threshold = 0,
    /// Expansion ratio, 1:1..20:1
    Ratio = 1,
    /// Envelope attack, 0.1..50 ms
    Attack = 2,
    /// Envelope release, 1..500 ms
    Release = 3,
    /// Lower edge of the gated range, 20 Hz..20 kHz log-mapped
    FreqLow = 4,
    /// Upper edge of the gated range, 20 Hz..20 kHz log-mapped
    FreqHigh = 5,
    /// Additional output delay, 0..10 ms
    Lookahead = 6,
    /// Dry/wet mix
    Mix = 7,
}

impl GateParam {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::Threshold),
            1 => Some(Self::Ratio),
            2 => Some(Self::Attack),
            3 => Some(Self::Release),
            4 => Some(Self::FreqLow),
            5 => Some(Self::FreqHigh),
            6 => Some(Self::Lookahead),
            7 => Some(Self::Mix),
            _ => None,
        }
    }
}

/// Per-block mapped parameter values consumed by the bin transform
#[derive(Debug, Clone, Copy)]
struct GateSnapshot {
    /// Linear amplitude threshold
    threshold: f64,
    ratio: f64,
    bin_low: usize,
    bin_high: usize,
    /// Per-hop envelope coefficient toward a rising target
    attack_eff: f64,
    /// Per-hop envelope coefficient toward a falling target
    release_eff: f64,
    /// Raw bin magnitude -> sinusoid amplitude
    mag_scale: f64,
}

/// Spectral gate engine (stereo)
pub struct SpectralGateEngine {
    stft: SpectralFrameProcessor,
    /// Per-channel per-bin smoothed gain state
    envelope: Vec<Vec<Sample>>,
    /// Dry path delayed by the STFT latency so the mix stays aligned
    dry_delay: Vec<Vec<Sample>>,
    dry_pos: Vec<usize>,
    /// Output delay implementing the lookahead parameter
    look_ring: Vec<Vec<Sample>>,
    look_pos: Vec<usize>,
    max_lookahead: usize,
    /// Block-sized scratch (sized by `prepare`); longer blocks are chunked
    in_scratch: Vec<Sample>,
    dry_scratch: Vec<Sample>,
    /// `2 / window_sum`, converts raw bin magnitudes to amplitude units
    mag_scale: f64,

    threshold: SmoothedParam,
    ratio: SmoothedParam,
    attack: SmoothedParam,
    release: SmoothedParam,
    freq_low: SmoothedParam,
    freq_high: SmoothedParam,
    lookahead: SmoothedParam,
    mix: SmoothedParam,
}

impl SpectralGateEngine {
    pub fn new(sample_rate: f64) -> ChimeraResult<Self> {
        Self::with_config(sample_rate, DEFAULT_FRAME_SIZE, DEFAULT_HOP_SIZE)
    }

    pub fn with_config(
        sample_rate: f64,
        frame_size: usize,
        hop_size: usize,
    ) -> ChimeraResult<Self> {
        let stft = SpectralFrameProcessor::prepare(sample_rate, frame_size, hop_size, 2)?;
        let num_bins = stft.num_bins();
        let latency = stft.latency();
        let max_lookahead = (MAX_LOOKAHEAD_MS * 0.001 * sample_rate).ceil() as usize;
        let mag_scale = 2.0 / stft.window_sum();

        Ok(Self {
            stft,
            envelope: vec![vec![1.0; num_bins]; 2],
            dry_delay: vec![vec![0.0; latency]; 2],
            dry_pos: vec![0; 2],
            look_ring: vec![vec![0.0; max_lookahead + 1]; 2],
            look_pos: vec![0; 2],
            max_lookahead,
            in_scratch: vec![0.0; DEFAULT_HOP_SIZE],
            dry_scratch: vec![0.0; DEFAULT_HOP_SIZE],
            mag_scale,
            threshold: SmoothedParam::normalized(0.0, 20.0, sample_rate),
            ratio: SmoothedParam::normalized(0.0, 20.0, sample_rate),
            attack: SmoothedParam::normalized(0.5, 20.0, sample_rate),
            release: SmoothedParam::normalized(0.5, 20.0, sample_rate),
            freq_low: SmoothedParam::normalized(0.0, 50.0, sample_rate),
            freq_high: SmoothedParam::normalized(1.0, 50.0, sample_rate),
            lookahead: SmoothedParam::normalized(0.0, 50.0, sample_rate),
            mix: SmoothedParam::normalized(1.0, 20.0, sample_rate),
        })
    }

    /// Set a normalized parameter value
    pub fn set_param(&self, param: GateParam, normalized: f64) {
        let value = NormalizedValue::new(normalized).get();
        match param {
            GateParam::Threshold => self.threshold.set_target(value),
            GateParam::Ratio => self.ratio.set_target(value),
            GateParam::Attack => self.attack.set_target(value),
            GateParam::Release => self.release.set_target(value),
            GateParam::FreqLow => self.freq_low.set_target(value),
            GateParam::FreqHigh => self.freq_high.set_target(value),
            GateParam::Lookahead => self.lookahead.set_target(value),
            GateParam::Mix => self.mix.set_target(value),
        }
    }

    fn lookahead_samples(&self, normalized: f64) -> usize {
        let ms = NormalizedValue::new(normalized).map(0.0, MAX_LOOKAHEAD_MS);
        let samples = (ms * 0.001 * self.stft.sample_rate()).round() as usize;
        samples.min(self.max_lookahead)
    }

    /// Map the smoothed parameters to a snapshot for this block.
    ///
    /// `freq_low` is forced at least 10 Hz below `freq_high` before either is
    /// converted to a bin index. Envelope coefficients follow the one-pole
    /// form `exp(-1000 / (ms * rate))` per sample; the per-hop values fold
    /// the decimated update schedule into a single multiply.
    fn snapshot(&mut self, block_len: usize) -> GateSnapshot {
        let sample_rate = self.stft.sample_rate();
        let frame_size = self.stft.frame_size();
        let num_bins = self.stft.num_bins();
        let hop = self.stft.hop_size();

        let threshold_db = NormalizedValue::new(self.threshold.skip(block_len)).map(-60.0, 0.0);
        let threshold = db_to_linear(threshold_db).clamp(1e-10, 10.0);
        let ratio = NormalizedValue::new(self.ratio.skip(block_len)).map(1.0, 20.0);

        let high_hz = NormalizedValue::new(self.freq_high.skip(block_len)).map_log(20.0, 20000.0);
        let low_hz = NormalizedValue::new(self.freq_low.skip(block_len))
            .map_log(20.0, 20000.0)
            .min(high_hz - 10.0);
        let hz_per_bin = sample_rate / frame_size as f64;
        let bin_low = ((low_hz / hz_per_bin) as usize).min(num_bins - 1);
        let bin_high = ((high_hz / hz_per_bin) as usize).min(num_bins - 1);

        let attack_ms = NormalizedValue::new(self.attack.skip(block_len)).map(0.1, 50.0);
        let release_ms = NormalizedValue::new(self.release.skip(block_len)).map(1.0, 500.0);
        let attack_coeff = (-1000.0 / (attack_ms * sample_rate)).exp().clamp(0.0, 0.9999);
        let release_coeff = (-1000.0 / (release_ms * sample_rate)).exp().clamp(0.0, 0.9999);
        let updates = (hop / ENV_DECIMATION).max(1);
        let span = (updates * ENV_DECIMATION) as i32;

        GateSnapshot {
            threshold,
            ratio,
            bin_low,
            bin_high,
            attack_eff: attack_coeff.powi(span),
            release_eff: release_coeff.powi(span),
            mag_scale: self.mag_scale,
        }
    }

    /// Gate one half-spectrum in place.
    ///
    /// Bins outside `[bin_low, bin_high]` pass unmodified while their
    /// envelope relaxes toward unity, so widening the range later does not
    /// snap stale gains in.
    fn apply_gate(bins: &mut [Complex<Sample>], envelope: &mut [Sample], snap: GateSnapshot) {
        for (i, (bin, env)) in bins.iter_mut().zip(envelope.iter_mut()).enumerate() {
            if !env.is_finite() {
                *env = 0.0;
            }
            if i < snap.bin_low || i > snap.bin_high {
                *env = 1.0 + (*env - 1.0) * snap.release_eff;
                continue;
            }
            *bin = Complex::new(sanitize(bin.re), sanitize(bin.im));
            let mag = bin.norm() * snap.mag_scale;
            let mag = if mag.is_finite() { mag } else { 0.0 };

            let target = if mag < snap.threshold {
                0.0
            } else if snap.ratio > 1.0 {
                let excess = mag - snap.threshold;
                let gated = snap.threshold + excess / snap.ratio;
                (gated / mag.max(1e-10)).clamp(0.0, 1.0)
            } else {
                1.0
            };

            let coeff = if target > *env {
                snap.attack_eff
            } else {
                snap.release_eff
            };
            *env = target + (*env - target) * coeff;

            let gained = *bin * *env;
            *bin = if gained.re.is_finite() && gained.im.is_finite() {
                gained
            } else {
                Complex::new(0.0, 0.0)
            };
        }
    }
}

impl Processor for SpectralGateEngine {
    fn reset(&mut self) {
        self.stft.reset();
        for env in &mut self.envelope {
            env.fill(1.0);
        }
        for ring in &mut self.dry_delay {
            ring.fill(0.0);
        }
        self.dry_pos.fill(0);
        for ring in &mut self.look_ring {
            ring.fill(0.0);
        }
        self.look_pos.fill(0);
        self.threshold.reset();
        self.ratio.reset();
        self.attack.reset();
        self.release.reset();
        self.freq_low.reset();
        self.freq_high.reset();
        self.lookahead.reset();
        self.mix.reset();
    }

    fn latency(&self) -> usize {
        self.stft.latency() + self.lookahead_samples(self.lookahead.target())
    }
}

impl AudioEngine for SpectralGateEngine {
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> ChimeraResult<()> {
        if max_block_size == 0 {
            return Err(ChimeraError::InvalidBlockSize(max_block_size));
        }
        let mut rebuilt =
            Self::with_config(sample_rate, self.stft.frame_size(), self.stft.hop_size())?;
        rebuilt.threshold.set_immediate(self.threshold.target());
        rebuilt.ratio.set_immediate(self.ratio.target());
        rebuilt.attack.set_immediate(self.attack.target());
        rebuilt.release.set_immediate(self.release.target());
        rebuilt.freq_low.set_immediate(self.freq_low.target());
        rebuilt.freq_high.set_immediate(self.freq_high.target());
        rebuilt.lookahead.set_immediate(self.lookahead.target());
        rebuilt.mix.set_immediate(self.mix.target());
        rebuilt.in_scratch = vec![0.0; max_block_size];
        rebuilt.dry_scratch = vec![0.0; max_block_size];
        *self = rebuilt;
        Ok(())
    }

    fn process(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        let block_len = left.len().min(right.len());
        if block_len == 0 {
            return;
        }

        let snap = self.snapshot(block_len);
        let wet_mix = self.mix.skip(block_len);
        let lookahead = self.lookahead.skip(block_len);
        let look = self.lookahead_samples(lookahead);

        let stft = &mut self.stft;
        let chunk_len = self.in_scratch.len();

        for (channel, samples) in [&mut *left, &mut *right].into_iter().enumerate() {
            let env_ch = &mut self.envelope[channel];
            let dry_ring = &mut self.dry_delay[channel];
            let dry_pos = &mut self.dry_pos[channel];
            let look_ring = &mut self.look_ring[channel];
            let look_pos = &mut self.look_pos[channel];
            let look_len = look_ring.len();

            for chunk in samples[..block_len].chunks_mut(chunk_len) {
                let n = chunk.len();
                let in_scratch = &mut self.in_scratch[..n];
                let dry_scratch = &mut self.dry_scratch[..n];
                in_scratch.copy_from_slice(chunk);

                // Latency-aligned dry path
                for (dry, input) in dry_scratch.iter_mut().zip(in_scratch.iter()) {
                    let clean = if input.is_finite() { *input } else { 0.0 };
                    if dry_ring.is_empty() {
                        *dry = clean;
                    } else {
                        *dry = dry_ring[*dry_pos];
                        dry_ring[*dry_pos] = clean;
                        *dry_pos = (*dry_pos + 1) % dry_ring.len();
                    }
                }

                let mut transform = |bins: &mut [Complex<Sample>], _count: usize, _rate: f64| {
                    Self::apply_gate(bins, env_ch, snap);
                };
                stft.process_block(channel, in_scratch, chunk, &mut transform);

                // Mix, then push through the lookahead delay
                for (out, &dry) in chunk.iter_mut().zip(dry_scratch.iter()) {
                    let mixed = sanitize(dry * (1.0 - wet_mix) + *out * wet_mix);
                    look_ring[*look_pos] = mixed;
                    *out = look_ring[(*look_pos + look_len - look) % look_len];
                    *look_pos = (*look_pos + 1) % look_len;
                }
            }
        }
    }

    fn set_parameter(&mut self, index: u32, value: f64) {
        if let Some(param) = GateParam::from_index(index) {
            self.set_param(param, value);
        }
    }
}
