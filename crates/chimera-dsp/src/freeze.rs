//! Spectral freeze
//!
//! Captures a magnitude+phase snapshot of the live spectrum and holds it,
//! decaying slowly toward the live input. Per-hop bin operations sculpt the
//! held spectrum: smear, shift, resonance, brightness tilt, density
//! thinning and shimmer phase jitter.
//!
//! All parameters arrive normalized [0,1]; `freeze` doubles as the wet mix
//! and as the freeze trigger (crossing 0.5 on the smoothed value).

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rustfft::num_complex::Complex;

use chimera_core::{ChimeraError, ChimeraResult, NormalizedValue, Sample};

use crate::integrity::sanitize;
use crate::smoothing::SmoothedParam;
use crate::stft::SpectralFrameProcessor;
use crate::{AudioEngine, Processor};

/// Default FFT size
const DEFAULT_FRAME_SIZE: usize = 2048;
/// Default hop size (overlap factor of 4)
const DEFAULT_HOP_SIZE: usize = 512;
/// Fixed seed for the shimmer jitter: output is reproducible run to run
const SHIMMER_SEED: u64 = 0x5EED_F9EE_2E00_0001;

/// Parameter indices for [`SpectralFreezeEngine`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeParam {
    /// Wet mix and freeze trigger (>0.5 engages)
    Freeze = 0,
    /// Box-average smear radius, 1..6 bins
    Smear = 1,
    /// Spectral shift, +/-10% of the half spectrum
    Shift = 2,
    /// Local peak enhancement, gain 1..4
    Resonance = 3,
    /// Hold decay rate (1.0 = slowest decay)
    Decay = 4,
    /// Spectral tilt (1.0 = flat)
    Brightness = 5,
    /// Fraction of loudest bins kept
    Density = 6,
    /// Random phase jitter above quarter Nyquist
    Shimmer = 7,
}

impl FreezeParam {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::Freeze),
            1 => Some(Self::Smear),
            2 => Some(Self::Shift),
            3 => Some(Self::Resonance),
            4 => Some(Self::Decay),
            5 => Some(Self::Brightness),
            6 => Some(Self::Density),
            7 => Some(Self::Shimmer),
            _ => None,
        }
    }
}

/// Freeze trigger state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FreezeState {
    Live,
    /// Snapshot pending; lasts one hop per channel
    Capturing,
    Frozen,
}

/// Captured per-bin magnitude+phase snapshot
#[derive(Debug, Clone)]
struct FrozenSpectrum {
    magnitude: Vec<Sample>,
    phase: Vec<Sample>,
}

impl FrozenSpectrum {
    fn new(num_bins: usize) -> Self {
        Self {
            magnitude: vec![0.0; num_bins],
            phase: vec![0.0; num_bins],
        }
    }

    fn clear(&mut self) {
        self.magnitude.fill(0.0);
        self.phase.fill(0.0);
    }
}

/// Per-hop parameter snapshot consumed by the bin transform
#[derive(Debug, Clone, Copy)]
struct OpSnapshot {
    frozen_active: bool,
    smear: f64,
    shift: f64,
    resonance: f64,
    decay_coeff: f64,
    brightness: f64,
    density: f64,
    shimmer: f64,
}

/// Spectral freeze engine (stereo)
pub struct SpectralFreezeEngine {
    stft: SpectralFrameProcessor,
    state: FreezeState,
    /// One snapshot per channel
    frozen: Vec<FrozenSpectrum>,
    /// Channels still waiting for their capture hop
    pending_capture: Vec<bool>,
    /// Dry path delayed by the STFT latency so the mix stays aligned
    dry_delay: Vec<Vec<Sample>>,
    dry_pos: Vec<usize>,
    /// Block-sized scratch (sized by `prepare`); longer blocks are chunked
    in_scratch: Vec<Sample>,
    dry_scratch: Vec<Sample>,
    rng: ChaCha8Rng,

    // Working buffers for the bin operations (sized num_bins)
    work_mag: Vec<Sample>,
    work_phase: Vec<Sample>,
    op_mag: Vec<Sample>,
    op_phase: Vec<Sample>,
    sort_idx: Vec<usize>,

    freeze: SmoothedParam,
    smear: SmoothedParam,
    shift: SmoothedParam,
    resonance: SmoothedParam,
    decay: SmoothedParam,
    brightness: SmoothedParam,
    density: SmoothedParam,
    shimmer: SmoothedParam,

    prev_freeze: f64,
}

impl SpectralFreezeEngine {
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

        Ok(Self {
            stft,
            state: FreezeState::Live,
            frozen: vec![FrozenSpectrum::new(num_bins); 2],
            pending_capture: vec![false; 2],
            dry_delay: vec![vec![0.0; latency]; 2],
            dry_pos: vec![0; 2],
            in_scratch: vec![0.0; DEFAULT_HOP_SIZE],
            dry_scratch: vec![0.0; DEFAULT_HOP_SIZE],
            rng: ChaCha8Rng::seed_from_u64(SHIMMER_SEED),
            work_mag: vec![0.0; num_bins],
            work_phase: vec![0.0; num_bins],
            op_mag: vec![0.0; num_bins],
            op_phase: vec![0.0; num_bins],
            sort_idx: vec![0; num_bins],
            freeze: SmoothedParam::normalized(0.0, 50.0, sample_rate),
            smear: SmoothedParam::normalized(0.0, 100.0, sample_rate),
            shift: SmoothedParam::normalized(0.5, 20.0, sample_rate),
            resonance: SmoothedParam::normalized(0.0, 100.0, sample_rate),
            decay: SmoothedParam::normalized(1.0, 0.0, sample_rate),
            brightness: SmoothedParam::normalized(1.0, 50.0, sample_rate),
            density: SmoothedParam::normalized(1.0, 100.0, sample_rate),
            shimmer: SmoothedParam::normalized(0.0, 50.0, sample_rate),
            prev_freeze: 0.0,
        })
    }

    /// Set a normalized parameter value
    pub fn set_param(&self, param: FreezeParam, normalized: f64) {
        let value = NormalizedValue::new(normalized).get();
        match param {
            FreezeParam::Freeze => self.freeze.set_target(value),
            FreezeParam::Smear => self.smear.set_target(value),
            FreezeParam::Shift => self.shift.set_target(value),
            FreezeParam::Resonance => self.resonance.set_target(value),
            FreezeParam::Decay => self.decay.set_target(value),
            FreezeParam::Brightness => self.brightness.set_target(value),
            FreezeParam::Density => self.density.set_target(value),
            FreezeParam::Shimmer => self.shimmer.set_target(value),
        }
    }

    /// Apply the per-hop bin operations for one channel.
    ///
    /// Works on indices `0..half_bins`; the Nyquist bin is never touched.
    /// Shift leaves vacated bins at zero (no wraparound); the resonance scan
    /// stops one bin early so the 3-point lookahead stays in bounds.
    #[allow(clippy::too_many_arguments)]
    fn apply_bin_ops(
        bins: &mut [Complex<Sample>],
        frozen: &mut FrozenSpectrum,
        pending_capture: &mut bool,
        rng: &mut ChaCha8Rng,
        work_mag: &mut [Sample],
        work_phase: &mut [Sample],
        op_mag: &mut [Sample],
        op_phase: &mut [Sample],
        sort_idx: &mut [usize],
        snap: OpSnapshot,
    ) {
        let num_bins = bins.len();
        let half_bins = num_bins - 1;

        for i in 0..num_bins {
            work_mag[i] = bins[i].norm();
            work_phase[i] = bins[i].arg();
        }

        if *pending_capture {
            frozen.magnitude.copy_from_slice(work_mag);
            frozen.phase.copy_from_slice(work_phase);
            *pending_capture = false;
        }

        if snap.frozen_active {
            // Held state drifts toward the live spectrum; the 0.995/0.005
            // split means it never fully reaches silence
            for i in 0..num_bins {
                frozen.magnitude[i] =
                    frozen.magnitude[i] * 0.995 + snap.decay_coeff * work_mag[i] * 0.005;
            }
            if snap.shimmer > 0.0 {
                // Incremental jitter accumulates in the held phases
                let quarter = half_bins / 4;
                for i in (quarter + 1)..half_bins {
                    let jitter = rng.random_range(-0.02..0.02) * snap.shimmer;
                    frozen.phase[i] = wrap_phase(frozen.phase[i] + jitter);
                }
            }
            work_mag.copy_from_slice(&frozen.magnitude);
            work_phase.copy_from_slice(&frozen.phase);
        } else if snap.shimmer > 0.0 {
            let quarter = half_bins / 4;
            for i in (quarter + 1)..half_bins {
                let jitter = rng.random_range(-0.02..0.02) * snap.shimmer;
                work_phase[i] = wrap_phase(work_phase[i] + jitter);
            }
        }

        // Smear: box-average magnitude and phase within the radius
        if snap.smear > 0.001 {
            let radius = (snap.smear * 5.0) as usize + 1;
            op_mag[..half_bins].copy_from_slice(&work_mag[..half_bins]);
            op_phase[..half_bins].copy_from_slice(&work_phase[..half_bins]);
            for i in 0..half_bins {
                let lo = i.saturating_sub(radius);
                let hi = (i + radius + 1).min(half_bins);
                let span = (hi - lo) as f64;
                let mut mag_sum = 0.0;
                let mut phase_sum = 0.0;
                for j in lo..hi {
                    mag_sum += op_mag[j];
                    phase_sum += op_phase[j];
                }
                work_mag[i] = mag_sum / span;
                work_phase[i] = phase_sum / span;
            }
        }

        // Shift: move bins up or down, vacated bins stay silent
        let bin_shift = ((snap.shift - 0.5) * 2.0 * 0.1 * half_bins as f64) as isize;
        if bin_shift != 0 {
            op_mag[..half_bins].fill(0.0);
            op_phase[..half_bins].fill(0.0);
            for i in 0..half_bins {
                let target = i as isize + bin_shift;
                if (0..half_bins as isize).contains(&target) {
                    op_mag[target as usize] = work_mag[i];
                    op_phase[target as usize] = work_phase[i];
                }
            }
            work_mag[..half_bins].copy_from_slice(&op_mag[..half_bins]);
            work_phase[..half_bins].copy_from_slice(&op_phase[..half_bins]);
        }

        // Resonance: boost 3-point local magnitude peaks
        if snap.resonance > 0.001 {
            let gain = 1.0 + 3.0 * snap.resonance;
            op_mag[..half_bins].copy_from_slice(&work_mag[..half_bins]);
            for i in 1..half_bins.saturating_sub(1) {
                if op_mag[i] > op_mag[i - 1] && op_mag[i] > op_mag[i + 1] {
                    work_mag[i] = op_mag[i] * gain;
                }
            }
        }

        // Brightness: linear spectral tilt, neutral at 1.0
        if (snap.brightness - 1.0).abs() > 1e-6 {
            for i in 0..half_bins {
                let freq_norm = i as f64 / half_bins as f64;
                let gain = (1.0 + (2.0 * snap.brightness - 2.0) * freq_norm).clamp(0.1, 4.0);
                work_mag[i] *= gain;
            }
        }

        // Density: keep only the loudest fraction of bins
        if snap.density < 0.999 {
            let keep = (snap.density * half_bins as f64) as usize;
            for (i, slot) in sort_idx[..half_bins].iter_mut().enumerate() {
                *slot = i;
            }
            if keep == 0 {
                work_mag[..half_bins].fill(0.0);
            } else if keep < half_bins {
                // Partial selection: loudest `keep` bins to the front
                sort_idx[..half_bins].select_nth_unstable_by(keep - 1, |&a, &b| {
                    work_mag[b]
                        .partial_cmp(&work_mag[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &i in &sort_idx[keep..half_bins] {
                    work_mag[i] = 0.0;
                }
            }
        }

        for i in 0..half_bins {
            bins[i] = Complex::from_polar(work_mag[i], work_phase[i]);
        }
    }
}

/// Wrap a phase into [-pi, pi]
#[inline]
fn wrap_phase(phase: f64) -> f64 {
    let mut p = phase;
    while p > std::f64::consts::PI {
        p -= std::f64::consts::TAU;
    }
    while p < -std::f64::consts::PI {
        p += std::f64::consts::TAU;
    }
    p
}

impl Processor for SpectralFreezeEngine {
    fn reset(&mut self) {
        self.stft.reset();
        self.state = FreezeState::Live;
        for frozen in &mut self.frozen {
            frozen.clear();
        }
        self.pending_capture.fill(false);
        for ring in &mut self.dry_delay {
            ring.fill(0.0);
        }
        self.dry_pos.fill(0);
        self.rng = ChaCha8Rng::seed_from_u64(SHIMMER_SEED);
        self.freeze.reset();
        self.smear.reset();
        self.shift.reset();
        self.resonance.reset();
        self.decay.reset();
        self.brightness.reset();
        self.density.reset();
        self.shimmer.reset();
        self.prev_freeze = self.freeze.current();
    }

    fn latency(&self) -> usize {
        self.stft.latency()
    }
}

impl AudioEngine for SpectralFreezeEngine {
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> ChimeraResult<()> {
        if max_block_size == 0 {
            return Err(ChimeraError::InvalidBlockSize(max_block_size));
        }
        let mut rebuilt =
            Self::with_config(sample_rate, self.stft.frame_size(), self.stft.hop_size())?;
        rebuilt.freeze.set_immediate(self.freeze.target());
        rebuilt.smear.set_immediate(self.smear.target());
        rebuilt.shift.set_immediate(self.shift.target());
        rebuilt.resonance.set_immediate(self.resonance.target());
        rebuilt.decay.set_immediate(self.decay.target());
        rebuilt.brightness.set_immediate(self.brightness.target());
        rebuilt.density.set_immediate(self.density.target());
        rebuilt.shimmer.set_immediate(self.shimmer.target());
        rebuilt.prev_freeze = rebuilt.freeze.current();
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

        // Hop-granular parameter snapshot for this block
        let freeze_now = self.freeze.skip(block_len);
        let snap = OpSnapshot {
            frozen_active: false, // filled in below
            smear: self.smear.skip(block_len),
            shift: self.shift.skip(block_len),
            resonance: self.resonance.skip(block_len),
            decay_coeff: 0.9 + 0.1 * self.decay.skip(block_len),
            brightness: self.brightness.skip(block_len),
            density: self.density.skip(block_len),
            shimmer: self.shimmer.skip(block_len),
        };

        // Trigger state machine on the smoothed freeze crossing 0.5
        if self.prev_freeze <= 0.5 && freeze_now > 0.5 {
            self.state = FreezeState::Capturing;
            self.pending_capture.fill(true);
        } else if freeze_now <= 0.5 {
            self.state = FreezeState::Live;
            self.pending_capture.fill(false);
        }
        self.prev_freeze = freeze_now;

        let snap = OpSnapshot {
            frozen_active: self.state != FreezeState::Live,
            ..snap
        };

        let wet_mix = freeze_now;
        let stft = &mut self.stft;
        let rng = &mut self.rng;
        let work_mag = &mut self.work_mag;
        let work_phase = &mut self.work_phase;
        let op_mag = &mut self.op_mag;
        let op_phase = &mut self.op_phase;
        let sort_idx = &mut self.sort_idx;
        let chunk_len = self.in_scratch.len();

        for (channel, samples) in [&mut *left, &mut *right].into_iter().enumerate() {
            let frozen_ch = &mut self.frozen[channel];
            let pending_ch = &mut self.pending_capture[channel];
            let ring = &mut self.dry_delay[channel];
            let pos = &mut self.dry_pos[channel];

            for chunk in samples[..block_len].chunks_mut(chunk_len) {
                let n = chunk.len();
                let in_scratch = &mut self.in_scratch[..n];
                let dry_scratch = &mut self.dry_scratch[..n];
                in_scratch.copy_from_slice(chunk);

                // Latency-aligned dry path
                for (dry, input) in dry_scratch.iter_mut().zip(in_scratch.iter()) {
                    let clean = if input.is_finite() { *input } else { 0.0 };
                    if ring.is_empty() {
                        *dry = clean;
                    } else {
                        *dry = ring[*pos];
                        ring[*pos] = clean;
                        *pos = (*pos + 1) % ring.len();
                    }
                }

                let mut transform = |bins: &mut [Complex<Sample>], _count: usize, _rate: f64| {
                    Self::apply_bin_ops(
                        bins, frozen_ch, pending_ch, rng, work_mag, work_phase, op_mag, op_phase,
                        sort_idx, snap,
                    );
                };
                stft.process_block(channel, in_scratch, chunk, &mut transform);

                for (out, &dry) in chunk.iter_mut().zip(dry_scratch.iter()) {
                    *out = sanitize(dry * (1.0 - wet_mix) + *out * wet_mix);
                }
            }
        }

        if self.state == FreezeState::Capturing && self.pending_capture.iter().all(|p| !p) {
            self.state = FreezeState::Frozen;
        }
    }

    fn set_parameter(&mut self, index: u32, value: f64) {
        if let Some(param) = FreezeParam::from_index(index) {
            self.set_param(param, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48000.0;

    fn engine() -> SpectralFreezeEngine {
        let mut engine = SpectralFreezeEngine::new(SR).unwrap();
        engine.prepare(SR, 512).unwrap();
        engine
    }

    fn sine(len: usize, freq: f64, amp: f64) -> Vec<f64> {
        (0..len)
            .map(|i| (std::f64::consts::TAU * freq * i as f64 / SR).sin() * amp)
            .collect()
    }

    /// Single-bin DFT power of `freq` over the slice
    fn tone_power(buf: &[f64], freq: f64) -> f64 {
        let mut re = 0.0;
        let mut im = 0.0;
        for (i, &x) in buf.iter().enumerate() {
            let phase = std::f64::consts::TAU * freq * i as f64 / SR;
            re += x * phase.cos();
            im += x * phase.sin();
        }
        (re * re + im * im) / (buf.len() * buf.len()) as f64
    }

    /// Summed DFT power over [lo, hi] in 10 Hz steps. Frozen resynthesis
    /// lands on hop-rate harmonics near the source tone, so assertions use
    /// bands rather than a single frequency.
    fn band_power(buf: &[f64], lo: f64, hi: f64) -> f64 {
        let mut freq = lo;
        let mut sum = 0.0;
        while freq <= hi {
            sum += tone_power(buf, freq);
            freq += 10.0;
        }
        sum
    }

    fn run(engine: &mut SpectralFreezeEngine, input: &[f64]) -> Vec<f64> {
        let mut left = input.to_vec();
        let mut right = input.to_vec();
        for start in (0..left.len()).step_by(512) {
            let end = (start + 512).min(input.len());
            let (l, r) = (&mut left[start..end], &mut right[start..end]);
            engine.process(l, r);
        }
        left
    }

    #[test]
    fn test_passthrough_when_not_frozen() {
        let mut engine = engine();
        let latency = engine.latency();

        let input = sine(SR as usize, 440.0, 0.5);
        let output = run(&mut engine, &input);

        // freeze = 0 -> fully dry, only delayed by the reported latency
        for t in latency + 4096..input.len() {
            assert!(
                (output[t] - input[t - latency]).abs() < 1e-9,
                "sample {t}"
            );
        }
    }

    #[test]
    fn test_freeze_holds_old_content() {
        let mut engine = engine();

        // Establish 500 Hz content and freeze while it is still playing
        let _ = run(&mut engine, &sine(SR as usize, 500.0, 0.5));
        engine.set_param(FreezeParam::Freeze, 1.0);
        let _ = run(&mut engine, &sine((SR * 0.25) as usize, 500.0, 0.5));

        // Switch to different content
        let output = run(&mut engine, &sine(SR as usize, 3000.0, 0.5));

        // After ~1 s of new input the output must still be dominated by the
        // captured 500 Hz content
        let tail = &output[(SR * 0.8) as usize..];
        let old = band_power(tail, 400.0, 600.0);
        let new = band_power(tail, 2900.0, 3100.0);
        assert!(
            old > new,
            "frozen content lost: 500Hz band {old:.3e} vs 3kHz band {new:.3e}"
        );
    }

    #[test]
    fn test_frozen_magnitude_persists_with_steady_input() {
        let mut engine = engine();
        let signal = sine(SR as usize, 500.0, 0.5);

        let _ = run(&mut engine, &signal);
        engine.set_param(FreezeParam::Freeze, 1.0);
        engine.set_param(FreezeParam::Decay, 1.0);

        let out_first = run(&mut engine, &signal);
        let out_later = run(&mut engine, &signal);

        let p_first = band_power(&out_first[(SR * 0.5) as usize..], 400.0, 600.0);
        let p_later = band_power(&out_later[(SR * 0.5) as usize..], 400.0, 600.0);
        // Under decay = 1.0 and steady input, the held spectrum barely moves
        assert!(
            p_later > p_first * 0.9,
            "frozen spectrum decayed: {p_first:.3e} -> {p_later:.3e}"
        );
    }

    #[test]
    fn test_density_zero_silences_wet_path() {
        let mut engine = engine();
        engine.set_param(FreezeParam::Freeze, 1.0);
        engine.set_param(FreezeParam::Density, 0.0);

        let output = run(&mut engine, &sine(SR as usize, 440.0, 0.5));
        let tail = &output[(SR * 0.5) as usize..];
        let rms = (tail.iter().map(|x| x * x).sum::<f64>() / tail.len() as f64).sqrt();
        assert!(rms < 1e-3, "density 0 leaked signal: rms {rms}");
    }

    #[test]
    fn test_shimmer_is_deterministic() {
        let make = || {
            let mut engine = engine();
            engine.set_param(FreezeParam::Freeze, 1.0);
            engine.set_param(FreezeParam::Shimmer, 0.8);
            run(&mut engine, &sine(24000, 440.0, 0.5))
        };
        let a = make();
        let b = make();
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_stays_finite_across_parameter_sweep() {
        let mut engine = engine();
        let input = sine(2048, 440.0, 0.5);

        for step in 0..32 {
            let v = step as f64 / 31.0;
            for index in 0..8 {
                engine.set_parameter(index, v);
            }
            let output = run(&mut engine, &input);
            assert!(output.iter().all(|x| x.is_finite()), "step {step}");
        }
    }

    #[test]
    fn test_unfreeze_returns_to_live() {
        let mut engine = engine();
        let latency = engine.latency();

        let _ = run(&mut engine, &sine(SR as usize, 500.0, 0.5));
        engine.set_param(FreezeParam::Freeze, 1.0);
        let _ = run(&mut engine, &sine(24000, 500.0, 0.5));
        engine.set_param(FreezeParam::Freeze, 0.0);

        let input = sine(SR as usize, 440.0, 0.5);
        let output = run(&mut engine, &input);
        // Well after the smoothed release, output tracks the dry input again
        for t in input.len() - 4800..input.len() {
            assert!((output[t] - input[t - latency]).abs() < 1e-6, "sample {t}");
        }
    }
}
