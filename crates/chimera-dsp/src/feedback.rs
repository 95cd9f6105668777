//! Feedback delay network
//!
//! Dual delay lines with cross-feedback, diffusion-style channel mixing,
//! LFO-modulated read position and a freeze-hold mode. Processes sample by
//! sample within each block; all state is sized in `prepare()`.
//!
//! Stability: feedback and crossfeed are hard-clamped to +/-0.85, a 15%
//! margin below the unity instability bound. There is no sum check, so the
//! combined extreme (feedback = crossfeed = 0.85) exceeds unity loop gain;
//! the recirculating write is clamped to +/-4 so even that corner stays
//! bounded. The boundedness test covers it.

use std::f64::consts::TAU;

use chimera_core::{ChimeraError, ChimeraResult, NormalizedValue, Sample};

use crate::integrity::sanitize;
use crate::smoothing::SmoothedParam;
use crate::{AudioEngine, Processor, StereoProcessor};

/// Maximum configurable delay
const MAX_DELAY_SECONDS: f64 = 2.0;
/// Maximum modulation excursion as a fraction of the sample rate
const MAX_MOD_DEPTH: f64 = 0.05;
/// Fixed detuned LFO rates (Hz)
const LFO_RATE_L: f64 = 0.1;
const LFO_RATE_R: f64 = 0.11;
/// Hard ceiling on the recirculating path; keeps the combined
/// feedback+crossfeed corner (0.85 + 0.85 > 1) bounded
const RECIRC_LIMIT: f64 = 4.0;

/// Circular delay buffer with fractional and nearest-sample reads.
///
/// The write cursor advances by exactly one sample per `write()`; read
/// offsets are clamped into [1, len-1] in signed arithmetic before any
/// indexing, so a negative modulated offset can never wrap into a bogus
/// unsigned index.
#[derive(Debug, Clone)]
pub struct DelayLine {
    buffer: Vec<Sample>,
    write_pos: usize,
}

impl DelayLine {
    pub fn new(max_samples: usize) -> Self {
        Self {
            buffer: vec![0.0; max_samples.max(2)],
            write_pos: 0,
        }
    }

    #[inline]
    pub fn write(&mut self, value: Sample) {
        self.buffer[self.write_pos] = value;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
    }

    /// Linear-interpolated read `offset` samples behind the write cursor
    #[inline]
    pub fn read_fractional(&self, offset: f64) -> Sample {
        let max_offset = (self.buffer.len() - 1) as f64;
        let offset = if offset.is_finite() {
            offset.clamp(1.0, max_offset)
        } else {
            1.0
        };

        let whole = offset as i64;
        let frac = offset - whole as f64;

        let len = self.buffer.len() as i64;
        let idx0 = (self.write_pos as i64 - whole).rem_euclid(len) as usize;
        // One sample older for the interpolation partner
        let idx1 = (self.write_pos as i64 - whole - 1).rem_euclid(len) as usize;

        let s0 = self.buffer[idx0];
        let s1 = self.buffer[idx1];
        s0 + (s1 - s0) * frac
    }

    /// Nearest-sample read `offset` samples behind the write cursor
    #[inline]
    pub fn read_nearest(&self, offset: i64) -> Sample {
        let clamped = offset.clamp(1, self.buffer.len() as i64 - 1);
        let idx = (self.write_pos as i64 - clamped).rem_euclid(self.buffer.len() as i64);
        self.buffer[idx as usize]
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }
}

/// Sine phase accumulator advanced once per sample
#[derive(Debug, Clone)]
pub struct ModulationLFO {
    phase: f64,
    increment: f64,
}

impl ModulationLFO {
    pub fn new(rate_hz: f64, sample_rate: f64) -> Self {
        Self {
            phase: 0.0,
            increment: TAU * rate_hz / sample_rate,
        }
    }

    #[inline]
    pub fn next(&mut self) -> f64 {
        let value = self.phase.sin();
        self.phase += self.increment;
        if self.phase >= TAU {
            self.phase -= TAU;
        }
        value
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }
}

/// Parameter indices for [`FeedbackDelayNetwork`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackParam {
    /// Delay time, 1..2000 ms
    DelayTime = 0,
    /// Feedback coefficient, -0.85..+0.85
    Feedback = 1,
    /// Cross-channel feedback, -0.85..+0.85
    Crossfeed = 2,
    /// Channel diffusion mix, 0..1
    Diffusion = 3,
    /// Modulation depth, 0..5% of the sample rate
    ModDepth = 4,
    /// Freeze-hold toggle (threshold at 0.5)
    Freeze = 5,
    /// Dry/wet mix
    Mix = 6,
}

impl FeedbackParam {
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::DelayTime),
            1 => Some(Self::Feedback),
            2 => Some(Self::Crossfeed),
            3 => Some(Self::Diffusion),
            4 => Some(Self::ModDepth),
            5 => Some(Self::Freeze),
            6 => Some(Self::Mix),
            _ => None,
        }
    }
}

/// Dual delay lines with cross-feedback, diffusion and modulated read taps
pub struct FeedbackDelayNetwork {
    sample_rate: f64,
    delay_l: DelayLine,
    delay_r: DelayLine,
    lfo_l: ModulationLFO,
    lfo_r: ModulationLFO,

    // Normalized [0,1] targets, mapped in the sample loop
    delay_time: SmoothedParam,
    feedback: SmoothedParam,
    crossfeed: SmoothedParam,
    diffusion: SmoothedParam,
    mod_depth: SmoothedParam,
    freeze: SmoothedParam,
    mix: SmoothedParam,
}

impl FeedbackDelayNetwork {
    pub fn new(sample_rate: f64) -> ChimeraResult<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ChimeraError::InvalidSampleRate(sample_rate));
        }
        let max_samples = ((MAX_DELAY_SECONDS + MAX_MOD_DEPTH) * sample_rate) as usize + 2;

        Ok(Self {
            sample_rate,
            delay_l: DelayLine::new(max_samples),
            delay_r: DelayLine::new(max_samples),
            lfo_l: ModulationLFO::new(LFO_RATE_L, sample_rate),
            lfo_r: ModulationLFO::new(LFO_RATE_R, sample_rate),
            delay_time: SmoothedParam::normalized(0.25, 50.0, sample_rate),
            feedback: SmoothedParam::normalized(0.5, 20.0, sample_rate),
            crossfeed: SmoothedParam::normalized(0.5, 20.0, sample_rate),
            diffusion: SmoothedParam::normalized(0.0, 50.0, sample_rate),
            mod_depth: SmoothedParam::normalized(0.0, 50.0, sample_rate),
            freeze: SmoothedParam::normalized(0.0, 20.0, sample_rate),
            mix: SmoothedParam::normalized(0.5, 20.0, sample_rate),
        })
    }

    /// Set a normalized parameter value
    pub fn set_param(&self, param: FeedbackParam, normalized: f64) {
        let value = NormalizedValue::new(normalized).get();
        match param {
            FeedbackParam::DelayTime => self.delay_time.set_target(value),
            FeedbackParam::Feedback => self.feedback.set_target(value),
            FeedbackParam::Crossfeed => self.crossfeed.set_target(value),
            FeedbackParam::Diffusion => self.diffusion.set_target(value),
            FeedbackParam::ModDepth => self.mod_depth.set_target(value),
            FeedbackParam::Freeze => self.freeze.set_target(value),
            FeedbackParam::Mix => self.mix.set_target(value),
        }
    }

    /// Delay time in samples for the current smoothed normalized value
    #[inline]
    fn delay_samples(&self, normalized: f64) -> f64 {
        let ms = 1.0 + normalized * (MAX_DELAY_SECONDS * 1000.0 - 1.0);
        ms * 0.001 * self.sample_rate
    }
}

impl Processor for FeedbackDelayNetwork {
    fn reset(&mut self) {
        self.delay_l.reset();
        self.delay_r.reset();
        self.lfo_l.reset();
        self.lfo_r.reset();
        self.delay_time.reset();
        self.feedback.reset();
        self.crossfeed.reset();
        self.diffusion.reset();
        self.mod_depth.reset();
        self.freeze.reset();
        self.mix.reset();
    }
}

impl StereoProcessor for FeedbackDelayNetwork {
    fn process_sample(&mut self, left: Sample, right: Sample) -> (Sample, Sample) {
        let delay_time = self.delay_time.next();
        let delay_samples = self.delay_samples(delay_time);
        let feedback = (self.feedback.next() * 2.0 - 1.0) * 0.85;
        let crossfeed = (self.crossfeed.next() * 2.0 - 1.0) * 0.85;
        let diffusion = self.diffusion.next();
        let mod_depth = self.mod_depth.next() * MAX_MOD_DEPTH;
        let frozen = self.freeze.next() > 0.5;
        let mix = self.mix.next();

        let mod_offset_l = self.lfo_l.next() * mod_depth * self.sample_rate;
        let mod_offset_r = self.lfo_r.next() * mod_depth * self.sample_rate;

        let delayed_l = self.delay_l.read_fractional(delay_samples + mod_offset_l);
        let delayed_r = self.delay_r.read_fractional(delay_samples + mod_offset_r);

        let (new_l, new_r) = if frozen {
            // Hold mode: each line feeds itself back, no new energy added
            (delayed_l, delayed_r)
        } else {
            let mixed_l = left + diffusion * (delayed_r - left);
            let mixed_r = right + diffusion * (delayed_l - right);
            (
                sanitize(mixed_l + delayed_r * feedback + delayed_l * crossfeed)
                    .clamp(-RECIRC_LIMIT, RECIRC_LIMIT),
                sanitize(mixed_r + delayed_l * feedback + delayed_r * crossfeed)
                    .clamp(-RECIRC_LIMIT, RECIRC_LIMIT),
            )
        };

        self.delay_l.write(new_l);
        self.delay_r.write(new_r);

        let out_l = sanitize(left * (1.0 - mix) + delayed_l * mix);
        let out_r = sanitize(right * (1.0 - mix) + delayed_r * mix);
        (out_l, out_r)
    }
}

impl AudioEngine for FeedbackDelayNetwork {
    fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> ChimeraResult<()> {
        if max_block_size == 0 {
            return Err(ChimeraError::InvalidBlockSize(max_block_size));
        }
        let mut rebuilt = Self::new(sample_rate)?;
        // Carry parameter targets across the rebuild
        rebuilt.delay_time.set_immediate(self.delay_time.target());
        rebuilt.feedback.set_immediate(self.feedback.target());
        rebuilt.crossfeed.set_immediate(self.crossfeed.target());
        rebuilt.diffusion.set_immediate(self.diffusion.target());
        rebuilt.mod_depth.set_immediate(self.mod_depth.target());
        rebuilt.freeze.set_immediate(self.freeze.target());
        rebuilt.mix.set_immediate(self.mix.target());
        *self = rebuilt;

        log::debug!("FeedbackDelayNetwork: prepared @ {sample_rate} Hz");
        Ok(())
    }

    fn process(&mut self, left: &mut [Sample], right: &mut [Sample]) {
        StereoProcessor::process_block(self, left, right);
    }

    fn set_parameter(&mut self, index: u32, value: f64) {
        if let Some(param) = FeedbackParam::from_index(index) {
            self.set_param(param, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f64 = 48000.0;

    fn network() -> FeedbackDelayNetwork {
        let mut fdn = FeedbackDelayNetwork::new(SR).unwrap();
        // Instant parameter response for deterministic assertions
        fdn.set_param(FeedbackParam::Diffusion, 0.0);
        fdn.set_param(FeedbackParam::Crossfeed, 0.5); // center = 0.0
        fdn.set_param(FeedbackParam::ModDepth, 0.0);
        fdn.set_param(FeedbackParam::Mix, 1.0);
        fdn.reset();
        fdn
    }

    #[test]
    fn test_delay_line_offset_clamp() {
        let mut line = DelayLine::new(100);
        line.write(1.0);
        // Negative, zero, and oversized offsets must stay in bounds
        let _ = line.read_fractional(-50.0);
        let _ = line.read_fractional(0.0);
        let _ = line.read_fractional(1e9);
        let _ = line.read_fractional(f64::NAN);
        let _ = line.read_nearest(-3);
        let _ = line.read_nearest(1_000_000);
    }

    #[test]
    fn test_delay_line_roundtrip() {
        let mut line = DelayLine::new(1000);
        line.write(0.75);
        for _ in 0..9 {
            line.write(0.0);
        }
        // The impulse is now 10 samples behind the write cursor
        assert!((line.read_nearest(10) - 0.75).abs() < 1e-12);
        assert!((line.read_fractional(10.0) - 0.75).abs() < 1e-12);
        // Halfway between impulse and silence
        assert!((line.read_fractional(9.5) - 0.375).abs() < 1e-12);
    }

    #[test]
    fn test_echo_train() {
        let mut fdn = network();
        // 250ms, feedback 0.5 -> normalized (0.5*0.85... ) feedback maps (x*2-1)*0.85
        let fb_norm = (0.5 / 0.85 + 1.0) / 2.0;
        fdn.set_param(FeedbackParam::Feedback, fb_norm);
        let delay_norm = (250.0 - 1.0) / (2000.0 - 1.0);
        fdn.set_param(FeedbackParam::DelayTime, delay_norm);
        fdn.reset();

        let delay_samples = (1.0 + delay_norm * 1999.0) * 0.001 * SR;
        let total = (delay_samples * 3.5) as usize;
        let mut left = vec![0.0; total];
        let mut right = vec![0.0; total];
        left[0] = 1.0;
        right[0] = 1.0;
        fdn.process(&mut left, &mut right);

        // Locate the first three echoes
        let find_peak = |buf: &[f64], center: usize| -> f64 {
            let lo = center.saturating_sub(8);
            let hi = (center + 8).min(buf.len());
            buf[lo..hi].iter().fold(0.0f64, |a, &b| a.max(b.abs()))
        };
        let d = delay_samples.round() as usize;
        let e1 = find_peak(&left, d);
        let e2 = find_peak(&left, 2 * d);
        let e3 = find_peak(&left, 3 * d);

        assert!(e1 > 0.9 && e1 <= 1.0 + 1e-9, "first echo {e1}");
        assert!((e2 / e1 - 0.5).abs() < 0.05, "ratio {}", e2 / e1);
        assert!((e3 / e2 - 0.5).abs() < 0.05, "ratio {}", e3 / e2);
    }

    #[test]
    fn test_boundedness_at_extremes() {
        for &(fb, cf) in &[(1.0, 1.0), (0.0, 0.0), (1.0, 0.0), (0.0, 1.0)] {
            let mut fdn = network();
            fdn.set_param(FeedbackParam::Feedback, fb);
            fdn.set_param(FeedbackParam::Crossfeed, cf);
            fdn.set_param(FeedbackParam::DelayTime, 0.01);
            fdn.reset();

            let mut left = vec![0.0; 100_000];
            let mut right = vec![0.0; 100_000];
            left[0] = 1.0;
            right[0] = 1.0;
            fdn.process(&mut left, &mut right);

            for (i, (&l, &r)) in left.iter().zip(&right).enumerate() {
                assert!(l.is_finite() && r.is_finite(), "non-finite at {i}");
                assert!(l.abs() < 10.0 && r.abs() < 10.0, "runaway at {i}: {l} {r}");
            }
        }
    }

    #[test]
    fn test_freeze_holds_content() {
        let mut fdn = network();
        fdn.set_param(FeedbackParam::DelayTime, 0.05);
        fdn.reset();

        // Seed the delay lines with signal
        let mut left: Vec<f64> = (0..24000).map(|i| (i as f64 * 0.1).sin() * 0.5).collect();
        let mut right = left.clone();
        fdn.process(&mut left, &mut right);

        // Engage freeze, feed silence: output must keep producing content
        fdn.set_param(FeedbackParam::Freeze, 1.0);
        let mut left = vec![0.0; 48000];
        let mut right = vec![0.0; 48000];
        fdn.process(&mut left, &mut right);

        let tail_rms: f64 = {
            let tail = &left[40000..];
            (tail.iter().map(|x| x * x).sum::<f64>() / tail.len() as f64).sqrt()
        };
        assert!(tail_rms > 1e-4, "freeze decayed to silence: rms {tail_rms}");
    }

    #[test]
    fn test_modulation_detunes_channels() {
        let mut fdn = network();
        fdn.set_param(FeedbackParam::ModDepth, 0.2);
        fdn.set_param(FeedbackParam::DelayTime, 0.05);
        fdn.reset();

        let mut left: Vec<f64> = (0..48000).map(|i| (i as f64 * 0.05).sin()).collect();
        let mut right = left.clone();
        fdn.process(&mut left, &mut right);

        // Detuned LFO rates drive the channels apart
        let diff: f64 = left
            .iter()
            .zip(&right)
            .skip(24000)
            .map(|(l, r)| (l - r).abs())
            .sum();
        assert!(diff > 1e-3);
    }

    #[test]
    fn test_prepare_rejects_bad_config() {
        assert!(FeedbackDelayNetwork::new(0.0).is_err());
        assert!(FeedbackDelayNetwork::new(f64::NAN).is_err());
        let mut fdn = network();
        assert!(fdn.prepare(48000.0, 0).is_err());
        assert!(fdn.prepare(96000.0, 512).is_ok());
    }
}
