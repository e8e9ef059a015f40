//! Mask decoding: turning per-body logits into soft assignment weights.
//!
//! Three decoders act across the body channels of every pixel:
//! - softmax: weights sum to one;
//! - sigmoid: independent weights in (0, 1);
//! - weight sharpening: `normalize₁((clamp(σ(x) + n, 0, 1e5))^p + 1e-12)`
//!   where the noise level and the power `p` grow with the training
//!   iteration, pushing the masks towards a hard assignment.
//!
//! The iteration is read from an explicit [`TrainingClock`]; noise is drawn
//! from a caller-supplied RNG and retained so the backward pass can treat it
//! as a constant.

use crate::config::PoseModelConfig;
use crate::error::{Se3Error, Se3Result};
use crate::points::Mask;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

const SHARPEN_CLAMP_MAX: f64 = 1e5;
const SHARPEN_OFFSET: f64 = 1e-12;
const NORMALIZE_EPS: f64 = 1e-12;
const MAX_NOISE_STD: f64 = 0.1;
const MAX_POWER: f64 = 100.0;
const NOISE_RAMP_ITERS: f64 = 125_000.0;
const POWER_RAMP_ITERS: f64 = 500.0;

/// Decoder applied across the body channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MaskMode {
    #[default]
    Softmax,
    Sigmoid,
    Sharpened,
}

impl fmt::Display for MaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskMode::Softmax => write!(f, "softmax"),
            MaskMode::Sigmoid => write!(f, "sigmoid"),
            MaskMode::Sharpened => write!(f, "wt_sharpening"),
        }
    }
}

impl FromStr for MaskMode {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "softmax" | "softmask" => Ok(MaskMode::Softmax),
            "sigmoid" | "sigmoidmask" => Ok(MaskMode::Sigmoid),
            "wt_sharpening" | "sharpened" | "sharpen" => Ok(MaskMode::Sharpened),
            _ => Err(Se3Error::unknown("mask mode", s)),
        }
    }
}

/// Monotonic training-iteration counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrainingClock {
    iteration: u64,
}

impl TrainingClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from a checkpointed iteration.
    pub fn resume(iteration: u64) -> Self {
        Self { iteration }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Advance by one iteration and return the new value.
    pub fn tick(&mut self) -> u64 {
        self.iteration += 1;
        self.iteration
    }
}

/// Noise level and power of the sharpening decoder at one iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SharpeningStats {
    pub noise_std: f64,
    pub power: f64,
}

impl Default for SharpeningStats {
    fn default() -> Self {
        Self {
            noise_std: 0.0,
            power: 1.0,
        }
    }
}

/// Ramp of the sharpening noise and power over training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharpeningSchedule {
    pub start_iter: u64,
    pub rate: f64,
    pub noise_stop_iter: u64,
}

impl Default for SharpeningSchedule {
    fn default() -> Self {
        Self {
            start_iter: 0,
            rate: 1.0,
            noise_stop_iter: 1_000_000,
        }
    }
}

impl SharpeningSchedule {
    /// With c = 1 + (iter − start): noise = min(c/125000·rate, 0.1) (zero
    /// after `noise_stop_iter`), power = min(1 + c/500·rate, 100); before the
    /// start iteration noise is 0 and power 1.
    pub fn stats(&self, iteration: u64) -> SharpeningStats {
        let citer = 1.0 + iteration as f64 - self.start_iter as f64;
        if citer <= 0.0 {
            return SharpeningStats::default();
        }
        let noise_std = if iteration > self.noise_stop_iter {
            0.0
        } else {
            (citer / NOISE_RAMP_ITERS * self.rate).min(MAX_NOISE_STD)
        };
        SharpeningStats {
            noise_std,
            power: (1.0 + citer / POWER_RAMP_ITERS * self.rate).min(MAX_POWER),
        }
    }
}

/// Decoded masks together with what the backward pass needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMask {
    pub masks: Mask,
    /// Sharpening parameters used, for the sharpened decoder.
    pub stats: Option<SharpeningStats>,
    /// Noise added to σ(x), same layout as the masks.
    pub noise: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskDecoder {
    mode: MaskMode,
    schedule: SharpeningSchedule,
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl MaskDecoder {
    pub fn new(mode: MaskMode) -> Self {
        Self {
            mode,
            schedule: SharpeningSchedule::default(),
        }
    }

    pub fn with_schedule(mut self, schedule: SharpeningSchedule) -> Self {
        if self.mode == MaskMode::Sharpened && schedule.rate == 0.0 {
            warn!("weight sharpening with zero rate never sharpens the masks");
        }
        self.schedule = schedule;
        self
    }

    pub fn from_config(config: &PoseModelConfig) -> Self {
        Self::new(config.mask_mode).with_schedule(config.sharpening)
    }

    pub fn mode(&self) -> MaskMode {
        self.mode
    }

    pub fn schedule(&self) -> &SharpeningSchedule {
        &self.schedule
    }

    /// Decode `logits` (`B × K × H × W`). Noise is only drawn while training.
    pub fn decode<R: Rng + ?Sized>(
        &self,
        logits: &Mask,
        clock: &TrainingClock,
        training: bool,
        rng: &mut R,
    ) -> Se3Result<DecodedMask> {
        let channels = logits.channels();
        let pixels = logits.num_pixels();
        let mut masks = logits.zeros_like();

        match self.mode {
            MaskMode::Softmax => {
                for b in 0..logits.batch_size() {
                    let input = logits.example(b);
                    let output = masks.example_mut(b);
                    for pix in 0..pixels {
                        let max = (0..channels)
                            .map(|k| input[k * pixels + pix])
                            .fold(f64::NEG_INFINITY, f64::max);
                        let mut total = 0.0_f64;
                        for k in 0..channels {
                            let e = (input[k * pixels + pix] - max).exp();
                            output[k * pixels + pix] = e;
                            total += e;
                        }
                        for k in 0..channels {
                            output[k * pixels + pix] /= total;
                        }
                    }
                }
                Ok(DecodedMask {
                    masks,
                    stats: None,
                    noise: None,
                })
            }
            MaskMode::Sigmoid => {
                for (out, x) in masks.data_mut().iter_mut().zip(logits.data()) {
                    *out = sigmoid(*x);
                }
                Ok(DecodedMask {
                    masks,
                    stats: None,
                    noise: None,
                })
            }
            MaskMode::Sharpened => {
                let stats = self.schedule.stats(clock.iteration());
                debug!(
                    "sharpening at iteration {}: noise_std={:.4}, power={:.3}",
                    clock.iteration(),
                    stats.noise_std,
                    stats.power
                );
                let noise = (training && stats.noise_std > 0.0).then(|| {
                    (0..logits.len())
                        .map(|_| stats.noise_std * rng.sample::<f64, _>(StandardNormal))
                        .collect::<Vec<f64>>()
                });

                for b in 0..logits.batch_size() {
                    let offset = b * channels * pixels;
                    let input = logits.example(b);
                    let output = masks.example_mut(b);
                    for pix in 0..pixels {
                        let mut total = 0.0_f64;
                        for k in 0..channels {
                            let idx = k * pixels + pix;
                            let n = noise.as_ref().map_or(0.0, |n| n[offset + idx]);
                            let clamped = (sigmoid(input[idx]) + n).clamp(0.0, SHARPEN_CLAMP_MAX);
                            let e = clamped.powf(stats.power) + SHARPEN_OFFSET;
                            output[idx] = e;
                            total += e;
                        }
                        let total = total.max(NORMALIZE_EPS);
                        for k in 0..channels {
                            output[k * pixels + pix] /= total;
                        }
                    }
                }
                Ok(DecodedMask {
                    masks,
                    stats: Some(stats),
                    noise,
                })
            }
        }
    }

    /// Gradient with respect to the logits; sharpening noise is held fixed.
    pub fn backward(
        &self,
        logits: &Mask,
        decoded: &DecodedMask,
        grad_output: &Mask,
    ) -> Se3Result<Mask> {
        logits.ensure_same_shape(&decoded.masks, "MaskDecoder::backward")?;
        logits.ensure_same_shape(grad_output, "MaskDecoder::backward")?;

        let channels = logits.channels();
        let pixels = logits.num_pixels();
        let mut grad = logits.zeros_like();

        match self.mode {
            MaskMode::Softmax => {
                for b in 0..logits.batch_size() {
                    let y = decoded.masks.example(b);
                    let g = grad_output.example(b);
                    let out = grad.example_mut(b);
                    for pix in 0..pixels {
                        let inner: f64 = (0..channels)
                            .map(|k| g[k * pixels + pix] * y[k * pixels + pix])
                            .sum();
                        for k in 0..channels {
                            let idx = k * pixels + pix;
                            out[idx] = y[idx] * (g[idx] - inner);
                        }
                    }
                }
            }
            MaskMode::Sigmoid => {
                for ((out, y), g) in grad
                    .data_mut()
                    .iter_mut()
                    .zip(decoded.masks.data())
                    .zip(grad_output.data())
                {
                    *out = g * y * (1.0 - y);
                }
            }
            MaskMode::Sharpened => {
                let stats = decoded
                    .stats
                    .ok_or(Se3Error::MissingForwardContext("MaskDecoder::backward"))?;
                for b in 0..logits.batch_size() {
                    let offset = b * channels * pixels;
                    let x = logits.example(b);
                    let y = decoded.masks.example(b);
                    let g = grad_output.example(b);
                    let out = grad.example_mut(b);
                    for pix in 0..pixels {
                        // Recompute the unnormalized weights.
                        let mut shifted = vec![0.0_f64; channels];
                        let mut total = 0.0_f64;
                        for (k, a) in shifted.iter_mut().enumerate() {
                            let idx = k * pixels + pix;
                            let n = decoded.noise.as_ref().map_or(0.0, |n| n[offset + idx]);
                            *a = sigmoid(x[idx]) + n;
                            total +=
                                a.clamp(0.0, SHARPEN_CLAMP_MAX).powf(stats.power) + SHARPEN_OFFSET;
                        }
                        let total = total.max(NORMALIZE_EPS);
                        let inner: f64 = (0..channels)
                            .map(|k| g[k * pixels + pix] * y[k * pixels + pix])
                            .sum();

                        for (k, a) in shifted.iter().enumerate() {
                            let idx = k * pixels + pix;
                            if !(0.0..=SHARPEN_CLAMP_MAX).contains(a) {
                                continue;
                            }
                            let g_e = (g[idx] - inner) / total;
                            let g_a = g_e * stats.power * a.powf(stats.power - 1.0);
                            let s = sigmoid(x[idx]);
                            out[idx] = g_a * s * (1.0 - s);
                        }
                    }
                }
            }
        }
        Ok(grad)
    }
}
