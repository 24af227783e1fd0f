//! Adaptive smoothing filters for the particulate channels.
//!
//! Each channel runs an independent 1-dimensional linear filter with identity
//! state transition and observation. The observation-noise covariance is
//! recomputed each step from the volatility of the two most recent raw
//! readings: `r = kp + kd * log10(max/min)`, so the filter trusts stable
//! measurements and distrusts spikes. `kp` and `kd` are the configured base
//! constants divided by the sampling period.
//!
//! A non-finite result or an undefined log ratio (zero or negative raw value)
//! resets only the affected channel to its initial state and yields the
//! sentinel output; the next valid input behaves exactly as on a fresh
//! filter.

use crate::opc::RawReading;
use log::debug;

/// Output sentinel after a channel reset.
pub const FILTER_SENTINEL: f64 = -1.0;

const INITIAL_COVARIANCE: f64 = 1000.0;
const INITIAL_OBSERVATION_NOISE: f64 = 1.0;
const TRANSITION_COVARIANCE: f64 = 1.0;

/// Smoothed counterpart of a [`RawReading`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilteredReading {
    pub pm1: f64,
    pub pm2_5: f64,
    pub pm10: f64,
}

impl FilteredReading {
    pub const SENTINEL: FilteredReading = FilteredReading {
        pm1: FILTER_SENTINEL,
        pm2_5: FILTER_SENTINEL,
        pm10: FILTER_SENTINEL,
    };
}

/// State of one scalar channel filter. Owned exclusively by its channel,
/// never shared.
#[derive(Debug, Clone)]
struct ChannelFilter {
    prev_obs: f64,
    obs: f64,
    prev_mean: f64,
    mean: f64,
    prev_cov: f64,
    cov: f64,
    observation_noise: f64,
    iteration: u32,
}

impl ChannelFilter {
    fn new() -> Self {
        Self {
            prev_obs: 0.0,
            obs: 0.0,
            prev_mean: 0.0,
            mean: 0.0,
            prev_cov: INITIAL_COVARIANCE,
            cov: INITIAL_COVARIANCE,
            observation_noise: INITIAL_OBSERVATION_NOISE,
            iteration: 1,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn step(&mut self, value: f64, kp: f64, kd: f64) -> f64 {
        // A zero or negative observation makes the log ratio undefined.
        if !value.is_finite() || value <= 0.0 {
            debug!("channel filter reset on unusable observation {value}");
            self.reset();
            return FILTER_SENTINEL;
        }

        self.prev_obs = self.obs;
        self.obs = value;

        if self.iteration > 1 {
            let (max_obs, min_obs) = if self.obs >= self.prev_obs {
                (self.obs, self.prev_obs)
            } else {
                (self.prev_obs, self.obs)
            };
            if min_obs <= 0.0 {
                self.reset();
                return FILTER_SENTINEL;
            }
            self.observation_noise = kp + kd * (max_obs / min_obs).log10();
        }

        let mean_pred = self.mean;
        let cov_pred = self.cov + TRANSITION_COVARIANCE;
        let gain = cov_pred / (cov_pred + self.observation_noise);
        let mean = mean_pred + gain * (value - mean_pred);
        let cov = (1.0 - gain) * cov_pred;

        if !mean.is_finite() || !cov.is_finite() {
            debug!("channel filter reset on non-finite update");
            self.reset();
            return FILTER_SENTINEL;
        }

        self.prev_mean = mean_pred;
        self.prev_cov = self.cov;
        self.mean = mean;
        self.cov = cov;
        self.iteration += 1;

        round3(mean)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Three independent channel filters plus the active base constants.
pub struct FilterBank {
    channels: [ChannelFilter; 3],
    kp_base: f64,
    kd_base: f64,
}

impl FilterBank {
    pub fn new(kp_base: f64, kd_base: f64) -> Self {
        Self {
            channels: [ChannelFilter::new(), ChannelFilter::new(), ChannelFilter::new()],
            kp_base,
            kd_base,
        }
    }

    /// Replaces the base constants without touching the channel states.
    pub fn set_constants(&mut self, kp_base: f64, kd_base: f64) {
        self.kp_base = kp_base;
        self.kd_base = kd_base;
    }

    pub fn constants(&self) -> (f64, f64) {
        (self.kp_base, self.kd_base)
    }

    /// One filtering step over all three channels.
    ///
    /// To be called once per sampling tick, only with a valid raw reading.
    pub fn step(&mut self, raw: &RawReading, sampling_period_secs: u32) -> FilteredReading {
        let period = f64::from(sampling_period_secs.max(1));
        let kp = self.kp_base / period;
        let kd = self.kd_base / period;
        FilteredReading {
            pm1: self.channels[0].step(raw.pm1, kp, kd),
            pm2_5: self.channels[1].step(raw.pm2_5, kp, kd),
            pm10: self.channels[2].step(raw.pm10, kp, kd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(pm1: f64, pm2_5: f64, pm10: f64) -> RawReading {
        RawReading {
            pm1,
            pm2_5,
            pm10,
            valid: true,
        }
    }

    #[test]
    fn converges_on_stable_input() {
        let mut bank = FilterBank::new(20.0, 50.0);
        let mut last = FilteredReading::SENTINEL;
        for _ in 0..5 {
            last = bank.step(&reading(10.0, 10.0, 10.0), 1);
        }
        assert!((last.pm1 - 10.0).abs() < 0.01, "pm1 = {}", last.pm1);
        assert!((last.pm2_5 - 10.0).abs() < 0.01);
        assert!((last.pm10 - 10.0).abs() < 0.01);
    }

    #[test]
    fn deterministic_for_identical_input_sequences() {
        let inputs = [12.0, 13.5, 11.8, 40.0, 39.5, 12.2, 12.1];
        let run = || {
            let mut bank = FilterBank::new(20.0, 50.0);
            inputs
                .iter()
                .map(|&v| bank.step(&reading(v, v * 2.0, v * 3.0), 2))
                .collect::<Vec<_>>()
        };
        let first = run();
        let second = run();
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.pm1.to_bits(), b.pm1.to_bits());
            assert_eq!(a.pm2_5.to_bits(), b.pm2_5.to_bits());
            assert_eq!(a.pm10.to_bits(), b.pm10.to_bits());
        }
    }

    #[test]
    fn zero_observation_resets_and_recovers() {
        let mut fresh = FilterBank::new(20.0, 50.0);
        let expected_first = fresh.step(&reading(10.0, 10.0, 10.0), 1);

        let mut bank = FilterBank::new(20.0, 50.0);
        bank.step(&reading(10.0, 10.0, 10.0), 1);
        bank.step(&reading(10.1, 10.1, 10.1), 1);
        let out = bank.step(&reading(0.0, 0.0, 0.0), 1);
        assert_eq!(out, FilteredReading::SENTINEL);

        // Post-reset state equals the fresh-initial state.
        let recovered = bank.step(&reading(10.0, 10.0, 10.0), 1);
        assert_eq!(recovered.pm1.to_bits(), expected_first.pm1.to_bits());
    }

    #[test]
    fn negative_observation_resets() {
        let mut bank = FilterBank::new(20.0, 50.0);
        bank.step(&reading(10.0, 10.0, 10.0), 1);
        let out = bank.step(&reading(-3.0, -3.0, -3.0), 1);
        assert_eq!(out, FilteredReading::SENTINEL);
    }

    #[test]
    fn reset_is_per_channel() {
        let mut bank = FilterBank::new(20.0, 50.0);
        bank.step(&reading(10.0, 10.0, 10.0), 1);
        // Only the pm1 channel receives a zero.
        let out = bank.step(&reading(0.0, 10.0, 10.0), 1);
        assert_eq!(out.pm1, FILTER_SENTINEL);
        assert_ne!(out.pm2_5, FILTER_SENTINEL);
        assert_ne!(out.pm10, FILTER_SENTINEL);
    }

    #[test]
    fn spike_lowers_trust_in_new_measurement() {
        // After a stable run, a sudden spike should be pulled toward the
        // previous estimate rather than adopted outright.
        let mut bank = FilterBank::new(20.0, 50.0);
        for _ in 0..10 {
            bank.step(&reading(10.0, 10.0, 10.0), 1);
        }
        let spiked = bank.step(&reading(100.0, 10.0, 10.0), 1);
        assert!(spiked.pm1 < 50.0, "spike adopted too eagerly: {}", spiked.pm1);
        assert!(spiked.pm1 > 10.0);
    }

    #[test]
    fn output_is_rounded_to_three_decimals() {
        let mut bank = FilterBank::new(20.0, 50.0);
        let out = bank.step(&reading(10.123_456, 10.0, 10.0), 1);
        let scaled = out.pm1 * 1000.0;
        assert!((scaled - scaled.round()).abs() < 1e-9);
    }
}
