use serde::{Deserialize, Serialize};

/// Options of `dummy.CounterHardware`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterHardwareConfig {
    /// Sample clock in Hz.
    #[serde(default = "default_clock_frequency")]
    pub clock_frequency: f64,
    /// Mean simulated photon rate in counts per second.
    #[serde(default = "default_count_rate")]
    pub count_rate: f64,
    /// Relative amplitude of the simulated fluctuation.
    #[serde(default = "default_noise")]
    pub noise: f64,
}

impl Default for CounterHardwareConfig {
    fn default() -> Self {
        Self {
            clock_frequency: default_clock_frequency(),
            count_rate: default_count_rate(),
            noise: default_noise(),
        }
    }
}

fn default_clock_frequency() -> f64 {
    100.0
}

fn default_count_rate() -> f64 {
    50_000.0
}

fn default_noise() -> f64 {
    0.05
}

/// Options of `dummy.CounterLogic`. Values restored from status variables win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterLogicConfig {
    /// Number of points kept in the trace.
    #[serde(default = "default_count_length")]
    pub count_length: usize,
    /// Sampling frequency requested from the hardware, in Hz.
    #[serde(default = "default_count_frequency")]
    pub count_frequency: f64,
    /// Samples fetched per readout.
    #[serde(default = "default_counting_samples")]
    pub counting_samples: usize,
}

impl Default for CounterLogicConfig {
    fn default() -> Self {
        Self {
            count_length: default_count_length(),
            count_frequency: default_count_frequency(),
            counting_samples: default_counting_samples(),
        }
    }
}

fn default_count_length() -> usize {
    300
}

fn default_count_frequency() -> f64 {
    50.0
}

fn default_counting_samples() -> usize {
    1
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_options_fall_back_to_defaults() {
        let cfg: CounterLogicConfig = serde_json::from_value(json!({"count_length": 10})).unwrap();
        assert_eq!(cfg.count_length, 10);
        assert_eq!(cfg.counting_samples, 1);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let res: Result<CounterHardwareConfig, _> =
            serde_json::from_value(json!({"clock_freq": 10.0}));
        assert!(res.is_err());
    }
}
