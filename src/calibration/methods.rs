// src/calibration/methods.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::QuantizeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CalibrationMethod {
    /// Observed min/max, optionally as a moving average across batches.
    #[default]
    MinMax,

    /// KL-divergence optimal clipping threshold from a histogram.
    Entropy,

    /// Clip to a percentile of the histogram's cumulative distribution.
    Percentile,
}

impl CalibrationMethod {
    /// Histogram bin count used when none is configured.
    pub fn default_num_bins(self) -> usize {
        match self {
            CalibrationMethod::MinMax => 0,
            CalibrationMethod::Entropy => 128,
            CalibrationMethod::Percentile => 2048,
        }
    }

    pub fn uses_histogram(self) -> bool {
        !matches!(self, CalibrationMethod::MinMax)
    }
}

impl fmt::Display for CalibrationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationMethod::MinMax => write!(f, "MinMax"),
            CalibrationMethod::Entropy => write!(f, "Entropy"),
            CalibrationMethod::Percentile => write!(f, "Percentile"),
        }
    }
}

impl FromStr for CalibrationMethod {
    type Err = QuantizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "minmax" => Ok(CalibrationMethod::MinMax),
            "entropy" => Ok(CalibrationMethod::Entropy),
            "percentile" => Ok(CalibrationMethod::Percentile),
            _ => Err(QuantizeError::Configuration {
                reason: format!(
                    "Unknown calibration method: '{}'. Valid methods: minmax, entropy, percentile",
                    s
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("MinMax".parse::<CalibrationMethod>().unwrap(), CalibrationMethod::MinMax);
        assert_eq!("ENTROPY".parse::<CalibrationMethod>().unwrap(), CalibrationMethod::Entropy);
        assert_eq!("percentile".parse::<CalibrationMethod>().unwrap(), CalibrationMethod::Percentile);
    }

    #[test]
    fn test_parse_unknown_method() {
        let err = "mse".parse::<CalibrationMethod>().unwrap_err();
        assert!(matches!(err, QuantizeError::Configuration { .. }));
    }

    #[test]
    fn test_display_round_trips() {
        for m in [CalibrationMethod::MinMax, CalibrationMethod::Entropy, CalibrationMethod::Percentile] {
            assert_eq!(m.to_string().parse::<CalibrationMethod>().unwrap(), m);
        }
    }
}
