use std::f64::consts::LN_10;

/// Linear/log-domain probability conversions in a fixed host log base.
///
/// Model files store log10 values; they are converted once at load time and
/// every probability the engine hands out is expressed in this base. Keeping
/// all conversions behind one struct keeps the numerics from drifting between
/// the loader, the query paths and the smear computation.
#[derive(Debug, Clone)]
pub struct LogMath {
    log_base: f64,
    ln_base: f64,
}

impl LogMath {
    /// Log of probability 1.0, in any base.
    pub const LOG_ONE: f32 = 0.0;

    pub fn new(log_base: f64) -> LogMath {
        assert!(log_base > 1.0, "log base must be greater than 1.0");
        LogMath {
            log_base,
            ln_base: log_base.ln(),
        }
    }

    pub fn log_base(&self) -> f64 {
        self.log_base
    }

    /// Converts a log10 value into the host base.
    pub fn log10_to_log(&self, log10: f32) -> f32 {
        (f64::from(log10) * LN_10 / self.ln_base) as f32
    }

    /// Converts a linear value into the log domain. Zero maps to `-inf`.
    pub fn linear_to_log(&self, linear: f64) -> f32 {
        (linear.ln() / self.ln_base) as f32
    }

    /// Converts a log value back into the linear domain.
    pub fn log_to_linear(&self, log: f32) -> f64 {
        (f64::from(log) * self.ln_base).exp()
    }

    /// Adds two log-domain values as if they were linear, i.e. computes
    /// `log(base^a + base^b)` without leaving the log domain for long.
    pub fn add_as_linear(&self, a: f32, b: f32) -> f32 {
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        if lo == f32::NEG_INFINITY {
            return hi;
        }
        let ratio = (f64::from(lo - hi) * self.ln_base).exp();
        hi + (ratio.ln_1p() / self.ln_base) as f32
    }
}

impl Default for LogMath {
    /// The base the host recognizer historically runs its search in.
    fn default() -> LogMath {
        LogMath::new(1.0001)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log10_conversion_matches_linear_conversion() {
        let log_math = LogMath::default();
        let from_log10 = log_math.log10_to_log(-1.0);
        let from_linear = log_math.linear_to_log(0.1);
        assert!((from_log10 - from_linear).abs() < 1e-2);
    }

    #[test]
    fn linear_round_trip() {
        let log_math = LogMath::default();
        for &value in &[1.0, 0.5, 0.125, 1e-6] {
            let log = log_math.linear_to_log(value);
            let back = log_math.log_to_linear(log);
            assert!((back - value).abs() / value < 1e-5, "{value} -> {log} -> {back}");
        }
    }

    #[test]
    fn zero_maps_to_negative_infinity() {
        let log_math = LogMath::default();
        assert_eq!(log_math.linear_to_log(0.0), f32::NEG_INFINITY);
        assert_eq!(log_math.log_to_linear(f32::NEG_INFINITY), 0.0);
    }

    #[test]
    fn add_as_linear_adds_probabilities() {
        let log_math = LogMath::default();
        let quarter = log_math.linear_to_log(0.25);
        let half = log_math.add_as_linear(quarter, quarter);
        assert!((log_math.log_to_linear(half) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn add_as_linear_ignores_log_zero() {
        let log_math = LogMath::default();
        let p = log_math.linear_to_log(0.3);
        assert_eq!(log_math.add_as_linear(p, f32::NEG_INFINITY), p);
        assert_eq!(log_math.add_as_linear(f32::NEG_INFINITY, p), p);
    }

    #[test]
    fn log_one_is_identity() {
        let log_math = LogMath::default();
        assert_eq!(log_math.log_to_linear(LogMath::LOG_ONE), 1.0);
    }
}
