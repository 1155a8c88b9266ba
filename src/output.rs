//! Output specifications and target normalization.

use std::path::PathBuf;

/// Sampling target of a single output file.
///
/// Conversions between counts and rates consume one variant and produce
/// another, so "already converted" is a fact of the type rather than a
/// runtime flag, and a spec is never converted twice in one run.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleTarget {
    /// Copy every line. Reserved for one output per run.
    All,
    /// Bernoulli sampling probability in (0, 1].
    Rate(f64),
    /// Absolute target line count, greater than zero.
    Count(u64),
}

impl SampleTarget {
    /// Expresses a count target as a rate against the total line estimate.
    /// Rate and all targets pass through unchanged.
    pub fn into_rate(self, total_lines: f64) -> SampleTarget {
        match self {
            SampleTarget::Count(count) => SampleTarget::Rate((count as f64 / total_lines).min(1.0)),
            other => other,
        }
    }

    /// Expresses a rate target as an absolute count against the total line
    /// estimate. The reserved "all" rate of 1.0 is never converted; count
    /// and all targets pass through unchanged.
    pub fn into_count(self, total_lines: f64) -> SampleTarget {
        match self {
            SampleTarget::Rate(rate) if rate < 1.0 => {
                SampleTarget::Count((rate * total_lines).round() as u64)
            }
            other => other,
        }
    }

    /// Per-line sampling probability, when the target is expressed as one.
    /// `All` copies unconditionally.
    pub fn rate(&self) -> Option<f64> {
        match *self {
            SampleTarget::All => Some(1.0),
            SampleTarget::Rate(rate) => Some(rate),
            SampleTarget::Count(_) => None,
        }
    }

    /// Absolute target line count, when the target is expressed as one.
    pub fn count(&self) -> Option<u64> {
        match *self {
            SampleTarget::Count(count) => Some(count),
            _ => None,
        }
    }

    /// Whether this target keeps every line. An explicit rate of 1.0 is
    /// indistinguishable from "all".
    pub fn is_all(&self) -> bool {
        match *self {
            SampleTarget::All => true,
            SampleTarget::Rate(rate) => rate >= 1.0,
            SampleTarget::Count(_) => false,
        }
    }
}

/// A single output file and its sampling target.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub path: PathBuf,
    pub target: SampleTarget,
}

impl OutputSpec {
    pub fn new(path: impl Into<PathBuf>, target: SampleTarget) -> Self {
        OutputSpec {
            path: path.into(),
            target,
        }
    }
}

/// Parses a sampling rate: a probability in (0, 1] or a percent value in
/// (0, 100] with a trailing `%`.
pub fn parse_rate(value: &str) -> Result<f64, String> {
    let (number, percent) = match value.strip_suffix('%') {
        Some(number) => (number, true),
        None => (value, false),
    };

    let parsed: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid rate `{}'", value))?;
    let rate = if percent { parsed / 100.0 } else { parsed };

    if !rate.is_finite() || rate <= 0.0 || rate > 1.0 {
        return Err(format!("rate `{}' is out of range", value));
    }

    return Ok(rate);
}

/// Parses a positive decimal number, for target line counts and the
/// interleaving factor.
pub fn parse_count(value: &str) -> Result<u64, String> {
    match value.trim().parse::<u64>() {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(format!("invalid number `{}'", value)),
    }
}
