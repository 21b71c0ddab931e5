//! Series trend detection and trend agreement checks.

use statrs::statistics::{Data, Distribution};

use crate::models::event::Trend;

/// Derives the trend of a series by comparing the means of its first and
/// second halves: strictly less means rise, strictly greater means fall.
pub fn series_trend(hist_data: &[f64]) -> Trend {
    if hist_data.len() < 2 {
        return Trend::Default;
    }
    let win_len = hist_data.len() / 2;
    let first = Data::new(hist_data[..win_len].to_vec());
    let second = Data::new(hist_data[win_len..].to_vec());
    match (first.mean(), second.mean()) {
        (Some(a), Some(b)) if a < b => Trend::Rise,
        (Some(a), Some(b)) if a > b => Trend::Fall,
        _ => Trend::Default,
    }
}

/// A metric satisfies the expected trend unless both sides are known,
/// non-default, and disagree.
pub fn check_trend(expect: Option<Trend>, real: Option<Trend>) -> bool {
    match (expect, real) {
        (Some(e), Some(r)) => {
            e == Trend::Default || r == Trend::Default || e == r
        }
        _ => true,
    }
}
