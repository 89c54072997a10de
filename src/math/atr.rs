use crate::data::domain::Candle;

/// Average True Range over the trailing `period` completed candles.
///
/// Uses the simple (Wilder-free) mean of true ranges, which is what the
/// trailing-stop logic scales by. Returns `None` until `period + 1` candles
/// are available (the first TR needs a previous close).
pub fn average_true_range(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let tail = &candles[candles.len() - (period + 1)..];
    let sum: f64 = tail
        .windows(2)
        .map(|pair| pair[1].true_range(pair[0].close))
        .sum();
    Some(sum / period as f64)
}
