use serde::{Deserialize, Serialize};

/// How the broker derives the spread it quotes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpreadPolicy {
    /// Use the bid/ask carried by each tick unchanged.
    #[default]
    FromTick,
    /// Replace the tick spread with a fixed width in points, applied
    /// symmetrically around the tick mid-price.
    FixedPoints(f64),
}

impl SpreadPolicy {
    /// Effective `(bid, ask)` for a raw quote. `point` converts the fixed
    /// width into price units.
    pub fn apply(&self, bid: f64, ask: f64, point: f64) -> (f64, f64) {
        match self {
            Self::FromTick => (bid, ask),
            Self::FixedPoints(points) => {
                let mid = (bid + ask) / 2.0;
                let half = points * point / 2.0;
                (mid - half, mid + half)
            }
        }
    }
}

/// Adverse fill-price adjustment applied to market orders.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlippagePolicy {
    pub enabled: bool,
    /// Flat slippage in points.
    pub base_points: f64,
    /// Additional points per lot, modelling size impact.
    pub volume_factor: f64,
}

impl Default for SlippagePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            base_points: 0.0,
            volume_factor: 0.0,
        }
    }
}

impl SlippagePolicy {
    pub fn slippage_points(&self, volume: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.base_points + self.volume_factor * volume
    }
}
