use std::collections::VecDeque;

/// O(1) rolling average over a fixed-size window of non-negative volumes.
///
/// Keeps a running sum next to the ring so `average()` never rescans the
/// window. The sum accumulates floating-point error over very long runs;
/// callers owning a context switch (new day, new symbol) should `reset()`.
#[derive(Debug, Clone)]
pub struct VolumeCache {
    window: VecDeque<f64>,
    lookback: usize,
    sum: f64,
}

impl VolumeCache {
    pub fn new(lookback: usize) -> Self {
        assert!(lookback > 0, "lookback must be positive");
        Self {
            window: VecDeque::with_capacity(lookback),
            lookback,
            sum: 0.0,
        }
    }

    /// Push one volume; evicts the oldest sample once the window is full.
    pub fn update(&mut self, volume: f64) {
        debug_assert!(volume >= 0.0, "volumes are non-negative");
        if self.window.len() == self.lookback {
            // Unwrap is fine: len == lookback > 0.
            self.sum -= self.window.pop_front().unwrap();
        }
        self.window.push_back(volume);
        self.sum += volume;
    }

    /// True once at least one sample is present. `average()` is undefined
    /// (returns 0.0) before that.
    pub fn ready(&self) -> bool {
        !self.window.is_empty()
    }

    /// True once the window holds `lookback` samples.
    pub fn full(&self) -> bool {
        self.window.len() == self.lookback
    }

    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.sum / self.window.len() as f64
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.sum = 0.0;
    }
}
