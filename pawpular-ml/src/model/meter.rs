//! Running averages and elapsed-time formatting for progress logs.

use std::time::Instant;

/// Computes and stores the average and current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `val` observed over `n` items.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

/// `"{m}m {s}s"`.
pub fn as_minutes(secs: f64) -> String {
    let m = (secs / 60.0).floor();
    let s = secs - m * 60.0;
    format!("{}m {}s", m as u64, s as u64)
}

/// Elapsed time and the projected remainder given `fraction` done.
pub fn time_since(since: Instant, fraction: f64) -> String {
    let elapsed = since.elapsed().as_secs_f64();
    let total = if fraction > 0.0 { elapsed / fraction } else { elapsed };
    format!(
        "{} (remain {})",
        as_minutes(elapsed),
        as_minutes((total - elapsed).max(0.0))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 3);
        meter.update(2.0, 1);
        assert_eq!(meter.val, 2.0);
        assert_eq!(meter.count, 4);
        assert!((meter.avg - 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_as_minutes() {
        assert_eq!(as_minutes(0.0), "0m 0s");
        assert_eq!(as_minutes(125.7), "2m 5s");
    }
}
