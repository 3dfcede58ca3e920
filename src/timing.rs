/// Millisecond timestamps as provided by the platform tick source.
pub type Millis = u64;

/// Cooperative period gate: `exceeded` answers "has the period elapsed since
/// the last reset" and re-arms itself when it fires.
///
/// A fresh counter fires on the first check so that startup work is not
/// delayed by one full period.
#[derive(Debug, Clone, Copy)]
pub struct PeriodCounter {
    period_ms: Millis,
    last_reset: Option<Millis>,
}

impl PeriodCounter {
    pub fn new(period_ms: Millis) -> Self {
        Self {
            period_ms,
            last_reset: None,
        }
    }

    pub fn period_ms(&self) -> Millis {
        self.period_ms
    }

    pub fn set_period(&mut self, period_ms: Millis) {
        self.period_ms = period_ms;
    }

    /// True when the period has elapsed (or the counter never fired before).
    /// Re-arms on a true result.
    pub fn exceeded(&mut self, now: Millis) -> bool {
        match self.last_reset {
            Some(last) if now.saturating_sub(last) < self.period_ms => false,
            _ => {
                self.last_reset = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self, now: Millis) {
        self.last_reset = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_check_fires() {
        let mut counter = PeriodCounter::new(100);
        assert!(counter.exceeded(5));
    }

    #[test]
    fn test_gates_until_period_elapsed() {
        let mut counter = PeriodCounter::new(100);
        assert!(counter.exceeded(0));
        assert!(!counter.exceeded(50));
        assert!(!counter.exceeded(99));
        assert!(counter.exceeded(100));
        assert!(!counter.exceeded(150));
        assert!(counter.exceeded(210));
    }

    #[test]
    fn test_reset_rearms() {
        let mut counter = PeriodCounter::new(100);
        assert!(counter.exceeded(0));
        counter.reset(80);
        assert!(!counter.exceeded(150));
        assert!(counter.exceeded(180));
    }
}
