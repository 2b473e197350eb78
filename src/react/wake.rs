//! 唤醒策略：根据上一回合的结果决定下次睡多久

use std::time::Duration;

use crate::react::TurnOutcome;

pub trait WakePolicy: Send {
    fn next_sleep(&mut self, outcome: &TurnOutcome) -> Duration;
}

/// 固定间隔
#[derive(Debug, Clone, Copy)]
pub struct FixedWake(pub Duration);

impl WakePolicy for FixedWake {
    fn next_sleep(&mut self, _outcome: &TurnOutcome) -> Duration {
        self.0
    }
}

/// 自适应：执行过工具就立即继续；空闲时从 base 开始翻倍，直到 max
#[derive(Debug, Clone)]
pub struct AdaptiveWake {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl AdaptiveWake {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }
}

impl WakePolicy for AdaptiveWake {
    fn next_sleep(&mut self, outcome: &TurnOutcome) -> Duration {
        if outcome.acted {
            self.current = self.base;
            return Duration::ZERO;
        }
        let sleep = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        sleep
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(acted: bool) -> TurnOutcome {
        TurnOutcome {
            acted,
            ..TurnOutcome::default()
        }
    }

    #[test]
    fn test_adaptive_backs_off_while_idle() {
        let mut wake = AdaptiveWake::new(Duration::from_secs(60), Duration::from_secs(200));
        assert_eq!(wake.next_sleep(&outcome(false)), Duration::from_secs(60));
        assert_eq!(wake.next_sleep(&outcome(false)), Duration::from_secs(120));
        assert_eq!(wake.next_sleep(&outcome(false)), Duration::from_secs(200));
        assert_eq!(wake.next_sleep(&outcome(false)), Duration::from_secs(200));
        assert_eq!(wake.next_sleep(&outcome(true)), Duration::ZERO);
        assert_eq!(wake.next_sleep(&outcome(false)), Duration::from_secs(60));
    }

    #[test]
    fn test_fixed() {
        let mut wake = FixedWake(Duration::from_secs(5));
        assert_eq!(wake.next_sleep(&outcome(true)), Duration::from_secs(5));
    }
}
