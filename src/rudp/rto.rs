use std::time::Duration;

use crate::config;

/// Jacobson/Karn retransmission timeout estimator.
///
/// `srtt = (1-α)·srtt + α·rtt`, `rttvar = (1-β)·rttvar + β·|srtt-rtt|`,
/// `rto = srtt + 4·rttvar`, α = 1/8, β = 1/4, clamped to the configured
/// bounds.  Karn's rule is the caller's duty: samples from
/// retransmitted packets are never fed in.
#[derive(Debug)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
}

impl Default for RtoEstimator {
    fn default() -> Self {
        Self::new(
            config::RUDP_INITIAL_RTO,
            config::RUDP_MIN_RTO,
            config::RUDP_MAX_RTO,
        )
    }
}

impl RtoEstimator {
    pub fn new(initial: Duration, min: Duration, max: Duration) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial.clamp(min, max),
            min,
            max,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn on_sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = self.rttvar * 3 / 4 + delta / 4;
                self.srtt = Some(srtt * 7 / 8 + rtt / 8);
            }
        }

        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min, self.max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_the_initial_value() {
        let rto = RtoEstimator::default();
        assert_eq!(rto.rto(), Duration::from_millis(500));
    }

    #[test]
    fn steady_samples_converge() {
        let mut rto = RtoEstimator::default();
        for _ in 0..100 {
            rto.on_sample(Duration::from_millis(50));
        }

        // srtt ~= 50ms, rttvar decays toward zero: clamped at the floor.
        assert_eq!(rto.rto(), Duration::from_millis(100));
    }

    #[test]
    fn spikes_raise_the_timeout() {
        let mut rto = RtoEstimator::default();
        rto.on_sample(Duration::from_millis(50));
        let calm = rto.rto();

        rto.on_sample(Duration::from_millis(800));
        assert!(rto.rto() > calm);
    }

    #[test]
    fn clamped_to_the_ceiling() {
        let mut rto = RtoEstimator::default();
        for _ in 0..10 {
            rto.on_sample(Duration::from_secs(30));
        }

        assert_eq!(rto.rto(), Duration::from_secs(5));
    }
}
