use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_resent: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub rtt_ms: f32,
    pub rtt_variance: f32,
}

impl NetworkStats {
    pub fn resend_percent(&self) -> f32 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_resent as f32 / self.packets_sent as f32 * 100.0
    }
}

/// Smoothed round trip time, updated from guaranteed-channel acks.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self {
            srtt: 100.0,
            rtt_var: 50.0,
        }
    }
}

impl RttEstimator {
    pub fn update(&mut self, sample: Duration) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let rtt = sample.as_secs_f32() * 1000.0;
        let diff = (rtt - self.srtt).abs();
        self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
        self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
    }

    pub fn srtt(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var(&self) -> f32 {
        self.rtt_var
    }

    /// Retransmission timeout, never shorter than `floor`.
    pub fn resend_timeout(&self, floor: Duration) -> Duration {
        let rto = Duration::from_secs_f32((self.srtt + 4.0 * self.rtt_var).max(0.0) / 1000.0);
        rto.max(floor)
    }
}
