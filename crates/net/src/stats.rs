use std::fmt;

/// Point-in-time view of one link's reliability counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub packets_acked: u32,
    pub rtt_ms: f32,
    /// kbps
    pub sent_bandwidth: f32,
    /// kbps
    pub acked_bandwidth: f32,
    pub packet_loss_percent: f32,
}

impl LinkStats {
    pub fn from_counters(
        sent: u32,
        received: u32,
        lost: u32,
        acked: u32,
        rtt: f32,
        sent_bandwidth: f32,
        acked_bandwidth: f32,
    ) -> Self {
        let packet_loss_percent = if sent > 0 {
            lost as f32 / sent as f32 * 100.0
        } else {
            0.0
        };

        Self {
            packets_sent: sent,
            packets_received: received,
            packets_lost: lost,
            packets_acked: acked,
            rtt_ms: rtt * 1000.0,
            sent_bandwidth,
            acked_bandwidth,
            packet_loss_percent,
        }
    }
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rtt {:.1}ms, sent {}, recv {}, acked {}, lost {} ({:.1}%), sent {:.1}kbps, acked {:.1}kbps",
            self.rtt_ms,
            self.packets_sent,
            self.packets_received,
            self.packets_acked,
            self.packets_lost,
            self.packet_loss_percent,
            self.sent_bandwidth,
            self.acked_bandwidth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loss_percent() {
        let stats = LinkStats::from_counters(200, 190, 10, 180, 0.05, 12.0, 11.0);
        assert!((stats.packet_loss_percent - 5.0).abs() < 0.001);
        assert!((stats.rtt_ms - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_no_traffic() {
        let stats = LinkStats::from_counters(0, 0, 0, 0, 0.0, 0.0, 0.0);
        assert_eq!(stats, LinkStats::default());
    }
}
