//! 채널 전송 통계

/// 채널별 송수신 카운터
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// 최초 전송한 DATA 세그먼트 수
    pub data_sent: u64,

    /// 재전송 수
    pub retransmits: u64,

    /// 송신한 ACK 수
    pub acks_sent: u64,

    /// 수신한 유효 ACK 수
    pub acks_received: u64,

    /// 중복으로 버린 DATA 세그먼트 수 (재ACK만 송신)
    pub duplicates: u64,

    /// 애플리케이션에 전달한 페이로드 수
    pub delivered: u64,

    /// 시뮬레이션 손실로 버린 수신 세그먼트 수
    pub simulated_drops: u64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 전송 대비 재전송 비율
    pub fn retransmit_ratio(&self) -> f64 {
        if self.data_sent == 0 {
            return 0.0;
        }
        self.retransmits as f64 / self.data_sent as f64
    }

    /// 로그 출력용 한 줄 요약
    pub fn summary(&self) -> String {
        format!(
            "sent={} retx={} delivered={} dup={} ack_tx={} ack_rx={}",
            self.data_sent,
            self.retransmits,
            self.delivered,
            self.duplicates,
            self.acks_sent,
            self.acks_received,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmit_ratio() {
        let mut stats = ChannelStats::new();
        assert_eq!(stats.retransmit_ratio(), 0.0);

        stats.data_sent = 10;
        stats.retransmits = 5;
        assert!((stats.retransmit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
