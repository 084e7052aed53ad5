//! 신뢰 데이터그램 채널 (stop-and-wait ARQ)
//!
//! - 전송 중 세그먼트는 항상 1개 (윈도우 크기 1)
//! - DATA 송신 후 같은 비트의 ACK이 올 때까지 타임아웃 재전송
//! - 중복 DATA는 재ACK만 하고 전달하지 않음
//! - 경매 의미론 없음: 불투명 페이로드만 운반

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::segment::{Segment, SegmentKind, SeqBit};
use crate::stats::ChannelStats;
use crate::{Config, Error, Result};

/// 피어 한 명과의 신뢰 채널
///
/// `outbound`는 공유 소켓으로 흘러가는 송신 큐, `inbound`는 소스 주소 기준으로
/// 역다중화된 수신 큐다. 같은 형태로 소켓 없이 메모리 링크에도 연결된다.
pub struct ReliableChannel {
    peer: SocketAddr,
    outbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    inbound: mpsc::Receiver<Segment>,

    /// 다음 DATA 송신에 쓸 비트
    send_bit: SeqBit,

    /// 다음에 수신해야 할 비트. 반대 비트는 이미 전달된 세그먼트의 중복
    recv_expected: SeqBit,

    /// ACK 대기 중 도착한 DATA를 보관하는 전달 대기열
    pending: VecDeque<Bytes>,

    config: Config,
    stats: ChannelStats,
}

impl ReliableChannel {
    /// 새 채널 생성
    pub fn new(
        peer: SocketAddr,
        outbound: mpsc::Sender<(Vec<u8>, SocketAddr)>,
        inbound: mpsc::Receiver<Segment>,
        config: Config,
    ) -> Self {
        Self {
            peer,
            outbound,
            inbound,
            send_bit: SeqBit::Zero,
            recv_expected: SeqBit::Zero,
            pending: VecDeque::new(),
            config,
            stats: ChannelStats::new(),
        }
    }

    /// 상대 피어 주소
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// 누적 통계
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// 페이로드 전송
    ///
    /// 같은 비트의 ACK이 도착할 때까지 대기하며, 타임아웃마다 동일 세그먼트를
    /// 재전송한다. `max_retries`를 초과하면 `PeerUnresponsive`.
    /// 대기 중 도착한 DATA는 수신 규칙대로 처리되어 이후 `recv()`로 전달된다.
    pub async fn send(&mut self, payload: Bytes) -> Result<()> {
        if payload.len() > self.config.max_payload {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload,
            });
        }

        let segment = Segment::data(self.send_bit, payload);
        let bytes = segment.to_bytes();

        self.transmit(&bytes).await?;
        self.stats.data_sent += 1;

        let rto = self.config.retransmit_timeout();
        let mut deadline = tokio::time::Instant::now() + rto;
        let mut retries = 0u32;

        loop {
            match tokio::time::timeout_at(deadline, self.next_segment()).await {
                Ok(Some(incoming)) => match incoming.kind {
                    SegmentKind::Ack if incoming.seq == self.send_bit => {
                        self.stats.acks_received += 1;
                        self.send_bit = self.send_bit.flip();
                        return Ok(());
                    }
                    SegmentKind::Ack => {
                        // 이전 세그먼트의 늦은 ACK: 무시
                        debug!("stale ACK 무시: {:?} from {}", incoming.seq, self.peer);
                    }
                    SegmentKind::Data => {
                        self.accept_data(incoming).await?;
                    }
                },
                Ok(None) => return Err(Error::ChannelClosed),
                Err(_) => {
                    if retries >= self.config.max_retries {
                        warn!(
                            "피어 무응답: {} (seq {:?}, {}회 전송)",
                            self.peer,
                            segment.seq,
                            retries + 1
                        );
                        return Err(Error::PeerUnresponsive {
                            peer: self.peer,
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    self.stats.retransmits += 1;
                    debug!("재전송 {}/{}: seq {:?} → {}", retries, self.config.max_retries, segment.seq, self.peer);
                    self.transmit(&bytes).await?;
                    deadline = tokio::time::Instant::now() + rto;
                }
            }
        }
    }

    /// 다음 순서의 페이로드 수신
    ///
    /// `recv_timeout` 동안 아무것도 전달되지 않으면 `PeerUnresponsive`
    /// (attempts 0 = 수신 대기 만료).
    pub async fn recv(&mut self) -> Result<Bytes> {
        let timeout = self.config.recv_timeout();
        match self.try_recv_for(timeout).await? {
            Some(payload) => Ok(payload),
            None => Err(Error::PeerUnresponsive {
                peer: self.peer,
                attempts: 0,
            }),
        }
    }

    /// 제한 시간 내 수신 시도
    ///
    /// 시간 내 전달할 페이로드가 없으면 `Ok(None)`. 중복/손상/ACK 세그먼트는
    /// 소비하되 전달하지 않는다.
    pub async fn try_recv_for(&mut self, dur: Duration) -> Result<Option<Bytes>> {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(Some(payload));
        }

        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let incoming = match tokio::time::timeout_at(deadline, self.next_segment()).await {
                Ok(Some(segment)) => segment,
                Ok(None) => return Err(Error::ChannelClosed),
                Err(_) => return Ok(None),
            };

            match incoming.kind {
                SegmentKind::Data => {
                    self.accept_data(incoming).await?;
                    if let Some(payload) = self.pending.pop_front() {
                        return Ok(Some(payload));
                    }
                }
                SegmentKind::Ack => {
                    // 지난 송신의 늦은 ACK: 무시
                    debug!("stale ACK 무시: {:?} from {}", incoming.seq, self.peer);
                }
            }
        }
    }

    /// 수신 큐에서 다음 세그먼트를 꺼냄 (손실 시뮬레이션 적용)
    async fn next_segment(&mut self) -> Option<Segment> {
        loop {
            let segment = self.inbound.recv().await?;

            if self.config.loss_rate > 0.0
                && rand::thread_rng().gen_bool(self.config.loss_rate.clamp(0.0, 1.0))
            {
                self.stats.simulated_drops += 1;
                debug!("수신 드롭 (시뮬레이션): {:?} {:?}", segment.kind, segment.seq);
                continue;
            }

            return Some(segment);
        }
    }

    /// DATA 세그먼트 수신 규칙
    ///
    /// 전달 기록을 먼저 갱신한 뒤 ACK을 보낸다. ACK이 유실되면 송신측
    /// 재전송이 중복 경로로 흡수된다.
    async fn accept_data(&mut self, segment: Segment) -> Result<()> {
        let seq = segment.seq;

        if seq == self.recv_expected {
            self.recv_expected = self.recv_expected.flip();
            self.pending.push_back(segment.payload);
            self.stats.delivered += 1;
            self.send_ack(seq).await?;
        } else {
            // 이미 전달된 세그먼트의 중복: 재ACK만
            self.stats.duplicates += 1;
            debug!("중복 DATA 재ACK: {:?} from {}", seq, self.peer);
            self.send_ack(seq).await?;
        }

        Ok(())
    }

    async fn send_ack(&mut self, seq: SeqBit) -> Result<()> {
        let bytes = Segment::ack(seq).to_bytes();
        self.stats.acks_sent += 1;
        self.transmit(&bytes).await
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<()> {
        self.outbound
            .send((bytes.to_vec(), self.peer))
            .await
            .map_err(|_| Error::ChannelClosed)
    }
}
