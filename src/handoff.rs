//! 파일 핸드오프 (낙찰 후 아이템 상세 전달)
//!
//! - `Start { total_size }` → `Chunk` 반복 → `Fin` 프레이밍
//! - 청크 i가 ACK되기 전에는 i+1을 보내지 않음 (stop-and-wait가 보장)
//! - 재조립은 도착 순서 그대로, `Fin`에서 바이트 수 검증

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::ReliableChannel;
use crate::{Error, Result};

/// 핸드오프 프레임
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandoffFrame {
    /// 전송 시작 (전체 크기 예고)
    Start { total_size: u64 },

    /// 데이터 청크
    Chunk(Vec<u8>),

    /// 전송 종료 표시
    Fin,
}

impl HandoffFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    fn name(&self) -> &'static str {
        match self {
            HandoffFrame::Start { .. } => "Start",
            HandoffFrame::Chunk(_) => "Chunk",
            HandoffFrame::Fin => "Fin",
        }
    }
}

async fn send_frame(channel: &mut ReliableChannel, frame: &HandoffFrame) -> Result<()> {
    channel.send(frame.to_bytes().into()).await
}

async fn recv_frame(channel: &mut ReliableChannel) -> Result<HandoffFrame> {
    loop {
        let payload = channel.recv().await?;
        match HandoffFrame::from_bytes(&payload) {
            Some(frame) => return Ok(frame),
            // 마감 직후 잔류한 경매 메시지 등은 건너뛴다
            None => debug!("핸드오프 프레임이 아닌 페이로드 무시: {} bytes", payload.len()),
        }
    }
}

/// 페이로드 전체를 청크 단위로 전송
///
/// 각 청크는 stop-and-wait 채널로 순서대로 전송되며, 실패 시
/// `PeerUnresponsive`가 그대로 전파된다.
pub async fn send_payload(
    channel: &mut ReliableChannel,
    payload: &[u8],
    chunk_size: usize,
) -> Result<()> {
    let chunk_size = chunk_size.max(1);
    let total_size = payload.len() as u64;

    info!(
        "핸드오프 송신 시작: {} bytes, {} 청크 → {}",
        total_size,
        payload.len().div_ceil(chunk_size),
        channel.peer()
    );

    send_frame(channel, &HandoffFrame::Start { total_size }).await?;

    for (idx, chunk) in payload.chunks(chunk_size).enumerate() {
        send_frame(channel, &HandoffFrame::Chunk(chunk.to_vec())).await?;
        debug!("청크 {} 전송 완료 ({} bytes)", idx, chunk.len());
    }

    send_frame(channel, &HandoffFrame::Fin).await?;
    info!("핸드오프 송신 종료: {} bytes", total_size);
    Ok(())
}

/// 청크를 도착 순서대로 재조립해 전체 페이로드 수신
///
/// `Fin`에서 예고된 크기와 수신량이 다르면 `HandoffIncomplete`.
pub async fn recv_payload(channel: &mut ReliableChannel) -> Result<Vec<u8>> {
    let total_size = match recv_frame(channel).await? {
        HandoffFrame::Start { total_size } => total_size,
        other => {
            return Err(Error::UnexpectedMessage {
                expected: "Start".into(),
                got: other.name().into(),
            })
        }
    };

    info!("핸드오프 수신 시작: {} bytes 예상", total_size);
    let mut buffer = BytesMut::with_capacity(total_size as usize);

    loop {
        match recv_frame(channel).await? {
            HandoffFrame::Chunk(chunk) => {
                buffer.extend_from_slice(&chunk);
            }
            HandoffFrame::Fin => break,
            HandoffFrame::Start { .. } => {
                return Err(Error::UnexpectedMessage {
                    expected: "Chunk | Fin".into(),
                    got: "Start".into(),
                })
            }
        }
    }

    if buffer.len() as u64 != total_size {
        return Err(Error::HandoffIncomplete {
            expected: total_size,
            got: buffer.len() as u64,
        });
    }

    info!("핸드오프 수신 종료: {} bytes", buffer.len());
    Ok(buffer.to_vec())
}

/// 판매자 채널 → 낙찰자 채널 프레임 릴레이
///
/// 프레임 단위로 중계하므로 양쪽 모두 stop-and-wait 보장을 유지한다.
/// 옮긴 데이터 바이트 수를 반환.
pub async fn relay(
    src: &mut ReliableChannel,
    dst: &mut ReliableChannel,
) -> Result<u64> {
    let start = recv_frame(src).await?;
    let total_size = match start {
        HandoffFrame::Start { total_size } => total_size,
        other => {
            return Err(Error::UnexpectedMessage {
                expected: "Start".into(),
                got: other.name().into(),
            })
        }
    };
    send_frame(dst, &start).await?;

    let mut moved = 0u64;
    loop {
        let frame = recv_frame(src).await?;
        match &frame {
            HandoffFrame::Chunk(chunk) => moved += chunk.len() as u64,
            HandoffFrame::Fin => {
                send_frame(dst, &frame).await?;
                break;
            }
            HandoffFrame::Start { .. } => {
                return Err(Error::UnexpectedMessage {
                    expected: "Chunk | Fin".into(),
                    got: "Start".into(),
                })
            }
        }
        send_frame(dst, &frame).await?;
    }

    if moved != total_size {
        warn!("릴레이 크기 불일치: 예고 {} / 실제 {}", total_size, moved);
    }
    info!("릴레이 완료: {} bytes ({} → {})", moved, src.peer(), dst.peer());
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = HandoffFrame::Chunk(vec![1, 2, 3]);
        let restored = HandoffFrame::from_bytes(&frame.to_bytes()).unwrap();
        assert!(matches!(restored, HandoffFrame::Chunk(data) if data == vec![1, 2, 3]));

        let fin = HandoffFrame::from_bytes(&HandoffFrame::Fin.to_bytes()).unwrap();
        assert!(matches!(fin, HandoffFrame::Fin));
    }

    #[test]
    fn test_start_frame_carries_size() {
        let frame = HandoffFrame::Start { total_size: 987_654 };
        match HandoffFrame::from_bytes(&frame.to_bytes()).unwrap() {
            HandoffFrame::Start { total_size } => assert_eq!(total_size, 987_654),
            other => panic!("unexpected frame: {}", other.name()),
        }
    }
}
