//! 에러 타입 정의

use std::net::SocketAddr;

use thiserror::Error;

/// RAP 프로토콜 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("피어 무응답: {peer} ({attempts}회 전송 후 포기)")]
    PeerUnresponsive { peer: SocketAddr, attempts: u32 },

    #[error("페이로드 크기 초과: {len} > 최대 {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("유효하지 않은 입찰: ${amount} (최저 ${floor})")]
    InvalidBid { amount: u64, floor: u64 },

    #[error("경매 마감: 입찰/등록 불가")]
    AuctionClosed,

    #[error("유효하지 않은 경매 요청: {reason}")]
    InvalidAuctionRequest { reason: String },

    #[error("메시지 타입 불일치: expected {expected}, got {got}")]
    UnexpectedMessage { expected: String, got: String },

    #[error("전송 불완전: expected {expected} bytes, got {got}")]
    HandoffIncomplete { expected: u64, got: u64 },

    #[error("채널 종료")]
    ChannelClosed,

    #[error("알 수 없는 에러: {0}")]
    Unknown(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
