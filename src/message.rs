//! 경매 애플리케이션 메시지 정의
//!
//! 신뢰 채널 위에 실리는 페이로드. 세그먼트 계층(시퀀스/CRC)과 분리되어
//! bincode enum 하나로 직렬화된다.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::auction::AuctionItem;
use crate::registrar::Role;

/// 등록 거절 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// 입찰 마감 이후의 접속
    AuctionClosed,

    /// 구매자 정원 초과
    AuctionFull,
}

/// 입찰 거절 사유
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BidReject {
    /// 시작가 미만이거나 0
    InvalidBid { floor: u64 },

    /// 입찰 창 밖에서의 입찰
    AuctionClosed,
}

/// 경매 결과 통지 (피어별 맞춤)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultNotice {
    /// 판매자: 낙찰
    SellerSold {
        item_name: String,
        clearing_price: u64,
        winner: SocketAddr,
    },

    /// 판매자: 유찰
    SellerUnsold { item_name: String },

    /// 구매자: 낙찰
    Won {
        item_name: String,
        payment: u64,
        seller: SocketAddr,
    },

    /// 구매자: 탈락
    Lost,
}

/// 경매 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AuctionMessage {
    /// 클라이언트 → 서버: 최초 접속 선언
    Join,

    /// 서버 → 클라이언트: 역할 배정 (구매자 번호 포함, 판매자는 0)
    Welcome { role: Role, number: u32 },

    /// 서버 → 클라이언트: 등록 거절
    Rejected { reason: RejectReason },

    /// 판매자 → 서버: 경매 요청
    AuctionRequest { item: AuctionItem },

    /// 서버 → 판매자: 경매 요청 접수
    RequestAccepted,

    /// 서버 → 판매자: 잘못된 경매 요청
    RequestRejected { reason: String },

    /// 서버 → 구매자: 입찰 시작 알림
    BiddingStart { item_name: String, start_price: u64 },

    /// 구매자 → 서버: 입찰
    Bid { amount: u64 },

    /// 서버 → 구매자: 입찰 접수
    BidAccepted { amount: u64 },

    /// 서버 → 구매자: 입찰 거절
    BidRejected { reason: BidReject },

    /// 판매자 → 서버: 조기 마감 요청
    CloseBidding,

    /// 서버 → 피어: 경매 결과
    Result(ResultNotice),
}

impl AuctionMessage {
    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    /// 로그/에러용 메시지 이름
    pub fn kind_name(&self) -> &'static str {
        match self {
            AuctionMessage::Join => "Join",
            AuctionMessage::Welcome { .. } => "Welcome",
            AuctionMessage::Rejected { .. } => "Rejected",
            AuctionMessage::AuctionRequest { .. } => "AuctionRequest",
            AuctionMessage::RequestAccepted => "RequestAccepted",
            AuctionMessage::RequestRejected { .. } => "RequestRejected",
            AuctionMessage::BiddingStart { .. } => "BiddingStart",
            AuctionMessage::Bid { .. } => "Bid",
            AuctionMessage::BidAccepted { .. } => "BidAccepted",
            AuctionMessage::BidRejected { .. } => "BidRejected",
            AuctionMessage::CloseBidding => "CloseBidding",
            AuctionMessage::Result(_) => "Result",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::AuctionType;

    #[test]
    fn test_message_roundtrip() {
        let msg = AuctionMessage::AuctionRequest {
            item: AuctionItem {
                name: "빈티지 카메라".into(),
                start_price: 75,
                auction_type: AuctionType::SecondPrice,
                bid_duration_ms: 5000,
                max_buyers: 3,
            },
        };

        let restored = AuctionMessage::from_bytes(&msg.to_bytes()).unwrap();
        match restored {
            AuctionMessage::AuctionRequest { item } => {
                assert_eq!(item.name, "빈티지 카메라");
                assert_eq!(item.start_price, 75);
                assert_eq!(item.auction_type, AuctionType::SecondPrice);
                assert_eq!(item.max_buyers, 3);
            }
            other => panic!("unexpected message: {}", other.kind_name()),
        }
    }

    #[test]
    fn test_result_notice_roundtrip() {
        let msg = AuctionMessage::Result(ResultNotice::Won {
            item_name: "골동품 시계".into(),
            payment: 120,
            seller: "10.0.0.1:4000".parse().unwrap(),
        });

        let restored = AuctionMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert!(matches!(
            restored,
            AuctionMessage::Result(ResultNotice::Won { payment: 120, .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(AuctionMessage::from_bytes(&[0xFF; 3]).is_none());
    }
}
