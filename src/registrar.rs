//! 역할 배정 (Role Registrar)
//!
//! - 서버 수명 동안 최초로 접속한 피어가 판매자
//! - 이후 접속은 모두 구매자 (접속 순서로 번호 부여)
//! - 입찰 마감 이후의 신규 등록은 거절

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// 피어 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Seller,
    Buyer,
}

/// 등록된 피어
#[derive(Debug, Clone)]
pub struct Peer {
    /// 피어 주소
    pub addr: SocketAddr,

    /// 배정된 역할
    pub role: Role,

    /// 구매자 번호 (접속 순서, 판매자는 0)
    pub number: u32,
}

/// 역할 레지스트라
///
/// 판매자 슬롯은 단일 배정이며, 초기화는 서버 실행마다 새 레지스트라를
/// 만드는 것으로만 가능하다.
#[derive(Debug)]
pub struct Registrar {
    seller: Option<SocketAddr>,
    buyers: Vec<SocketAddr>,

    /// 구매자 수 상한 (0 = 무제한)
    buyer_cap: u32,

    closed: bool,
}

impl Registrar {
    /// 새 레지스트라 생성 (경매 한 회분)
    pub fn new() -> Self {
        Self {
            seller: None,
            buyers: Vec::new(),
            buyer_cap: 0,
            closed: false,
        }
    }

    /// 새 주소 등록
    ///
    /// 최초 등록은 판매자, 이후는 구매자. 마감되었거나 구매자 정원이 차면
    /// `AuctionClosed`.
    pub fn register(&mut self, addr: SocketAddr) -> Result<Peer> {
        if self.closed {
            return Err(Error::AuctionClosed);
        }

        if self.seller.is_none() {
            self.seller = Some(addr);
            info!("판매자 연결: {}", addr);
            return Ok(Peer {
                addr,
                role: Role::Seller,
                number: 0,
            });
        }

        if self.buyer_cap > 0 && self.buyers.len() as u32 >= self.buyer_cap {
            info!("구매자 정원 초과, 등록 거절: {}", addr);
            return Err(Error::AuctionClosed);
        }

        self.buyers.push(addr);
        let number = self.buyers.len() as u32;
        info!("구매자 {} 연결: {}", number, addr);

        Ok(Peer {
            addr,
            role: Role::Buyer,
            number,
        })
    }

    /// 구매자 정원 설정 (경매 요청의 `max_buyers`)
    pub fn set_buyer_cap(&mut self, cap: u32) {
        self.buyer_cap = cap;
    }

    /// 신규 등록 차단 (입찰 마감 시점)
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// 판매자 주소
    pub fn seller_addr(&self) -> Option<SocketAddr> {
        self.seller
    }

    /// 등록된 전체 피어 수 (판매자 포함)
    pub fn peer_count(&self) -> usize {
        self.buyers.len() + usize::from(self.seller.is_some())
    }

    /// 등록된 구매자 수
    pub fn buyer_count(&self) -> usize {
        self.buyers.len()
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}
