//! 경매 코디네이터 상태 기계
//!
//! `AwaitingItem → BiddingOpen → BiddingClosed → ResultAnnounced → Done`
//!
//! - 입찰 검증과 낙찰 계산은 여기서만 수행 (피어별 태스크는 락으로 직렬화)
//! - 구매자별 최신 유효 입찰만 유효 (이전 입찰을 대체)
//! - 동점은 먼저 도착한 입찰이 승리

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, Result};

/// 경매 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuctionType {
    /// 낙찰가 = 최고 입찰액
    FirstPrice,

    /// 낙찰가 = 두 번째로 높은 유효 입찰액 (Vickrey)
    SecondPrice,
}

/// 경매 진행 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    AwaitingItem,
    BiddingOpen,
    BiddingClosed,
    ResultAnnounced,
    Done,
}

/// 판매자가 제출하는 경매 아이템
///
/// 입찰 시작 이후에는 변경되지 않는다
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionItem {
    /// 아이템 이름
    pub name: String,

    /// 시작가 (이 값 미만의 입찰은 무효)
    pub start_price: u64,

    /// 경매 방식
    pub auction_type: AuctionType,

    /// 입찰 시간 (밀리초)
    pub bid_duration_ms: u64,

    /// 구매자 수 상한 (0 = 무제한)
    pub max_buyers: u32,
}

/// 접수된 입찰 한 건
#[derive(Debug, Clone)]
pub struct Bid {
    /// 입찰자 주소
    pub bidder: SocketAddr,

    /// 입찰액
    pub amount: u64,

    /// 도착 순번 (동점 판정용)
    pub order: u64,
}

/// 경매 결과
#[derive(Debug, Clone)]
pub struct AuctionResult {
    /// 낙찰자 (유효 입찰이 없으면 None)
    pub winner: Option<SocketAddr>,

    /// 낙찰가 (낙찰자가 없으면 0)
    pub clearing_price: u64,
}

impl AuctionResult {
    pub fn is_sold(&self) -> bool {
        self.winner.is_some()
    }
}

/// 경매 한 회분의 상태
#[derive(Debug)]
pub struct Auction {
    phase: Phase,
    item: Option<AuctionItem>,

    /// 접수 이력 (삽입 후 불변, 최신 입찰이 이전 입찰을 대체)
    bids: Vec<Bid>,

    next_order: u64,
    result: Option<AuctionResult>,
}

impl Auction {
    /// 새 경매 (아이템 대기 상태)
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingItem,
            item: None,
            bids: Vec::new(),
            next_order: 0,
            result: None,
        }
    }

    /// 현재 단계
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 제출된 아이템
    pub fn item(&self) -> Option<&AuctionItem> {
        self.item.as_ref()
    }

    /// 계산된 결과
    pub fn result(&self) -> Option<&AuctionResult> {
        self.result.as_ref()
    }

    /// 접수된 입찰 수 (대체된 것 포함)
    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    /// 판매자의 아이템 제출
    ///
    /// `AwaitingItem`에서만 허용. 성공 시 입찰 접수가 열린다.
    pub fn submit_item(&mut self, item: AuctionItem) -> Result<()> {
        if self.phase != Phase::AwaitingItem {
            return Err(Error::AuctionClosed);
        }

        if item.name.trim().is_empty() {
            return Err(Error::InvalidAuctionRequest {
                reason: "아이템 이름이 비어 있음".into(),
            });
        }
        if item.bid_duration_ms == 0 {
            return Err(Error::InvalidAuctionRequest {
                reason: "입찰 시간이 0".into(),
            });
        }

        info!(
            "경매 요청 접수: '{}' 시작가 ${} ({:?}, {}ms)",
            item.name, item.start_price, item.auction_type, item.bid_duration_ms
        );
        self.item = Some(item);
        self.phase = Phase::BiddingOpen;
        Ok(())
    }

    /// 구매자 입찰 접수
    ///
    /// `BiddingOpen` 밖에서는 `AuctionClosed`. 시작가 미만이거나 0이면
    /// `InvalidBid`이며 경매 상태는 바뀌지 않는다. 같은 구매자의 새 유효
    /// 입찰은 이전 입찰을 대체한다.
    pub fn place_bid(&mut self, bidder: SocketAddr, amount: u64) -> Result<()> {
        if self.phase != Phase::BiddingOpen {
            return Err(Error::AuctionClosed);
        }

        // BiddingOpen이면 item은 항상 존재
        let floor = self
            .item
            .as_ref()
            .map(|item| item.start_price)
            .unwrap_or(0);

        if amount == 0 || amount < floor {
            return Err(Error::InvalidBid { amount, floor });
        }

        let order = self.next_order;
        self.next_order += 1;
        self.bids.push(Bid {
            bidder,
            amount,
            order,
        });
        info!("입찰 접수: {} ${} (#{})", bidder, amount, order);
        Ok(())
    }

    /// 입찰 마감
    ///
    /// 타이머 만료와 판매자의 조기 마감이 경합할 수 있으므로 멱등:
    /// 첫 호출만 `true`, 이미 마감이면 `false`.
    pub fn close_bidding(&mut self) -> bool {
        if self.phase != Phase::BiddingOpen {
            return false;
        }
        self.phase = Phase::BiddingClosed;
        info!("입찰 마감: 접수 {}건", self.bids.len());
        true
    }

    /// 구매자별 최신 입찰만 남긴 유효 입찰 목록
    fn live_bids(&self) -> Vec<Bid> {
        let mut live: Vec<Bid> = Vec::new();
        for bid in &self.bids {
            if let Some(existing) = live.iter_mut().find(|b| b.bidder == bid.bidder) {
                *existing = bid.clone();
            } else {
                live.push(bid.clone());
            }
        }
        live
    }

    /// 낙찰 계산
    ///
    /// `BiddingClosed`에서 한 번 호출되어 `ResultAnnounced`로 전이한다.
    pub fn compute_result(&mut self) -> Result<AuctionResult> {
        if self.phase != Phase::BiddingClosed {
            return Err(Error::Unknown(format!(
                "compute_result 호출 단계 오류: {:?}",
                self.phase
            )));
        }

        let live = self.live_bids();
        let result = match live
            .iter()
            .max_by(|a, b| a.amount.cmp(&b.amount).then(b.order.cmp(&a.order)))
        {
            None => {
                warn!("유효 입찰 없음: 유찰");
                AuctionResult {
                    winner: None,
                    clearing_price: 0,
                }
            }
            Some(top) => {
                let auction_type = self
                    .item
                    .as_ref()
                    .map(|item| item.auction_type)
                    .unwrap_or(AuctionType::FirstPrice);

                let clearing_price = match auction_type {
                    AuctionType::FirstPrice => top.amount,
                    AuctionType::SecondPrice => {
                        let mut amounts: Vec<u64> = live
                            .iter()
                            .filter(|b| b.order != top.order)
                            .map(|b| b.amount)
                            .collect();
                        amounts.sort_unstable_by(|a, b| b.cmp(a));
                        // 유효 입찰이 하나뿐이면 낙찰자 본인의 입찰액
                        amounts.first().copied().unwrap_or(top.amount)
                    }
                };

                info!(
                    "낙찰: {} 최고가 ${}, 결제액 ${}",
                    top.bidder, top.amount, clearing_price
                );
                AuctionResult {
                    winner: Some(top.bidder),
                    clearing_price,
                }
            }
        };

        self.result = Some(result.clone());
        self.phase = Phase::ResultAnnounced;
        Ok(result)
    }

    /// 종료 표시 (결과 통지 완료 후)
    pub fn mark_done(&mut self) {
        if self.phase == Phase::ResultAnnounced {
            self.phase = Phase::Done;
        }
    }
}

impl Default for Auction {
    fn default() -> Self {
        Self::new()
    }
}
