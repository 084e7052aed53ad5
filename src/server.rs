//! 경매 서버 (Auctioneer)
//!
//! - 공유 UDP 소켓 하나 + 송신 큐 태스크 + 소스 주소 기준 역다중화
//! - 피어(판매자/구매자)마다 태스크 하나, 입찰 판정은 코디네이터 락으로 직렬화
//! - 입찰 타이머와 판매자 조기 마감의 경합은 멱등 close로 해소
//! - 서버 수명당 경매 한 회분: `run()` 한 번 = 경매 한 번

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::auction::{Auction, AuctionItem, AuctionResult, Phase};
use crate::channel::ReliableChannel;
use crate::handoff;
use crate::message::{AuctionMessage, BidReject, RejectReason, ResultNotice};
use crate::registrar::{Peer, Registrar, Role};
use crate::segment::{decode_datagram, Segment};
use crate::{Config, Error, Result};

/// 역다중화 테이블: 소스 주소 → 해당 피어의 수신 큐
type RouteMap = Arc<DashMap<SocketAddr, mpsc::Sender<Segment>>>;

/// 경매 한 회분의 종료 결과
#[derive(Debug)]
pub enum AuctionOutcome {
    /// 낙찰 (핸드오프 이동 바이트 포함, 실패 시 0)
    Sold {
        item_name: String,
        clearing_price: u64,
        winner: SocketAddr,
        handoff_bytes: u64,
    },

    /// 유찰
    Unsold { item_name: String },
}

/// 피어 태스크 종료 보고
enum PeerExit {
    /// 결과 통지까지 완료, 채널 반환
    Finished { peer: Peer, channel: ReliableChannel },

    /// 무응답 등으로 중도 이탈
    Withdrawn { peer: Peer, error: Error },
}

/// 태스크 간 공유 상태
///
/// 락은 짧게 잡고 await를 걸치지 않는다
struct Shared {
    auction: Mutex<Auction>,
    registrar: Mutex<Registrar>,
    phase_tx: watch::Sender<Phase>,
    deadline: Mutex<Option<tokio::time::Instant>>,
}

impl Shared {
    fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::AwaitingItem);
        Self {
            auction: Mutex::new(Auction::new()),
            registrar: Mutex::new(Registrar::new()),
            phase_tx,
            deadline: Mutex::new(None),
        }
    }

    fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    fn submit_item(&self, item: AuctionItem) -> Result<()> {
        self.auction.lock().submit_item(item.clone())?;
        self.registrar.lock().set_buyer_cap(item.max_buyers);
        *self.deadline.lock() = Some(
            tokio::time::Instant::now() + Duration::from_millis(item.bid_duration_ms),
        );
        self.phase_tx.send_replace(Phase::BiddingOpen);
        Ok(())
    }

    fn place_bid(&self, bidder: SocketAddr, amount: u64) -> Result<()> {
        self.auction.lock().place_bid(bidder, amount)
    }

    fn close_bidding(&self, source: &str) -> bool {
        let closed = self.auction.lock().close_bidding();
        if closed {
            info!("입찰 마감 ({})", source);
            self.registrar.lock().close();
            self.phase_tx.send_replace(Phase::BiddingClosed);
        }
        closed
    }

    fn compute_result(&self) -> Result<AuctionResult> {
        let result = self.auction.lock().compute_result()?;
        self.phase_tx.send_replace(Phase::ResultAnnounced);
        Ok(result)
    }

    fn mark_done(&self) {
        self.auction.lock().mark_done();
        self.phase_tx.send_replace(Phase::Done);
    }

    fn bidding_deadline(&self) -> Option<tokio::time::Instant> {
        *self.deadline.lock()
    }

    fn peer_count(&self) -> usize {
        self.registrar.lock().peer_count()
    }

    fn item_summary(&self) -> Option<(String, u64)> {
        self.auction
            .lock()
            .item()
            .map(|item| (item.name.clone(), item.start_price))
    }

    /// 피어별 맞춤 결과 통지 생성
    fn notice_for(&self, peer: &Peer) -> ResultNotice {
        let (result, item_name) = {
            let auction = self.auction.lock();
            let result = auction.result().cloned().unwrap_or(AuctionResult {
                winner: None,
                clearing_price: 0,
            });
            let item_name = auction
                .item()
                .map(|item| item.name.clone())
                .unwrap_or_default();
            (result, item_name)
        };
        let seller = self.registrar.lock().seller_addr();

        match peer.role {
            Role::Seller => match result.winner {
                Some(winner) => ResultNotice::SellerSold {
                    item_name,
                    clearing_price: result.clearing_price,
                    winner,
                },
                None => ResultNotice::SellerUnsold { item_name },
            },
            Role::Buyer => match result.winner {
                Some(winner) if winner == peer.addr => ResultNotice::Won {
                    item_name,
                    payment: result.clearing_price,
                    seller: seller.unwrap_or(peer.addr),
                },
                _ => ResultNotice::Lost,
            },
        }
    }
}

/// 경매 서버
pub struct AuctionServer {
    config: Config,
}

impl AuctionServer {
    /// 새 서버 생성
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// 경매 한 회분 실행
    ///
    /// 정상 종료는 `AuctionOutcome`. 아이템 제출 전 판매자 무응답과 소켓
    /// 바인드 실패만 치명 에러로 전파된다.
    pub async fn run(&self, bind_addr: SocketAddr) -> Result<AuctionOutcome> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("RAP Auctioneer started on {}", socket.local_addr()?);

        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_queue_depth);
        tokio::spawn(send_task(socket.clone(), out_rx));

        let shared = Arc::new(Shared::new());
        let routes: RouteMap = Arc::new(DashMap::new());
        let (exit_tx, mut exit_rx) = mpsc::channel::<PeerExit>(256);

        let pump = tokio::spawn(pump_task(
            socket,
            routes,
            shared.clone(),
            out_tx,
            exit_tx,
            self.config.clone(),
        ));

        let mut phase_rx = shared.subscribe();
        let mut exits: Vec<PeerExit> = Vec::new();

        // 1) 아이템 제출 대기: 제출 전 판매자 이탈은 치명
        info!("판매자 접속 및 경매 요청 대기 중...");
        loop {
            tokio::select! {
                res = phase_rx.wait_for(|phase| *phase >= Phase::BiddingOpen) => {
                    match res {
                        Ok(_) => break,
                        Err(_) => return Err(Error::ChannelClosed),
                    }
                }
                exit = exit_rx.recv() => {
                    let exit = exit.ok_or(Error::ChannelClosed)?;
                    if let PeerExit::Withdrawn { peer, error } = &exit {
                        if peer.role == Role::Seller && shared.phase() == Phase::AwaitingItem {
                            warn!("아이템 제출 전 판매자 무응답: 경매 중단 ({})", error);
                            pump.abort();
                            return Err(Error::PeerUnresponsive {
                                peer: peer.addr,
                                attempts: 0,
                            });
                        }
                    }
                    exits.push(exit);
                }
            }
        }

        // 2) 입찰 창: 타이머 만료 vs 판매자 조기 마감, 먼저 온 쪽이 이긴다
        let deadline = shared
            .bidding_deadline()
            .unwrap_or_else(tokio::time::Instant::now);
        while shared.phase() < Phase::BiddingClosed {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    shared.close_bidding("타이머 만료");
                }
                res = phase_rx.wait_for(|phase| *phase >= Phase::BiddingClosed) => {
                    if res.is_err() {
                        return Err(Error::ChannelClosed);
                    }
                }
                exit = exit_rx.recv() => {
                    if let Some(exit) = exit {
                        exits.push(exit);
                    }
                }
            }
        }

        // 3) 낙찰 계산
        let result = shared.compute_result()?;

        // 4) 피어 보고 수집: 판매자/낙찰자 채널이 모이는 즉시 릴레이를 시작하고
        //    나머지 통지(탈락자 등)는 릴레이와 병행으로 마저 수집한다
        let expected = shared.peer_count();
        let mut collector = ExitCollector::new(result.winner);
        for exit in exits.drain(..) {
            collector.absorb(exit);
        }
        while !collector.relay_ready() && collector.collected < expected {
            match exit_rx.recv().await {
                Some(exit) => collector.absorb(exit),
                None => break,
            }
        }

        let relay_task = match (
            collector.seller_channel.take(),
            collector.winner_channel.take(),
            result.winner,
        ) {
            (Some(mut seller), Some(mut buyer), Some(_)) => Some(tokio::spawn(async move {
                handoff::relay(&mut seller, &mut buyer).await
            })),
            (_, _, Some(_)) => {
                warn!("핸드오프 불가: 판매자 또는 낙찰자 채널 없음");
                None
            }
            _ => None,
        };

        while collector.collected < expected {
            match exit_rx.recv().await {
                Some(exit) => collector.absorb(exit),
                None => break,
            }
        }
        shared.mark_done();

        let handoff_bytes = match relay_task {
            Some(task) => match task.await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(error)) => {
                    warn!("핸드오프 실패: {}", error);
                    0
                }
                Err(error) => {
                    warn!("핸드오프 태스크 실패: {}", error);
                    0
                }
            },
            None => 0,
        };

        let item_name = shared
            .item_summary()
            .map(|(name, _)| name)
            .unwrap_or_default();

        let outcome = match result.winner {
            Some(winner) => AuctionOutcome::Sold {
                item_name,
                clearing_price: result.clearing_price,
                winner,
                handoff_bytes,
            },
            None => AuctionOutcome::Unsold { item_name },
        };

        pump.abort();
        Ok(outcome)
    }
}

/// 피어 종료 보고 수집기
///
/// 판매자와 낙찰자의 채널 확보 여부를 추적한다
struct ExitCollector {
    winner: Option<SocketAddr>,
    seller_channel: Option<ReliableChannel>,
    winner_channel: Option<ReliableChannel>,
    seller_seen: bool,
    winner_seen: bool,
    collected: usize,
}

impl ExitCollector {
    fn new(winner: Option<SocketAddr>) -> Self {
        Self {
            winner,
            seller_channel: None,
            winner_channel: None,
            seller_seen: false,
            // 유찰이면 낙찰자 채널을 기다릴 필요 없음
            winner_seen: winner.is_none(),
            collected: 0,
        }
    }

    fn absorb(&mut self, exit: PeerExit) {
        self.collected += 1;
        match exit {
            PeerExit::Finished { peer, channel } => {
                if peer.role == Role::Seller {
                    self.seller_seen = true;
                    self.seller_channel = Some(channel);
                } else if self.winner == Some(peer.addr) {
                    self.winner_seen = true;
                    self.winner_channel = Some(channel);
                }
            }
            PeerExit::Withdrawn { peer, error } => {
                warn!("피어 이탈 처리: {} ({})", peer.addr, error);
                if peer.role == Role::Seller {
                    self.seller_seen = true;
                } else if self.winner == Some(peer.addr) {
                    self.winner_seen = true;
                }
            }
        }
    }

    fn relay_ready(&self) -> bool {
        self.seller_seen && self.winner_seen
    }
}

/// 송신 큐를 소켓으로 흘려보내는 태스크
async fn send_task(socket: Arc<UdpSocket>, mut out_rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
    while let Some((bytes, addr)) = out_rx.recv().await {
        if let Err(error) = socket.send_to(&bytes, addr).await {
            warn!("송신 에러 ({}): {}", addr, error);
        }
    }
}

/// 수신 펌프: 데이터그램 디코딩 후 소스 주소로 역다중화
///
/// 미등록 주소의 첫 세그먼트는 레지스트라를 거쳐 피어 태스크를 만든다
async fn pump_task(
    socket: Arc<UdpSocket>,
    routes: RouteMap,
    shared: Arc<Shared>,
    out_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    exit_tx: mpsc::Sender<PeerExit>,
    config: Config,
) {
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                warn!("수신 에러: {}", error);
                continue;
            }
        };

        let segment = match decode_datagram(&buf[..len]) {
            Some(segment) => segment,
            None => {
                // 손상/비프로토콜 데이터그램은 손실과 동일하게 무시
                debug!("데이터그램 폐기: {} ({} bytes)", addr, len);
                continue;
            }
        };

        if let Some(route) = routes.get(&addr) {
            if route.try_send(segment).is_err() {
                debug!("수신 큐 포화, 세그먼트 폐기: {}", addr);
            }
            continue;
        }

        // 신규 주소: 역할 배정
        let registered = shared.registrar.lock().register(addr);
        match registered {
            Ok(peer) => {
                let (in_tx, in_rx) = mpsc::channel(config.channel_queue_depth);
                let _ = in_tx.try_send(segment);
                routes.insert(addr, in_tx);

                let channel = ReliableChannel::new(addr, out_tx.clone(), in_rx, config.clone());
                tokio::spawn(peer_task(peer, channel, shared.clone(), exit_tx.clone()));
            }
            Err(_) => {
                let reason = if shared.phase() >= Phase::BiddingClosed {
                    RejectReason::AuctionClosed
                } else {
                    RejectReason::AuctionFull
                };
                let (in_tx, in_rx) = mpsc::channel(8);
                let _ = in_tx.try_send(segment);
                routes.insert(addr, in_tx);

                let channel = ReliableChannel::new(addr, out_tx.clone(), in_rx, config.clone());
                tokio::spawn(reject_task(addr, channel, reason, routes.clone()));
            }
        }
    }
}

/// 등록 거절 통지 태스크
async fn reject_task(
    addr: SocketAddr,
    mut channel: ReliableChannel,
    reason: RejectReason,
    routes: RouteMap,
) {
    // 상대의 Join 송신이 매달리지 않도록 먼저 ACK 처리
    let _ = channel.try_recv_for(Duration::from_millis(500)).await;

    let msg = AuctionMessage::Rejected { reason };
    if let Err(error) = channel.send(msg.to_bytes().into()).await {
        debug!("거절 통지 실패: {} ({})", addr, error);
    } else {
        info!("등록 거절 통지: {} ({:?})", addr, reason);
    }
    routes.remove(&addr);
}

/// 피어 태스크 공통 래퍼: 역할별 흐름 실행 후 종료 보고
async fn peer_task(
    peer: Peer,
    mut channel: ReliableChannel,
    shared: Arc<Shared>,
    exit_tx: mpsc::Sender<PeerExit>,
) {
    let outcome = match peer.role {
        Role::Seller => seller_flow(&peer, &mut channel, &shared).await,
        Role::Buyer => buyer_flow(&peer, &mut channel, &shared).await,
    };
    debug!("피어 태스크 종료: {} ({})", peer.addr, channel.stats().summary());
    let exit = match outcome {
        Ok(()) => PeerExit::Finished { peer, channel },
        Err(error) => PeerExit::Withdrawn { peer, error },
    };
    let _ = exit_tx.send(exit).await;
}

/// 판매자 흐름: 역할 통지 → 경매 요청 접수 → 조기 마감 감시 → 결과 통지
async fn seller_flow(peer: &Peer, channel: &mut ReliableChannel, shared: &Shared) -> Result<()> {
    let welcome = AuctionMessage::Welcome {
        role: Role::Seller,
        number: 0,
    };
    channel.send(welcome.to_bytes().into()).await?;

    // 경매 요청 수신: 잘못된 요청은 거절 통지 후 재시도 허용
    loop {
        let payload = channel.recv().await?;
        match AuctionMessage::from_bytes(&payload) {
            Some(AuctionMessage::Join) => {}
            Some(AuctionMessage::AuctionRequest { item }) => {
                match shared.submit_item(item) {
                    Ok(()) => {
                        channel
                            .send(AuctionMessage::RequestAccepted.to_bytes().into())
                            .await?;
                        break;
                    }
                    Err(Error::InvalidAuctionRequest { reason }) => {
                        channel
                            .send(AuctionMessage::RequestRejected { reason }.to_bytes().into())
                            .await?;
                    }
                    Err(error) => return Err(error),
                }
            }
            Some(other) => {
                warn!("판매자 예상외 메시지: {}", other.kind_name());
                let reject = AuctionMessage::RequestRejected {
                    reason: format!("경매 요청이 아님: {}", other.kind_name()),
                };
                channel.send(reject.to_bytes().into()).await?;
            }
            None => {
                let reject = AuctionMessage::RequestRejected {
                    reason: "해석 불가 메시지".into(),
                };
                channel.send(reject.to_bytes().into()).await?;
            }
        }
    }

    // 입찰 창: 판매자의 조기 마감 요청만 의미 있음
    while shared.phase() < Phase::BiddingClosed {
        match channel.try_recv_for(Duration::from_millis(200)).await? {
            Some(payload) => match AuctionMessage::from_bytes(&payload) {
                Some(AuctionMessage::CloseBidding) => {
                    shared.close_bidding("판매자 요청");
                }
                Some(other) => {
                    debug!("입찰 창 중 판매자 메시지 무시: {}", other.kind_name())
                }
                None => {}
            },
            None => {}
        }
    }

    announce_result(peer, channel, shared).await
}

/// 구매자 흐름: 역할 통지 → 입찰 시작 알림 → 입찰 접수 → 결과 통지
async fn buyer_flow(peer: &Peer, channel: &mut ReliableChannel, shared: &Shared) -> Result<()> {
    let welcome = AuctionMessage::Welcome {
        role: Role::Buyer,
        number: peer.number,
    };
    channel.send(welcome.to_bytes().into()).await?;

    let mut phase_rx = shared.subscribe();
    if phase_rx
        .wait_for(|phase| *phase >= Phase::BiddingOpen)
        .await
        .is_err()
    {
        return Err(Error::ChannelClosed);
    }

    if shared.phase() == Phase::BiddingOpen {
        if let Some((item_name, start_price)) = shared.item_summary() {
            let start = AuctionMessage::BiddingStart {
                item_name,
                start_price,
            };
            channel.send(start.to_bytes().into()).await?;
        }
    }

    // 입찰 접수 루프: 마감 단계 전이를 주기적으로 확인
    while shared.phase() < Phase::BiddingClosed {
        match channel.try_recv_for(Duration::from_millis(200)).await? {
            Some(payload) => match AuctionMessage::from_bytes(&payload) {
                Some(AuctionMessage::Bid { amount }) => {
                    let reply = match shared.place_bid(peer.addr, amount) {
                        Ok(()) => {
                            info!("구매자 {} 입찰 ${}", peer.number, amount);
                            AuctionMessage::BidAccepted { amount }
                        }
                        Err(Error::InvalidBid { floor, .. }) => AuctionMessage::BidRejected {
                            reason: BidReject::InvalidBid { floor },
                        },
                        Err(Error::AuctionClosed) => AuctionMessage::BidRejected {
                            reason: BidReject::AuctionClosed,
                        },
                        Err(error) => return Err(error),
                    };
                    channel.send(reply.to_bytes().into()).await?;
                }
                Some(AuctionMessage::Join) => {}
                Some(other) => {
                    debug!("구매자 {} 예상외 메시지 무시: {}", peer.number, other.kind_name())
                }
                None => debug!("구매자 {} 해석 불가 페이로드 무시", peer.number),
            },
            None => {}
        }
    }

    announce_result(peer, channel, shared).await
}

/// 결과 확정 대기 → 늦은 입찰 거절 → 맞춤 통지 송신
async fn announce_result(
    peer: &Peer,
    channel: &mut ReliableChannel,
    shared: &Shared,
) -> Result<()> {
    let mut phase_rx = shared.subscribe();
    if phase_rx
        .wait_for(|phase| *phase >= Phase::ResultAnnounced)
        .await
        .is_err()
    {
        return Err(Error::ChannelClosed);
    }

    // 마감과 통지 사이에 도착한 늦은 메시지 정리
    while let Some(payload) = channel.try_recv_for(Duration::from_millis(50)).await? {
        match AuctionMessage::from_bytes(&payload) {
            Some(AuctionMessage::Bid { amount }) => {
                debug!("마감 후 입찰 거절: {} ${}", channel.peer(), amount);
                let reject = AuctionMessage::BidRejected {
                    reason: BidReject::AuctionClosed,
                };
                channel.send(reject.to_bytes().into()).await?;
            }
            Some(other) => debug!("마감 후 메시지 무시: {}", other.kind_name()),
            None => {}
        }
    }

    let notice = shared.notice_for(peer);
    channel
        .send(AuctionMessage::Result(notice).to_bytes().into())
        .await?;
    Ok(())
}
