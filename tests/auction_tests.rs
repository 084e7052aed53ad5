//! 경매 전 과정 통합 테스트 (루프백 UDP)
//!
//! 실제 소켓으로 서버와 클라이언트 채널을 연결해 역할 배정, 입찰 검증,
//! 낙찰 계산, 결과 통지, 파일 핸드오프까지 한 번에 검증한다.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::debug;

use rap::message::BidReject;
use rap::segment::decode_datagram;
use rap::{
    handoff, AuctionItem, AuctionMessage, AuctionOutcome, AuctionServer, AuctionType, Config,
    RejectReason, ReliableChannel, ResultNotice, Role,
};

fn test_config() -> Config {
    Config {
        retransmit_timeout_ms: 80,
        max_retries: 10,
        recv_timeout_ms: 8_000,
        ..Config::default()
    }
}

/// 클라이언트 채널 구성 (bin/client.rs의 connect와 같은 배선)
async fn connect(server_addr: SocketAddr, config: &Config) -> ReliableChannel {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

    let (out_tx, mut out_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(256);
    let (in_tx, in_rx) = mpsc::channel(64);

    let send_socket = socket.clone();
    tokio::spawn(async move {
        while let Some((bytes, addr)) = out_rx.recv().await {
            let _ = send_socket.send_to(&bytes, addr).await;
        }
    });

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((len, addr)) = socket.recv_from(&mut buf).await {
            if addr != server_addr {
                continue;
            }
            if let Some(segment) = decode_datagram(&buf[..len]) {
                if in_tx.send(segment).await.is_err() {
                    break;
                }
            }
        }
    });

    ReliableChannel::new(server_addr, out_tx, in_rx, config.clone())
}

async fn recv_message(channel: &mut ReliableChannel) -> AuctionMessage {
    loop {
        let payload = channel.recv().await.expect("수신 실패");
        match AuctionMessage::from_bytes(&payload) {
            Some(msg) => return msg,
            None => debug!("해석 불가 페이로드 무시"),
        }
    }
}

/// 접속 선언 후 Welcome 수신
async fn join(server_addr: SocketAddr, config: &Config) -> (ReliableChannel, AuctionMessage) {
    let mut channel = connect(server_addr, config).await;
    channel
        .send(AuctionMessage::Join.to_bytes().into())
        .await
        .expect("Join 송신 실패");
    let welcome = recv_message(&mut channel).await;
    (channel, welcome)
}

fn item(name: &str, auction_type: AuctionType, start_price: u64, duration_ms: u64) -> AuctionItem {
    AuctionItem {
        name: name.into(),
        start_price,
        auction_type,
        bid_duration_ms: duration_ms,
        max_buyers: 0,
    }
}

/// 판매자 접속 + 경매 요청 접수까지
async fn open_auction(
    server_addr: SocketAddr,
    config: &Config,
    item: AuctionItem,
) -> ReliableChannel {
    let (mut seller, welcome) = join(server_addr, config).await;
    assert!(matches!(
        welcome,
        AuctionMessage::Welcome {
            role: Role::Seller,
            ..
        }
    ));

    seller
        .send(AuctionMessage::AuctionRequest { item }.to_bytes().into())
        .await
        .expect("경매 요청 송신 실패");
    let reply = recv_message(&mut seller).await;
    assert!(matches!(reply, AuctionMessage::RequestAccepted));
    seller
}

/// 구매자 접속 + 입찰 시작 알림 수신까지
async fn join_buyer(server_addr: SocketAddr, config: &Config, expect_number: u32) -> ReliableChannel {
    let (mut buyer, welcome) = join(server_addr, config).await;
    match welcome {
        AuctionMessage::Welcome {
            role: Role::Buyer,
            number,
        } => assert_eq!(number, expect_number),
        other => panic!("unexpected welcome: {}", other.kind_name()),
    }

    loop {
        match recv_message(&mut buyer).await {
            AuctionMessage::BiddingStart { .. } => break,
            other => debug!("입찰 시작 대기 중 무시: {}", other.kind_name()),
        }
    }
    buyer
}

async fn place_bid(buyer: &mut ReliableChannel, amount: u64) -> AuctionMessage {
    buyer
        .send(AuctionMessage::Bid { amount }.to_bytes().into())
        .await
        .expect("입찰 송신 실패");
    recv_message(buyer).await
}

#[tokio::test]
async fn test_first_price_auction_with_handoff() {
    let server_addr: SocketAddr = "127.0.0.1:19701".parse().unwrap();
    let config = test_config();

    let server_config = config.clone();
    let server = tokio::spawn(async move {
        AuctionServer::new(server_config)
            .run(server_addr)
            .await
            .expect("서버 실행 실패")
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seller = open_auction(
        server_addr,
        &config,
        item("vintage-camera", AuctionType::FirstPrice, 50, 1500),
    )
    .await;

    let mut buyer1 = join_buyer(server_addr, &config, 1).await;
    let mut buyer2 = join_buyer(server_addr, &config, 2).await;

    assert!(matches!(
        place_bid(&mut buyer1, 100).await,
        AuctionMessage::BidAccepted { amount: 100 }
    ));
    assert!(matches!(
        place_bid(&mut buyer2, 150).await,
        AuctionMessage::BidAccepted { amount: 150 }
    ));

    let payload: Vec<u8> = (0..5_000u32).map(|i| (i % 231) as u8).collect();
    let expected = payload.clone();
    let chunk_size = config.handoff_chunk_size();

    // 판매자: 결과 수신 후 파일 업로드
    let seller_task = tokio::spawn(async move {
        let notice = loop {
            match recv_message(&mut seller).await {
                AuctionMessage::Result(notice) => break notice,
                other => debug!("무시: {}", other.kind_name()),
            }
        };
        match &notice {
            ResultNotice::SellerSold { clearing_price, .. } => {
                assert_eq!(*clearing_price, 150);
            }
            other => panic!("판매자 통지가 낙찰이 아님: {other:?}"),
        }
        handoff::send_payload(&mut seller, &payload, chunk_size)
            .await
            .expect("판매자 업로드 실패");
    });

    // 탈락자
    let loser_task = tokio::spawn(async move {
        loop {
            match recv_message(&mut buyer1).await {
                AuctionMessage::Result(notice) => {
                    assert_eq!(notice, ResultNotice::Lost);
                    break;
                }
                other => debug!("무시: {}", other.kind_name()),
            }
        }
    });

    // 낙찰자: 결과 수신 후 파일 수신
    let winner_task = tokio::spawn(async move {
        let notice = loop {
            match recv_message(&mut buyer2).await {
                AuctionMessage::Result(notice) => break notice,
                other => debug!("무시: {}", other.kind_name()),
            }
        };
        match notice {
            ResultNotice::Won { payment, .. } => assert_eq!(payment, 150),
            other => panic!("낙찰자 통지가 Won이 아님: {other:?}"),
        }
        let received = handoff::recv_payload(&mut buyer2)
            .await
            .expect("낙찰자 수신 실패");
        let _ = buyer2.try_recv_for(Duration::from_millis(300)).await;
        received
    });

    seller_task.await.unwrap();
    loser_task.await.unwrap();
    let received = winner_task.await.unwrap();
    assert_eq!(received, expected, "핸드오프 페이로드가 동일해야 함");

    // 낙찰자 클라이언트처럼 디스크에 저장해도 동일해야 함
    let saved = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(saved.path(), &received).unwrap();
    assert_eq!(std::fs::read(saved.path()).unwrap(), expected);

    match server.await.unwrap() {
        AuctionOutcome::Sold {
            clearing_price,
            handoff_bytes,
            ..
        } => {
            assert_eq!(clearing_price, 150);
            assert_eq!(handoff_bytes, expected.len() as u64);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_second_price_with_invalid_bid_and_early_close() {
    let server_addr: SocketAddr = "127.0.0.1:19702".parse().unwrap();
    let config = test_config();

    let server_config = config.clone();
    let server = tokio::spawn(async move {
        AuctionServer::new(server_config)
            .run(server_addr)
            .await
            .expect("서버 실행 실패")
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 입찰 시간은 길게 잡고 조기 마감으로 끝낸다
    let mut seller = open_auction(
        server_addr,
        &config,
        item("rare-vinyl", AuctionType::SecondPrice, 50, 20_000),
    )
    .await;

    let mut buyer1 = join_buyer(server_addr, &config, 1).await;
    let mut buyer2 = join_buyer(server_addr, &config, 2).await;
    let mut buyer3 = join_buyer(server_addr, &config, 3).await;

    // 시작가 미만 입찰은 거절되고 상태를 바꾸지 않는다
    match place_bid(&mut buyer1, 40).await {
        AuctionMessage::BidRejected {
            reason: BidReject::InvalidBid { floor },
        } => assert_eq!(floor, 50),
        other => panic!("unexpected reply: {}", other.kind_name()),
    }

    assert!(matches!(
        place_bid(&mut buyer1, 100).await,
        AuctionMessage::BidAccepted { .. }
    ));
    assert!(matches!(
        place_bid(&mut buyer2, 150).await,
        AuctionMessage::BidAccepted { .. }
    ));
    assert!(matches!(
        place_bid(&mut buyer3, 120).await,
        AuctionMessage::BidAccepted { .. }
    ));

    // 판매자 조기 마감
    seller
        .send(AuctionMessage::CloseBidding.to_bytes().into())
        .await
        .unwrap();

    let seller_task = tokio::spawn(async move {
        loop {
            match recv_message(&mut seller).await {
                AuctionMessage::Result(ResultNotice::SellerSold {
                    clearing_price,
                    winner,
                    ..
                }) => break (clearing_price, winner, seller),
                other => debug!("무시: {}", other.kind_name()),
            }
        }
    });

    let winner_task = tokio::spawn(async move {
        let notice = loop {
            match recv_message(&mut buyer2).await {
                AuctionMessage::Result(notice) => break notice,
                other => debug!("무시: {}", other.kind_name()),
            }
        };
        let received = handoff::recv_payload(&mut buyer2)
            .await
            .expect("낙찰자 수신 실패");
        let _ = buyer2.try_recv_for(Duration::from_millis(300)).await;
        (notice, received)
    });
    let losers = tokio::spawn(async move {
        for buyer in [&mut buyer1, &mut buyer3] {
            loop {
                match recv_message(buyer).await {
                    AuctionMessage::Result(notice) => {
                        assert_eq!(notice, ResultNotice::Lost);
                        break;
                    }
                    other => debug!("무시: {}", other.kind_name()),
                }
            }
        }
    });

    // 2차 가격: 낙찰자는 buyer2, 결제액은 두 번째 유효 입찰 120
    let (clearing_price, _winner, mut seller) = seller_task.await.unwrap();
    assert_eq!(clearing_price, 120);

    // 낙찰이므로 판매자가 아이템 상세를 업로드하고 릴레이를 거쳐 전달된다
    handoff::send_payload(&mut seller, b"vinyl-details", config.handoff_chunk_size())
        .await
        .expect("판매자 업로드 실패");

    let (notice, received) = winner_task.await.unwrap();
    match notice {
        ResultNotice::Won { payment, .. } => assert_eq!(payment, 120),
        other => panic!("unexpected notice: {other:?}"),
    }
    assert_eq!(received, b"vinyl-details");
    losers.await.unwrap();

    match server.await.unwrap() {
        AuctionOutcome::Sold { clearing_price, .. } => assert_eq!(clearing_price, 120),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_unsold_when_no_bids() {
    let server_addr: SocketAddr = "127.0.0.1:19703".parse().unwrap();
    let config = test_config();

    let server_config = config.clone();
    let server = tokio::spawn(async move {
        AuctionServer::new(server_config)
            .run(server_addr)
            .await
            .expect("서버 실행 실패")
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seller = open_auction(
        server_addr,
        &config,
        item("unwanted-lamp", AuctionType::FirstPrice, 500, 400),
    )
    .await;

    let notice = loop {
        match recv_message(&mut seller).await {
            AuctionMessage::Result(notice) => break notice,
            other => debug!("무시: {}", other.kind_name()),
        }
    };
    assert!(matches!(notice, ResultNotice::SellerUnsold { .. }));

    match server.await.unwrap() {
        AuctionOutcome::Unsold { item_name } => assert_eq!(item_name, "unwanted-lamp"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_buyer_cap_rejects_extra_buyer() {
    let server_addr: SocketAddr = "127.0.0.1:19704".parse().unwrap();
    let config = test_config();

    let server_config = config.clone();
    let server = tokio::spawn(async move {
        AuctionServer::new(server_config)
            .run(server_addr)
            .await
            .expect("서버 실행 실패")
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut auction_item = item("limited-print", AuctionType::FirstPrice, 10, 2_000);
    auction_item.max_buyers = 1;
    let mut seller = open_auction(server_addr, &config, auction_item).await;

    let mut buyer1 = join_buyer(server_addr, &config, 1).await;

    // 정원 초과 구매자는 등록 거절
    let (_extra, reply) = join(server_addr, &config).await;
    assert!(matches!(
        reply,
        AuctionMessage::Rejected {
            reason: RejectReason::AuctionFull
        }
    ));

    assert!(matches!(
        place_bid(&mut buyer1, 30).await,
        AuctionMessage::BidAccepted { .. }
    ));

    seller
        .send(AuctionMessage::CloseBidding.to_bytes().into())
        .await
        .unwrap();

    let winner_task = tokio::spawn(async move {
        let notice = loop {
            match recv_message(&mut buyer1).await {
                AuctionMessage::Result(notice) => break notice,
                other => debug!("무시: {}", other.kind_name()),
            }
        };
        let received = handoff::recv_payload(&mut buyer1)
            .await
            .expect("낙찰자 수신 실패");
        let _ = buyer1.try_recv_for(Duration::from_millis(300)).await;
        (notice, received)
    });
    let seller_task = tokio::spawn(async move {
        loop {
            match recv_message(&mut seller).await {
                AuctionMessage::Result(notice) => break (notice, seller),
                other => debug!("무시: {}", other.kind_name()),
            }
        }
    });

    let (notice, mut seller) = seller_task.await.unwrap();
    assert!(matches!(notice, ResultNotice::SellerSold { .. }));

    handoff::send_payload(&mut seller, b"print-details", config.handoff_chunk_size())
        .await
        .expect("판매자 업로드 실패");

    let (notice, received) = winner_task.await.unwrap();
    assert!(matches!(notice, ResultNotice::Won { payment: 30, .. }));
    assert_eq!(received, b"print-details");

    match server.await.unwrap() {
        AuctionOutcome::Sold { clearing_price, .. } => assert_eq!(clearing_price, 30),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
