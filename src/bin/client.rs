//! RAP 경매 클라이언트 - Reliable Auction Protocol
//!
//! 서버의 첫 응답으로 역할이 정해진다
//! - 판매자: 경매 요청 제출 → 결과 대기 → 낙찰 시 파일 업로드
//! - 구매자: 입찰 시작 대기 → 입찰 → 낙찰 시 파일 수신
//!
//! 사용법:
//!   cargo run --release --bin rap-client -- [OPTIONS]
//!
//! 예시:
//!   # 판매자 (먼저 접속한 클라이언트)
//!   cargo run --release --bin rap-client -- -s 127.0.0.1:9000 \
//!       --item "vintage-camera" --start-price 50 --duration 30000 --file tosend.file
//!
//!   # 구매자
//!   cargo run --release --bin rap-client -- -s 127.0.0.1:9000 --bid 120

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rap::message::BidReject;
use rap::segment::decode_datagram;
use rap::{
    handoff, AuctionItem, AuctionMessage, AuctionType, Config, Error, RejectReason,
    ReliableChannel, ResultNotice, Role,
};

/// 클라이언트 설정
struct ClientConfig {
    bind_addr: SocketAddr,
    server_addr: SocketAddr,

    /// 판매자: 전송할 파일 / 구매자: 저장 경로
    file_path: Option<PathBuf>,

    item_name: String,
    start_price: u64,
    second_price: bool,
    duration_ms: u64,
    max_buyers: u32,

    /// 지정 시 입찰 창을 조기 마감 (밀리초 후)
    close_after_ms: Option<u64>,

    /// 구매자 입찰액 목록 (거절 시 다음 금액으로 재시도)
    bids: Vec<u64>,

    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".parse().unwrap(),
            server_addr: "127.0.0.1:9000".parse().unwrap(),
            file_path: None,
            item_name: "test-item".into(),
            start_price: 50,
            second_price: false,
            duration_ms: 30_000,
            max_buyers: 0,
            close_after_ms: None,
            bids: Vec::new(),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--server" | "-s" => {
                if i + 1 < args.len() {
                    config.server_addr = args[i + 1].parse().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--file" | "-f" => {
                if i + 1 < args.len() {
                    config.file_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--item" => {
                if i + 1 < args.len() {
                    config.item_name = args[i + 1].clone();
                    i += 1;
                }
            }
            "--start-price" => {
                if i + 1 < args.len() {
                    config.start_price = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--second-price" => {
                config.second_price = true;
            }
            "--duration" => {
                if i + 1 < args.len() {
                    config.duration_ms = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--max-buyers" => {
                if i + 1 < args.len() {
                    config.max_buyers = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--close-after" => {
                if i + 1 < args.len() {
                    config.close_after_ms = Some(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--bid" => {
                if i + 1 < args.len() {
                    config.bids.push(args[i + 1].parse().expect("유효한 숫자 필요"));
                    i += 1;
                }
            }
            "--rto" => {
                if i + 1 < args.len() {
                    config.config.retransmit_timeout_ms =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--retries" => {
                if i + 1 < args.len() {
                    config.config.max_retries = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--loss" => {
                if i + 1 < args.len() {
                    config.config.loss_rate = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"RAP Client - Reliable Auction Protocol 경매 클라이언트

서버 응답에 따라 판매자 또는 구매자로 동작
- 판매자(최초 접속): 경매 요청 제출, 낙찰 시 파일 업로드
- 구매자: 입찰 제출, 낙찰 시 파일 수신

사용법:
  cargo run --release --bin rap-client -- [OPTIONS]

공통 옵션:
  -s, --server <ADDR>   서버 주소 (기본: 127.0.0.1:9000)
  -b, --bind <ADDR>     로컬 바인드 주소 (기본: 0.0.0.0:0 = 자동 할당)
  -f, --file <PATH>     판매자: 전송 파일 / 구매자: 저장 경로 (기본: recved.file)
  --rto <MS>            재전송 타임아웃 밀리초 (기본: 2000)
  --retries <N>         재전송 한도 (기본: 5)
  --loss <RATE>         수신 손실 시뮬레이션 비율 0.0~1.0 (기본: 0.0)

판매자 옵션:
  --item <NAME>         아이템 이름 (기본: test-item)
  --start-price <N>     시작가 (기본: 50)
  --second-price        2차 가격(Vickrey) 경매 (기본: 1차 가격)
  --duration <MS>       입찰 시간 밀리초 (기본: 30000)
  --max-buyers <N>      구매자 정원, 0 = 무제한 (기본: 0)
  --close-after <MS>    지정 시간 후 조기 마감 요청

구매자 옵션:
  --bid <AMOUNT>        입찰액 (여러 번 지정 시 거절될 때 다음 금액으로 재시도)

예시:
  # 2차 가격 경매 개설 + 파일 전송
  cargo run --release --bin rap-client -- --second-price --start-price 50 -f tosend.file

  # 손실률 30% 환경에서 입찰
  cargo run --release --bin rap-client -- --bid 120 --loss 0.3
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

/// 서버와의 채널 구성: 송신 큐 태스크 + 수신 펌프 태스크
async fn connect(client_config: &ClientConfig) -> Result<ReliableChannel, Error> {
    let socket = Arc::new(UdpSocket::bind(client_config.bind_addr).await?);
    let local_addr = socket.local_addr()?;
    info!("Bound to local address: {}", local_addr);

    let server_addr = client_config.server_addr;
    let (out_tx, mut out_rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(
        client_config.config.outbound_queue_depth,
    );
    let (in_tx, in_rx) = mpsc::channel(client_config.config.channel_queue_depth);

    // 송신 태스크
    let send_socket = socket.clone();
    tokio::spawn(async move {
        while let Some((bytes, addr)) = out_rx.recv().await {
            if let Err(error) = send_socket.send_to(&bytes, addr).await {
                warn!("송신 에러: {}", error);
            }
        }
    });

    // 수신 펌프: 서버 주소에서 온 데이터그램만 채널로
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, addr)) => {
                    if addr != server_addr {
                        debug!("서버가 아닌 주소의 데이터그램 폐기: {}", addr);
                        continue;
                    }
                    if let Some(segment) = decode_datagram(&buf[..len]) {
                        if in_tx.send(segment).await.is_err() {
                            break;
                        }
                    }
                }
                Err(error) => warn!("수신 에러: {}", error),
            }
        }
    });

    Ok(ReliableChannel::new(
        server_addr,
        out_tx,
        in_rx,
        client_config.config.clone(),
    ))
}

/// 경매 메시지가 나올 때까지 수신 (해석 불가 페이로드는 건너뜀)
async fn recv_message(channel: &mut ReliableChannel) -> Result<AuctionMessage, Error> {
    loop {
        let payload = channel.recv().await?;
        match AuctionMessage::from_bytes(&payload) {
            Some(msg) => return Ok(msg),
            None => debug!("해석 불가 페이로드 무시: {} bytes", payload.len()),
        }
    }
}

/// 결과 통지가 나올 때까지 대기 (다른 메시지는 무시)
async fn wait_for_result(
    channel: &mut ReliableChannel,
    deadline: Instant,
) -> Result<ResultNotice, Error> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::PeerUnresponsive {
                peer: channel.peer(),
                attempts: 0,
            });
        }
        let slice = remaining.min(Duration::from_secs(1));
        match channel.try_recv_for(slice).await? {
            Some(payload) => match AuctionMessage::from_bytes(&payload) {
                Some(AuctionMessage::Result(notice)) => return Ok(notice),
                Some(other) => debug!("결과 대기 중 메시지 무시: {}", other.kind_name()),
                None => {}
            },
            None => {}
        }
    }
}

/// 판매자 흐름
async fn seller_mode(
    mut channel: ReliableChannel,
    client_config: &ClientConfig,
) -> Result<(), Error> {
    info!("Your role is: [Seller]");

    let item = AuctionItem {
        name: client_config.item_name.clone(),
        start_price: client_config.start_price,
        auction_type: if client_config.second_price {
            AuctionType::SecondPrice
        } else {
            AuctionType::FirstPrice
        },
        bid_duration_ms: client_config.duration_ms,
        max_buyers: client_config.max_buyers,
    };

    let request = AuctionMessage::AuctionRequest { item: item.clone() };
    channel.send(request.to_bytes().into()).await?;

    match recv_message(&mut channel).await? {
        AuctionMessage::RequestAccepted => {
            info!("경매 요청 접수됨: '{}' 시작가 ${}", item.name, item.start_price);
            info!("Server: Auction start.");
        }
        AuctionMessage::RequestRejected { reason } => {
            return Err(Error::InvalidAuctionRequest { reason });
        }
        other => {
            return Err(Error::UnexpectedMessage {
                expected: "RequestAccepted".into(),
                got: other.kind_name().into(),
            });
        }
    }

    // 조기 마감 옵션
    if let Some(close_after_ms) = client_config.close_after_ms {
        tokio::time::sleep(Duration::from_millis(close_after_ms)).await;
        info!("조기 마감 요청 전송");
        channel
            .send(AuctionMessage::CloseBidding.to_bytes().into())
            .await?;
    }

    // 결과 대기 (입찰 시간 + 수신 타임아웃만큼)
    let deadline = Instant::now()
        + Duration::from_millis(item.bid_duration_ms + client_config.config.recv_timeout_ms);
    match wait_for_result(&mut channel, deadline).await? {
        ResultNotice::SellerSold {
            item_name,
            clearing_price,
            winner,
        } => {
            info!("Auction finished!");
            info!(
                "Success! Your item '{}' has been sold for ${}. Buyer: {}",
                item_name, clearing_price, winner
            );

            // 아이템 상세 페이로드 업로드 (릴레이를 거쳐 낙찰자에게 전달)
            let payload = match &client_config.file_path {
                Some(path) => {
                    info!("Loading file: {:?}", path);
                    std::fs::read(path)?
                }
                None => {
                    info!("Using test payload (256KB)");
                    vec![0xABu8; 256 * 1024]
                }
            };

            let start = Instant::now();
            handoff::send_payload(
                &mut channel,
                &payload,
                client_config.config.handoff_chunk_size(),
            )
            .await?;
            let elapsed = start.elapsed();

            info!(
                "Transfer complete: {} bytes in {:.2}s ({})",
                payload.len(),
                elapsed.as_secs_f64(),
                channel.stats().summary()
            );
        }
        ResultNotice::SellerUnsold { item_name } => {
            info!("Auction finished!");
            info!("아이템 '{}' 유찰: 유효 입찰 없음", item_name);
        }
        other => {
            warn!("판매자에게 구매자용 통지 도착: {:?}", other);
        }
    }

    Ok(())
}

/// 구매자 흐름
async fn buyer_mode(
    mut channel: ReliableChannel,
    client_config: &ClientConfig,
    number: u32,
) -> Result<(), Error> {
    info!("Your role is: [Buyer {}]", number);
    info!("The Auctioneer is still waiting for the auction to open...");

    // 입찰 시작 알림 대기
    loop {
        match recv_message(&mut channel).await? {
            AuctionMessage::BiddingStart {
                item_name,
                start_price,
            } => {
                info!("Bidding start! Item '{}', start price ${}", item_name, start_price);
                break;
            }
            other => debug!("입찰 시작 대기 중 메시지 무시: {}", other.kind_name()),
        }
    }

    // 입찰 제출: 거절되면 다음 금액으로 재시도
    let mut early_result: Option<ResultNotice> = None;
    'bidding: for &amount in &client_config.bids {
        info!("입찰 제출: ${}", amount);
        channel
            .send(AuctionMessage::Bid { amount }.to_bytes().into())
            .await?;

        loop {
            match recv_message(&mut channel).await? {
                AuctionMessage::BidAccepted { amount } => {
                    info!("Bid received by server: ${}. Please wait...", amount);
                    break 'bidding;
                }
                AuctionMessage::BidRejected {
                    reason: BidReject::InvalidBid { floor },
                } => {
                    warn!("Invalid bid ${} (floor ${}), trying next amount", amount, floor);
                    break;
                }
                AuctionMessage::BidRejected {
                    reason: BidReject::AuctionClosed,
                } => {
                    warn!("경매 마감 후 입찰: 결과만 대기");
                    break 'bidding;
                }
                AuctionMessage::Result(notice) => {
                    early_result = Some(notice);
                    break 'bidding;
                }
                other => debug!("입찰 응답 대기 중 메시지 무시: {}", other.kind_name()),
            }
        }
    }

    // 결과 수신
    let deadline = Instant::now() + Duration::from_secs(600);
    let notice = match early_result {
        Some(notice) => notice,
        None => wait_for_result(&mut channel, deadline).await?,
    };

    match notice {
        ResultNotice::Won {
            item_name,
            payment,
            seller,
        } => {
            info!("Auction finished!");
            info!(
                "You won the item '{}'! Your payment due is ${}. Seller: {}",
                item_name, payment, seller
            );

            // 핸드오프 수신 및 저장
            let start = Instant::now();
            let payload = handoff::recv_payload(&mut channel).await?;
            let elapsed = start.elapsed();

            let output = client_config
                .file_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("recved.file"));
            std::fs::write(&output, &payload)?;

            let bps = if elapsed.as_secs_f64() > 0.0 {
                payload.len() as f64 * 8.0 / elapsed.as_secs_f64()
            } else {
                0.0
            };
            info!("All data received! File saved as {:?}", output);
            info!(
                "Transmission finished: {} bytes / {:.6} seconds = {:.2} bps",
                payload.len(),
                elapsed.as_secs_f64(),
                bps
            );
            info!("Channel stats: {}", channel.stats().summary());
        }
        ResultNotice::Lost => {
            info!("Auction finished!");
            info!("Unfortunately you did not win in the last round.");
        }
        other => {
            warn!("구매자에게 판매자용 통지 도착: {:?}", other);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client_config = parse_args();

    info!("RAP Client starting...");
    info!("Server address: {}", client_config.server_addr);
    if client_config.config.loss_rate > 0.0 {
        info!("Loss simulation: {:.0}%", client_config.config.loss_rate * 100.0);
    }

    let mut channel = connect(&client_config).await?;

    // 접속 선언 후 역할 배정 대기
    channel
        .send(AuctionMessage::Join.to_bytes().into())
        .await?;

    match recv_message(&mut channel).await? {
        AuctionMessage::Welcome {
            role: Role::Seller, ..
        } => seller_mode(channel, &client_config).await?,
        AuctionMessage::Welcome {
            role: Role::Buyer,
            number,
        } => buyer_mode(channel, &client_config, number).await?,
        AuctionMessage::Rejected { reason } => {
            match reason {
                RejectReason::AuctionClosed => {
                    warn!("Server busy: auction already closed. Try again later.")
                }
                RejectReason::AuctionFull => {
                    warn!("Server busy, auction in progress! (buyer slots full)")
                }
            }
            std::process::exit(1);
        }
        other => {
            warn!("예상외 첫 응답: {}", other.kind_name());
            std::process::exit(1);
        }
    }

    info!("Disconnecting from the Auctioneer server. Auction is over!");
    Ok(())
}
