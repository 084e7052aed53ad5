//! RAP 경매 서버 (Auctioneer) - Reliable Auction Protocol
//!
//! UDP stop-and-wait 기반 경매 코디네이션 서버
//! - 최초 접속 피어가 판매자, 이후는 구매자
//! - 서버 수명당 경매 한 회분 진행 후 종료
//!
//! 사용법:
//!   cargo run --release --bin rap-server -- [OPTIONS]
//!
//! 예시:
//!   # 기본 실행
//!   cargo run --release --bin rap-server -- --bind 0.0.0.0:9000
//!
//!   # 불안정 네트워크 프리셋 + 손실 시뮬레이션
//!   cargo run --release --bin rap-server -- -b 0.0.0.0:9000 --lossy --loss 0.2

use std::net::SocketAddr;

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use rap::{AuctionOutcome, AuctionServer, Config};

/// 서버 설정
struct ServerConfig {
    bind_addr: SocketAddr,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".parse().unwrap(),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    config.bind_addr = args[i + 1].parse().expect("유효한 주소 필요");
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
            "--lossy" => {
                let loss_rate = config.config.loss_rate;
                config.config = Config::lossy_network();
                config.config.loss_rate = loss_rate;
            }
            "--help" | "-h" => {
                println!(
                    r#"RAP Server - Reliable Auction Protocol 경매 서버

UDP stop-and-wait 기반 경매 코디네이션 서버
- 최초 접속 피어가 판매자, 이후 접속은 모두 구매자
- 1차 가격 / 2차 가격(Vickrey) 낙찰 지원
- 낙찰 시 판매자 → 낙찰자 파일 핸드오프 릴레이

사용법:
  cargo run --release --bin rap-server -- [OPTIONS]

옵션:
  -b, --bind <ADDR>     바인드 주소 (기본: 0.0.0.0:9000)
  --rto <MS>            재전송 타임아웃 밀리초 (기본: 2000)
  --retries <N>         재전송 한도 (기본: 5)
  --loss <RATE>         수신 손실 시뮬레이션 비율 0.0~1.0 (기본: 0.0)
  --lossy               불안정 네트워크 프리셋 사용
  -h, --help            이 도움말 출력

예시:
  # 포트 9000에서 경매 진행
  cargo run --release --bin rap-server -- --bind 0.0.0.0:9000

  # 손실률 20% 시뮬레이션
  cargo run --release --bin rap-server -- --loss 0.2
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();

    info!("RAP Server starting...");
    info!("Bind address: {}", server_config.bind_addr);
    info!("RTO: {}ms / retries: {}",
        server_config.config.retransmit_timeout_ms,
        server_config.config.max_retries
    );
    if server_config.config.loss_rate > 0.0 {
        info!("Loss simulation: {:.0}%", server_config.config.loss_rate * 100.0);
    }

    let server = AuctionServer::new(server_config.config);

    match server.run(server_config.bind_addr).await {
        Ok(AuctionOutcome::Sold {
            item_name,
            clearing_price,
            winner,
            handoff_bytes,
        }) => {
            info!("경매 종료: '{}' ${} 낙찰 (낙찰자 {})", item_name, clearing_price, winner);
            info!("핸드오프 이동: {} bytes", handoff_bytes);
            Ok(())
        }
        Ok(AuctionOutcome::Unsold { item_name }) => {
            info!("경매 종료: '{}' 유찰", item_name);
            Ok(())
        }
        Err(error) => {
            warn!("경매 실패: {}", error);
            std::process::exit(1);
        }
    }
}
