//! 세그먼트 정의 (전송 단위)
//!
//! - Segment: 비신뢰 전송 위에 올라가는 한 개의 데이터그램 단위
//! - 시퀀스는 stop-and-wait에 맞춘 교대 비트 (0/1)
//! - 무결성은 페이로드 CRC32로 검증

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::PROTOCOL_VERSION;

/// 교대 시퀀스 비트
///
/// stop-and-wait의 시퀀스 상태는 두 값뿐이므로 카운터 대신 명시적 enum으로 유지
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeqBit {
    Zero,
    One,
}

impl SeqBit {
    /// 반대 비트 반환
    pub fn flip(self) -> Self {
        match self {
            SeqBit::Zero => SeqBit::One,
            SeqBit::One => SeqBit::Zero,
        }
    }
}

impl Default for SeqBit {
    fn default() -> Self {
        SeqBit::Zero
    }
}

/// 세그먼트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// 애플리케이션 페이로드 운반
    Data,

    /// DATA 세그먼트에 대한 확인 응답
    Ack,
}

/// 세그먼트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentHeader {
    /// 프로토콜 버전
    version: u8,

    /// 세그먼트 타입
    kind: SegmentKind,

    /// 시퀀스 비트
    seq: SeqBit,

    /// 페이로드 길이
    payload_len: u16,

    /// 페이로드 CRC32
    crc32: u32,
}

/// 세그먼트 (송수신 패킷 단위)
#[derive(Debug, Clone)]
pub struct Segment {
    /// 세그먼트 타입
    pub kind: SegmentKind,

    /// 시퀀스 비트
    pub seq: SeqBit,

    /// 페이로드
    pub payload: Bytes,

    /// 헤더에 실려온 CRC32 (송신 시 계산됨)
    crc32: u32,
}

impl Segment {
    /// DATA 세그먼트 생성
    pub fn data(seq: SeqBit, payload: Bytes) -> Self {
        let crc32 = crc32fast::hash(&payload);
        Self {
            kind: SegmentKind::Data,
            seq,
            payload,
            crc32,
        }
    }

    /// ACK 세그먼트 생성
    pub fn ack(seq: SeqBit) -> Self {
        Self {
            kind: SegmentKind::Ack,
            seq,
            payload: Bytes::new(),
            crc32: crc32fast::hash(&[]),
        }
    }

    /// 세그먼트를 바이트로 직렬화
    ///
    /// 레이아웃: `[header_len: u16 LE][bincode 헤더][페이로드]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = SegmentHeader {
            version: PROTOCOL_VERSION,
            kind: self.kind,
            seq: self.seq,
            payload_len: self.payload.len() as u16,
            crc32: self.crc32,
        };
        let header_bytes = bincode::serialize(&header).unwrap_or_default();
        let header_len = header_bytes.len() as u16;

        let mut buf = Vec::with_capacity(2 + header_bytes.len() + self.payload.len());
        buf.extend_from_slice(&header_len.to_le_bytes());
        buf.extend_from_slice(&header_bytes);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// 바이트에서 세그먼트 역직렬화
    ///
    /// 절단되었거나 버전이 다르거나 길이 필드가 맞지 않으면 `None`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let header_len = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + header_len {
            return None;
        }

        let header: SegmentHeader = bincode::deserialize(&bytes[2..2 + header_len]).ok()?;
        if header.version != PROTOCOL_VERSION {
            return None;
        }

        let payload = Bytes::copy_from_slice(&bytes[2 + header_len..]);
        if payload.len() != header.payload_len as usize {
            return None;
        }

        Some(Self {
            kind: header.kind,
            seq: header.seq,
            payload,
            crc32: header.crc32,
        })
    }

    /// CRC 검증
    pub fn verify_crc(&self) -> bool {
        crc32fast::hash(&self.payload) == self.crc32
    }
}

/// 데이터그램을 세그먼트로 디코딩 (프레이밍 + CRC 검증)
///
/// 손상된 데이터그램은 손실과 동일하게 취급되어 `None`으로 버려진다
pub fn decode_datagram(bytes: &[u8]) -> Option<Segment> {
    let segment = Segment::from_bytes(bytes)?;
    if !segment.verify_crc() {
        return None;
    }
    Some(segment)
}
