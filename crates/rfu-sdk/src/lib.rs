//! # rfu-sdk
//!
//! 公式 SDK 互換のパケットフレーミング層。
//!
//! rfu-raw の「生のワード転送」の上に、シーケンス番号付きの
//! パケットヘッダーと ACK の代数を載せる。公式ソフト（マルチブート
//! ブートローダを含む）と相互運用するためのビット配置を実装する。
//!
//! ## ヘッダーの Wire Format
//!
//! サーバーヘッダー（24 ビット、LSB から）:
//!
//! ```text
//! [payloadSize: 7][unused: 2][phase: 2][n: 2][isACK: 1][commState: 4][targetSlots: 4]
//!  bit 0..7        bit 7..9   bit 9..11 11..13 13..14    14..18        18..22
//! ```
//!
//! クライアントヘッダー（16 ビット、LSB から）:
//!
//! ```text
//! [payloadSize: 5][phase: 2][n: 2][isACK: 1][commState: 4]
//!  bit 0..5        bit 5..7  7..9  9..10     10..14
//! ```
//!
//! ## 送信バッファのバイト配置
//!
//! ヘッダーの直後からペイロードバイトがリトルエンディアンで詰まる。
//! 先頭ワードはヘッダーとペイロードの先頭 1 バイト（サーバー）
//! または 2 バイト（クライアント）を共有する。

#![no_std]
extern crate alloc;

pub mod buffer;
pub mod header;
pub mod parse;

pub use buffer::{
    client_ack_buffer, client_buffer, server_ack_buffer, server_buffer, SendBuffer,
};
pub use header::{ClientHeader, CommState, SequenceNumber, ServerHeader, TargetSlots};
pub use parse::{
    children_data, parent_data, ChildrenData, ClientPacket, ClientResponse, ParentData,
    ServerPacket, ServerResponse,
};

/// 1 転送あたりの最大ワード数
pub const MAX_TRANSFER_WORDS: usize = 23;

/// サーバー側の 1 転送あたりの最大バイト数
pub const MAX_TRANSFER_BYTES_SERVER: usize = 87;

/// クライアント側の 1 転送あたりの最大バイト数
pub const MAX_TRANSFER_BYTES_CLIENT: usize = 16;

/// サーバーヘッダーのバイト数
pub const HEADER_SIZE_SERVER: usize = 3;

/// クライアントヘッダーのバイト数
pub const HEADER_SIZE_CLIENT: usize = 2;

/// サーバーパケット 1 つあたりの最大ペイロードバイト数
pub const MAX_PAYLOAD_SERVER: usize = MAX_TRANSFER_BYTES_SERVER - HEADER_SIZE_SERVER;

/// クライアントパケット 1 つあたりの最大ペイロードバイト数
pub const MAX_PAYLOAD_CLIENT: usize = MAX_TRANSFER_BYTES_CLIENT - HEADER_SIZE_CLIENT;

/// 1 転送に収まるサーバーパケットの最大数
pub const MAX_PACKETS_SERVER: usize = MAX_TRANSFER_BYTES_SERVER / HEADER_SIZE_SERVER;

/// 1 転送に収まるクライアントパケットの最大数
pub const MAX_PACKETS_CLIENT: usize = MAX_TRANSFER_BYTES_CLIENT / HEADER_SIZE_CLIENT;
