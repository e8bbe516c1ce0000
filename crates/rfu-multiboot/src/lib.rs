//! # rfu-multiboot
//!
//! ワイヤレスマルチブート: ホストの ROM を最大 4 台のクライアントの
//! ブートローダへ信頼性付きマルチキャストで配布する。
//!
//! rfu-raw のコマンド層と rfu-sdk のパケット層を組み合わせ、
//! クライアントごとの 4 スロットのスライディングウィンドウで
//! ROM を 84 バイトページに分割して送る。
//!
//! ## 転送の流れ
//!
//! ```text
//! STOPPED → INITIALIZING（setup + broadcast + start_host）
//!         → WAITING（接続受け付け + クライアントごとのハンドシェイク）
//!         → PREPARING → 開始コマンド送信
//!         → SENDING（ページ送出 + ACK 収集、最も遅いクライアント基準）
//!         → CONFIRMING（ENDING の確認 + OFF の通知）
//! ```
//!
//! どの結果でも終了時に必ず 1 回だけアダプタを畳む。

#![no_std]
extern crate alloc;

pub mod engine;
pub mod window;

pub use engine::{MultibootEngine, Progress, State};

use rfu_raw::AdapterError;

/// 転送できる最小 ROM サイズ（ヘッダー 0xC0 + 最小本体）
pub const MIN_ROM_SIZE: usize = 0x100 + 0xC0;

/// 転送できる最大 ROM サイズ
pub const MAX_ROM_SIZE: usize = 256 * 1024;

/// 最小プレイヤー数（ホスト + クライアント 1 台）
pub const MIN_PLAYERS: u8 = 2;

/// 最大プレイヤー数
pub const MAX_PLAYERS: u8 = 5;

/// マルチブート用の SETUP 最大再送回数
pub const SETUP_MAX_TRANSMISSIONS: u8 = 1;

/// マルチブート用の SETUP 待機タイムアウト
pub const SETUP_WAIT_TIMEOUT: u8 = 32;

/// ゲーム ID に立てるマルチブートフラグ
pub const GAME_ID_MULTIBOOT_FLAG: u16 = 1 << 15;

/// クライアントごとの最大インフライトページ数
pub const MAX_INFLIGHT_PACKETS: usize = 4;

/// ROM 転送開始コマンドのペイロード
pub const CMD_START: [u8; 7] = [0x00, 0x54, 0x00, 0x00, 0x00, 0x02, 0x00];

/// ブートローダが名乗るハンドシェイクペイロード（2 パケット分）
pub const BOOTLOADER_HANDSHAKE: [[u8; 6]; 2] = [
    [0x00, 0x00, 0x52, 0x46, 0x55, 0x2D],
    [0x4D, 0x42, 0x2D, 0x44, 0x4C, 0x00],
];

/// 先頭ページに上書きする ROM ヘッダーパッチ（"RFU-MBOOT"）
pub const ROM_HEADER_PATCH: [u8; 12] = [
    0x52, 0x46, 0x55, 0x2D, 0x4D, 0x42, 0x4F, 0x4F, 0x54, 0x00, 0x00, 0x00,
];

/// パッチの書き込み先オフセット
pub const ROM_HEADER_PATCH_OFFSET: usize = 4;

/// マルチブート転送のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultibootError {
    /// ROM サイズが範囲外（検証のみ、ハードウェアには触れない）
    InvalidSize,
    /// プレイヤー数が 2..=5 の範囲外（検証のみ）
    InvalidPlayers,
    /// キャンセル述語が真を返した
    Canceled,
    /// アダプタの初期化（activate）に失敗した
    AdapterNotDetected(AdapterError),
    /// クライアントがブートローダとして名乗らなかった
    BadHandshake,
    /// アダプタ発イベントのコマンド ID が 0x28 ではなかった
    UnexpectedEvent(u8),
    /// アダプタがクライアントの脱落を報告した
    ClientTimeout { active: u8, expected: u8 },
    /// 下位ドライバのエラー
    Adapter(AdapterError),
}

impl core::fmt::Display for MultibootError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MultibootError::InvalidSize => write!(f, "ROM size out of range"),
            MultibootError::InvalidPlayers => write!(f, "Player count out of range"),
            MultibootError::Canceled => write!(f, "Transfer canceled"),
            MultibootError::AdapterNotDetected(e) => {
                write!(f, "Adapter not detected: {}", e)
            }
            MultibootError::BadHandshake => write!(f, "Bad bootloader handshake"),
            MultibootError::UnexpectedEvent(id) => {
                write!(f, "Expected event 0x28 but received 0x{:02X}", id)
            }
            MultibootError::ClientTimeout { active, expected } => {
                write!(f, "Client timeout ({:04b} vs expected {:04b})", active, expected)
            }
            MultibootError::Adapter(e) => write!(f, "Adapter error: {}", e),
        }
    }
}

impl From<AdapterError> for MultibootError {
    fn from(error: AdapterError) -> Self {
        MultibootError::Adapter(error)
    }
}
