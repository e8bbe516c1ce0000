//! # rfu-raw
//!
//! GBA ワイヤレスアダプタ（RFU）の低レベルコマンドドライバ。
//!
//! アダプタの状態機械・ログインハンドシェイク・コマンド/レスポンスの
//! フレーミング・セッション管理（プレイヤー数、割り当て ID）を担当する。
//! パケット多重化は上位の `rfu-sdk`、ROM 配布は `rfu-multiboot` が担う。
//!
//! ## コマンドの Wire Format
//!
//! ```text
//! コマンドワード:
//!   [0x9966: u16][param_count: u8][command_type: u8]
//!    ↑ 上位 16 ビットは常にヘッダー定数
//!
//! 各転送の応答はセンチネル 0x80000000（データ要求）であること。
//!
//! レスポンスエンベロープ:
//!   [0x9966: u16][response_count: u8][ack: u8]
//!    ack = command_type + 0x80（成功）
//!    ack = 0xEE（エラー。続く 1 ワードがエラーコード: 1 = 状態不正）
//! ```
//!
//! ## 状態遷移
//!
//! ```text
//! NEEDS_RESET → (activate: ping + login + HELLO) → AUTHENTICATED
//!             → (broadcast_read_start)           → SEARCHING
//!             → (setup + broadcast + start_host) → SERVING
//!             → (connect)                        → CONNECTING
//!             → (finish_connection)              → CONNECTED
//! ```
//!
//! どのコマンドでも失敗すると NEEDS_RESET に戻る。再activate は
//! 呼び出し側の責任（ドライバは自動リトライしない）。

#![no_std]
extern crate alloc;

pub mod command;
pub mod driver;
pub mod error;

pub use command::{
    AcceptConnectionsResponse, ConnectedClient, ConnectionPhase, ConnectionStatus,
    ReceiveDataResponse, RemoteCommand, Server, SlotStatusResponse,
};
pub use driver::{RawWireless, SessionState, State};
pub use error::{AdapterError, CommandError};

/// 最大プレイヤー数（ホスト + クライアント 4 台）
pub const MAX_PLAYERS: usize = 5;

/// アダプタ ping 時の待機スキャンライン数
pub const PING_WAIT: u32 = 50;

/// 転送間の待機スキャンライン数
pub const TRANSFER_WAIT: u32 = 15;

/// コマンド転送のタイムアウト（スキャンライン数）
pub const CMD_TIMEOUT: u32 = 100;

/// クライアント側の最大転送ワード数
pub const MAX_CLIENT_TRANSFER_LENGTH: usize = 4;

/// ホスト側の最大転送ワード数
pub const MAX_COMMAND_TRANSFER_LENGTH: usize = 22;

/// ゲーム ID の最大値（最上位ビットはマルチブートフラグ予約）
pub const MAX_GAME_ID: u16 = 0x7FFF;

/// ゲーム名の最大バイト数
pub const MAX_GAME_NAME_LENGTH: usize = 14;

/// ユーザー名の最大バイト数
pub const MAX_USER_NAME_LENGTH: usize = 8;

/// ログインハンドシェイクのステップ数（初回交換を除く）
pub const LOGIN_STEPS: usize = 9;

/// コマンド/レスポンスエンベロープのヘッダー定数
pub const COMMAND_HEADER: u16 = 0x9966;

/// ACK 規約: レスポンスの ack バイト = command_type + 0x80
pub const RESPONSE_ACK: u8 = 0x80;

/// 「データ要求」センチネル
pub const DATA_REQUEST: u32 = 0x8000_0000;

/// SETUP コマンドのパラメータ基底値
pub const SETUP_MAGIC: u32 = 0x003C_0000;

/// SETUP パラメータ中の最大プレイヤー数フィールドのビット位置
pub const SETUP_MAX_PLAYERS_BIT: u32 = 16;

/// SETUP の既定の最大再送回数
pub const SETUP_MAX_TRANSMISSIONS: u8 = 4;

/// SETUP の既定の待機タイムアウト
pub const SETUP_WAIT_TIMEOUT: u8 = 0x20;

/// 「まだ接続処理中」を表すレスポンス値
pub const STILL_CONNECTING: u32 = 0x0100_0000;

/// ブロードキャストデータのワード数
pub const BROADCAST_LENGTH: usize = 6;

/// ブロードキャストスキャン 1 件分のレスポンスワード数（id + データ）
pub const BROADCAST_RESPONSE_LENGTH: usize = 1 + BROADCAST_LENGTH;

/// ログインハンドシェイクの 16 ビットマジック値列
///
/// "NINTENDO" のリトルエンディアン 2 文字ペア + 終端 0x8001。
/// 各ステップは値を送ると同時に、直前の交換の補数エコーを検証する。
pub const LOGIN_PARTS: [u16; LOGIN_STEPS] = [
    0x494E, 0x494E, 0x544E, 0x544E, 0x4E45, 0x4E45, 0x4F44, 0x4F44, 0x8001,
];
