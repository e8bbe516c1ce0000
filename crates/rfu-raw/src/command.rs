//! コマンド ID とレスポンスのデータ型
//!
//! アダプタのレスポンスワード列を構造化データに復元する純粋なコーデック。
//! 実際の転送は `driver` モジュールが担当する。

use alloc::string::String;
use alloc::vec::Vec;

use bit_field::BitField;

use crate::{BROADCAST_LENGTH, MAX_GAME_ID, MAX_PLAYERS};

/// HELLO（認証後の疎通確認）
pub const CMD_HELLO: u8 = 0x10;
/// スロット状態の取得
pub const CMD_SLOT_STATUS: u8 = 0x14;
/// ブロードキャストデータの設定
pub const CMD_BROADCAST: u8 = 0x16;
/// セッションパラメータの設定
pub const CMD_SETUP: u8 = 0x17;
/// ホスト開始
pub const CMD_START_HOST: u8 = 0x19;
/// 接続受け付けポーリング
pub const CMD_ACCEPT_CONNECTIONS: u8 = 0x1A;
/// 新規受け付けの停止
pub const CMD_END_HOST: u8 = 0x1B;
/// ブロードキャストスキャン開始
pub const CMD_BROADCAST_READ_START: u8 = 0x1C;
/// ブロードキャストスキャンのポーリング
pub const CMD_BROADCAST_READ_POLL: u8 = 0x1D;
/// ブロードキャストスキャン終了
pub const CMD_BROADCAST_READ_END: u8 = 0x1E;
/// サーバーへの接続開始
pub const CMD_CONNECT: u8 = 0x1F;
/// 接続完了の確認ポーリング
pub const CMD_IS_FINISHED_CONNECT: u8 = 0x20;
/// 接続の確定
pub const CMD_FINISH_CONNECTION: u8 = 0x21;
/// データ送信
pub const CMD_SEND_DATA: u8 = 0x24;
/// データ送信 + アダプタ発コマンド待ち
pub const CMD_SEND_DATA_AND_WAIT: u8 = 0x25;
/// 受信データの取得
pub const CMD_RECEIVE_DATA: u8 = 0x26;
/// アダプタ発コマンド待ち
pub const CMD_WAIT: u8 = 0x27;
/// セッション終了
pub const CMD_BYE: u8 = 0x3D;

/// アダプタ発のイベント通知コマンド（データ到着/子機状態）
pub const CMD_EVENT: u8 = 0x28;

// ===== ワード組み立てヘルパー =====

pub(crate) fn build_u32(ms: u16, ls: u16) -> u32 {
    ((ms as u32) << 16) | ls as u32
}

pub(crate) fn build_u16(ms: u8, ls: u8) -> u16 {
    ((ms as u16) << 8) | ls as u16
}

pub(crate) fn msb32(value: u32) -> u16 {
    (value >> 16) as u16
}

pub(crate) fn lsb32(value: u32) -> u16 {
    (value & 0xFFFF) as u16
}

pub(crate) fn msb16(value: u16) -> u8 {
    (value >> 8) as u8
}

pub(crate) fn lsb16(value: u16) -> u8 {
    (value & 0xFF) as u8
}

/// アダプタ（スレーブ化時）から push されたコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// コマンド ID（イベント通知は 0x28）
    pub command_id: u8,
    /// パラメータワード列
    pub params: Vec<u32>,
}

/// ブロードキャストスキャンで発見したセッション
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    /// セッション ID
    pub id: u16,
    /// ゲーム ID（最上位ビットはマルチブートフラグとして予約）
    pub game_id: u16,
    /// ゲーム名（最大 14 バイト）
    pub game_name: String,
    /// ユーザー名（最大 8 バイト）
    pub user_name: String,
    /// 次に割り当てられるクライアント番号
    pub next_client_number: u8,
}

impl Server {
    /// セッションが満員か（クライアント枠なし）
    pub fn is_full(&self) -> bool {
        self.next_client_number == 0xFF
    }
}

/// 接続済みクライアント 1 台分の情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedClient {
    pub device_id: u16,
    pub client_number: u8,
}

impl ConnectedClient {
    /// レスポンスワード（下位 16 = device id, 上位 = クライアント番号）から復元する
    fn from_word(word: u32) -> Self {
        ConnectedClient {
            device_id: lsb32(word),
            client_number: msb32(word) as u8,
        }
    }
}

/// スロット状態（0x14）のレスポンス
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotStatusResponse {
    pub next_client_number: u8,
    pub connected_clients: Vec<ConnectedClient>,
}

impl SlotStatusResponse {
    pub(crate) fn from_words(words: &[u32]) -> Self {
        let mut response = SlotStatusResponse::default();
        for (i, &word) in words.iter().enumerate() {
            if i == 0 {
                response.next_client_number = lsb16(lsb32(word));
            } else {
                response.connected_clients.push(ConnectedClient::from_word(word));
            }
        }
        response
    }
}

/// 接続受け付け（0x1A）/ ホスト終了（0x1B）のレスポンス
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptConnectionsResponse {
    pub connected_clients: Vec<ConnectedClient>,
}

impl AcceptConnectionsResponse {
    pub(crate) fn from_words(words: &[u32]) -> Self {
        AcceptConnectionsResponse {
            connected_clients: words.iter().map(|&w| ConnectedClient::from_word(w)).collect(),
        }
    }
}

/// 接続処理の進行段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    StillConnecting,
    Success,
}

/// 接続完了確認（0x20）のレスポンス
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub assigned_client_number: u8,
}

/// 受信データ（0x26）のレスポンス
///
/// 先頭ワードは「各プレイヤーが何バイト寄与したか」を固定ビット幅で
/// 詰め込んだヘッダー。ホスト分が 7 ビット、クライアント 4 台分が
/// 各 5 ビット。
///
/// ```text
/// [sent_bytes[4]: 5bit][sent_bytes[3]: 5bit][sent_bytes[2]: 5bit]
/// [sent_bytes[1]: 5bit][reserved: 1bit][sent_bytes[0]: 7bit]
///  bit 23..28            bit 18..23       bit 13..18
///  bit 8..13                              bit 0..7
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveDataResponse {
    /// プレイヤーごとの寄与バイト数（インデックス 0 = ホスト）
    pub sent_bytes: [u32; MAX_PLAYERS],
    /// ヘッダーを除いた共有受信バッファ
    pub data: Vec<u32>,
}

impl ReceiveDataResponse {
    /// レスポンスワード列からヘッダーを剥がして復元する
    pub fn from_words(mut words: Vec<u32>) -> Self {
        let mut sent_bytes = [0u32; MAX_PLAYERS];

        if !words.is_empty() {
            let header = words.remove(0);
            sent_bytes[0] = header.get_bits(0..7);
            sent_bytes[1] = header.get_bits(8..13);
            sent_bytes[2] = header.get_bits(13..18);
            sent_bytes[3] = header.get_bits(18..23);
            sent_bytes[4] = header.get_bits(23..28);
        }

        ReceiveDataResponse { sent_bytes, data: words }
    }
}

/// 送信ヘッダーワードを組み立てる
///
/// ホスト（player_id = 0）はバイト数をそのまま、クライアントは
/// 自分のビット位置（3 + 5 * player_id）にシフトして載せる。
/// 受信側はこの配置を `ReceiveDataResponse` のヘッダーとして復号する。
pub(crate) fn send_data_header(bytes: u32, player_id: u8) -> u32 {
    if player_id == 0 {
        bytes
    } else {
        bytes << (3 + player_id as u32 * 5)
    }
}

/// ブロードキャストデータ 6 ワードを組み立てる
///
/// ゲーム名は 14 バイト、ユーザー名は 8 バイトにゼロ詰めしてから
/// 2 バイトずつリトルエンディアンでワードに載せる。
pub(crate) fn broadcast_words(game_name: &[u8], user_name: &[u8], game_id: u16) -> [u32; BROADCAST_LENGTH] {
    let mut game = [0u8; 14];
    game[..game_name.len()].copy_from_slice(game_name);
    let mut user = [0u8; 8];
    user[..user_name.len()].copy_from_slice(user_name);

    [
        build_u32(build_u16(game[1], game[0]), game_id),
        build_u32(build_u16(game[5], game[4]), build_u16(game[3], game[2])),
        build_u32(build_u16(game[9], game[8]), build_u16(game[7], game[6])),
        build_u32(build_u16(game[13], game[12]), build_u16(game[11], game[10])),
        build_u32(build_u16(user[3], user[2]), build_u16(user[1], user[0])),
        build_u32(build_u16(user[7], user[6]), build_u16(user[5], user[4])),
    ]
}

/// ブロードキャストレスポンスのワードから名前バイトを復元する
///
/// ゼロバイトは終端詰め物なのでスキップする。
pub(crate) fn recover_name(name: &mut String, word: u32, include_first_two_bytes: bool) {
    if include_first_two_bytes {
        push_if_nonzero(name, lsb16(lsb32(word)));
        push_if_nonzero(name, msb16(lsb32(word)));
    }
    push_if_nonzero(name, lsb16(msb32(word)));
    push_if_nonzero(name, msb16(msb32(word)));
}

fn push_if_nonzero(name: &mut String, byte: u8) {
    if byte > 0 {
        name.push(byte as char);
    }
}

/// ブロードキャストスキャン 7 ワード 1 件分を [`Server`] に復元する
pub(crate) fn parse_server(words: &[u32]) -> Server {
    let mut server = Server {
        id: words[0] as u16,
        game_id: lsb32(words[1]) & MAX_GAME_ID,
        game_name: String::new(),
        user_name: String::new(),
        next_client_number: ((words[0] >> 16) & 0xFF) as u8,
    };
    recover_name(&mut server.game_name, words[1], false);
    recover_name(&mut server.game_name, words[2], true);
    recover_name(&mut server.game_name, words[3], true);
    recover_name(&mut server.game_name, words[4], true);
    recover_name(&mut server.user_name, words[5], true);
    recover_name(&mut server.user_name, words[6], true);
    server
}
