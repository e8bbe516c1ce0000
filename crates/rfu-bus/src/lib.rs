//! # rfu-bus
//!
//! ワイヤレスアダプタスタックが依存する外部コラボレータの契約（trait）。
//!
//! 実際のビット転送・ピン操作はこのクレートでは実装しない。
//! 実機ではシリアルポートのレジスタ操作、テストではモックが実装する。
//!
//! ## 提供する契約
//!
//! - [`SerialBus`]: 32 ビットワードの同期転送とモード切り替え
//! - [`Gpio`]: アダプタ ping 専用のピンレベル操作
//! - [`VCounter`]: スキャンラインカウンタ（タイムアウトの時間源）
//! - [`Logger`]: 注入式ログシンク（デフォルトは no-op）
//!
//! ## タイムアウトの設計
//!
//! 壁時計ではなくハードウェアのスキャンラインカウンタ（0..=227）の
//! 変化回数で経過を数える。カウンタのラップアラウンドは負の差分を
//! ゼロ加算として扱い、単一の待機中でも破綻しない。

#![no_std]
extern crate alloc;

pub mod gpio;
pub mod logger;
pub mod vcount;

pub use gpio::{Direction, Gpio, Pin};
pub use logger::{Logger, NullLogger};
pub use vcount::{wait_lines, ScanlineBudget, VCounter};

/// 転送失敗・データなしを表すセンチネル値
pub const NO_DATA: u32 = 0xFFFF_FFFF;

/// 1 フレームのスキャンライン数（0..=227 でラップする）
pub const FRAME_LINES: u32 = 228;

/// シリアルバスの動作モード
///
/// アダプタのログインハンドシェイクは低速（256Kbps）で行い、
/// 認証後は高速（2Mbps）に切り替える。スレーブモードは
/// アダプタ側から push されるコマンドの受信時のみ使用する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    /// マスター 256Kbps（ログインハンドシェイク用の低速モード）
    Master256Kbps,
    /// マスター 2Mbps（通常のコマンド送受信）
    Master2Mbps,
    /// スレーブ（アダプタ発コマンドの受信時のみ）
    Slave,
}

/// 同期シリアルバスの転送プリミティブ
///
/// 1 回の `transfer` は 32 ビットワードを送信すると同時に
/// 相手側のワードを受信する（全二重）。タイムアウト判定は
/// 呼び出し側が注入する述語で行う（スキャンライン数ベース）。
pub trait SerialBus {
    /// ワードを転送し、受信したワードを返す
    ///
    /// # 引数
    /// - `data`: 送信する 32 ビットワード
    /// - `timeout`: 真を返したら転送を打ち切る述語。打ち切り時は [`NO_DATA`] を返す
    /// - `is_bit_banged`: GPIO ビットバング転送を使うか
    /// - `custom_ack`: ハードウェア ACK を抑止し、呼び出し側の
    ///   acknowledge プロトコルに委ねるか
    fn transfer(
        &mut self,
        data: u32,
        timeout: &mut dyn FnMut() -> bool,
        is_bit_banged: bool,
        custom_ack: bool,
    ) -> u32;

    /// バスを指定モードで有効化する
    fn activate(&mut self, mode: BusMode);

    /// バスを無効化する
    fn deactivate(&mut self);

    /// SI ラインが HIGH か（acknowledge プロトコル用の生プローブ）
    fn is_si_high(&self) -> bool;

    /// SO ラインを LOW にする
    fn set_so_low(&mut self);

    /// SO ラインを HIGH にする
    fn set_so_high(&mut self);
}
