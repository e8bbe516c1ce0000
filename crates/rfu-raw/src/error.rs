//! rfu-raw エラー型
//!
//! どのエラーでもドライバはセッション状態を NEEDS_RESET に戻してから
//! 返す。リトライはしない（リトライ方針は呼び出し側の責任）。

/// アダプタが 0xEE エラー ACK と共に返すエラーコード
///
/// コード 1 は「状態不正」。それ以外の意味は上流でも未規定のため、
/// 不透明な値としてそのまま保持する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// 現在のアダプタ状態では実行できないコマンド（コード 1）
    InvalidState,
    /// 未知のコマンド/未規定のエラーコード
    Unknown(u8),
}

/// 低レベルドライバのエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterError {
    /// スキャンライン予算内にバスが応答しなかった
    Timeout,
    /// 期待したワードと異なる値を受信した（センチネル/ログイン検証）
    Unexpected { expected: u32, received: u32 },
    /// レスポンスエンベロープのヘッダーが 0x9966 ではない
    BadHeader { received: u16 },
    /// ACK バイトが command_type + 0x80 ではない
    BadAck { expected: u8, received: u8 },
    /// アダプタが 0xEE エラー ACK を返した
    Command(CommandError),
    /// レスポンスワードが必要なのに空だった
    EmptyResponse,
    /// レスポンスワード数が期待する形と合わない
    MalformedResponse,
    /// 接続処理がアダプタ側で失敗した
    ConnectionFailed,
    /// ゲーム名/ユーザー名が最大長を超えている
    NameTooLong,
}

impl core::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AdapterError::Timeout => write!(f, "Bus timeout (scanline budget exceeded)"),
            AdapterError::Unexpected { expected, received } => {
                write!(f, "Expected 0x{:08X} but received 0x{:08X}", expected, received)
            }
            AdapterError::BadHeader { received } => {
                write!(f, "Expected header 0x9966 but received 0x{:04X}", received)
            }
            AdapterError::BadAck { expected, received } => {
                write!(f, "Expected ACK 0x{:02X} but received 0x{:02X}", expected, received)
            }
            AdapterError::Command(CommandError::InvalidState) => {
                write!(f, "Adapter error: invalid state")
            }
            AdapterError::Command(CommandError::Unknown(code)) => {
                write!(f, "Adapter error: unknown command (code {})", code)
            }
            AdapterError::EmptyResponse => write!(f, "Empty response"),
            AdapterError::MalformedResponse => write!(f, "Malformed response"),
            AdapterError::ConnectionFailed => write!(f, "Connection failed"),
            AdapterError::NameTooLong => write!(f, "Game or user name too long"),
        }
    }
}
