//! 注入式ログシンク
//!
//! ドライバとエンジンはログ先をグローバル関数ポインタではなく
//! trait として受け取る。デフォルトは [`NullLogger`]（no-op）。

/// ログシンクの契約
pub trait Logger {
    /// 1 行のメッセージを受け取る
    fn log(&mut self, message: &str);
}

/// 何もしないロガー（デフォルト）
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&mut self, _message: &str) {}
}

/// 可変参照越しでもログできるようにする
impl<L: Logger + ?Sized> Logger for &mut L {
    fn log(&mut self, message: &str) {
        (**self).log(message);
    }
}
