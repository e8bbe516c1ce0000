//! アダプタ ping 用の GPIO 契約

/// シリアルポートの物理ピン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pin {
    /// クロック
    Sc,
    /// データ
    Sd,
    /// シリアル入力
    Si,
    /// シリアル出力
    So,
}

/// ピンの入出力方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// ピンレベル操作の契約
///
/// ワイヤレスアダプタの存在確認（ping）でのみ使用する。
/// 通常の転送は [`crate::SerialBus`] 側が担当する。
pub trait Gpio {
    /// ピンの入出力方向を設定する
    fn set_mode(&mut self, pin: Pin, direction: Direction);

    /// ピンのレベルを書き込む（true = HIGH）
    fn write_pin(&mut self, pin: Pin, level: bool);
}
