//! クライアントごとのスライディングウィンドウ会計
//!
//! 各クライアントは確定カーソル（ここまで ACK 済み）と、送出済みで
//! ACK 待ちのページ最大 4 件を持つ。ウィンドウが埋まったクライアントが
//! 1 台でもいる間は新しいページを出さず、未 ACK の最小ページを再送する。

use rfu_sdk::{SequenceNumber, MAX_PAYLOAD_SERVER};

use crate::MAX_INFLIGHT_PACKETS;

/// 送出済みで ACK 待ちのページ 1 件
#[derive(Debug, Clone, Copy, Default)]
struct PendingTransfer {
    cursor: u32,
    ack: bool,
    active: bool,
}

/// ACK 待ちページの固定長リスト（最大 4 件）
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingTransferList {
    transfers: [PendingTransfer; MAX_INFLIGHT_PACKETS],
}

impl PendingTransferList {
    /// アクティブな中で最大のカーソル（`ack_only` なら ACK 済みに限る）
    fn max(&self, ack_only: bool) -> Option<u32> {
        self.transfers
            .iter()
            .filter(|t| t.active && (!ack_only || t.ack))
            .map(|t| t.cursor)
            .max()
    }

    /// 未 ACK の最小カーソル
    fn min_without_ack(&self) -> Option<u32> {
        self.transfers
            .iter()
            .filter(|t| t.active && !t.ack)
            .map(|t| t.cursor)
            .min()
    }

    /// 既存の最大カーソルを超える場合だけ空きスロットに登録する
    fn add_if_needed(&mut self, new_cursor: u32) {
        if let Some(max_cursor) = self.max(false) {
            if new_cursor <= max_cursor {
                return;
            }
        }

        if let Some(slot) = self.transfers.iter_mut().find(|t| !t.active) {
            slot.cursor = new_cursor;
            slot.ack = false;
            slot.active = true;
        }
    }

    /// シーケンス番号に対応するページを ACK 済みにする
    ///
    /// ACK 済みの最大ページまでが隙間なく ACK されていれば、それらを
    /// リストから外し、新しい確定カーソル（最大 ACK ページ + 1）を返す。
    /// 隙間が残っている間は確定を進めない。
    pub fn ack(&mut self, sequence: SequenceNumber) -> Option<u32> {
        let index = self
            .transfers
            .iter()
            .position(|t| t.active && SequenceNumber::from_packet_id(t.cursor) == sequence)?;

        self.transfers[index].ack = true;

        let max_acked = self.max(true)?;
        if !self.is_ack_complete_up_to(max_acked) {
            return None;
        }

        self.cleanup();
        Some(max_acked + 1)
    }

    fn cleanup(&mut self) {
        for transfer in self.transfers.iter_mut() {
            if transfer.active && transfer.ack {
                transfer.active = false;
            }
        }
    }

    fn is_ack_complete_up_to(&self, cursor: u32) -> bool {
        !self
            .transfers
            .iter()
            .any(|t| t.active && !t.ack && t.cursor < cursor)
    }

    pub fn is_full(&self) -> bool {
        self.len() == MAX_INFLIGHT_PACKETS
    }

    pub fn len(&self) -> usize {
        self.transfers.iter().filter(|t| t.active).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// クライアント 1 台分の転送状態
#[derive(Debug, Clone, Copy, Default)]
pub struct Transfer {
    /// 確定カーソル: このページ未満はすべて ACK 済み
    pub cursor: u32,
    pub pending: PendingTransferList,
}

impl Transfer {
    /// 次に送るべきページ
    ///
    /// インフライト送出が許されていてウィンドウに余裕があれば
    /// 最大ページの次を、そうでなければ未 ACK の最小ページ
    /// （なければ確定カーソル）を返す。
    pub fn next_cursor(&self, can_send_inflight: bool) -> u32 {
        let pending_count = self.pending.len();

        if can_send_inflight && pending_count > 0 && pending_count < MAX_INFLIGHT_PACKETS {
            match self.pending.max(false) {
                Some(max_cursor) => max_cursor + 1,
                None => self.cursor,
            }
        } else {
            self.pending.min_without_ack().unwrap_or(self.cursor)
        }
    }

    /// 確定済みより前のページは登録しない
    pub fn add_if_needed(&mut self, new_cursor: u32) {
        if new_cursor >= self.cursor {
            self.pending.add_if_needed(new_cursor);
        }
    }

    /// このクライアントに確定済みのバイト数
    pub fn transferred(&self) -> u32 {
        self.cursor * MAX_PAYLOAD_SERVER as u32
    }
}
