//! 送信バッファの組み立て
//!
//! ペイロードのスライディングウィンドウ 1 ページ分を、ヘッダー込みの
//! ワード列に詰める。ヘッダーの `payload_size` は常に
//! `min(全ペイロード長, 最大ペイロード)` で宣言される。末尾の
//! 端数ページも宣言サイズは縮めず、足りないバイトはゼロ詰めになる
//! （公式ブートローダがこの形を期待する）。

use crate::header::{ClientHeader, SequenceNumber, ServerHeader, TargetSlots};
use crate::{
    HEADER_SIZE_CLIENT, HEADER_SIZE_SERVER, MAX_PAYLOAD_CLIENT, MAX_PAYLOAD_SERVER,
    MAX_TRANSFER_WORDS,
};

/// ワイヤに流す直前の送信バッファ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendBuffer<H> {
    pub header: H,
    pub data: [u32; MAX_TRANSFER_WORDS],
    pub data_size: usize,
    /// ヘッダー + 宣言ペイロードの総バイト数（送信バイト数として使う）
    pub total_byte_count: u32,
}

impl<H> SendBuffer<H> {
    /// 実際に転送するワード列
    pub fn words(&self) -> &[u32] {
        &self.data[..self.data_size]
    }
}

/// サーバーのデータパケットを組み立てる
///
/// `offset` から始まる 1 ページ分を詰める。先頭ワードは 24 ビットの
/// ヘッダーとペイロード先頭 1 バイトを共有する。
pub fn server_buffer(
    full_payload: &[u8],
    sequence: SequenceNumber,
    target_slots: TargetSlots,
    offset: usize,
) -> SendBuffer<ServerHeader> {
    let payload_size = full_payload.len().min(MAX_PAYLOAD_SERVER);
    let header = ServerHeader::data(payload_size as u8, sequence, target_slots);

    let mut data = [0u32; MAX_TRANSFER_WORDS];
    let mut data_size = 0;

    data[data_size] = header.serialize();
    data_size += 1;
    if offset < full_payload.len() {
        data[0] |= (full_payload[offset] as u32) << 24;
    }

    let mut i = 1;
    while i < payload_size {
        let mut word = 0u32;
        for j in 0..4 {
            if offset + i + j < full_payload.len() && i + j < MAX_PAYLOAD_SERVER {
                word |= (full_payload[offset + i + j] as u32) << (j * 8);
            }
        }
        data[data_size] = word;
        data_size += 1;
        i += 4;
    }

    SendBuffer {
        header,
        data,
        data_size,
        total_byte_count: (HEADER_SIZE_SERVER + payload_size) as u32,
    }
}

/// クライアントヘッダーをエコーするサーバー ACK パケット
pub fn server_ack_buffer(client_header: &ClientHeader, client_number: u8) -> SendBuffer<ServerHeader> {
    let header = ServerHeader::ack_for(client_header, client_number);

    let mut data = [0u32; MAX_TRANSFER_WORDS];
    data[0] = header.serialize();

    SendBuffer {
        header,
        data,
        data_size: 1,
        total_byte_count: HEADER_SIZE_SERVER as u32,
    }
}

/// クライアントのデータパケットを組み立てる
///
/// 先頭ワードは 16 ビットのヘッダーとペイロード先頭 2 バイトを共有する。
pub fn client_buffer(
    full_payload: &[u8],
    sequence: SequenceNumber,
    offset: usize,
) -> SendBuffer<ClientHeader> {
    let payload_size = full_payload.len().min(MAX_PAYLOAD_CLIENT);
    let header = ClientHeader::data(payload_size as u8, sequence);

    let mut data = [0u32; MAX_TRANSFER_WORDS];
    let mut data_size = 0;

    data[data_size] = header.serialize() as u32;
    data_size += 1;
    if offset < full_payload.len() {
        data[0] |= (full_payload[offset] as u32) << 16;
    }
    if offset + 1 < full_payload.len() {
        data[0] |= (full_payload[offset + 1] as u32) << 24;
    }

    let mut i = 2;
    while i < payload_size {
        let mut word = 0u32;
        for j in 0..4 {
            if offset + i + j < full_payload.len() && i + j < MAX_PAYLOAD_CLIENT {
                word |= (full_payload[offset + i + j] as u32) << (j * 8);
            }
        }
        data[data_size] = word;
        data_size += 1;
        i += 4;
    }

    SendBuffer {
        header,
        data,
        data_size,
        total_byte_count: (HEADER_SIZE_CLIENT + payload_size) as u32,
    }
}

/// サーバーヘッダーをエコーするクライアント ACK パケット
pub fn client_ack_buffer(server_header: &ServerHeader) -> SendBuffer<ClientHeader> {
    let header = ClientHeader::ack_for(server_header);

    let mut data = [0u32; MAX_TRANSFER_WORDS];
    data[0] = header.serialize() as u32;

    SendBuffer {
        header,
        data,
        data_size: 1,
        total_byte_count: HEADER_SIZE_CLIENT as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CommState;

    #[test]
    fn test_server_buffer_packs_first_byte_into_header_word() {
        let payload = [0xAB, 0x01, 0x02, 0x03, 0x04, 0x05];
        let seq = SequenceNumber::new(1, 0, CommState::Communicating);
        let buffer = server_buffer(&payload, seq, TargetSlots::ALL, 0);

        // ペイロード 6 バイト → ヘッダーワード + 2 ワード
        assert_eq!(buffer.data_size, 3);
        assert_eq!(buffer.total_byte_count, 3 + 6);
        assert_eq!(buffer.header.payload_size, 6);
        // 先頭ワード: ヘッダー 24 ビット + payload[0] が最上位バイト
        assert_eq!(buffer.data[0] >> 24, 0xAB);
        assert_eq!(buffer.data[0] & 0x00FF_FFFF, buffer.header.serialize());
        // 続くワードはバイト 1.. をリトルエンディアンで詰める
        assert_eq!(buffer.data[1], 0x0403_0201);
        assert_eq!(buffer.data[2], 0x0000_0005);
    }

    #[test]
    fn test_server_buffer_full_page_uses_22_words() {
        let payload = [0x11u8; 200];
        let seq = SequenceNumber::from_packet_id(0);
        let buffer = server_buffer(&payload, seq, TargetSlots::ALL, 0);

        // 84 バイト = ヘッダーワード + 83 バイト分 21 ワード
        assert_eq!(buffer.header.payload_size, 84);
        assert_eq!(buffer.data_size, 22);
        assert_eq!(buffer.total_byte_count, 87);
    }

    #[test]
    fn test_server_buffer_last_page_keeps_declared_size() {
        // 100 バイトのうちオフセット 84 から: 残り 16 バイトでも
        // 宣言サイズは min(100, 84) = 84 のまま、残りはゼロ詰め
        let mut payload = [0u8; 100];
        payload[84] = 0xEE;
        payload[99] = 0xFF;
        let seq = SequenceNumber::from_packet_id(1);
        let buffer = server_buffer(&payload, seq, TargetSlots::ALL, 84);

        assert_eq!(buffer.header.payload_size, 84);
        assert_eq!(buffer.total_byte_count, 87);
        assert_eq!(buffer.data[0] >> 24, 0xEE);
        // バイト 15（= payload[99]）はワード 4 の位置 (15-1)%4=2
        assert_eq!(buffer.data[4], 0x00FF_0000);
        // それ以降はゼロ
        assert_eq!(buffer.data[5], 0);
    }

    #[test]
    fn test_server_ack_buffer_is_header_only() {
        let client = ClientHeader::data(14, SequenceNumber::new(2, 1, CommState::Communicating));
        let buffer = server_ack_buffer(&client, 2);

        assert_eq!(buffer.data_size, 1);
        assert_eq!(buffer.total_byte_count, 3);
        assert!(buffer.header.is_ack);
        assert_eq!(buffer.header.target_slots, TargetSlots::SLOT_2);
        assert_eq!(buffer.header.sequence(), client.sequence());
    }

    #[test]
    fn test_client_buffer_packs_first_two_bytes_into_header_word() {
        let payload = [0xAA, 0xBB, 0xCC, 0xDD];
        let seq = SequenceNumber::new(1, 2, CommState::Communicating);
        let buffer = client_buffer(&payload, seq, 0);

        assert_eq!(buffer.header.payload_size, 4);
        assert_eq!(buffer.total_byte_count, 2 + 4);
        assert_eq!(buffer.data_size, 2);
        // 先頭ワード: 16 ビットヘッダー + バイト 0, 1
        assert_eq!(buffer.data[0] >> 16, 0xBBAA);
        assert_eq!(buffer.data[0] & 0xFFFF, buffer.header.serialize() as u32);
        // バイト 2.. は次のワードから
        assert_eq!(buffer.data[1], 0x0000_DDCC);
    }

    #[test]
    fn test_client_buffer_caps_payload_at_14_bytes() {
        let payload = [0x22u8; 30];
        let buffer = client_buffer(&payload, SequenceNumber::from_packet_id(0), 0);

        assert_eq!(buffer.header.payload_size, 14);
        assert_eq!(buffer.total_byte_count, 16);
        // ヘッダーワード + バイト 2..14 の 3 ワード
        assert_eq!(buffer.data_size, 4);
    }

    #[test]
    fn test_client_ack_buffer_echoes_server_sequence() {
        let server = ServerHeader::data(84, SequenceNumber::new(3, 1, CommState::Ending), TargetSlots::ALL);
        let buffer = client_ack_buffer(&server);

        assert_eq!(buffer.data_size, 1);
        assert_eq!(buffer.total_byte_count, 2);
        assert!(buffer.header.is_ack);
        assert_eq!(buffer.header.sequence(), server.sequence());
    }

    #[test]
    fn test_empty_payload_yields_header_only_buffer() {
        let buffer = server_buffer(&[], SequenceNumber::from_packet_id(0), TargetSlots::ALL, 0);
        assert_eq!(buffer.header.payload_size, 0);
        assert_eq!(buffer.data_size, 1);
        assert_eq!(buffer.total_byte_count, 3);
    }
}
