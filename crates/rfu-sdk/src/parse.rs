//! 受信バッファの復号
//!
//! 共有受信バッファ（rfu-raw の [`ReceiveDataResponse`]）をプレイヤー
//! ごとのパケット列にほどく。切り詰め耐性あり: 宣言バイト数が実際の
//! バッファより大きい場合は空の結果を返し、個々のパケットの
//! ペイロードが足りない場合はヘッダーだけを残す。

use alloc::vec::Vec;

use rfu_raw::ReceiveDataResponse;

use crate::header::{ClientHeader, ServerHeader};
use crate::{HEADER_SIZE_CLIENT, HEADER_SIZE_SERVER, MAX_PAYLOAD_CLIENT, MAX_PAYLOAD_SERVER};

/// 復号済みのサーバーパケット 1 つ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPacket {
    pub header: ServerHeader,
    /// ペイロードが切り詰められていた場合は空
    pub payload: Vec<u8>,
}

/// 復号済みのクライアントパケット 1 つ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPacket {
    pub header: ClientHeader,
    /// ペイロードが切り詰められていた場合は空
    pub payload: Vec<u8>,
}

/// ホストから受信したパケット列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerResponse {
    pub packets: Vec<ServerPacket>,
}

/// クライアント 1 台から受信したパケット列
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientResponse {
    pub packets: Vec<ClientPacket>,
}

/// 全クライアント分の復号結果（インデックス = クライアント番号）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildrenData {
    pub responses: [ClientResponse; 4],
}

/// ホスト分の復号結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParentData {
    pub response: ServerResponse,
}

/// 共有受信バッファからクライアント各台のパケットをほどく（ホスト側で使う）
pub fn children_data(response: &ReceiveDataResponse) -> ChildrenData {
    let mut children = ChildrenData::default();

    let declared: u32 = response.sent_bytes[1..].iter().sum();
    if declared as usize > response.data.len() * 4 {
        return children;
    }

    let buffer = flatten(&response.data);
    let mut cursor = 0;

    for (client, slot) in children.responses.iter_mut().enumerate() {
        let mut remaining = response.sent_bytes[1 + client] as usize;

        while remaining >= HEADER_SIZE_CLIENT {
            let header_int = buffer[cursor] as u16 | (buffer[cursor + 1] as u16) << 8;
            let header = ClientHeader::deserialize(header_int);
            cursor += HEADER_SIZE_CLIENT;
            remaining -= HEADER_SIZE_CLIENT;

            let size = header.payload_size as usize;
            let mut payload = Vec::new();
            if size > 0 && size <= MAX_PAYLOAD_CLIENT && remaining >= size {
                payload.extend_from_slice(&buffer[cursor..cursor + size]);
                cursor += size;
                remaining -= size;
            }

            slot.packets.push(ClientPacket { header, payload });
        }
    }

    children
}

/// 共有受信バッファからホストのパケットをほどく（クライアント側で使う）
pub fn parent_data(response: &ReceiveDataResponse) -> ParentData {
    let mut parent = ParentData::default();

    if response.sent_bytes[0] as usize > response.data.len() * 4 {
        return parent;
    }

    let buffer = flatten(&response.data);
    let mut cursor = 0;
    let mut remaining = response.sent_bytes[0] as usize;

    while remaining >= HEADER_SIZE_SERVER {
        let header_int = buffer[cursor] as u32
            | (buffer[cursor + 1] as u32) << 8
            | (buffer[cursor + 2] as u32) << 16;
        let header = ServerHeader::deserialize(header_int);
        cursor += HEADER_SIZE_SERVER;
        remaining -= HEADER_SIZE_SERVER;

        let size = header.payload_size as usize;
        let mut payload = Vec::new();
        if size > 0 && size <= MAX_PAYLOAD_SERVER && remaining >= size {
            payload.extend_from_slice(&buffer[cursor..cursor + size]);
            cursor += size;
            remaining -= size;
        }

        parent.response.packets.push(ServerPacket { header, payload });
    }

    parent
}

/// ワード列をリトルエンディアンのバイト列に展開する
fn flatten(data: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * 4);
    for &word in data {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}
