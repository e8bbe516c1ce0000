//! パケットヘッダーとシーケンス番号

use bit_field::BitField;
use bitflags::bitflags;

/// パケットの通信段階（4 ビットフィールド）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommState {
    #[default]
    Off = 0,
    Starting = 1,
    Communicating = 2,
    Ending = 3,
    Direct = 4,
}

impl CommState {
    /// 4 ビット値から復元する。未定義値は Off として扱う。
    fn from_bits(value: u32) -> Self {
        match value {
            1 => CommState::Starting,
            2 => CommState::Communicating,
            3 => CommState::Ending,
            4 => CommState::Direct,
            _ => CommState::Off,
        }
    }
}

bitflags! {
    /// サーバーパケットの宛先スロット（クライアント 0..=3 のビットマスク）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetSlots: u8 {
        const SLOT_0 = 0b0001;
        const SLOT_1 = 0b0010;
        const SLOT_2 = 0b0100;
        const SLOT_3 = 0b1000;
        const ALL    = 0b1111;
    }
}

impl TargetSlots {
    /// クライアント番号 1 台分のマスク
    pub fn for_client(client_number: u8) -> Self {
        TargetSlots::from_bits_truncate(1 << client_number)
    }
}

/// シーケンス番号（n, phase, commState の 3 つ組）
///
/// phase は 0..=3 で回り、4 パケットごとに n が 0..=3 で回る。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceNumber {
    pub n: u8,
    pub phase: u8,
    pub comm_state: CommState,
}

impl SequenceNumber {
    pub fn new(n: u8, phase: u8, comm_state: CommState) -> Self {
        SequenceNumber { n, phase, comm_state }
    }

    /// 通し番号（パケット ID）から COMMUNICATING のシーケンス番号を導く
    ///
    /// パケット ID 0 は n=1, phase=0 から始まる。
    pub fn from_packet_id(packet_id: u32) -> Self {
        SequenceNumber {
            n: (((packet_id + 4) / 4) % 4) as u8,
            phase: (packet_id % 4) as u8,
            comm_state: CommState::Communicating,
        }
    }
}

/// サーバーパケットのヘッダー（ワイヤ上は 24 ビット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerHeader {
    pub payload_size: u8,
    pub phase: u8,
    pub n: u8,
    pub is_ack: bool,
    pub comm_state: CommState,
    pub target_slots: TargetSlots,
}

impl ServerHeader {
    /// データパケット用のヘッダー
    pub fn data(payload_size: u8, sequence: SequenceNumber, target_slots: TargetSlots) -> Self {
        ServerHeader {
            payload_size,
            phase: sequence.phase,
            n: sequence.n,
            is_ack: false,
            comm_state: sequence.comm_state,
            target_slots,
        }
    }

    /// クライアントヘッダーに対する ACK ヘッダー
    ///
    /// シーケンス番号をエコーし、宛先はそのクライアント 1 台のみ。
    pub fn ack_for(client_header: &ClientHeader, client_number: u8) -> Self {
        ServerHeader {
            payload_size: 0,
            phase: client_header.phase,
            n: client_header.n,
            is_ack: true,
            comm_state: client_header.comm_state,
            target_slots: TargetSlots::for_client(client_number),
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.n, self.phase, self.comm_state)
    }

    pub fn serialize(&self) -> u32 {
        let mut value = 0u32;
        value.set_bits(0..7, self.payload_size as u32);
        value.set_bits(9..11, self.phase as u32);
        value.set_bits(11..13, self.n as u32);
        value.set_bits(13..14, self.is_ack as u32);
        value.set_bits(14..18, self.comm_state as u32);
        value.set_bits(18..22, self.target_slots.bits() as u32);
        value
    }

    pub fn deserialize(value: u32) -> Self {
        ServerHeader {
            payload_size: value.get_bits(0..7) as u8,
            phase: value.get_bits(9..11) as u8,
            n: value.get_bits(11..13) as u8,
            is_ack: value.get_bits(13..14) != 0,
            comm_state: CommState::from_bits(value.get_bits(14..18)),
            target_slots: TargetSlots::from_bits_truncate(value.get_bits(18..22) as u8),
        }
    }
}

/// クライアントパケットのヘッダー（ワイヤ上は 16 ビット）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientHeader {
    pub payload_size: u8,
    pub phase: u8,
    pub n: u8,
    pub is_ack: bool,
    pub comm_state: CommState,
}

impl ClientHeader {
    /// データパケット用のヘッダー
    pub fn data(payload_size: u8, sequence: SequenceNumber) -> Self {
        ClientHeader {
            payload_size,
            phase: sequence.phase,
            n: sequence.n,
            is_ack: false,
            comm_state: sequence.comm_state,
        }
    }

    /// サーバーヘッダーに対する ACK ヘッダー（シーケンス番号をエコー）
    pub fn ack_for(server_header: &ServerHeader) -> Self {
        ClientHeader {
            payload_size: 0,
            phase: server_header.phase,
            n: server_header.n,
            is_ack: true,
            comm_state: server_header.comm_state,
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.n, self.phase, self.comm_state)
    }

    pub fn serialize(&self) -> u16 {
        let mut value = 0u16;
        value.set_bits(0..5, self.payload_size as u16);
        value.set_bits(5..7, self.phase as u16);
        value.set_bits(7..9, self.n as u16);
        value.set_bits(9..10, self.is_ack as u16);
        value.set_bits(10..14, self.comm_state as u16);
        value
    }

    pub fn deserialize(value: u16) -> Self {
        ClientHeader {
            payload_size: value.get_bits(0..5) as u8,
            phase: value.get_bits(5..7) as u8,
            n: value.get_bits(7..9) as u8,
            is_ack: value.get_bits(9..10) != 0,
            comm_state: CommState::from_bits(value.get_bits(10..14) as u32),
        }
    }
}
