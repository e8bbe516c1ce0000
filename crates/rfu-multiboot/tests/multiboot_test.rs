//! マルチブート転送の結合テスト
//!
//! アダプタ + ブートローダクライアントを丸ごとシミュレートし、
//! ログイン・ハンドシェイク・ウィンドウ再送・確認・終了処理まで
//! エンジンの全経路を通す。

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use rfu_bus::{BusMode, Direction, Gpio, Pin, SerialBus, VCounter, NO_DATA};
use rfu_multiboot::{
    MultibootEngine, MultibootError, State, BOOTLOADER_HANDSHAKE, ROM_HEADER_PATCH,
    ROM_HEADER_PATCH_OFFSET,
};
use rfu_raw::{ReceiveDataResponse, DATA_REQUEST, LOGIN_PARTS};
use rfu_sdk::{
    client_buffer, parent_data, ClientHeader, CommState, SequenceNumber, ServerPacket,
    TargetSlots,
};

const LOGIN_EXCHANGES: usize = 10;

/// ブートローダを装うスクリプト駆動のクライアント
struct ClientSim {
    device_id: u16,
    /// ハンドシェイク中に 1 交換ごとに 1 つ送るパケット列
    script: VecDeque<(ClientHeader, Vec<u8>)>,
    /// 真ならデータパケット 2 回に 1 回しか ACK しない
    flaky: bool,
    data_count: u32,
    pending_acks: VecDeque<ClientHeader>,
    outbox: Vec<u8>,
    /// 受信した COMMUNICATING パケット（シーケンス、ペイロード）
    received: Vec<(SequenceNumber, Vec<u8>)>,
    saw_off: bool,
}

impl ClientSim {
    fn bootloader(device_id: u16, flaky: bool) -> Self {
        let mut script = VecDeque::new();
        let starting = ClientHeader {
            payload_size: 0,
            phase: 0,
            n: 2,
            is_ack: false,
            comm_state: CommState::Starting,
        };
        // 最初の 1 パケットは内容不問で消費されるので STARTING を 2 回
        script.push_back((starting, Vec::new()));
        script.push_back((starting, Vec::new()));
        script.push_back((
            ClientHeader::data(6, SequenceNumber::new(1, 0, CommState::Communicating)),
            BOOTLOADER_HANDSHAKE[0].to_vec(),
        ));
        script.push_back((
            ClientHeader::data(6, SequenceNumber::new(1, 1, CommState::Communicating)),
            BOOTLOADER_HANDSHAKE[1].to_vec(),
        ));
        script.push_back((
            ClientHeader {
                payload_size: 0,
                phase: 0,
                n: 0,
                is_ack: false,
                comm_state: CommState::Off,
            },
            Vec::new(),
        ));

        ClientSim {
            device_id,
            script,
            flaky,
            data_count: 0,
            pending_acks: VecDeque::new(),
            outbox: Vec::new(),
            received: Vec::new(),
            saw_off: false,
        }
    }

    /// 名乗りのペイロードが壊れているクライアント
    fn impostor(device_id: u16) -> Self {
        let mut client = ClientSim::bootloader(device_id, false);
        client.script[3].1 = vec![0xBA, 0xD0, 0xBA, 0xD0, 0xBA, 0xD0];
        client
    }

    fn on_server_packet(&mut self, packet: &ServerPacket) {
        let header = packet.header;
        if header.is_ack {
            return;
        }
        match header.comm_state {
            CommState::Off => self.saw_off = true,
            CommState::Starting | CommState::Communicating | CommState::Ending => {
                if header.comm_state == CommState::Communicating {
                    self.received.push((header.sequence(), packet.payload.clone()));
                }
                self.data_count += 1;
                if !self.flaky || self.data_count % 2 == 0 {
                    self.pending_acks.push_back(ClientHeader::ack_for(&header));
                }
            }
            CommState::Direct => {}
        }
    }

    /// 1 交換分の送信バイト列を outbox に用意する
    fn tick(&mut self) {
        self.outbox.clear();

        if let Some((header, payload)) = self.script.pop_front() {
            if payload.is_empty() {
                self.outbox.extend_from_slice(&header.serialize().to_le_bytes());
            } else {
                let buffer = client_buffer(&payload, header.sequence(), 0);
                let bytes = flatten(buffer.words());
                self.outbox
                    .extend_from_slice(&bytes[..buffer.total_byte_count as usize]);
            }
            return;
        }

        if let Some(ack) = self.pending_acks.pop_front() {
            self.outbox.extend_from_slice(&ack.serialize().to_le_bytes());
        }
    }
}

/// コマンド処理の進行状態
enum CmdState {
    Idle,
    Params { ty: u8, remaining: usize, params: Vec<u32> },
    Envelope { ty: u8, responses: Vec<u32> },
    Responses { ty: u8, queue: VecDeque<u32> },
    Remote { step: u8 },
}

/// アダプタ + 電波上のクライアント群のシミュレータ
struct AdapterSim {
    login_step: usize,
    prev_gba: u16,
    cmd: CmdState,
    pending_joins: VecDeque<ClientSim>,
    connected: Vec<ClientSim>,
    transfer_count: u32,
    bye_count: u32,
    /// 真なら何にも応答しない（アダプタ不在）
    dead: bool,
}

impl AdapterSim {
    fn new(joins: Vec<ClientSim>) -> Self {
        AdapterSim {
            login_step: 0,
            prev_gba: 0xFFFF,
            cmd: CmdState::Idle,
            pending_joins: joins.into(),
            connected: Vec::new(),
            transfer_count: 0,
            bye_count: 0,
            dead: false,
        }
    }

    fn transfer(&mut self, data: u32) -> u32 {
        self.transfer_count += 1;
        if self.dead {
            return NO_DATA;
        }

        if self.login_step < LOGIN_EXCHANGES {
            let expected = if self.login_step == 0 {
                0
            } else {
                LOGIN_PARTS[self.login_step - 1]
            };
            let reply = ((expected as u32) << 16) | (!self.prev_gba) as u32;
            self.prev_gba = data as u16;
            self.login_step += 1;
            return reply;
        }

        match std::mem::replace(&mut self.cmd, CmdState::Idle) {
            CmdState::Idle => {
                let ty = (data & 0xFF) as u8;
                let len = ((data >> 8) & 0xFF) as usize;
                if len == 0 {
                    let responses = self.dispatch(ty, &[]);
                    self.cmd = CmdState::Envelope { ty, responses };
                } else {
                    self.cmd = CmdState::Params {
                        ty,
                        remaining: len,
                        params: Vec::new(),
                    };
                }
                DATA_REQUEST
            }
            CmdState::Params { ty, mut remaining, mut params } => {
                params.push(data);
                remaining -= 1;
                if remaining == 0 {
                    let responses = self.dispatch(ty, &params);
                    self.cmd = CmdState::Envelope { ty, responses };
                } else {
                    self.cmd = CmdState::Params { ty, remaining, params };
                }
                DATA_REQUEST
            }
            CmdState::Envelope { ty, responses } => {
                let count = responses.len() as u32;
                let reply = 0x9966_0000 | (count << 8) | (ty as u32 + 0x80);
                if responses.is_empty() {
                    self.cmd = Self::post_state(ty);
                } else {
                    self.cmd = CmdState::Responses { ty, queue: responses.into() };
                }
                reply
            }
            CmdState::Responses { ty, mut queue } => {
                let word = queue.pop_front().unwrap_or(0);
                if queue.is_empty() {
                    self.cmd = Self::post_state(ty);
                } else {
                    self.cmd = CmdState::Responses { ty, queue };
                }
                word
            }
            CmdState::Remote { step } => match step {
                0 => {
                    self.cmd = CmdState::Remote { step: 1 };
                    0x9966_0128 // イベント 0x28、1 パラメータ
                }
                1 => {
                    self.cmd = CmdState::Remote { step: 2 };
                    (self.active_mask() as u32) << 8
                }
                _ => DATA_REQUEST, // ACK ワード受領 → Idle に戻る
            },
        }
    }

    fn post_state(ty: u8) -> CmdState {
        // SEND_DATA_AND_WAIT / WAIT の後はアダプタ発コマンドが続く
        if ty == 0x25 || ty == 0x27 {
            CmdState::Remote { step: 0 }
        } else {
            CmdState::Idle
        }
    }

    fn dispatch(&mut self, ty: u8, params: &[u32]) -> Vec<u32> {
        match ty {
            0x1A => {
                // 1 ポーリングごとに最大 1 台参加する
                if let Some(client) = self.pending_joins.pop_front() {
                    self.connected.push(client);
                }
                self.connected
                    .iter()
                    .enumerate()
                    .map(|(i, client)| ((i as u32) << 16) | client.device_id as u32)
                    .collect()
            }
            0x25 => {
                self.deliver(params);
                Vec::new()
            }
            0x26 => self.take_receive_words(),
            0x3D => {
                self.bye_count += 1;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// ホストの送信をサーバーパケットにほどき、対象クライアントへ配る
    fn deliver(&mut self, params: &[u32]) {
        let declared = params.first().copied().unwrap_or(0);
        let response = ReceiveDataResponse {
            sent_bytes: [declared, 0, 0, 0, 0],
            data: params.get(1..).unwrap_or(&[]).to_vec(),
        };

        for packet in &parent_data(&response).response.packets {
            for (i, client) in self.connected.iter_mut().enumerate() {
                if packet.header.target_slots.contains(TargetSlots::for_client(i as u8)) {
                    client.on_server_packet(packet);
                }
            }
        }

        for client in self.connected.iter_mut() {
            client.tick();
        }
    }

    /// 各クライアントの outbox を共有受信バッファ形式に詰める
    fn take_receive_words(&mut self) -> Vec<u32> {
        let mut header = 0u32;
        let mut bytes = Vec::new();

        for (i, client) in self.connected.iter_mut().enumerate() {
            let out = std::mem::take(&mut client.outbox);
            header |= (out.len() as u32) << (8 + 5 * i as u32);
            bytes.extend_from_slice(&out);
        }

        let mut words = vec![header];
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            words.push(u32::from_le_bytes(word));
        }
        words
    }

    fn active_mask(&self) -> u8 {
        (0..self.connected.len()).fold(0u8, |mask, i| mask | 1 << i)
    }
}

struct SimBus {
    sim: Rc<RefCell<AdapterSim>>,
    si: Cell<bool>,
}

impl SerialBus for SimBus {
    fn transfer(
        &mut self,
        data: u32,
        _timeout: &mut dyn FnMut() -> bool,
        _is_bit_banged: bool,
        _custom_ack: bool,
    ) -> u32 {
        self.sim.borrow_mut().transfer(data)
    }

    fn activate(&mut self, _mode: BusMode) {}

    fn deactivate(&mut self) {}

    fn is_si_high(&self) -> bool {
        let level = self.si.get();
        self.si.set(!level);
        level
    }

    fn set_so_low(&mut self) {}
    fn set_so_high(&mut self) {}
}

struct SimGpio;

impl Gpio for SimGpio {
    fn set_mode(&mut self, _pin: Pin, _direction: Direction) {}
    fn write_pin(&mut self, _pin: Pin, _level: bool) {}
}

struct TickCounter(Cell<u16>);

impl VCounter for TickCounter {
    fn vcount(&self) -> u16 {
        let v = self.0.get();
        self.0.set((v + 1) % 228);
        v
    }
}

fn engine_with(
    joins: Vec<ClientSim>,
) -> (
    MultibootEngine<SimBus, SimGpio, TickCounter>,
    Rc<RefCell<AdapterSim>>,
) {
    let sim = Rc::new(RefCell::new(AdapterSim::new(joins)));
    let bus = SimBus {
        sim: Rc::clone(&sim),
        si: Cell::new(true),
    };
    let engine = MultibootEngine::new(bus, SimGpio, TickCounter(Cell::new(0)));
    (engine, sim)
}

fn flatten(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn test_rom() -> Vec<u8> {
    (0..448).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_send_rom_to_two_clients_with_flaky_acks() {
    let (mut engine, sim) = engine_with(vec![
        ClientSim::bootloader(0xBEEF, false),
        ClientSim::bootloader(0xCAFE, true),
    ]);

    let rom = test_rom();
    let result = engine.send_rom(&rom, "Multiboot", "Test", 0x7FFF, 3, |_| false);
    assert_eq!(result, Ok(()));

    let sim = sim.borrow();
    // 終了処理は 1 回だけ
    assert_eq!(sim.bye_count, 1);
    assert_eq!(engine.progress().state, State::Stopped);
    assert_eq!(engine.progress().percentage, 0);

    // 先頭ページはヘッダーパッチ済みの内容で届く
    let mut expected_first_page = rom[..84].to_vec();
    expected_first_page[ROM_HEADER_PATCH_OFFSET..ROM_HEADER_PATCH_OFFSET + ROM_HEADER_PATCH.len()]
        .copy_from_slice(&ROM_HEADER_PATCH);

    for client in &sim.connected {
        let first_page = client
            .received
            .iter()
            .find(|(_, payload)| payload.len() == 84)
            .map(|(_, payload)| payload.clone())
            .expect("client received no pages");
        assert_eq!(first_page, expected_first_page);

        // 448 バイト = 6 ページ分は少なくとも受信している
        assert!(client.received.len() >= 6);
        // 終了通知 OFF を受け取っている
        assert!(client.saw_off);
    }
}

#[test]
fn test_rejects_undersized_rom_before_touching_the_bus() {
    let (mut engine, sim) = engine_with(vec![]);

    let result = engine.send_rom(&[0u8; 100], "Game", "User", 0x1234, 2, |_| false);
    assert_eq!(result, Err(MultibootError::InvalidSize));
    assert_eq!(sim.borrow().transfer_count, 0);
    assert_eq!(sim.borrow().bye_count, 0);
}

#[test]
fn test_rejects_oversized_rom_and_bad_player_counts() {
    let (mut engine, sim) = engine_with(vec![]);

    let oversized = vec![0u8; 256 * 1024 + 1];
    assert_eq!(
        engine.send_rom(&oversized, "Game", "User", 0x1234, 2, |_| false),
        Err(MultibootError::InvalidSize)
    );

    let rom = test_rom();
    assert_eq!(
        engine.send_rom(&rom, "Game", "User", 0x1234, 1, |_| false),
        Err(MultibootError::InvalidPlayers)
    );
    assert_eq!(
        engine.send_rom(&rom, "Game", "User", 0x1234, 6, |_| false),
        Err(MultibootError::InvalidPlayers)
    );
    assert_eq!(sim.borrow().transfer_count, 0);
}

#[test]
fn test_cancel_during_waiting_deactivates_once() {
    let (mut engine, sim) = engine_with(vec![]);

    let rom = test_rom();
    let result = engine.send_rom(&rom, "Game", "User", 0x1234, 2, |progress| {
        progress.state == State::Waiting
    });

    assert_eq!(result, Err(MultibootError::Canceled));
    assert_eq!(sim.borrow().bye_count, 1);
    assert_eq!(engine.progress().state, State::Stopped);
}

#[test]
fn test_bad_handshake_rejects_client_and_deactivates_once() {
    let (mut engine, sim) = engine_with(vec![ClientSim::impostor(0xBEEF)]);

    let rom = test_rom();
    let result = engine.send_rom(&rom, "Game", "User", 0x1234, 2, |_| false);

    assert_eq!(result, Err(MultibootError::BadHandshake));
    assert_eq!(sim.borrow().bye_count, 1);
}

#[test]
fn test_dead_adapter_reports_not_detected() {
    let (mut engine, sim) = engine_with(vec![]);
    sim.borrow_mut().dead = true;

    let rom = test_rom();
    let result = engine.send_rom(&rom, "Game", "User", 0x1234, 2, |_| false);

    assert!(matches!(result, Err(MultibootError::AdapterNotDetected(_))));
}
