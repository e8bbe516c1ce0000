//! マルチブート転送エンジン
//!
//! [`MultibootEngine::send_rom`] が入口。検証（サイズ・プレイヤー数）は
//! ハードウェアに触れる前に行い、以降はどの経路で終わっても
//! 終了処理（BYE + バス無効化 + 進捗リセット）をちょうど 1 回だけ行う。

use alloc::format;

use rfu_bus::{Gpio, Logger, NullLogger, SerialBus, VCounter, FRAME_LINES};
use rfu_raw::command::CMD_EVENT;
use rfu_raw::{RawWireless, ReceiveDataResponse};
use rfu_sdk::{
    children_data, server_ack_buffer, server_buffer, ClientHeader, ClientPacket, CommState,
    SendBuffer, SequenceNumber, ServerHeader, TargetSlots, MAX_PAYLOAD_SERVER,
};

use crate::window::Transfer;
use crate::{
    MultibootError, BOOTLOADER_HANDSHAKE, CMD_START, GAME_ID_MULTIBOOT_FLAG, MAX_PLAYERS,
    MAX_ROM_SIZE, MIN_PLAYERS, MIN_ROM_SIZE, ROM_HEADER_PATCH, ROM_HEADER_PATCH_OFFSET,
    SETUP_MAX_TRANSMISSIONS, SETUP_WAIT_TIMEOUT,
};

/// 転送の進行段階
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Stopped,
    Initializing,
    Waiting,
    Preparing,
    Sending,
    Confirming,
}

/// キャンセル述語に渡す進捗スナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub state: State,
    /// 接続済みクライアント数（ホストを含まない）
    pub connected_clients: u32,
    /// 最も遅いクライアント基準の進捗（0..=100）
    pub percentage: u32,
}

/// ワイヤレスマルチブートの転送エンジン
pub struct MultibootEngine<B, G, C, L = NullLogger> {
    link: RawWireless<B, G, C>,
    logger: L,
    progress: Progress,
    last_valid_header: ClientHeader,
}

impl<B: SerialBus, G: Gpio, C: VCounter> MultibootEngine<B, G, C> {
    /// ログ出力なしでエンジンを構築する
    pub fn new(bus: B, gpio: G, vcount: C) -> Self {
        Self::with_logger(bus, gpio, vcount, NullLogger)
    }
}

impl<B: SerialBus, G: Gpio, C: VCounter, L: Logger> MultibootEngine<B, G, C, L> {
    /// ロガーを注入してエンジンを構築する
    pub fn with_logger(bus: B, gpio: G, vcount: C, logger: L) -> Self {
        MultibootEngine {
            link: RawWireless::new(bus, gpio, vcount),
            logger,
            progress: Progress::default(),
            last_valid_header: ClientHeader::default(),
        }
    }

    /// 現在の進捗
    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    /// 下位ドライバへの参照（状態の確認用）
    pub fn link(&self) -> &RawWireless<B, G, C> {
        &self.link
    }

    /// ROM を `players - 1` 台のクライアントへ配布する
    ///
    /// `cancel` は各往復の前に呼ばれ、真を返すと転送を中断する。
    /// 検証エラー（サイズ・プレイヤー数）はハードウェアに触れる前に
    /// 返る。それ以外の経路では成功・失敗を問わずアダプタを畳む。
    pub fn send_rom<F>(
        &mut self,
        rom: &[u8],
        game_name: &str,
        user_name: &str,
        game_id: u16,
        players: u8,
        mut cancel: F,
    ) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        if rom.len() < MIN_ROM_SIZE || rom.len() > MAX_ROM_SIZE {
            return Err(MultibootError::InvalidSize);
        }
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&players) {
            return Err(MultibootError::InvalidPlayers);
        }

        let result = self.run(rom, game_name, user_name, game_id, players, &mut cancel);
        self.finish(result)
    }

    fn run<F>(
        &mut self,
        rom: &[u8],
        game_name: &str,
        user_name: &str,
        game_id: u16,
        players: u8,
        cancel: &mut F,
    ) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        self.logger.log("starting...");
        self.link
            .activate()
            .map_err(MultibootError::AdapterNotDetected)?;

        self.set_state(State::Initializing);
        self.link
            .setup_with(players, SETUP_MAX_TRANSMISSIONS, SETUP_WAIT_TIMEOUT)?;
        self.link
            .broadcast(game_name, user_name, game_id | GAME_ID_MULTIBOOT_FLAG)?;
        self.link.start_host()?;

        self.logger.log("waiting for connections...");
        self.set_state(State::Waiting);
        self.wait_for_clients(players, cancel)?;

        self.logger.log("all players are connected");
        self.set_state(State::Preparing);
        self.link.wait(FRAME_LINES);
        self.send_rom_start_command(cancel)?;

        self.logger.log("sending ROM...");
        self.set_state(State::Sending);
        self.send_rom_pages(rom, cancel)?;

        self.set_state(State::Confirming);
        self.confirm(cancel)?;

        self.logger.log("transfer complete");
        Ok(())
    }

    /// 全クライアントの接続とハンドシェイクを待つ
    fn wait_for_clients<F>(&mut self, players: u8, cancel: &mut F) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        let mut current_players = 1;

        while self.link.player_count() < players {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }

            let response = self.link.accept_connections()?;

            if self.link.player_count() > current_players {
                current_players = self.link.player_count();
                self.progress.connected_clients = (current_players - 1) as u32;

                if let Some(client) = response.connected_clients.last() {
                    self.logger
                        .log(&format!("new client: {}", client.client_number));
                    self.handshake_client(client.client_number, cancel)?;
                }
            }
        }

        Ok(())
    }

    /// 新規クライアントをブートローダとして認証する
    ///
    /// 段階: 任意の最初のパケット → STARTING (n=2) →
    /// COMMUNICATING (n=1, phase=0/1 の 2 パケット) → OFF で終了。
    /// 各段階ではこちらは直前の有効ヘッダーへの ACK を送り続ける。
    fn handshake_client<F>(&mut self, client_number: u8, cancel: &mut F) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        let client = client_number as usize;
        let mut handshake_packets: [Option<ClientPacket>; 2] = [None, None];

        'first: loop {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }
            let response = self.send_and_expect(&[], 1)?;
            if let Some(packet) = children_data(&response).responses[client].packets.first() {
                self.last_valid_header = packet.header;
                break 'first;
            }
        }

        self.logger.log("handshake (1/2)...");
        'starting: loop {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }
            let response = self.send_client_ack(client_number)?;
            for packet in &children_data(&response).responses[client].packets {
                let header = packet.header;
                if header.n == 2 && header.comm_state == CommState::Starting {
                    self.last_valid_header = header;
                    break 'starting;
                }
            }
        }

        self.logger.log("handshake (2/2)...");
        'communicating: loop {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }
            let response = self.send_client_ack(client_number)?;
            for packet in &children_data(&response).responses[client].packets {
                let header = packet.header;
                if header.n == 1 && header.phase == 0 && header.comm_state == CommState::Communicating
                {
                    handshake_packets[0] = Some(packet.clone());
                    self.last_valid_header = header;
                    break 'communicating;
                }
            }
        }

        self.logger.log("receiving name...");
        let mut has_received_name = false;
        'name: loop {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }
            let response = self.send_client_ack(client_number)?;
            for packet in &children_data(&response).responses[client].packets {
                let header = packet.header;
                self.last_valid_header = header;
                if header.n == 1 && header.phase == 1 && header.comm_state == CommState::Communicating
                {
                    handshake_packets[1] = Some(packet.clone());
                    has_received_name = true;
                }
                if header.comm_state == CommState::Off {
                    break 'name;
                }
            }
        }

        if !has_received_name {
            return Err(MultibootError::BadHandshake);
        }
        for (packet, expected) in handshake_packets.iter().zip(BOOTLOADER_HANDSHAKE.iter()) {
            let payload = match packet {
                Some(packet) => &packet.payload,
                None => return Err(MultibootError::BadHandshake),
            };
            if payload.len() < expected.len() || payload[..expected.len()] != expected[..] {
                self.logger.log("! bad handshake payload");
                return Err(MultibootError::BadHandshake);
            }
        }

        // クライアント側の送信キューが空になるまで吸い出す
        loop {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }
            let response = self.send_and_expect(&[], 1)?;
            if children_data(&response).responses[client].packets.is_empty() {
                break;
            }
        }

        self.logger
            .log(&format!("client {} accepted", client_number));
        Ok(())
    }

    /// 各クライアントへ ROM 転送開始コマンドを ACK されるまで送る
    fn send_rom_start_command<F>(&mut self, cancel: &mut F) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        for i in 0..self.progress.connected_clients as u8 {
            let buffer = server_buffer(
                &CMD_START,
                SequenceNumber::new(1, 0, CommState::Starting),
                TargetSlots::for_client(i),
                0,
            );
            self.exchange_new_data(i, buffer, cancel)?;
        }

        Ok(())
    }

    /// ROM 本体のページ送出ループ
    ///
    /// 全クライアントのウィンドウから次に送るべき最小ページを選び、
    /// 全スロット宛に送ってから各クライアントの ACK を回収する。
    /// 最も遅いクライアントが ROM 末尾まで確定したら終わり。
    fn send_rom_pages<F>(&mut self, rom: &[u8], cancel: &mut F) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        let clients = self.progress.connected_clients as usize;
        let rom_size = rom.len() as u32;
        let mut transfers = [Transfer::default(); (MAX_PLAYERS - 1) as usize];
        let transfers = &mut transfers[..clients];

        // 先頭ページだけ ROM ヘッダーをブートローダ用の署名に差し替える
        let mut first_page_patch = [0u8; MAX_PAYLOAD_SERVER];
        first_page_patch.copy_from_slice(&rom[..MAX_PAYLOAD_SERVER]);
        first_page_patch[ROM_HEADER_PATCH_OFFSET..ROM_HEADER_PATCH_OFFSET + ROM_HEADER_PATCH.len()]
            .copy_from_slice(&ROM_HEADER_PATCH);

        self.progress.percentage = 0;

        while min_transferred(transfers) < rom_size {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }

            let cursor = find_min_cursor(transfers);
            let offset = cursor as usize * MAX_PAYLOAD_SERVER;
            let sequence = SequenceNumber::from_packet_id(cursor);
            let source: &[u8] = if cursor == 0 { &first_page_patch } else { rom };

            let buffer = server_buffer(source, sequence, TargetSlots::ALL, offset);

            for transfer in transfers.iter_mut() {
                transfer.add_if_needed(cursor);
            }

            let response = self.send_buffer(&buffer)?;
            let children = children_data(&response);

            for (transfer, client_response) in transfers.iter_mut().zip(children.responses.iter()) {
                for packet in &client_response.packets {
                    if packet.header.is_ack {
                        if let Some(new_cursor) = transfer.pending.ack(packet.header.sequence()) {
                            transfer.cursor = new_cursor;
                        }
                    }
                }
            }

            let percentage = (min_transferred(transfers) * 100 / rom_size).min(100);
            if percentage != self.progress.percentage {
                self.progress.percentage = percentage;
                self.logger.log(&format!("-> {}%", percentage));
            }
        }

        Ok(())
    }

    /// 転送終了を各クライアントと確認し、OFF を通知する
    fn confirm<F>(&mut self, cancel: &mut F) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        self.logger.log("confirming...");
        for i in 0..self.progress.connected_clients as u8 {
            let buffer = server_buffer(
                &[],
                SequenceNumber::new(0, 0, CommState::Ending),
                TargetSlots::for_client(i),
                0,
            );
            self.exchange_new_data(i, buffer, cancel)?;
        }

        for i in 0..self.progress.connected_clients as u8 {
            let buffer = server_buffer(
                &[],
                SequenceNumber::new(1, 0, CommState::Off),
                TargetSlots::for_client(i),
                0,
            );
            self.send_buffer(&buffer)?;
        }

        Ok(())
    }

    /// 同じバッファを、対象クライアントがシーケンス一致の ACK を
    /// 返すまで送り続ける
    fn exchange_new_data<F>(
        &mut self,
        client_number: u8,
        buffer: SendBuffer<ServerHeader>,
        cancel: &mut F,
    ) -> Result<(), MultibootError>
    where
        F: FnMut(&Progress) -> bool,
    {
        loop {
            if cancel(&self.progress) {
                return Err(MultibootError::Canceled);
            }

            let response = self.send_buffer(&buffer)?;
            for packet in &children_data(&response).responses[client_number as usize].packets {
                let header = packet.header;
                if header.is_ack && header.sequence() == buffer.header.sequence() {
                    self.last_valid_header = header;
                    return Ok(());
                }
            }
        }
    }

    /// 直前の有効クライアントヘッダーへの ACK を送る
    fn send_client_ack(&mut self, client_number: u8) -> Result<ReceiveDataResponse, MultibootError> {
        let buffer = server_ack_buffer(&self.last_valid_header, client_number);
        self.send_buffer(&buffer)
    }

    fn send_buffer<H>(&mut self, buffer: &SendBuffer<H>) -> Result<ReceiveDataResponse, MultibootError> {
        self.send_and_expect(buffer.words(), buffer.total_byte_count)
    }

    /// データを送り、0x28 イベントで全クライアントの生存を確認し、
    /// 共有受信バッファを取得する
    fn send_and_expect(
        &mut self,
        data: &[u32],
        bytes: u32,
    ) -> Result<ReceiveDataResponse, MultibootError> {
        let remote = self.link.send_data_and_wait(data, Some(bytes))?;

        if remote.command_id != CMD_EVENT {
            self.logger
                .log(&format!("! expected event 0x28, got 0x{:02X}", remote.command_id));
            return Err(MultibootError::UnexpectedEvent(remote.command_id));
        }

        if let Some(&first) = remote.params.first() {
            let expected = (1u8 << self.progress.connected_clients) - 1;
            let active = ((first >> 8) as u8) & expected;
            if active != expected {
                self.logger.log("! client timeout");
                return Err(MultibootError::ClientTimeout { active, expected });
            }
        }

        Ok(self.link.receive_data()?)
    }

    /// 終了処理: アダプタを畳み、進捗をリセットする。必ず 1 回だけ通る。
    fn finish(&mut self, result: Result<(), MultibootError>) -> Result<(), MultibootError> {
        let _ = self.link.deactivate();
        self.progress = Progress::default();
        result
    }

    fn set_state(&mut self, state: State) {
        self.logger.log(&format!("state = {:?}", state));
        self.progress.state = state;
    }
}

/// 最も遅いクライアントの確定済みバイト数
fn min_transferred(transfers: &[Transfer]) -> u32 {
    transfers.iter().map(|t| t.transferred()).min().unwrap_or(0)
}

/// 次に送るページ: どれかのウィンドウが満杯なら再送のみ、
/// 余裕があれば各クライアントの次ページの最小値
fn find_min_cursor(transfers: &[Transfer]) -> u32 {
    let can_send_inflight = transfers.iter().all(|t| !t.pending.is_full());

    transfers
        .iter()
        .map(|t| t.next_cursor(can_send_inflight))
        .min()
        .unwrap_or(0)
}
