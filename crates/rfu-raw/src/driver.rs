//! アダプタの状態機械とコマンド実行
//!
//! [`RawWireless`] がこのクレートの中心。バス・GPIO・スキャンライン
//! カウンタ・ロガーを注入して構築し、アダプタのライフサイクル
//! （ping → ログイン → HELLO → セッション操作）を駆動する。
//!
//! どのコマンドも失敗時はセッション状態を NEEDS_RESET に戻してから
//! エラーを返す。自動リトライはしない。

use alloc::format;
use alloc::vec::Vec;

use rfu_bus::{
    wait_lines, BusMode, Direction, Gpio, Logger, NullLogger, Pin, ScanlineBudget, SerialBus,
    VCounter, NO_DATA,
};

use crate::command::{
    build_u16, build_u32, lsb16, lsb32, msb16, msb32, parse_server, send_data_header,
    AcceptConnectionsResponse, ConnectionPhase, ConnectionStatus, ReceiveDataResponse,
    RemoteCommand, Server, SlotStatusResponse, broadcast_words,
    CMD_ACCEPT_CONNECTIONS, CMD_BROADCAST, CMD_BROADCAST_READ_END, CMD_BROADCAST_READ_POLL,
    CMD_BROADCAST_READ_START, CMD_BYE, CMD_CONNECT, CMD_END_HOST, CMD_FINISH_CONNECTION,
    CMD_HELLO, CMD_IS_FINISHED_CONNECT, CMD_RECEIVE_DATA, CMD_SEND_DATA, CMD_SEND_DATA_AND_WAIT,
    CMD_SETUP, CMD_SLOT_STATUS, CMD_START_HOST, CMD_WAIT,
};
use crate::error::{AdapterError, CommandError};
use crate::{
    BROADCAST_RESPONSE_LENGTH, CMD_TIMEOUT, COMMAND_HEADER, DATA_REQUEST, LOGIN_PARTS,
    MAX_CLIENT_TRANSFER_LENGTH, MAX_COMMAND_TRANSFER_LENGTH, MAX_GAME_NAME_LENGTH, MAX_PLAYERS,
    MAX_USER_NAME_LENGTH, PING_WAIT, RESPONSE_ACK, SETUP_MAGIC, SETUP_MAX_PLAYERS_BIT,
    SETUP_MAX_TRANSMISSIONS, SETUP_WAIT_TIMEOUT, STILL_CONNECTING, TRANSFER_WAIT,
};

/// アダプタの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// 未初期化、または直前の操作が失敗した
    NeedsReset,
    /// ログイン + HELLO 完了
    Authenticated,
    /// ブロードキャストスキャン中（クライアント側）
    Searching,
    /// セッションをホスト中（サーバー側）
    Serving,
    /// サーバーへの接続処理中（クライアント側）
    Connecting,
    /// 接続確定（クライアント側）
    Connected,
}

/// 現在のセッションに関する可変状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    /// 接続中のプレイヤー総数（ホスト含む）
    pub player_count: u8,
    /// 自分のプレイヤー ID（ホスト = 0）
    pub current_player_id: u8,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState {
            player_count: 1,
            current_player_id: 0,
        }
    }
}

/// ログインハンドシェイクの相互エコー検証用メモリ
struct LoginMemory {
    previous_gba_data: u16,
    previous_adapter_data: u16,
}

/// ワイヤレスアダプタの低レベルドライバ
///
/// コラボレータ（バス、GPIO、スキャンラインカウンタ、ロガー）を
/// 所有する。上位層（rfu-sdk / rfu-multiboot）はこの型のコマンド
/// ラッパーだけを使う。
pub struct RawWireless<B, G, C, L = NullLogger> {
    bus: B,
    gpio: G,
    vcount: C,
    logger: L,
    state: State,
    session: SessionState,
    enabled: bool,
}

impl<B: SerialBus, G: Gpio, C: VCounter> RawWireless<B, G, C> {
    /// ログ出力なしでドライバを構築する
    pub fn new(bus: B, gpio: G, vcount: C) -> Self {
        Self::with_logger(bus, gpio, vcount, NullLogger)
    }
}

impl<B: SerialBus, G: Gpio, C: VCounter, L: Logger> RawWireless<B, G, C, L> {
    /// ロガーを注入してドライバを構築する
    pub fn with_logger(bus: B, gpio: G, vcount: C, logger: L) -> Self {
        RawWireless {
            bus,
            gpio,
            vcount,
            logger,
            state: State::NeedsReset,
            session: SessionState::default(),
            enabled: false,
        }
    }

    /// アダプタを初期化する（ping → ログイン → HELLO）
    ///
    /// 成功すると AUTHENTICATED になる。失敗時は NEEDS_RESET のまま。
    pub fn activate(&mut self) -> Result<(), AdapterError> {
        self.enabled = false;
        self.reset_state();
        self.bus.deactivate();

        let result = self.start();

        self.enabled = true;
        result.map_err(|e| self.fail(e))
    }

    /// BYE を送ってセッションを終了し、バスを無効化する
    ///
    /// BYE の成否に関わらずローカル状態は必ず畳む。
    pub fn deactivate(&mut self) -> Result<(), AdapterError> {
        let result = self.send_command(CMD_BYE, &[]).map(|_| ());

        self.enabled = false;
        self.reset_state();
        self.bus.deactivate();

        result
    }

    /// セッションパラメータを既定値で設定する
    pub fn setup(&mut self, max_players: u8) -> Result<(), AdapterError> {
        self.setup_with(max_players, SETUP_MAX_TRANSMISSIONS, SETUP_WAIT_TIMEOUT)
    }

    /// セッションパラメータを明示して設定する
    ///
    /// パラメータワードは基底値に 3 フィールドを合成する:
    /// `(5 - max_players)` の下位 2 ビット（ビット 16）、
    /// 最大再送回数（ビット 8）、待機タイムアウト（ビット 0）。
    pub fn setup_with(
        &mut self,
        max_players: u8,
        max_transmissions: u8,
        wait_timeout: u8,
    ) -> Result<(), AdapterError> {
        let param = SETUP_MAGIC
            | (((MAX_PLAYERS as u32 - max_players as u32) & 0b11) << SETUP_MAX_PLAYERS_BIT)
            | ((max_transmissions as u32) << 8)
            | wait_timeout as u32;

        self.send_command(CMD_SETUP, &[param])
            .map(|_| ())
            .map_err(|e| self.fail(e))
    }

    /// ブロードキャストデータ（ゲーム名、ユーザー名、ゲーム ID）を設定する
    ///
    /// 名前が最大長を超える場合はバスに触れずに失敗する。
    pub fn broadcast(
        &mut self,
        game_name: &str,
        user_name: &str,
        game_id: u16,
    ) -> Result<(), AdapterError> {
        if game_name.len() > MAX_GAME_NAME_LENGTH || user_name.len() > MAX_USER_NAME_LENGTH {
            self.logger.log("! name too long");
            return Err(AdapterError::NameTooLong);
        }

        let words = broadcast_words(game_name.as_bytes(), user_name.as_bytes(), game_id);

        self.send_command(CMD_BROADCAST, &words)
            .map(|_| ())
            .map_err(|e| self.fail(e))
    }

    /// ホストを開始し、ブロードキャストを可視化する
    pub fn start_host(&mut self) -> Result<(), AdapterError> {
        self.send_command(CMD_START_HOST, &[])
            .map_err(|e| self.fail(e))?;

        wait_lines(&self.vcount, TRANSFER_WAIT);
        self.set_state(State::Serving);

        Ok(())
    }

    /// 現在のスロット状態（接続済みクライアント一覧）を取得する
    pub fn get_slot_status(&mut self) -> Result<SlotStatusResponse, AdapterError> {
        let words = self
            .send_command(CMD_SLOT_STATUS, &[])
            .map_err(|e| self.fail(e))?;

        Ok(SlotStatusResponse::from_words(&words))
    }

    /// 新規接続をポーリングし、プレイヤー数を更新する
    pub fn accept_connections(&mut self) -> Result<AcceptConnectionsResponse, AdapterError> {
        let words = self
            .send_command(CMD_ACCEPT_CONNECTIONS, &[])
            .map_err(|e| self.fail(e))?;

        let response = AcceptConnectionsResponse::from_words(&words);
        self.update_player_count(1 + response.connected_clients.len() as u8);
        Ok(response)
    }

    /// 新規受け付けを停止する（既存の接続は維持される）
    pub fn end_host(&mut self) -> Result<AcceptConnectionsResponse, AdapterError> {
        let words = self
            .send_command(CMD_END_HOST, &[])
            .map_err(|e| self.fail(e))?;

        let response = AcceptConnectionsResponse::from_words(&words);
        self.update_player_count(1 + response.connected_clients.len() as u8);
        Ok(response)
    }

    /// ブロードキャストスキャンを開始する
    pub fn broadcast_read_start(&mut self) -> Result<(), AdapterError> {
        self.send_command(CMD_BROADCAST_READ_START, &[])
            .map_err(|e| self.fail(e))?;

        self.set_state(State::Searching);
        Ok(())
    }

    /// 発見済みセッションの一覧を取得する
    ///
    /// レスポンスは 7 ワード単位（id + ブロードキャストデータ 6 ワード）。
    pub fn broadcast_read_poll(&mut self) -> Result<Vec<Server>, AdapterError> {
        let words = self
            .send_command(CMD_BROADCAST_READ_POLL, &[])
            .map_err(|e| self.fail(e))?;

        if words.len() % BROADCAST_RESPONSE_LENGTH != 0 {
            return Err(self.fail(AdapterError::MalformedResponse));
        }

        let servers = words
            .chunks_exact(BROADCAST_RESPONSE_LENGTH)
            .map(parse_server)
            .collect();

        self.set_state(State::Authenticated);
        Ok(servers)
    }

    /// ブロードキャストスキャンを終了する
    pub fn broadcast_read_end(&mut self) -> Result<(), AdapterError> {
        self.send_command(CMD_BROADCAST_READ_END, &[])
            .map(|_| ())
            .map_err(|e| self.fail(e))
    }

    /// 指定したセッションへの接続を開始する
    pub fn connect(&mut self, server_id: u16) -> Result<(), AdapterError> {
        self.send_command(CMD_CONNECT, &[server_id as u32])
            .map_err(|e| self.fail(e))?;

        self.set_state(State::Connecting);
        Ok(())
    }

    /// 接続処理の完了をポーリングする
    pub fn keep_connecting(&mut self) -> Result<ConnectionStatus, AdapterError> {
        let words = self
            .send_command(CMD_IS_FINISHED_CONNECT, &[])
            .map_err(|e| self.fail(e))?;

        let first = match words.first() {
            Some(&word) => word,
            None => return Err(self.fail(AdapterError::EmptyResponse)),
        };

        if first == STILL_CONNECTING {
            return Ok(ConnectionStatus {
                phase: ConnectionPhase::StillConnecting,
                assigned_client_number: 0,
            });
        }

        let client_number = msb32(first) as u8;
        if 1 + client_number as usize >= MAX_PLAYERS {
            return Err(self.fail(AdapterError::ConnectionFailed));
        }

        Ok(ConnectionStatus {
            phase: ConnectionPhase::Success,
            assigned_client_number: client_number,
        })
    }

    /// 接続を確定し、割り当てられたプレイヤー ID を返す
    pub fn finish_connection(&mut self) -> Result<u8, AdapterError> {
        let words = self
            .send_command(CMD_FINISH_CONNECTION, &[])
            .map_err(|e| self.fail(e))?;

        let first = match words.first() {
            Some(&word) => word,
            None => return Err(self.fail(AdapterError::EmptyResponse)),
        };

        let status = msb32(first);
        if msb16(status) & 1 == 1 {
            return Err(self.fail(AdapterError::ConnectionFailed));
        }

        let assigned_player_id = 1 + lsb16(status);
        self.session.current_player_id = assigned_player_id;
        self.set_state(State::Connected);

        Ok(assigned_player_id)
    }

    /// データを送信する
    ///
    /// `bytes` を省略すると `data.len() * 4` を送信バイト数として使う。
    /// 送信ヘッダーワードは自分のプレイヤー ID のビット位置に載る。
    pub fn send_data(&mut self, data: &[u32], bytes: Option<u32>) -> Result<(), AdapterError> {
        let words = self.with_send_header(data, bytes);

        self.send_command(CMD_SEND_DATA, &words)
            .map(|_| ())
            .map_err(|e| self.fail(e))
    }

    /// データを送信し、アダプタ発のコマンドを待つ
    pub fn send_data_and_wait(
        &mut self,
        data: &[u32],
        bytes: Option<u32>,
    ) -> Result<RemoteCommand, AdapterError> {
        let words = self.with_send_header(data, bytes);

        self.send_command(CMD_SEND_DATA_AND_WAIT, &words)
            .map_err(|e| self.fail(e))?;

        self.receive_command_from_adapter()
    }

    /// 共有受信バッファを取得する
    pub fn receive_data(&mut self) -> Result<ReceiveDataResponse, AdapterError> {
        let words = self
            .send_command(CMD_RECEIVE_DATA, &[])
            .map_err(|e| self.fail(e))?;

        Ok(ReceiveDataResponse::from_words(words))
    }

    /// アダプタ発のコマンドを待つ（送信なし）
    pub fn wait_command(&mut self) -> Result<RemoteCommand, AdapterError> {
        self.send_command(CMD_WAIT, &[])
            .map_err(|e| self.fail(e))?;

        self.receive_command_from_adapter()
    }

    /// コマンドを送信し、レスポンスワード列を返す
    ///
    /// ラッパーと違い、失敗してもセッション状態は変更しない。
    pub fn send_command(&mut self, command_type: u8, params: &[u32]) -> Result<Vec<u32>, AdapterError> {
        let command = build_u32(COMMAND_HEADER, build_u16(params.len() as u8, command_type));

        self.logger.log(&format!("sending command 0x{:08X}", command));
        self.exchange(command)?;
        for &param in params {
            self.exchange(param)?;
        }

        let response = self.transfer(DATA_REQUEST, true);
        let header = msb32(response);
        let data = lsb32(response);
        let response_count = msb16(data);
        let ack = lsb16(data);

        if header != COMMAND_HEADER {
            self.logger.log(&format!("! bad header 0x{:04X}", header));
            return Err(AdapterError::BadHeader { received: header });
        }

        let expected_ack = command_type.wrapping_add(RESPONSE_ACK);
        if ack != expected_ack {
            if ack == 0xEE && response_count == 1 {
                let code = self.transfer(DATA_REQUEST, true) as u8;
                self.logger.log(&format!("! adapter error (code {})", code));
                return Err(AdapterError::Command(match code {
                    1 => CommandError::InvalidState,
                    code => CommandError::Unknown(code),
                }));
            }
            self.logger.log(&format!("! bad ack 0x{:02X}", ack));
            return Err(AdapterError::BadAck {
                expected: expected_ack,
                received: ack,
            });
        }

        let mut responses = Vec::with_capacity(response_count as usize);
        for _ in 0..response_count {
            responses.push(self.transfer(DATA_REQUEST, true));
        }

        Ok(responses)
    }

    /// スキャンライン単位で busy-wait する
    pub fn wait(&self, lines: u32) {
        wait_lines(&self.vcount, lines);
    }

    /// SERVING か CONNECTED かで許される最大送信ワード数
    pub fn device_transfer_length(&self) -> usize {
        if self.state == State::Serving {
            MAX_COMMAND_TRANSFER_LENGTH
        } else {
            MAX_CLIENT_TRANSFER_LENGTH
        }
    }

    /// 現在の状態
    pub fn state(&self) -> State {
        self.state
    }

    /// activate 済みか
    pub fn is_active(&self) -> bool {
        self.enabled
    }

    /// 自分以外のプレイヤーがいるか
    pub fn is_connected(&self) -> bool {
        self.session.player_count > 1
    }

    /// セッションを張っている状態か（SERVING または CONNECTED）
    pub fn is_session_active(&self) -> bool {
        self.state == State::Serving || self.state == State::Connected
    }

    /// 接続中のプレイヤー総数
    pub fn player_count(&self) -> u8 {
        self.session.player_count
    }

    /// 自分のプレイヤー ID（ホスト = 0）
    pub fn current_player_id(&self) -> u8 {
        self.session.current_player_id
    }

    // ===== 内部処理 =====

    fn start(&mut self) -> Result<(), AdapterError> {
        self.ping_adapter();

        self.logger.log("setting bus to 256Kbps");
        self.bus.activate(BusMode::Master256Kbps);

        self.login()?;
        wait_lines(&self.vcount, TRANSFER_WAIT);

        self.logger.log("sending HELLO command");
        self.send_command(CMD_HELLO, &[])?;

        self.logger.log("setting bus to 2Mbps");
        self.bus.activate(BusMode::Master2Mbps);
        self.set_state(State::Authenticated);

        Ok(())
    }

    /// SD ラインのパルスでアダプタを起こす
    fn ping_adapter(&mut self) {
        self.gpio.set_mode(Pin::So, Direction::Output);
        self.gpio.set_mode(Pin::Sd, Direction::Output);
        self.gpio.write_pin(Pin::Sd, true);
        wait_lines(&self.vcount, PING_WAIT);
        self.gpio.write_pin(Pin::Sd, false);
    }

    /// ログインハンドシェイク
    ///
    /// 初回交換はエコー 0 を期待し、以降の 9 ステップは各マジック値
    /// そのもののエコーを期待する。
    fn login(&mut self) -> Result<(), AdapterError> {
        let mut memory = LoginMemory {
            previous_gba_data: 0xFFFF,
            previous_adapter_data: 0xFFFF,
        };

        self.exchange_login_packet(LOGIN_PARTS[0], 0, &mut memory)?;
        for &part in LOGIN_PARTS.iter() {
            self.exchange_login_packet(part, part, &mut memory)?;
        }

        Ok(())
    }

    /// ログインパケット 1 往復
    ///
    /// 送信ワードの上位 16 ビットは直前のアダプタデータの補数。
    /// 応答は（期待値 << 16）| 直前の GBA データの補数であること。
    fn exchange_login_packet(
        &mut self,
        data: u16,
        expected_response: u16,
        memory: &mut LoginMemory,
    ) -> Result<(), AdapterError> {
        let packet = build_u32(!memory.previous_adapter_data, data);
        let response = self.transfer(packet, false);

        let expected = build_u32(expected_response, !memory.previous_gba_data);
        if response != expected {
            self.logger.log(&format!(
                "! login: expected 0x{:08X}, received 0x{:08X}",
                expected, response
            ));
            return Err(AdapterError::Unexpected {
                expected,
                received: response,
            });
        }

        memory.previous_gba_data = data;
        memory.previous_adapter_data = expected_response;

        Ok(())
    }

    /// ワードを転送し、期待したセンチネルが返るか検証する
    fn exchange(&mut self, data: u32) -> Result<(), AdapterError> {
        let received = self.transfer(data, true);
        if received != DATA_REQUEST {
            self.logger.log(&format!(
                "! expected 0x{:08X}, received 0x{:08X}",
                DATA_REQUEST, received
            ));
            return Err(AdapterError::Unexpected {
                expected: DATA_REQUEST,
                received,
            });
        }
        Ok(())
    }

    /// マスター側の転送 1 回
    ///
    /// `custom_ack` 無効時（ログイン）は転送間隔を空けるだけ。
    /// 有効時は転送後に SO/SI の acknowledge プロトコルを実行し、
    /// 失敗したら [`NO_DATA`] を返す。
    fn transfer(&mut self, data: u32, custom_ack: bool) -> u32 {
        if !custom_ack {
            wait_lines(&self.vcount, TRANSFER_WAIT);
        }

        let received = {
            let vcount = &self.vcount;
            let mut budget = ScanlineBudget::start(vcount);
            let mut timed_out = || budget.expired(vcount, CMD_TIMEOUT);
            self.bus.transfer(data, &mut timed_out, false, custom_ack)
        };

        if custom_ack && !self.acknowledge() {
            return NO_DATA;
        }

        received
    }

    /// SO/SI acknowledge: SO=LOW → SI=HIGH 待ち → SO=HIGH → SI=LOW 待ち → SO=LOW
    fn acknowledge(&mut self) -> bool {
        let vcount = &self.vcount;
        let mut budget = ScanlineBudget::start(vcount);

        self.bus.set_so_low();
        while !self.bus.is_si_high() {
            if budget.expired(vcount, CMD_TIMEOUT) {
                self.logger.log("! ACK 1 failed (SI stayed LOW)");
                return false;
            }
        }
        self.bus.set_so_high();
        while self.bus.is_si_high() {
            if budget.expired(vcount, CMD_TIMEOUT) {
                self.logger.log("! ACK 2 failed (SI stayed HIGH)");
                return false;
            }
        }
        self.bus.set_so_low();

        true
    }

    /// スレーブ側 acknowledge: SI=HIGH 待ちのみ
    fn reverse_acknowledge(&mut self) -> bool {
        let vcount = &self.vcount;
        let mut budget = ScanlineBudget::start(vcount);

        while !self.bus.is_si_high() {
            if budget.expired(vcount, CMD_TIMEOUT) {
                self.logger.log("! REV_ACK failed (SI stayed LOW)");
                return false;
            }
        }

        true
    }

    /// バスをスレーブ化してアダプタ発のコマンドを受信する
    ///
    /// 成否に関わらずバスは 2Mbps マスターに戻す。
    fn receive_command_from_adapter(&mut self) -> Result<RemoteCommand, AdapterError> {
        self.logger.log("setting bus to SLAVE");
        self.bus.activate(BusMode::Slave);

        let result = self.receive_remote_command();

        self.logger.log("setting bus to 2Mbps");
        self.bus.activate(BusMode::Master2Mbps);

        result.map_err(|e| self.fail(e))
    }

    fn receive_remote_command(&mut self) -> Result<RemoteCommand, AdapterError> {
        let command = self.transfer_slave(DATA_REQUEST)?;

        let header = msb32(command);
        let data = lsb32(command);
        let param_count = msb16(data);
        let command_id = lsb16(data);

        if header != COMMAND_HEADER {
            self.logger.log(&format!("! bad header 0x{:04X}", header));
            return Err(AdapterError::BadHeader { received: header });
        }

        let mut params = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            params.push(self.transfer_slave(DATA_REQUEST)?);
        }

        let ack = build_u32(COMMAND_HEADER, (command_id as u16).wrapping_add(0x80) & 0xFF);
        let request = self.transfer_slave(ack)?;
        if request != DATA_REQUEST {
            return Err(AdapterError::Unexpected {
                expected: DATA_REQUEST,
                received: request,
            });
        }

        Ok(RemoteCommand { command_id, params })
    }

    /// スレーブ転送 1 回 + reverse acknowledge
    ///
    /// アダプタ側の送信タイミングは不定（子機待ちで長時間かかる）
    /// ため、転送自体は打ち切らない。
    fn transfer_slave(&mut self, data: u32) -> Result<u32, AdapterError> {
        let received = {
            let mut never = || false;
            self.bus.transfer(data, &mut never, false, false)
        };

        if !self.reverse_acknowledge() {
            return Err(AdapterError::Timeout);
        }

        Ok(received)
    }

    fn with_send_header(&self, data: &[u32], bytes: Option<u32>) -> Vec<u32> {
        let bytes = bytes.unwrap_or(data.len() as u32 * 4);
        let mut words = Vec::with_capacity(data.len() + 1);
        words.push(send_data_header(bytes, self.session.current_player_id));
        words.extend_from_slice(data);
        words
    }

    fn update_player_count(&mut self, player_count: u8) {
        if self.session.player_count != player_count {
            self.logger.log(&format!("now: {} players", player_count));
        }
        self.session.player_count = player_count;
    }

    fn set_state(&mut self, state: State) {
        self.logger.log(&format!("state = {:?}", state));
        self.state = state;
    }

    fn reset_state(&mut self) {
        self.logger.log("state = NeedsReset");
        self.state = State::NeedsReset;
        self.session = SessionState::default();
    }

    /// 失敗の定型処理: 状態を畳んでからエラーを返す
    fn fail(&mut self, error: AdapterError) -> AdapterError {
        self.reset_state();
        error
    }
}
