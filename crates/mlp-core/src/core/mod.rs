//! コア共通の実行基盤
//!
//! 4 種類のコアはすべて同じ形で動く。
//!
//! - パケット到着（割り込み相当）: [`Core::receive`]
//! - 後回しにした処理（タスク相当）: [`Core::run_pending`]
//! - タイマ（ウォッチドッグ）: [`Core::timer_tick`]
//!
//! 進行状態は [`TickState`]、送信バッファや終了処理は [`Runtime`] にまとめる。

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::{CommonConfig, END_TICK, INIT_TICK};
use crate::error::{CoreError, ExitCode};
use crate::host::HostMessage;
use crate::packet::{Packet, PacketKey, PacketType};
use crate::sync::{PacketQueue, Progress, Watchdog};
use crate::types::{CoreRole, Phase, Weight};

/// tick 進行の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// 同じフェーズの次の tick
    Tick,
    /// 同じ例題の次のイベント
    Event,
    /// FORWARD から BACKPROP へ
    ToBackprop,
    /// 次の例題の FORWARD 開始
    Example { epoch_end: bool },
}

/// フェーズ・tick・イベント・例題・エポックの進行状態
///
/// 全コアが同じ規則で進めるので、`colour`（ステップのパリティ）は全コアで一致する。
/// 進行に加えてデッドロック回復の再実行でも反転する。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickState {
    pub phase: Phase,
    /// 例題内の tick（1 始まり）
    pub tick: u32,
    /// イベント内の tick（1 始まり）
    pub ev_tick: u32,
    /// 例題内のイベント番号
    pub evt: u32,
    pub num_events: u32,
    /// 例題セット全体でのイベント番号
    pub event_idx: u32,
    /// 例題セット内の位置
    pub example_inx: u32,
    /// エポック内で処理した例題数
    pub example_cnt: u32,
    pub epoch: u32,
    pub colour: bool,
}

impl TickState {
    pub fn new(cfg: &CommonConfig) -> TickState {
        let first = cfg.examples.examples[0];
        TickState {
            phase: Phase::Forward,
            tick: INIT_TICK,
            ev_tick: INIT_TICK,
            evt: 0,
            num_events: first.num_events,
            event_idx: first.ev_idx,
            example_inx: 0,
            example_cnt: 0,
            epoch: 0,
            colour: false,
        }
    }

    /// パケットが現在のステップに属するか
    #[inline]
    pub fn is_current(&self, key: PacketKey) -> bool {
        key.colour() == self.colour
    }

    /// 入力・目標配列の行番号
    pub fn it_idx(&self, cfg: &CommonConfig) -> usize {
        cfg.examples.events[self.event_idx as usize].it_idx as usize
    }

    /// 現在のイベントの (最小 tick 数, 最大 tick 数)
    pub fn event_ticks(&self, cfg: &CommonConfig) -> (u32, u32) {
        cfg.examples.event_ticks(self.event_idx as usize, cfg.net.ticks_per_int)
    }

    /// エポック最後の例題か
    pub fn is_last_example(&self, cfg: &CommonConfig) -> bool {
        self.example_cnt + 1 >= cfg.stage.num_examples
    }

    pub fn progress(&self) -> Progress {
        Progress {
            epoch: self.epoch,
            example: self.example_cnt,
            event: self.evt,
            tick: self.tick,
            phase: self.phase,
        }
    }

    /// FORWARD の tick を進める
    ///
    /// `stop` は最終出力グループが決めた tick 停止判定。
    pub fn advance_forward(&mut self, stop: bool, cfg: &CommonConfig) -> Advance {
        debug_assert_eq!(self.phase, Phase::Forward);
        self.colour = !self.colour;
        if !stop {
            self.tick += 1;
            self.ev_tick += 1;
            return Advance::Tick;
        }

        self.evt += 1;
        if self.evt >= self.num_events || self.tick >= cfg.net.global_max_ticks - 1 {
            if cfg.stage.training {
                self.phase = Phase::Backprop;
                Advance::ToBackprop
            } else {
                let epoch_end = self.next_example(cfg);
                Advance::Example { epoch_end }
            }
        } else {
            self.tick += 1;
            self.ev_tick = INIT_TICK;
            self.event_idx += 1;
            Advance::Event
        }
    }

    /// BACKPROP の tick を戻す
    pub fn advance_backprop(&mut self, cfg: &CommonConfig) -> Advance {
        debug_assert_eq!(self.phase, Phase::Backprop);
        self.colour = !self.colour;
        if self.tick > END_TICK {
            self.tick -= 1;
            Advance::Tick
        } else {
            self.phase = Phase::Forward;
            let epoch_end = self.next_example(cfg);
            Advance::Example { epoch_end }
        }
    }

    /// 現在の FORWARD tick をやり直す
    pub fn restart(&mut self) {
        self.colour = !self.colour;
    }

    /// 次の例題へ。エポックが終わったら `true`
    fn next_example(&mut self, cfg: &CommonConfig) -> bool {
        let set = &cfg.examples.examples;
        self.tick = INIT_TICK;
        self.ev_tick = INIT_TICK;
        self.example_inx = (self.example_inx + 1) % set.len() as u32;
        self.example_cnt += 1;
        let epoch_end = self.example_cnt >= cfg.stage.num_examples;
        if epoch_end {
            self.epoch += 1;
            self.example_cnt = 0;
        }
        let ex = set[self.example_inx as usize];
        self.evt = 0;
        self.num_events = ex.num_events;
        self.event_idx = ex.ev_idx;
        epoch_end
    }
}

/// パケットカウンタ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub received: u64,
    pub sent: u64,
    pub deferred: u64,
    pub violations: u64,
    pub weight_updates: u64,
    pub recoveries: u64,
    /// 受信数（種別コード別）
    pub received_by_type: [u64; 16],
}

/// コアの実行基盤
///
/// `T` はコアごとのタスク型。
#[derive(Debug)]
pub struct Runtime<T> {
    label: String,
    tasks: VecDeque<T>,
    replay: VecDeque<Packet>,
    /// 直前に取り出したのが保留パケット（受信数は保留時に数え済み）
    replaying: bool,
    deferred: PacketQueue,
    outbox: Vec<Packet>,
    host: Vec<HostMessage>,
    watchdog: Watchdog,
    exit: Option<ExitCode>,
    strict: bool,
    pub diag: Diagnostics,
}

impl<T> Runtime<T> {
    pub fn new(
        label: impl Into<String>,
        cfg: &CommonConfig,
        deferred_capacity: usize,
    ) -> Runtime<T> {
        Runtime {
            label: label.into(),
            tasks: VecDeque::new(),
            replay: VecDeque::new(),
            replaying: false,
            deferred: PacketQueue::with_capacity(deferred_capacity),
            outbox: Vec::new(),
            host: Vec::new(),
            watchdog: Watchdog::new(cfg.stage.watchdog_timeout),
            exit: None,
            strict: cfg.stage.strict,
            diag: Diagnostics::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.exit.is_some()
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exit
    }

    pub fn schedule(&mut self, task: T) {
        if !self.is_done() {
            self.tasks.push_back(task);
        }
    }

    /// 次に受信し直すパケット（後回しにしたもの）
    pub fn next_replay(&mut self) -> Option<Packet> {
        let packet = if self.is_done() { None } else { self.replay.pop_front() };
        self.replaying = packet.is_some();
        packet
    }

    pub fn next_task(&mut self) -> Option<T> {
        if self.is_done() { None } else { self.tasks.pop_front() }
    }

    /// 受信の記録。終了済みなら `false`
    pub fn accept(&mut self, packet: &Packet) -> bool {
        let replayed = std::mem::take(&mut self.replaying);
        if self.is_done() {
            return false;
        }
        if replayed {
            return true;
        }
        self.diag.received += 1;
        let code = (packet.key.raw() & crate::packet::TYPE_MASK) >> crate::packet::TYPE_SHIFT;
        self.diag.received_by_type[code as usize] += 1;
        log::trace!("{}: recv key {} payload 0x{:08x}", self.label, packet.key, packet.payload);
        true
    }

    pub fn send(&mut self, key: PacketKey, payload: u32) {
        self.diag.sent += 1;
        self.outbox.push(Packet::new(key, payload));
    }

    pub fn report(&mut self, message: HostMessage) {
        self.host.push(message);
    }

    /// 次のステップに属するパケットを保留する
    pub fn defer(&mut self, packet: Packet, state: &TickState) {
        match self.deferred.enqueue(packet) {
            Ok(()) => self.diag.deferred += 1,
            Err(e) => self.fail(e.into(), state),
        }
    }

    /// 保留パケットを受信し直す対象へ移す（tick 進行の直後に呼ぶ）
    pub fn release_deferred(&mut self) {
        self.replay.extend(self.deferred.drain());
    }

    /// プロトコル違反。strict なら致命的、そうでなければ数えて捨てる
    pub fn violation(&mut self, err: CoreError, state: &TickState) {
        self.diag.violations += 1;
        if self.strict {
            self.fail(err, state);
        } else {
            log::warn!("{}: ignored {} at {:?} tick {}", self.label, err, state.phase, state.tick);
        }
    }

    /// 受信種別の検査（未知の種別はプロトコル違反）
    pub fn kind(&mut self, packet: &Packet, state: &TickState) -> Option<PacketType> {
        match packet.key.kind() {
            Ok(kind) => Some(kind),
            Err(e) => {
                self.violation(e.into(), state);
                None
            }
        }
    }

    /// ユニット番号の検査
    pub fn unit(&mut self, packet: &Packet, num_units: usize, state: &TickState) -> Option<usize> {
        match packet.key.checked_index(num_units) {
            Ok(i) => Some(i),
            Err(e) => {
                self.violation(e.into(), state);
                None
            }
        }
    }

    /// ステップのパリティとフェーズの照合
    ///
    /// 現在のステップなら `true`。次のステップなら保留して `false`、
    /// パリティが一致してフェーズが違えばプロトコル違反として `false`。
    pub fn check_step(&mut self, packet: Packet, what: &'static str, state: &TickState) -> bool {
        if !state.is_current(packet.key) {
            self.defer(packet, state);
            false
        } else if packet.key.phase() != state.phase {
            self.violation(CoreError::Unexpected { what, key: packet.key }, state);
            false
        } else {
            true
        }
    }

    pub fn fail(&mut self, err: CoreError, state: &TickState) {
        log::error!("{}: {}", self.label, err);
        self.stage_done(err.exit_code(), state);
    }

    /// ウォッチドッグを 1 回進める。期限切れなら `true`
    pub fn watchdog_expired(&mut self, state: &TickState) -> bool {
        !self.is_done() && self.watchdog.tick(state.progress())
    }

    pub fn rewind_watchdog(&mut self) {
        self.watchdog.rewind();
    }

    /// ステージ終了
    ///
    /// 診断行を出し、以後のパケットとタスクをすべて捨てる。送信済みのパケットは残す。
    pub fn stage_done(&mut self, code: ExitCode, state: &TickState) {
        if self.is_done() {
            return;
        }
        self.exit = Some(code);
        self.tasks.clear();
        self.replay.clear();
        self.deferred.clear();
        let d = &self.diag;
        let line = format!(
            "{}: stage done {} (epoch {} example {} event {} tick {} {:?}) \
             recv {} sent {} deferred {} violations {} updates {} recoveries {}",
            self.label,
            code,
            state.epoch,
            state.example_cnt,
            state.evt,
            state.tick,
            state.phase,
            d.received,
            d.sent,
            d.deferred,
            d.violations,
            d.weight_updates,
            d.recoveries,
        );
        if code.is_ok() {
            log::info!("{line}");
        } else {
            log::error!("{line}");
        }
    }

    pub fn take_outgoing(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_host_messages(&mut self) -> Vec<HostMessage> {
        std::mem::take(&mut self.host)
    }
}

/// マシンから見たコア
pub trait Core {
    fn role(&self) -> CoreRole;

    fn label(&self) -> &str;

    /// ステージ開始
    fn start(&mut self);

    /// パケット到着
    fn receive(&mut self, packet: Packet);

    /// 保留中の処理を 1 つ実行する。何もなければ `false`
    fn run_pending(&mut self) -> bool;

    /// ファブリックが静止しているときのタイマ
    fn timer_tick(&mut self);

    fn take_outgoing(&mut self) -> Vec<Packet>;

    fn take_host_messages(&mut self) -> Vec<HostMessage>;

    fn exit_code(&self) -> Option<ExitCode>;

    fn diagnostics(&self) -> &Diagnostics;

    /// Weight コアの重み（行優先）
    fn weight_block(&self) -> Option<&[Weight]> {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Event, Example, ExampleSet, NetworkConfig, StageConfig};
    use crate::types::{FP_NAN, FPREAL_ONE, NetType, UpdateRule};

    /// 例題 2 個（イベント 1 個と 2 個）、gmt = 5
    pub(crate) fn common(training: bool, num_epochs: u32) -> CommonConfig {
        CommonConfig {
            net: NetworkConfig {
                net_type: NetType::FeedForward,
                ticks_per_int: 1,
                global_max_ticks: 5,
            },
            stage: StageConfig {
                training,
                num_epochs,
                num_examples: 2,
                update: UpdateRule::Momentum,
                deadlock_recovery: false,
                watchdog_timeout: 10,
                strict: true,
            },
            examples: ExampleSet {
                max_time: 4 * FPREAL_ONE,
                min_time: 0,
                examples: vec![
                    Example { num_events: 1, ev_idx: 0 },
                    Example { num_events: 2, ev_idx: 1 },
                ],
                events: vec![
                    Event { max_time: FP_NAN, min_time: FP_NAN, it_idx: 0 },
                    Event { max_time: FP_NAN, min_time: FP_NAN, it_idx: 1 },
                    Event { max_time: FP_NAN, min_time: FP_NAN, it_idx: 2 },
                ],
            },
        }
    }

    #[test]
    fn test_training_walk() {
        let cfg = common(true, 1);
        let mut s = TickState::new(&cfg);
        assert_eq!(s.advance_forward(false, &cfg), Advance::Tick);
        assert_eq!((s.tick, s.ev_tick), (2, 2));
        assert_eq!(s.advance_forward(true, &cfg), Advance::ToBackprop);
        assert_eq!((s.phase, s.tick), (Phase::Backprop, 2));
        assert_eq!(s.advance_backprop(&cfg), Advance::Tick);
        assert_eq!(s.tick, 1);
        assert_eq!(s.advance_backprop(&cfg), Advance::Example { epoch_end: false });
        assert_eq!(
            (s.phase, s.tick, s.example_inx, s.num_events, s.event_idx),
            (Phase::Forward, 1, 1, 2, 1)
        );

        assert_eq!(s.advance_forward(true, &cfg), Advance::Event);
        assert_eq!((s.tick, s.ev_tick, s.evt, s.event_idx), (2, 1, 1, 2));
        assert_eq!(s.it_idx(&cfg), 2);
        assert_eq!(s.advance_forward(true, &cfg), Advance::ToBackprop);
        assert_eq!(s.advance_backprop(&cfg), Advance::Tick);
        assert_eq!(s.advance_backprop(&cfg), Advance::Example { epoch_end: true });
        assert_eq!((s.epoch, s.example_cnt, s.example_inx), (1, 0, 0));
    }

    #[test]
    fn test_global_max_ticks_ends_example() {
        let cfg = common(false, 1);
        let mut s = TickState::new(&cfg);
        for _ in 0..3 {
            assert_eq!(s.advance_forward(false, &cfg), Advance::Tick);
        }
        assert_eq!(s.tick, 4);
        // 2 イベント目が残っていても gmt - 1 で打ち切る
        s.num_events = 2;
        assert_eq!(s.advance_forward(true, &cfg), Advance::Example { epoch_end: false });
        assert_eq!((s.tick, s.ev_tick), (1, 1));
    }

    #[test]
    fn test_colour_flips_every_step() {
        let cfg = common(true, 1);
        let mut s = TickState::new(&cfg);
        let mut colours = vec![s.colour];
        s.advance_forward(true, &cfg);
        colours.push(s.colour);
        s.advance_backprop(&cfg);
        colours.push(s.colour);
        s.restart();
        colours.push(s.colour);
        assert_eq!(colours, vec![false, true, false, true]);
    }

    #[test]
    fn test_runtime_defers_next_step() {
        let cfg = common(true, 1);
        let state = TickState::new(&cfg);
        let mut rt: Runtime<()> = Runtime::new("t", &cfg, 2);
        let key = PacketKey::new(1 << 16, PacketType::Data).with_colour(true);
        assert!(!rt.check_step(Packet::new(key, 1), "data", &state));
        assert_eq!(rt.diag.deferred, 1);
        rt.release_deferred();
        assert_eq!(rt.next_replay(), Some(Packet::new(key, 1)));
        assert_eq!(rt.next_replay(), None);

        // パリティ一致・フェーズ違い
        let bad = PacketKey::new(1 << 16, PacketType::Data).with_phase(Phase::Backprop);
        assert!(!rt.check_step(Packet::control(bad), "data", &state));
        assert_eq!(rt.exit_code(), Some(ExitCode::UnexpectedPacket));
    }

    #[test]
    fn test_replayed_packet_counted_once() {
        let cfg = common(true, 1);
        let state = TickState::new(&cfg);
        let mut rt: Runtime<()> = Runtime::new("t", &cfg, 2);
        let key = PacketKey::new(1 << 16, PacketType::Data).with_colour(true);
        let packet = Packet::new(key, 7);
        assert!(rt.accept(&packet));
        assert!(!rt.check_step(packet, "data", &state));
        rt.release_deferred();

        let replayed = rt.next_replay().unwrap();
        assert!(rt.accept(&replayed));
        assert_eq!(rt.diag.received, 1);
        assert_eq!(rt.diag.received_by_type[PacketType::Data as usize], 1);

        // 次の新着は通常どおり数える
        assert!(rt.accept(&packet));
        assert_eq!(rt.diag.received, 2);
    }

    #[test]
    fn test_runtime_deferred_overflow_is_fatal() {
        let cfg = common(true, 1);
        let state = TickState::new(&cfg);
        let mut rt: Runtime<()> = Runtime::new("t", &cfg, 1);
        let key = PacketKey::new(0, PacketType::Data).with_colour(true);
        rt.defer(Packet::control(key), &state);
        assert!(!rt.is_done());
        rt.defer(Packet::control(key), &state);
        assert_eq!(rt.exit_code(), Some(ExitCode::QueueFull));
        // 終了後は何も受け付けない
        assert!(!rt.accept(&Packet::control(key)));
    }

    #[test]
    fn test_lenient_violation_is_counted() {
        let mut cfg = common(true, 1);
        cfg.stage.strict = false;
        let state = TickState::new(&cfg);
        let mut rt: Runtime<()> = Runtime::new("t", &cfg, 1);
        let sync = Packet::control(PacketKey::new(0, PacketType::Sync));
        assert_eq!(rt.kind(&sync, &state), Some(PacketType::Sync));
        let unknown = Packet::control(PacketKey::from_raw(0xc << crate::packet::TYPE_SHIFT));
        assert_eq!(rt.kind(&unknown, &state), None);
        assert_eq!(rt.diag.violations, 1);
        assert!(!rt.is_done());
    }
}
