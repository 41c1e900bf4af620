//! Weight コア
//!
//! 重み行列の 1 ブロック（送信元グループ x → 送信先グループ g）を持つ。
//!
//! - FORWARD: x の前 tick の出力と重みの内積を列ごとに計算し、g の Sum へ送る
//! - BACKPROP: g のデルタを受け取り、x への誤差部分積と link delta を積算する
//! - エポック終了: 更新則に従って重みを更新する
//!
//! FORWARD の tick は「処理完了・x の出力がすべて到着・停止判定受信」の 3 条件で進む。

mod process;
mod update;

pub use update::{
    UpdateParams, apply_change, dougs_rate, link_delta_square, scaled_link_delta, update_block,
    weight_change,
};

use crate::buffer::{DoubleBuffer, TickHistory};
use crate::config::{CommonConfig, CoreConfig, RoleConfig, WeightConfig};
use crate::core::{Core, Diagnostics, Runtime, TickState};
use crate::error::{ConfigError, CoreError, ExitCode};
use crate::host::HostMessage;
use crate::packet::{Packet, PacketType};
use crate::sync::{NetStopHandshake, PacketQueue, Scoreboard, ThreadBarrier, capacity, thread};
use crate::types::{Activation, CoreRole, LongDelta, LongError, LongLds, NetType, Phase, Weight};

/// FORWARD の待ちスレッド
const FW_THREADS: u32 = thread::PROC | thread::COMS | thread::STOP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    /// 前向き内積の計算と送信
    Forward,
    /// デルタキューの処理
    Dequeue,
}

pub struct WeightCore {
    cfg: WeightConfig,
    common: CommonConfig,
    state: TickState,
    rt: Runtime<Task>,
    weights: Vec<Weight>,
    /// エポック中に積算する ∂E/∂w（.27）
    link_deltas: Vec<LongDelta>,
    prev_changes: Vec<Weight>,
    /// x の出力（current = 前 tick、next = 今 tick に受信中）
    outputs: DoubleBuffer<Activation>,
    /// x の出力履歴（tick 0 は初期出力）
    history: TickHistory<Activation>,
    /// 誤差部分積（行ごと）
    errors: Vec<LongError>,
    lds_partial: LongLds,
    deltas: PacketQueue,
    dequeue_active: bool,
    outputs_arrived: Scoreboard,
    deltas_arrived: Scoreboard,
    fw_barrier: ThreadBarrier,
    bp_barrier: ThreadBarrier,
    tick_stop: bool,
    lds_total: u32,
    handshake: NetStopHandshake,
    awaiting_decision: bool,
    params: UpdateParams,
}

impl WeightCore {
    pub fn new(config: CoreConfig) -> Result<WeightCore, ConfigError> {
        let cfg = match config.role {
            RoleConfig::Weight(cfg) => cfg,
            other => {
                return Err(ConfigError::RoleMismatch {
                    expected: CoreRole::Weight,
                    actual: other.role(),
                });
            }
        };
        config.common.validate()?;
        cfg.validate()?;

        let common = config.common;
        let rows = cfg.num_rows;
        let cells = rows * cfg.num_cols;
        let ticks = if common.stage.training { common.net.global_max_ticks as usize } else { 1 };
        let params = UpdateParams {
            rule: common.stage.update,
            learning_rate: cfg.learning_rate,
            momentum: cfg.momentum,
            weight_decay: cfg.weight_decay,
            delta_dt: (common.net.net_type == NetType::Continuous).then_some(cfg.delta_dt),
        };

        Ok(WeightCore {
            state: TickState::new(&common),
            rt: Runtime::new(config.label, &common, capacity::WEIGHT),
            weights: cfg.weights.clone(),
            link_deltas: vec![0; cells],
            prev_changes: vec![0; cells],
            outputs: DoubleBuffer::new(rows, cfg.init_output),
            history: TickHistory::new(rows, ticks, cfg.init_output),
            errors: vec![0; rows],
            lds_partial: 0,
            deltas: PacketQueue::with_capacity(capacity::WEIGHT),
            dequeue_active: false,
            outputs_arrived: Scoreboard::new(rows as u32),
            deltas_arrived: Scoreboard::new(cfg.num_cols as u32),
            fw_barrier: ThreadBarrier::new(FW_THREADS),
            bp_barrier: ThreadBarrier::new(thread::PROC),
            tick_stop: false,
            lds_total: 0,
            handshake: NetStopHandshake::new(),
            awaiting_decision: false,
            params,
            cfg,
            common,
        })
    }

    pub fn state(&self) -> &TickState {
        &self.state
    }

    /// x の出力（FORWARD、即時処理）
    fn receive_output(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "weight output", &self.state) {
            return;
        }
        let Some(i) = self.rt.unit(&packet, self.cfg.num_rows, &self.state) else {
            return;
        };
        let value = packet.value();
        self.outputs.next_mut()[i] = value;
        if self.common.stage.training {
            self.history.store(self.state.tick, i, value);
        }
        if self.outputs_arrived.mark_arrived() {
            self.signal_forward(thread::COMS);
        }
    }

    /// g のデルタ（BACKPROP、キューに積んで後で処理）
    fn queue_delta(&mut self, packet: Packet) {
        if let Err(e) = self.deltas.enqueue(packet) {
            self.rt.fail(e.into(), &self.state);
            return;
        }
        if !self.dequeue_active {
            self.dequeue_active = true;
            self.rt.schedule(Task::Dequeue);
        }
    }

    fn receive_stop(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "weight stop", &self.state) {
            return;
        }
        self.tick_stop = packet.key.flag();
        self.signal_forward(thread::STOP);
    }

    fn receive_lds_result(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "weight lds result", &self.state) {
            return;
        }
        self.lds_total = packet.payload;
        self.signal_backprop(thread::LDSR);
    }

    fn receive_net_stop(&mut self, packet: Packet) {
        if let Some(stop) = self.handshake.on_decision(packet.key.flag()) {
            self.resolve_net_stop(stop);
        }
    }

    fn receive_recovery(&mut self, packet: Packet) {
        if packet.key.flag() {
            log::warn!("{}: deadlock recovery abort", self.rt.label());
            self.rt.stage_done(ExitCode::Timeout, &self.state);
            return;
        }
        if self.state.phase != Phase::Forward {
            self.rt.violation(
                CoreError::Unexpected { what: "weight restart", key: packet.key },
                &self.state,
            );
            return;
        }
        self.state.restart();
        self.rt.diag.recoveries += 1;
        self.outputs_arrived.reset();
        self.fw_barrier.rearm(FW_THREADS);
        self.tick_stop = false;
        log::debug!("{}: restart tick {}", self.rt.label(), self.state.tick);
        if !self.awaiting_decision {
            self.rt.schedule(Task::Forward);
        }
        self.rt.release_deferred();
    }

    fn resolve_net_stop(&mut self, stop: bool) {
        self.awaiting_decision = false;
        if stop {
            self.rt.stage_done(ExitCode::NoError, &self.state);
        } else {
            self.rt.schedule(Task::Forward);
        }
    }
}

impl Core for WeightCore {
    fn role(&self) -> CoreRole {
        CoreRole::Weight
    }

    fn label(&self) -> &str {
        self.rt.label()
    }

    fn start(&mut self) {
        log::debug!(
            "{}: {}x{} block, {:?}, training {}",
            self.rt.label(),
            self.cfg.num_rows,
            self.cfg.num_cols,
            self.params.rule,
            self.common.stage.training
        );
        self.reset_example();
        self.rt.schedule(Task::Forward);
    }

    fn receive(&mut self, packet: Packet) {
        if !self.rt.accept(&packet) {
            return;
        }
        let Some(kind) = self.rt.kind(&packet, &self.state) else {
            return;
        };
        match kind {
            PacketType::Data => match packet.key.phase() {
                Phase::Forward => self.receive_output(packet),
                Phase::Backprop => self.queue_delta(packet),
            },
            PacketType::Stop => self.receive_stop(packet),
            PacketType::LdsResult => self.receive_lds_result(packet),
            PacketType::NetStop => self.receive_net_stop(packet),
            PacketType::DeadlockRecovery => self.receive_recovery(packet),
            _ => self.rt.violation(
                CoreError::Unexpected { what: "weight", key: packet.key },
                &self.state,
            ),
        }
    }

    fn run_pending(&mut self) -> bool {
        if let Some(packet) = self.rt.next_replay() {
            self.receive(packet);
            return true;
        }
        match self.rt.next_task() {
            Some(Task::Forward) => self.forward_process(),
            Some(Task::Dequeue) => self.backprop_process(),
            None => return false,
        }
        true
    }

    fn timer_tick(&mut self) {
        if !self.common.stage.deadlock_recovery && self.rt.watchdog_expired(&self.state) {
            log::error!("{}: watchdog expired", self.rt.label());
            self.rt.stage_done(ExitCode::Timeout, &self.state);
        }
    }

    fn take_outgoing(&mut self) -> Vec<Packet> {
        self.rt.take_outgoing()
    }

    fn take_host_messages(&mut self) -> Vec<HostMessage> {
        self.rt.take_host_messages()
    }

    fn exit_code(&self) -> Option<ExitCode> {
        self.rt.exit_code()
    }

    fn diagnostics(&self) -> &Diagnostics {
        &self.rt.diag
    }

    fn weight_block(&self) -> Option<&[Weight]> {
        Some(&self.weights)
    }
}

#[cfg(test)]
mod tests;
