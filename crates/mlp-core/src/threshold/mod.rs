//! Threshold コア
//!
//! グループ g の出力パイプラインを実行する。
//!
//! - FORWARD: Input からのネット入力に出力段をかけ、出力を Weight コア群へ送る。
//!   出力グループは誤差関数の微分と停止判定も計算する。
//! - 停止判定: 出力グループは順にデイジーチェーンで判定を渡し、最終出力グループが
//!   tick 停止判定（STOP）を全コアへ、エポック終了時にネットワーク停止判定（STPN）を送る。
//! - BACKPROP: 受け取った誤差と記録した出力微分から出力段を逆にたどってデルタを作る。
//!
//! 最終出力グループはデッドロック監視も受け持つ。

mod criteria;
mod pipeline;
mod process;

pub use criteria::Criterion;
pub use pipeline::{
    OutputParams, OutputState, backward, error_deriv, forward, integrate, integrate_back,
    logistic_back, weak_clamp,
};

use crate::buffer::{DoubleBuffer, TickHistory};
use crate::config::{CommonConfig, CoreConfig, DLRV_MAX_CNT, RoleConfig, ThresholdConfig};
use crate::core::{Core, Diagnostics, Runtime, TickState};
use crate::error::{ConfigError, CoreError, ExitCode};
use crate::host::{HostMessage, TestResults};
use crate::packet::{Packet, PacketKey, PacketType};
use crate::sync::{NetStopHandshake, PacketQueue, Scoreboard, ThreadBarrier, capacity, thread};
use crate::types::{Activation, CoreRole, ErrorValue, LongDerivative, Net, Phase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    /// ネット入力と判定パケットのキュー処理
    Dequeue,
    /// 現在の BACKPROP tick のデルタ計算
    Backprop,
}

pub struct ThresholdCore {
    cfg: ThresholdConfig,
    common: CommonConfig,
    group: usize,
    state: TickState,
    rt: Runtime<Task>,
    params: OutputParams,
    pipe: OutputState,
    /// tick 開始時点の積分器状態（デッドロック回復用）
    snapshot: OutputState,
    outputs: Vec<Activation>,
    net_history: TickHistory<Net>,
    deriv_history: TickHistory<LongDerivative>,
    clamp_history: TickHistory<bool>,
    /// 誤差（current = 今 tick で使う、next = 受信中の 1 つ前の tick 分）
    errors: DoubleBuffer<ErrorValue>,
    queue: PacketQueue,
    dequeue_active: bool,
    nets_arrived: Scoreboard,
    errors_arrived: Scoreboard,
    /// 出力グループの判定待ち（処理完了と前段グループの CRIT）
    crit_barrier: ThreadBarrier,
    /// tick 停止判定待ち（最終出力グループ以外）
    tick_barrier: ThreadBarrier,
    bp_barrier: ThreadBarrier,
    criterion: Criterion,
    /// 前段グループから届いた判定
    crit_prev: bool,
    /// 今 tick の全出力グループの判定（最終出力グループのみ）
    group_crit: bool,
    /// 例題内の全イベントで判定を満たしたか
    event_crit: bool,
    /// エポック内の全例題で判定を満たしたか
    example_crit: bool,
    tick_stop: bool,
    /// 今 tick の出力をホストへ報告済みか
    recorded: bool,
    dlrv_cnt: u32,
    results: TestResults,
    handshake: NetStopHandshake,
}

impl ThresholdCore {
    pub fn new(config: CoreConfig) -> Result<ThresholdCore, ConfigError> {
        let cfg = match config.role {
            RoleConfig::Threshold(cfg) => cfg,
            other => {
                return Err(ConfigError::RoleMismatch {
                    expected: CoreRole::Threshold,
                    actual: other.role(),
                });
            }
        };
        config.common.validate()?;
        cfg.validate()?;

        let common = config.common;
        let n = cfg.num_units;
        let ticks = if common.stage.training { common.net.global_max_ticks as usize } else { 1 };
        let pipe = OutputState::new(n, cfg.init_output);

        Ok(ThresholdCore {
            group: config.group,
            state: TickState::new(&common),
            rt: Runtime::new(config.label, &common, capacity::THRESHOLD),
            params: OutputParams {
                dt: cfg.out_integr_dt,
                weak_clamp_strength: cfg.weak_clamp_strength,
            },
            snapshot: pipe.clone(),
            pipe,
            outputs: vec![cfg.init_output; n],
            net_history: TickHistory::new(n, ticks, 0),
            deriv_history: TickHistory::new(n, ticks, 0),
            clamp_history: TickHistory::new(n, ticks, false),
            errors: DoubleBuffer::new(n, 0),
            queue: PacketQueue::with_capacity(capacity::THRESHOLD),
            dequeue_active: false,
            nets_arrived: Scoreboard::new(n as u32),
            errors_arrived: Scoreboard::new(n as u32),
            crit_barrier: ThreadBarrier::new(thread::PROC),
            tick_barrier: ThreadBarrier::new(thread::PROC | thread::STOP),
            bp_barrier: ThreadBarrier::new(thread::PROC | thread::COMS),
            criterion: Criterion::new(cfg.criterion, cfg.group_criterion),
            crit_prev: true,
            group_crit: true,
            event_crit: true,
            example_crit: true,
            tick_stop: false,
            recorded: false,
            dlrv_cnt: 0,
            results: TestResults::default(),
            handshake: NetStopHandshake::new(),
            cfg,
            common,
        })
    }

    pub fn state(&self) -> &TickState {
        &self.state
    }

    pub fn results(&self) -> &TestResults {
        &self.results
    }

    /// 最新の出力
    pub fn outputs(&self) -> &[Activation] {
        &self.outputs
    }

    /// 最終出力グループか（tick 停止判定とネットワーク停止判定を出す）
    #[inline]
    fn is_last_output(&self) -> bool {
        self.cfg.output_grp && self.cfg.is_last_output_group
    }

    fn enqueue(&mut self, packet: Packet) {
        if let Err(e) = self.queue.enqueue(packet) {
            self.rt.fail(e.into(), &self.state);
            return;
        }
        if !self.dequeue_active {
            self.dequeue_active = true;
            self.rt.schedule(Task::Dequeue);
        }
    }

    /// Sum からの誤差（BACKPROP、即時処理）
    fn receive_error(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "threshold error", &self.state) {
            return;
        }
        let Some(u) = self.rt.unit(&packet, self.cfg.num_units, &self.state) else {
            return;
        };
        self.errors.next_mut()[u] = packet.value();
        if self.errors_arrived.mark_arrived() {
            self.signal_backprop(thread::COMS);
        }
    }

    fn receive_stop(&mut self, packet: Packet) {
        if self.is_last_output() {
            self.rt.violation(
                CoreError::Unexpected { what: "threshold stop", key: packet.key },
                &self.state,
            );
            return;
        }
        if !self.rt.check_step(packet, "threshold stop", &self.state) {
            return;
        }
        self.tick_stop = packet.key.flag();
        self.signal_tick(thread::STOP);
    }

    fn receive_net_stop(&mut self, packet: Packet) {
        if let Some(true) = self.handshake.on_decision(packet.key.flag()) {
            self.rt.stage_done(ExitCode::NoError, &self.state);
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
                CoreError::Unexpected { what: "threshold restart", key: packet.key },
                &self.state,
            );
            return;
        }
        self.restart_tick();
    }

    /// 最終出力グループのデッドロック監視
    fn watch(&mut self) {
        if !self.rt.watchdog_expired(&self.state) {
            return;
        }
        let abort = self.state.phase != Phase::Forward || self.dlrv_cnt >= DLRV_MAX_CNT;
        let key = PacketKey::new(self.cfg.dlrv_key, PacketType::DeadlockRecovery).with_flag(abort);
        self.rt.send(key, 0);
        if abort {
            log::error!(
                "{}: deadlock at {:?} tick {} after {} restarts, aborting",
                self.rt.label(),
                self.state.phase,
                self.state.tick,
                self.dlrv_cnt
            );
            self.report_final(ExitCode::Timeout);
            self.rt.stage_done(ExitCode::Timeout, &self.state);
            return;
        }
        self.dlrv_cnt += 1;
        log::warn!(
            "{}: deadlock at tick {}, restart {}",
            self.rt.label(),
            self.state.tick,
            self.dlrv_cnt
        );
        self.restart_tick();
        self.rt.rewind_watchdog();
    }
}

impl Core for ThresholdCore {
    fn role(&self) -> CoreRole {
        CoreRole::Threshold
    }

    fn label(&self) -> &str {
        self.rt.label()
    }

    fn start(&mut self) {
        log::debug!(
            "{}: {} units, stages {:?}, output {} (first {}, last {})",
            self.rt.label(),
            self.cfg.num_units,
            self.cfg.stages,
            self.cfg.output_grp,
            self.cfg.is_first_output_group,
            self.cfg.is_last_output_group
        );
        if self.cfg.output_grp {
            self.rt.report(HostMessage::Info {
                group: self.group,
                num_units: self.cfg.num_units,
                training: self.common.stage.training,
                num_examples: self.common.stage.num_examples,
            });
        }
        self.crit_barrier.rearm(self.crit_threads());
        self.start_example();
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
                Phase::Forward => self.enqueue(packet),
                Phase::Backprop => self.receive_error(packet),
            },
            PacketType::Criterion if self.cfg.output_grp && !self.cfg.is_first_output_group => {
                self.enqueue(packet)
            }
            PacketType::Stop => self.receive_stop(packet),
            PacketType::NetStop if !self.is_last_output() => self.receive_net_stop(packet),
            PacketType::DeadlockRecovery if !self.is_last_output() => self.receive_recovery(packet),
            _ => self.rt.violation(
                CoreError::Unexpected { what: "threshold", key: packet.key },
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
            Some(Task::Dequeue) => self.process_queue(),
            Some(Task::Backprop) => self.backprop_process(),
            None => return false,
        }
        true
    }

    fn timer_tick(&mut self) {
        if self.common.stage.deadlock_recovery {
            if self.is_last_output() {
                self.watch();
            }
        } else if self.rt.watchdog_expired(&self.state) {
            log::error!("{}: watchdog expired", self.rt.label());
            if self.is_last_output() {
                self.report_final(ExitCode::Timeout);
            }
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
}

#[cfg(test)]
mod tests;
