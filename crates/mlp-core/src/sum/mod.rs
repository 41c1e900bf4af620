//! Sum コア
//!
//! グループ g のユニットごとに、Weight コア群からの部分和を積算する。
//!
//! - FORWARD: ネット部分和 → g の Input へ
//! - BACKPROP: 誤差部分積 → g の Threshold へ
//! - link delta 和: エポック最後の BACKPROP tick に部分和を集め、集約担当へ回す
//!
//! 積算バンクは (フェーズ, パリティ) ごとに 4 面あり、次のステップ分の部分和が
//! 先に届いても別のバンクに積まれる。完了したバンクはラッチしておき、tick が
//! そのバンクに追いついた時点で処理完了を報告する。

use crate::config::{CommonConfig, CoreConfig, END_TICK, RoleConfig, SumConfig};
use crate::core::{Advance, Core, Diagnostics, Runtime, TickState};
use crate::error::{ConfigError, CoreError, ExitCode};
use crate::host::HostMessage;
use crate::packet::{Packet, PacketKey, PacketType};
use crate::sync::{
    NetStopHandshake, PacketQueue, Scoreboard, ThreadBarrier, UnitScoreboard, capacity, thread,
};
use crate::types::{
    CoreRole, LongLds, Phase, UpdateRule, saturate_error, saturate_lds, saturate_net,
};

const FW_THREADS: u32 = thread::PROC | thread::STOP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Dequeue,
}

/// 1 ステップ分の積算バンク
#[derive(Debug, Clone)]
struct Bank {
    accum: Vec<i64>,
    arrivals: UnitScoreboard,
    done: Scoreboard,
    complete: bool,
}

impl Bank {
    fn new(num_units: usize, expected: u32) -> Bank {
        Bank {
            accum: vec![0; num_units],
            arrivals: UnitScoreboard::new(num_units, expected),
            done: Scoreboard::new(num_units as u32),
            complete: false,
        }
    }

    fn reset(&mut self) {
        self.accum.fill(0);
        self.arrivals.reset();
        self.done.reset();
        self.complete = false;
    }
}

pub struct SumCore {
    cfg: SumConfig,
    common: CommonConfig,
    state: TickState,
    rt: Runtime<Task>,
    /// `[phase][colour]`
    banks: [[Bank; 2]; 2],
    queue: PacketQueue,
    dequeue_active: bool,
    lds_sum: LongLds,
    lds_arrived: Scoreboard,
    fw_barrier: ThreadBarrier,
    bp_barrier: ThreadBarrier,
    tick_stop: bool,
    handshake: NetStopHandshake,
}

impl SumCore {
    pub fn new(config: CoreConfig) -> Result<SumCore, ConfigError> {
        let cfg = match config.role {
            RoleConfig::Sum(cfg) => cfg,
            other => {
                return Err(ConfigError::RoleMismatch {
                    expected: CoreRole::Sum,
                    actual: other.role(),
                });
            }
        };
        config.common.validate()?;
        cfg.validate()?;
        let common = config.common;
        let n = cfg.num_units;
        let fw = Bank::new(n, cfg.fwd_expected);
        let bp = Bank::new(n, cfg.bkp_expected);
        Ok(SumCore {
            state: TickState::new(&common),
            rt: Runtime::new(config.label, &common, capacity::SUM),
            banks: [[fw.clone(), fw], [bp.clone(), bp]],
            queue: PacketQueue::with_capacity(capacity::SUM),
            dequeue_active: false,
            lds_sum: 0,
            lds_arrived: Scoreboard::new(cfg.lds_expected.max(1)),
            fw_barrier: ThreadBarrier::new(FW_THREADS),
            bp_barrier: ThreadBarrier::new(thread::PROC),
            tick_stop: false,
            handshake: NetStopHandshake::new(),
            cfg,
            common,
        })
    }

    pub fn state(&self) -> &TickState {
        &self.state
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

    fn process_queue(&mut self) {
        while let Some(packet) = self.queue.dequeue() {
            if self.rt.is_done() {
                break;
            }
            match packet.key.kind() {
                Ok(PacketType::Data) => self.accumulate(packet),
                Ok(PacketType::LdsPartial | PacketType::LdsTotal) => self.accumulate_lds(packet),
                _ => self.rt.violation(
                    CoreError::Unexpected { what: "sum queue", key: packet.key },
                    &self.state,
                ),
            }
        }
        self.dequeue_active = false;
    }

    /// 部分和を (フェーズ, パリティ) のバンクへ積む
    fn accumulate(&mut self, packet: Packet) {
        let key = packet.key;
        if self.state.is_current(key) && key.phase() != self.state.phase {
            self.rt.violation(CoreError::Unexpected { what: "sum data", key }, &self.state);
            return;
        }
        let Some(u) = self.rt.unit(&packet, self.cfg.num_units, &self.state) else {
            return;
        };
        let phase = key.phase();
        let colour = key.colour();
        let bank = &mut self.banks[phase as usize][colour as usize];
        bank.accum[u] += packet.value() as i64;
        if !bank.arrivals.mark_arrived(u) {
            return;
        }

        let total = std::mem::take(&mut bank.accum[u]);
        let (route, value) = match phase {
            Phase::Forward => (self.cfg.fwd_key, saturate_net(total)),
            Phase::Backprop => (self.cfg.bkp_key, saturate_error(total)),
        };
        let out = PacketKey::new(route, PacketType::Data)
            .with_phase(phase)
            .with_colour(colour)
            .with_index(u);
        self.rt.send(out, value as u32);

        let bank = &mut self.banks[phase as usize][colour as usize];
        if bank.done.mark_arrived() {
            if phase == self.state.phase && colour == self.state.colour {
                self.signal(phase, thread::PROC);
            } else {
                bank.complete = true;
            }
        }
    }

    fn accumulate_lds(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "sum lds", &self.state) {
            return;
        }
        self.lds_sum = self.lds_sum.saturating_add(packet.payload as LongLds);
        if !self.lds_arrived.mark_arrived() {
            return;
        }
        let total = saturate_lds(std::mem::take(&mut self.lds_sum));
        let kind =
            if self.cfg.is_first_group { PacketType::LdsResult } else { PacketType::LdsTotal };
        let key = PacketKey::new(self.cfg.lds_key, kind)
            .with_phase(Phase::Backprop)
            .with_colour(self.state.colour);
        self.rt.send(key, total);
        log::debug!("{}: lds {:?} {}", self.rt.label(), kind, total);
        self.signal(Phase::Backprop, thread::LDSA);
    }

    fn receive_stop(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "sum stop", &self.state) {
            return;
        }
        self.tick_stop = packet.key.flag();
        self.signal(Phase::Forward, thread::STOP);
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
                CoreError::Unexpected { what: "sum restart", key: packet.key },
                &self.state,
            );
            return;
        }
        self.banks[Phase::Forward as usize][self.state.colour as usize].reset();
        self.state.restart();
        self.rt.diag.recoveries += 1;
        self.fw_barrier.rearm(FW_THREADS);
        self.tick_stop = false;
        log::debug!("{}: restart tick {}", self.rt.label(), self.state.tick);
        self.check_latched();
        self.rt.release_deferred();
    }

    fn is_lds_step(&self) -> bool {
        self.common.stage.training
            && self.common.stage.update == UpdateRule::DougsMomentum
            && self.state.phase == Phase::Backprop
            && self.state.tick == END_TICK
            && self.state.is_last_example(&self.common)
    }

    fn backprop_threads(&self) -> u32 {
        if self.is_lds_step() { thread::PROC | thread::LDSA } else { thread::PROC }
    }

    fn signal(&mut self, phase: Phase, bits: u32) {
        match phase {
            Phase::Forward => {
                if self.fw_barrier.signal(bits) {
                    self.advance_forward();
                }
            }
            Phase::Backprop => {
                if self.bp_barrier.signal(bits) {
                    self.advance_backprop();
                }
            }
        }
    }

    /// 現在のバンクが先に完了していれば処理完了を報告する
    fn check_latched(&mut self) {
        let bank = &mut self.banks[self.state.phase as usize][self.state.colour as usize];
        if bank.complete {
            bank.complete = false;
            self.signal(self.state.phase, thread::PROC);
        }
    }

    fn advance_forward(&mut self) {
        let stop = std::mem::take(&mut self.tick_stop);
        match self.state.advance_forward(stop, &self.common) {
            Advance::ToBackprop => self.bp_barrier.rearm(self.backprop_threads()),
            Advance::Example { epoch_end } => self.next_example(epoch_end),
            Advance::Tick | Advance::Event => {}
        }
        self.after_advance();
    }

    fn advance_backprop(&mut self) {
        match self.state.advance_backprop(&self.common) {
            Advance::Example { epoch_end } => self.next_example(epoch_end),
            _ => self.bp_barrier.rearm(self.backprop_threads()),
        }
        self.after_advance();
    }

    fn after_advance(&mut self) {
        self.rt.release_deferred();
        if !self.rt.is_done() {
            self.check_latched();
        }
    }

    fn next_example(&mut self, epoch_end: bool) {
        self.fw_barrier.rearm(FW_THREADS);
        if epoch_end {
            log::debug!("{}: epoch {} done", self.rt.label(), self.state.epoch);
            if let Some(true) = self.handshake.on_epoch_end() {
                self.rt.stage_done(ExitCode::NoError, &self.state);
            }
        }
    }
}

impl Core for SumCore {
    fn role(&self) -> CoreRole {
        CoreRole::Sum
    }

    fn label(&self) -> &str {
        self.rt.label()
    }

    fn start(&mut self) {
        log::debug!(
            "{}: {} units, expects fwd {} bkp {} lds {}",
            self.rt.label(),
            self.cfg.num_units,
            self.cfg.fwd_expected,
            self.cfg.bkp_expected,
            self.cfg.lds_expected
        );
        for bank in self.banks.iter_mut().flatten() {
            bank.reset();
        }
    }

    fn receive(&mut self, packet: Packet) {
        if !self.rt.accept(&packet) {
            return;
        }
        let Some(kind) = self.rt.kind(&packet, &self.state) else {
            return;
        };
        match kind {
            PacketType::Data | PacketType::LdsPartial | PacketType::LdsTotal => {
                self.enqueue(packet)
            }
            PacketType::Stop => self.receive_stop(packet),
            PacketType::NetStop => self.receive_net_stop(packet),
            PacketType::DeadlockRecovery => self.receive_recovery(packet),
            _ => self.rt.violation(
                CoreError::Unexpected { what: "sum", key: packet.key },
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
}
