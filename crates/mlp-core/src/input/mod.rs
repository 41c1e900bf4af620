//! Input コア
//!
//! グループ g のネット入力に入力パイプライン（積分器・ソフトクランプ）をかけ、
//! Threshold コアへ渡す。逆向きはデルタに逆パイプラインをかけて Weight コア群へ送る。

mod pipeline;

pub use pipeline::{
    InputParams, InputState, backward, forward, integrate, integrate_back, soft_clamp,
};

use crate::config::{CommonConfig, CoreConfig, InputConfig, RoleConfig};
use crate::core::{Advance, Core, Diagnostics, Runtime, TickState};
use crate::error::{ConfigError, CoreError, ExitCode};
use crate::host::HostMessage;
use crate::packet::{Packet, PacketKey, PacketType};
use crate::sync::{NetStopHandshake, PacketQueue, Scoreboard, ThreadBarrier, capacity, thread};
use crate::types::{
    ACTIV_NAN, Activation, CoreRole, LONG_DELTA_SHIFT, DELTA_SHIFT, Phase, saturate_delta,
};

const FW_THREADS: u32 = thread::PROC | thread::STOP;
/// s8.23 ⇔ .27
const DELTA_WIDEN: u32 = LONG_DELTA_SHIFT - DELTA_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Dequeue,
}

pub struct InputCore {
    cfg: InputConfig,
    common: CommonConfig,
    state: TickState,
    rt: Runtime<Task>,
    params: InputParams,
    pipe: InputState,
    /// tick 開始時点の積分器状態（デッドロック回復用）
    snapshot: InputState,
    queue: PacketQueue,
    dequeue_active: bool,
    arrived: Scoreboard,
    fw_barrier: ThreadBarrier,
    bp_barrier: ThreadBarrier,
    tick_stop: bool,
    handshake: NetStopHandshake,
}

impl InputCore {
    pub fn new(config: CoreConfig) -> Result<InputCore, ConfigError> {
        let cfg = match config.role {
            RoleConfig::Input(cfg) => cfg,
            other => {
                return Err(ConfigError::RoleMismatch {
                    expected: CoreRole::Input,
                    actual: other.role(),
                });
            }
        };
        config.common.validate()?;
        cfg.validate()?;
        let common = config.common;
        let pipe = InputState::new(cfg.num_units, cfg.init_net);
        Ok(InputCore {
            state: TickState::new(&common),
            rt: Runtime::new(config.label, &common, capacity::INPUT),
            params: InputParams {
                dt: cfg.in_integr_dt,
                soft_clamp_strength: cfg.soft_clamp_strength,
                init_output: cfg.init_output,
            },
            snapshot: pipe.clone(),
            pipe,
            queue: PacketQueue::with_capacity(capacity::INPUT),
            dequeue_active: false,
            arrived: Scoreboard::new(cfg.num_units as u32),
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
            if !self.rt.check_step(packet, "input data", &self.state) {
                continue;
            }
            let Some(u) = self.rt.unit(&packet, self.cfg.num_units, &self.state) else {
                continue;
            };
            match self.state.phase {
                Phase::Forward => self.process_net(u, packet.value()),
                Phase::Backprop => self.process_delta(u, packet.value()),
            }
            if self.arrived.mark_arrived() {
                self.signal(thread::PROC);
            }
        }
        self.dequeue_active = false;
    }

    /// 外部入力（なければ NaN）
    fn external(&self, unit: usize) -> Activation {
        let row = self.state.it_idx(&self.common) * self.cfg.num_units;
        self.cfg.inputs.get(row + unit).copied().unwrap_or(ACTIV_NAN)
    }

    fn process_net(&mut self, unit: usize, net: i32) {
        let external = self.external(unit);
        let net = forward(&self.cfg.stages, unit, net, external, &mut self.pipe, &self.params);
        let key = PacketKey::new(self.cfg.fwd_key, PacketType::Data)
            .with_phase(Phase::Forward)
            .with_colour(self.state.colour)
            .with_index(unit);
        self.rt.send(key, net as u32);
    }

    fn process_delta(&mut self, unit: usize, delta: i32) {
        let wide = (delta as i64) << DELTA_WIDEN;
        let wide = backward(&self.cfg.stages, unit, wide, &mut self.pipe, &self.params);
        let delta = saturate_delta(wide >> DELTA_WIDEN);
        let key = PacketKey::new(self.cfg.bkp_key, PacketType::Data)
            .with_phase(Phase::Backprop)
            .with_colour(self.state.colour)
            .with_index(unit);
        self.rt.send(key, delta as u32);
    }

    fn receive_stop(&mut self, packet: Packet) {
        if !self.rt.check_step(packet, "input stop", &self.state) {
            return;
        }
        self.tick_stop = packet.key.flag();
        self.signal(thread::STOP);
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
            let err = CoreError::Unexpected { what: "input restart", key: packet.key };
            self.rt.violation(err, &self.state);
            return;
        }
        self.state.restart();
        self.rt.diag.recoveries += 1;
        self.pipe.clone_from(&self.snapshot);
        self.arrived.reset();
        self.fw_barrier.rearm(FW_THREADS);
        self.tick_stop = false;
        log::debug!("{}: restart tick {}", self.rt.label(), self.state.tick);
        self.rt.release_deferred();
    }

    fn signal(&mut self, bits: u32) {
        let fired = match self.state.phase {
            Phase::Forward => self.fw_barrier.signal(bits),
            Phase::Backprop => self.bp_barrier.signal(bits),
        };
        if fired {
            self.advance();
        }
    }

    fn advance(&mut self) {
        let advance = match self.state.phase {
            Phase::Forward => {
                let stop = std::mem::take(&mut self.tick_stop);
                self.state.advance_forward(stop, &self.common)
            }
            Phase::Backprop => self.state.advance_backprop(&self.common),
        };
        if let Advance::Example { epoch_end } = advance {
            self.pipe.reset(self.cfg.init_net);
            self.fw_barrier.rearm(FW_THREADS);
            if epoch_end {
                log::debug!("{}: epoch {} done", self.rt.label(), self.state.epoch);
                if let Some(true) = self.handshake.on_epoch_end() {
                    self.rt.stage_done(ExitCode::NoError, &self.state);
                    return;
                }
            }
        }
        if self.state.phase == Phase::Forward {
            self.snapshot.clone_from(&self.pipe);
        }
        self.rt.release_deferred();
    }
}

impl Core for InputCore {
    fn role(&self) -> CoreRole {
        CoreRole::Input
    }

    fn label(&self) -> &str {
        self.rt.label()
    }

    fn start(&mut self) {
        log::debug!(
            "{}: {} units, stages {:?}",
            self.rt.label(),
            self.cfg.num_units,
            self.cfg.stages
        );
        self.pipe.reset(self.cfg.init_net);
        self.snapshot.clone_from(&self.pipe);
    }

    fn receive(&mut self, packet: Packet) {
        if !self.rt.accept(&packet) {
            return;
        }
        let Some(kind) = self.rt.kind(&packet, &self.state) else {
            return;
        };
        match kind {
            PacketType::Data => self.enqueue(packet),
            PacketType::Stop => self.receive_stop(packet),
            PacketType::NetStop => self.receive_net_stop(packet),
            PacketType::DeadlockRecovery => self.receive_recovery(packet),
            _ => {
                let err = CoreError::Unexpected { what: "input", key: packet.key };
                self.rt.violation(err, &self.state);
            }
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
