//! Threshold コアの処理・停止判定・tick 進行

use super::{Task, ThresholdCore, backward, error_deriv, forward};
use crate::core::Advance;
use crate::error::ExitCode;
use crate::host::{HostMessage, TickRecord};
use crate::packet::{PacketKey, PacketType};
use crate::sync::thread;
use crate::types::{
    ACTIV_NAN, Activation, ERROR_SHIFT, LONG_DERIV_SHIFT, Net, Phase, activation_to_short,
};

/// s16.15 ⇒ .27
const ERROR_WIDEN: u32 = LONG_DERIV_SHIFT - ERROR_SHIFT;
const TICK_THREADS: u32 = thread::PROC | thread::STOP;

impl ThresholdCore {
    pub(super) fn process_queue(&mut self) {
        while let Some(packet) = self.queue.dequeue() {
            if self.rt.is_done() {
                break;
            }
            if !self.rt.check_step(packet, "threshold", &self.state) {
                continue;
            }
            if let Ok(PacketType::Criterion) = packet.key.kind() {
                self.crit_prev &= packet.key.flag();
                self.signal_crit(thread::CRIT);
                continue;
            }
            let Some(u) = self.rt.unit(&packet, self.cfg.num_units, &self.state) else {
                continue;
            };
            self.process_net(u, packet.value());
        }
        self.dequeue_active = false;
    }

    /// 現在のイベントの外部入力・目標（なければ NaN）
    fn event_value(&self, values: &[Activation], unit: usize) -> Activation {
        let row = self.state.it_idx(&self.common) * self.cfg.num_units;
        values.get(row + unit).copied().unwrap_or(ACTIV_NAN)
    }

    fn process_net(&mut self, unit: usize, net: Net) {
        let tick = self.state.tick;
        let training = self.common.stage.training;
        let external = self.event_value(&self.cfg.inputs, unit);
        let (out, clamped) =
            forward(&self.cfg.stages, unit, net, external, &mut self.pipe, &self.params);
        self.outputs[unit] = out;
        if training {
            self.net_history.store(tick, unit, net);
            self.clamp_history.store(tick, unit, clamped);
        }
        let key = PacketKey::new(self.cfg.fwd_key, PacketType::Data)
            .with_phase(Phase::Forward)
            .with_colour(self.state.colour)
            .with_index(unit);
        self.rt.send(key, out as u32);

        if self.cfg.output_grp {
            let target = self.event_value(&self.cfg.targets, unit);
            if training {
                let deriv = error_deriv(self.cfg.error_function, out, target);
                self.deriv_history.store(tick, unit, deriv);
            }
            self.criterion.evaluate(unit, out, target);
        }

        if self.nets_arrived.mark_arrived() {
            self.units_done();
        }
    }

    fn units_done(&mut self) {
        if !self.cfg.output_grp {
            self.signal_tick(thread::PROC);
            return;
        }
        if self.cfg.write_out && !self.cfg.last_tick_only && !self.recorded {
            self.record_outputs();
        }
        self.signal_crit(thread::PROC);
    }

    fn signal_crit(&mut self, bits: u32) {
        if self.crit_barrier.signal(bits) {
            self.send_crit();
        }
    }

    pub(super) fn signal_tick(&mut self, bits: u32) {
        if self.tick_barrier.signal(bits) {
            self.advance_forward();
        }
    }

    /// 判定を次の出力グループへ渡す。最終出力グループは tick 停止判定を放送して進む
    fn send_crit(&mut self) {
        let crit = self.criterion.is_met() && self.crit_prev;
        self.crit_prev = true;
        self.criterion.reset();

        if !self.is_last_output() {
            let key = PacketKey::new(self.cfg.stop_key, PacketType::Criterion)
                .with_phase(Phase::Forward)
                .with_colour(self.state.colour)
                .with_flag(crit);
            self.rt.send(key, 0);
            self.signal_tick(thread::PROC);
            return;
        }

        self.group_crit = crit;
        let (min_ticks, max_ticks) = self.state.event_ticks(&self.common);
        let ev_tick = self.state.ev_tick;
        let stop = ev_tick >= max_ticks
            || self.state.tick >= self.common.net.global_max_ticks - 1
            || (crit && ev_tick >= min_ticks);
        let key = PacketKey::new(self.cfg.stop_key, PacketType::Stop)
            .with_phase(Phase::Forward)
            .with_colour(self.state.colour)
            .with_flag(stop);
        self.rt.send(key, 0);
        log::trace!("{}: tick {} stop {} crit {}", self.rt.label(), self.state.tick, stop, crit);
        self.tick_stop = stop;
        self.advance_forward();
    }

    fn advance_forward(&mut self) {
        let stop = std::mem::take(&mut self.tick_stop);
        let tick = self.state.tick;
        if stop {
            self.close_event(tick);
        }

        self.recorded = false;
        self.dlrv_cnt = 0;
        match self.state.advance_forward(stop, &self.common) {
            Advance::Tick | Advance::Event => self.snapshot.clone_from(&self.pipe),
            Advance::ToBackprop => self.switch_to_backprop(),
            Advance::Example { epoch_end } => self.next_example(epoch_end),
        }
        self.rt.release_deferred();
    }

    /// イベント終了時の判定の集計（状態を進める前に呼ぶ）
    fn close_event(&mut self, tick: u32) {
        let ends_example = self.state.evt + 1 >= self.state.num_events
            || tick >= self.common.net.global_max_ticks - 1;
        if ends_example && self.cfg.output_grp && self.cfg.write_out && self.cfg.last_tick_only {
            self.record_outputs();
        }
        if !self.is_last_output() {
            return;
        }

        let (min_ticks, _) = self.state.event_ticks(&self.common);
        self.event_crit &= self.group_crit && self.state.ev_tick >= min_ticks;
        if !ends_example {
            return;
        }
        // gmt で打ち切られた例題は残りのイベントを満たしていない
        let all_events = self.state.evt + 1 >= self.state.num_events;
        let correct = self.event_crit && all_events;
        self.example_crit &= correct;
        if !self.common.stage.training {
            self.results.examples_tested += 1;
            self.results.ticks_tested += tick + 1;
            self.results.examples_correct += correct as u32;
        }
    }

    fn switch_to_backprop(&mut self) {
        log::debug!("{}: backprop from tick {}", self.rt.label(), self.state.tick);
        self.errors.fill(0);
        self.errors_arrived.reset();
        self.pipe.last_deriv.fill(0);
        self.bp_barrier.rearm(thread::PROC | thread::COMS);
        self.rt.schedule(Task::Backprop);
    }

    /// 現在の BACKPROP tick のデルタを計算して Input へ送る
    pub(super) fn backprop_process(&mut self) {
        let tick = self.state.tick;
        let base = PacketKey::new(self.cfg.bkp_key, PacketType::Data)
            .with_phase(Phase::Backprop)
            .with_colour(self.state.colour);
        for u in 0..self.cfg.num_units {
            let mut deriv = (self.errors.current()[u] as i64) << ERROR_WIDEN;
            if self.cfg.output_grp {
                deriv += self.deriv_history.get(tick, u);
            }
            let delta = backward(
                &self.cfg.stages,
                u,
                deriv,
                self.net_history.get(tick, u),
                self.clamp_history.get(tick, u),
                &mut self.pipe,
                &self.params,
            );
            self.rt.send(base.with_index(u), delta as u32);
        }
        self.signal_backprop(thread::PROC);
    }

    pub(super) fn signal_backprop(&mut self, bits: u32) {
        if self.bp_barrier.signal(bits) {
            self.advance_backprop();
        }
    }

    fn advance_backprop(&mut self) {
        self.errors.swap();
        self.dlrv_cnt = 0;
        match self.state.advance_backprop(&self.common) {
            Advance::Example { epoch_end } => self.next_example(epoch_end),
            _ => self.rt.schedule(Task::Backprop),
        }
        self.rt.release_deferred();
    }

    /// 例題の先頭の状態へ戻す
    pub(super) fn start_example(&mut self) {
        self.pipe.reset(self.cfg.init_output);
        self.snapshot.clone_from(&self.pipe);
        self.outputs.fill(self.cfg.init_output);
        self.criterion.reset();
        self.crit_prev = true;
        self.event_crit = true;
        self.recorded = false;
    }

    fn next_example(&mut self, epoch_end: bool) {
        self.start_example();
        if !epoch_end {
            return;
        }
        log::debug!("{}: epoch {} done", self.rt.label(), self.state.epoch);
        if self.is_last_output() {
            self.end_epoch();
        } else if let Some(true) = self.handshake.on_epoch_end() {
            self.rt.stage_done(ExitCode::NoError, &self.state);
        }
    }

    /// ネットワーク停止判定を決めて全コアへ送る（最終出力グループ）
    fn end_epoch(&mut self) {
        let training = self.common.stage.training;
        if training {
            self.results.epochs_trained += 1;
        }
        let stop =
            !training || self.state.epoch >= self.common.stage.num_epochs || self.example_crit;
        let key = PacketKey::new(self.cfg.stpn_key, PacketType::NetStop).with_flag(stop);
        self.rt.send(key, 0);
        log::info!(
            "{}: epoch {} criterion {} -> {}",
            self.rt.label(),
            self.state.epoch,
            self.example_crit,
            if stop { "stop" } else { "continue" }
        );
        self.example_crit = true;

        if stop {
            self.report_final(ExitCode::NoError);
            self.rt.stage_done(ExitCode::NoError, &self.state);
        } else {
            self.results.examples_tested = 0;
            self.results.ticks_tested = 0;
            self.results.examples_correct = 0;
        }
    }

    fn record_outputs(&mut self) {
        let values = (0..self.cfg.num_units)
            .map(|u| {
                let target = self.event_value(&self.cfg.targets, u);
                (activation_to_short(self.outputs[u]), activation_to_short(target))
            })
            .collect();
        let record = TickRecord {
            epoch: self.state.epoch,
            example: self.state.example_inx,
            event: self.state.evt,
            tick: self.state.tick,
        };
        self.rt.report(HostMessage::Outputs { group: self.group, record, values });
        self.recorded = true;
    }

    pub(super) fn report_final(&mut self, exit: ExitCode) {
        if self.is_last_output() {
            self.rt.report(HostMessage::Final { group: self.group, results: self.results, exit });
        }
    }

    pub(super) fn crit_threads(&self) -> u32 {
        if self.cfg.output_grp && !self.cfg.is_first_output_group {
            thread::PROC | thread::CRIT
        } else {
            thread::PROC
        }
    }

    /// 現在の FORWARD tick をやり直す
    pub(super) fn restart_tick(&mut self) {
        self.state.restart();
        self.rt.diag.recoveries += 1;
        self.pipe.clone_from(&self.snapshot);
        self.nets_arrived.reset();
        self.criterion.reset();
        self.crit_prev = true;
        self.crit_barrier.rearm(self.crit_threads());
        self.tick_barrier.rearm(TICK_THREADS);
        self.tick_stop = false;
        log::debug!("{}: restart tick {}", self.rt.label(), self.state.tick);
        self.rt.release_deferred();
    }
}
