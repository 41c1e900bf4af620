//! Weight コアの処理と tick 進行

use super::{FW_THREADS, WeightCore};
use crate::core::Advance;
use crate::packet::{PacketKey, PacketType};
use crate::sync::thread;
use crate::types::{
    ACTIV_SHIFT, DELTA_SHIFT, LONG_DELTA_SHIFT, NET_SHIFT, Phase, UpdateRule, WEIGHT_SHIFT,
    saturate_error, saturate_lds, saturate_net,
};

/// s4.27 × s16.15 → s8.23
const NET_PRODUCT_SHIFT: u32 = ACTIV_SHIFT + WEIGHT_SHIFT - NET_SHIFT;
/// s4.27 × s8.23 → .27
const LINK_DELTA_SHIFT: u32 = ACTIV_SHIFT + DELTA_SHIFT - LONG_DELTA_SHIFT;
/// s16.15 × s8.23 → s16.15
const ERROR_PRODUCT_SHIFT: u32 = DELTA_SHIFT;

impl WeightCore {
    /// 前向き内積を列ごとに計算して送る
    pub(super) fn forward_process(&mut self) {
        let rows = self.cfg.num_rows;
        let cols = self.cfg.num_cols;
        let base = PacketKey::new(self.cfg.fwd_key, PacketType::Data)
            .with_phase(Phase::Forward)
            .with_colour(self.state.colour);
        let outputs = self.outputs.current();
        for j in 0..cols {
            let mut net: i64 = 0;
            for (i, &out) in outputs.iter().enumerate().take(rows) {
                net += out as i64 * self.weights[i * cols + j] as i64;
            }
            let net = saturate_net(net >> NET_PRODUCT_SHIFT);
            self.rt.send(base.with_index(j), net as u32);
        }
        log::trace!("{}: sent {} nets for tick {}", self.rt.label(), cols, self.state.tick);
        self.signal_forward(thread::PROC);
    }

    /// デルタキューを空になるまで処理する
    pub(super) fn backprop_process(&mut self) {
        while let Some(packet) = self.deltas.dequeue() {
            if self.rt.is_done() {
                break;
            }
            if !self.rt.check_step(packet, "weight delta", &self.state) {
                continue;
            }
            let Some(j) = self.rt.unit(&packet, self.cfg.num_cols, &self.state) else {
                continue;
            };
            self.accumulate_delta(j, packet.value() as i64);
            if self.deltas_arrived.mark_arrived() {
                self.send_errors();
                self.signal_backprop(thread::PROC);
            }
        }
        self.dequeue_active = false;
    }

    /// 列 `j` のデルタを link delta と誤差部分積へ積算する
    fn accumulate_delta(&mut self, j: usize, delta: i64) {
        let cols = self.cfg.num_cols;
        let lds_step = self.is_lds_step();
        let prev = self.history.row(self.state.tick - 1);
        for (i, &out) in prev.iter().enumerate() {
            let cell = i * cols + j;
            let w = self.weights[cell];
            self.link_deltas[cell] += (out as i64 * delta) >> LINK_DELTA_SHIFT;
            self.errors[i] += (w as i64 * delta) >> ERROR_PRODUCT_SHIFT;
            if lds_step && w != 0 {
                self.lds_partial = self
                    .lds_partial
                    .saturating_add(super::link_delta_square(
                        self.link_deltas[cell],
                        self.params.delta_dt,
                    ));
            }
        }
    }

    fn send_errors(&mut self) {
        let base = PacketKey::new(self.cfg.bkp_key, PacketType::Data)
            .with_phase(Phase::Backprop)
            .with_colour(self.state.colour);
        for i in 0..self.cfg.num_rows {
            let e = saturate_error(self.errors[i]);
            self.rt.send(base.with_index(i), e as u32);
        }
        self.errors.fill(0);

        if self.is_lds_step() {
            let key = PacketKey::new(self.cfg.lds_key, PacketType::LdsPartial)
                .with_phase(Phase::Backprop)
                .with_colour(self.state.colour);
            self.rt.send(key, saturate_lds(self.lds_partial));
            self.lds_partial = 0;
        }
    }

    /// link delta 和を集める tick か（エポック最後の例題の BACKPROP 最終 tick）
    fn is_lds_step(&self) -> bool {
        self.common.stage.training
            && self.params.rule == UpdateRule::DougsMomentum
            && self.state.phase == Phase::Backprop
            && self.state.tick == crate::config::END_TICK
            && self.state.is_last_example(&self.common)
    }

    fn backprop_threads(&self) -> u32 {
        if self.is_lds_step() { thread::PROC | thread::LDSR } else { thread::PROC }
    }

    pub(super) fn signal_forward(&mut self, bits: u32) {
        if self.fw_barrier.signal(bits) {
            self.advance_forward();
        }
    }

    pub(super) fn signal_backprop(&mut self, bits: u32) {
        if self.bp_barrier.signal(bits) {
            self.advance_backprop();
        }
    }

    fn advance_forward(&mut self) {
        self.outputs.swap();
        let stop = self.tick_stop;
        self.tick_stop = false;
        match self.state.advance_forward(stop, &self.common) {
            Advance::Tick | Advance::Event => self.rt.schedule(super::Task::Forward),
            Advance::ToBackprop => {
                log::debug!("{}: backprop from tick {}", self.rt.label(), self.state.tick);
                self.bp_barrier.rearm(self.backprop_threads());
            }
            Advance::Example { epoch_end } => self.next_example(epoch_end),
        }
        self.rt.release_deferred();
    }

    fn advance_backprop(&mut self) {
        match self.state.advance_backprop(&self.common) {
            Advance::Example { epoch_end } => self.next_example(epoch_end),
            _ => self.bp_barrier.rearm(self.backprop_threads()),
        }
        self.rt.release_deferred();
    }

    /// 例題の先頭へ戻す
    pub(super) fn reset_example(&mut self) {
        self.outputs.fill(self.cfg.init_output);
        let init = vec![self.cfg.init_output; self.cfg.num_rows];
        self.history.store_row(0, &init);
        self.outputs_arrived.reset();
        self.deltas_arrived.reset();
        self.fw_barrier.rearm(FW_THREADS);
    }

    fn next_example(&mut self, epoch_end: bool) {
        if epoch_end && self.common.stage.training {
            self.update_weights();
        }
        self.reset_example();
        if !epoch_end {
            self.rt.schedule(super::Task::Forward);
            return;
        }
        log::debug!("{}: epoch {} done", self.rt.label(), self.state.epoch);
        match self.handshake.on_epoch_end() {
            Some(stop) => self.resolve_net_stop(stop),
            None => self.awaiting_decision = true,
        }
    }

    fn update_weights(&mut self) {
        let updated = super::update_block(
            &mut self.weights,
            &self.link_deltas,
            &mut self.prev_changes,
            &self.params,
            self.lds_total,
        );
        self.link_deltas.fill(0);
        self.rt.diag.weight_updates += 1;
        log::debug!(
            "{}: updated {} weights (epoch {}, lds {})",
            self.rt.label(),
            updated,
            self.state.epoch,
            self.lds_total
        );
    }
}
