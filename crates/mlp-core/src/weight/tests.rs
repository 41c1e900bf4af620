use super::*;
use crate::core::tests::common;
use crate::packet::PacketKey;
use crate::types::{ACTIV_ONE, DELTA_SHIFT, ERROR_SHIFT, NET_SHIFT, WEIGHT_ONE};

const FWD_KEY: u32 = 1 << 16;
const BKP_KEY: u32 = 2 << 16;

fn weight_cfg(rows: usize, cols: usize, weights: Vec<Weight>) -> WeightConfig {
    WeightConfig {
        num_rows: rows,
        num_cols: cols,
        learning_rate: 1 << 14,
        momentum: 0,
        weight_decay: 0,
        delta_dt: 0,
        init_output: ACTIV_ONE / 2,
        weights,
        fwd_key: FWD_KEY,
        bkp_key: BKP_KEY,
        lds_key: 3 << 16,
    }
}

fn build(cfg: WeightConfig, training: bool) -> WeightCore {
    let common = common(training, 1);
    let config = CoreConfig { label: "w".into(), group: 1, common, role: RoleConfig::Weight(cfg) };
    let mut core = WeightCore::new(config).unwrap();
    core.start();
    core
}

fn run(core: &mut WeightCore) {
    while core.run_pending() {}
}

fn output(unit: usize, colour: bool, value: Activation) -> Packet {
    let key = PacketKey::new(7 << 16, PacketType::Data).with_colour(colour).with_index(unit);
    Packet::new(key, value as u32)
}

fn stop(colour: bool, flag: bool) -> Packet {
    Packet::control(PacketKey::new(8 << 16, PacketType::Stop).with_colour(colour).with_flag(flag))
}

fn delta(unit: usize, colour: bool, value: i32) -> Packet {
    let key = PacketKey::new(9 << 16, PacketType::Data)
        .with_phase(Phase::Backprop)
        .with_colour(colour)
        .with_index(unit);
    Packet::new(key, value as u32)
}

/// 現在の FORWARD tick を外から完了させる
fn finish_forward(core: &mut WeightCore, outputs: &[Activation], tick_stop: bool) {
    let colour = core.state().colour;
    for (i, &v) in outputs.iter().enumerate() {
        core.receive(output(i, colour, v));
    }
    core.receive(stop(colour, tick_stop));
    run(core);
}

fn finish_backprop(core: &mut WeightCore, deltas: &[i32]) {
    let colour = core.state().colour;
    for (j, &d) in deltas.iter().enumerate() {
        core.receive(delta(j, colour, d));
    }
    run(core);
}

#[test]
fn test_weights_length_checked() {
    let config = CoreConfig {
        label: "w".into(),
        group: 0,
        common: common(true, 1),
        role: RoleConfig::Weight(weight_cfg(2, 2, vec![0; 3])),
    };
    assert!(matches!(WeightCore::new(config), Err(ConfigError::Length { what: "weights", .. })));
}

#[test]
fn test_forward_nets_per_column() {
    let mut core = build(weight_cfg(2, 2, vec![WEIGHT_ONE, 0, 0, 2 * WEIGHT_ONE]), false);
    run(&mut core);
    let out = core.take_outgoing();
    assert_eq!(out.len(), 2);
    // 0.5 × 1.0 と 0.5 × 2.0
    assert_eq!(out[0].value(), 1 << (NET_SHIFT - 1));
    assert_eq!(out[1].value(), 1 << NET_SHIFT);
    assert_eq!(out[1].key.index(), 1);
    assert_eq!(out[1].key.route(), 1);
}

#[test]
fn test_tick_waits_for_outputs_and_stop() {
    let mut core = build(weight_cfg(2, 1, vec![WEIGHT_ONE, WEIGHT_ONE]), false);
    run(&mut core);
    core.take_outgoing();

    core.receive(output(0, false, ACTIV_ONE));
    core.receive(stop(false, false));
    run(&mut core);
    assert_eq!(core.state().tick, 1);

    core.receive(output(1, false, ACTIV_ONE));
    run(&mut core);
    assert_eq!(core.state().tick, 2);
    // 新しい出力 1.0 + 1.0 で計算し直す
    let out = core.take_outgoing();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].value(), 2 << NET_SHIFT);
    assert!(out[0].key.colour());
}

#[test]
fn test_next_step_output_is_deferred() {
    let mut core = build(weight_cfg(1, 1, vec![WEIGHT_ONE]), false);
    run(&mut core);
    core.take_outgoing();
    core.receive(output(0, true, ACTIV_ONE));
    assert_eq!(core.diagnostics().deferred, 1);

    // 現在の tick を終えると保留分が受信し直される
    finish_forward(&mut core, &[0], false);
    assert_eq!(core.state().tick, 2);
    core.receive(stop(true, false));
    run(&mut core);
    assert_eq!(core.state().tick, 3);
}

#[test]
fn test_backprop_errors() {
    let mut core = build(weight_cfg(2, 2, vec![WEIGHT_ONE, 0, 0, 2 * WEIGHT_ONE]), true);
    run(&mut core);
    finish_forward(&mut core, &[ACTIV_ONE, ACTIV_ONE], true);
    assert_eq!(core.state().phase, Phase::Backprop);
    core.take_outgoing();

    finish_backprop(&mut core, &[1 << DELTA_SHIFT, 1 << (DELTA_SHIFT - 1)]);
    let out = core.take_outgoing();
    let errors: Vec<_> = out.iter().filter(|p| p.key.phase() == Phase::Backprop).collect();
    assert_eq!(errors.len(), 2);
    // 行 0: 1.0 × 1.0、行 1: 2.0 × 0.5
    assert_eq!(errors[0].value(), 1 << ERROR_SHIFT);
    assert_eq!(errors[1].value(), 1 << ERROR_SHIFT);
    assert_eq!(errors[1].key.route(), 2);
    // 次の例題の FORWARD が始まっている
    assert_eq!(core.state().phase, Phase::Forward);
    assert_eq!(core.state().example_inx, 1);
}

#[test]
fn test_epoch_end_updates_and_waits_for_decision() {
    let mut core = build(weight_cfg(1, 1, vec![WEIGHT_ONE]), true);
    run(&mut core);

    // 例題 0
    finish_forward(&mut core, &[ACTIV_ONE / 2], true);
    finish_backprop(&mut core, &[1 << DELTA_SHIFT]);
    // 例題 1（2 イベント）
    finish_forward(&mut core, &[ACTIV_ONE / 2], true);
    finish_forward(&mut core, &[ACTIV_ONE / 2], true);
    finish_backprop(&mut core, &[0]);
    core.take_outgoing();
    finish_backprop(&mut core, &[0]);

    assert_eq!(core.diagnostics().weight_updates, 1);
    // 正の link delta なので重みは減る
    let w = core.weight_block().unwrap()[0];
    assert!(w < WEIGHT_ONE && w > 0, "w = {w}");
    // 判定が来るまで次のエポックの FORWARD は始めない
    assert!(core.take_outgoing().iter().all(|p| p.key.phase() == Phase::Backprop));

    core.receive(Packet::control(PacketKey::new(4 << 16, PacketType::NetStop).with_flag(false)));
    run(&mut core);
    assert_eq!(core.take_outgoing().len(), 1);
    core.receive(Packet::control(PacketKey::new(4 << 16, PacketType::NetStop).with_flag(true)));
    assert!(core.exit_code().is_none());
}
