use super::*;
use crate::config::WeightConfig;
use crate::core::tests::common;
use crate::types::{
    ACTIV_ONE, DELTA_SHIFT, ERROR_SHIFT, ErrorFunction, NET_SHIFT, OutputStage, StopCriterion,
};
use smallvec::SmallVec;

const STOP_KEY: u32 = 3 << 16;
const STPN_KEY: u32 = 4 << 16;
const DLRV_KEY: u32 = 5 << 16;

fn threshold_cfg(first: bool, last: bool) -> ThresholdConfig {
    ThresholdConfig {
        num_units: 1,
        output_grp: true,
        input_grp: false,
        is_first_output_group: first,
        is_last_output_group: last,
        stages: SmallVec::from_slice(&[OutputStage::Logistic]),
        out_integr_dt: 0,
        weak_clamp_strength: 0,
        init_output: 0,
        group_criterion: (2 << ERROR_SHIFT) / 10,
        criterion: StopCriterion::Standard,
        error_function: ErrorFunction::Squared,
        write_out: true,
        last_tick_only: false,
        inputs: vec![],
        targets: vec![ACTIV_ONE, 0, ACTIV_ONE],
        fwd_key: 1 << 16,
        bkp_key: 2 << 16,
        stop_key: STOP_KEY,
        stpn_key: STPN_KEY,
        dlrv_key: DLRV_KEY,
    }
}

fn build(cfg: ThresholdConfig, common: CommonConfig) -> ThresholdCore {
    let role = RoleConfig::Threshold(cfg);
    let config = CoreConfig { label: "t".into(), group: 2, common, role };
    let mut core = ThresholdCore::new(config).unwrap();
    core.start();
    core
}

fn net(colour: bool, value: i32) -> Packet {
    let key = PacketKey::new(9 << 16, PacketType::Data).with_colour(colour).with_index(0);
    Packet::new(key, value as u32)
}

fn run(core: &mut ThresholdCore) {
    while core.run_pending() {}
}

fn sent_of(packets: &[Packet], kind: PacketType) -> Vec<Packet> {
    packets.iter().copied().filter(|p| p.key.kind() == Ok(kind)).collect()
}

#[test]
fn test_role_mismatch() {
    let cfg = WeightConfig {
        num_rows: 1,
        num_cols: 1,
        learning_rate: 0,
        momentum: 0,
        weight_decay: 0,
        delta_dt: 0,
        init_output: 0,
        weights: vec![0],
        fwd_key: 0,
        bkp_key: 0,
        lds_key: 0,
    };
    let role = RoleConfig::Weight(cfg);
    let config = CoreConfig { label: "t".into(), group: 0, common: common(true, 1), role };
    let err = ThresholdCore::new(config).err();
    assert_eq!(
        err,
        Some(ConfigError::RoleMismatch { expected: CoreRole::Threshold, actual: CoreRole::Weight })
    );
}

#[test]
fn test_info_reported_at_start() {
    let mut core = build(threshold_cfg(true, true), common(false, 1));
    let messages = core.take_host_messages();
    assert_eq!(
        messages,
        vec![HostMessage::Info { group: 2, num_units: 1, training: false, num_examples: 2 }]
    );
}

#[test]
fn test_test_stage_counts_examples() {
    let mut core = build(threshold_cfg(true, true), common(false, 1));
    core.take_host_messages();

    // 例題 0: 1 tick で判定を満たす
    core.receive(net(false, 8 << NET_SHIFT));
    run(&mut core);
    let out = core.take_outgoing();
    assert_eq!(sent_of(&out, PacketType::Data)[0].value(), crate::types::ACTIV_SAT_MAX);
    let stops = sent_of(&out, PacketType::Stop);
    assert_eq!(stops.len(), 1);
    assert!(stops[0].key.flag());
    assert_eq!(stops[0].key.route(), 3);
    assert_eq!(core.results().examples_tested, 1);

    // 例題 1 イベント 1: 目標 0
    core.receive(net(true, -(8 << NET_SHIFT)));
    run(&mut core);
    assert_eq!(core.state().evt, 1);
    // イベント 2 の 1 tick 目は外れ、2 tick 目で満たす
    core.receive(net(false, -(8 << NET_SHIFT)));
    run(&mut core);
    assert!(!sent_of(&core.take_outgoing(), PacketType::Stop).last().unwrap().key.flag());
    core.receive(net(true, 8 << NET_SHIFT));
    run(&mut core);

    let out = core.take_outgoing();
    let stpn = sent_of(&out, PacketType::NetStop);
    assert_eq!(stpn.len(), 1);
    assert!(stpn[0].key.flag());
    assert_eq!(core.exit_code(), Some(ExitCode::NoError));

    let messages = core.take_host_messages();
    let outputs = messages.iter().filter(|m| matches!(m, HostMessage::Outputs { .. })).count();
    assert_eq!(outputs, 4);
    let expected = TestResults {
        epochs_trained: 0,
        examples_tested: 2,
        ticks_tested: 2 + 4,
        examples_correct: 2,
    };
    assert_eq!(
        messages.last(),
        Some(&HostMessage::Final { group: 2, results: expected, exit: ExitCode::NoError })
    );
}

#[test]
fn test_next_step_net_is_deferred() {
    let mut core = build(threshold_cfg(true, true), common(false, 1));
    core.receive(net(true, 0));
    run(&mut core);
    assert!(core.take_outgoing().is_empty());
    assert_eq!(core.diagnostics().deferred, 1);
}

#[test]
fn test_criterion_chain() {
    // 先頭の出力グループは判定を次へ渡し、STOP を待つ
    let mut first = build(threshold_cfg(true, false), common(false, 1));
    first.receive(net(false, 8 << NET_SHIFT));
    run(&mut first);
    let crit = sent_of(&first.take_outgoing(), PacketType::Criterion);
    assert_eq!(crit.len(), 1);
    assert!(crit[0].key.flag());
    assert_eq!(first.state().tick, 1);
    first.receive(Packet::control(PacketKey::new(7 << 16, PacketType::Stop).with_flag(false)));
    run(&mut first);
    assert_eq!(first.state().tick, 2);

    // 最終グループは自分が満たしていても前段の false を引き継ぐ
    let mut last = build(threshold_cfg(false, true), common(false, 1));
    last.receive(net(false, 8 << NET_SHIFT));
    run(&mut last);
    assert!(sent_of(&last.take_outgoing(), PacketType::Stop).is_empty());
    last.receive(Packet::control(PacketKey::new(8 << 16, PacketType::Criterion).with_flag(false)));
    run(&mut last);
    let stops = sent_of(&last.take_outgoing(), PacketType::Stop);
    assert_eq!(stops.len(), 1);
    assert!(!stops[0].key.flag());
}

#[test]
fn test_backprop_delta() {
    let mut cfg = threshold_cfg(true, true);
    // 0.5 の誤差でも止まるようにする
    cfg.group_criterion = 1 << ERROR_SHIFT;
    let mut core = build(cfg, common(true, 1));
    core.receive(net(false, 0));
    run(&mut core);
    assert_eq!(core.state().phase, Phase::Backprop);

    // (0.5 − 1) × 0.25 = −0.125
    let out = core.take_outgoing();
    let deltas: Vec<_> = out.iter().filter(|p| p.key.phase() == Phase::Backprop).collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].key.route(), 2);
    let expected = -(1 << (DELTA_SHIFT - 3));
    assert!((deltas[0].value() - expected).abs() < 1 << 8, "delta = {}", deltas[0].value());

    // 誤差が揃うと tick 1 を終えて次の例題へ
    let err =
        PacketKey::new(6 << 16, PacketType::Data).with_phase(Phase::Backprop).with_colour(true);
    core.receive(Packet::new(err, 0));
    run(&mut core);
    assert_eq!(core.state().phase, Phase::Forward);
    assert_eq!(core.state().example_inx, 1);
    assert!(core.exit_code().is_none());
}

#[test]
fn test_deadlock_recovery_then_abort() {
    let mut c = common(false, 1);
    c.stage.deadlock_recovery = true;
    c.stage.watchdog_timeout = 2;
    let mut core = build(threshold_cfg(true, true), c);
    core.take_host_messages();

    for _ in 0..20 {
        core.timer_tick();
    }
    let dlrv = sent_of(&core.take_outgoing(), PacketType::DeadlockRecovery);
    assert_eq!(dlrv.len(), DLRV_MAX_CNT as usize + 1);
    assert!(dlrv[..DLRV_MAX_CNT as usize].iter().all(|p| !p.key.flag()));
    assert!(dlrv.last().unwrap().key.flag());
    assert_eq!(core.diagnostics().recoveries, DLRV_MAX_CNT as u64);
    assert_eq!(core.exit_code(), Some(ExitCode::Timeout));
    assert!(matches!(
        core.take_host_messages().last(),
        Some(HostMessage::Final { exit: ExitCode::Timeout, .. })
    ));
}

#[test]
fn test_restart_accepts_new_colour() {
    let mut c = common(false, 1);
    c.stage.deadlock_recovery = true;
    let mut core = build(threshold_cfg(false, false), c);
    // 再実行後の出力はパリティが反転する
    core.receive(Packet::control(PacketKey::new(DLRV_KEY, PacketType::DeadlockRecovery)));
    core.receive(net(true, 0));
    run(&mut core);
    let out = core.take_outgoing();
    assert_eq!(out.len(), 1);
    assert!(out[0].key.colour());
}

#[test]
fn test_queue_full_ends_stage() {
    let mut core = build(threshold_cfg(true, true), common(false, 1));
    // 処理を走らせずに容量を超えて積む
    for _ in 0..capacity::THRESHOLD + 1 {
        core.receive(net(false, 0));
    }
    assert_eq!(core.exit_code(), Some(ExitCode::QueueFull));
    assert!(!core.run_pending());
}
