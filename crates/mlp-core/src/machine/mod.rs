//! マシン: コア群とマルチキャストファブリック
//!
//! 各コアを 1 スレッドのイベントループとして逐次に動かす。
//!
//! 1. 全コアの保留処理を実行し、送信パケットを 1 世代分まとめて取り出す
//! 2. 世代を配送順（[`DeliveryOrder`]）に並べ、経路表に従って宛先コアへ渡す。
//!    1 パケット渡すごとに宛先コアの保留処理を走らせる
//! 3. ファブリックが静止したら全コアにタイマ tick を入れる
//!
//! 同じ送信元からのパケットの順序はどの配送順でも保たれる。

mod builder;
mod routing;

pub use builder::{
    EventDesc, ExampleDesc, ExampleSetDesc, GroupDesc, GroupKind, LinkDesc, MachineOptions, Network,
    NetworkDescription, NetworkParams, StageDesc, StageKind,
};
pub use routing::RoutingTable;

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CoreConfig, RoleConfig};
use crate::core::{Core, Diagnostics};
use crate::error::{ConfigError, ExitCode};
use crate::host::HostSink;
use crate::input::InputCore;
use crate::packet::{Packet, PacketType};
use crate::sum::SumCore;
use crate::threshold::ThresholdCore;
use crate::types::{CoreRole, Phase, Weight};
use crate::weight::WeightCore;

/// 静止状態が続いたときに停止とみなすタイマ tick 数の既定値
pub const DEFAULT_MAX_IDLE_ROUNDS: u32 = 1000;

/// 1 世代内の配送順
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrder {
    /// コア番号順、同じコア内は送信順
    #[default]
    Fifo,
    /// 送信元ごとの順序を保ったまま乱数で混ぜる
    Shuffled { seed: u64 },
}

/// 指定したデータパケットを 1 つ落とす（デッドロック回復の試験用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropRule {
    /// 送信元コアの役割
    pub role: CoreRole,
    /// 送信元コアの所属グループ
    pub group: usize,
    pub phase: Phase,
    /// 条件に合うデータパケットの何個目（0 始まり）を落とすか
    pub nth: u64,
}

/// コアの配置情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub label: String,
    pub role: CoreRole,
    pub group: usize,
    /// Weight コアの (送信元グループ, 送信先グループ)
    pub block: Option<(usize, usize)>,
}

impl Placement {
    pub fn of(config: &CoreConfig) -> Placement {
        Placement {
            label: config.label.clone(),
            role: config.role.role(),
            group: config.group,
            block: None,
        }
    }
}

/// 配送記録
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub source: usize,
    pub dest: usize,
    pub packet: Packet,
}

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("host sink: {0}")]
    Io(#[from] std::io::Error),
    #[error("machine stalled: {rounds} idle rounds with {running} cores still running")]
    Stalled { rounds: u32, running: usize },
}

/// マルチキャストファブリック
#[derive(Debug)]
pub struct Fabric {
    routes: RoutingTable,
    order: DeliveryOrder,
    rng: Xoshiro256PlusPlus,
    drop: Option<DropRule>,
    matched: u64,
    delivered: u64,
    dropped: u64,
}

impl Fabric {
    pub fn new(routes: RoutingTable, order: DeliveryOrder) -> Fabric {
        let seed = match order {
            DeliveryOrder::Fifo => 0,
            DeliveryOrder::Shuffled { seed } => seed,
        };
        Fabric {
            routes,
            order,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            drop: None,
            matched: 0,
            delivered: 0,
            dropped: 0,
        }
    }

    pub fn with_drop(mut self, rule: Option<DropRule>) -> Fabric {
        self.drop = rule;
        self
    }

    /// 1 世代分（送信元コアごとの送信列）を (送信元, 宛先, パケット) の列にする
    fn schedule(
        &mut self,
        generation: Vec<Vec<Packet>>,
        placements: &[Placement],
    ) -> Vec<Delivery> {
        let mut sources: Vec<(usize, VecDeque<Packet>)> = generation
            .into_iter()
            .enumerate()
            .filter(|(_, packets)| !packets.is_empty())
            .map(|(i, packets)| (i, packets.into()))
            .collect();

        let mut ordered = Vec::new();
        match self.order {
            DeliveryOrder::Fifo => {
                for (source, packets) in sources {
                    ordered.extend(packets.into_iter().map(|p| (source, p)));
                }
            }
            DeliveryOrder::Shuffled { .. } => {
                while !sources.is_empty() {
                    let k = self.rng.random_range(0..sources.len());
                    let (source, packets) = &mut sources[k];
                    if let Some(p) = packets.pop_front() {
                        ordered.push((*source, p));
                    }
                    if packets.is_empty() {
                        sources.swap_remove(k);
                    }
                }
            }
        }

        let mut deliveries = Vec::with_capacity(ordered.len());
        for (source, packet) in ordered {
            if self.should_drop(&placements[source], packet) {
                self.dropped += 1;
                log::warn!("fabric: dropped {} from {}", packet.key, placements[source].label);
                continue;
            }
            for &dest in self.routes.destinations(packet.key) {
                deliveries.push(Delivery { source, dest, packet });
            }
        }
        self.delivered += deliveries.len() as u64;
        deliveries
    }

    fn should_drop(&mut self, source: &Placement, packet: Packet) -> bool {
        let Some(rule) = self.drop else {
            return false;
        };
        if source.role != rule.role
            || source.group != rule.group
            || packet.key.kind() != Ok(PacketType::Data)
            || packet.key.phase() != rule.phase
        {
            return false;
        }
        let n = self.matched;
        self.matched += 1;
        n == rule.nth
    }
}

/// コアの最終状態
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoreReport {
    pub label: String,
    pub role: CoreRole,
    pub exit: Option<ExitCode>,
    pub diagnostics: Diagnostics,
}

/// 実行結果
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cores: Vec<CoreReport>,
    /// 配送したパケット数（宛先ごとに数える）
    pub delivered: u64,
    pub dropped: u64,
    /// パケットを配送した世代数
    pub rounds: u64,
    /// タイマ tick を入れた回数
    pub timer_ticks: u64,
}

impl RunSummary {
    /// 全コアの終了コード（最初の異常終了を優先）
    pub fn exit_code(&self) -> ExitCode {
        self.cores
            .iter()
            .map(|c| c.exit.unwrap_or(ExitCode::Timeout))
            .find(|&e| e != ExitCode::NoError)
            .unwrap_or(ExitCode::NoError)
    }

    pub fn is_ok(&self) -> bool {
        self.exit_code() == ExitCode::NoError
    }

    pub fn count(&self, exit: ExitCode) -> usize {
        self.cores.iter().filter(|c| c.exit == Some(exit)).count()
    }

    /// 全コアの合計
    pub fn total(&self) -> Diagnostics {
        let mut total = Diagnostics::default();
        for c in &self.cores {
            let d = &c.diagnostics;
            total.received += d.received;
            total.sent += d.sent;
            total.deferred += d.deferred;
            total.violations += d.violations;
            total.weight_updates += d.weight_updates;
            total.recoveries += d.recoveries;
            for (t, n) in total.received_by_type.iter_mut().zip(d.received_by_type) {
                *t += n;
            }
        }
        total
    }
}

/// 設定から役割に応じたコアを作る
pub fn create_core(config: CoreConfig) -> Result<Box<dyn Core>, ConfigError> {
    Ok(match &config.role {
        RoleConfig::Weight(_) => Box::new(WeightCore::new(config)?),
        RoleConfig::Sum(_) => Box::new(SumCore::new(config)?),
        RoleConfig::Input(_) => Box::new(InputCore::new(config)?),
        RoleConfig::Threshold(_) => Box::new(ThresholdCore::new(config)?),
    })
}

pub struct Machine {
    cores: Vec<Box<dyn Core>>,
    placements: Vec<Placement>,
    fabric: Fabric,
    max_idle_rounds: u32,
    trace: Option<Vec<Delivery>>,
}

impl Machine {
    pub fn new(cores: Vec<Box<dyn Core>>, placements: Vec<Placement>, fabric: Fabric) -> Machine {
        Machine { cores, placements, fabric, max_idle_rounds: DEFAULT_MAX_IDLE_ROUNDS, trace: None }
    }

    pub fn with_max_idle_rounds(mut self, rounds: u32) -> Machine {
        self.max_idle_rounds = rounds;
        self
    }

    /// 以降の配送を記録する
    pub fn record_deliveries(&mut self) {
        self.trace.get_or_insert_with(Vec::new);
    }

    pub fn deliveries(&self) -> &[Delivery] {
        self.trace.as_deref().unwrap_or(&[])
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.is_empty()
    }

    /// Weight コアの重み（コア番号と行優先の重み）
    pub fn weight_blocks(&self) -> impl Iterator<Item = (usize, &[Weight])> + '_ {
        self.cores.iter().enumerate().filter_map(|(i, c)| c.weight_block().map(|w| (i, w)))
    }

    /// 全コアが終了するまで動かす
    pub fn run(&mut self, sink: &mut dyn HostSink) -> Result<RunSummary, MachineError> {
        log::info!(
            "machine: starting {} cores, {} routes",
            self.cores.len(),
            self.fabric.routes.len()
        );
        for core in &mut self.cores {
            core.start();
        }

        let mut rounds = 0u64;
        let mut timer_ticks = 0u64;
        let mut idle = 0u32;
        loop {
            for core in &mut self.cores {
                while core.run_pending() {}
            }
            self.flush_host(sink)?;

            let generation: Vec<Vec<Packet>> =
                self.cores.iter_mut().map(|c| c.take_outgoing()).collect();
            if generation.iter().all(Vec::is_empty) {
                let running = self.cores.iter().filter(|c| c.exit_code().is_none()).count();
                if running == 0 {
                    break;
                }
                idle += 1;
                if idle > self.max_idle_rounds {
                    log::error!("machine: stalled with {running} cores running");
                    return Err(MachineError::Stalled { rounds: idle - 1, running });
                }
                for core in &mut self.cores {
                    core.timer_tick();
                }
                timer_ticks += 1;
                continue;
            }

            idle = 0;
            rounds += 1;
            for delivery in self.fabric.schedule(generation, &self.placements) {
                if let Some(trace) = &mut self.trace {
                    trace.push(delivery);
                }
                let core = &mut self.cores[delivery.dest];
                core.receive(delivery.packet);
                while core.run_pending() {}
            }
        }
        self.flush_host(sink)?;

        let summary = RunSummary {
            cores: self
                .cores
                .iter()
                .map(|c| CoreReport {
                    label: c.label().to_string(),
                    role: c.role(),
                    exit: c.exit_code(),
                    diagnostics: c.diagnostics().clone(),
                })
                .collect(),
            delivered: self.fabric.delivered,
            dropped: self.fabric.dropped,
            rounds,
            timer_ticks,
        };
        log::info!(
            "machine: done ({:?}), {} packets in {} rounds, {} timer ticks",
            summary.exit_code(),
            summary.delivered,
            summary.rounds,
            summary.timer_ticks
        );
        Ok(summary)
    }

    fn flush_host(&mut self, sink: &mut dyn HostSink) -> Result<(), MachineError> {
        for core in &mut self.cores {
            for message in core.take_host_messages() {
                sink.deliver(message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKey;

    fn placement(role: CoreRole, group: usize) -> Placement {
        Placement { label: format!("{role:?}{group}"), role, group, block: None }
    }

    fn data(route: u32, unit: usize) -> Packet {
        Packet::new(PacketKey::new(route, PacketType::Data).with_index(unit), unit as u32)
    }

    #[test]
    fn test_shuffled_keeps_source_order() {
        let mut routes = RoutingTable::new();
        let a = routes.allocate().unwrap();
        let b = routes.allocate().unwrap();
        routes.add(a, 2);
        routes.add(b, 2);
        let placements = vec![
            placement(CoreRole::Sum, 0),
            placement(CoreRole::Sum, 1),
            placement(CoreRole::Input, 0),
        ];

        let mut fabric = Fabric::new(routes, DeliveryOrder::Shuffled { seed: 7 });
        let generation = vec![
            (0..5).map(|u| data(a, u)).collect(),
            (0..5).map(|u| data(b, u)).collect(),
            vec![],
        ];
        let deliveries = fabric.schedule(generation, &placements);
        assert_eq!(deliveries.len(), 10);
        for source in 0..2 {
            let units: Vec<_> = deliveries
                .iter()
                .filter(|d| d.source == source)
                .map(|d| d.packet.key.index())
                .collect();
            assert_eq!(units, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_drop_rule_matches_nth() {
        let mut routes = RoutingTable::new();
        let a = routes.allocate().unwrap();
        routes.add(a, 1);
        routes.add(a, 2);
        let placements = vec![
            placement(CoreRole::Sum, 3),
            placement(CoreRole::Input, 3),
            placement(CoreRole::Input, 4),
        ];
        let rule = DropRule { role: CoreRole::Sum, group: 3, phase: Phase::Forward, nth: 1 };
        let mut fabric = Fabric::new(routes, DeliveryOrder::Fifo).with_drop(Some(rule));

        let generation = vec![(0..3).map(|u| data(a, u)).collect(), vec![], vec![]];
        let deliveries = fabric.schedule(generation, &placements);
        // 2 個目だけが両方の宛先から消える
        assert_eq!(deliveries.len(), 4);
        assert!(deliveries.iter().all(|d| d.packet.key.index() != 1));
        assert_eq!(fabric.dropped, 1);
        assert_eq!(fabric.delivered, 4);
    }

    #[test]
    fn test_summary_exit_code() {
        let report = |exit| CoreReport {
            label: "x".into(),
            role: CoreRole::Sum,
            exit,
            diagnostics: Diagnostics::default(),
        };
        let mut summary = RunSummary {
            cores: vec![report(Some(ExitCode::NoError)), report(Some(ExitCode::NoError))],
            delivered: 0,
            dropped: 0,
            rounds: 0,
            timer_ticks: 0,
        };
        assert!(summary.is_ok());
        summary.cores.push(report(Some(ExitCode::Timeout)));
        assert_eq!(summary.exit_code(), ExitCode::Timeout);
        assert_eq!(summary.count(ExitCode::NoError), 2);
    }
}
