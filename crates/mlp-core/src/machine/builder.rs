//! ネットワーク記述（TOML）からコア配置・経路・設定を組み立てる
//!
//! グループ 0 にはバイアスグループ（1 ユニット、出力は常に 1）が自動で入り、
//! `bias = true` の非入力グループすべてへ結合される。
//!
//! 重み行列は全グループ対 (x → g) の Weight コアを持つ。結合のない対は重みがすべて 0 で、
//! 0 の重みは学習で変化しない。
//!
//! グループ g のコア番号は `g * (G + 3)` から
//! `W(0→g) .. W(G-1→g), S(g), I(g), T(g)` の順に並ぶ。

use std::collections::{BTreeMap, HashMap};

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{DeliveryOrder, DropRule, Fabric, Machine, Placement, RoutingTable, create_core};
use crate::config::{
    CommonConfig, CoreConfig, Event, Example, ExampleSet, InputConfig, NetworkConfig, RoleConfig,
    StageConfig, SumConfig, ThresholdConfig, WeightConfig,
};
use crate::error::ConfigError;
use crate::packet::MAX_UNITS;
use crate::types::{
    ACTIV_ONE, Activation, ERROR_SHIFT, ErrorFunction, ErrorValue, FP_NAN, FpReal, InputStage, Net,
    NET_SHIFT, NetType, OutputStage, SHORT_FPREAL_SHIFT, StopCriterion, UpdateRule, WEIGHT_MAX,
    WEIGHT_MIN, WEIGHT_NEG_EPSILON, WEIGHT_POS_EPSILON, WEIGHT_SHIFT, Weight, activation_from_f64,
    fpreal_from_f64, from_fixed, to_fixed,
};

const BIAS_GROUP: &str = "bias";

/// ネットワーク全体のパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkParams {
    pub net_type: NetType,
    pub ticks_per_interval: u32,
    /// 例題 1 つあたりの tick 上限 + 1（省略時は例題セットから計算）
    pub max_ticks: Option<u32>,
    /// 重み初期化の乱数シード
    pub seed: u64,
    /// 初期重みの範囲 [-range, range]
    pub weight_range: f64,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub update: UpdateRule,
    pub criterion: StopCriterion,
    pub group_criterion: f64,
    pub error_function: ErrorFunction,
    pub deadlock_recovery: bool,
    pub watchdog_timeout: u32,
    pub strict: bool,
    pub write_out: bool,
    pub last_tick_only: bool,
}

impl Default for NetworkParams {
    fn default() -> Self {
        NetworkParams {
            net_type: NetType::FeedForward,
            ticks_per_interval: 1,
            max_ticks: None,
            seed: 0,
            weight_range: 1.0,
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
            update: UpdateRule::DougsMomentum,
            criterion: StopCriterion::Standard,
            group_criterion: 0.1,
            error_function: ErrorFunction::CrossEntropy,
            deadlock_recovery: false,
            watchdog_timeout: 100,
            strict: cfg!(debug_assertions),
            write_out: true,
            last_tick_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Input,
    #[default]
    Hidden,
    Output,
}

/// グループ記述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDesc {
    pub name: String,
    pub units: usize,
    #[serde(default)]
    pub kind: GroupKind,
    /// 出力段（省略時は入力グループ `[hard_clamp]`、それ以外 `[logistic]`）
    #[serde(default)]
    pub output_stages: Option<Vec<OutputStage>>,
    #[serde(default)]
    pub input_stages: Vec<InputStage>,
    /// 初期出力（省略時は入力グループ 0、それ以外 0.5）
    #[serde(default)]
    pub init_output: Option<f64>,
    #[serde(default)]
    pub init_net: f64,
    /// 積分器の Δt（省略時は 1 / ticks_per_interval）
    #[serde(default)]
    pub integration_dt: Option<f64>,
    #[serde(default = "default_clamp_strength")]
    pub soft_clamp_strength: f64,
    #[serde(default = "default_clamp_strength")]
    pub weak_clamp_strength: f64,
    /// バイアスグループから結合する（入力グループでは無視）
    #[serde(default = "default_true")]
    pub bias: bool,
    #[serde(default)]
    pub criterion: Option<StopCriterion>,
    #[serde(default)]
    pub group_criterion: Option<f64>,
    #[serde(default)]
    pub error_function: Option<ErrorFunction>,
}

fn default_clamp_strength() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

/// 結合記述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkDesc {
    pub from: String,
    pub to: String,
    /// 行優先の初期重み（省略時は乱数）
    #[serde(default)]
    pub weights: Option<Vec<f64>>,
    /// 乱数初期化の範囲（省略時は network.weight_range）
    #[serde(default)]
    pub range: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventDesc {
    #[serde(default)]
    pub max_time: Option<f64>,
    #[serde(default)]
    pub min_time: Option<f64>,
    /// グループ名 → 入力値（nan は入力なし）
    #[serde(default)]
    pub inputs: BTreeMap<String, Vec<f64>>,
    /// グループ名 → 目標値（nan は目標なし）
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExampleDesc {
    #[serde(default)]
    pub name: Option<String>,
    pub events: Vec<EventDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExampleSetDesc {
    #[serde(default = "default_max_time")]
    pub max_time: f64,
    #[serde(default)]
    pub min_time: f64,
    #[serde(rename = "example")]
    pub examples: Vec<ExampleDesc>,
}

fn default_max_time() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Train,
    Test,
}

/// ステージ記述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDesc {
    pub kind: StageKind,
    /// 学習エポック数（テストは常に 1）
    #[serde(default)]
    pub epochs: Option<u32>,
    /// 1 エポックあたりの例題数（省略時は例題セットの全例題）
    #[serde(default)]
    pub examples: Option<u32>,
}

impl StageDesc {
    pub fn train(epochs: u32) -> StageDesc {
        StageDesc { kind: StageKind::Train, epochs: Some(epochs), examples: None }
    }

    pub fn test() -> StageDesc {
        StageDesc { kind: StageKind::Test, epochs: None, examples: None }
    }
}

/// ネットワーク記述ファイルの全体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDescription {
    #[serde(default)]
    pub network: NetworkParams,
    pub groups: Vec<GroupDesc>,
    #[serde(default)]
    pub links: Vec<LinkDesc>,
    pub examples: ExampleSetDesc,
    #[serde(default)]
    pub stages: Vec<StageDesc>,
}

impl NetworkDescription {
    pub fn from_toml_str(s: &str) -> Result<NetworkDescription, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// マシン生成時の実行オプション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineOptions {
    pub order: DeliveryOrder,
    pub drop: Option<DropRule>,
    pub max_idle_rounds: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanKind {
    Bias,
    Input,
    Hidden,
    Output,
}

/// 固定小数点へ変換済みのグループ設定
#[derive(Debug, Clone)]
struct GroupPlan {
    name: String,
    units: usize,
    kind: PlanKind,
    input_stages: SmallVec<[InputStage; 2]>,
    output_stages: SmallVec<[OutputStage; 5]>,
    init_output: Activation,
    init_net: Net,
    integr_dt: FpReal,
    soft_clamp_strength: FpReal,
    weak_clamp_strength: FpReal,
    criterion: StopCriterion,
    group_criterion: ErrorValue,
    error_function: ErrorFunction,
    /// イベント行 × ユニット
    inputs: Vec<Activation>,
    targets: Vec<Activation>,
}

impl GroupPlan {
    fn bias() -> GroupPlan {
        GroupPlan {
            name: BIAS_GROUP.to_string(),
            units: 1,
            kind: PlanKind::Bias,
            input_stages: SmallVec::new(),
            output_stages: SmallVec::from_slice(&[OutputStage::Bias]),
            init_output: ACTIV_ONE,
            init_net: 0,
            integr_dt: 0,
            soft_clamp_strength: 0,
            weak_clamp_strength: 0,
            criterion: StopCriterion::None,
            group_criterion: 0,
            error_function: ErrorFunction::None,
            inputs: Vec::new(),
            targets: Vec::new(),
        }
    }

    fn from_desc(desc: &GroupDesc, params: &NetworkParams) -> Result<GroupPlan, ConfigError> {
        if desc.units == 0 {
            return Err(ConfigError::Zero { what: "group units" });
        }
        if desc.units > MAX_UNITS {
            return Err(ConfigError::TooLarge {
                what: "group units",
                value: desc.units,
                limit: MAX_UNITS,
            });
        }
        let kind = match desc.kind {
            GroupKind::Input => PlanKind::Input,
            GroupKind::Hidden => PlanKind::Hidden,
            GroupKind::Output => PlanKind::Output,
        };
        let output_stages = match &desc.output_stages {
            Some(stages) => SmallVec::from_slice(stages),
            None if kind == PlanKind::Input => SmallVec::from_slice(&[OutputStage::HardClamp]),
            None => SmallVec::from_slice(&[OutputStage::Logistic]),
        };
        let default_output = if kind == PlanKind::Input { 0.0 } else { 0.5 };
        let init_output = desc.init_output.unwrap_or(default_output);
        let dt = desc.integration_dt.unwrap_or(1.0 / params.ticks_per_interval as f64);
        Ok(GroupPlan {
            name: desc.name.clone(),
            units: desc.units,
            kind,
            input_stages: SmallVec::from_slice(&desc.input_stages),
            output_stages,
            init_output: activation_from_f64(init_output),
            init_net: to_fixed(desc.init_net, NET_SHIFT),
            integr_dt: fpreal_from_f64(dt),
            soft_clamp_strength: fpreal_from_f64(desc.soft_clamp_strength),
            weak_clamp_strength: fpreal_from_f64(desc.weak_clamp_strength),
            criterion: desc.criterion.unwrap_or(params.criterion),
            group_criterion: to_fixed(
                desc.group_criterion.unwrap_or(params.group_criterion),
                ERROR_SHIFT,
            ),
            error_function: desc.error_function.unwrap_or(params.error_function),
            inputs: Vec::new(),
            targets: Vec::new(),
        })
    }

    fn is_output(&self) -> bool {
        self.kind == PlanKind::Output
    }
}

/// 組み立て済みのネットワーク
///
/// ステージごとに [`Network::build_machine`] でマシンを作り、
/// 学習後は [`Network::absorb_weights`] で重みを次のステージへ引き継ぐ。
#[derive(Debug, Clone)]
pub struct Network {
    params: NetworkParams,
    groups: Vec<GroupPlan>,
    examples: ExampleSet,
    stages: Vec<StageDesc>,
    global_max_ticks: u32,
    /// `from * G + to` の重みブロック（行優先）
    weights: Vec<Vec<Weight>>,
}

impl Network {
    pub fn from_toml_str(s: &str) -> Result<Network, ConfigError> {
        Network::new(NetworkDescription::from_toml_str(s)?)
    }

    pub fn new(desc: NetworkDescription) -> Result<Network, ConfigError> {
        let params = desc.network;
        if params.ticks_per_interval == 0 {
            return Err(ConfigError::Zero { what: "ticks_per_interval" });
        }
        if !(params.weight_range.is_finite() && params.weight_range >= 0.0) {
            return Err(ConfigError::Invalid(format!("weight_range {}", params.weight_range)));
        }

        let mut groups = vec![GroupPlan::bias()];
        let mut index = HashMap::new();
        index.insert(BIAS_GROUP.to_string(), 0);
        for g in &desc.groups {
            if index.insert(g.name.clone(), groups.len()).is_some() {
                return Err(ConfigError::Invalid(format!("duplicate group name `{}`", g.name)));
            }
            groups.push(GroupPlan::from_desc(g, &params)?);
        }
        if !groups.iter().any(GroupPlan::is_output) {
            return Err(ConfigError::Invalid("network has no output group".to_string()));
        }

        let examples = build_examples(&desc.examples, &mut groups, &index)?;
        let global_max_ticks = match params.max_ticks {
            Some(t) => t,
            None => longest_example(&examples, params.ticks_per_interval) + 1,
        };

        let n = groups.len();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(params.seed);
        let mut weights: Vec<Vec<Weight>> =
            (0..n * n).map(|b| vec![0; groups[b / n].units * groups[b % n].units]).collect();

        let mut links: Vec<(usize, usize, Option<&[f64]>, f64)> = Vec::new();
        for (g, group) in desc.groups.iter().enumerate() {
            if group.bias && group.kind != GroupKind::Input {
                links.push((0, g + 1, None, params.weight_range));
            }
        }
        for link in &desc.links {
            let from = *index
                .get(&link.from)
                .ok_or_else(|| ConfigError::UnknownGroup(link.from.clone()))?;
            let to =
                *index.get(&link.to).ok_or_else(|| ConfigError::UnknownGroup(link.to.clone()))?;
            if to == 0 {
                return Err(ConfigError::Invalid("the bias group cannot receive links".to_string()));
            }
            let range = link.range.unwrap_or(params.weight_range);
            links.push((from, to, link.weights.as_deref(), range));
        }
        for (from, to, explicit, range) in links {
            let block = &mut weights[from * n + to];
            match explicit {
                Some(values) => {
                    if values.len() != block.len() {
                        return Err(ConfigError::Length {
                            what: "link weights",
                            expected: block.len(),
                            actual: values.len(),
                        });
                    }
                    for (w, &v) in block.iter_mut().zip(values) {
                        *w = initial_weight(v);
                    }
                }
                None => {
                    for w in block.iter_mut() {
                        *w = initial_weight(rng.random_range(-range..=range));
                    }
                }
            }
            log::debug!("network: link {} -> {}", groups[from].name, groups[to].name);
        }

        let stages = if desc.stages.is_empty() { vec![StageDesc::test()] } else { desc.stages };
        log::info!(
            "network: {} groups (+bias), {} examples, {} ticks max, {} stages",
            n - 1,
            examples.examples.len(),
            global_max_ticks,
            stages.len()
        );
        Ok(Network { params, groups, examples, stages, global_max_ticks, weights })
    }

    pub fn stages(&self) -> &[StageDesc] {
        &self.stages
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// バイアスグループを含むグループ数
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.name == name)
    }

    pub fn group_name(&self, group: usize) -> Option<&str> {
        self.groups.get(group).map(|g| g.name.as_str())
    }

    pub fn global_max_ticks(&self) -> u32 {
        self.global_max_ticks
    }

    pub fn examples(&self) -> &ExampleSet {
        &self.examples
    }

    /// `from → to` の重み（行優先）
    pub fn weights(&self, from: &str, to: &str) -> Option<&[Weight]> {
        let n = self.groups.len();
        let (f, t) = (self.group_index(from)?, self.group_index(to)?);
        Some(&self.weights[f * n + t])
    }

    /// 結合のある重みブロック（送信元名, 送信先名, 行優先の重み）
    pub fn linked_blocks(&self) -> impl Iterator<Item = (&str, &str, &[Weight])> + '_ {
        let n = self.groups.len();
        self.weights.iter().enumerate().filter(|(_, w)| w.iter().any(|&v| v != 0)).map(
            move |(b, w)| {
                (self.groups[b / n].name.as_str(), self.groups[b % n].name.as_str(), w.as_slice())
            },
        )
    }

    /// `from → to` の重みを実数で
    pub fn weights_f64(&self, from: &str, to: &str) -> Option<Vec<f64>> {
        self.weights(from, to)
            .map(|w| w.iter().map(|&v| from_fixed(v as i64, WEIGHT_SHIFT)).collect())
    }

    fn common(&self, stage: &StageDesc) -> Result<CommonConfig, ConfigError> {
        let training = stage.kind == StageKind::Train;
        let num_epochs = if training { stage.epochs.unwrap_or(1) } else { 1 };
        if num_epochs == 0 {
            return Err(ConfigError::Zero { what: "stage epochs" });
        }
        let num_examples = stage.examples.unwrap_or(self.examples.examples.len() as u32);
        let common = CommonConfig {
            net: NetworkConfig {
                net_type: self.params.net_type,
                ticks_per_int: self.params.ticks_per_interval,
                global_max_ticks: self.global_max_ticks,
            },
            stage: StageConfig {
                training,
                num_epochs,
                num_examples,
                update: self.params.update,
                deadlock_recovery: self.params.deadlock_recovery,
                watchdog_timeout: self.params.watchdog_timeout,
                strict: self.params.strict,
            },
            examples: self.examples.clone(),
        };
        common.validate()?;
        Ok(common)
    }

    /// ステージ 1 回分のコア設定・配置・経路表
    pub fn core_configs(
        &self,
        stage: &StageDesc,
    ) -> Result<(Vec<CoreConfig>, Vec<Placement>, RoutingTable), ConfigError> {
        let common = self.common(stage)?;
        let n = self.groups.len();
        let stride = n + 3;
        let w_core = |x: usize, g: usize| g * stride + x;
        let s_core = |g: usize| g * stride + n;
        let i_core = |g: usize| g * stride + n + 1;
        let t_core = |g: usize| g * stride + n + 2;
        let total = n * stride;

        let outputs: Vec<usize> = (0..n).filter(|&g| self.groups[g].is_output()).collect();
        let (first_output, last_output) = match (outputs.first(), outputs.last()) {
            (Some(&f), Some(&l)) => (f, l),
            _ => return Err(ConfigError::Invalid("network has no output group".to_string())),
        };

        let learning_rate = to_fixed(self.params.learning_rate, SHORT_FPREAL_SHIFT);
        let momentum = to_fixed(self.params.momentum, SHORT_FPREAL_SHIFT);
        let weight_decay = to_fixed(self.params.weight_decay, SHORT_FPREAL_SHIFT);
        let delta_dt = fpreal_from_f64(1.0 / self.params.ticks_per_interval as f64);

        let mut routes = RoutingTable::new();
        let mut configs = Vec::with_capacity(total);
        let mut placements = Vec::with_capacity(total);
        let mut push = |config: CoreConfig, block: Option<(usize, usize)>| {
            let mut placement = Placement::of(&config);
            placement.block = block;
            placements.push(placement);
            configs.push(config);
        };

        for g in 0..n {
            let plan = &self.groups[g];

            for x in 0..n {
                let src = &self.groups[x];
                let fwd_key = routes.allocate()?;
                routes.add(fwd_key, s_core(g));
                let bkp_key = routes.allocate()?;
                routes.add(bkp_key, s_core(x));
                let lds_key = routes.allocate()?;
                routes.add(lds_key, s_core(g));
                let cfg = WeightConfig {
                    num_rows: src.units,
                    num_cols: plan.units,
                    learning_rate,
                    momentum,
                    weight_decay,
                    delta_dt,
                    init_output: src.init_output,
                    weights: self.weights[x * n + g].clone(),
                    fwd_key,
                    bkp_key,
                    lds_key,
                };
                let label = format!("w[{}->{}]", src.name, plan.name);
                let role = RoleConfig::Weight(cfg);
                push(CoreConfig { label, group: g, common: common.clone(), role }, Some((x, g)));
            }

            let fwd_key = routes.allocate()?;
            routes.add(fwd_key, i_core(g));
            let bkp_key = routes.allocate()?;
            routes.add(bkp_key, t_core(g));
            let lds_key = routes.allocate()?;
            if g == 0 {
                for (to, from) in (0..n).flat_map(|to| (0..n).map(move |from| (to, from))) {
                    routes.add(lds_key, w_core(from, to));
                }
            } else {
                routes.add(lds_key, s_core(0));
            }
            let cfg = SumConfig {
                num_units: plan.units,
                fwd_expected: n as u32,
                bkp_expected: n as u32,
                lds_expected: if g == 0 { 2 * n as u32 - 1 } else { n as u32 },
                is_first_group: g == 0,
                fwd_key,
                bkp_key,
                lds_key,
            };
            let label = format!("s[{}]", plan.name);
            let role = RoleConfig::Sum(cfg);
            push(CoreConfig { label, group: g, common: common.clone(), role }, None);

            let fwd_key = routes.allocate()?;
            routes.add(fwd_key, t_core(g));
            let bkp_key = routes.allocate()?;
            for x in 0..n {
                routes.add(bkp_key, w_core(x, g));
            }
            let soft_clamped = plan.input_stages.contains(&InputStage::SoftClamp);
            let cfg = InputConfig {
                num_units: plan.units,
                stages: plan.input_stages.clone(),
                in_integr_dt: plan.integr_dt,
                soft_clamp_strength: plan.soft_clamp_strength,
                init_output: plan.init_output,
                init_net: plan.init_net,
                inputs: if soft_clamped { plan.inputs.clone() } else { Vec::new() },
                fwd_key,
                bkp_key,
            };
            let label = format!("i[{}]", plan.name);
            let role = RoleConfig::Input(cfg);
            push(CoreConfig { label, group: g, common: common.clone(), role }, None);

            let fwd_key = routes.allocate()?;
            for y in 0..n {
                routes.add(fwd_key, w_core(g, y));
            }
            let bkp_key = routes.allocate()?;
            routes.add(bkp_key, i_core(g));
            let is_last = g == last_output;
            let broadcast = |routes: &mut RoutingTable| -> Result<u32, ConfigError> {
                let key = routes.allocate()?;
                for c in (0..total).filter(|&c| c != t_core(g)) {
                    routes.add(key, c);
                }
                Ok(key)
            };
            let stop_key = if is_last {
                broadcast(&mut routes)?
            } else if plan.is_output() {
                let key = routes.allocate()?;
                if let Some(&next) = outputs.iter().find(|&&o| o > g) {
                    routes.add(key, t_core(next));
                }
                key
            } else {
                0
            };
            let (stpn_key, dlrv_key) = if is_last {
                (broadcast(&mut routes)?, broadcast(&mut routes)?)
            } else {
                (0, 0)
            };
            let cfg = ThresholdConfig {
                num_units: plan.units,
                output_grp: plan.is_output(),
                input_grp: plan.kind == PlanKind::Input,
                is_first_output_group: g == first_output,
                is_last_output_group: is_last,
                stages: plan.output_stages.clone(),
                out_integr_dt: plan.integr_dt,
                weak_clamp_strength: plan.weak_clamp_strength,
                init_output: plan.init_output,
                group_criterion: plan.group_criterion,
                criterion: plan.criterion,
                error_function: plan.error_function,
                write_out: self.params.write_out,
                last_tick_only: self.params.last_tick_only,
                inputs: plan.inputs.clone(),
                targets: plan.targets.clone(),
                fwd_key,
                bkp_key,
                stop_key,
                stpn_key,
                dlrv_key,
            };
            let label = format!("t[{}]", plan.name);
            let role = RoleConfig::Threshold(cfg);
            push(CoreConfig { label, group: g, common: common.clone(), role }, None);
        }

        Ok((configs, placements, routes))
    }

    /// ステージ 1 回分のマシンを作る
    pub fn build_machine(
        &self,
        stage: &StageDesc,
        options: &MachineOptions,
    ) -> Result<Machine, ConfigError> {
        let (configs, placements, routes) = self.core_configs(stage)?;
        let cores = configs.into_iter().map(create_core).collect::<Result<Vec<_>, _>>()?;
        let fabric = Fabric::new(routes, options.order).with_drop(options.drop);
        let mut machine = Machine::new(cores, placements, fabric);
        if let Some(rounds) = options.max_idle_rounds {
            machine = machine.with_max_idle_rounds(rounds);
        }
        Ok(machine)
    }

    /// 実行後のマシンから重みを取り込む
    pub fn absorb_weights(&mut self, machine: &Machine) {
        let n = self.groups.len();
        let placements = machine.placements();
        for (core, block) in machine.weight_blocks() {
            if let Some((from, to)) = placements.get(core).and_then(|p| p.block) {
                self.weights[from * n + to].copy_from_slice(block);
            }
        }
    }
}

/// 初期重み。結合ありの重みは 0 にならないようにする
fn initial_weight(v: f64) -> Weight {
    let w = to_fixed(v, WEIGHT_SHIFT).clamp(WEIGHT_MIN, WEIGHT_MAX);
    match w {
        0 if v < 0.0 => WEIGHT_NEG_EPSILON,
        0 => WEIGHT_POS_EPSILON,
        w => w,
    }
}

fn time_or_nan(t: Option<f64>) -> FpReal {
    t.map(fpreal_from_f64).unwrap_or(FP_NAN)
}

/// 例題セットを組み立て、入力・目標をグループへ振り分ける
fn build_examples(
    desc: &ExampleSetDesc,
    groups: &mut [GroupPlan],
    index: &HashMap<String, usize>,
) -> Result<ExampleSet, ConfigError> {
    let mut set = ExampleSet {
        max_time: fpreal_from_f64(desc.max_time),
        min_time: fpreal_from_f64(desc.min_time),
        examples: Vec::with_capacity(desc.examples.len()),
        events: Vec::new(),
    };
    for g in groups.iter_mut() {
        g.inputs.clear();
        g.targets.clear();
    }

    for ex in &desc.examples {
        set.examples.push(Example {
            num_events: ex.events.len() as u32,
            ev_idx: set.events.len() as u32,
        });
        for ev in &ex.events {
            for name in ev.inputs.keys().chain(ev.targets.keys()) {
                if !index.contains_key(name) {
                    return Err(ConfigError::UnknownGroup(name.clone()));
                }
            }
            let row = set.events.len() as u32;
            set.events.push(Event {
                max_time: time_or_nan(ev.max_time),
                min_time: time_or_nan(ev.min_time),
                it_idx: row,
            });
            for g in groups.iter_mut() {
                if g.kind == PlanKind::Bias {
                    continue;
                }
                push_row(&mut g.inputs, ev.inputs.get(&g.name), g.units, "event inputs")?;
                if g.is_output() {
                    push_row(&mut g.targets, ev.targets.get(&g.name), g.units, "event targets")?;
                } else if ev.targets.contains_key(&g.name) {
                    return Err(ConfigError::Invalid(format!(
                        "group `{}` is not an output group",
                        g.name
                    )));
                }
            }
        }
    }
    set.validate()?;
    Ok(set)
}

fn push_row(
    rows: &mut Vec<Activation>,
    values: Option<&Vec<f64>>,
    units: usize,
    what: &'static str,
) -> Result<(), ConfigError> {
    match values {
        Some(values) if values.len() != units => {
            Err(ConfigError::Length { what, expected: units, actual: values.len() })
        }
        Some(values) => {
            rows.extend(values.iter().map(|&v| activation_from_f64(v)));
            Ok(())
        }
        None => {
            rows.extend(std::iter::repeat_n(activation_from_f64(f64::NAN), units));
            Ok(())
        }
    }
}

/// 最も長い例題の tick 数
fn longest_example(set: &ExampleSet, ticks_per_int: u32) -> u32 {
    set.examples
        .iter()
        .map(|ex| {
            (ex.ev_idx..ex.ev_idx + ex.num_events)
                .map(|e| set.event_ticks(e as usize, ticks_per_int).1.max(1))
                .sum::<u32>()
        })
        .max()
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketKey, PacketType};
    use crate::types::{ACTIV_NAN, WEIGHT_ONE};

    const XOR: &str = r#"
[network]
seed = 3
learning_rate = 0.5

[[groups]]
name = "in"
units = 2
kind = "input"

[[groups]]
name = "hidden"
units = 2

[[groups]]
name = "out"
units = 1
kind = "output"

[[links]]
from = "in"
to = "hidden"

[[links]]
from = "hidden"
to = "out"
weights = [0.5, -0.25]

[examples]
[[examples.example]]
events = [{ inputs = { in = [0.0, 1.0] }, targets = { out = [1.0] } }]

[[examples.example]]
events = [{ inputs = { in = [1.0, 1.0] } }]

[[stages]]
kind = "train"
epochs = 10

[[stages]]
kind = "test"
"#;

    #[test]
    fn test_parse_and_weights() {
        let net = Network::from_toml_str(XOR).unwrap();
        assert_eq!(net.num_groups(), 4);
        assert_eq!(net.group_index("bias"), Some(0));
        assert_eq!(net.stages(), &[StageDesc::train(10), StageDesc::test()]);
        // 1 イベント 1 tick の例題 + 1
        assert_eq!(net.global_max_ticks(), 2);

        assert_eq!(net.weights_f64("hidden", "out").unwrap(), vec![0.5, -0.25]);
        // 結合ありは 0 にならない、結合なしは 0
        let in_hidden = net.weights("in", "hidden").unwrap();
        assert!(in_hidden.iter().all(|&w| w != 0 && w.abs() <= WEIGHT_ONE));
        assert!(net.weights("bias", "out").unwrap().iter().all(|&w| w != 0));
        assert!(net.weights("bias", "in").unwrap().iter().all(|&w| w == 0));
        assert!(net.weights("in", "out").unwrap().iter().all(|&w| w == 0));
    }

    #[test]
    fn test_strict_follows_build_profile() {
        let net = Network::from_toml_str(XOR).unwrap();
        assert_eq!(net.params().strict, cfg!(debug_assertions));
        let (configs, _, _) = net.core_configs(&StageDesc::test()).unwrap();
        assert!(configs.iter().all(|c| c.common.stage.strict == cfg!(debug_assertions)));

        let mut desc = NetworkDescription::from_toml_str(XOR).unwrap();
        desc.network.strict = !cfg!(debug_assertions);
        let net = Network::new(desc).unwrap();
        let (configs, _, _) = net.core_configs(&StageDesc::test()).unwrap();
        assert!(configs.iter().all(|c| c.common.stage.strict != cfg!(debug_assertions)));
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = Network::from_toml_str(XOR).unwrap();
        let b = Network::from_toml_str(XOR).unwrap();
        assert_eq!(a.weights("in", "hidden"), b.weights("in", "hidden"));
    }

    #[test]
    fn test_missing_targets_are_nan() {
        let net = Network::from_toml_str(XOR).unwrap();
        let (configs, _, _) = net.core_configs(&StageDesc::test()).unwrap();
        let t_out = configs.iter().find(|c| c.label == "t[out]").unwrap();
        let RoleConfig::Threshold(cfg) = &t_out.role else { panic!("not a threshold core") };
        assert_eq!(cfg.targets, vec![ACTIV_ONE, ACTIV_NAN]);
        assert!(cfg.is_first_output_group && cfg.is_last_output_group);
        assert_eq!(cfg.stages.as_slice(), &[OutputStage::Logistic]);
    }

    #[test]
    fn test_core_layout_and_routes() {
        let net = Network::from_toml_str(XOR).unwrap();
        let (configs, placements, routes) = net.core_configs(&StageDesc::train(1)).unwrap();
        let n = 4;
        assert_eq!(configs.len(), n * (n + 3));
        assert_eq!(placements[n].label, "s[bias]");
        assert_eq!(placements[1].block, Some((1, 0)));

        // in → hidden の Weight は hidden の Sum へ部分和を送る
        let w = &configs[2 * (n + 3) + 1];
        assert_eq!(w.label, "w[in->hidden]");
        let RoleConfig::Weight(cfg) = &w.role else { panic!("not a weight core") };
        let key = PacketKey::new(cfg.fwd_key, PacketType::Data);
        assert_eq!(routes.destinations(key), &[2 * (n + 3) + n]);

        // 最終出力グループの STOP は自分以外の全コアへ
        let t = configs.iter().find(|c| c.label == "t[out]").unwrap();
        let RoleConfig::Threshold(cfg) = &t.role else { panic!("not a threshold core") };
        let key = PacketKey::new(cfg.stop_key, PacketType::Stop);
        assert_eq!(routes.destinations(key).len(), configs.len() - 1);

        let s0 = &configs[n];
        let RoleConfig::Sum(cfg) = &s0.role else { panic!("not a sum core") };
        assert_eq!(cfg.lds_expected, 2 * n as u32 - 1);
        assert!(cfg.is_first_group);
    }

    #[test]
    fn test_unknown_group_rejected() {
        let bad = XOR.replace("to = \"out\"", "to = \"nowhere\"");
        assert_eq!(
            Network::from_toml_str(&bad).err(),
            Some(ConfigError::UnknownGroup("nowhere".into()))
        );
    }

    #[test]
    fn test_input_length_checked() {
        let bad = XOR.replace("in = [0.0, 1.0]", "in = [0.0]");
        assert!(matches!(
            Network::from_toml_str(&bad),
            Err(ConfigError::Length { what: "event inputs", expected: 2, actual: 1 })
        ));
    }
}
