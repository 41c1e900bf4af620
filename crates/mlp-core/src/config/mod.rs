//! コア設定
//!
//! ステージ開始時に一度だけ読み込まれ、ステージ中は変更されない。
//! スコアボードの目標数やパイプライン構成はすべてここから決まる。
//!
//! - [`NetworkConfig`] / [`StageConfig`] / [`ExampleSet`]: 全コア共通
//! - [`WeightConfig`] / [`SumConfig`] / [`InputConfig`] / [`ThresholdConfig`]: 役割別

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::ConfigError;
use crate::packet::MAX_UNITS;
use crate::types::{
    Activation, CoreRole, ErrorFunction, ErrorValue, FPREAL_SHIFT, FpReal, InputStage, Net,
    NetType, OutputStage, SMALL_VAL, ShortFpReal, StopCriterion, UpdateRule, Weight,
};

/// デッドロック回復の最大連続試行回数
pub const DLRV_MAX_CNT: u32 = 3;
/// FORWARD の開始 tick
pub const INIT_TICK: u32 = 1;
/// BACKPROP の終了 tick
pub const END_TICK: u32 = 1;

/// ネットワーク全体の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub net_type: NetType,
    /// 単位時間あたりの tick 数
    pub ticks_per_int: u32,
    /// 例題 1 つあたりの tick 上限 + 1（履歴配列の長さ）
    pub global_max_ticks: u32,
}

/// ステージ（学習またはテスト 1 回分）の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub training: bool,
    pub num_epochs: u32,
    /// 1 エポックあたりの例題数
    pub num_examples: u32,
    pub update: UpdateRule,
    /// 最終出力グループがデッドロック回復を主導する
    pub deadlock_recovery: bool,
    /// ウォッチドッグのタイマ tick 数（0 で無効）
    pub watchdog_timeout: u32,
    /// プロトコル違反を致命的エラーとして扱う
    pub strict: bool,
}

/// イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 最大時間（[`crate::types::FP_NAN`] なら例題セットの値を使う）
    pub max_time: FpReal,
    pub min_time: FpReal,
    /// 入力・目標配列の行番号
    pub it_idx: u32,
}

/// 例題
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    pub num_events: u32,
    /// 先頭イベントの番号
    pub ev_idx: u32,
}

/// 例題セット
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleSet {
    pub max_time: FpReal,
    pub min_time: FpReal,
    pub examples: Vec<Example>,
    pub events: Vec<Event>,
}

impl ExampleSet {
    /// イベント `event` の (最小 tick 数, 最大 tick 数)
    pub fn event_ticks(&self, event: usize, ticks_per_int: u32) -> (u32, u32) {
        let ev = &self.events[event];
        let max = if ev.max_time != crate::types::FP_NAN { ev.max_time } else { self.max_time };
        let min = if ev.min_time != crate::types::FP_NAN { ev.min_time } else { self.min_time };
        (time_to_ticks(min, ticks_per_int), time_to_ticks(max, ticks_per_int))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.examples.is_empty() {
            return Err(ConfigError::Zero { what: "num_examples" });
        }
        for ex in &self.examples {
            if ex.num_events == 0 {
                return Err(ConfigError::Zero { what: "num_events" });
            }
            let end = ex.ev_idx as usize + ex.num_events as usize;
            if end > self.events.len() {
                return Err(ConfigError::TooLarge {
                    what: "event index",
                    value: end,
                    limit: self.events.len(),
                });
            }
        }
        Ok(())
    }
}

/// 実数時間を tick 数へ（四捨五入）
pub fn time_to_ticks(time: FpReal, ticks_per_int: u32) -> u32 {
    let t = ((time as i64 + SMALL_VAL as i64) * ticks_per_int as i64 + (1 << (FPREAL_SHIFT - 1)))
        >> FPREAL_SHIFT;
    t.clamp(0, u32::MAX as i64) as u32
}

/// 全コア共通の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonConfig {
    pub net: NetworkConfig,
    pub stage: StageConfig,
    pub examples: ExampleSet,
}

impl CommonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net.global_max_ticks < 2 {
            return Err(ConfigError::Zero { what: "global_max_ticks - 1" });
        }
        if self.stage.num_examples == 0 {
            return Err(ConfigError::Zero { what: "stage.num_examples" });
        }
        self.examples.validate()
    }
}

/// Weight コア設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightConfig {
    /// 行 = 送信元グループのユニット
    pub num_rows: usize,
    /// 列 = 送信先グループのユニット
    pub num_cols: usize,
    pub learning_rate: ShortFpReal,
    pub momentum: ShortFpReal,
    pub weight_decay: ShortFpReal,
    /// 連続時間ネットの Δt（s15.16）
    pub delta_dt: FpReal,
    /// 送信元グループの初期出力
    pub init_output: Activation,
    /// 行優先の重み（0 は結合なし）
    pub weights: Vec<Weight>,
    /// ネット部分和（→ 送信先 Sum）
    pub fwd_key: u32,
    /// 誤差部分積（→ 送信元 Sum）
    pub bkp_key: u32,
    /// link delta 部分和（→ 送信先 Sum）
    pub lds_key: u32,
}

impl WeightConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_units("num_rows", self.num_rows)?;
        check_units("num_cols", self.num_cols)?;
        check_len("weights", self.num_rows * self.num_cols, self.weights.len())
    }
}

/// Sum コア設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SumConfig {
    pub num_units: usize,
    /// FORWARD でユニットごとに届く部分和の数
    pub fwd_expected: u32,
    /// BACKPROP でユニットごとに届く部分積の数
    pub bkp_expected: u32,
    /// link delta 和として届くパケット数（部分和 + 他グループの合計）
    pub lds_expected: u32,
    /// link delta 和の集約担当
    pub is_first_group: bool,
    pub fwd_key: u32,
    pub bkp_key: u32,
    /// LDS 合計（→ 集約 Sum）または最終結果（→ 全 Weight）
    pub lds_key: u32,
}

impl SumConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_units("num_units", self.num_units)?;
        if self.fwd_expected == 0 {
            return Err(ConfigError::Zero { what: "fwd_expected" });
        }
        if self.bkp_expected == 0 {
            return Err(ConfigError::Zero { what: "bkp_expected" });
        }
        Ok(())
    }
}

/// Input コア設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    pub num_units: usize,
    pub stages: SmallVec<[InputStage; 2]>,
    pub in_integr_dt: FpReal,
    pub soft_clamp_strength: FpReal,
    pub init_output: Activation,
    /// 積分器の初期ネット入力
    pub init_net: Net,
    /// 入力値（イベント行 × ユニット、未指定は NaN）
    pub inputs: Vec<Activation>,
    pub fwd_key: u32,
    pub bkp_key: u32,
}

impl InputConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_units("num_units", self.num_units)?;
        check_rows("inputs", self.num_units, self.inputs.len())
    }
}

/// Threshold コア設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub num_units: usize,
    pub output_grp: bool,
    pub input_grp: bool,
    pub is_first_output_group: bool,
    pub is_last_output_group: bool,
    pub stages: SmallVec<[OutputStage; 5]>,
    pub out_integr_dt: FpReal,
    pub weak_clamp_strength: FpReal,
    pub init_output: Activation,
    pub group_criterion: ErrorValue,
    pub criterion: StopCriterion,
    pub error_function: ErrorFunction,
    /// ホストへ出力を報告する
    pub write_out: bool,
    /// 例題の最終 tick だけ報告する
    pub last_tick_only: bool,
    pub inputs: Vec<Activation>,
    pub targets: Vec<Activation>,
    /// 出力（→ 送信元 Weight 群）
    pub fwd_key: u32,
    /// デルタ（→ 同グループ Input）
    pub bkp_key: u32,
    /// 停止判定（→ 次の出力グループ、最終グループは全コアへ）
    pub stop_key: u32,
    /// ネットワーク停止判定（最終出力グループのみ使用）
    pub stpn_key: u32,
    /// デッドロック回復（最終出力グループのみ使用）
    pub dlrv_key: u32,
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_units("num_units", self.num_units)?;
        if let Some(pos) = self.stages.iter().position(|&s| s == OutputStage::Logistic)
            && pos != 0
        {
            return Err(ConfigError::LogisticNotFirst);
        }
        if self.stages.iter().filter(|&&s| s == OutputStage::Logistic).count() > 1 {
            return Err(ConfigError::LogisticNotFirst);
        }
        check_rows("inputs", self.num_units, self.inputs.len())?;
        check_rows("targets", self.num_units, self.targets.len())
    }
}

/// 役割別設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleConfig {
    Weight(WeightConfig),
    Sum(SumConfig),
    Input(InputConfig),
    Threshold(ThresholdConfig),
}

impl RoleConfig {
    pub fn role(&self) -> CoreRole {
        match self {
            RoleConfig::Weight(_) => CoreRole::Weight,
            RoleConfig::Sum(_) => CoreRole::Sum,
            RoleConfig::Input(_) => CoreRole::Input,
            RoleConfig::Threshold(_) => CoreRole::Threshold,
        }
    }
}

/// 1 コア分の設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// ログ用の名前（例: `w[input->hidden]`）
    pub label: String,
    /// 所属グループ番号（Weight は送信先グループ）
    pub group: usize,
    pub common: CommonConfig,
    pub role: RoleConfig,
}

fn check_units(what: &'static str, n: usize) -> Result<(), ConfigError> {
    if n == 0 {
        Err(ConfigError::Zero { what })
    } else if n > MAX_UNITS {
        Err(ConfigError::TooLarge { what, value: n, limit: MAX_UNITS })
    } else {
        Ok(())
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), ConfigError> {
    if expected == actual { Ok(()) } else { Err(ConfigError::Length { what, expected, actual }) }
}

/// 行 × ユニットの配列（空は「使わない」）
fn check_rows(what: &'static str, num_units: usize, len: usize) -> Result<(), ConfigError> {
    if len % num_units == 0 {
        Ok(())
    } else {
        Err(ConfigError::Length { what, expected: len.next_multiple_of(num_units), actual: len })
    }
}
