//! 列挙型（フェーズ・コア種別・パイプライン段など）
//!
//! 設定ファイルでは snake_case 名で、ワイヤ上・ログ上では数値コードで扱う。

use serde::{Deserialize, Serialize};

/// 計算フェーズ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Forward = 0,
    Backprop = 1,
}

impl Phase {
    /// キーの phase ビットから復元
    #[inline]
    pub const fn from_bit(bit: bool) -> Phase {
        if bit { Phase::Backprop } else { Phase::Forward }
    }

    #[inline]
    pub const fn bit(self) -> bool {
        matches!(self, Phase::Backprop)
    }
}

/// コアの役割
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreRole {
    Weight,
    Sum,
    Input,
    Threshold,
}

/// ネットワーク種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetType {
    #[default]
    FeedForward = 0,
    SimpleRecurrent = 1,
    Rbptt = 2,
    Continuous = 3,
}

/// 重み更新則
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateRule {
    Steepest = 0,
    Momentum = 1,
    #[default]
    DougsMomentum = 2,
}

/// 入力パイプライン段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStage {
    Integrator = 0,
    SoftClamp = 1,
}

impl InputStage {
    /// 逆伝播演算を持つか
    pub const fn has_backward(self) -> bool {
        matches!(self, InputStage::Integrator)
    }
}

/// 出力パイプライン段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStage {
    Logistic = 0,
    Integrator = 1,
    HardClamp = 2,
    WeakClamp = 3,
    Bias = 4,
}

/// 停止判定関数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCriterion {
    #[default]
    None = 0,
    Standard = 1,
    Max = 2,
}

/// 誤差関数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFunction {
    #[default]
    None = 0,
    CrossEntropy = 1,
    Squared = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_bit() {
        assert_eq!(Phase::from_bit(false), Phase::Forward);
        assert_eq!(Phase::from_bit(true), Phase::Backprop);
        assert!(Phase::Backprop.bit());
    }

    #[test]
    fn test_codes_match_wire_values() {
        assert_eq!(UpdateRule::DougsMomentum as u8, 2);
        assert_eq!(OutputStage::Bias as u8, 4);
        assert_eq!(ErrorFunction::Squared as u8, 2);
        assert_eq!(NetType::Continuous as u8, 3);
    }

    #[test]
    fn test_serde_names() {
        #[derive(Deserialize)]
        struct Wrap {
            stage: OutputStage,
            rule: UpdateRule,
        }
        let w: Wrap = toml::from_str("stage = \"weak_clamp\"\nrule = \"dougs_momentum\"").unwrap();
        assert_eq!(w.stage, OutputStage::WeakClamp);
        assert_eq!(w.rule, UpdateRule::DougsMomentum);
    }
}
