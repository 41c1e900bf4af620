//! 出力パイプラインと誤差関数
//!
//! 前向きは設定順に出力を作り、逆向きは逆順に出力微分をデルタへ戻す。
//! ロジスティック段は先頭にしか置けないので、逆向きでは最後に現れる。

use crate::activation::sigmoid;
use crate::types::{
    ACTIV_NAN, ACTIV_ONE, ACTIV_SHIFT, ACTIV_SHORT_DIFF, Activation, DELTA_SHIFT, DERIV_MAX,
    DERIV_MIN_NEG, DERIV_NEG_ONE, DERIV_ONE, Delta, ErrorFunction, FPREAL_SHIFT, FpReal,
    LONG_DERIV_SHIFT, LongDerivative, Net, OutputStage, saturate_activation, saturate_delta,
    saturate_derivative,
};

/// .27 ⇒ s8.23
const DELTA_NARROW: u32 = LONG_DERIV_SHIFT - DELTA_SHIFT;

/// ユニットごとの積分器状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputState {
    /// 前 tick の積分器出力
    pub last_output: Vec<Activation>,
    /// 逆向き積分器の状態（.27）
    pub last_deriv: Vec<LongDerivative>,
}

impl OutputState {
    pub fn new(num_units: usize, init_output: Activation) -> OutputState {
        OutputState { last_output: vec![init_output; num_units], last_deriv: vec![0; num_units] }
    }

    pub fn reset(&mut self, init_output: Activation) {
        self.last_output.fill(init_output);
        self.last_deriv.fill(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputParams {
    pub dt: FpReal,
    pub weak_clamp_strength: FpReal,
}

/// 出力積分器: `last + dt × (out − last)`（四捨五入）
#[inline]
pub fn integrate(last: Activation, out: Activation, dt: FpReal) -> Activation {
    let last = last as i64;
    let step = (dt as i64 * (out as i64 - last) + (1 << (FPREAL_SHIFT - 1))) >> FPREAL_SHIFT;
    saturate_activation(last + step)
}

/// 弱クランプ: 外部入力へ `strength` の割合だけ寄せる
#[inline]
pub fn weak_clamp(out: Activation, external: Activation, strength: FpReal) -> Activation {
    if external == ACTIV_NAN {
        return out;
    }
    let pull = (strength as i64 * (external as i64 - out as i64)) >> FPREAL_SHIFT;
    saturate_activation(out as i64 + pull)
}

/// 前向きパイプライン。戻り値は (出力, ハードクランプされたか)
pub fn forward(
    stages: &[OutputStage],
    unit: usize,
    net: Net,
    external: Activation,
    state: &mut OutputState,
    params: &OutputParams,
) -> (Activation, bool) {
    let mut out: Activation = 0;
    let mut clamped = false;
    for stage in stages {
        match stage {
            OutputStage::Logistic => out = sigmoid(net),
            OutputStage::Integrator => {
                out = integrate(state.last_output[unit], out, params.dt);
                state.last_output[unit] = out;
            }
            OutputStage::HardClamp => {
                if external != ACTIV_NAN {
                    out = external;
                    clamped = true;
                }
            }
            OutputStage::WeakClamp => out = weak_clamp(out, external, params.weak_clamp_strength),
            OutputStage::Bias => out = ACTIV_ONE,
        }
    }
    (out, clamped)
}

/// ロジスティック段の逆伝播: `deriv × y(1 − y)` を s8.23 のデルタにする
#[inline]
pub fn logistic_back(deriv: LongDerivative, net: Net) -> Delta {
    let y = sigmoid(net) as i64;
    let slope = (y * (ACTIV_ONE as i64 - y) + (1 << (ACTIV_SHIFT - 1))) >> ACTIV_SHIFT;
    let shift = LONG_DERIV_SHIFT + ACTIV_SHIFT - DELTA_SHIFT;
    let wide = (deriv as i128 * slope as i128 + (1i128 << (shift - 1))) >> shift;
    saturate_delta(wide.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
}

/// 逆向き積分器（.27）
#[inline]
pub fn integrate_back(
    last_deriv: &mut LongDerivative,
    deriv: LongDerivative,
    dt: FpReal,
) -> LongDerivative {
    let d = (dt as i64 * *last_deriv) >> FPREAL_SHIFT;
    *last_deriv += deriv - d;
    d
}

/// 逆向きパイプライン
///
/// `deriv` は出力微分（.27）、`net` と `clamped` はその tick の記録値。
pub fn backward(
    stages: &[OutputStage],
    unit: usize,
    deriv: LongDerivative,
    net: Net,
    clamped: bool,
    state: &mut OutputState,
    params: &OutputParams,
) -> Delta {
    let mut d = deriv;
    for stage in stages.iter().rev() {
        match stage {
            OutputStage::Bias => d = 0,
            OutputStage::HardClamp => {
                if clamped {
                    d = 0;
                }
            }
            OutputStage::WeakClamp => {}
            OutputStage::Integrator => {
                d = integrate_back(&mut state.last_deriv[unit], d, params.dt);
            }
            OutputStage::Logistic => return logistic_back(d, net),
        }
    }
    saturate_delta(d >> DELTA_NARROW)
}

/// 誤差関数の出力微分 `∂E/∂out`（.27）。目標が NaN なら 0
pub fn error_deriv(
    function: ErrorFunction,
    output: Activation,
    target: Activation,
) -> LongDerivative {
    if target == ACTIV_NAN {
        return 0;
    }
    match function {
        ErrorFunction::None => 0,
        ErrorFunction::Squared => output as i64 - target as i64,
        ErrorFunction::CrossEntropy => cross_entropy_deriv(output as i64, target as i64),
    }
}

/// 交差エントロピーの出力微分: `(out − tgt) / (out (1 − out))`
///
/// 出力が 0 か 1 に張り付いたときは分母が消えるので飽和値を返す。
fn cross_entropy_deriv(out: i64, tgt: i64) -> LongDerivative {
    let one = ACTIV_ONE as i64;
    let eps = 1i64 << ACTIV_SHORT_DIFF;
    let short_out = out >> ACTIV_SHORT_DIFF;
    let d = if tgt == 0 {
        if one - out <= eps {
            DERIV_MAX as i64
        } else {
            ((DERIV_ONE as i64) << LONG_DERIV_SHIFT) / (DERIV_ONE as i64 - short_out)
        }
    } else if tgt == one {
        if out <= eps {
            DERIV_MIN_NEG as i64
        } else {
            ((DERIV_NEG_ONE as i64) << LONG_DERIV_SHIFT) / short_out
        }
    } else if (out * (one - out)) >> ACTIV_SHIFT <= eps {
        (DERIV_MAX as i64 * (out - tgt)) >> ACTIV_SHIFT
    } else {
        let num = short_out - (tgt >> ACTIV_SHORT_DIFF);
        let den = (out * (DERIV_ONE as i64 - short_out)) >> ACTIV_SHIFT;
        if den == 0 {
            if num >= 0 { DERIV_MAX as i64 } else { DERIV_MIN_NEG as i64 }
        } else {
            (num << LONG_DERIV_SHIFT) / den
        }
    };
    saturate_derivative(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FPREAL_ONE, NET_SHIFT};

    fn params() -> OutputParams {
        OutputParams { dt: FPREAL_ONE / 2, weak_clamp_strength: FPREAL_ONE / 2 }
    }

    #[test]
    fn test_logistic_at_zero() {
        let mut state = OutputState::new(1, 0);
        let (out, clamped) =
            forward(&[OutputStage::Logistic], 0, 0, ACTIV_NAN, &mut state, &params());
        assert!((out - ACTIV_ONE / 2).abs() < 1 << 16);
        assert!(!clamped);
    }

    #[test]
    fn test_hard_clamp_records_flag() {
        let mut state = OutputState::new(1, 0);
        let stages = [OutputStage::Logistic, OutputStage::HardClamp];
        let (out, clamped) = forward(&stages, 0, 0, ACTIV_ONE, &mut state, &params());
        assert_eq!(out, ACTIV_ONE);
        assert!(clamped);
        let (_, clamped) = forward(&stages, 0, 0, ACTIV_NAN, &mut state, &params());
        assert!(!clamped);
    }

    #[test]
    fn test_bias_is_one() {
        let mut state = OutputState::new(1, 0);
        let (out, _) =
            forward(&[OutputStage::Bias], 0, 5 << NET_SHIFT, ACTIV_NAN, &mut state, &params());
        assert_eq!(out, ACTIV_ONE);
        assert_eq!(backward(&[OutputStage::Bias], 0, 1 << 27, 0, false, &mut state, &params()), 0);
    }

    #[test]
    fn test_weak_clamp_halfway() {
        assert_eq!(weak_clamp(0, ACTIV_ONE / 2, FPREAL_ONE / 2), ACTIV_ONE / 4);
        assert_eq!(weak_clamp(123, ACTIV_NAN, FPREAL_ONE / 2), 123);
    }

    #[test]
    fn test_integrator_state() {
        let mut state = OutputState::new(1, 0);
        let stages = [OutputStage::Logistic, OutputStage::Integrator];
        let (a, _) = forward(&stages, 0, 0, ACTIV_NAN, &mut state, &params());
        assert!((a - ACTIV_ONE / 4).abs() < 1 << 16);
        assert_eq!(state.last_output[0], a);
        state.reset(ACTIV_ONE);
        assert_eq!(state.last_output[0], ACTIV_ONE);
    }

    #[test]
    fn test_logistic_back_quarter_slope() {
        // y = 0.5 → y(1 − y) = 0.25
        let delta = logistic_back(1 << LONG_DERIV_SHIFT, 0);
        let quarter = 1 << (DELTA_SHIFT - 2);
        assert!((delta - quarter).abs() < 1 << 8, "delta = {delta}");
        // 符号は保たれる
        assert!(logistic_back(-(1 << LONG_DERIV_SHIFT), 0) < 0);
    }

    #[test]
    fn test_backward_without_logistic_narrows() {
        let mut state = OutputState::new(1, 0);
        let d = backward(&[], 0, 1 << LONG_DERIV_SHIFT, 0, false, &mut state, &params());
        assert_eq!(d, 1 << DELTA_SHIFT);
        let one = 1 << LONG_DERIV_SHIFT;
        let d = backward(&[OutputStage::HardClamp], 0, one, 0, true, &mut state, &params());
        assert_eq!(d, 0);
    }

    #[test]
    fn test_squared_error() {
        assert_eq!(error_deriv(ErrorFunction::Squared, ACTIV_ONE, 0), ACTIV_ONE as i64);
        assert_eq!(error_deriv(ErrorFunction::Squared, 0, ACTIV_ONE), -(ACTIV_ONE as i64));
        assert_eq!(error_deriv(ErrorFunction::Squared, 0, ACTIV_NAN), 0);
        assert_eq!(error_deriv(ErrorFunction::None, 0, ACTIV_ONE), 0);
    }

    #[test]
    fn test_cross_entropy() {
        // out = 0.5, tgt = 0 → 1 / (1 − 0.5) = 2
        let d = error_deriv(ErrorFunction::CrossEntropy, ACTIV_ONE / 2, 0);
        assert_eq!(d, 2 << LONG_DERIV_SHIFT);
        // out = 0.5, tgt = 1 → −1 / 0.5 = −2
        let d = error_deriv(ErrorFunction::CrossEntropy, ACTIV_ONE / 2, ACTIV_ONE);
        assert_eq!(d, -(2 << LONG_DERIV_SHIFT));
        // 張り付いた出力は飽和
        assert_eq!(error_deriv(ErrorFunction::CrossEntropy, ACTIV_ONE, 0), DERIV_MAX as i64);
        assert_eq!(error_deriv(ErrorFunction::CrossEntropy, 0, ACTIV_ONE), DERIV_MIN_NEG as i64);
        // out = 0.5, tgt = 0.25 → 0.25 / 0.25 = 1
        let d = error_deriv(ErrorFunction::CrossEntropy, ACTIV_ONE / 2, ACTIV_ONE / 4);
        assert_eq!(d, 1 << LONG_DERIV_SHIFT);
    }
}
