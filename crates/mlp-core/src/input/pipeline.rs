//! 入力パイプライン
//!
//! 前向きは設定順、逆向きは逆順に実行する。逆向き演算を持たない段は飛ばす。

use crate::activation::inv_sigmoid;
use crate::types::{
    ACTIV_NAN, Activation, FPREAL_SHIFT, FpReal, InputStage, LongDelta, Net, activation_to_short,
    saturate_net,
};

/// ユニットごとの積分器状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputState {
    /// 前 tick の積分器出力（s8.23）
    pub last_net: Vec<Net>,
    /// 逆向き積分器の状態（.27）
    pub last_delta: Vec<LongDelta>,
}

impl InputState {
    pub fn new(num_units: usize, init_net: Net) -> InputState {
        InputState { last_net: vec![init_net; num_units], last_delta: vec![0; num_units] }
    }

    pub fn reset(&mut self, init_net: Net) {
        self.last_net.fill(init_net);
        self.last_delta.fill(0);
    }
}

/// パイプラインのパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputParams {
    pub dt: FpReal,
    pub soft_clamp_strength: FpReal,
    pub init_output: Activation,
}

/// 積分器: `last + dt × (net − last)`
#[inline]
pub fn integrate(last: Net, net: Net, dt: FpReal) -> Net {
    let last = last as i64;
    saturate_net(last + ((dt as i64 * (net as i64 - last)) >> FPREAL_SHIFT))
}

/// ソフトクランプ: 外部入力へ寄せた出力を逆シグモイドでネット入力へ戻して加える
#[inline]
pub fn soft_clamp(net: Net, external: Activation, params: &InputParams) -> Net {
    if external == ACTIV_NAN {
        return net;
    }
    let init = params.init_output as i64;
    let pull = params.soft_clamp_strength as i64 * (external as i64 - init);
    let target = init + (pull >> FPREAL_SHIFT);
    let target = target.clamp(0, i32::MAX as i64) as Activation;
    saturate_net(net as i64 + inv_sigmoid(activation_to_short(target)) as i64)
}

/// 逆向き積分器
///
/// 入出力は .27 の long delta。
#[inline]
pub fn integrate_back(last_delta: &mut LongDelta, delta: LongDelta, dt: FpReal) -> LongDelta {
    let d = (dt as i64 * *last_delta) >> FPREAL_SHIFT;
    *last_delta += delta - d;
    d
}

/// 前向きパイプライン
pub fn forward(
    stages: &[InputStage],
    unit: usize,
    net: Net,
    external: Activation,
    state: &mut InputState,
    params: &InputParams,
) -> Net {
    let mut net = net;
    for stage in stages {
        net = match stage {
            InputStage::Integrator => {
                let out = integrate(state.last_net[unit], net, params.dt);
                state.last_net[unit] = out;
                out
            }
            InputStage::SoftClamp => soft_clamp(net, external, params),
        };
    }
    net
}

/// 逆向きパイプライン（.27 の long delta）
pub fn backward(
    stages: &[InputStage],
    unit: usize,
    delta: LongDelta,
    state: &mut InputState,
    params: &InputParams,
) -> LongDelta {
    let mut delta = delta;
    for stage in stages.iter().rev().filter(|s| s.has_backward()) {
        if *stage == InputStage::Integrator {
            delta = integrate_back(&mut state.last_delta[unit], delta, params.dt);
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ACTIV_ONE, FPREAL_ONE, NET_SHIFT};

    fn params(dt: FpReal) -> InputParams {
        InputParams { dt, soft_clamp_strength: FPREAL_ONE / 2, init_output: ACTIV_ONE / 2 }
    }

    #[test]
    fn test_integrate_moves_halfway() {
        assert_eq!(integrate(0, 2 << NET_SHIFT, FPREAL_ONE / 2), 1 << NET_SHIFT);
        assert_eq!(integrate(1 << NET_SHIFT, 1 << NET_SHIFT, FPREAL_ONE / 2), 1 << NET_SHIFT);
        // dt = 1 は素通し
        assert_eq!(integrate(123, 456, FPREAL_ONE), 456);
    }

    #[test]
    fn test_soft_clamp_nan_passes() {
        let p = params(FPREAL_ONE);
        assert_eq!(soft_clamp(77, ACTIV_NAN, &p), 77);
    }

    #[test]
    fn test_soft_clamp_at_init_adds_zero() {
        // 目標 = 初期出力 0.5 → 逆シグモイドは 0
        let p = params(FPREAL_ONE);
        assert_eq!(soft_clamp(77, ACTIV_ONE / 2, &p), 77);
        // 1.0 へ寄せると正方向に増える
        assert!(soft_clamp(0, ACTIV_ONE, &p) > 0);
        assert!(soft_clamp(0, 0, &p) < 0);
    }

    #[test]
    fn test_forward_updates_state() {
        let mut state = InputState::new(2, 0);
        let p = params(FPREAL_ONE / 2);
        let stages = [InputStage::Integrator];
        let a = forward(&stages, 1, 4 << NET_SHIFT, ACTIV_NAN, &mut state, &p);
        assert_eq!(a, 2 << NET_SHIFT);
        assert_eq!(state.last_net, vec![0, 2 << NET_SHIFT]);
        let b = forward(&stages, 1, 4 << NET_SHIFT, ACTIV_NAN, &mut state, &p);
        assert_eq!(b, 3 << NET_SHIFT);
        state.reset(0);
        assert_eq!(state.last_net, vec![0, 0]);
    }

    #[test]
    fn test_backward_integrator() {
        let mut state = InputState::new(1, 0);
        let p = params(FPREAL_ONE / 2);
        let stages = [InputStage::Integrator, InputStage::SoftClamp];
        // 1 回目: 状態 0 → 出力 0、状態 = 入力
        assert_eq!(backward(&stages, 0, 1000, &mut state, &p), 0);
        assert_eq!(state.last_delta[0], 1000);
        // 2 回目: 出力 = dt × 状態
        assert_eq!(backward(&stages, 0, 0, &mut state, &p), 500);
        assert_eq!(state.last_delta[0], 500);
    }
}
