//! 重み更新則
//!
//! エポック終了時に、エポック中に積算した link delta（`∂E/∂w`, .27）から重みを更新する。
//! 重み 0 は「結合なし」を表すので更新しないし、更新結果が 0 になることもない。

use crate::types::{
    FPREAL_SHIFT, FpReal, LDS_ONE, LONG_DELTA_SHIFT, Lds, LongDelta, LongLds, ShortFpReal,
    UpdateRule, WEIGHT_MAX, WEIGHT_MIN, WEIGHT_NEG_EPSILON, WEIGHT_ONE, WEIGHT_POS_EPSILON,
    WEIGHT_SHIFT, Weight, lds_sqrt, saturate_weight,
};

/// 更新パラメータ（学習率・モーメンタム・減衰は s0.15）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateParams {
    pub rule: UpdateRule,
    pub learning_rate: ShortFpReal,
    pub momentum: ShortFpReal,
    pub weight_decay: ShortFpReal,
    /// 連続時間ネットのときだけ Δt を掛ける
    pub delta_dt: Option<FpReal>,
}

/// 連続時間ネットの Δt を反映した link delta
#[inline]
pub fn scaled_link_delta(ld: LongDelta, delta_dt: Option<FpReal>) -> LongDelta {
    match delta_dt {
        Some(dt) => (ld * dt as i64) >> FPREAL_SHIFT,
        None => ld,
    }
}

/// link delta の二乗（u28.4）
#[inline]
pub fn link_delta_square(ld: LongDelta, delta_dt: Option<FpReal>) -> LongLds {
    let ld = scaled_link_delta(ld, delta_dt) as i128;
    let sq = (ld * ld) >> (2 * LONG_DELTA_SHIFT - crate::types::LDS_SHIFT);
    sq.min(LongLds::MAX as i128) as LongLds
}

/// Doug's momentum の学習率（s0.15 の学習率を `1 / sqrt(lds)` で割り引いたもの）
pub fn dougs_rate(lds: Lds, learning_rate: ShortFpReal) -> i64 {
    let scale = if lds > LDS_ONE {
        let root = lds_sqrt(lds).max(1) as i64;
        (1i64 << (2 * WEIGHT_SHIFT)) / root
    } else {
        WEIGHT_ONE as i64
    };
    (scale * learning_rate as i64) >> WEIGHT_SHIFT
}

/// 重み変化量（s16.15）
pub fn weight_change(
    weight: Weight,
    ld: LongDelta,
    rate: i64,
    prev_change: Weight,
    params: &UpdateParams,
) -> Weight {
    let ld = scaled_link_delta(ld, params.delta_dt) as i128;
    // .15 × .27 → .15
    let mut change =
        ((-(rate as i128) * ld + (1 << (LONG_DELTA_SHIFT - 1))) >> LONG_DELTA_SHIFT) as i64;
    if params.rule != UpdateRule::Steepest {
        change += (params.momentum as i64 * prev_change as i64 + (1 << (WEIGHT_SHIFT - 1)))
            >> WEIGHT_SHIFT;
    }
    if params.weight_decay > 0 {
        change -= (params.weight_decay as i64 * weight as i64 + (1 << (WEIGHT_SHIFT - 1)))
            >> WEIGHT_SHIFT;
    }
    saturate_weight(change)
}

/// 変化量を適用する（飽和し、0 にはしない）
#[inline]
pub fn apply_change(weight: Weight, change: Weight) -> Weight {
    let temp = weight as i64 + change as i64;
    if temp >= WEIGHT_MAX as i64 {
        WEIGHT_MAX
    } else if temp <= WEIGHT_MIN as i64 {
        WEIGHT_MIN
    } else if temp == 0 {
        if weight > 0 { WEIGHT_POS_EPSILON } else { WEIGHT_NEG_EPSILON }
    } else {
        temp as Weight
    }
}

/// ブロック全体を更新する。更新した重みの数を返す
pub fn update_block(
    weights: &mut [Weight],
    link_deltas: &[LongDelta],
    prev_changes: &mut [Weight],
    params: &UpdateParams,
    lds: Lds,
) -> usize {
    let rate = match params.rule {
        UpdateRule::DougsMomentum => dougs_rate(lds, params.learning_rate),
        _ => params.learning_rate as i64,
    };
    let mut updated = 0;
    for ((w, &ld), prev) in weights.iter_mut().zip(link_deltas).zip(prev_changes.iter_mut()) {
        if *w == 0 {
            continue;
        }
        let change = weight_change(*w, ld, rate, *prev, params);
        *prev = change;
        *w = apply_change(*w, change);
        updated += 1;
    }
    updated
}
