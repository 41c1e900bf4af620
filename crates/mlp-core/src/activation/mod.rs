//! 活性化関数（テーブル参照 + 線形補間）
//!
//! - [`sigmoid`]: s8.23 ネット入力 → s4.27 出力
//! - [`inv_sigmoid`]: s0.15 出力 → s8.23 ネット入力
//!
//! どちらも純関数で、参照テーブル（[`lut`]）に対してビット一致する。

pub mod lut;

use crate::types::{
    ACTIV_SAT_MAX, ACTIV_SAT_MIN, ACTIV_SHIFT, Activation, LongActivation, LongNet, NET_SHIFT,
    Net, SHORT_ACTIV_MAX, SHORT_ACTIV_SHIFT, ShortActivation,
};
use lut::{INV_SIGMOID_LUT, LUT_RES, SIGMOID_LUT};

/// シグモイドの入力上限（これ以上は飽和）
pub const SIGMD_MAX_INPUT: Net = 8 << NET_SHIFT;
/// シグモイドの入力下限
pub const SIGMD_MIN_INPUT: Net = -(8 << NET_SHIFT);
/// シグモイド LUT の補間ビット数
const SIGMD_LUT_SHIFT: u32 = NET_SHIFT - 5;
const SIGMD_LUT_IMASK: i32 = (1 << SIGMD_LUT_SHIFT) - 1;
/// 逆シグモイド LUT の補間ビット数
const INVSIG_LUT_SHIFT: u32 = SHORT_ACTIV_SHIFT - 9;
const INVSIG_LUT_IMASK: i32 = (1 << INVSIG_LUT_SHIFT) - 1;
/// 逆シグモイド LUT は .27、戻り値は .23
const INVSIG_OUT_SHIFT: u32 = 4;

/// ロジスティック関数
///
/// 負の入力は `1 - f(-x)` として対称性から求める。
pub fn sigmoid(input: Net) -> Activation {
    if input >= SIGMD_MAX_INPUT {
        return ACTIV_SAT_MAX;
    }
    if input <= SIGMD_MIN_INPUT {
        return ACTIV_SAT_MIN;
    }

    let abs = input.abs();
    let x0 = (abs >> SIGMD_LUT_SHIFT) as usize;
    let z = (abs & SIGMD_LUT_IMASK) as LongActivation;

    let y0 = SIGMOID_LUT[x0];
    let y1 = if x0 == LUT_RES - 1 { ACTIV_SAT_MAX } else { SIGMOID_LUT[x0 + 1] };

    // 補間値を半ULP加算して丸める
    let step = ((y1 - y0) as LongActivation * z + (1 << (SIGMD_LUT_SHIFT - 1))) >> SIGMD_LUT_SHIFT;
    let output = (y0 as LongActivation + step).clamp(ACTIV_SAT_MIN as i64, ACTIV_SAT_MAX as i64)
        as Activation;

    if input < 0 { (1 << ACTIV_SHIFT) - output } else { output }
}

/// 逆ロジスティック関数
///
/// テーブルは `[0.5, 1)` のみを持ち、0.5 未満は `-f(1 - x)` で求める。
pub fn inv_sigmoid(input: ShortActivation) -> Net {
    let input = input as i32;
    if input >= SHORT_ACTIV_MAX {
        return SIGMD_MAX_INPUT;
    }
    if input <= 0 {
        return SIGMD_MIN_INPUT;
    }

    let half = 1 << (SHORT_ACTIV_SHIFT - 1);
    let adapted = (input - half).abs();
    let x0 = (adapted >> INVSIG_LUT_SHIFT) as usize;

    let y0 = INV_SIGMOID_LUT[x0];
    let y1 = if x0 == LUT_RES - 1 {
        // テーブル終端は .27 表現の入力上限と補間する
        SIGMD_MAX_INPUT << INVSIG_OUT_SHIFT
    } else {
        INV_SIGMOID_LUT[x0 + 1]
    };

    let interp = y0 as LongNet
        + (((adapted & INVSIG_LUT_IMASK) as LongNet * (y1 - y0) as LongNet) >> INVSIG_LUT_SHIFT);
    let temp = (interp >> INVSIG_OUT_SHIFT).min(SIGMD_MAX_INPUT as LongNet) as Net;

    if input < half { -temp } else { temp }
}
