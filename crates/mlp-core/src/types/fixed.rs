//! 固定小数点数値型
//!
//! コア間でやり取りされる値はすべて 32bit 固定小数点で表現する。
//! 積和演算は 64bit の long 型で行い、格納・送信前に必ず丸めと飽和をかける。
//!
//! | 型 | 形式 | 用途 |
//! |----|------|------|
//! | [`Activation`] | s4.27 | ユニット出力 |
//! | [`ShortActivation`] | s0.15 | ホスト報告・逆シグモイド入力 |
//! | [`Net`] | s8.23 | ネット入力（long は s40.23） |
//! | [`ErrorValue`] | s16.15 | 誤差（long は .27） |
//! | [`Delta`] | s8.23 | デルタ（long は .27） |
//! | [`Derivative`] | s16.15 | 出力微分（long は .27） |
//! | [`Weight`] | s16.15 | 重み |
//! | [`FpReal`] | s15.16 | 時定数・強度などの実数パラメータ |
//! | [`Lds`] | u28.4 | link delta 二乗和 |

/// ユニット出力（s4.27）
pub type Activation = i32;
/// 64bit 出力（s36.27）
pub type LongActivation = i64;
/// 短縮出力（s0.15）
pub type ShortActivation = i16;
/// ネット入力（s8.23）
pub type Net = i32;
/// 64bit ネット入力（s40.23）
pub type LongNet = i64;
/// 誤差（s16.15）
pub type ErrorValue = i32;
/// 64bit 誤差（s36.27）
pub type LongError = i64;
/// デルタ（s8.23）
pub type Delta = i32;
/// 64bit デルタ（s36.27）
pub type LongDelta = i64;
/// 出力微分（s16.15）
pub type Derivative = i32;
/// 64bit 出力微分（s36.27）
pub type LongDerivative = i64;
/// 重み（s16.15）
pub type Weight = i32;
/// 64bit 重み
pub type LongWeight = i64;
/// 実数パラメータ（s15.16）
pub type FpReal = i32;
/// 64bit 実数パラメータ
pub type LongFpReal = i64;
/// 短縮実数パラメータ（s0.15、学習率・モーメンタム・減衰）
pub type ShortFpReal = i32;
/// link delta 二乗和（u28.4）
pub type Lds = u32;
/// 64bit link delta 二乗和
pub type LongLds = u64;

// 出力
pub const SHORT_ACTIV_SHIFT: u32 = 15;
pub const SHORT_ACTIV_MAX: i32 = (1 << SHORT_ACTIV_SHIFT) - 1;
pub const SHORT_ACTIV_MIN: i32 = 0;
pub const SHORT_ACTIV_NAN: ShortActivation = i16::MIN;

pub const ACTIV_SHIFT: u32 = 27;
pub const ACTIV_ONE: Activation = 1 << ACTIV_SHIFT;
pub const ACTIV_NAN: Activation = -1 << ACTIV_SHIFT;
/// s0.15 と s4.27 の小数点位置の差
pub const ACTIV_SHORT_DIFF: u32 = ACTIV_SHIFT - SHORT_ACTIV_SHIFT;
/// 出力の飽和上限（short 表現の最大値を s4.27 に戻した値）
pub const ACTIV_SAT_MAX: Activation = SHORT_ACTIV_MAX << ACTIV_SHORT_DIFF;
/// 出力の飽和下限
pub const ACTIV_SAT_MIN: Activation = SHORT_ACTIV_MIN << ACTIV_SHORT_DIFF;

// ネット入力
pub const NET_SHIFT: u32 = 23;
pub const LONG_NET_SHIFT: u32 = 23;
pub const NET_MAX: Net = 255 << NET_SHIFT;
pub const NET_MIN: Net = -(255 << NET_SHIFT);

// 誤差
pub const ERROR_SHIFT: u32 = 15;
pub const LONG_ERROR_SHIFT: u32 = 27;
pub const ERROR_MAX: ErrorValue = 0xffff << ERROR_SHIFT;
pub const ERROR_MIN: ErrorValue = -(0xffff << ERROR_SHIFT);

// デルタ
pub const DELTA_SHIFT: u32 = 23;
pub const LONG_DELTA_SHIFT: u32 = 27;
pub const DELTA_MAX: Delta = 0xff << DELTA_SHIFT;
pub const DELTA_MIN: Delta = -(0xff << DELTA_SHIFT);

// 出力微分
pub const DERIV_SHIFT: u32 = 15;
pub const LONG_DERIV_SHIFT: u32 = 27;
pub const DERIV_ONE: Derivative = 1 << DERIV_SHIFT;
pub const DERIV_NEG_ONE: Derivative = -1 << DERIV_SHIFT;
pub const DERIV_MAX: Derivative = i32::MAX;
pub const DERIV_MIN_NEG: Derivative = i32::MIN;

// 重み
pub const WEIGHT_SHIFT: u32 = 15;
pub const WEIGHT_ONE: Weight = 1 << WEIGHT_SHIFT;
pub const WEIGHT_MAX: Weight = 0xffff << WEIGHT_SHIFT;
pub const WEIGHT_MIN: Weight = -(0xffff << WEIGHT_SHIFT);
/// 0 を避けるための最小正値
pub const WEIGHT_POS_EPSILON: Weight = 1;
/// 0 を避けるための最小負値
pub const WEIGHT_NEG_EPSILON: Weight = -1;

// 実数パラメータ
pub const FPREAL_SHIFT: u32 = 16;
pub const FPREAL_ONE: FpReal = 1 << FPREAL_SHIFT;
pub const FP_NAN: FpReal = -1 << FPREAL_SHIFT;
pub const SHORT_FPREAL_SHIFT: u32 = 15;
/// 時間値の丸め補正（FpReal の最小単位）
pub const SMALL_VAL: FpReal = 1;

// link delta 二乗和
pub const LDS_SHIFT: u32 = 4;
pub const LDS_ONE: Lds = 1 << LDS_SHIFT;
pub const LDS_MAX: Lds = u32::MAX;

/// 64bit 値を `[min, max]` に飽和させて 32bit に落とす
#[inline]
pub fn saturate_i32(v: i64, min: i32, max: i32) -> i32 {
    if v > max as i64 {
        max
    } else if v < min as i64 {
        min
    } else {
        v as i32
    }
}

/// ネット入力へ飽和キャスト
#[inline]
pub fn saturate_net(v: LongNet) -> Net {
    saturate_i32(v, NET_MIN, NET_MAX)
}

/// 誤差へ飽和キャスト
#[inline]
pub fn saturate_error(v: LongError) -> ErrorValue {
    saturate_i32(v, ERROR_MIN, ERROR_MAX)
}

/// デルタへ飽和キャスト
#[inline]
pub fn saturate_delta(v: LongDelta) -> Delta {
    saturate_i32(v, DELTA_MIN, DELTA_MAX)
}

/// 出力へ飽和キャスト（`[0, SHORT_ACTIV_MAX]` 相当の範囲）
#[inline]
pub fn saturate_activation(v: LongActivation) -> Activation {
    saturate_i32(v, ACTIV_SAT_MIN, ACTIV_SAT_MAX)
}

/// 重みへ飽和キャスト
#[inline]
pub fn saturate_weight(v: LongWeight) -> Weight {
    saturate_i32(v, WEIGHT_MIN, WEIGHT_MAX)
}

/// 出力微分へ飽和キャスト
#[inline]
pub fn saturate_derivative(v: LongDerivative) -> LongDerivative {
    v.clamp(DERIV_MIN_NEG as i64, DERIV_MAX as i64)
}

/// link delta 二乗和へ飽和キャスト
#[inline]
pub fn saturate_lds(v: LongLds) -> Lds {
    if v > LDS_MAX as u64 { LDS_MAX } else { v as Lds }
}

/// s4.27 出力を s0.15 に変換（NaN は NaN のまま）
#[inline]
pub fn activation_to_short(v: Activation) -> ShortActivation {
    if v == ACTIV_NAN {
        SHORT_ACTIV_NAN
    } else {
        (v >> ACTIV_SHORT_DIFF).clamp(i16::MIN as i32 + 1, i16::MAX as i32) as ShortActivation
    }
}

/// 実数を固定小数点へ変換（四捨五入・飽和）
pub fn to_fixed(v: f64, shift: u32) -> i32 {
    let scaled = (v * (1u64 << shift) as f64).round();
    if scaled >= i32::MAX as f64 {
        i32::MAX
    } else if scaled <= i32::MIN as f64 {
        i32::MIN
    } else {
        scaled as i32
    }
}

/// 固定小数点を実数へ変換
#[inline]
pub fn from_fixed(v: i64, shift: u32) -> f64 {
    v as f64 / (1u64 << shift) as f64
}

/// 実数出力を s4.27 に変換（NaN は [`ACTIV_NAN`]）
pub fn activation_from_f64(v: f64) -> Activation {
    if v.is_nan() { ACTIV_NAN } else { to_fixed(v, ACTIV_SHIFT) }
}

/// 実数時間を s15.16 に変換（NaN は [`FP_NAN`]）
pub fn fpreal_from_f64(v: f64) -> FpReal {
    if v.is_nan() { FP_NAN } else { to_fixed(v, FPREAL_SHIFT) }
}

/// 整数平方根（切り捨て）
pub fn isqrt(v: u64) -> u64 {
    if v < 2 {
        return v;
    }
    // Newton 法。初期値は必ず解以上にとる
    let mut x = 1u64 << ((64 - v.leading_zeros()).div_ceil(2));
    loop {
        let y = (x + v / x) / 2;
        if y >= x {
            return x;
        }
        x = y;
    }
}

/// link delta 二乗和（u28.4）の平方根を s16.15 で返す
pub fn lds_sqrt(lds: Lds) -> Weight {
    // sqrt(x * 2^-4) * 2^15 = sqrt(x * 2^26)
    let root = isqrt((lds as u64) << (2 * WEIGHT_SHIFT - LDS_SHIFT));
    saturate_i32(root as i64, 0, i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_constants() {
        assert_eq!(ACTIV_ONE, 0x0800_0000);
        assert_eq!(ACTIV_SAT_MAX, 32767 << 12);
        assert_eq!(NET_MAX, 2_139_095_040);
        assert_eq!(WEIGHT_MAX, 0x7fff_8000);
        assert_eq!(WEIGHT_MIN, -WEIGHT_MAX);
        assert_eq!(SHORT_ACTIV_NAN as i32, -1 << 15);
    }

    #[test]
    fn test_saturation_bounds() {
        assert_eq!(saturate_net(i64::MAX), NET_MAX);
        assert_eq!(saturate_net(i64::MIN), NET_MIN);
        assert_eq!(saturate_net(12345), 12345);
        assert_eq!(saturate_weight(WEIGHT_MAX as i64 + 1), WEIGHT_MAX);
        assert_eq!(saturate_delta(-(1 << 40)), DELTA_MIN);
        assert_eq!(saturate_activation(-5), 0);
        assert_eq!(saturate_lds(u64::MAX), LDS_MAX);
    }

    #[test]
    fn test_activation_to_short() {
        assert_eq!(activation_to_short(ACTIV_NAN), SHORT_ACTIV_NAN);
        assert_eq!(activation_to_short(ACTIV_ONE / 2), 1 << 14);
        assert_eq!(activation_to_short(ACTIV_SAT_MAX), 32767);
    }

    #[test]
    fn test_to_fixed_roundtrip() {
        assert_eq!(to_fixed(0.5, ACTIV_SHIFT), ACTIV_ONE / 2);
        assert_eq!(to_fixed(-1.0, WEIGHT_SHIFT), -WEIGHT_ONE);
        assert_eq!(from_fixed(to_fixed(1.25, FPREAL_SHIFT) as i64, FPREAL_SHIFT), 1.25);
        assert_eq!(activation_from_f64(f64::NAN), ACTIV_NAN);
        assert_eq!(fpreal_from_f64(f64::NAN), FP_NAN);
    }

    #[test]
    fn test_isqrt() {
        for v in [0u64, 1, 2, 3, 4, 15, 16, 17, 1 << 40, (1 << 58) - 1, u64::MAX] {
            let r = isqrt(v);
            assert!(r.checked_mul(r).is_some_and(|sq| sq <= v), "v={v} r={r}");
            let next = r + 1;
            assert!(next.checked_mul(next).is_none_or(|sq| sq > v), "v={v} r={r}");
        }
    }

    #[test]
    fn test_lds_sqrt() {
        // 4.0 -> 2.0
        assert_eq!(lds_sqrt(4 * LDS_ONE), 2 * WEIGHT_ONE);
        assert_eq!(lds_sqrt(LDS_ONE), WEIGHT_ONE);
        assert_eq!(lds_sqrt(0), 0);
    }
}
