//! 収束判定（停止基準）
//!
//! tick ごとにリセットし、ユニットの出力を 1 つずつ評価する。

use crate::types::{ACTIV_NAN, ACTIV_SHORT_DIFF, Activation, ErrorValue, StopCriterion};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    kind: StopCriterion,
    /// 許容誤差（s16.15）
    threshold: ErrorValue,
    met: bool,
    max_output: Option<(Activation, usize)>,
    max_target: Option<(Activation, usize)>,
}

impl Criterion {
    pub fn new(kind: StopCriterion, threshold: ErrorValue) -> Criterion {
        Criterion { kind, threshold, met: true, max_output: None, max_target: None }
    }

    pub fn reset(&mut self) {
        self.met = true;
        self.max_output = None;
        self.max_target = None;
    }

    /// ユニット `unit` の出力を評価する（目標が NaN のユニットは対象外）
    pub fn evaluate(&mut self, unit: usize, output: Activation, target: Activation) {
        if target == ACTIV_NAN {
            return;
        }
        match self.kind {
            StopCriterion::None => {}
            StopCriterion::Standard => {
                self.met &= self.within(output, target);
            }
            StopCriterion::Max => {
                if outranks(self.max_output, output, unit) {
                    self.max_output = Some((output, unit));
                }
                if outranks(self.max_target, target, unit) {
                    self.max_target = Some((target, unit));
                }
            }
        }
    }

    /// 今 tick の判定結果
    ///
    /// `None` は判定を持たないので、イベントは最大 tick 数まで続く。
    pub fn is_met(&self) -> bool {
        match self.kind {
            StopCriterion::None => false,
            StopCriterion::Standard => self.met,
            StopCriterion::Max => match (self.max_output, self.max_target) {
                (Some((out, uo)), Some((tgt, ut))) => uo == ut && self.within(out, tgt),
                _ => true,
            },
        }
    }

    #[inline]
    fn within(&self, output: Activation, target: Activation) -> bool {
        let error = (output as i64 - target as i64).abs() >> ACTIV_SHORT_DIFF;
        error < self.threshold as i64
    }
}

/// 最大値の更新判定。同値なら番号の小さいユニットを残す
#[inline]
fn outranks(current: Option<(Activation, usize)>, value: Activation, unit: usize) -> bool {
    current.is_none_or(|(v, u)| value > v || (value == v && unit < u))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ACTIV_ONE, ERROR_SHIFT};

    /// 0.2（s16.15）
    const CRIT: ErrorValue = (2 << ERROR_SHIFT) / 10;

    #[test]
    fn test_standard_all_units() {
        let mut c = Criterion::new(StopCriterion::Standard, CRIT);
        c.evaluate(0, ACTIV_ONE / 10 * 9, ACTIV_ONE);
        c.evaluate(1, ACTIV_ONE / 10, 0);
        assert!(c.is_met());
        c.evaluate(2, ACTIV_ONE / 2, 0);
        assert!(!c.is_met());
        c.reset();
        assert!(c.is_met());
    }

    #[test]
    fn test_nan_target_ignored() {
        let mut c = Criterion::new(StopCriterion::Standard, CRIT);
        c.evaluate(0, 0, ACTIV_NAN);
        assert!(c.is_met());
    }

    #[test]
    fn test_max_requires_same_unit() {
        let mut c = Criterion::new(StopCriterion::Max, CRIT);
        c.evaluate(0, ACTIV_ONE / 10 * 9, ACTIV_ONE);
        c.evaluate(1, ACTIV_ONE / 10 * 3, 0);
        assert!(c.is_met());

        c.reset();
        c.evaluate(0, ACTIV_ONE / 10 * 3, ACTIV_ONE);
        c.evaluate(1, ACTIV_ONE / 10 * 9, 0);
        assert!(!c.is_met());
    }

    #[test]
    fn test_max_ties_independent_of_order() {
        let out = ACTIV_ONE / 10 * 9;
        let mut forward = Criterion::new(StopCriterion::Max, CRIT);
        forward.evaluate(0, out, ACTIV_ONE);
        forward.evaluate(1, out, 0);
        let mut reverse = Criterion::new(StopCriterion::Max, CRIT);
        reverse.evaluate(1, out, 0);
        reverse.evaluate(0, out, ACTIV_ONE);
        assert_eq!(forward, reverse);
        assert!(forward.is_met());

        // 目標の同値も番号で決まる
        let mut a = Criterion::new(StopCriterion::Max, CRIT);
        a.evaluate(0, ACTIV_ONE, ACTIV_ONE);
        a.evaluate(1, 0, ACTIV_ONE);
        let mut b = Criterion::new(StopCriterion::Max, CRIT);
        b.evaluate(1, 0, ACTIV_ONE);
        b.evaluate(0, ACTIV_ONE, ACTIV_ONE);
        assert_eq!(a, b);
        assert!(a.is_met());
    }

    #[test]
    fn test_none_never_met() {
        let mut c = Criterion::new(StopCriterion::None, CRIT);
        c.evaluate(0, ACTIV_ONE, ACTIV_ONE);
        assert!(!c.is_met());
    }
}
