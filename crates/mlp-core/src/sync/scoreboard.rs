//! スコアボード（到着数カウンタ）
//!
//! 目標数に達した呼び出しだけが `true` を受け取り、同時にカウンタが 0 へ戻る。
//! 発火判定とリセットを分けないことで、前 tick の残りカウントが次 tick に漏れない。

/// 単一カウンタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoreboard {
    target: u32,
    count: u32,
}

impl Scoreboard {
    pub fn new(target: u32) -> Scoreboard {
        Scoreboard { target, count: 0 }
    }

    /// 到着を記録し、目標に達したら `true` を返してリセットする
    #[inline]
    pub fn mark_arrived(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.target {
            self.count = 0;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// ユニットごとのカウンタ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitScoreboard {
    target: u32,
    counts: Vec<u32>,
}

impl UnitScoreboard {
    pub fn new(num_units: usize, target: u32) -> UnitScoreboard {
        UnitScoreboard { target, counts: vec![0; num_units] }
    }

    /// `unit` への到着を記録し、目標に達したら `true` を返してそのユニットをリセットする
    #[inline]
    pub fn mark_arrived(&mut self, unit: usize) -> bool {
        let c = &mut self.counts[unit];
        *c += 1;
        if *c >= self.target {
            *c = 0;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn count(&self, unit: usize) -> u32 {
        self.counts[unit]
    }

    pub fn reset(&mut self) {
        self.counts.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_exactly_at_target() {
        let mut sb = Scoreboard::new(3);
        assert!(!sb.mark_arrived());
        assert!(!sb.mark_arrived());
        assert!(sb.mark_arrived());
        assert_eq!(sb.count(), 0);
        // 次 tick も同じ目標で再利用できる
        assert!(!sb.mark_arrived());
        assert_eq!(sb.count(), 1);
    }

    #[test]
    fn test_unit_scoreboard_independent_units() {
        let mut sb = UnitScoreboard::new(2, 2);
        assert!(!sb.mark_arrived(0));
        assert!(!sb.mark_arrived(1));
        assert!(sb.mark_arrived(0));
        assert_eq!(sb.count(0), 0);
        assert_eq!(sb.count(1), 1);
        sb.reset();
        assert_eq!(sb.count(1), 0);
    }

    #[test]
    fn test_target_one_fires_every_time() {
        let mut sb = Scoreboard::new(1);
        for _ in 0..5 {
            assert!(sb.mark_arrived());
        }
    }
}
