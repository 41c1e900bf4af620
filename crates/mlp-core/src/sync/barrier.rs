//! スレッド待ちバリア
//!
//! tick を進めるには、役割ごとに決まった「スレッド」（処理・受信・停止判定・LDS 等）が
//! すべて完了を報告する必要がある。各スレッドは自分のビットを落とし、最後のビットを
//! 落とした呼び出しだけが `true` を受け取る。発火と同時にマスクは満タンに戻る。

use std::fmt;

/// スレッドビット
pub mod thread {
    /// 処理スレッド
    pub const PROC: u32 = 0x01;
    /// 受信スレッド
    pub const COMS: u32 = 0x02;
    /// 停止判定（デイジーチェーンの前段）
    pub const CRIT: u32 = 0x04;
    /// tick 停止判定の受信
    pub const STOP: u32 = 0x08;
    /// link delta 部分和の集約完了
    pub const LDSA: u32 = 0x10;
    /// link delta 最終結果の受信
    pub const LDSR: u32 = 0x20;
}

/// 待ちビットの集合
#[derive(Clone, PartialEq, Eq)]
pub struct ThreadBarrier {
    full: u32,
    pending: u32,
}

impl ThreadBarrier {
    pub fn new(full: u32) -> ThreadBarrier {
        ThreadBarrier { full, pending: full }
    }

    /// `bits` の完了を報告する
    ///
    /// 待ちが空になったら `true` を返し、同時に満タンへ戻す。
    /// 既に落ちているビットの再報告は何もしない。
    #[inline]
    pub fn signal(&mut self, bits: u32) -> bool {
        if self.pending == 0 {
            return false;
        }
        self.pending &= !bits;
        if self.pending == 0 {
            self.pending = self.full;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn pending(&self) -> u32 {
        self.pending
    }

    #[inline]
    pub fn full(&self) -> u32 {
        self.full
    }

    /// 次 tick 用のビット集合で張り直す
    pub fn rearm(&mut self, full: u32) {
        self.full = full;
        self.pending = full;
    }
}

impl fmt::Debug for ThreadBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadBarrier {{ full: {:#04x}, pending: {:#04x} }}", self.full, self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::thread::*;
    use super::*;

    #[test]
    fn test_fires_on_last_bit_only() {
        let mut b = ThreadBarrier::new(PROC | COMS | STOP);
        assert!(!b.signal(STOP));
        assert!(!b.signal(PROC));
        assert_eq!(b.pending(), COMS);
        assert!(b.signal(COMS));
        assert_eq!(b.pending(), PROC | COMS | STOP);
    }

    #[test]
    fn test_repeated_signal_does_not_fire() {
        let mut b = ThreadBarrier::new(PROC | STOP);
        assert!(!b.signal(PROC));
        assert!(!b.signal(PROC));
        assert!(b.signal(STOP));
    }

    #[test]
    fn test_rearm_changes_mask() {
        let mut b = ThreadBarrier::new(PROC);
        assert!(b.signal(PROC));
        b.rearm(PROC | LDSR);
        assert!(!b.signal(PROC));
        assert!(b.signal(LDSR));
        assert_eq!(b.full(), PROC | LDSR);
    }
}
