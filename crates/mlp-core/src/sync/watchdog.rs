//! 進捗ウォッチドッグ
//!
//! タイマ tick ごとに進捗キー（エポック・例題・イベント・tick・フェーズ）を比較し、
//! 変化がないまま `timeout` 回続いたら期限切れとみなす。

use crate::types::Phase;

/// 進捗キー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub epoch: u32,
    pub example: u32,
    pub event: u32,
    pub tick: u32,
    pub phase: Phase,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    timeout: u32,
    idle: u32,
    last: Option<Progress>,
}

impl Watchdog {
    /// `timeout == 0` は無効
    pub fn new(timeout: u32) -> Watchdog {
        Watchdog { timeout, idle: 0, last: None }
    }

    /// 1 回分のタイマ tick。期限切れなら `true`
    pub fn tick(&mut self, now: Progress) -> bool {
        if self.timeout == 0 {
            return false;
        }
        if self.last != Some(now) {
            self.last = Some(now);
            self.idle = 0;
            return false;
        }
        self.idle += 1;
        self.idle >= self.timeout
    }

    /// 回復処理の後にカウントをやり直す
    pub fn rewind(&mut self) {
        self.idle = 0;
    }
}
