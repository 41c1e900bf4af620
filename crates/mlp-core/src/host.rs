//! ホストへの報告
//!
//! 出力グループの Threshold コアだけがホストへメッセージを送る。
//!
//! - [`HostMessage::Info`]: ステージ開始時のグループ情報
//! - [`HostMessage::Outputs`]: tick ごとの出力と目標
//! - [`HostMessage::Final`]: ステージ終了時の集計と終了コード

use serde::{Deserialize, Serialize};

use crate::error::ExitCode;
use crate::types::ShortActivation;

/// 出力を記録した位置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRecord {
    pub epoch: u32,
    pub example: u32,
    pub event: u32,
    pub tick: u32,
}

/// ステージの集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResults {
    pub epochs_trained: u32,
    pub examples_tested: u32,
    pub ticks_tested: u32,
    pub examples_correct: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostMessage {
    Info {
        group: usize,
        num_units: usize,
        training: bool,
        num_examples: u32,
    },
    Outputs {
        group: usize,
        record: TickRecord,
        /// (出力, 目標) の s0.15 値
        values: Vec<(ShortActivation, ShortActivation)>,
    },
    Final {
        group: usize,
        results: TestResults,
        exit: ExitCode,
    },
}

/// ホスト側の受け口
pub trait HostSink {
    fn deliver(&mut self, message: HostMessage) -> std::io::Result<()>;
}

/// 受け取ったメッセージをすべて保持する
#[derive(Debug, Default)]
pub struct CollectSink {
    pub messages: Vec<HostMessage>,
}

impl CollectSink {
    pub fn new() -> CollectSink {
        CollectSink::default()
    }

    /// 最後に受け取った集計
    pub fn final_results(&self) -> Option<(TestResults, ExitCode)> {
        self.messages.iter().rev().find_map(|m| match m {
            HostMessage::Final { results, exit, .. } => Some((*results, *exit)),
            _ => None,
        })
    }

    pub fn outputs(
        &self,
    ) -> impl Iterator<Item = (&TickRecord, &[(ShortActivation, ShortActivation)])> {
        self.messages.iter().filter_map(|m| match m {
            HostMessage::Outputs { record, values, .. } => Some((record, values.as_slice())),
            _ => None,
        })
    }
}

impl HostSink for CollectSink {
    fn deliver(&mut self, message: HostMessage) -> std::io::Result<()> {
        self.messages.push(message);
        Ok(())
    }
}

/// 何も保持しない
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl HostSink for NullSink {
    fn deliver(&mut self, _message: HostMessage) -> std::io::Result<()> {
        Ok(())
    }
}
