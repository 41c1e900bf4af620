//! パケット駆動の固定小数点 MLP 学習エンジン
//!
//! ネットワークのグループごとに 4 種類のコアを置き、マルチキャストパケットだけで
//! FORWARD / BACKPROP / 重み更新を進める。
//!
//! - [`weight::WeightCore`]: 重みブロック（送信元 → 送信先）の内積と誤差部分積
//! - [`sum::SumCore`]: 部分和の集計と link delta 和の集約
//! - [`input::InputCore`]: 入力パイプライン（積分器・ソフトクランプ）
//! - [`threshold::ThresholdCore`]: 出力パイプライン・誤差・停止判定
//!
//! [`machine::Machine`] はコア群とファブリックを逐次に動かすシミュレータ。

pub mod activation;
pub mod buffer;
pub mod config;
pub mod core;
pub mod error;
pub mod host;
pub mod input;
pub mod machine;
pub mod packet;
pub mod sum;
pub mod sync;
pub mod threshold;
pub mod types;
pub mod weight;

pub use crate::core::{Core, Diagnostics, TickState};
pub use error::{ConfigError, CoreError, ExitCode};
pub use host::{CollectSink, HostMessage, HostSink, NullSink, TestResults, TickRecord};
pub use machine::{
    DeliveryOrder, DropRule, Machine, MachineError, MachineOptions, Network, NetworkDescription,
    RunSummary, StageDesc, StageKind,
};
pub use packet::{Packet, PacketKey, PacketType};
