//! 同期プリミティブ
//!
//! - `queue`: 有界パケットキュー
//! - `scoreboard`: 到着数カウンタ
//! - `barrier`: スレッド待ちビットマスク
//! - `handshake`: ネットワーク停止判定とエポック終了の突き合わせ
//! - `watchdog`: 進捗監視

mod barrier;
mod handshake;
mod queue;
mod scoreboard;
mod watchdog;

pub use barrier::{ThreadBarrier, thread};
pub use handshake::NetStopHandshake;
pub use queue::{PacketQueue, QueueFull, capacity};
pub use scoreboard::{Scoreboard, UnitScoreboard};
pub use watchdog::{Progress, Watchdog};
