//! 終了コードとエラー型

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::packet::KeyError;
use crate::sync::QueueFull;

/// ステージ終了時にコアが外部へ返す状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCode {
    NoError = 0,
    MemUnavailable = 1,
    QueueFull = 2,
    Timeout = 3,
    UnexpectedPacket = 4,
    ConfigUnavailable = 5,
    CoreTypeMismatch = 6,
}

impl ExitCode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, ExitCode::NoError)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitCode::NoError => "NO_ERROR",
            ExitCode::MemUnavailable => "MEM_UNAVAILABLE",
            ExitCode::QueueFull => "QUEUE_FULL",
            ExitCode::Timeout => "TIMEOUT",
            ExitCode::UnexpectedPacket => "UNEXPECTED_PACKET",
            ExitCode::ConfigUnavailable => "CONFIG_UNAVAILABLE",
            ExitCode::CoreTypeMismatch => "CORE_TYPE_MISMATCH",
        };
        f.write_str(s)
    }
}

/// 設定の検証エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{what}: {value} exceeds limit {limit}")]
    TooLarge { what: &'static str, value: usize, limit: usize },

    #[error("{what} must be non-zero")]
    Zero { what: &'static str },

    #[error("{what}: expected {expected} values, got {actual}")]
    Length { what: &'static str, expected: usize, actual: usize },

    #[error("logistic stage must be first in the output pipeline")]
    LogisticNotFirst,

    #[error("configuration for {expected:?} core given to {actual:?} core")]
    RoleMismatch { expected: crate::types::CoreRole, actual: crate::types::CoreRole },

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("invalid network description: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// コアが外部へ報告する終了コード
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ConfigError::RoleMismatch { .. } => ExitCode::CoreTypeMismatch,
            _ => ExitCode::ConfigUnavailable,
        }
    }
}

/// コア内部で発生する致命的エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("unexpected {what} packet {key}")]
    Unexpected { what: &'static str, key: crate::packet::PacketKey },

    #[error("watchdog expired")]
    Timeout,
}

impl CoreError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CoreError::QueueFull(_) => ExitCode::QueueFull,
            CoreError::Key(_) | CoreError::Unexpected { .. } => ExitCode::UnexpectedPacket,
            CoreError::Timeout => ExitCode::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitCode::NoError.code(), 0);
        assert_eq!(ExitCode::CoreTypeMismatch.code(), 6);
        assert_eq!(ExitCode::Timeout.to_string(), "TIMEOUT");
    }

    #[test]
    fn test_error_mapping() {
        let e = CoreError::from(QueueFull { capacity: 4 });
        assert_eq!(e.exit_code(), ExitCode::QueueFull);
        assert_eq!(e.to_string(), "packet queue full (capacity 4)");
        let e = ConfigError::RoleMismatch {
            expected: crate::types::CoreRole::Sum,
            actual: crate::types::CoreRole::Weight,
        };
        assert_eq!(e.exit_code(), ExitCode::CoreTypeMismatch);
        assert_eq!(ConfigError::LogisticNotFirst.exit_code(), ExitCode::ConfigUnavailable);
    }
}
