//! パケットキーのビット配置
//!
//! ```text
//!  31            16 15  12  11    10     9    8      0
//! +----------------+------+-----+------+----+--------+
//! |  route prefix  | type |phase|colour|flag| index  |
//! +----------------+------+-----+------+----+--------+
//! ```
//!
//! - `route prefix`: 送信元ごとに割り当てられる経路キー（ファブリックはここだけを見る）
//! - `type`: [`PacketType`]
//! - `phase`: 0 = FORWARD, 1 = BACKPROP
//! - `colour`: 送信時点のステップのパリティ（ダブルバッファのバンク選択）
//! - `flag`: STOP / CRIT / STPN の判定値、DLRV の abort 指示
//! - `index`: ユニット番号（`MAX_UNITS` 未満）

use thiserror::Error;

use crate::types::Phase;

pub const INDEX_BITS: u32 = 9;
pub const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// 1 コアあたりの最大ユニット数
pub const MAX_UNITS: usize = 256;
pub const FLAG_SHIFT: u32 = 9;
pub const COLOUR_SHIFT: u32 = 10;
pub const PHASE_SHIFT: u32 = 11;
pub const TYPE_SHIFT: u32 = 12;
pub const TYPE_MASK: u32 = 0xf << TYPE_SHIFT;
pub const ROUTE_SHIFT: u32 = 16;
pub const ROUTE_MASK: u32 = 0xffff << ROUTE_SHIFT;

/// パケット種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// ネット・出力・誤差・デルタ
    Data = 0,
    /// 同期（このプロファイルでは生成しない）
    Sync = 1,
    /// link delta 和のグループ合計（集約 Sum コア宛）
    LdsTotal = 2,
    /// link delta 和の部分和（Weight → Sum）
    LdsPartial = 3,
    /// link delta 和の最終結果（全 Weight コアへ放送）
    LdsResult = 4,
    /// 停止判定のデイジーチェーン
    Criterion = 5,
    /// ネットワーク停止判定
    NetStop = 6,
    /// tick 停止判定
    Stop = 7,
    /// FORWARD 同期生成（このプロファイルでは生成しない）
    ForwardSyncGen = 8,
    /// BACKPROP 同期生成（このプロファイルでは生成しない）
    BackpropSyncGen = 9,
    /// デッドロック回復
    DeadlockRecovery = 15,
}

impl PacketType {
    /// 4bit コードから復元
    pub fn from_code(code: u32) -> Result<PacketType, KeyError> {
        Ok(match code {
            0 => PacketType::Data,
            1 => PacketType::Sync,
            2 => PacketType::LdsTotal,
            3 => PacketType::LdsPartial,
            4 => PacketType::LdsResult,
            5 => PacketType::Criterion,
            6 => PacketType::NetStop,
            7 => PacketType::Stop,
            8 => PacketType::ForwardSyncGen,
            9 => PacketType::BackpropSyncGen,
            15 => PacketType::DeadlockRecovery,
            other => return Err(KeyError::UnknownType(other)),
        })
    }
}

/// キー復号エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("unknown packet type code {0}")]
    UnknownType(u32),
    #[error("unit index {index} out of range (num_units = {num_units})")]
    IndexOutOfRange { index: usize, num_units: usize },
}

/// 型付きパケットキー
///
/// ワイヤ互換の 32bit 表現を保持し、各フィールドへは名前付きアクセサで触る。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PacketKey(u32);

impl PacketKey {
    /// 生の 32bit 値から
    #[inline]
    pub const fn from_raw(raw: u32) -> PacketKey {
        PacketKey(raw)
    }

    /// 経路プレフィックス（`route << 16`）と種別からキーを作る
    #[inline]
    pub const fn new(route_base: u32, kind: PacketType) -> PacketKey {
        PacketKey((route_base & ROUTE_MASK) | ((kind as u32) << TYPE_SHIFT))
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn with_phase(self, phase: Phase) -> PacketKey {
        PacketKey((self.0 & !(1 << PHASE_SHIFT)) | ((phase as u32) << PHASE_SHIFT))
    }

    #[inline]
    pub const fn with_colour(self, colour: bool) -> PacketKey {
        PacketKey((self.0 & !(1 << COLOUR_SHIFT)) | ((colour as u32) << COLOUR_SHIFT))
    }

    #[inline]
    pub const fn with_flag(self, flag: bool) -> PacketKey {
        PacketKey((self.0 & !(1 << FLAG_SHIFT)) | ((flag as u32) << FLAG_SHIFT))
    }

    /// ユニット番号を埋め込む（`MAX_UNITS` 以上は呼び出し側の責務で弾く）
    #[inline]
    pub const fn with_index(self, index: usize) -> PacketKey {
        PacketKey((self.0 & !INDEX_MASK) | (index as u32 & INDEX_MASK))
    }

    /// 経路番号（上位 16bit）
    #[inline]
    pub const fn route(self) -> u16 {
        (self.0 >> ROUTE_SHIFT) as u16
    }

    #[inline]
    pub fn kind(self) -> Result<PacketType, KeyError> {
        PacketType::from_code((self.0 & TYPE_MASK) >> TYPE_SHIFT)
    }

    #[inline]
    pub const fn phase(self) -> Phase {
        Phase::from_bit(self.0 & (1 << PHASE_SHIFT) != 0)
    }

    #[inline]
    pub const fn colour(self) -> bool {
        self.0 & (1 << COLOUR_SHIFT) != 0
    }

    #[inline]
    pub const fn flag(self) -> bool {
        self.0 & (1 << FLAG_SHIFT) != 0
    }

    #[inline]
    pub const fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// ユニット番号を範囲検査付きで取り出す
    pub fn checked_index(self, num_units: usize) -> Result<usize, KeyError> {
        let index = self.index();
        if index < num_units {
            Ok(index)
        } else {
            Err(KeyError::IndexOutOfRange { index, num_units })
        }
    }
}

impl std::fmt::Display for PacketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_masks_are_disjoint() {
        let masks = [
            INDEX_MASK,
            1 << FLAG_SHIFT,
            1 << COLOUR_SHIFT,
            1 << PHASE_SHIFT,
            TYPE_MASK,
            ROUTE_MASK,
        ];
        let mut seen = 0u32;
        for m in masks {
            assert_eq!(seen & m, 0, "mask {m:08x} overlaps");
            seen |= m;
        }
        // index は flag ビットと重ならない範囲でしか使わない
        assert!(MAX_UNITS as u32 <= 1 << FLAG_SHIFT);
    }

    #[test]
    fn test_compose_and_decode() {
        let key = PacketKey::new(0x002a << ROUTE_SHIFT, PacketType::Data)
            .with_phase(Phase::Backprop)
            .with_colour(true)
            .with_index(201);
        assert_eq!(key.route(), 0x2a);
        assert_eq!(key.kind(), Ok(PacketType::Data));
        assert_eq!(key.phase(), Phase::Backprop);
        assert!(key.colour());
        assert!(!key.flag());
        assert_eq!(key.index(), 201);
        assert_eq!(key.checked_index(202), Ok(201));
        assert!(key.checked_index(201).is_err());
    }

    #[test]
    fn test_setters_overwrite() {
        let key =
            PacketKey::new(1 << ROUTE_SHIFT, PacketType::Stop).with_flag(true).with_colour(true);
        let key = key.with_flag(false).with_colour(false).with_phase(Phase::Forward);
        assert!(!key.flag());
        assert!(!key.colour());
        assert_eq!(key.kind(), Ok(PacketType::Stop));
    }

    #[test]
    fn test_unknown_type_code() {
        let key = PacketKey::from_raw(12 << TYPE_SHIFT);
        assert_eq!(key.kind(), Err(KeyError::UnknownType(12)));
        assert_eq!(PacketKey::from_raw(15 << TYPE_SHIFT).kind(), Ok(PacketType::DeadlockRecovery));
    }
}
