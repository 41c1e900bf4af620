//! マルチキャストパケット
//!
//! 32bit キー + 32bit ペイロード。ペイロードは段ごとに対応する固定小数点型として
//! 再解釈される。

mod key;

pub use key::{
    COLOUR_SHIFT, FLAG_SHIFT, INDEX_MASK, KeyError, MAX_UNITS, PHASE_SHIFT, PacketKey, PacketType,
    ROUTE_MASK, ROUTE_SHIFT, TYPE_MASK, TYPE_SHIFT,
};

/// パケット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub key: PacketKey,
    pub payload: u32,
}

impl Packet {
    #[inline]
    pub const fn new(key: PacketKey, payload: u32) -> Packet {
        Packet { key, payload }
    }

    /// ペイロードなしの制御パケット
    #[inline]
    pub const fn control(key: PacketKey) -> Packet {
        Packet { key, payload: 0 }
    }

    /// 符号付き 32bit 値として読む
    #[inline]
    pub const fn value(&self) -> i32 {
        self.payload as i32
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::control(PacketKey::from_raw(0))
    }
}
