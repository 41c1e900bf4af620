//! 有界パケットキュー
//!
//! 受信割り込み側だけが `tail` を進め、バックグラウンドの消費側だけが `head` を進める
//! リングバッファ。満杯は設計時の容量不足を意味するので回復しない。

use crate::packet::Packet;

/// キュー満杯
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("packet queue full (capacity {capacity})")]
pub struct QueueFull {
    pub capacity: usize,
}

/// 役割ごとの既定容量
pub mod capacity {
    pub const THRESHOLD: usize = 256;
    pub const WEIGHT: usize = 512;
    pub const SUM: usize = 2048;
    pub const INPUT: usize = 512;
}

/// 単一生産者・単一消費者のリングバッファ
#[derive(Debug, Clone)]
pub struct PacketQueue {
    slots: Box<[Packet]>,
    head: usize,
    tail: usize,
}

impl PacketQueue {
    /// `capacity` 個まで格納できるキュー（番兵として 1 スロット余分に確保する）
    pub fn with_capacity(capacity: usize) -> PacketQueue {
        PacketQueue {
            slots: vec![Packet::default(); capacity + 1].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    /// 末尾に追加する
    pub fn enqueue(&mut self, packet: Packet) -> Result<(), QueueFull> {
        let next = (self.tail + 1) % self.slots.len();
        if next == self.head {
            return Err(QueueFull { capacity: self.capacity() });
        }
        self.slots[self.tail] = packet;
        self.tail = next;
        Ok(())
    }

    /// 先頭を取り出す
    pub fn dequeue(&mut self) -> Option<Packet> {
        if self.is_empty() {
            return None;
        }
        let packet = self.slots[self.head];
        self.head = (self.head + 1) % self.slots.len();
        Some(packet)
    }

    /// 全要素を取り出す
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(p) = self.dequeue() {
            out.push(p);
        }
        out
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}
