//! 経路表
//!
//! キーの上位 16bit（[`ROUTE_MASK`](crate::packet::ROUTE_MASK)）を経路番号として宛先コアを引く。
//! 経路番号は送信元コアの送信ストリームごとに 1 つ割り当てる。

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::error::ConfigError;
use crate::packet::{PacketKey, ROUTE_SHIFT};

type Destinations = SmallVec<[usize; 8]>;

#[derive(Debug, Clone)]
pub struct RoutingTable {
    routes: HashMap<u16, Destinations>,
    next_route: u16,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        // 経路 0 は未割り当ての印として使わない
        RoutingTable { routes: HashMap::new(), next_route: 1 }
    }

    /// 新しい経路を確保し、キーの経路プレフィックス（`route << 16`）を返す
    pub fn allocate(&mut self) -> Result<u32, ConfigError> {
        let route = self.next_route;
        self.next_route = route.checked_add(1).ok_or(ConfigError::TooLarge {
            what: "routes",
            value: route as usize + 1,
            limit: u16::MAX as usize,
        })?;
        self.routes.entry(route).or_default();
        Ok((route as u32) << ROUTE_SHIFT)
    }

    /// 経路プレフィックスに宛先を追加する
    pub fn add(&mut self, route_base: u32, dest: usize) {
        let route = (route_base >> ROUTE_SHIFT) as u16;
        let dests = self.routes.entry(route).or_default();
        if !dests.contains(&dest) {
            dests.push(dest);
        }
    }

    pub fn destinations(&self, key: PacketKey) -> &[usize] {
        self.routes.get(&key.route()).map(|d| d.as_slice()).unwrap_or(&[])
    }

    /// 確保済みの経路数
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> RoutingTable {
        RoutingTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    #[test]
    fn test_allocate_and_route() {
        let mut table = RoutingTable::new();
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(a, 1 << ROUTE_SHIFT);
        table.add(a, 3);
        table.add(a, 5);
        table.add(a, 3);
        let key = PacketKey::new(a, PacketType::Data).with_index(7);
        assert_eq!(table.destinations(key), &[3, 5]);
        assert!(table.destinations(PacketKey::new(b, PacketType::Stop)).is_empty());
        assert_eq!(table.len(), 2);
    }
}
