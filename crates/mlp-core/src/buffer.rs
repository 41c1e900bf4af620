//! tick 境界で切り替わるバッファ
//!
//! - [`DoubleBuffer`]: `current`（処理側が読む）と `next`（受信側が書く）の 2 面
//! - [`TickHistory`]: ユニット × tick の履歴（FORWARD で書き、BACKPROP で読み戻す）

/// 2 面バッファ
///
/// 面の切り替えは [`DoubleBuffer::swap`] の 1 か所だけで行う。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleBuffer<T> {
    banks: [Vec<T>; 2],
    current: usize,
}

impl<T: Clone> DoubleBuffer<T> {
    pub fn new(len: usize, init: T) -> DoubleBuffer<T> {
        DoubleBuffer { banks: [vec![init.clone(); len], vec![init; len]], current: 0 }
    }

    #[inline]
    pub fn current(&self) -> &[T] {
        &self.banks[self.current]
    }

    #[inline]
    pub fn next(&self) -> &[T] {
        &self.banks[1 - self.current]
    }

    #[inline]
    pub fn next_mut(&mut self) -> &mut [T] {
        &mut self.banks[1 - self.current]
    }

    /// 面を入れ替える
    #[inline]
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// 両面を同じ値で埋める
    pub fn fill(&mut self, value: T) {
        self.banks[0].fill(value.clone());
        self.banks[1].fill(value);
    }

    pub fn len(&self) -> usize {
        self.banks[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks[0].is_empty()
    }
}

/// ユニット × tick の履歴
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickHistory<T> {
    num_units: usize,
    data: Vec<T>,
}

impl<T: Copy> TickHistory<T> {
    /// `num_ticks` 個の tick（0 始まり）を保持する
    pub fn new(num_units: usize, num_ticks: usize, init: T) -> TickHistory<T> {
        TickHistory { num_units, data: vec![init; num_units * num_ticks] }
    }

    #[inline]
    pub fn store(&mut self, tick: u32, unit: usize, value: T) {
        let i = self.slot(tick, unit);
        self.data[i] = value;
    }

    #[inline]
    pub fn get(&self, tick: u32, unit: usize) -> T {
        self.data[self.slot(tick, unit)]
    }

    /// `tick` の全ユニット分
    pub fn row(&self, tick: u32) -> &[T] {
        let start = tick as usize * self.num_units;
        &self.data[start..start + self.num_units]
    }

    /// `tick` の全ユニット分を書き込む
    pub fn store_row(&mut self, tick: u32, values: &[T]) {
        let start = tick as usize * self.num_units;
        self.data[start..start + self.num_units].copy_from_slice(values);
    }

    #[inline]
    fn slot(&self, tick: u32, unit: usize) -> usize {
        debug_assert!(unit < self.num_units);
        tick as usize * self.num_units + unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_buffer_swap() {
        let mut b = DoubleBuffer::new(2, 0i32);
        b.next_mut()[0] = 7;
        assert_eq!(b.current(), &[0, 0]);
        b.swap();
        assert_eq!(b.current(), &[7, 0]);
        assert_eq!(b.next(), &[0, 0]);
        b.fill(3);
        assert_eq!(b.current(), &[3, 3]);
        assert_eq!(b.next(), &[3, 3]);
    }

    #[test]
    fn test_history_rows() {
        let mut h = TickHistory::new(3, 4, 0i32);
        h.store(2, 1, 5);
        assert_eq!(h.get(2, 1), 5);
        h.store_row(0, &[1, 2, 3]);
        assert_eq!(h.row(0), &[1, 2, 3]);
        assert_eq!(h.row(2), &[0, 5, 0]);
        h.store_row(3, &[7, 8, 9]);
        assert_eq!(h.row(3), &[7, 8, 9]);
    }
}
