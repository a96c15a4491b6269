//! Bank of independent buzhash-style rolling 32-bit hashes.
//!
//! Each hash owns a 256-entry permutation table; the running state is the
//! cyclic-rotation XOR of table lookups over the current window, so a window
//! can be shifted one byte to the right in O(1) per hash. After rolling in
//! any number of bytes, the state depends only on the last `width` bytes
//! written, which is what lets one pass over a target probe every window
//! position.

use std::collections::VecDeque;
use std::sync::Arc;

/// Fixed seed for table generation. Tables are deterministic across runs so
/// a Bloom sketch built in one stage is probed with identical hashes later.
const TABLE_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// Shared, read-only table set for a bank of `num_hash` hashes.
pub type HashTables = Arc<Vec<[u32; 256]>>;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Generate `num_hash` independent 256-entry tables.
///
/// Each table holds 256 distinct values; a duplicated value would make two
/// byte symbols alias under that hash.
pub fn build_hash_tables(num_hash: usize) -> HashTables {
    let mut tables = Vec::with_capacity(num_hash);
    for j in 0..num_hash {
        let mut state = TABLE_SEED ^ (j as u64).wrapping_mul(0x6a09_e667_f3bc_c909);
        let mut table = [0u32; 256];
        for i in 0..256 {
            loop {
                let x = (splitmix64(&mut state) >> 32) as u32;
                if !table[..i].contains(&x) {
                    table[i] = x;
                    break;
                }
            }
        }
        tables.push(table);
    }
    Arc::new(tables)
}

/// A bank of rolling hashes sharing one byte window.
///
/// Workers hold their own bank (the tables are shared); the window ring and
/// the sum vector are reused across targets to avoid per-target allocation.
pub struct RollingHashBank {
    tables: HashTables,
    sums: Vec<u32>,
    window: VecDeque<u8>,
}

impl RollingHashBank {
    pub fn new(tables: HashTables) -> Self {
        let n = tables.len();
        Self {
            tables,
            sums: vec![0; n],
            window: VecDeque::new(),
        }
    }

    /// Reset every hash to the empty state.
    pub fn reset(&mut self) {
        self.sums.fill(0);
        self.window.clear();
    }

    /// Append bytes to the window. Writing exactly `width` bytes after a
    /// reset initializes the bank for rolling.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            for (sum, table) in self.sums.iter_mut().zip(self.tables.iter()) {
                *sum = sum.rotate_left(1) ^ table[b as usize];
            }
            self.window.push_back(b);
        }
    }

    /// Shift the window right by one byte: `byte` enters, the oldest byte
    /// leaves. Rolling into an empty window degrades to a plain write.
    pub fn roll(&mut self, byte: u8) {
        let Some(out) = self.window.pop_front() else {
            self.write(&[byte]);
            return;
        };
        let width = self.window.len() as u32 + 1;
        for (sum, table) in self.sums.iter_mut().zip(self.tables.iter()) {
            *sum = sum.rotate_left(1) ^ table[out as usize].rotate_left(width) ^ table[byte as usize];
        }
        self.window.push_back(byte);
    }

    /// Current 32-bit sums, one per hash.
    pub fn sums(&self) -> &[u32] {
        &self.sums
    }

    /// Number of hashes in the bank.
    pub fn len(&self) -> usize {
        self.sums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_deterministic_and_collision_free() {
        let a = build_hash_tables(4);
        let b = build_hash_tables(4);
        assert_eq!(a.as_slice(), b.as_slice());
        for table in a.iter() {
            let mut seen = table.to_vec();
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen.len(), 256, "table entries must be distinct");
        }
    }

    #[test]
    fn hashes_in_bank_are_independent() {
        let tables = build_hash_tables(3);
        let mut bank = RollingHashBank::new(tables);
        bank.write(b"ACGTACGTAC");
        let sums = bank.sums().to_vec();
        assert_ne!(sums[0], sums[1]);
        assert_ne!(sums[1], sums[2]);
    }

    #[test]
    fn rolling_matches_fresh_write_at_every_step() {
        // P2: state after write(x[0..w]) + k rolls equals a fresh write of the
        // corresponding length-w substring, bit for bit.
        for w in [4usize, 15, 40] {
            let data: Vec<u8> = (0..200u32)
                .map(|i| b"ACGTX"[(i.wrapping_mul(2654435761) % 5) as usize])
                .collect();
            let tables = build_hash_tables(5);

            let mut rolled = RollingHashBank::new(tables.clone());
            rolled.write(&data[..w]);
            let mut fresh = RollingHashBank::new(tables.clone());
            fresh.write(&data[..w]);
            assert_eq!(rolled.sums(), fresh.sums());

            for j in w..data.len() {
                rolled.roll(data[j]);
                fresh.reset();
                fresh.write(&data[j + 1 - w..j + 1]);
                assert_eq!(rolled.sums(), fresh.sums(), "width {w} position {j}");
            }
        }
    }

    #[test]
    fn reset_restores_empty_state() {
        let tables = build_hash_tables(2);
        let mut bank = RollingHashBank::new(tables);
        bank.write(b"ACGT");
        bank.reset();
        assert_eq!(bank.sums(), &[0, 0]);
        bank.write(b"TTTT");
        let first = bank.sums().to_vec();
        bank.reset();
        bank.write(b"TTTT");
        assert_eq!(bank.sums(), first.as_slice());
    }
}
