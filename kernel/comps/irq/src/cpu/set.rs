// SPDX-License-Identifier: MPL-2.0

//! This module contains the implementation of the CPU set used for interrupt affinity.

use core::fmt;

use smallvec::SmallVec;

use super::CpuId;

/// A subset of the CPUs in the system.
///
/// Unlike a bare bitmap, two sets compare equal whenever they contain the same
/// CPUs, no matter how many trailing empty parts either of them carries.
#[derive(Clone, Default)]
pub struct CpuSet {
    // A bitset representing the CPUs in the system.
    bits: SmallVec<[InnerPart; NR_PARTS_NO_ALLOC]>,
}

type InnerPart = u64;

const BITS_PER_PART: usize = InnerPart::BITS as usize;
const NR_PARTS_NO_ALLOC: usize = 2;

// The highest CPU number a parsed list may name.
const MAX_LISTED_CPU: u32 = u16::MAX as u32;

const fn part_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() / BITS_PER_PART
}

const fn bit_idx(cpu_id: CpuId) -> usize {
    cpu_id.as_usize() % BITS_PER_PART
}

const fn parts_for_cpus(num_cpus: usize) -> usize {
    num_cpus.div_ceil(BITS_PER_PART)
}

impl CpuSet {
    /// Creates a new `CpuSet` containing CPUs `0..num_cpus`.
    pub fn new_full(num_cpus: usize) -> Self {
        let num_parts = parts_for_cpus(num_cpus);
        let mut bits = SmallVec::with_capacity(num_parts);
        bits.resize(num_parts, !0);
        if num_cpus % BITS_PER_PART != 0 {
            bits[num_parts - 1] &= (1 << (num_cpus % BITS_PER_PART)) - 1;
        }
        Self { bits }
    }

    /// Creates a new `CpuSet` with no CPUs.
    pub fn new_empty() -> Self {
        Self {
            bits: SmallVec::new(),
        }
    }

    /// Parses a CPU list such as `0-3,8,10-11`.
    ///
    /// Returns `None` if the list is malformed or names a CPU above 65535.
    /// An empty string yields an empty set.
    pub fn parse_list(list: &str) -> Option<Self> {
        let mut set = Self::new_empty();
        for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (first, last) = match item.split_once('-') {
                Some((first, last)) => (first.trim().parse().ok()?, last.trim().parse().ok()?),
                None => {
                    let cpu = item.parse().ok()?;
                    (cpu, cpu)
                }
            };
            if first > last || last > MAX_LISTED_CPU {
                return None;
            }
            for raw in first..=last {
                set.add(CpuId::new(raw));
            }
        }
        Some(set)
    }

    /// Adds a CPU to the set.
    pub fn add(&mut self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx >= self.bits.len() {
            self.bits.resize(part_idx + 1, 0);
        }
        self.bits[part_idx] |= 1 << bit_idx;
    }

    /// Removes a CPU from the set.
    pub fn remove(&mut self, cpu_id: CpuId) {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        if part_idx < self.bits.len() {
            self.bits[part_idx] &= !(1 << bit_idx);
        }
    }

    /// Returns true if the set contains the specified CPU.
    pub fn contains(&self, cpu_id: CpuId) -> bool {
        let part_idx = part_idx(cpu_id);
        let bit_idx = bit_idx(cpu_id);
        part_idx < self.bits.len() && (self.bits[part_idx] & (1 << bit_idx)) != 0
    }

    /// Returns the number of CPUs in the set.
    pub fn count(&self) -> usize {
        self.bits
            .iter()
            .map(|part| part.count_ones() as usize)
            .sum()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|part| *part == 0)
    }

    /// Removes all CPUs from the set.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    /// Returns the CPUs contained in both `self` and `other`.
    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        let bits = self
            .bits
            .iter()
            .zip(other.bits.iter())
            .map(|(a, b)| a & b)
            .collect();
        CpuSet { bits }
    }

    /// Returns the CPUs contained in `self` but not in `other`.
    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        let bits = self
            .bits
            .iter()
            .enumerate()
            .map(|(idx, part)| part & !other.bits.get(idx).copied().unwrap_or(0))
            .collect();
        CpuSet { bits }
    }

    /// Returns true if `self` and `other` have at least one CPU in common.
    pub fn intersects(&self, other: &CpuSet) -> bool {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Returns true if every CPU in `self` is also in `other`.
    pub fn is_subset(&self, other: &CpuSet) -> bool {
        self.bits
            .iter()
            .enumerate()
            .all(|(idx, part)| part & !other.bits.get(idx).copied().unwrap_or(0) == 0)
    }

    /// Returns the lowest-numbered CPU of the set, if any.
    pub fn first(&self) -> Option<CpuId> {
        self.iter().next()
    }

    /// Iterates over the CPUs in the set.
    ///
    /// The order of the iteration is guaranteed to be in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.bits.iter().enumerate().flat_map(|(part_idx, &part)| {
            (0..BITS_PER_PART).filter_map(move |bit_idx| {
                if (part & (1 << bit_idx)) != 0 {
                    Some(CpuId::new((part_idx * BITS_PER_PART + bit_idx) as u32))
                } else {
                    None
                }
            })
        })
    }
}

impl PartialEq for CpuSet {
    fn eq(&self, other: &Self) -> bool {
        let len = self.bits.len().max(other.bits.len());
        (0..len).all(|idx| {
            self.bits.get(idx).copied().unwrap_or(0) == other.bits.get(idx).copied().unwrap_or(0)
        })
    }
}

impl Eq for CpuSet {}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|cpu| cpu.as_u32())).finish()
    }
}

impl From<CpuId> for CpuSet {
    fn from(cpu_id: CpuId) -> Self {
        let mut set = Self::new_empty();
        set.add(cpu_id);
        set
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = Self::new_empty();
        for cpu_id in iter {
            set.add(cpu_id);
        }
        set
    }
}

#[cfg(test)]
mod test {
    use alloc::vec::Vec;

    use super::*;

    fn cpus(ids: &[u32]) -> CpuSet {
        ids.iter().copied().map(CpuId::new).collect()
    }

    #[test]
    fn full_cpu_set_iter_is_all() {
        let set = CpuSet::new_full(70);
        let set_cpus = set.iter().map(|cpu| cpu.as_u32()).collect::<Vec<_>>();
        assert_eq!(set_cpus, (0..70).collect::<Vec<_>>());
        assert_eq!(set.count(), 70);
    }

    #[test]
    fn empty_cpu_set_contains_none() {
        let set = CpuSet::new_empty();
        assert!(set.is_empty());
        assert!(!set.contains(CpuId::new(0)));
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    fn equality_ignores_trailing_parts() {
        let mut wide = cpus(&[1, 100]);
        wide.remove(CpuId::new(100));
        assert_eq!(wide, cpus(&[1]));
    }

    #[test]
    fn intersection_and_subset() {
        let a = cpus(&[0, 2, 3, 65]);
        let b = cpus(&[2, 65, 70]);
        assert_eq!(a.intersection(&b), cpus(&[2, 65]));
        assert_eq!(a.difference(&b), cpus(&[0, 3]));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&cpus(&[1])));
        assert!(cpus(&[2, 65]).is_subset(&a));
        assert!(!b.is_subset(&a));
    }

    #[test]
    fn parse_cpu_list() {
        assert_eq!(CpuSet::parse_list("0-2,5"), Some(cpus(&[0, 1, 2, 5])));
        assert_eq!(CpuSet::parse_list(""), Some(CpuSet::new_empty()));
        assert_eq!(CpuSet::parse_list("3-1"), None);
        assert_eq!(CpuSet::parse_list("x"), None);
        assert_eq!(CpuSet::parse_list("0-4000000000"), None);
        assert_eq!(CpuSet::parse_list("65536"), None);
        assert!(CpuSet::parse_list("65535").is_some());
    }
}
