//! Bitmap over replica slots, used for vote and acknowledgement counting.

use std::fmt;

use crate::utils::KvError;

use fixedbitset::FixedBitSet;

/// Compact slot -> bool mapping. Slots are positions in a range
/// descriptor's replica list, not replica IDs.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates an all-false bitmap of given size.
    pub fn new(size: usize) -> Self {
        Bitmap(FixedBitSet::with_capacity(size))
    }

    /// Creates a bitmap of given size with the listed slots set.
    pub fn from_slots(size: usize, slots: &[usize]) -> Result<Self, KvError> {
        let mut map = Self::new(size);
        for &slot in slots {
            map.set(slot, true)?;
        }
        Ok(map)
    }

    #[inline]
    pub fn set(&mut self, slot: usize, flag: bool) -> Result<(), KvError> {
        if slot >= self.0.len() {
            return Err(KvError::msg(format!(
                "slot {} out of bound {}",
                slot,
                self.0.len()
            )));
        }
        self.0.set(slot, flag);
        Ok(())
    }

    #[inline]
    pub fn get(&self, slot: usize) -> bool {
        slot < self.0.len() && self.0[slot]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones(..)
    }

    /// True once strictly more than half of the slots are set.
    #[inline]
    pub fn has_majority(&self) -> bool {
        self.count() * 2 > self.size()
    }

    /// Clears every slot.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Iterates over the set slots in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.ones()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; {:?}}}", self.size(), self.ones().collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    fn set_get() {
        let mut map = Bitmap::new(3);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(3, true).is_err());
        assert!(map.get(0));
        assert!(!map.get(1));
        assert!(!map.get(7));
    }

    #[test]
    fn majority() -> Result<(), KvError> {
        let mut map = Bitmap::from_slots(3, &[1])?;
        assert!(!map.has_majority());
        map.set(2, true)?;
        assert!(map.has_majority());
        assert_eq!(map.ones().collect::<Vec<_>>(), vec![1, 2]);
        map.clear();
        assert_eq!(map.count(), 0);
        assert!(Bitmap::from_slots(1, &[0])?.has_majority());
        Ok(())
    }

    #[test]
    fn debug_format() -> Result<(), KvError> {
        let map = Bitmap::from_slots(5, &[0, 3])?;
        assert_eq!(format!("{:?}", map), "{5; [0, 3]}");
        Ok(())
    }
}
