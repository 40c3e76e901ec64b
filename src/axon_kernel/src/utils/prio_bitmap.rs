//! Provides [`PrioBitmap`], a two-level bit array structure supporting
//! constant-time highest-set-bit scan operations.
use core::fmt;

use super::Init;

type Word = usize;
const WORD_LEN: usize = Word::BITS as usize;

/// The number of group words needed to track `levels` priority levels.
///
/// Used by the configuration macro to instantiate [`PrioBitmap`].
pub const fn num_bitmap_groups(levels: usize) -> usize {
    (levels + WORD_LEN - 1) / WORD_LEN
}

/// A two-level bit array tracking up to `GROUPS * usize::BITS` priority
/// levels.
///
/// `group_mask` summarizes the group words: bit *g* of `group_mask` is set
/// iff `groups[g]` is non-zero. Both levels are maintained on every update,
/// so when only one group is needed the top level degenerates to a single
/// always-consistent word and the scan takes a single bit search.
///
/// All methods panic when the given bit position is out of range.
#[derive(Clone, Copy)]
pub struct PrioBitmap<const GROUPS: usize> {
    // Invariant: `group_mask & (1 << g) != 0` ⇔ `groups[g] != 0`
    group_mask: Word,
    groups: [Word; GROUPS],
}

impl<const GROUPS: usize> Init for PrioBitmap<GROUPS> {
    const INIT: Self = {
        assert!(GROUPS >= 1 && GROUPS <= WORD_LEN, "too many groups");
        Self {
            group_mask: 0,
            groups: [0; GROUPS],
        }
    };
}

impl<const GROUPS: usize> fmt::Debug for PrioBitmap<GROUPS> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..GROUPS * WORD_LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const GROUPS: usize> PrioBitmap<GROUPS> {
    /// Get the bit at the specified position.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < GROUPS * WORD_LEN);
        self.groups[i / WORD_LEN] & (1 << (i % WORD_LEN)) != 0
    }

    /// Set the bit at the specified position.
    pub fn set(&mut self, i: usize) {
        assert!(i < GROUPS * WORD_LEN);
        self.groups[i / WORD_LEN] |= 1 << (i % WORD_LEN);
        self.group_mask |= 1 << (i / WORD_LEN);
    }

    /// Clear the bit at the specified position. Clears the corresponding
    /// `group_mask` bit when the group becomes zero.
    pub fn clear(&mut self, i: usize) {
        assert!(i < GROUPS * WORD_LEN);
        let group = &mut self.groups[i / WORD_LEN];
        *group &= !(1 << (i % WORD_LEN));
        if *group == 0 {
            self.group_mask &= !(1 << (i / WORD_LEN));
        }
    }

    /// Get a flag indicating whether all bits are unset.
    pub fn is_empty(&self) -> bool {
        self.group_mask == 0
    }

    /// Get the position of the last (highest) set bit.
    ///
    /// The scan compiles down to the CPU's count-leading-zeros path, one word
    /// per level.
    pub fn find_last_set(&self) -> Option<usize> {
        let group_i = find_last_set_word(self.group_mask)?;
        let bit_i = find_last_set_word(self.groups[group_i]);
        // `group_mask` says this group is non-zero
        debug_assert!(bit_i.is_some());
        Some(group_i * WORD_LEN + bit_i?)
    }
}

/// Find the highest set bit of a single word.
#[inline]
fn find_last_set_word(word: Word) -> Option<usize> {
    if word == 0 {
        None
    } else {
        Some(WORD_LEN - 1 - word.leading_zeros() as usize)
    }
}
