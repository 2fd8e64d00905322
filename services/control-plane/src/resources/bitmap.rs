//! Fixed-length bitmap of allocated unit indexes for discrete providers.

/// Bit `i` is set when unit `i` of the provider is allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBitmap {
    words: Vec<u64>,
    len: u64,
}

impl IndexBitmap {
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; word_count(len)],
            len,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    pub fn is_set(&self, index: u64) -> bool {
        index < self.len && self.words[(index / 64) as usize] & bit(index) != 0
    }

    /// Set `index`. Returns false if it is out of range or already set.
    pub fn set(&mut self, index: u64) -> bool {
        if index >= self.len || self.is_set(index) {
            return false;
        }
        self.words[(index / 64) as usize] |= bit(index);
        true
    }

    /// Clear `index`. Returns false if it was not set.
    pub fn clear(&mut self, index: u64) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.words[(index / 64) as usize] &= !bit(index);
        true
    }

    /// Lowest unset index.
    pub fn first_clear(&self) -> Option<u64> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i as u64 * 64 + u64::from(w.trailing_ones()))
            .filter(|&index| index < self.len)
    }

    /// Set the `n` lowest unset indexes and return them, or change nothing
    /// if fewer than `n` are free.
    pub fn take_lowest(&mut self, n: u64) -> Option<Vec<u64>> {
        if self.len - self.count_ones() < n {
            return None;
        }
        let mut taken = Vec::with_capacity(n as usize);
        while (taken.len() as u64) < n {
            let index = self.first_clear()?;
            self.set(index);
            taken.push(index);
        }
        Some(taken)
    }

    /// Change the length. Fails, leaving the bitmap untouched, when a set
    /// index would fall off the end.
    pub fn resize(&mut self, len: u64) -> Result<(), u64> {
        if let Some(highest) = self.iter_set().last() {
            if highest >= len {
                return Err(highest);
            }
        }
        self.words.resize(word_count(len), 0);
        self.len = len;
        Ok(())
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(move |&i| self.is_set(i))
    }
}

fn word_count(len: u64) -> usize {
    len.div_ceil(64) as usize
}

fn bit(index: u64) -> u64 {
    1u64 << (index % 64)
}
