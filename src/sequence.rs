/// Sequence storage backing table columns.
///
/// A Sequence is the lowest-level storage for raw values. Two implementations:
/// - ArraySequence: contiguous array, O(1) access, O(N) insert/delete
/// - TieredVectorSequence: bounded blocks, O(N / B) lookup, O(B) insert/delete
///
/// View target tables see a steady mix of in-place updates and deletes from the
/// middle, which is the workload the tiered layout is for.

use crate::error::{Result, ViewError};
use std::fmt::Debug;

fn out_of_range(index: usize, len: usize) -> ViewError {
    ViewError::Storage(format!("Index {} out of range [0, {})", index, len))
}

/// Trait for sequence storage operations
pub trait Sequence<T: Clone> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get value at index (0-based), cloned
    fn get(&self, index: usize) -> Result<T>;

    fn get_ref(&self, index: usize) -> Option<&T>;

    fn set(&mut self, index: usize, value: T) -> Result<()>;

    /// Insert value at index, shifting subsequent elements
    fn insert(&mut self, index: usize, value: T) -> Result<()>;

    /// Delete and return value at index
    fn delete(&mut self, index: usize) -> Result<T>;

    fn append(&mut self, value: T);

    fn iter(&self) -> Box<dyn Iterator<Item = T> + '_>;
}

/// Contiguous array implementation.
#[derive(Debug, Clone)]
pub struct ArraySequence<T: Clone> {
    data: Vec<T>,
}

impl<T: Clone> ArraySequence<T> {
    pub fn new() -> Self {
        ArraySequence { data: Vec::new() }
    }
}

impl<T: Clone> Default for ArraySequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Debug> Sequence<T> for ArraySequence<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn get(&self, index: usize) -> Result<T> {
        self.data
            .get(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, self.data.len()))
    }

    fn get_ref(&self, index: usize) -> Option<&T> {
        self.data.get(index)
    }

    fn set(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.data.len();
        let slot = self.data.get_mut(index).ok_or_else(|| out_of_range(index, len))?;
        *slot = value;
        Ok(())
    }

    fn insert(&mut self, index: usize, value: T) -> Result<()> {
        if index > self.data.len() {
            return Err(out_of_range(index, self.data.len() + 1));
        }
        self.data.insert(index, value);
        Ok(())
    }

    fn delete(&mut self, index: usize) -> Result<T> {
        if index >= self.data.len() {
            return Err(out_of_range(index, self.data.len()));
        }
        Ok(self.data.remove(index))
    }

    fn append(&mut self, value: T) {
        self.data.push(value);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = T> + '_> {
        Box::new(self.data.iter().cloned())
    }
}

/// Blocked sequence: values live in a list of bounded blocks so inserts and
/// deletes only shift elements inside one block.
///
/// Invariants: no block is empty, no block exceeds `block_capacity`, and the
/// concatenation of the blocks is the logical sequence.
#[derive(Debug, Clone)]
pub struct TieredVectorSequence<T: Clone> {
    blocks: Vec<Vec<T>>,
    block_capacity: usize,
    size: usize,
}

impl<T: Clone> TieredVectorSequence<T> {
    const DEFAULT_BLOCK_CAPACITY: usize = 256;

    pub fn new() -> Self {
        Self::with_block_capacity(Self::DEFAULT_BLOCK_CAPACITY)
    }

    /// Create with a specific block capacity (minimum 2).
    pub fn with_block_capacity(block_capacity: usize) -> Self {
        TieredVectorSequence {
            blocks: Vec::new(),
            block_capacity: block_capacity.max(2),
            size: 0,
        }
    }

    /// Number of blocks currently allocated.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Locate (block, offset) for a logical index.
    fn locate(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.size {
            return None;
        }
        let mut remaining = index;
        for (block_idx, block) in self.blocks.iter().enumerate() {
            if remaining < block.len() {
                return Some((block_idx, remaining));
            }
            remaining -= block.len();
        }
        None
    }

    fn split_if_full(&mut self, block_idx: usize) {
        if self.blocks[block_idx].len() > self.block_capacity {
            let mid = self.blocks[block_idx].len() / 2;
            let tail = self.blocks[block_idx].split_off(mid);
            self.blocks.insert(block_idx + 1, tail);
        }
    }
}

impl<T: Clone> Default for TieredVectorSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Debug> Sequence<T> for TieredVectorSequence<T> {
    fn len(&self) -> usize {
        self.size
    }

    fn get(&self, index: usize) -> Result<T> {
        self.get_ref(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, self.size))
    }

    fn get_ref(&self, index: usize) -> Option<&T> {
        self.locate(index)
            .map(|(block_idx, offset)| &self.blocks[block_idx][offset])
    }

    fn set(&mut self, index: usize, value: T) -> Result<()> {
        let (block_idx, offset) = self
            .locate(index)
            .ok_or_else(|| out_of_range(index, self.size))?;
        self.blocks[block_idx][offset] = value;
        Ok(())
    }

    fn insert(&mut self, index: usize, value: T) -> Result<()> {
        if index > self.size {
            return Err(out_of_range(index, self.size + 1));
        }
        if index == self.size {
            self.append(value);
            return Ok(());
        }
        let (block_idx, offset) = self
            .locate(index)
            .ok_or_else(|| out_of_range(index, self.size))?;
        self.blocks[block_idx].insert(offset, value);
        self.size += 1;
        self.split_if_full(block_idx);
        Ok(())
    }

    fn delete(&mut self, index: usize) -> Result<T> {
        let (block_idx, offset) = self
            .locate(index)
            .ok_or_else(|| out_of_range(index, self.size))?;
        let value = self.blocks[block_idx].remove(offset);
        self.size -= 1;
        if self.blocks[block_idx].is_empty() {
            self.blocks.remove(block_idx);
        }
        Ok(value)
    }

    fn append(&mut self, value: T) {
        match self.blocks.last_mut() {
            Some(last) if last.len() < self.block_capacity => last.push(value),
            _ => self.blocks.push(vec![value]),
        }
        self.size += 1;
    }

    fn iter(&self) -> Box<dyn Iterator<Item = T> + '_> {
        Box::new(self.blocks.iter().flat_map(|block| block.iter().cloned()))
    }
}
