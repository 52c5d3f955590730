//! Splitting an ordered job list into sequential batches.

use std::collections::VecDeque;

/// Sizes of the batches `total` jobs are split into.
///
/// With `solo_first` the first job gets a batch of its own. The rest are
/// spread over `groups` batches whose sizes differ by at most one, larger
/// batches first. Empty batches are never produced.
#[must_use]
pub fn batch_sizes(total: usize, groups: usize, solo_first: bool) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut rest = total;

    if solo_first && rest > 0 {
        sizes.push(1);
        rest -= 1;
    }
    if rest == 0 {
        return sizes;
    }

    let groups = groups.clamp(1, rest);
    let base = rest / groups;
    let extra = rest % groups;
    sizes.extend((0..groups).map(|i| base + usize::from(i < extra)));
    sizes
}

/// Collects jobs and hands them out as batches once each batch is full.
#[derive(Debug)]
pub struct BatchAllocator<T> {
    sizes: VecDeque<usize>,
    current: Vec<T>,
}

impl<T> BatchAllocator<T> {
    /// Allocator for `total` jobs over `groups` batches.
    #[must_use]
    pub fn new(total: usize, groups: usize, solo_first: bool) -> Self {
        Self {
            sizes: batch_sizes(total, groups, solo_first).into(),
            current: Vec::new(),
        }
    }

    /// Add a job, returning the batch it completes.
    ///
    /// Jobs pushed beyond the announced total come back as batches of one.
    pub fn push(&mut self, job: T) -> Option<Vec<T>> {
        self.current.push(job);
        let target = self.sizes.front().copied().unwrap_or(1);
        if self.current.len() < target {
            return None;
        }
        self.sizes.pop_front();
        Some(std::mem::take(&mut self.current))
    }

    /// Hand out a partially filled batch, if any.
    pub fn finish(&mut self) -> Option<Vec<T>> {
        self.sizes.clear();
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

/// Split `jobs` into batches in one go.
#[must_use]
pub fn into_batches<T>(jobs: Vec<T>, groups: usize, solo_first: bool) -> Vec<Vec<T>> {
    let mut allocator = BatchAllocator::new(jobs.len(), groups, solo_first);
    let mut batches: Vec<Vec<T>> = jobs.into_iter().filter_map(|j| allocator.push(j)).collect();
    batches.extend(allocator.finish());
    batches
}
