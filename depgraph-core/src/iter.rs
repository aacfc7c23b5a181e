//! Plan traversal.
//!
//! [`LevelIterator`] yields the top-level projects of a plan in
//! non-decreasing level order (submodules are skipped; they are rendered
//! and scheduled through their parent's group). [`PeekingIterator`] adds
//! one-element lookahead so consumers can detect level boundaries without
//! consuming past them.

use crate::types::Project;

/// Non-submodule projects ordered by `(level, id)`.
pub struct LevelIterator<'a> {
    inner: std::vec::IntoIter<&'a Project>,
}

impl<'a> LevelIterator<'a> {
    pub(crate) fn new(projects: impl Iterator<Item = &'a Project>) -> Self {
        let mut top_level: Vec<&Project> = projects.filter(|p| !p.is_submodule).collect();
        top_level.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.id.cmp(&b.id)));
        Self {
            inner: top_level.into_iter(),
        }
    }

    pub fn peeking(self) -> PeekingIterator<Self> {
        PeekingIterator::new(self)
    }
}

impl<'a> Iterator for LevelIterator<'a> {
    type Item = &'a Project;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// One-element lookahead over any iterator. `peek` buffers at most one
/// item; a buffered item is returned by the next `next` call exactly once,
/// so wrapping never skips or duplicates elements.
pub struct PeekingIterator<I: Iterator> {
    iter: I,
    peeked: Option<I::Item>,
}

impl<I: Iterator> PeekingIterator<I> {
    pub fn new(iter: I) -> Self {
        Self { iter, peeked: None }
    }

    pub fn peek(&mut self) -> Option<&I::Item> {
        if self.peeked.is_none() {
            self.peeked = self.iter.next();
        }
        self.peeked.as_ref()
    }

    /// Does not advance the underlying sequence.
    pub fn has_next(&mut self) -> bool {
        self.peek().is_some()
    }
}

impl<'a, I: Iterator<Item = &'a Project>> PeekingIterator<I> {
    /// True if the next project (if any) sits on the given level. Used to
    /// emit per-level boundaries while rendering or scheduling.
    pub fn has_next_on_the_same_level(&mut self, level: u32) -> bool {
        self.peek().is_some_and(|p| p.level == level)
    }
}

impl<I: Iterator> Iterator for PeekingIterator<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        self.peeked.take().or_else(|| self.iter.next())
    }
}
