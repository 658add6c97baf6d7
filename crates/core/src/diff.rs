//! Merge-based tree diff
//!
//! Both inputs are sorted listings, so a single pass with two cursors yields
//! the minimal change stream in path order.

use std::cmp::Ordering;
use std::collections::VecDeque;

use crate::stat::{Change, Stat, compare_paths};

/// Iterator over the changes turning `previous` into `incoming`
pub struct Differ<'a> {
    previous: &'a [Stat],
    incoming: &'a [Stat],
    prev_pos: usize,
    next_pos: usize,
    queued: VecDeque<Change>,
}

impl<'a> Differ<'a> {
    /// Both slices must be sorted by path; [`crate::Snapshot`] guarantees this.
    #[must_use]
    pub fn new(previous: &'a [Stat], incoming: &'a [Stat]) -> Self {
        Self {
            previous,
            incoming,
            prev_pos: 0,
            next_pos: 0,
            queued: VecDeque::new(),
        }
    }

    fn take_previous(&mut self) -> Change {
        let stat = &self.previous[self.prev_pos];
        self.prev_pos += 1;
        Change::delete(&stat.path)
    }

    fn take_incoming(&mut self) -> Change {
        let stat = &self.incoming[self.next_pos];
        self.next_pos += 1;
        Change::add(stat.clone())
    }

    /// Queue the replacement of an entry whose type changed.
    ///
    /// A replaced directory has all of its previous descendants deleted before
    /// the new entry is added at the same path.
    fn queue_replacement(&mut self, old: &'a Stat, new: &'a Stat) {
        self.queued.push_back(Change::delete(&old.path));
        if old.info.is_dir() {
            while let Some(child) = self.previous.get(self.prev_pos) {
                if !child.path.starts_with(&old.path) {
                    break;
                }
                self.queued.push_back(Change::delete(&child.path));
                self.prev_pos += 1;
            }
        }
        self.queued.push_back(Change::add(new.clone()));
    }
}

impl Iterator for Differ<'_> {
    type Item = Change;

    fn next(&mut self) -> Option<Change> {
        loop {
            if let Some(change) = self.queued.pop_front() {
                return Some(change);
            }

            let previous = self.previous.get(self.prev_pos);
            let incoming = self.incoming.get(self.next_pos);

            match (previous, incoming) {
                (None, None) => return None,
                (Some(_), None) => return Some(self.take_previous()),
                (None, Some(_)) => return Some(self.take_incoming()),
                (Some(old), Some(new)) => match compare_paths(&old.path, &new.path) {
                    Ordering::Less => return Some(self.take_previous()),
                    Ordering::Greater => return Some(self.take_incoming()),
                    Ordering::Equal => {
                        self.prev_pos += 1;
                        self.next_pos += 1;
                        if old.info == new.info {
                            continue;
                        }
                        if old.info.same_type(&new.info) {
                            return Some(Change::add(new.clone()));
                        }
                        self.queue_replacement(old, new);
                    }
                },
            }
        }
    }
}
