//! States (or liveness pairs) seen so far, for state-equality reduction.
//!
//! Entries are kept sorted by `(actor_count, heap_bytes_used)`, a cheap key
//! two equal states always share, so only the equal range has to go
//! through the full snapshot comparison.

use std::ops::Range;

use log::debug;

/// A remembered state.
#[derive(Debug, Clone)]
pub struct VisitedState<T> {
    pub num: u64,
    /// Number of the first equal state ever seen, when this one is a copy.
    pub original_num: Option<u64>,
    pub actor_count: usize,
    pub heap_bytes_used: u64,
    pub content: T,
}

impl<T> VisitedState<T> {
    pub fn new(num: u64, key: (usize, u64), content: T) -> Self {
        Self {
            num,
            original_num: None,
            actor_count: key.0,
            heap_bytes_used: key.1,
            content,
        }
    }

    fn key(&self) -> (usize, u64) {
        (self.actor_count, self.heap_bytes_used)
    }

    /// The state this one stands for in the dot output.
    pub fn origin(&self) -> u64 {
        self.original_num.unwrap_or(self.num)
    }
}

#[derive(Debug)]
pub struct VisitedStates<T> {
    states: Vec<VisitedState<T>>,
    capacity: usize,
}

impl<T> VisitedStates<T> {
    /// Keep at most `capacity` states, evicting the oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            states: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VisitedState<T>> {
        self.states.iter()
    }

    fn equal_range(&self, key: (usize, u64)) -> Range<usize> {
        let start = self.states.partition_point(|s| s.key() < key);
        let end = self.states.partition_point(|s| s.key() <= key);
        start..end
    }

    /// Record `state`.
    ///
    /// If an earlier state is `equal`, the new one takes its place and the
    /// old one is returned; the caller stops exploring from there.
    pub fn add_state(
        &mut self,
        mut state: VisitedState<T>,
        mut equal: impl FnMut(&T, &T) -> bool,
    ) -> Option<VisitedState<T>> {
        let range = self.equal_range(state.key());
        for i in range.clone() {
            if equal(&self.states[i].content, &state.content) {
                state.original_num = Some(self.states[i].origin());
                debug!(
                    "State {} already visited ! (equal to state {} (state {} in dot_output))",
                    state.num,
                    self.states[i].num,
                    self.states[i].origin()
                );
                debug!(
                    "Replace visited state {} with the new visited state {}",
                    self.states[i].num, state.num
                );
                return Some(std::mem::replace(&mut self.states[i], state));
            }
        }
        debug!(
            "Insert new visited state {} (total : {})",
            state.num,
            self.states.len()
        );
        self.states.insert(range.start, state);
        self.prune();
        None
    }

    /// Insert `state` unless an `equal` one is already present, in which
    /// case the number of that one is returned and nothing changes.
    pub fn insert_unless_present(
        &mut self,
        state: VisitedState<T>,
        mut equal: impl FnMut(&T, &T) -> bool,
    ) -> Option<u64> {
        let range = self.equal_range(state.key());
        if let Some(existing) = self.states[range.clone()]
            .iter()
            .find(|s| equal(&s.content, &state.content))
        {
            return Some(existing.num);
        }
        self.states.insert(range.start, state);
        None
    }

    pub fn remove(&mut self, num: u64) -> Option<VisitedState<T>> {
        let index = self.states.iter().position(|s| s.num == num)?;
        Some(self.states.remove(index))
    }

    fn prune(&mut self) {
        while self.states.len() > self.capacity {
            debug!("Try to remove visited state (maximum number of stored states reached)");
            let Some(oldest) = self
                .states
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.num)
                .map(|(i, _)| i)
            else {
                break;
            };
            let removed = self.states.remove(oldest);
            debug!("Remove visited state (maximum number of stored states reached): {}", removed.num);
        }
    }
}
