//! Version-selected state switch tables.

use std::collections::HashMap;
use std::hash::Hash;

/// Result of looking up `(state, event)` in a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// The pair maps to this state.
    Next(S),
    /// The table has no row for the state.
    UnknownState,
    /// The state is known but does not handle the event.
    UnknownEvent,
}

/// Transitions valid from a minimum protocol version upward.
#[derive(Debug, Clone)]
pub struct StateSwitchTable<S, E> {
    min_version: u32,
    rows: HashMap<S, HashMap<E, S>>,
}

impl<S, E> StateSwitchTable<S, E>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    /// Creates an empty table for versions `>= min_version`.
    pub fn new(min_version: u32) -> Self {
        Self {
            min_version,
            rows: HashMap::new(),
        }
    }

    /// Adds `from --event--> to`. A later rule for the same pair wins.
    pub fn on(mut self, from: S, event: E, to: S) -> Self {
        self.rows.entry(from).or_default().insert(event, to);
        self
    }

    /// Adds a state row without transitions.
    pub fn state(mut self, state: S) -> Self {
        self.rows.entry(state).or_default();
        self
    }

    /// Returns the minimum version.
    pub fn min_version(&self) -> u32 {
        self.min_version
    }

    /// Returns true if the table applies to `version`.
    pub fn is_compatible(&self, version: u32) -> bool {
        self.min_version <= version
    }

    /// Looks up the target of `(state, event)`.
    pub fn lookup(&self, state: S, event: E) -> Transition<S> {
        match self.rows.get(&state) {
            None => Transition::UnknownState,
            Some(events) => events
                .get(&event)
                .map_or(Transition::UnknownEvent, |to| Transition::Next(*to)),
        }
    }

    /// Returns the number of `(state, event)` rules.
    pub fn len(&self) -> usize {
        self.rows.values().map(HashMap::len).sum()
    }

    /// Returns true if the table has no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returns the first table compatible with `version`, in declared order.
pub fn select_table<S, E>(
    tables: &[StateSwitchTable<S, E>],
    version: u32,
) -> Option<&StateSwitchTable<S, E>>
where
    S: Copy + Eq + Hash,
    E: Copy + Eq + Hash,
{
    tables.iter().find(|table| table.is_compatible(version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        A,
        B,
        C,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum E {
        Go,
        Stop,
    }

    #[test]
    fn lookup_distinguishes_missing_state_and_event() {
        let table = StateSwitchTable::new(1).on(S::A, E::Go, S::B).state(S::C);

        assert_eq!(table.lookup(S::A, E::Go), Transition::Next(S::B));
        assert_eq!(table.lookup(S::A, E::Stop), Transition::UnknownEvent);
        assert_eq!(table.lookup(S::C, E::Go), Transition::UnknownEvent);
        assert_eq!(table.lookup(S::B, E::Go), Transition::UnknownState);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn selection_is_first_match_in_declared_order() {
        let tables = vec![
            StateSwitchTable::new(3).on(S::A, E::Go, S::C),
            StateSwitchTable::new(2).on(S::A, E::Go, S::B),
        ];
        assert_eq!(select_table(&tables, 5).map(|t| t.min_version()), Some(3));
        assert_eq!(select_table(&tables, 2).map(|t| t.min_version()), Some(2));
        assert!(select_table(&tables, 1).is_none());

        // An ascending declaration shadows the newer table.
        let ascending = vec![
            StateSwitchTable::new(2).on(S::A, E::Go, S::B),
            StateSwitchTable::new(3).on(S::A, E::Go, S::C),
        ];
        assert_eq!(select_table(&ascending, 5).map(|t| t.min_version()), Some(2));
    }
}
