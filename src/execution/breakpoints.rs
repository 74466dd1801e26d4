use std::collections::{BTreeSet, HashMap};

use crate::machine::Machine;

/// Breakpoints by file. A line is present at most once per file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointSet {
    by_file: HashMap<String, BTreeSet<u32>>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the breakpoint was already set.
    pub fn insert(&mut self, file: &str, line: u32) -> bool {
        self.by_file.entry(file.to_string()).or_default().insert(line)
    }

    /// Returns `false` when there was nothing to remove.
    pub fn remove(&mut self, file: &str, line: u32) -> bool {
        let Some(lines) = self.by_file.get_mut(file) else {
            return false;
        };
        let removed = lines.remove(&line);
        if lines.is_empty() {
            self.by_file.remove(file);
        }
        removed
    }

    pub fn contains(&self, file: &str, line: u32) -> bool {
        self.by_file
            .get(file)
            .is_some_and(|lines| lines.contains(&line))
    }

    /// Lines of `file` in ascending order.
    pub fn lines_of(&self, file: &str) -> Vec<u32> {
        self.by_file
            .get(file)
            .map(|lines| lines.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.by_file
            .iter()
            .flat_map(|(file, lines)| lines.iter().map(move |line| (file.as_str(), *line)))
    }

    pub fn len(&self) -> usize {
        self.by_file.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_file.is_empty()
    }

    /// Enable or disable every breakpoint of the set on `machine`.
    pub fn apply_to(&self, machine: &mut dyn Machine, enabled: bool) {
        for (file, line) in self.iter() {
            machine.set_breakpoint(file, line, enabled);
        }
    }
}
