// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Undo/redo actions: every mutation that goes through the store with an
//! action handler attached pushes a paired (redo, undo, verify, reload)
//! bundle. Verification is optimistic concurrency control - before replaying
//! in either direction, the store is checked against the state the replay
//! expects, so a concurrent edit from another process surfaces as a
//! distinguishable "not OK" rather than silent overwrite.

use cellar_common::{DataError, Hvo};

use crate::bulk_load::ColumnSpec;
use crate::store::{BackingStore, SqlCommand, SqlValue};

/// A verification predicate evaluated against the store before undo/redo.
#[derive(Clone, Debug)]
pub enum Verify {
    /// The query's single integer result must equal `expect`. Equality with
    /// the empty string is generated as `(col = ? OR (col IS NULL AND ? = ''))`
    /// by the command builders, because the backing rendering of "empty"
    /// is sometimes NULL and sometimes a zero-length value.
    RowCount { cmd: SqlCommand, expect: i64 },
    /// The query returns (value, count) pairs; each distinct value's
    /// occurrence count must match. Positions are deliberately not checked -
    /// duplicates make positional comparison unsound.
    OccurrenceCounts {
        cmd: SqlCommand,
        expect: Vec<(Hvo, i64)>,
    },
    /// The query returns (value, ordinal) pairs for the boundary elements of
    /// a sequence; these must match exactly, ordinals included.
    BoundaryOrdinals {
        cmd: SqlCommand,
        expect: Vec<(Hvo, i64)>,
    },
    /// Every sub-predicate must pass. Sequences pair an occurrence-count
    /// check with exact boundary ordinals.
    All(Vec<Verify>),
}

impl Verify {
    pub fn check(&self, store: &mut dyn BackingStore) -> Result<bool, DataError> {
        match self {
            Verify::RowCount { cmd, expect } => {
                let rows = store.rows(cmd)?;
                let got = rows.first().map(|r| r.int_or_zero(0)).unwrap_or(0);
                Ok(got == *expect)
            }
            Verify::OccurrenceCounts { cmd, expect } => {
                let rows = store.rows(cmd)?;
                let mut got: Vec<(Hvo, i64)> = rows
                    .iter()
                    .filter_map(|r| r.hvo(0).map(|h| (h, r.int_or_zero(1))))
                    .collect();
                got.sort();
                let mut want = expect.clone();
                want.sort();
                Ok(got == want)
            }
            Verify::BoundaryOrdinals { cmd, expect } => {
                let rows = store.rows(cmd)?;
                let got: Vec<(Hvo, i64)> = rows
                    .iter()
                    .filter_map(|r| r.hvo(0).map(|h| (h, r.int_or_zero(1))))
                    .collect();
                Ok(&got == expect)
            }
            Verify::All(parts) => {
                for part in parts {
                    if !part.check(store)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }
}

/// The reload a replayed action runs afterward so the cache reflects the
/// store again: a query plus the column spec to fan its rows out with.
#[derive(Clone, Debug)]
pub struct ReloadSpec {
    pub cmd: SqlCommand,
    pub cols: Vec<ColumnSpec>,
    /// Objects to default-fill if the reload returns nothing for them.
    pub requested: Vec<Hvo>,
}

/// One undoable mutation. Lifetime is bounded by the enclosing undo task;
/// dropped when popped off the stack or when the stack is cleared.
#[derive(Clone, Debug)]
pub struct SqlUndoAction {
    /// The mutation as applied (and re-applied on redo).
    pub redo_cmds: Vec<SqlCommand>,
    /// The symmetric inverse.
    pub undo_cmds: Vec<SqlCommand>,
    /// Checked before redo: is the store still in the pre-mutation state?
    pub verify_redoable: Option<Verify>,
    /// Checked before undo: is the store still in the post-mutation state?
    pub verify_undoable: Option<Verify>,
    pub reload: Option<ReloadSpec>,
}

/// Outcome of an undo or redo request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UndoResult {
    Ok,
    /// Nothing on the stack.
    Empty,
    /// A verify predicate failed: a concurrent edit made the replay unsafe.
    /// Nothing was applied.
    VerifyFailed,
}

/// One undo task's actions, replayed LIFO on undo and FIFO on redo.
#[derive(Default)]
pub struct UndoGroup {
    pub label: String,
    pub actions: Vec<SqlUndoAction>,
}

/// The action-handler stack. Tasks nest by level; a store transaction is
/// opened only on the 0→1 transition and committed only on 1→0.
#[derive(Default)]
pub struct UndoStack {
    undo: Vec<UndoGroup>,
    redo: Vec<UndoGroup>,
    open: Option<UndoGroup>,
    depth: u32,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Begin (or nest into) an undo task. Returns true when this transition
    /// is outermost and the caller should open a store transaction.
    pub fn begin_task(&mut self, label: &str) -> bool {
        self.depth += 1;
        if self.depth == 1 {
            self.open = Some(UndoGroup {
                label: label.to_string(),
                actions: vec![],
            });
            true
        } else {
            false
        }
    }

    /// End one nesting level. Returns true when the outermost level closed
    /// and the caller should commit the store transaction.
    pub fn end_task(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.depth -= 1;
        if self.depth == 0 {
            if let Some(group) = self.open.take() {
                if !group.actions.is_empty() {
                    self.undo.push(group);
                    self.redo.clear();
                }
            }
            true
        } else {
            false
        }
    }

    /// Re-open the task most recently ended, so further actions join it.
    /// Returns true when the caller should open a store transaction (none
    /// was open).
    pub fn continue_task(&mut self) -> bool {
        self.depth += 1;
        if self.depth == 1 {
            self.open = Some(self.undo.pop().unwrap_or_default());
            true
        } else {
            false
        }
    }

    /// Abandon all nesting unconditionally. The caller rolls back any open
    /// store transaction.
    pub fn rollback(&mut self) {
        self.depth = 0;
        self.open = None;
    }

    pub fn add_action(&mut self, action: SqlUndoAction) {
        match &mut self.open {
            Some(group) => group.actions.push(action),
            None => {
                // An action outside any task gets a single-action group.
                self.undo.push(UndoGroup {
                    label: String::new(),
                    actions: vec![action],
                });
                self.redo.clear();
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn pop_undo(&mut self) -> Option<UndoGroup> {
        self.undo.pop()
    }

    pub fn pop_redo(&mut self) -> Option<UndoGroup> {
        self.redo.pop()
    }

    pub fn push_undone(&mut self, group: UndoGroup) {
        self.redo.push(group);
    }

    pub fn push_redone(&mut self, group: UndoGroup) {
        self.undo.push(group);
    }

    /// Clear everything, as on Save or Rollback: the actions' lifetimes end
    /// here.
    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.open = None;
        self.depth = 0;
    }
}

/// Build the empty-tolerant equality test used by verify predicates on text
/// columns.
pub fn text_equals_clause(col: &str) -> String {
    format!("([{col}] = ? or ([{col}] is null and ? = ''))")
}

pub fn text_equals_params(value: &str) -> Vec<SqlValue> {
    vec![
        SqlValue::Text(value.to_string()),
        SqlValue::Text(value.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_nesting_transitions() {
        let mut stack = UndoStack::new();
        assert!(stack.begin_task("edit"));
        assert!(!stack.begin_task("inner"));
        assert!(!stack.end_task());
        assert!(stack.end_task());
        assert!(!stack.end_task());
    }

    #[test]
    fn test_actions_group_per_task() {
        let mut stack = UndoStack::new();
        stack.begin_task("edit");
        stack.add_action(dummy_action());
        stack.add_action(dummy_action());
        stack.end_task();
        let group = stack.pop_undo().unwrap();
        assert_eq!(group.actions.len(), 2);
        assert_eq!(group.label, "edit");
    }

    #[test]
    fn test_empty_task_pushes_nothing() {
        let mut stack = UndoStack::new();
        stack.begin_task("noop");
        stack.end_task();
        assert!(!stack.can_undo());
    }

    #[test]
    fn test_rollback_resets_depth() {
        let mut stack = UndoStack::new();
        stack.begin_task("a");
        stack.begin_task("b");
        stack.rollback();
        assert_eq!(stack.depth(), 0);
        assert!(!stack.can_undo());
    }

    fn dummy_action() -> SqlUndoAction {
        SqlUndoAction {
            redo_cmds: vec![SqlCommand::new("update t set c = 1")],
            undo_cmds: vec![SqlCommand::new("update t set c = 0")],
            verify_redoable: None,
            verify_undoable: None,
            reload: None,
        }
    }
}
