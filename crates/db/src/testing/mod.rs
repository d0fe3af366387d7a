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

//! A scripted backing store for tests: records every command it sees and
//! answers row queries from substring-keyed scripts, so tests can assert on
//! query counts and query shapes as well as outcomes.

use cellar_common::DataError;

use crate::store::{BackingStore, Row, SqlCommand, SqlValue};

struct Script {
    key: String,
    responses: Vec<Vec<Row>>,
    cursor: usize,
}

#[derive(Default)]
pub struct MockStore {
    /// Every command passed to `rows` or `execute`, in order.
    pub journal: Vec<SqlCommand>,
    scripts: Vec<Script>,
    tx_open: bool,
    pub commits: usize,
    pub rollbacks: usize,
    /// When set, the next store call fails with this message.
    pub fail_next: Option<String>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response: any query whose text contains `key` answers with
    /// these rows. First matching script wins.
    pub fn script(&mut self, key: impl Into<String>, rows: Vec<Row>) {
        self.scripts.push(Script {
            key: key.into(),
            responses: vec![rows],
            cursor: 0,
        });
    }

    /// Script a sequence of responses for matching queries: each match
    /// consumes the next rowset; the last one answers forever after.
    pub fn script_queue(&mut self, key: impl Into<String>, responses: Vec<Vec<Row>>) {
        self.scripts.push(Script {
            key: key.into(),
            responses,
            cursor: 0,
        });
    }

    pub fn script_ints(&mut self, key: impl Into<String>, rows: &[&[i64]]) {
        let rows = rows
            .iter()
            .map(|vals| Row(vals.iter().map(|v| SqlValue::Int(*v)).collect()))
            .collect();
        self.script(key, rows);
    }

    /// How many journaled commands contain the given substring.
    pub fn count_matching(&self, key: &str) -> usize {
        self.journal.iter().filter(|c| c.text.contains(key)).count()
    }

    pub fn query_count(&self) -> usize {
        self.journal.len()
    }

    fn take_failure(&mut self) -> Result<(), DataError> {
        if let Some(msg) = self.fail_next.take() {
            return Err(DataError::Store(msg));
        }
        Ok(())
    }
}

impl BackingStore for MockStore {
    fn rows(&mut self, cmd: &SqlCommand) -> Result<Vec<Row>, DataError> {
        self.take_failure()?;
        self.journal.push(cmd.clone());
        for script in &mut self.scripts {
            if cmd.text.contains(script.key.as_str()) {
                let rows = script.responses[script.cursor].clone();
                if script.cursor + 1 < script.responses.len() {
                    script.cursor += 1;
                }
                return Ok(rows);
            }
        }
        Ok(vec![])
    }

    fn execute(&mut self, cmd: &SqlCommand) -> Result<(), DataError> {
        self.take_failure()?;
        self.journal.push(cmd.clone());
        Ok(())
    }

    fn begin_transaction(&mut self) -> Result<(), DataError> {
        if self.tx_open {
            return Err(DataError::Store("transaction already open".into()));
        }
        self.tx_open = true;
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<(), DataError> {
        if !self.tx_open {
            return Err(DataError::Store("no transaction open".into()));
        }
        self.tx_open = false;
        self.commits += 1;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<(), DataError> {
        if !self.tx_open {
            return Err(DataError::Store("no transaction open".into()));
        }
        self.tx_open = false;
        self.rollbacks += 1;
        Ok(())
    }

    fn is_transaction_open(&self) -> bool {
        self.tx_open
    }
}

/// A timestamp row helper: the opaque 8-byte token stores like this.
pub fn stamp_row(id_and_stamp: (i64, [u8; 8])) -> Row {
    Row(vec![
        SqlValue::Int(id_and_stamp.0),
        SqlValue::Bytes(id_and_stamp.1.to_vec()),
    ])
}
