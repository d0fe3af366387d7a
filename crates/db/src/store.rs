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

//! The backing-store seam. The store speaks parametrized SQL text and rows of
//! typed values; the named stored procedures are an opaque protocol whose
//! contracts (cascade on delete, ordinal maintenance on move, and so on) the
//! store must honor. Everything above this seam is storage-engine-agnostic.

use cellar_common::{DataError, FieldId, Hvo};
use uuid::Uuid;

/// One bound parameter or one result column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    Guid(Uuid),
    /// Milliseconds since the epoch; the store's datetime rendering.
    Time(i64),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Null-as-zero integer read.
    pub fn int_or_zero(&self) -> i64 {
        match self {
            SqlValue::Int(n) => *n,
            SqlValue::Time(n) => *n,
            _ => 0,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            SqlValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn guid(&self) -> Option<Uuid> {
        match self {
            SqlValue::Guid(g) => Some(*g),
            _ => None,
        }
    }
}

/// Re-interpret an integer read from a column narrower than a native int,
/// with correct sign extension. Width is in bytes: 1, 2, 4 or 8.
pub fn sign_extend(raw: i64, width: u8) -> i64 {
    match width {
        1 => raw as u8 as i8 as i64,
        2 => raw as u16 as i16 as i64,
        4 => raw as u32 as i32 as i64,
        _ => raw,
    }
}

/// One result row. Out-of-range columns read as Null rather than panicking;
/// a short row is the store's problem, not a crash.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Row(pub Vec<SqlValue>);

impl Row {
    pub fn col(&self, i: usize) -> &SqlValue {
        static NULL: SqlValue = SqlValue::Null;
        self.0.get(i).unwrap_or(&NULL)
    }

    pub fn int_or_zero(&self, i: usize) -> i64 {
        self.col(i).int_or_zero()
    }

    pub fn hvo(&self, i: usize) -> Option<Hvo> {
        match self.col(i) {
            SqlValue::Int(n) if *n != 0 => Some(Hvo::new(*n as i32)),
            _ => None,
        }
    }
}

/// Parametrized SQL text plus its bound parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlCommand {
    pub text: String,
    pub params: Vec<SqlValue>,
}

impl SqlCommand {
    pub fn new(text: impl Into<String>) -> Self {
        SqlCommand {
            text: text.into(),
            params: vec![],
        }
    }

    pub fn with_params(text: impl Into<String>, params: Vec<SqlValue>) -> Self {
        SqlCommand {
            text: text.into(),
            params,
        }
    }
}

// Builders for the stored-procedure protocol. The text matters to callers
// only as an opaque contract name; tests match on these prefixes.
pub fn create_owned_object_cmd(
    clid: u32,
    owner: Hvo,
    owning_flid: FieldId,
    ord: Option<i32>,
) -> SqlCommand {
    SqlCommand::with_params(
        "exec CreateOwnedObject$ ?, ?, ?, ?",
        vec![
            SqlValue::Int(clid as i64),
            SqlValue::Int(owner.id() as i64),
            SqlValue::Int(owning_flid.id() as i64),
            ord.map(|o| SqlValue::Int(o as i64)).unwrap_or(SqlValue::Null),
        ],
    )
}

pub fn delete_objects_cmd(hvos: &[Hvo]) -> SqlCommand {
    let ids = hvos
        .iter()
        .map(|h| h.id().to_string())
        .collect::<Vec<_>>()
        .join(",");
    SqlCommand::new(format!("exec DeleteObjects '{ids}'"))
}

pub fn get_linked_objects_cmd(hvo: Hvo, include_incoming_refs: bool) -> SqlCommand {
    SqlCommand::with_params(
        "exec GetLinkedObjects$ ?, ?",
        vec![
            SqlValue::Int(hvo.id() as i64),
            SqlValue::Int(include_incoming_refs as i64),
        ],
    )
}

#[allow(clippy::too_many_arguments)]
pub fn move_owned_object_cmd(
    src_owner: Hvo,
    src_flid: FieldId,
    hvo_start: Hvo,
    hvo_end: Hvo,
    dst_owner: Hvo,
    dst_flid: FieldId,
    dst_before: Option<Hvo>,
) -> SqlCommand {
    SqlCommand::with_params(
        "exec MoveOwnedObject$ ?, ?, ?, ?, ?, ?, ?",
        vec![
            SqlValue::Int(src_owner.id() as i64),
            SqlValue::Int(src_flid.id() as i64),
            SqlValue::Int(hvo_start.id() as i64),
            SqlValue::Int(hvo_end.id() as i64),
            SqlValue::Int(dst_owner.id() as i64),
            SqlValue::Int(dst_flid.id() as i64),
            dst_before
                .map(|h| SqlValue::Int(h.id() as i64))
                .unwrap_or(SqlValue::Null),
        ],
    )
}

fn id_list(hvos: &[Hvo]) -> String {
    hvos.iter()
        .map(|h| h.id().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn replace_ref_seq_cmd(
    flid: FieldId,
    src: Hvo,
    ord_min: usize,
    ord_lim: usize,
    inserted: &[Hvo],
) -> SqlCommand {
    SqlCommand::with_params(
        format!("exec ReplaceRefSeq$ ?, ?, ?, ?, '{}'", id_list(inserted)),
        vec![
            SqlValue::Int(flid.id() as i64),
            SqlValue::Int(src.id() as i64),
            SqlValue::Int(ord_min as i64),
            SqlValue::Int(ord_lim as i64),
        ],
    )
}

pub fn replace_ref_coll_cmd(
    flid: FieldId,
    src: Hvo,
    deleted: &[Hvo],
    inserted: &[Hvo],
) -> SqlCommand {
    SqlCommand::with_params(
        format!(
            "exec ReplaceRefColl$ ?, ?, '{}', '{}'",
            id_list(deleted),
            id_list(inserted)
        ),
        vec![
            SqlValue::Int(flid.id() as i64),
            SqlValue::Int(src.id() as i64),
        ],
    )
}

pub fn set_obj_list_cmd(flid: FieldId, src: Hvo, items: &[Hvo]) -> SqlCommand {
    SqlCommand::with_params(
        format!("exec SetObjList$ ?, ?, '{}'", id_list(items)),
        vec![
            SqlValue::Int(flid.id() as i64),
            SqlValue::Int(src.id() as i64),
        ],
    )
}

pub fn set_multi_cmd(proc_name: &str, hvo: Hvo, flid: FieldId, ws: i32, params: Vec<SqlValue>) -> SqlCommand {
    let mut all = vec![
        SqlValue::Int(hvo.id() as i64),
        SqlValue::Int(flid.id() as i64),
        SqlValue::Int(ws as i64),
    ];
    all.extend(params);
    SqlCommand::with_params(
        format!("exec {proc_name} ?, ?, ?{}", ", ?".repeat(all.len() - 3)),
        all,
    )
}

pub fn update_hierarchy_cmd() -> SqlCommand {
    SqlCommand::new("exec UpdateHierarchy")
}

/// The backing store. Single-threaded, synchronous, blocking; every call may
/// take arbitrarily long. Failures are `DataError::Store` carrying whatever
/// diagnostic text the driver produced.
pub trait BackingStore {
    fn rows(&mut self, cmd: &SqlCommand) -> Result<Vec<Row>, DataError>;
    fn execute(&mut self, cmd: &SqlCommand) -> Result<(), DataError>;

    fn begin_transaction(&mut self) -> Result<(), DataError>;
    fn commit_transaction(&mut self) -> Result<(), DataError>;
    fn rollback_transaction(&mut self) -> Result<(), DataError>;
    fn is_transaction_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0xFF, 1), -1);
        assert_eq!(sign_extend(0x7F, 1), 127);
        assert_eq!(sign_extend(0xFFFF, 2), -1);
        assert_eq!(sign_extend(0x8000, 2), -32768);
        assert_eq!(sign_extend(0xFFFF_FFFF, 4), -1);
        assert_eq!(sign_extend(42, 8), 42);
    }

    #[test]
    fn test_row_out_of_range_is_null() {
        let r = Row(vec![SqlValue::Int(1)]);
        assert!(r.col(5).is_null());
        assert_eq!(r.int_or_zero(5), 0);
        assert_eq!(r.hvo(5), None);
    }
}
