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

use thiserror::Error;

use crate::model::ids::{ClassId, FieldId, Hvo};

/// Errors surfaced by the data-access layer. These travel the status channel;
/// diagnostic log entries are a separate, independent channel - a log line
/// does not imply a failed call, and a failed call does not always log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataError {
    /// Rejected before any effect: null handle, out-of-range index, and the
    /// like. Produces no log entry.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown field: {0}")]
    UnknownField(FieldId),

    #[error("Unknown class: {0}")]
    UnknownClass(ClassId),

    #[error("Field/class type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Malformed data: {0}")]
    MalformedData(String),

    /// Backing-store failure, carrying the command text when available.
    /// Always fatal for the current operation.
    #[error("Backing store error: {0}")]
    Store(String),

    /// Optimistic-concurrency conflict: the object's timestamp no longer
    /// matches the cached token. Not a crash; the caller decides.
    #[error("Stale timestamp on {0}")]
    StaleTimestamp(Hvo),

    /// Undo metadata could not be gathered; the mutation itself applied, but
    /// undo for it is unavailable.
    #[error("Undo unavailable: {0}")]
    UndoUnavailable(String),

    /// "This should never happen": unbalanced parser/undo stacks and similar
    /// bookkeeping violations.
    #[error("Internal inconsistency: {0}")]
    InternalInconsistency(String),
}
