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

//! Shared model types for the cellar data-access layer: object handles, the
//! closed property-type system, rich (run-formatted) text values, the
//! metadata-cache seam, and the common error enum.

pub mod model;
pub mod progress;
pub mod tracing;

pub use model::error::DataError;
pub use model::ids::{ClassId, FieldId, Hvo, WsId};
pub use model::metadata::{ClassInfo, CustomFieldInfo, DictMetadata, FieldInfo, MetadataCache};
pub use model::prop_type::PropType;
pub use model::rich_text::{
    Align, Color, Measure, MeasureUnit, RichString, SuperSub, TextProps, TextRun, Toggle,
    Underline,
};
pub use progress::{NullProgress, ProgressSink};
