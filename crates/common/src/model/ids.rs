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

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Handles at or above this value (and all negative handles) identify dummy
/// objects that live only in the cache and have no backing row.
pub const DUMMY_ID_THRESHOLD: i32 = 0x7000_0000;

/// A handle to an object in the graph. Real handles are assigned by the
/// backing store; dummy handles exist only in the cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Hvo(i32);

impl Hvo {
    /// The null handle. Never a valid mutation target.
    pub const NULL: Hvo = Hvo(0);

    pub const fn new(id: i32) -> Self {
        Hvo(id)
    }

    pub fn id(&self) -> i32 {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Dummy objects never touch the backing store; every database-reaching
    /// path must consult this first.
    pub fn is_dummy(&self) -> bool {
        self.0 < 0 || self.0 >= DUMMY_ID_THRESHOLD
    }
}

impl Display for Hvo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A field (property) tag. Field identifiers carry their owning class in the
/// thousands digits: `flid = clid * 1000 + ordinal`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct FieldId(i32);

impl FieldId {
    pub const fn new(id: i32) -> Self {
        FieldId(id)
    }

    pub fn id(&self) -> i32 {
        self.0
    }

    /// The class the field's numbering places it in.
    pub fn class_part(&self) -> ClassId {
        ClassId((self.0 / 1000) as u32)
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// The base-object row fields every class shares.
pub const FLID_GUID: FieldId = FieldId(101);
pub const FLID_CLASS: FieldId = FieldId(102);
pub const FLID_OWNER: FieldId = FieldId(103);
pub const FLID_OWN_FLID: FieldId = FieldId(104);
pub const FLID_OWN_ORD: FieldId = FieldId(105);

/// A class identifier from the schema.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl Display for ClassId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A writing-system identifier, the key dimension for multilingual property
/// alternates. Zero means "no writing system".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct WsId(pub i32);

impl WsId {
    pub const NONE: WsId = WsId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for WsId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_ids() {
        assert!(Hvo::new(-1).is_dummy());
        assert!(Hvo::new(DUMMY_ID_THRESHOLD).is_dummy());
        assert!(Hvo::new(DUMMY_ID_THRESHOLD + 5).is_dummy());
        assert!(!Hvo::new(1).is_dummy());
        assert!(!Hvo::new(DUMMY_ID_THRESHOLD - 1).is_dummy());
        assert!(!Hvo::NULL.is_dummy());
        assert!(Hvo::NULL.is_null());
    }

    #[test]
    fn test_flid_class_part() {
        assert_eq!(FieldId::new(5001).class_part(), ClassId(5));
        assert_eq!(FieldId::new(17003).class_part(), ClassId(17));
    }
}
