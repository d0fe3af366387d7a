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

//! The property-metadata seam: "what type is field F, what class owns it,
//! what does it point at". Read-only from the data layer's point of view.

use std::collections::HashMap;

use uuid::Uuid;

use crate::model::error::DataError;
use crate::model::ids::{ClassId, FieldId};
use crate::model::prop_type::PropType;

/// Extra description carried only by user-defined (custom) fields, exported
/// in the `AdditionalFields` block.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CustomFieldInfo {
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub big: Option<bool>,
    pub list_root: Option<Uuid>,
    pub ws_selector: Option<i32>,
    pub user_label: Option<String>,
    pub help_string: Option<String>,
    pub xml_ui: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldInfo {
    pub id: FieldId,
    /// The backing column / XML element name.
    pub name: String,
    /// The class this field belongs to.
    pub class: ClassId,
    pub prop_type: PropType,
    /// Destination class for object-valued fields.
    pub dst_class: Option<ClassId>,
    pub custom: Option<CustomFieldInfo>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassInfo {
    pub id: ClassId,
    /// The backing table / XML element name.
    pub name: String,
    pub base: Option<ClassId>,
    pub is_abstract: bool,
}

/// The external property-metadata store. Every lookup failure is an
/// `UnknownField`/`UnknownClass` - schema inconsistency, never silently
/// absorbed.
pub trait MetadataCache {
    fn field(&self, flid: FieldId) -> Result<&FieldInfo, DataError>;
    fn class(&self, clid: ClassId) -> Result<&ClassInfo, DataError>;

    fn field_type(&self, flid: FieldId) -> Result<PropType, DataError> {
        Ok(self.field(flid)?.prop_type)
    }

    /// The class that owns (declares) the field.
    fn field_class(&self, flid: FieldId) -> Result<ClassId, DataError> {
        Ok(self.field(flid)?.class)
    }

    fn field_name(&self, flid: FieldId) -> Result<&str, DataError> {
        Ok(&self.field(flid)?.name)
    }

    /// Destination class of a reference/owning field, if declared.
    fn dst_class(&self, flid: FieldId) -> Result<Option<ClassId>, DataError> {
        Ok(self.field(flid)?.dst_class)
    }

    fn class_name(&self, clid: ClassId) -> Result<&str, DataError> {
        Ok(&self.class(clid)?.name)
    }

    /// The declared base-class table name for a field: the table a
    /// base-class-scoped autoload queries.
    fn base_class_name(&self, flid: FieldId) -> Result<&str, DataError> {
        self.class_name(self.field_class(flid)?)
    }

    fn field_id(&self, class_name: &str, field_name: &str) -> Option<FieldId>;
    fn class_id(&self, class_name: &str) -> Option<ClassId>;

    /// All fields declared on a class (not inherited).
    fn fields_of_class(&self, clid: ClassId) -> Vec<&FieldInfo>;

    /// Every user-defined field, for the export `AdditionalFields` block.
    fn custom_fields(&self) -> Vec<&FieldInfo>;

    /// Whether `clid` is `ancestor` or inherits from it.
    fn is_subclass_of(&self, clid: ClassId, ancestor: ClassId) -> bool;
}

/// In-memory metadata built up through a builder API. The importer's
/// field/class tables and the test schemas use this.
#[derive(Default)]
pub struct DictMetadata {
    fields: HashMap<FieldId, FieldInfo>,
    classes: HashMap<ClassId, ClassInfo>,
    field_by_name: HashMap<(String, String), FieldId>,
    class_by_name: HashMap<String, ClassId>,
}

impl DictMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_class(
        &mut self,
        id: ClassId,
        name: impl Into<String>,
        base: Option<ClassId>,
    ) -> &mut Self {
        let name = name.into();
        self.class_by_name.insert(name.clone(), id);
        self.classes.insert(
            id,
            ClassInfo {
                id,
                name,
                base,
                is_abstract: false,
            },
        );
        self
    }

    pub fn add_field(
        &mut self,
        id: FieldId,
        name: impl Into<String>,
        class: ClassId,
        prop_type: PropType,
        dst_class: Option<ClassId>,
    ) -> &mut Self {
        let name = name.into();
        let class_name = self
            .classes
            .get(&class)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        self.field_by_name.insert((class_name, name.clone()), id);
        self.fields.insert(
            id,
            FieldInfo {
                id,
                name,
                class,
                prop_type,
                dst_class,
                custom: None,
            },
        );
        self
    }

    pub fn add_custom_field(
        &mut self,
        id: FieldId,
        name: impl Into<String>,
        class: ClassId,
        prop_type: PropType,
        dst_class: Option<ClassId>,
        info: CustomFieldInfo,
    ) -> &mut Self {
        self.add_field(id, name, class, prop_type, dst_class);
        if let Some(f) = self.fields.get_mut(&id) {
            f.custom = Some(info);
        }
        self
    }
}

impl MetadataCache for DictMetadata {
    fn field(&self, flid: FieldId) -> Result<&FieldInfo, DataError> {
        self.fields.get(&flid).ok_or(DataError::UnknownField(flid))
    }

    fn class(&self, clid: ClassId) -> Result<&ClassInfo, DataError> {
        self.classes
            .get(&clid)
            .ok_or(DataError::UnknownClass(clid))
    }

    fn field_id(&self, class_name: &str, field_name: &str) -> Option<FieldId> {
        self.field_by_name
            .get(&(class_name.to_string(), field_name.to_string()))
            .copied()
    }

    fn class_id(&self, class_name: &str) -> Option<ClassId> {
        self.class_by_name.get(class_name).copied()
    }

    fn fields_of_class(&self, clid: ClassId) -> Vec<&FieldInfo> {
        let mut fields: Vec<_> = self.fields.values().filter(|f| f.class == clid).collect();
        fields.sort_by_key(|f| f.id);
        fields
    }

    fn custom_fields(&self) -> Vec<&FieldInfo> {
        let mut fields: Vec<_> = self.fields.values().filter(|f| f.custom.is_some()).collect();
        fields.sort_by_key(|f| f.id);
        fields
    }

    fn is_subclass_of(&self, clid: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(clid);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.classes.get(&c).and_then(|ci| ci.base);
        }
        false
    }
}
