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

//! Lazy-loading and cache-consistency tests against the scripted store.

use cellar_common::{ClassId, DictMetadata, FieldId, Hvo, PropType, WsId};

use crate::autoload::AutoloadPolicy;
use crate::lazy_store::LazyLoadingStore;
use crate::store::{Row, SqlValue};
use crate::testing::MockStore;

const ENTRY: ClassId = ClassId(20);
const SENSE: ClassId = ClassId(21);

const HOMOGRAPH: FieldId = FieldId::new(20001);
const SENSES: FieldId = FieldId::new(20002);
const CITATION: FieldId = FieldId::new(20003);
const COMMENT: FieldId = FieldId::new(20004);
const DATE_CREATED: FieldId = FieldId::new(20005);
const CROSS_REFS: FieldId = FieldId::new(20006);
const SEQ_REFS: FieldId = FieldId::new(20007);
const IMPORT_RESIDUE: FieldId = FieldId::new(20008);

fn metadata() -> DictMetadata {
    let mut md = DictMetadata::new();
    md.add_class(ClassId(0), "CmObject", None);
    md.add_class(ENTRY, "LexEntry", Some(ClassId(0)));
    md.add_class(SENSE, "LexSense", Some(ClassId(0)));
    md.add_field(HOMOGRAPH, "HomographNumber", ENTRY, PropType::Integer, None);
    md.add_field(SENSES, "Senses", ENTRY, PropType::OwningSequence, Some(SENSE));
    md.add_field(CITATION, "CitationForm", ENTRY, PropType::MultiString, None);
    md.add_field(COMMENT, "Comment", ENTRY, PropType::String, None);
    md.add_field(DATE_CREATED, "DateCreated", ENTRY, PropType::Time, None);
    md.add_field(
        CROSS_REFS,
        "CrossReferences",
        ENTRY,
        PropType::ReferenceCollection,
        Some(ENTRY),
    );
    md.add_field(
        SEQ_REFS,
        "Components",
        ENTRY,
        PropType::ReferenceSequence,
        Some(ENTRY),
    );
    md.add_field(IMPORT_RESIDUE, "ImportResidue", ENTRY, PropType::Unicode, None);
    md
}

fn store() -> LazyLoadingStore<MockStore, DictMetadata> {
    LazyLoadingStore::new(MockStore::new(), metadata())
}

fn stamped_int_row(id: i64, value: i64) -> Row {
    Row(vec![
        SqlValue::Int(id),
        SqlValue::Int(value),
        SqlValue::Bytes(vec![9; 8]),
    ])
}

#[test]
fn test_cache_consistency_zero_io_after_write() {
    let mut da = store();
    da.cache_mut().set_int(Hvo::new(1), HOMOGRAPH, 4);
    let before = da.store_mut().query_count();
    assert_eq!(da.get_int_prop(Hvo::new(1), HOMOGRAPH).unwrap(), Some(4));
    assert_eq!(da.store_mut().query_count(), before);
}

#[test]
fn test_autoload_this_object_is_idempotent() {
    let mut da = store();
    da.store_mut()
        .script("[HomographNumber]", vec![stamped_int_row(42, 7)]);
    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(7));
    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(7));
    assert_eq!(da.store_mut().count_matching("[HomographNumber]"), 1);
}

#[test]
fn test_scalar_autoload_caches_timestamp_opportunistically() {
    let mut da = store();
    da.store_mut()
        .script("[HomographNumber]", vec![stamped_int_row(42, 7)]);
    da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap();
    assert_eq!(da.cache().get_timestamp(Hvo::new(42)), Some(&vec![9; 8]));
}

#[test]
fn test_dummy_ids_short_circuit_every_getter() {
    let mut da = store();
    let dummy = Hvo::new(-5);
    assert_eq!(da.get_int_prop(dummy, HOMOGRAPH).unwrap(), None);
    assert_eq!(da.get_int64_prop(dummy, DATE_CREATED).unwrap(), None);
    assert_eq!(da.get_time_prop(dummy, DATE_CREATED).unwrap(), None);
    assert_eq!(da.get_guid_prop(dummy, HOMOGRAPH).unwrap(), None);
    assert_eq!(da.get_binary_prop(dummy, HOMOGRAPH).unwrap(), None);
    assert_eq!(da.get_string_prop(dummy, COMMENT).unwrap(), None);
    assert_eq!(da.get_unicode_prop(dummy, IMPORT_RESIDUE).unwrap(), None);
    assert_eq!(
        da.get_multi_string_alt(dummy, CITATION, WsId(1)).unwrap(),
        None
    );
    assert_eq!(da.get_object_prop(dummy, CROSS_REFS).unwrap(), None);
    assert_eq!(da.get_vector(dummy, SENSES).unwrap(), vec![]);
    assert_eq!(da.get_vec_size(dummy, SENSES).unwrap(), 0);
    assert_eq!(da.store_mut().query_count(), 0);
}

#[test]
fn test_no_autoload_policy_returns_not_found_without_io() {
    let mut da = store();
    da.set_autoload_policy(AutoloadPolicy::NoAutoload);
    assert_eq!(da.get_int_prop(Hvo::new(1), HOMOGRAPH).unwrap(), None);
    assert_eq!(da.get_vector(Hvo::new(1), SENSES).unwrap(), vec![]);
    assert_eq!(da.store_mut().query_count(), 0);
}

#[test]
fn test_read_only_class_policy_loads_once_per_triple() {
    let mut da = store();
    da.set_autoload_policy(AutoloadPolicy::LoadAllOfClassForReadOnly);
    da.store_mut().script(
        "[HomographNumber]",
        vec![stamped_int_row(1, 10), stamped_int_row(2, 20)],
    );
    assert_eq!(da.get_int_prop(Hvo::new(1), HOMOGRAPH).unwrap(), Some(10));
    assert_eq!(da.get_int_prop(Hvo::new(2), HOMOGRAPH).unwrap(), Some(20));
    // Two objects of the class, one query total.
    assert_eq!(da.store_mut().count_matching("[HomographNumber]"), 1);

    // An object the bulk load never saw does not re-trigger it.
    assert_eq!(da.get_int_prop(Hvo::new(3), HOMOGRAPH).unwrap(), None);
    assert_eq!(da.store_mut().count_matching("[HomographNumber]"), 1);
}

#[test]
fn test_base_class_policy_issues_unscoped_query() {
    let mut da = store();
    da.set_autoload_policy(AutoloadPolicy::LoadForAllOfBaseClass);
    da.store_mut()
        .script("[HomographNumber]", vec![stamped_int_row(1, 10)]);
    da.get_int_prop(Hvo::new(1), HOMOGRAPH).unwrap();
    let wide = &da.store_mut().journal[0];
    assert!(!wide.text.contains("where [Id] = ?"));
}

#[test]
fn test_recent_autoload_falls_back_to_narrow_query() {
    let mut da = store();
    da.set_autoload_policy(AutoloadPolicy::LoadForAllOfBaseClass);
    da.store_mut()
        .script("[HomographNumber]", vec![stamped_int_row(1, 10)]);
    da.get_int_prop(Hvo::new(1), HOMOGRAPH).unwrap();
    // Object 2 was not in the wide result; the triple is recent now, so the
    // retry narrows to this object instead of re-broadening.
    da.get_int_prop(Hvo::new(2), HOMOGRAPH).unwrap();
    let second = &da.store_mut().journal[1];
    assert!(second.text.contains("where [Id] = ?"));
}

#[test]
fn test_exact_class_policy_discovers_class_first() {
    let mut da = store();
    da.set_autoload_policy(AutoloadPolicy::LoadForAllOfObjectClass);
    da.store_mut().script_ints("[Class$] from [CmObject]", &[&[20]]);
    da.store_mut()
        .script("[HomographNumber]", vec![stamped_int_row(1, 10)]);
    da.get_int_prop(Hvo::new(1), HOMOGRAPH).unwrap();
    assert_eq!(da.store_mut().query_count(), 2);
    assert!(da.store_mut().journal[0].text.contains("[Class$]"));
    assert!(da.store_mut().journal[1].text.contains("[Class$] = ?"));
}

#[test]
fn test_vector_load_caches_explicit_empty() {
    let mut da = store();
    // No scripted rows: the store has no senses for this entry.
    assert_eq!(da.get_vector(Hvo::new(5), SENSES).unwrap(), vec![]);
    assert_eq!(da.store_mut().query_count(), 1);
    // "Loaded, empty" must not re-query.
    assert_eq!(da.get_vec_size(Hvo::new(5), SENSES).unwrap(), 0);
    assert_eq!(da.store_mut().query_count(), 1);
}

#[test]
fn test_atomic_ref_zero_rows_caches_null() {
    let mut da = store();
    let mut md2 = metadata();
    md2.add_field(
        FieldId::new(20010),
        "MainEntry",
        ENTRY,
        PropType::ReferenceAtomic,
        Some(ENTRY),
    );
    let mut da2 = LazyLoadingStore::new(MockStore::new(), md2);
    assert_eq!(
        da2.get_object_prop(Hvo::new(5), FieldId::new(20010)).unwrap(),
        None
    );
    let after_first = da2.store_mut().query_count();
    assert_eq!(
        da2.get_object_prop(Hvo::new(5), FieldId::new(20010)).unwrap(),
        None
    );
    assert_eq!(da2.store_mut().query_count(), after_first);
    // The untouched default store never saw a query.
    assert_eq!(da.store_mut().query_count(), 0);
}

#[test]
fn test_owning_vector_load_sets_back_links() {
    let mut da = store();
    da.store_mut().script_ints("[OwnFlid$]", &[&[5, 51], &[5, 52]]);
    assert_eq!(
        da.get_vector(Hvo::new(5), SENSES).unwrap(),
        vec![Hvo::new(51), Hvo::new(52)]
    );
    assert_eq!(da.cache().get_owner(Hvo::new(51)), Some(Some(Hvo::new(5))));
}

#[test]
fn test_multi_string_alt_loads_per_ws() {
    let mut da = store();
    let fr = WsId(2);
    let blob = cellar_common::RichString::new("maison", fr).fmt_blob();
    da.store_mut().script(
        "[MultiStr$]",
        vec![Row(vec![
            SqlValue::Int(8),
            SqlValue::Text("maison".into()),
            SqlValue::Bytes(blob),
        ])],
    );
    let got = da.get_multi_string_alt(Hvo::new(8), CITATION, fr).unwrap().unwrap();
    assert_eq!(got.text, "maison");
    assert_eq!(got.first_ws(), Some(fr));
    // The other alternate is independent and still unloaded.
    let q = da.store_mut().query_count();
    da.get_multi_string_alt(Hvo::new(8), CITATION, WsId(3)).unwrap();
    assert_eq!(da.store_mut().query_count(), q + 1);
}

#[test]
fn test_vec_item_out_of_range_is_invalid_argument() {
    let mut da = store();
    da.cache_mut()
        .set_vector(Hvo::new(5), SENSES, vec![Hvo::new(51)]);
    assert_eq!(
        da.get_vec_item(Hvo::new(5), SENSES, 0).unwrap(),
        Hvo::new(51)
    );
    assert!(matches!(
        da.get_vec_item(Hvo::new(5), SENSES, 3),
        Err(cellar_common::DataError::InvalidArgument(_))
    ));
}

#[test]
fn test_store_failure_propagates_for_reads() {
    let mut da = store();
    da.store_mut().fail_next = Some("socket dropped".into());
    assert!(matches!(
        da.get_int_prop(Hvo::new(1), HOMOGRAPH),
        Err(cellar_common::DataError::Store(_))
    ));
}

#[test]
fn test_unknown_field_is_metadata_error() {
    let mut da = store();
    assert!(matches!(
        da.get_int_prop(Hvo::new(1), FieldId::new(99999)),
        Err(cellar_common::DataError::UnknownField(_))
    ));
}

#[test]
fn test_check_time_stamp_detects_conflict() {
    let mut da = store();
    da.set_time_stamp(Hvo::new(4), vec![1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    da.store_mut().script(
        "[UpdStmp] from [CmObject]",
        vec![Row(vec![SqlValue::Bytes(vec![8, 7, 6, 5, 4, 3, 2, 1])])],
    );
    assert_eq!(
        da.check_time_stamp(Hvo::new(4)),
        Err(cellar_common::DataError::StaleTimestamp(Hvo::new(4)))
    );
}

#[test]
fn test_corrupt_timestamp_is_fatal() {
    let mut da = store();
    da.store_mut().script(
        "[UpdStmp] from [CmObject]",
        vec![Row(vec![SqlValue::Bytes(vec![1, 2, 3])])],
    );
    assert!(matches!(
        da.check_time_stamp(Hvo::new(4)),
        Err(cellar_common::DataError::InternalInconsistency(_))
    ));
    assert!(matches!(
        da.set_time_stamp(Hvo::new(4), vec![1, 2]),
        Err(cellar_common::DataError::InternalInconsistency(_))
    ));
}
