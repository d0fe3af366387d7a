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

//! Mutation, undo/redo and cascade tests against the scripted store.

use cellar_common::{ClassId, DictMetadata, FieldId, Hvo, PropType, WsId};
use uuid::Uuid;

use crate::lazy_store::LazyLoadingStore;
use crate::store::{BackingStore, Row, SqlValue};
use crate::testing::MockStore;
use crate::undo::{UndoResult, UndoStack};

const ENTRY: ClassId = ClassId(20);
const SENSE: ClassId = ClassId(21);

const HOMOGRAPH: FieldId = FieldId::new(20001);
const SENSES: FieldId = FieldId::new(20002);
const CITATION: FieldId = FieldId::new(20003);
const CROSS_REFS: FieldId = FieldId::new(20006);
const SEQ_REFS: FieldId = FieldId::new(20007);

fn metadata() -> DictMetadata {
    let mut md = DictMetadata::new();
    md.add_class(ClassId(0), "CmObject", None);
    md.add_class(ENTRY, "LexEntry", Some(ClassId(0)));
    md.add_class(SENSE, "LexSense", Some(ClassId(0)));
    md.add_field(HOMOGRAPH, "HomographNumber", ENTRY, PropType::Integer, None);
    md.add_field(SENSES, "Senses", ENTRY, PropType::OwningSequence, Some(SENSE));
    md.add_field(CITATION, "CitationForm", ENTRY, PropType::MultiString, None);
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
    md
}

fn store_with_handler() -> LazyLoadingStore<MockStore, DictMetadata> {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.set_action_handler(Some(UndoStack::new()));
    da
}

fn stamped_int_row(id: i64, value: i64) -> Row {
    Row(vec![
        SqlValue::Int(id),
        SqlValue::Int(value),
        SqlValue::Bytes(vec![9; 8]),
    ])
}

fn stamp() -> Row {
    Row(vec![SqlValue::Bytes(vec![7; 8])])
}

#[test]
fn test_set_int_updates_store_then_cache() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.set_int(Hvo::new(42), HOMOGRAPH, 5).unwrap();

    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(5));
    let update = da
        .store_mut()
        .journal
        .iter()
        .find(|c| c.text.contains("update [LexEntry] set [HomographNumber]"))
        .expect("update command issued");
    assert_eq!(
        update.params,
        vec![SqlValue::Int(5), SqlValue::Int(42)]
    );
    // The mutation also refreshed the row timestamp.
    assert_eq!(da.cache().get_timestamp(Hvo::new(42)), Some(&vec![7; 8]));
}

#[test]
fn test_set_int_rejects_null_handle() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    assert!(matches!(
        da.set_int(Hvo::NULL, HOMOGRAPH, 5),
        Err(cellar_common::DataError::InvalidArgument(_))
    ));
    assert_eq!(da.store_mut().query_count(), 0);
}

#[test]
fn test_set_int_on_dummy_never_touches_store() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    let dummy = Hvo::new(-3);
    da.set_int(dummy, HOMOGRAPH, 5).unwrap();
    assert_eq!(da.get_int_prop(dummy, HOMOGRAPH).unwrap(), Some(5));
    assert_eq!(da.store_mut().query_count(), 0);
}

#[test]
fn test_set_int_undo_redo_round_trip() {
    let mut da = store_with_handler();
    // The pre-read forces a load of the old value (3); undo reloads restore
    // it; the redo reload sees the store back at 5.
    da.store_mut().script_queue(
        "[HomographNumber], [UpdStmp] from [LexEntry]",
        vec![
            vec![stamped_int_row(42, 3)],
            vec![stamped_int_row(42, 3)],
            vec![stamped_int_row(42, 5)],
        ],
    );
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.store_mut().script_ints("count(*)", &[&[1]]);

    da.set_int(Hvo::new(42), HOMOGRAPH, 5).unwrap();
    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(5));

    assert_eq!(da.undo().unwrap(), UndoResult::Ok);
    // The undo issued the inverse update carrying the prior value.
    let undo_update = da
        .store_mut()
        .journal
        .iter()
        .rev()
        .find(|c| c.text.contains("update [LexEntry] set [HomographNumber]"))
        .unwrap();
    assert_eq!(undo_update.params, vec![SqlValue::Int(3), SqlValue::Int(42)]);
    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(3));

    assert_eq!(da.redo().unwrap(), UndoResult::Ok);
    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(5));
}

#[test]
fn test_undo_verify_failure_applies_nothing() {
    let mut da = store_with_handler();
    da.store_mut().script_queue(
        "[HomographNumber], [UpdStmp] from [LexEntry]",
        vec![vec![stamped_int_row(42, 3)]],
    );
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    // Another client changed the row since: the verify count comes back 0.
    da.store_mut().script_ints("count(*)", &[&[0]]);

    da.set_int(Hvo::new(42), HOMOGRAPH, 5).unwrap();
    let updates_before = da
        .store_mut()
        .count_matching("update [LexEntry] set [HomographNumber]");

    assert_eq!(da.undo().unwrap(), UndoResult::VerifyFailed);
    // No inverse update was issued; the cache still holds the set value.
    assert_eq!(
        da.store_mut()
            .count_matching("update [LexEntry] set [HomographNumber]"),
        updates_before
    );
    assert_eq!(da.get_int_prop(Hvo::new(42), HOMOGRAPH).unwrap(), Some(5));
}

#[test]
fn test_undo_task_nesting_opens_one_transaction() {
    let mut da = store_with_handler();
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.store_mut().script_ints("count(*)", &[&[1]]);
    da.store_mut().script(
        "[HomographNumber], [UpdStmp] from [LexEntry]",
        vec![stamped_int_row(42, 0)],
    );

    da.begin_undo_task("Change homograph").unwrap();
    assert!(da.store_mut().is_transaction_open());
    da.begin_undo_task("nested").unwrap();
    da.set_int(Hvo::new(42), HOMOGRAPH, 5).unwrap();
    da.end_undo_task().unwrap();
    // Still inside the outer task: nothing committed yet.
    assert!(da.store_mut().is_transaction_open());
    assert_eq!(da.store_mut().commits, 0);
    da.end_undo_task().unwrap();
    assert!(!da.store_mut().is_transaction_open());
    assert_eq!(da.store_mut().commits, 1);
}

#[test]
fn test_rollback_resets_nesting_and_clears_stack() {
    let mut da = store_with_handler();
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.store_mut().script(
        "[HomographNumber], [UpdStmp] from [LexEntry]",
        vec![stamped_int_row(42, 0)],
    );

    da.begin_undo_task("doomed").unwrap();
    da.begin_undo_task("inner").unwrap();
    da.set_int(Hvo::new(42), HOMOGRAPH, 5).unwrap();
    da.rollback().unwrap();

    assert!(!da.store_mut().is_transaction_open());
    assert_eq!(da.store_mut().rollbacks, 1);
    assert_eq!(da.undo().unwrap(), UndoResult::Empty);
}

#[test]
fn test_store_failure_aborts_mutation_without_cache_update() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().fail_next = Some("deadlock victim".into());
    assert!(matches!(
        da.set_int(Hvo::new(42), HOMOGRAPH, 5),
        Err(cellar_common::DataError::Store(_))
    ));
    assert_eq!(da.cache().get_int(Hvo::new(42), HOMOGRAPH), None);
}

#[test]
fn test_replace_single_element_is_minimal_diff() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.cache_mut().set_vector(
        Hvo::new(1),
        CROSS_REFS,
        vec![Hvo::new(100), Hvo::new(101), Hvo::new(102)],
    );

    da.replace(Hvo::new(1), CROSS_REFS, 1, 2, &[Hvo::new(200)]).unwrap();

    assert_eq!(
        da.cache().get_vector(Hvo::new(1), CROSS_REFS),
        Some(&vec![Hvo::new(100), Hvo::new(200), Hvo::new(102)])
    );
    // Exactly one single-row delete and one single-row insert; never the
    // batch rewrite.
    assert_eq!(da.store_mut().count_matching("delete top (1)"), 1);
    assert_eq!(
        da.store_mut()
            .count_matching("insert into [LexEntry_CrossReferences]"),
        1
    );
    assert_eq!(da.store_mut().count_matching("ReplaceRefColl$"), 0);
}

#[test]
fn test_replace_batch_goes_through_procedure() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.cache_mut().set_vector(
        Hvo::new(1),
        SEQ_REFS,
        vec![Hvo::new(100), Hvo::new(101), Hvo::new(102)],
    );

    da.replace(
        Hvo::new(1),
        SEQ_REFS,
        0,
        2,
        &[Hvo::new(200), Hvo::new(201), Hvo::new(202)],
    )
    .unwrap();

    assert_eq!(da.store_mut().count_matching("ReplaceRefSeq$"), 1);
    assert_eq!(
        da.cache().get_vector(Hvo::new(1), SEQ_REFS),
        Some(&vec![
            Hvo::new(200),
            Hvo::new(201),
            Hvo::new(202),
            Hvo::new(102)
        ])
    );
}

#[test]
fn test_replace_range_out_of_bounds_rejected() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.cache_mut()
        .set_vector(Hvo::new(1), CROSS_REFS, vec![Hvo::new(100)]);
    assert!(matches!(
        da.replace(Hvo::new(1), CROSS_REFS, 0, 5, &[]),
        Err(cellar_common::DataError::InvalidArgument(_))
    ));
}

#[test]
fn test_make_new_object_in_sequence() {
    let mut da = store_with_handler();
    let guid = Uuid::new_v4();
    da.store_mut().script(
        "CreateOwnedObject$",
        vec![Row(vec![SqlValue::Int(77), SqlValue::Guid(guid)])],
    );
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.cache_mut()
        .set_vector(Hvo::new(5), SENSES, vec![Hvo::new(51), Hvo::new(52)]);

    let new_hvo = da.make_new_object(SENSE.0, Hvo::new(5), SENSES, Some(1)).unwrap();

    assert_eq!(new_hvo, Hvo::new(77));
    assert_eq!(
        da.cache().get_vector(Hvo::new(5), SENSES),
        Some(&vec![Hvo::new(51), Hvo::new(77), Hvo::new(52)])
    );
    assert_eq!(da.cache().get_class(new_hvo), Some(SENSE));
    assert_eq!(da.cache().get_owner(new_hvo), Some(Some(Hvo::new(5))));
    assert!(da.action_handler().unwrap().can_undo());
}

#[test]
fn test_make_new_object_undo_deletes_it() {
    let mut da = store_with_handler();
    da.store_mut().script(
        "CreateOwnedObject$",
        vec![Row(vec![SqlValue::Int(77), SqlValue::Guid(Uuid::new_v4())])],
    );
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.store_mut().script_ints("count(*)", &[&[1]]);
    da.store_mut().script_ints("[OwnFlid$]", &[&[5, 51]]);
    da.cache_mut().set_vector(Hvo::new(5), SENSES, vec![Hvo::new(51)]);

    da.make_new_object(SENSE.0, Hvo::new(5), SENSES, Some(1)).unwrap();
    assert_eq!(da.undo().unwrap(), UndoResult::Ok);
    assert_eq!(da.store_mut().count_matching("DeleteObjects"), 1);
    // The reload restored the owner's vector to its pre-create membership.
    assert_eq!(
        da.cache().get_vector(Hvo::new(5), SENSES),
        Some(&vec![Hvo::new(51)])
    );
}

#[test]
fn test_make_new_object_requires_ordinal_for_sequences() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    assert!(matches!(
        da.make_new_object(SENSE.0, Hvo::new(5), SENSES, None),
        Err(cellar_common::DataError::InvalidArgument(_))
    ));
}

#[test]
fn test_delete_with_no_incoming_refs_skips_cleanup() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    // The linked-objects query reports only the owned closure (kind 0).
    da.store_mut().script_ints("GetLinkedObjects$", &[&[55, 0]]);
    da.cache_mut()
        .set_vector(Hvo::new(5), SENSES, vec![Hvo::new(55), Hvo::new(56)]);
    // A reference vector elsewhere mentions the object; with zero incoming
    // references reported, the expensive purge must not run.
    da.cache_mut()
        .set_vector(Hvo::new(9), CROSS_REFS, vec![Hvo::new(55)]);

    da.delete_obj_owner(Hvo::new(5), Hvo::new(55), SENSES).unwrap();

    assert_eq!(
        da.cache().get_vector(Hvo::new(5), SENSES),
        Some(&vec![Hvo::new(56)])
    );
    // Untouched: the skip path left the stale entry alone.
    assert_eq!(
        da.cache().get_vector(Hvo::new(9), CROSS_REFS),
        Some(&vec![Hvo::new(55)])
    );
    // The object's own keys are gone regardless.
    assert_eq!(da.cache().get_owner(Hvo::new(55)), None);
}

#[test]
fn test_delete_with_incoming_refs_purges_them() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    // Owned closure (55 and its owned child 60), plus one incoming-reference
    // source (kind 1).
    da.store_mut()
        .script_ints("GetLinkedObjects$", &[&[55, 0], &[60, 0], &[9, 1]]);
    da.cache_mut()
        .set_vector(Hvo::new(5), SENSES, vec![Hvo::new(55)]);
    da.cache_mut()
        .set_vector(Hvo::new(9), CROSS_REFS, vec![Hvo::new(100), Hvo::new(60)]);
    da.cache_mut().set_int(Hvo::new(60), HOMOGRAPH, 1);

    da.delete_obj_owner(Hvo::new(5), Hvo::new(55), SENSES).unwrap();

    // Cascade: the owned child's cache state is gone too.
    assert_eq!(da.cache().get_int(Hvo::new(60), HOMOGRAPH), None);
    // And the incoming reference entry was removed.
    assert_eq!(
        da.cache().get_vector(Hvo::new(9), CROSS_REFS),
        Some(&vec![Hvo::new(100)])
    );
    assert_eq!(da.store_mut().count_matching("DeleteObjects"), 1);
}

#[test]
fn test_move_own_seq_between_owners() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.cache_mut().set_vector(
        Hvo::new(5),
        SENSES,
        vec![Hvo::new(51), Hvo::new(52), Hvo::new(53)],
    );
    da.cache_mut().set_vector(Hvo::new(6), SENSES, vec![Hvo::new(61)]);

    da.move_own_seq(Hvo::new(5), SENSES, 1, 2, Hvo::new(6), SENSES, Some(0))
        .unwrap();

    assert_eq!(
        da.cache().get_vector(Hvo::new(5), SENSES),
        Some(&vec![Hvo::new(51)])
    );
    assert_eq!(
        da.cache().get_vector(Hvo::new(6), SENSES),
        Some(&vec![Hvo::new(52), Hvo::new(53), Hvo::new(61)])
    );
    assert_eq!(da.cache().get_owner(Hvo::new(52)), Some(Some(Hvo::new(6))));
    assert_eq!(da.store_mut().count_matching("MoveOwnedObject$"), 1);
}

#[test]
fn test_set_obj_list_wholesale_rewrite() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.cache_mut()
        .set_vector(Hvo::new(1), CROSS_REFS, vec![Hvo::new(100)]);

    da.set_obj_list(Hvo::new(1), CROSS_REFS, &[Hvo::new(200), Hvo::new(201)])
        .unwrap();

    assert_eq!(da.store_mut().count_matching("SetObjList$"), 1);
    assert_eq!(
        da.cache().get_vector(Hvo::new(1), CROSS_REFS),
        Some(&vec![Hvo::new(200), Hvo::new(201)])
    );
}

#[test]
fn test_set_multi_string_alt_uses_procedure() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    let fr = WsId(2);
    let value = cellar_common::RichString::new("maison", fr);
    da.set_multi_string_alt(Hvo::new(8), CITATION, fr, value.clone())
        .unwrap();
    assert_eq!(da.store_mut().count_matching("SetMultiStr$"), 1);
    assert_eq!(
        da.get_multi_string_alt(Hvo::new(8), CITATION, fr).unwrap(),
        Some(value)
    );
}

#[test]
fn test_rel_extra_insert_and_read_back() {
    let mut da = LazyLoadingStore::new(MockStore::new(), metadata());
    da.store_mut().script("[UpdStmp] from [CmObject]", vec![stamp()]);
    da.cache_mut()
        .set_vector(Hvo::new(1), SEQ_REFS, vec![Hvo::new(100)]);

    da.insert_rel_extra(Hvo::new(1), SEQ_REFS, 1, Hvo::new(200), "uses")
        .unwrap();
    assert_eq!(
        da.cache().get_vector(Hvo::new(1), SEQ_REFS),
        Some(&vec![Hvo::new(100), Hvo::new(200)])
    );
    assert_eq!(
        da.get_rel_extra(Hvo::new(1), SEQ_REFS, 1).unwrap(),
        Some("uses".to_string())
    );

    da.update_rel_extra(Hvo::new(1), SEQ_REFS, 1, "derives from").unwrap();
    assert_eq!(
        da.get_rel_extra(Hvo::new(1), SEQ_REFS, 1).unwrap(),
        Some("derives from".to_string())
    );
}
