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

//! The mutation API. Every mutation runs against the backing store and then
//! updates the cache to match, with no re-read round trip. When an action
//! handler is attached, the current value is read first (forcing a load if
//! necessary) so the symmetric undo command, the verify predicates and the
//! reload spec can be recorded before the store changes.

use cellar_common::{DataError, FieldId, Hvo, MetadataCache, PropType, RichString, WsId};
use tracing::warn;
use uuid::Uuid;

use crate::lazy_store::{LazyLoadingStore, LoadScope};
use crate::object_cache::PropChange;
use crate::store::{
    BackingStore, SqlCommand, SqlValue, create_owned_object_cmd, delete_objects_cmd,
    get_linked_objects_cmd, move_owned_object_cmd, replace_ref_coll_cmd, replace_ref_seq_cmd,
    set_multi_cmd, set_obj_list_cmd,
};
use crate::undo::{ReloadSpec, SqlUndoAction, Verify, text_equals_clause, text_equals_params};

impl<S: BackingStore, M: MetadataCache> LazyLoadingStore<S, M> {
    fn handler_attached(&self) -> bool {
        self.handler.is_some()
    }

    fn push_action(&mut self, action: SqlUndoAction) {
        if let Some(stack) = self.handler.as_mut() {
            stack.add_action(action);
        }
    }

    fn notify_scalar(&mut self, hvo: Hvo, tag: FieldId) {
        self.dispatch(vec![PropChange {
            hvo,
            tag,
            iv_min: 0,
            cv_ins: 0,
            cv_del: 0,
        }]);
    }

    fn resolve_column(&self, tag: FieldId) -> Result<(String, String), DataError> {
        let class_name = self.metadata.base_class_name(tag)?.to_string();
        let field_name = self.metadata.field_name(tag)?.to_string();
        Ok((class_name, field_name))
    }

    fn reload_spec_for(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ws: WsId,
    ) -> Result<ReloadSpec, DataError> {
        let ptype = self.metadata.field_type(tag)?;
        let (cmd, cols, requested) = self.build_prop_query(hvo, tag, ws, ptype, LoadScope::This)?;
        Ok(ReloadSpec {
            cmd,
            cols,
            requested,
        })
    }

    fn scalar_update_cmd(
        class_name: &str,
        field_name: &str,
        hvo: Hvo,
        value: SqlValue,
    ) -> SqlCommand {
        SqlCommand::with_params(
            format!("update [{class_name}] set [{field_name}] = ? where [Id] = ?"),
            vec![value, SqlValue::Int(hvo.id() as i64)],
        )
    }

    /// A verify predicate asserting the column currently holds `value`.
    /// Text equality tolerates NULL-for-empty, since the backing rendering
    /// of "empty" is not consistent.
    fn scalar_verify(class_name: &str, field_name: &str, hvo: Hvo, value: &SqlValue) -> Verify {
        let (clause, mut params) = match value {
            SqlValue::Text(s) => (text_equals_clause(field_name), text_equals_params(s)),
            SqlValue::Null => (format!("[{field_name}] is null"), vec![]),
            SqlValue::Bytes(b) if b.is_empty() => (
                format!("([{field_name}] is null or datalength([{field_name}]) = 0)"),
                vec![],
            ),
            other => (format!("[{field_name}] = ?"), vec![other.clone()]),
        };
        params.push(SqlValue::Int(hvo.id() as i64));
        Verify::RowCount {
            cmd: SqlCommand::with_params(
                format!("select count(*) from [{class_name}] where {clause} and [Id] = ?"),
                params,
            ),
            expect: 1,
        }
    }

    /// The shared scalar-setter skeleton: reject null handles, short-circuit
    /// dummies to a cache-only write, record the undo bundle, execute,
    /// restamp, update the cache.
    #[allow(clippy::too_many_arguments)]
    fn set_scalar(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        new_value: SqlValue,
        old_value: SqlValue,
        cache_write: impl FnOnce(&mut Self),
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in setter".into(),
            ));
        }
        if hvo.is_dummy() {
            cache_write(self);
            self.notify_scalar(hvo, tag);
            return Ok(());
        }
        let (class_name, field_name) = self.resolve_column(tag)?;
        let redo = Self::scalar_update_cmd(&class_name, &field_name, hvo, new_value.clone());

        if self.handler_attached() {
            let undo = Self::scalar_update_cmd(&class_name, &field_name, hvo, old_value.clone());
            let verify_redoable =
                Some(Self::scalar_verify(&class_name, &field_name, hvo, &old_value));
            let verify_undoable =
                Some(Self::scalar_verify(&class_name, &field_name, hvo, &new_value));
            let reload = Some(self.reload_spec_for(hvo, tag, WsId::NONE)?);
            self.push_action(SqlUndoAction {
                redo_cmds: vec![redo.clone()],
                undo_cmds: vec![undo],
                verify_redoable,
                verify_undoable,
                reload,
            });
        }

        self.store.execute(&redo)?;
        self.refresh_timestamp(hvo)?;
        cache_write(self);
        self.notify_scalar(hvo, tag);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scalar setters.
    // ------------------------------------------------------------------

    pub fn set_int(&mut self, hvo: Hvo, tag: FieldId, n: i64) -> Result<(), DataError> {
        let old = self.current_int(hvo, tag)?;
        self.set_scalar(
            hvo,
            tag,
            SqlValue::Int(n),
            SqlValue::Int(old),
            |this| this.cache.set_int(hvo, tag, n),
        )
    }

    pub fn set_boolean(&mut self, hvo: Hvo, tag: FieldId, value: bool) -> Result<(), DataError> {
        self.set_int(hvo, tag, value as i64)
    }

    pub fn set_int64(&mut self, hvo: Hvo, tag: FieldId, n: i64) -> Result<(), DataError> {
        let old = self.current_int64(hvo, tag)?;
        self.set_scalar(
            hvo,
            tag,
            SqlValue::Int(n),
            SqlValue::Int(old),
            |this| this.cache.set_int64(hvo, tag, n),
        )
    }

    pub fn set_time(&mut self, hvo: Hvo, tag: FieldId, msec: i64) -> Result<(), DataError> {
        let old = self.current_int64(hvo, tag)?;
        self.set_scalar(
            hvo,
            tag,
            SqlValue::Time(msec),
            SqlValue::Time(old),
            |this| this.cache.set_int64(hvo, tag, msec),
        )
    }

    pub fn set_guid(&mut self, hvo: Hvo, tag: FieldId, guid: Uuid) -> Result<(), DataError> {
        let old = if self.handler_attached() {
            self.get_guid_prop(hvo, tag)?
                .map(SqlValue::Guid)
                .unwrap_or(SqlValue::Null)
        } else {
            SqlValue::Null
        };
        self.set_scalar(hvo, tag, SqlValue::Guid(guid), old, |this| {
            this.cache.set_guid(hvo, tag, guid)
        })
    }

    pub fn set_unicode(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        value: String,
    ) -> Result<(), DataError> {
        let old = if self.handler_attached() {
            SqlValue::Text(self.get_unicode_prop(hvo, tag)?.unwrap_or_default())
        } else {
            SqlValue::Null
        };
        let new_value = SqlValue::Text(value.clone());
        self.set_scalar(hvo, tag, new_value, old, |this| {
            this.cache.set_unicode(hvo, tag, value)
        })
    }

    pub fn set_binary(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        bytes: Vec<u8>,
    ) -> Result<(), DataError> {
        let old = if self.handler_attached() {
            SqlValue::Bytes(self.get_binary_prop(hvo, tag)?.unwrap_or_default())
        } else {
            SqlValue::Null
        };
        let new_value = SqlValue::Bytes(bytes.clone());
        self.set_scalar(hvo, tag, new_value, old, |this| {
            this.cache.set_binary(hvo, tag, bytes)
        })
    }

    fn current_int(&mut self, hvo: Hvo, tag: FieldId) -> Result<i64, DataError> {
        if !self.handler_attached() || hvo.is_dummy() {
            return Ok(0);
        }
        Ok(self.get_int_prop(hvo, tag)?.unwrap_or(0))
    }

    fn current_int64(&mut self, hvo: Hvo, tag: FieldId) -> Result<i64, DataError> {
        if !self.handler_attached() || hvo.is_dummy() {
            return Ok(0);
        }
        Ok(self.get_int64_prop(hvo, tag)?.unwrap_or(0))
    }

    /// Formatted strings update the text column and its paired formatting
    /// column in one command.
    pub fn set_string(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        value: RichString,
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in setter".into(),
            ));
        }
        if hvo.is_dummy() {
            self.cache.set_string(hvo, tag, value);
            self.notify_scalar(hvo, tag);
            return Ok(());
        }
        let (class_name, field_name) = self.resolve_column(tag)?;
        let update = |v: &RichString| {
            SqlCommand::with_params(
                format!(
                    "update [{class_name}] set [{field_name}] = ?, [{field_name}_Fmt] = ? where [Id] = ?"
                ),
                vec![
                    SqlValue::Text(v.text.clone()),
                    SqlValue::Bytes(v.fmt_blob()),
                    SqlValue::Int(hvo.id() as i64),
                ],
            )
        };
        let redo = update(&value);

        if self.handler_attached() {
            let old = self
                .get_string_prop(hvo, tag)?
                .unwrap_or_else(|| RichString::empty(value.first_ws().unwrap_or(WsId::NONE)));
            let undo = update(&old);
            let verify_redoable = Some(Self::scalar_verify(
                &class_name,
                &field_name,
                hvo,
                &SqlValue::Text(old.text.clone()),
            ));
            let verify_undoable = Some(Self::scalar_verify(
                &class_name,
                &field_name,
                hvo,
                &SqlValue::Text(value.text.clone()),
            ));
            let reload = Some(self.reload_spec_for(hvo, tag, WsId::NONE)?);
            self.push_action(SqlUndoAction {
                redo_cmds: vec![redo.clone()],
                undo_cmds: vec![undo],
                verify_redoable,
                verify_undoable,
                reload,
            });
        }

        self.store.execute(&redo)?;
        self.refresh_timestamp(hvo)?;
        self.cache.set_string(hvo, tag, value);
        self.notify_scalar(hvo, tag);
        Ok(())
    }

    /// Multilingual alternates go through the SetMulti* procedures.
    pub fn set_multi_string_alt(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ws: WsId,
        value: RichString,
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in setter".into(),
            ));
        }
        if ws.is_none() {
            return Err(DataError::InvalidArgument(
                "multilingual setter requires a writing system".into(),
            ));
        }
        if hvo.is_dummy() {
            self.cache.set_multi_string(hvo, tag, ws, value);
            self.notify_scalar(hvo, tag);
            return Ok(());
        }
        let ptype = self.metadata.field_type(tag)?;
        let (proc_name, table) = match ptype {
            PropType::MultiString => ("SetMultiStr$", "MultiStr$"),
            PropType::MultiBigString => ("SetMultiBigStr$", "MultiBigStr$"),
            _ => {
                return Err(DataError::TypeMismatch(format!(
                    "field {tag} is {ptype}, not a multilingual string"
                )));
            }
        };
        let make = |v: &RichString| {
            set_multi_cmd(
                proc_name,
                hvo,
                tag,
                ws.0,
                vec![SqlValue::Text(v.text.clone()), SqlValue::Bytes(v.fmt_blob())],
            )
        };
        let redo = make(&value);

        if self.handler_attached() {
            let old = self.get_multi_string_alt(hvo, tag, ws)?;
            let undo = make(&old.clone().unwrap_or_else(|| RichString::empty(ws)));
            let alt_verify = |text: Option<&str>| {
                let base =
                    "select count(*) from [{t}] where [Obj] = ? and [Flid] = ? and [Ws] = ?"
                        .replace("{t}", table);
                let mut params = vec![
                    SqlValue::Int(hvo.id() as i64),
                    SqlValue::Int(tag.id() as i64),
                    SqlValue::Int(ws.0 as i64),
                ];
                match text {
                    Some(t) if !t.is_empty() => {
                        params.extend(text_equals_params(t));
                        Verify::RowCount {
                            cmd: SqlCommand::with_params(
                                format!("{base} and {}", text_equals_clause("Txt")),
                                params,
                            ),
                            expect: 1,
                        }
                    }
                    // An empty alternate may be a missing row or an empty
                    // value; assert no non-empty row exists.
                    _ => Verify::RowCount {
                        cmd: SqlCommand::with_params(
                            format!("{base} and [Txt] is not null and [Txt] <> ''"),
                            params,
                        ),
                        expect: 0,
                    },
                }
            };
            let verify_redoable = Some(alt_verify(old.as_ref().map(|v| v.text.as_str())));
            let verify_undoable = Some(alt_verify(Some(value.text.as_str())));
            let reload = Some(self.reload_spec_for(hvo, tag, ws)?);
            self.push_action(SqlUndoAction {
                redo_cmds: vec![redo.clone()],
                undo_cmds: vec![undo],
                verify_redoable,
                verify_undoable,
                reload,
            });
        }

        self.store.execute(&redo)?;
        self.refresh_timestamp(hvo)?;
        self.cache.set_multi_string(hvo, tag, ws, value);
        self.notify_scalar(hvo, tag);
        Ok(())
    }

    pub fn set_multi_unicode_alt(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ws: WsId,
        value: String,
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in setter".into(),
            ));
        }
        if hvo.is_dummy() {
            self.cache.set_multi_unicode(hvo, tag, ws, value);
            self.notify_scalar(hvo, tag);
            return Ok(());
        }
        let ptype = self.metadata.field_type(tag)?;
        let proc_name = match ptype {
            PropType::MultiUnicode => "SetMultiTxt$",
            PropType::MultiBigUnicode => "SetMultiBigTxt$",
            _ => {
                return Err(DataError::TypeMismatch(format!(
                    "field {tag} is {ptype}, not a multilingual unicode"
                )));
            }
        };
        let make = |v: &str| set_multi_cmd(proc_name, hvo, tag, ws.0, vec![SqlValue::Text(v.into())]);
        let redo = make(&value);

        if self.handler_attached() {
            let old = self.get_multi_unicode_alt(hvo, tag, ws)?.unwrap_or_default();
            let undo = make(&old);
            let reload = Some(self.reload_spec_for(hvo, tag, ws)?);
            self.push_action(SqlUndoAction {
                redo_cmds: vec![redo.clone()],
                undo_cmds: vec![undo],
                verify_redoable: None,
                verify_undoable: None,
                reload,
            });
        }

        self.store.execute(&redo)?;
        self.refresh_timestamp(hvo)?;
        self.cache.set_multi_unicode(hvo, tag, ws, value);
        self.notify_scalar(hvo, tag);
        Ok(())
    }

    /// Atomic reference setter. Owning-atomic relationships change through
    /// `make_new_object`/`move_own`/deletion, not here.
    pub fn set_obj_prop(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        value: Option<Hvo>,
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in setter".into(),
            ));
        }
        let ptype = self.metadata.field_type(tag)?;
        if ptype != PropType::ReferenceAtomic {
            return Err(DataError::TypeMismatch(format!(
                "field {tag} is {ptype}, not an atomic reference"
            )));
        }
        if hvo.is_dummy() {
            self.cache.set_object(hvo, tag, value);
            self.notify_scalar(hvo, tag);
            return Ok(());
        }
        let old = if self.handler_attached() {
            self.get_object_prop(hvo, tag)?
        } else {
            None
        };
        let to_sql = |v: Option<Hvo>| {
            v.map(|h| SqlValue::Int(h.id() as i64))
                .unwrap_or(SqlValue::Null)
        };
        let new_value = to_sql(value);
        let old_value = to_sql(old);
        self.set_scalar(hvo, tag, new_value, old_value, |this| {
            this.cache.set_object(hvo, tag, value)
        })
    }

    // ------------------------------------------------------------------
    // Structural mutations.
    // ------------------------------------------------------------------

    /// Create a new object owned at (owner, tag). For owning sequences `ord`
    /// is the insertion position; collections and atomics pass None.
    pub fn make_new_object(
        &mut self,
        clid: u32,
        owner: Hvo,
        tag: FieldId,
        ord: Option<i32>,
    ) -> Result<Hvo, DataError> {
        if owner.is_null() {
            return Err(DataError::InvalidArgument(
                "null owner in make_new_object".into(),
            ));
        }
        let ptype = self.metadata.field_type(tag)?;
        if !ptype.is_owning() {
            return Err(DataError::TypeMismatch(format!(
                "field {tag} is {ptype}, not an owning property"
            )));
        }
        if ptype == PropType::OwningSequence && ord.is_none() {
            return Err(DataError::InvalidArgument(
                "owning-sequence insertion requires an ordinal".into(),
            ));
        }

        let create = create_owned_object_cmd(clid, owner, tag, ord);
        let rows = self.run_query(&create)?;
        let row = rows.first().ok_or_else(|| {
            DataError::Store("CreateOwnedObject$ returned no new-object row".into())
        })?;
        let new_hvo = row.hvo(0).ok_or_else(|| {
            DataError::Store("CreateOwnedObject$ returned a null object id".into())
        })?;
        let guid = row.col(1).guid();

        if self.handler_attached() {
            let reload = self.reload_spec_for(owner, tag, WsId::NONE)?;
            self.push_action(SqlUndoAction {
                redo_cmds: vec![create.clone()],
                undo_cmds: vec![delete_objects_cmd(&[new_hvo])],
                verify_redoable: Some(Verify::RowCount {
                    cmd: SqlCommand::with_params(
                        "select count(*) from [CmObject] where [Id] = ?",
                        vec![SqlValue::Int(new_hvo.id() as i64)],
                    ),
                    expect: 0,
                }),
                verify_undoable: Some(Verify::RowCount {
                    cmd: SqlCommand::with_params(
                        "select count(*) from [CmObject] where [Id] = ?",
                        vec![SqlValue::Int(new_hvo.id() as i64)],
                    ),
                    expect: 1,
                }),
                reload: Some(reload),
            });
        }

        // The store's triggers stamped the owner, and an insertion into a
        // sequence shifts the implicit ordering-dependent stamps of every
        // subsequent sibling.
        self.refresh_timestamp(owner)?;
        self.refresh_timestamp(new_hvo)?;
        let shifted: Vec<Hvo> = match (ptype, ord) {
            (PropType::OwningSequence, Some(at)) => self
                .cache
                .get_vector(owner, tag)
                .map(|v| v.iter().skip(at as usize).copied().collect())
                .unwrap_or_default(),
            _ => vec![],
        };
        for sibling in shifted {
            self.refresh_timestamp(sibling)?;
        }

        self.cache
            .set_object_info(new_hvo, cellar_common::ClassId(clid), guid, Some(owner), Some(tag), ord);
        match ptype {
            PropType::OwningAtomic => {
                self.cache.set_object(owner, tag, Some(new_hvo));
                self.notify_scalar(owner, tag);
            }
            _ => {
                let mut items = self.cache.get_vector(owner, tag).cloned().unwrap_or_default();
                let at = ord
                    .map(|o| (o as usize).min(items.len()))
                    .unwrap_or(items.len());
                items.insert(at, new_hvo);
                self.cache.set_vector(owner, tag, items);
                self.dispatch(vec![PropChange {
                    hvo: owner,
                    tag,
                    iv_min: at,
                    cv_ins: 1,
                    cv_del: 0,
                }]);
            }
        }
        Ok(new_hvo)
    }

    /// Delete an object out of its owning property. Cascades through
    /// everything the object transitively owns, plus all incoming references
    /// to any deleted object.
    pub fn delete_obj_owner(
        &mut self,
        owner: Hvo,
        hvo: Hvo,
        tag: FieldId,
    ) -> Result<(), DataError> {
        self.delete_impl(hvo, Some((owner, tag)))
    }

    pub fn delete_obj(&mut self, hvo: Hvo) -> Result<(), DataError> {
        self.delete_impl(hvo, None)
    }

    fn delete_impl(
        &mut self,
        hvo: Hvo,
        owner_info: Option<(Hvo, FieldId)>,
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in delete".into(),
            ));
        }
        if hvo.is_dummy() {
            self.cache.remove_object(hvo);
            return Ok(());
        }

        // One linked-objects query yields both the owned closure (kind 0)
        // and the incoming-reference sources (kind 1).
        let linked = self.run_query(&get_linked_objects_cmd(hvo, true))?;
        let mut owned: Vec<Hvo> = vec![hvo];
        let mut incoming = 0usize;
        for row in &linked {
            let Some(h) = row.hvo(0) else { continue };
            if row.int_or_zero(1) == 0 {
                if !owned.contains(&h) {
                    owned.push(h);
                }
            } else {
                incoming += 1;
            }
        }

        let delete = delete_objects_cmd(&owned);

        if self.handler_attached() {
            match self.gather_restore_cmds(&owned) {
                Ok(restore_cmds) => {
                    let reload = owner_info
                        .map(|(owner, tag)| self.reload_spec_for(owner, tag, WsId::NONE))
                        .transpose()?;
                    self.push_action(SqlUndoAction {
                        redo_cmds: vec![delete.clone()],
                        undo_cmds: restore_cmds,
                        verify_redoable: Some(Verify::RowCount {
                            cmd: SqlCommand::with_params(
                                "select count(*) from [CmObject] where [Id] = ?",
                                vec![SqlValue::Int(hvo.id() as i64)],
                            ),
                            expect: 1,
                        }),
                        verify_undoable: Some(Verify::RowCount {
                            cmd: SqlCommand::with_params(
                                "select count(*) from [CmObject] where [Id] = ?",
                                vec![SqlValue::Int(hvo.id() as i64)],
                            ),
                            expect: 0,
                        }),
                        reload,
                    });
                }
                Err(e) => {
                    // The delete still applies; undo for it is unavailable.
                    warn!("could not gather undo state for delete of {hvo}: {e}");
                }
            }
        }

        self.store.execute(&delete)?;

        // Cache cleanup: drop every property keyed by a deleted object, and
        // only when something actually points at them, purge those entries.
        for dead in &owned {
            self.cache.remove_object(*dead);
        }
        if incoming > 0 {
            self.cache.remove_incoming_refs(&owned);
        }

        if let Some((owner, tag)) = owner_info {
            if let Some(items) = self.cache.get_vector(owner, tag) {
                if let Some(pos) = items.iter().position(|h| *h == hvo) {
                    let mut items = items.clone();
                    items.remove(pos);
                    self.cache.set_vector(owner, tag, items);
                    self.dispatch(vec![PropChange {
                        hvo: owner,
                        tag,
                        iv_min: pos,
                        cv_ins: 0,
                        cv_del: 1,
                    }]);
                }
            }
            if let Some(Some(h)) = self.cache.get_object(owner, tag) {
                if h == hvo {
                    self.cache.set_object(owner, tag, None);
                    self.notify_scalar(owner, tag);
                }
            }
            self.refresh_timestamp(owner)?;
        }
        Ok(())
    }

    /// Capture the object rows needed to restore a deleted closure. Undo
    /// replays these inserts rather than reversing the cascade step by step.
    fn gather_restore_cmds(&mut self, owned: &[Hvo]) -> Result<Vec<SqlCommand>, DataError> {
        let ids = owned
            .iter()
            .map(|h| h.id().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let rows = self.run_query(&SqlCommand::new(format!(
            "select [Id], [Class$], [Owner$], [OwnFlid$], [OwnOrd$], [Guid$] from [CmObject] where [Id] in ({ids})"
        )))?;
        let mut cmds = vec![];
        for row in &rows {
            cmds.push(SqlCommand::with_params(
                "insert into [CmObject] ([Id], [Class$], [Owner$], [OwnFlid$], [OwnOrd$], [Guid$]) values (?, ?, ?, ?, ?, ?)",
                row.0.clone(),
            ));
        }
        Ok(cmds)
    }

    /// Move a run of owned-sequence members to another owning property.
    #[allow(clippy::too_many_arguments)]
    pub fn move_own_seq(
        &mut self,
        src_owner: Hvo,
        src_tag: FieldId,
        ihvo_start: usize,
        ihvo_end: usize,
        dst_owner: Hvo,
        dst_tag: FieldId,
        ihvo_dst_before: Option<usize>,
    ) -> Result<(), DataError> {
        if src_owner.is_null() || dst_owner.is_null() {
            return Err(DataError::InvalidArgument("null owner in move".into()));
        }
        if ihvo_end < ihvo_start {
            return Err(DataError::InvalidArgument(
                "move range end precedes start".into(),
            ));
        }
        let src_items = self.get_vector(src_owner, src_tag)?;
        if ihvo_end >= src_items.len() {
            return Err(DataError::InvalidArgument(format!(
                "move range {ihvo_start}..={ihvo_end} out of range (len {})",
                src_items.len()
            )));
        }
        let moved: Vec<Hvo> = src_items[ihvo_start..=ihvo_end].to_vec();
        let dst_items = self.get_vector(dst_owner, dst_tag)?;
        let dst_at = ihvo_dst_before.unwrap_or(dst_items.len()).min(dst_items.len());
        let dst_before = dst_items.get(dst_at).copied();

        let cmd = move_owned_object_cmd(
            src_owner,
            src_tag,
            moved[0],
            *moved.last().unwrap(),
            dst_owner,
            dst_tag,
            dst_before,
        );

        if self.handler_attached() {
            // The inverse move returns the block to its old position in the
            // source; the verify re-derives the block's expected membership
            // by occurrence counts, since positional checks are unsound when
            // duplicates are possible.
            let back_before = src_items.get(ihvo_start + moved.len()).copied()
                .or_else(|| src_items.get(ihvo_start).copied().filter(|h| !moved.contains(h)));
            let undo = move_owned_object_cmd(
                dst_owner,
                dst_tag,
                moved[0],
                *moved.last().unwrap(),
                src_owner,
                src_tag,
                back_before,
            );
            let membership = |owner: Hvo, tag: FieldId| {
                SqlCommand::with_params(
                    "select [Id], count(*) from [CmObject] where [Owner$] = ? and [OwnFlid$] = ? group by [Id]",
                    vec![
                        SqlValue::Int(owner.id() as i64),
                        SqlValue::Int(tag.id() as i64),
                    ],
                )
            };
            let verify_redoable = Some(Verify::OccurrenceCounts {
                cmd: membership(src_owner, src_tag),
                expect: occurrence_counts(&src_items),
            });
            let mut expected_dst = dst_items.clone();
            for (i, h) in moved.iter().enumerate() {
                expected_dst.insert(dst_at + i, *h);
            }
            let verify_undoable = Some(Verify::OccurrenceCounts {
                cmd: membership(dst_owner, dst_tag),
                expect: occurrence_counts(&expected_dst),
            });
            let reload_src = self.reload_spec_for(src_owner, src_tag, WsId::NONE)?;
            let reload_dst = self.reload_spec_for(dst_owner, dst_tag, WsId::NONE)?;
            self.push_action(SqlUndoAction {
                redo_cmds: vec![cmd.clone()],
                undo_cmds: vec![undo],
                verify_redoable,
                verify_undoable,
                reload: Some(reload_src),
            });
            // The destination side reloads through its own no-op action so
            // both vectors refresh on replay.
            self.push_action(SqlUndoAction {
                redo_cmds: vec![],
                undo_cmds: vec![],
                verify_redoable: None,
                verify_undoable: None,
                reload: Some(reload_dst),
            });
        }

        self.store.execute(&cmd)?;

        // Cache: splice out of the source, into the destination.
        let mut new_src = src_items.clone();
        new_src.drain(ihvo_start..=ihvo_end);
        let mut new_dst = dst_items.clone();
        for (i, h) in moved.iter().enumerate() {
            new_dst.insert(dst_at + i, *h);
            self.cache.set_owner_link(*h, dst_owner, dst_tag);
        }
        self.cache.set_vector(src_owner, src_tag, new_src);
        self.cache.set_vector(dst_owner, dst_tag, new_dst);

        self.refresh_timestamp(src_owner)?;
        self.refresh_timestamp(dst_owner)?;
        for h in &moved {
            self.refresh_timestamp(*h)?;
        }
        let n = moved.len();
        self.dispatch(vec![
            PropChange {
                hvo: src_owner,
                tag: src_tag,
                iv_min: ihvo_start,
                cv_ins: 0,
                cv_del: n,
            },
            PropChange {
                hvo: dst_owner,
                tag: dst_tag,
                iv_min: dst_at,
                cv_ins: n,
                cv_del: 0,
            },
        ]);
        Ok(())
    }

    /// Move one owned object into an atomic or collection owning property.
    pub fn move_own(
        &mut self,
        src_owner: Hvo,
        src_tag: FieldId,
        hvo: Hvo,
        dst_owner: Hvo,
        dst_tag: FieldId,
    ) -> Result<(), DataError> {
        let src_items = self.get_vector(src_owner, src_tag)?;
        let Some(pos) = src_items.iter().position(|h| *h == hvo) else {
            return Err(DataError::InvalidArgument(format!(
                "{hvo} is not owned at {src_owner} field {src_tag}"
            )));
        };
        self.move_own_seq(src_owner, src_tag, pos, pos, dst_owner, dst_tag, None)
    }

    /// Replace the range [ihvo_min, ihvo_lim) of a reference vector with new
    /// items, issuing a minimal diff against the store - never a rewrite.
    pub fn replace(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ihvo_min: usize,
        ihvo_lim: usize,
        inserted: &[Hvo],
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in replace".into(),
            ));
        }
        let ptype = self.metadata.field_type(tag)?;
        let is_seq = match ptype {
            PropType::ReferenceSequence => true,
            PropType::ReferenceCollection => false,
            _ => {
                return Err(DataError::TypeMismatch(format!(
                    "field {tag} is {ptype}, not a reference vector"
                )));
            }
        };
        if hvo.is_dummy() {
            let mut items = self.cache.get_vector(hvo, tag).cloned().unwrap_or_default();
            if ihvo_lim > items.len() || ihvo_min > ihvo_lim {
                return Err(DataError::InvalidArgument("replace range out of range".into()));
            }
            items.splice(ihvo_min..ihvo_lim, inserted.iter().copied());
            self.cache.set_vector(hvo, tag, items);
            return Ok(());
        }

        let old_items = self.get_vector(hvo, tag)?;
        if ihvo_lim > old_items.len() || ihvo_min > ihvo_lim {
            return Err(DataError::InvalidArgument(format!(
                "replace range {ihvo_min}..{ihvo_lim} out of range (len {})",
                old_items.len()
            )));
        }
        let deleted: Vec<Hvo> = old_items[ihvo_min..ihvo_lim].to_vec();
        let (class_name, field_name) = self.resolve_column(tag)?;
        let table = format!("{class_name}_{field_name}");

        let redo_cmds = self.replace_cmds(&table, is_seq, hvo, tag, ihvo_min, &deleted, inserted);
        let undo_cmds = self.replace_cmds(&table, is_seq, hvo, tag, ihvo_min, inserted, &deleted);

        if self.handler_attached() {
            let mut new_items = old_items.clone();
            new_items.splice(ihvo_min..ihvo_lim, inserted.iter().copied());
            let counts_cmd = SqlCommand::with_params(
                format!("select [Dst], count(*) from [{table}] where [Src] = ? group by [Dst]"),
                vec![SqlValue::Int(hvo.id() as i64)],
            );
            let verify_redoable = Some(self.vector_verify(&table, hvo, &old_items, is_seq, &counts_cmd));
            let verify_undoable = Some(self.vector_verify(&table, hvo, &new_items, is_seq, &counts_cmd));
            let reload = Some(self.reload_spec_for(hvo, tag, WsId::NONE)?);
            self.push_action(SqlUndoAction {
                redo_cmds: redo_cmds.clone(),
                undo_cmds,
                verify_redoable,
                verify_undoable,
                reload,
            });
        }

        for cmd in &redo_cmds {
            self.store.execute(cmd)?;
        }
        self.refresh_timestamp(hvo)?;

        let mut items = old_items;
        items.splice(ihvo_min..ihvo_lim, inserted.iter().copied());
        self.cache.set_vector(hvo, tag, items);
        self.dispatch(vec![PropChange {
            hvo,
            tag,
            iv_min: ihvo_min,
            cv_ins: inserted.len(),
            cv_del: deleted.len(),
        }]);
        Ok(())
    }

    /// The minimal mutation for one vector splice: a single-row delete, a
    /// single-row insert, one of each, or the batch procedure.
    fn replace_cmds(
        &self,
        table: &str,
        is_seq: bool,
        src: Hvo,
        tag: FieldId,
        at: usize,
        deleted: &[Hvo],
        inserted: &[Hvo],
    ) -> Vec<SqlCommand> {
        let mut cmds = vec![];
        match (deleted.len(), inserted.len()) {
            (0, 0) => {}
            (1, 0) | (1, 1) | (0, 1) => {
                if let Some(d) = deleted.first() {
                    let (clause, params) = if is_seq {
                        (
                            "[Src] = ? and [Dst] = ? and [Ord] = ?",
                            vec![
                                SqlValue::Int(src.id() as i64),
                                SqlValue::Int(d.id() as i64),
                                SqlValue::Int(at as i64),
                            ],
                        )
                    } else {
                        (
                            "[Src] = ? and [Dst] = ?",
                            vec![SqlValue::Int(src.id() as i64), SqlValue::Int(d.id() as i64)],
                        )
                    };
                    cmds.push(SqlCommand::with_params(
                        format!("delete top (1) from [{table}] where {clause}"),
                        params,
                    ));
                }
                if let Some(i) = inserted.first() {
                    if is_seq {
                        cmds.push(SqlCommand::with_params(
                            format!("insert into [{table}] ([Src], [Dst], [Ord]) values (?, ?, ?)"),
                            vec![
                                SqlValue::Int(src.id() as i64),
                                SqlValue::Int(i.id() as i64),
                                SqlValue::Int(at as i64),
                            ],
                        ));
                    } else {
                        cmds.push(SqlCommand::with_params(
                            format!("insert into [{table}] ([Src], [Dst]) values (?, ?)"),
                            vec![SqlValue::Int(src.id() as i64), SqlValue::Int(i.id() as i64)],
                        ));
                    }
                }
            }
            _ => {
                cmds.push(if is_seq {
                    replace_ref_seq_cmd(tag, src, at, at + deleted.len(), inserted)
                } else {
                    replace_ref_coll_cmd(tag, src, deleted, inserted)
                });
            }
        }
        cmds
    }

    /// Occurrence-count verification over a whole vector; sequences
    /// additionally pin the first and last elements to their exact ordinals.
    fn vector_verify(
        &self,
        table: &str,
        src: Hvo,
        expected: &[Hvo],
        is_seq: bool,
        counts_cmd: &SqlCommand,
    ) -> Verify {
        let counts = Verify::OccurrenceCounts {
            cmd: counts_cmd.clone(),
            expect: occurrence_counts(expected),
        };
        if !is_seq || expected.is_empty() {
            return counts;
        }
        let first = expected[0];
        let last = *expected.last().unwrap();
        let boundaries = Verify::BoundaryOrdinals {
            cmd: SqlCommand::with_params(
                format!(
                    "select [Dst], [Ord] from [{table}] where [Src] = ? and [Ord] in (?, ?) order by [Ord]"
                ),
                vec![
                    SqlValue::Int(src.id() as i64),
                    SqlValue::Int(0),
                    SqlValue::Int(expected.len() as i64 - 1),
                ],
            ),
            expect: vec![(first, 0), (last, expected.len() as i64 - 1)],
        };
        Verify::All(vec![counts, boundaries])
    }

    /// Replace the entire contents of a reference vector in one procedure
    /// call. `replace` is the minimal-diff path; this is the wholesale
    /// rewrite the store offers for callers that rebuilt the whole list.
    pub fn set_obj_list(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        items: &[Hvo],
    ) -> Result<(), DataError> {
        if hvo.is_null() {
            return Err(DataError::InvalidArgument(
                "null object handle in set_obj_list".into(),
            ));
        }
        let ptype = self.metadata.field_type(tag)?;
        if !matches!(
            ptype,
            PropType::ReferenceCollection | PropType::ReferenceSequence
        ) {
            return Err(DataError::TypeMismatch(format!(
                "field {tag} is {ptype}, not a reference vector"
            )));
        }
        if hvo.is_dummy() {
            self.cache.set_vector(hvo, tag, items.to_vec());
            return Ok(());
        }
        let redo = set_obj_list_cmd(tag, hvo, items);

        if self.handler_attached() {
            let old_items = self.get_vector(hvo, tag)?;
            let (class_name, field_name) = self.resolve_column(tag)?;
            let table = format!("{class_name}_{field_name}");
            let counts_cmd = SqlCommand::with_params(
                format!("select [Dst], count(*) from [{table}] where [Src] = ? group by [Dst]"),
                vec![SqlValue::Int(hvo.id() as i64)],
            );
            let is_seq = ptype == PropType::ReferenceSequence;
            let verify_redoable =
                Some(self.vector_verify(&table, hvo, &old_items, is_seq, &counts_cmd));
            let verify_undoable = Some(self.vector_verify(&table, hvo, items, is_seq, &counts_cmd));
            let reload = Some(self.reload_spec_for(hvo, tag, WsId::NONE)?);
            self.push_action(SqlUndoAction {
                redo_cmds: vec![redo.clone()],
                undo_cmds: vec![set_obj_list_cmd(tag, hvo, &old_items)],
                verify_redoable,
                verify_undoable,
                reload,
            });
        }

        self.store.execute(&redo)?;
        self.refresh_timestamp(hvo)?;
        let old_len = self.cache.get_vector(hvo, tag).map(|v| v.len()).unwrap_or(0);
        self.cache.set_vector(hvo, tag, items.to_vec());
        self.dispatch(vec![PropChange {
            hvo,
            tag,
            iv_min: 0,
            cv_ins: items.len(),
            cv_del: old_len,
        }]);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-entry "extra" strings on reference sequences.
    // ------------------------------------------------------------------

    pub fn insert_rel_extra(
        &mut self,
        src: Hvo,
        tag: FieldId,
        at: usize,
        dst: Hvo,
        extra: &str,
    ) -> Result<(), DataError> {
        let (class_name, field_name) = self.resolve_column(tag)?;
        let table = format!("{class_name}_{field_name}");
        let items = self.get_vector(src, tag)?;
        if at > items.len() {
            return Err(DataError::InvalidArgument(format!(
                "insert position {at} out of range (len {})",
                items.len()
            )));
        }
        self.store.execute(&SqlCommand::with_params(
            format!("insert into [{table}] ([Src], [Dst], [Ord], [Extra]) values (?, ?, ?, ?)"),
            vec![
                SqlValue::Int(src.id() as i64),
                SqlValue::Int(dst.id() as i64),
                SqlValue::Int(at as i64),
                SqlValue::Text(extra.to_string()),
            ],
        ))?;
        let mut items = items;
        items.insert(at, dst);
        self.cache.set_vector(src, tag, items);
        self.cache.set_rel_extra(src, tag, dst, extra.to_string());
        self.refresh_timestamp(src)?;
        self.dispatch(vec![PropChange {
            hvo: src,
            tag,
            iv_min: at,
            cv_ins: 1,
            cv_del: 0,
        }]);
        Ok(())
    }

    pub fn update_rel_extra(
        &mut self,
        src: Hvo,
        tag: FieldId,
        at: usize,
        extra: &str,
    ) -> Result<(), DataError> {
        let (class_name, field_name) = self.resolve_column(tag)?;
        let table = format!("{class_name}_{field_name}");
        let items = self.get_vector(src, tag)?;
        let Some(dst) = items.get(at).copied() else {
            return Err(DataError::InvalidArgument(format!(
                "position {at} out of range (len {})",
                items.len()
            )));
        };
        self.store.execute(&SqlCommand::with_params(
            format!("update [{table}] set [Extra] = ? where [Src] = ? and [Ord] = ?"),
            vec![
                SqlValue::Text(extra.to_string()),
                SqlValue::Int(src.id() as i64),
                SqlValue::Int(at as i64),
            ],
        ))?;
        self.cache.set_rel_extra(src, tag, dst, extra.to_string());
        Ok(())
    }

    pub fn get_rel_extra(
        &mut self,
        src: Hvo,
        tag: FieldId,
        at: usize,
    ) -> Result<Option<String>, DataError> {
        let items = self.get_vector(src, tag)?;
        let Some(dst) = items.get(at).copied() else {
            return Err(DataError::InvalidArgument(format!(
                "position {at} out of range (len {})",
                items.len()
            )));
        };
        if let Some(extra) = self.cache.get_rel_extra(src, tag, dst) {
            return Ok(Some(extra.clone()));
        }
        if src.is_dummy() {
            return Ok(None);
        }
        let (class_name, field_name) = self.resolve_column(tag)?;
        let table = format!("{class_name}_{field_name}");
        let rows = self.run_query(&SqlCommand::with_params(
            format!("select [Extra] from [{table}] where [Src] = ? and [Ord] = ?"),
            vec![SqlValue::Int(src.id() as i64), SqlValue::Int(at as i64)],
        ))?;
        let extra = rows
            .first()
            .and_then(|r| r.col(0).text().map(|s| s.to_string()));
        if let Some(e) = &extra {
            self.cache.set_rel_extra(src, tag, dst, e.clone());
        }
        Ok(extra)
    }
}

fn occurrence_counts(items: &[Hvo]) -> Vec<(Hvo, i64)> {
    let mut counts: Vec<(Hvo, i64)> = vec![];
    for item in items {
        match counts.iter_mut().find(|(h, _)| h == item) {
            Some((_, n)) => *n += 1,
            None => counts.push((*item, 1)),
        }
    }
    counts
}
