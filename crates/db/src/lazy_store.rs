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

//! The lazy-loading store: every property getter returns from the cache, and
//! on a miss - when autoloading is on and the object is not a dummy - issues
//! exactly the query needed to populate the cache for this property (or a
//! wider scope, depending on the configured policy), then re-reads.

use cellar_common::model::ids::FLID_CLASS;
use cellar_common::{
    ClassId, DataError, FieldId, Hvo, MetadataCache, PropType, RichString, TextProps, WsId,
};
use tracing::error;
use uuid::Uuid;

use crate::autoload::{AutoloadPolicy, ReadOnlyLoads, RecentAutoloads};
use crate::bulk_load::{self, ColumnKind, ColumnSpec, LoadOptions};
use crate::object_cache::{ChangeListener, ObjectGraphCache, PropChange};
use crate::store::{BackingStore, SqlCommand, SqlValue};
use crate::undo::{UndoResult, UndoStack};

/// What table scope an autoload query covers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum LoadScope {
    This,
    ExactClass(ClassId),
    BaseClass,
}

pub struct LazyLoadingStore<S: BackingStore, M: MetadataCache> {
    pub(crate) cache: ObjectGraphCache,
    pub(crate) store: S,
    pub(crate) metadata: M,
    policy: AutoloadPolicy,
    recent: RecentAutoloads,
    read_only_done: ReadOnlyLoads,
    listeners: Vec<Box<dyn ChangeListener>>,
    pub(crate) handler: Option<UndoStack>,
}

impl<S: BackingStore, M: MetadataCache> LazyLoadingStore<S, M> {
    pub fn new(store: S, metadata: M) -> Self {
        LazyLoadingStore {
            cache: ObjectGraphCache::new(),
            store,
            metadata,
            policy: AutoloadPolicy::default(),
            recent: RecentAutoloads::new(),
            read_only_done: ReadOnlyLoads::new(),
            listeners: vec![],
            handler: None,
        }
    }

    pub fn autoload_policy(&self) -> AutoloadPolicy {
        self.policy
    }

    pub fn set_autoload_policy(&mut self, policy: AutoloadPolicy) {
        self.policy = policy;
    }

    /// Attach (or detach) the external action-handler stack. While attached,
    /// every mutation pushes an undoable action.
    pub fn set_action_handler(&mut self, handler: Option<UndoStack>) {
        self.handler = handler;
    }

    pub fn action_handler(&self) -> Option<&UndoStack> {
        self.handler.as_ref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn cache(&self) -> &ObjectGraphCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ObjectGraphCache {
        &mut self.cache
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub(crate) fn dispatch(&mut self, changes: Vec<PropChange>) {
        for change in &changes {
            for listener in &mut self.listeners {
                listener.prop_changed(change);
            }
        }
    }

    fn may_autoload(&self, hvo: Hvo) -> bool {
        self.policy != AutoloadPolicy::NoAutoload && !hvo.is_dummy() && !hvo.is_null()
    }

    // ------------------------------------------------------------------
    // Getters. Cache first; miss triggers a policy-scoped load; a value
    // still absent after the load is legitimately absent, not an error.
    // ------------------------------------------------------------------

    pub fn get_int_prop(&mut self, hvo: Hvo, tag: FieldId) -> Result<Option<i64>, DataError> {
        if let Some(v) = self.cache.get_int(hvo, tag) {
            return Ok(Some(v));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_int(hvo, tag))
    }

    pub fn get_int64_prop(&mut self, hvo: Hvo, tag: FieldId) -> Result<Option<i64>, DataError> {
        if let Some(v) = self.cache.get_int64(hvo, tag) {
            return Ok(Some(v));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_int64(hvo, tag))
    }

    /// Times share the int64 slot; the value is the store's millisecond
    /// rendering.
    pub fn get_time_prop(&mut self, hvo: Hvo, tag: FieldId) -> Result<Option<i64>, DataError> {
        self.get_int64_prop(hvo, tag)
    }

    pub fn get_guid_prop(&mut self, hvo: Hvo, tag: FieldId) -> Result<Option<Uuid>, DataError> {
        if let Some(v) = self.cache.get_guid(hvo, tag) {
            return Ok(Some(v));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_guid(hvo, tag))
    }

    pub fn get_binary_prop(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
    ) -> Result<Option<Vec<u8>>, DataError> {
        if let Some(v) = self.cache.get_binary(hvo, tag) {
            return Ok(Some(v.clone()));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_binary(hvo, tag).cloned())
    }

    pub fn get_string_prop(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
    ) -> Result<Option<RichString>, DataError> {
        if let Some(v) = self.cache.get_string(hvo, tag) {
            return Ok(Some(v.clone()));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_string(hvo, tag).cloned())
    }

    pub fn get_unicode_prop(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
    ) -> Result<Option<String>, DataError> {
        if let Some(v) = self.cache.get_unicode(hvo, tag) {
            return Ok(Some(v.clone()));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_unicode(hvo, tag).cloned())
    }

    pub fn get_multi_string_alt(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ws: WsId,
    ) -> Result<Option<RichString>, DataError> {
        if let Some(v) = self.cache.get_multi_string(hvo, tag, ws) {
            return Ok(Some(v.clone()));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, ws)?;
        Ok(self.cache.get_multi_string(hvo, tag, ws).cloned())
    }

    pub fn get_multi_unicode_alt(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ws: WsId,
    ) -> Result<Option<String>, DataError> {
        if let Some(v) = self.cache.get_multi_unicode(hvo, tag, ws) {
            return Ok(Some(v.clone()));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, ws)?;
        Ok(self.cache.get_multi_unicode(hvo, tag, ws).cloned())
    }

    /// Structured text properties stored in a binary column. The load reuses
    /// the binary-column query but decodes through the structured kind, so
    /// the value lands in the text-props slot rather than as raw bytes.
    pub fn get_props_prop(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
    ) -> Result<Option<TextProps>, DataError> {
        if let Some(v) = self.cache.get_text_props(hvo, tag) {
            return Ok(Some(v.clone()));
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        let ptype = self.metadata.field_type(tag)?;
        let (cmd, mut cols, requested) =
            self.build_prop_query(hvo, tag, WsId::NONE, ptype, LoadScope::This)?;
        for col in &mut cols {
            if col.kind == ColumnKind::Binary {
                col.kind = ColumnKind::TextProps;
            }
        }
        let rows = self.run_query(&cmd)?;
        let opts = LoadOptions {
            notify: !self.listeners.is_empty(),
            requested,
        };
        let changes = bulk_load::load(&mut self.cache, &rows, &cols, &opts)?;
        self.dispatch(changes);
        Ok(self.cache.get_text_props(hvo, tag).cloned())
    }

    pub fn get_object_prop(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
    ) -> Result<Option<Hvo>, DataError> {
        if let Some(v) = self.cache.get_object(hvo, tag) {
            return Ok(v);
        }
        if !self.may_autoload(hvo) {
            return Ok(None);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_object(hvo, tag).flatten())
    }

    pub fn get_vector(&mut self, hvo: Hvo, tag: FieldId) -> Result<Vec<Hvo>, DataError> {
        if let Some(v) = self.cache.get_vector(hvo, tag) {
            return Ok(v.clone());
        }
        if !self.may_autoload(hvo) {
            return Ok(vec![]);
        }
        self.autoload(hvo, tag, WsId::NONE)?;
        Ok(self.cache.get_vector(hvo, tag).cloned().unwrap_or_default())
    }

    pub fn get_vec_size(&mut self, hvo: Hvo, tag: FieldId) -> Result<usize, DataError> {
        Ok(self.get_vector(hvo, tag)?.len())
    }

    pub fn get_vec_item(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        index: usize,
    ) -> Result<Hvo, DataError> {
        let items = self.get_vector(hvo, tag)?;
        items.get(index).copied().ok_or_else(|| {
            DataError::InvalidArgument(format!(
                "index {index} out of range for {hvo} field {tag} (len {})",
                items.len()
            ))
        })
    }

    // ------------------------------------------------------------------
    // Autoloading.
    // ------------------------------------------------------------------

    /// The object's class, from cache or via one discovery query.
    pub fn object_class(&mut self, hvo: Hvo) -> Result<Option<ClassId>, DataError> {
        if let Some(clid) = self.cache.get_class(hvo) {
            return Ok(Some(clid));
        }
        if hvo.is_dummy() || hvo.is_null() {
            return Ok(None);
        }
        let cmd = SqlCommand::with_params(
            "select [Class$] from [CmObject] where [Id] = ?",
            vec![SqlValue::Int(hvo.id() as i64)],
        );
        let rows = self.run_query(&cmd)?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let clid = ClassId(row.int_or_zero(0) as u32);
        self.cache.set_int(hvo, FLID_CLASS, clid.0 as i64);
        Ok(Some(clid))
    }

    pub(crate) fn run_query(&mut self, cmd: &SqlCommand) -> Result<Vec<crate::store::Row>, DataError> {
        self.store.rows(cmd).map_err(|e| {
            error!("query failed: {e} ({})", cmd.text);
            e
        })
    }

    fn autoload(&mut self, hvo: Hvo, tag: FieldId, ws: WsId) -> Result<(), DataError> {
        let ptype = self.metadata.field_type(tag)?;

        let scope = match self.policy {
            AutoloadPolicy::NoAutoload => return Ok(()),
            AutoloadPolicy::LoadForThisObject => LoadScope::This,
            AutoloadPolicy::LoadForAllOfObjectClass => {
                // One extra query to discover the exact class.
                let Some(clid) = self.object_class(hvo)? else {
                    return Ok(());
                };
                if self.recent.test_and_note(tag, ws, clid) {
                    LoadScope::This
                } else {
                    LoadScope::ExactClass(clid)
                }
            }
            AutoloadPolicy::LoadForAllOfBaseClass => {
                let clid = self.metadata.field_class(tag)?;
                if self.recent.test_and_note(tag, ws, clid) {
                    LoadScope::This
                } else {
                    LoadScope::BaseClass
                }
            }
            AutoloadPolicy::LoadAllOfClassForReadOnly => {
                let clid = self.metadata.field_class(tag)?;
                if self.read_only_done.test_and_set(tag, ws, clid) {
                    // Already bulk-loaded once; whatever is absent now is
                    // legitimately absent.
                    return Ok(());
                }
                LoadScope::BaseClass
            }
        };

        let (cmd, cols, requested) = self.build_prop_query(hvo, tag, ws, ptype, scope)?;
        let rows = self.run_query(&cmd)?;
        let opts = LoadOptions {
            notify: !self.listeners.is_empty(),
            requested,
        };
        let changes = bulk_load::load(&mut self.cache, &rows, &cols, &opts)?;
        self.dispatch(changes);
        Ok(())
    }

    /// Synthesize the catch-up query and column spec for one property at one
    /// scope. Scalar loads also fetch the row timestamp opportunistically,
    /// since later mutation verification needs it.
    pub(crate) fn build_prop_query(
        &mut self,
        hvo: Hvo,
        tag: FieldId,
        ws: WsId,
        ptype: PropType,
        scope: LoadScope,
    ) -> Result<(SqlCommand, Vec<ColumnSpec>, Vec<Hvo>), DataError> {
        let class_name = self.metadata.base_class_name(tag)?.to_string();
        let field_name = self.metadata.field_name(tag)?.to_string();
        let requested = if scope == LoadScope::This {
            vec![hvo]
        } else {
            vec![]
        };
        let this_param = SqlValue::Int(hvo.id() as i64);

        let scope_clause = |id_col: &str| match scope {
            LoadScope::This => format!(" where [{id_col}] = ?"),
            LoadScope::ExactClass(_) => format!(" where [{id_col}] in (select [Id] from [CmObject] where [Class$] = ?)"),
            LoadScope::BaseClass => String::new(),
        };
        let scope_params = |p: SqlValue| match scope {
            LoadScope::This => vec![p],
            LoadScope::ExactClass(clid) => vec![SqlValue::Int(clid.0 as i64)],
            LoadScope::BaseClass => vec![],
        };

        let (cmd, cols) = match ptype {
            PropType::Boolean
            | PropType::Integer
            | PropType::Numeric
            | PropType::Float
            | PropType::GenDate => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::Int, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 2, None),
                ],
            ),
            PropType::Time => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::Time, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 2, None),
                ],
            ),
            PropType::Guid => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::Guid, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 2, None),
                ],
            ),
            PropType::Binary | PropType::Image => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::Binary, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 2, None),
                ],
            ),
            PropType::Unicode | PropType::BigUnicode => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::Unicode, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 2, None),
                ],
            ),
            PropType::String | PropType::BigString => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [{field_name}_Fmt], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::String, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::Fmt, 2, None),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 3, None),
                ],
            ),
            PropType::MultiString | PropType::MultiBigString => {
                let table = if ptype == PropType::MultiString {
                    "MultiStr$"
                } else {
                    "MultiBigStr$"
                };
                let (clause, mut params) = match scope {
                    LoadScope::This => (" and [Obj] = ?", vec![this_param]),
                    _ => ("", vec![]),
                };
                let mut all = vec![SqlValue::Int(tag.id() as i64), SqlValue::Int(ws.0 as i64)];
                all.append(&mut params);
                (
                    SqlCommand::with_params(
                        format!(
                            "select [Obj], [Txt], [Fmt] from [{table}] where [Flid] = ? and [Ws] = ?{clause}"
                        ),
                        all,
                    ),
                    vec![
                        ColumnSpec::new(ColumnKind::BaseId, 0, None),
                        ColumnSpec::with_ws(ColumnKind::StringAlt, 1, tag, ws),
                        ColumnSpec::new(ColumnKind::Fmt, 2, None),
                    ],
                )
            }
            PropType::MultiUnicode | PropType::MultiBigUnicode => {
                let table = if ptype == PropType::MultiUnicode {
                    "MultiTxt$"
                } else {
                    "MultiBigTxt$"
                };
                let (clause, mut params) = match scope {
                    LoadScope::This => (" and [Obj] = ?", vec![this_param]),
                    _ => ("", vec![]),
                };
                let mut all = vec![SqlValue::Int(tag.id() as i64), SqlValue::Int(ws.0 as i64)];
                all.append(&mut params);
                (
                    SqlCommand::with_params(
                        format!(
                            "select [Obj], [Txt] from [{table}] where [Flid] = ? and [Ws] = ?{clause}"
                        ),
                        all,
                    ),
                    vec![
                        ColumnSpec::new(ColumnKind::BaseId, 0, None),
                        ColumnSpec::with_ws(ColumnKind::UnicodeAlt, 1, tag, ws),
                    ],
                )
            }
            PropType::OwningAtomic => {
                let (clause, params) = match scope {
                    LoadScope::This => (" and [Owner$] = ?", vec![this_param]),
                    _ => ("", vec![]),
                };
                let mut all = vec![SqlValue::Int(tag.id() as i64)];
                all.extend(params);
                (
                    SqlCommand::with_params(
                        format!(
                            "select [Owner$], [Id] from [CmObject] where [OwnFlid$] = ?{clause}"
                        ),
                        all,
                    ),
                    vec![
                        ColumnSpec::new(ColumnKind::BaseId, 0, None),
                        ColumnSpec::new(ColumnKind::ObjOwn, 1, Some(tag)),
                    ],
                )
            }
            PropType::ReferenceAtomic => (
                SqlCommand::with_params(
                    format!(
                        "select [Id], [{field_name}], [UpdStmp] from [{class_name}]{}",
                        scope_clause("Id")
                    ),
                    scope_params(this_param),
                ),
                vec![
                    ColumnSpec::new(ColumnKind::BaseId, 0, None),
                    ColumnSpec::new(ColumnKind::Obj, 1, Some(tag)),
                    ColumnSpec::new(ColumnKind::TimeStampIfMissing, 2, None),
                ],
            ),
            PropType::OwningCollection | PropType::OwningSequence => {
                let (clause, params) = match scope {
                    LoadScope::This => (" and [Owner$] = ?", vec![this_param]),
                    _ => ("", vec![]),
                };
                let mut all = vec![SqlValue::Int(tag.id() as i64)];
                all.extend(params);
                (
                    SqlCommand::with_params(
                        format!(
                            "select [Owner$], [Id] from [CmObject] where [OwnFlid$] = ?{clause} order by [Owner$], [OwnOrd$]"
                        ),
                        all,
                    ),
                    vec![
                        ColumnSpec::new(ColumnKind::BaseId, 0, None),
                        ColumnSpec::new(ColumnKind::ObjVecOwn, 1, Some(tag)),
                    ],
                )
            }
            PropType::ReferenceCollection | PropType::ReferenceSequence => {
                let table = format!("{class_name}_{field_name}");
                let (clause, params) = match scope {
                    LoadScope::This => (" where [Src] = ?".to_string(), vec![this_param]),
                    _ => (String::new(), vec![]),
                };
                let order = if ptype == PropType::ReferenceSequence {
                    " order by [Src], [Ord]"
                } else {
                    " order by [Src]"
                };
                (
                    SqlCommand::with_params(
                        format!("select [Src], [Dst] from [{table}]{clause}{order}"),
                        params,
                    ),
                    vec![
                        ColumnSpec::new(ColumnKind::BaseId, 0, None),
                        ColumnSpec::new(ColumnKind::ObjVec, 1, Some(tag)),
                    ],
                )
            }
        };
        Ok((cmd, cols, requested))
    }

    // ------------------------------------------------------------------
    // Timestamps: advisory optimistic-concurrency tokens.
    // ------------------------------------------------------------------

    fn query_timestamp(&mut self, hvo: Hvo) -> Result<Option<Vec<u8>>, DataError> {
        let cmd = SqlCommand::with_params(
            "select [UpdStmp] from [CmObject] where [Id] = ?",
            vec![SqlValue::Int(hvo.id() as i64)],
        );
        let rows = self.run_query(&cmd)?;
        let Some(stamp) = rows.first().and_then(|r| r.col(0).bytes().map(|b| b.to_vec()))
        else {
            return Ok(None);
        };
        if stamp.len() != 8 {
            // Corrupted bookkeeping; continuing would make every later
            // verification meaningless.
            return Err(DataError::InternalInconsistency(format!(
                "timestamp for {hvo} is {} bytes, expected 8",
                stamp.len()
            )));
        }
        Ok(Some(stamp))
    }

    /// Refresh the cached timestamp from the store after a mutation the
    /// store's triggers would have stamped.
    pub fn refresh_timestamp(&mut self, hvo: Hvo) -> Result<(), DataError> {
        if hvo.is_dummy() || hvo.is_null() {
            return Ok(());
        }
        if let Some(stamp) = self.query_timestamp(hvo)? {
            self.cache.set_timestamp(hvo, stamp);
        }
        Ok(())
    }

    /// Cache the current timestamp only if none is cached yet.
    pub fn cache_curr_time_stamp_if_missing(&mut self, hvo: Hvo) -> Result<(), DataError> {
        if self.cache.has_timestamp(hvo) {
            return Ok(());
        }
        self.refresh_timestamp(hvo)
    }

    /// Compare the cached timestamp against the store's. A mismatch is the
    /// advisory conflict signal; the caller decides what to do with it.
    pub fn check_time_stamp(&mut self, hvo: Hvo) -> Result<(), DataError> {
        if hvo.is_dummy() || hvo.is_null() {
            return Ok(());
        }
        let Some(current) = self.query_timestamp(hvo)? else {
            return Ok(());
        };
        match self.cache.get_timestamp(hvo) {
            None => {
                self.cache.set_timestamp(hvo, current);
                Ok(())
            }
            Some(cached) if *cached == current => Ok(()),
            Some(_) => Err(DataError::StaleTimestamp(hvo)),
        }
    }

    pub fn set_time_stamp(&mut self, hvo: Hvo, stamp: Vec<u8>) -> Result<(), DataError> {
        if stamp.len() != 8 {
            return Err(DataError::InternalInconsistency(format!(
                "timestamp for {hvo} is {} bytes, expected 8",
                stamp.len()
            )));
        }
        self.cache.set_timestamp(hvo, stamp);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Undo task lifecycle. A store transaction is opened only on the 0→1
    // nesting transition and committed only on 1→0.
    // ------------------------------------------------------------------

    pub fn begin_undo_task(&mut self, label: &str) -> Result<(), DataError> {
        if let Some(stack) = self.handler.as_mut() {
            if stack.begin_task(label) && !self.store.is_transaction_open() {
                self.store.begin_transaction()?;
            }
        }
        Ok(())
    }

    pub fn end_undo_task(&mut self) -> Result<(), DataError> {
        if let Some(stack) = self.handler.as_mut() {
            if stack.end_task() && self.store.is_transaction_open() {
                self.store.commit_transaction()?;
            }
        }
        Ok(())
    }

    pub fn continue_undo_task(&mut self) -> Result<(), DataError> {
        if let Some(stack) = self.handler.as_mut() {
            if stack.continue_task() && !self.store.is_transaction_open() {
                self.store.begin_transaction()?;
            }
        }
        Ok(())
    }

    /// Unconditionally reset nesting to zero and commit whatever is open.
    pub fn end_outer_undo_task(&mut self) -> Result<(), DataError> {
        if let Some(stack) = self.handler.as_mut() {
            while stack.depth() > 0 {
                stack.end_task();
            }
            if self.store.is_transaction_open() {
                self.store.commit_transaction()?;
            }
        }
        Ok(())
    }

    /// Abandon the current task and everything undoable: nesting to zero,
    /// open transaction rolled back, stacks cleared.
    pub fn rollback(&mut self) -> Result<(), DataError> {
        if let Some(stack) = self.handler.as_mut() {
            stack.rollback();
            stack.clear();
        }
        if self.store.is_transaction_open() {
            self.store.rollback_transaction()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Undo/redo replay.
    // ------------------------------------------------------------------

    pub fn undo(&mut self) -> Result<UndoResult, DataError> {
        let Some(stack) = self.handler.as_mut() else {
            return Ok(UndoResult::Empty);
        };
        let Some(group) = stack.pop_undo() else {
            return Ok(UndoResult::Empty);
        };

        // Verify every action is still undoable before touching anything.
        for action in group.actions.iter().rev() {
            if let Some(verify) = &action.verify_undoable {
                if !verify.check(&mut self.store)? {
                    self.handler.as_mut().unwrap().push_redone(group);
                    return Ok(UndoResult::VerifyFailed);
                }
            }
        }

        for action in group.actions.iter().rev() {
            for cmd in &action.undo_cmds {
                self.store.execute(cmd)?;
            }
        }
        self.reload_after_replay(&group)?;
        self.handler.as_mut().unwrap().push_undone(group);
        Ok(UndoResult::Ok)
    }

    pub fn redo(&mut self) -> Result<UndoResult, DataError> {
        let Some(stack) = self.handler.as_mut() else {
            return Ok(UndoResult::Empty);
        };
        let Some(group) = stack.pop_redo() else {
            return Ok(UndoResult::Empty);
        };

        for action in group.actions.iter() {
            if let Some(verify) = &action.verify_redoable {
                if !verify.check(&mut self.store)? {
                    self.handler.as_mut().unwrap().push_undone(group);
                    return Ok(UndoResult::VerifyFailed);
                }
            }
        }

        for action in group.actions.iter() {
            for cmd in &action.redo_cmds {
                self.store.execute(cmd)?;
            }
        }
        self.reload_after_replay(&group)?;
        self.handler.as_mut().unwrap().push_redone(group);
        Ok(UndoResult::Ok)
    }

    /// After replay in either direction, re-read strictly the same row specs
    /// the original mutations recorded, so the cache reflects the store.
    fn reload_after_replay(&mut self, group: &crate::undo::UndoGroup) -> Result<(), DataError> {
        for action in &group.actions {
            let Some(reload) = &action.reload else {
                continue;
            };
            let rows = self.run_query(&reload.cmd)?;
            let opts = LoadOptions {
                notify: !self.listeners.is_empty(),
                requested: reload.requested.clone(),
            };
            let changes = bulk_load::load(&mut self.cache, &rows, &reload.cols, &opts)?;
            self.dispatch(changes);
        }
        Ok(())
    }
}
