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

//! The bulk loader: executes against an already-fetched result set whose
//! shape is described by an ordered column specification, and fans each row
//! out into the cache. One result set can populate many objects and many
//! property kinds at once.

use cellar_common::model::ids::{FLID_OWNER, FLID_OWN_FLID};
use cellar_common::{DataError, FieldId, Hvo, RichString, TextProps, WsId};
use strum::Display;

use crate::object_cache::{ObjectGraphCache, PropChange};
use crate::store::{Row, sign_extend};

/// How one result column (or one column pair, for formatted strings) is
/// decoded into the cache. Closed set; every variant has exactly one decoding
/// rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Display)]
pub enum ColumnKind {
    /// Establishes the base object subsequent columns in this row attach to.
    BaseId,
    Int,
    Int64,
    Guid,
    Time,
    Binary,
    /// A serialized text-properties blob cached as the structured type.
    TextProps,
    Unicode,
    /// A single-writing-system plain alternate; `ws` names the alternate.
    UnicodeAlt,
    /// Formatted string text column; combined with the next Fmt column.
    String,
    /// A single-writing-system formatted alternate text column.
    StringAlt,
    /// Multi-alternate text column whose field/ws arrive via the Flid/Ws
    /// side-channel columns earlier in the row.
    MultiAlt,
    /// The formatting blob paired with the preceding text column.
    Fmt,
    /// Side channel: sets the field id used by a following MultiAlt/Fmt.
    Flid,
    /// Side channel: sets the writing system used by a following MultiAlt/Fmt.
    Ws,
    /// Atomic object reference.
    Obj,
    /// Atomic object reference that also establishes owner back-links on the
    /// referenced object.
    ObjOwn,
    /// Vector-of-reference accumulation.
    ObjVec,
    /// Vector accumulation that also establishes owner back-links.
    ObjVecOwn,
    TimeStamp,
    /// Cache the timestamp only when none is cached for the object yet.
    TimeStampIfMissing,
}

/// One entry in a column specification.
#[derive(Clone, Debug)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    /// Index of the column this entry reads.
    pub col: usize,
    /// The property tag, for kinds that target a field. MultiAlt entries may
    /// leave this as None and take the tag from the Flid side channel.
    pub tag: Option<FieldId>,
    /// The writing system for single-alternate kinds; None means "take it
    /// from the Ws side channel" (or no ws at all).
    pub ws: Option<WsId>,
    /// Narrow-integer column width in bytes (1, 2 or 4) for Int columns read
    /// from short backing columns; None reads the native width.
    pub int_width: Option<u8>,
}

impl ColumnSpec {
    pub fn new(kind: ColumnKind, col: usize, tag: Option<FieldId>) -> Self {
        ColumnSpec {
            kind,
            col,
            tag,
            ws: None,
            int_width: None,
        }
    }

    pub fn with_ws(kind: ColumnKind, col: usize, tag: FieldId, ws: WsId) -> Self {
        ColumnSpec {
            kind,
            col,
            tag: Some(tag),
            ws: Some(ws),
            int_width: None,
        }
    }
}

#[derive(Default)]
pub struct LoadOptions {
    /// Emit a PropChange for every externally observable cache write.
    pub notify: bool,
    /// Objects the caller asked about directly. When the result set comes
    /// back without rows for them, their requested vector properties are
    /// cached as explicitly empty and their requested atomic references as
    /// null, so the miss does not re-trigger loading forever.
    pub requested: Vec<Hvo>,
}

/// Accumulation state for one in-progress vector property.
struct OpenVector {
    base: Hvo,
    tag: FieldId,
    items: Vec<Hvo>,
    own: bool,
}

/// A pending formatted-text column waiting for its Fmt partner.
struct PendingText {
    base: Hvo,
    tag: FieldId,
    ws: Option<WsId>,
    text: String,
    multi: bool,
}

pub fn load(
    cache: &mut ObjectGraphCache,
    rows: &[Row],
    specs: &[ColumnSpec],
    opts: &LoadOptions,
) -> Result<Vec<PropChange>, DataError> {
    let mut changes = vec![];
    let mut open_vec: Option<OpenVector> = None;

    for row in rows {
        let mut base: Option<Hvo> = None;
        let mut side_flid: Option<FieldId> = None;
        let mut side_ws: Option<WsId> = None;
        let mut pending: Option<PendingText> = None;

        for spec in specs {
            if spec.kind == ColumnKind::BaseId {
                base = row.hvo(spec.col);
                continue;
            }
            // No object to attach to: skip the column for this row.
            let Some(hvo) = base else {
                continue;
            };

            match spec.kind {
                ColumnKind::BaseId => unreachable!(),
                ColumnKind::Int => {
                    let raw = row.int_or_zero(spec.col);
                    let n = match spec.int_width {
                        Some(w) => sign_extend(raw, w),
                        None => raw,
                    };
                    cache.set_int(hvo, tag_of(spec)?, n);
                }
                ColumnKind::Int64 | ColumnKind::Time => {
                    cache.set_int64(hvo, tag_of(spec)?, row.int_or_zero(spec.col));
                }
                ColumnKind::Guid => {
                    if let Some(g) = row.col(spec.col).guid() {
                        cache.set_guid(hvo, tag_of(spec)?, g);
                    }
                }
                ColumnKind::Binary => {
                    let bytes = row.col(spec.col).bytes().unwrap_or_default().to_vec();
                    cache.set_binary(hvo, tag_of(spec)?, bytes);
                }
                ColumnKind::TextProps => {
                    let tag = tag_of(spec)?;
                    let bytes = row.col(spec.col).bytes().unwrap_or_default();
                    if bytes.is_empty() {
                        cache.set_text_props(hvo, tag, TextProps::default());
                    } else {
                        let rs = RichString::from_parts("", bytes, WsId::NONE)?;
                        let props = rs
                            .runs
                            .first()
                            .map(|r| r.props.clone())
                            .unwrap_or_default();
                        cache.set_text_props(hvo, tag, props);
                    }
                }
                ColumnKind::Unicode => {
                    let s = row.col(spec.col).text().unwrap_or_default().to_string();
                    cache.set_unicode(hvo, tag_of(spec)?, s);
                }
                ColumnKind::UnicodeAlt => {
                    let tag = tag_of(spec)?;
                    let ws = spec.ws.or(side_ws).unwrap_or(WsId::NONE);
                    let s = row.col(spec.col).text().unwrap_or_default().to_string();
                    cache.set_multi_unicode(hvo, tag, ws, s);
                }
                ColumnKind::String => {
                    pending = Some(PendingText {
                        base: hvo,
                        tag: tag_of(spec)?,
                        ws: None,
                        text: row.col(spec.col).text().unwrap_or_default().to_string(),
                        multi: false,
                    });
                }
                ColumnKind::StringAlt => {
                    pending = Some(PendingText {
                        base: hvo,
                        tag: tag_of(spec)?,
                        ws: Some(spec.ws.or(side_ws).unwrap_or(WsId::NONE)),
                        text: row.col(spec.col).text().unwrap_or_default().to_string(),
                        multi: true,
                    });
                }
                ColumnKind::MultiAlt => {
                    let tag = spec.tag.or(side_flid).ok_or_else(|| {
                        DataError::MalformedData(
                            "MultiAlt column with no field tag in spec or side channel".into(),
                        )
                    })?;
                    pending = Some(PendingText {
                        base: hvo,
                        tag,
                        ws: Some(spec.ws.or(side_ws).unwrap_or(WsId::NONE)),
                        text: row.col(spec.col).text().unwrap_or_default().to_string(),
                        multi: true,
                    });
                }
                ColumnKind::Fmt => {
                    let Some(p) = pending.take() else {
                        return Err(DataError::MalformedData(
                            "Fmt column without a preceding text column".into(),
                        ));
                    };
                    let blob = row.col(spec.col).bytes().unwrap_or_default();
                    let ws = p.ws.unwrap_or(WsId::NONE);
                    let rs = RichString::from_parts(&p.text, blob, ws)?;
                    if p.multi {
                        cache.set_multi_string(p.base, p.tag, ws, rs);
                    } else {
                        cache.set_string(p.base, p.tag, rs);
                    }
                }
                ColumnKind::Flid => {
                    side_flid = row.hvo(spec.col).map(|h| FieldId::new(h.id()));
                }
                ColumnKind::Ws => {
                    side_ws = Some(WsId(row.int_or_zero(spec.col) as i32));
                }
                ColumnKind::Obj | ColumnKind::ObjOwn => {
                    let tag = tag_of(spec)?;
                    let dst = row.hvo(spec.col);
                    let prior = cache.get_object(hvo, tag);
                    cache.set_object(hvo, tag, dst);
                    if spec.kind == ColumnKind::ObjOwn {
                        if let Some(d) = dst {
                            cache.set_owner_link(d, hvo, tag);
                        }
                    }
                    if opts.notify && prior != Some(dst) {
                        changes.push(PropChange {
                            hvo,
                            tag,
                            iv_min: 0,
                            cv_ins: 0,
                            cv_del: 0,
                        });
                        if spec.kind == ColumnKind::ObjOwn {
                            if let Some(d) = dst {
                                for back_tag in [FLID_OWNER, FLID_OWN_FLID] {
                                    changes.push(PropChange {
                                        hvo: d,
                                        tag: back_tag,
                                        iv_min: 0,
                                        cv_ins: 0,
                                        cv_del: 0,
                                    });
                                }
                            }
                        }
                    }
                }
                ColumnKind::ObjVec | ColumnKind::ObjVecOwn => {
                    let tag = tag_of(spec)?;
                    let own = spec.kind == ColumnKind::ObjVecOwn;
                    // A change of base object or field flushes the
                    // accumulated vector and starts a new one.
                    let needs_flush = open_vec
                        .as_ref()
                        .is_some_and(|v| v.base != hvo || v.tag != tag);
                    if needs_flush {
                        flush_vector(cache, &mut open_vec, opts, &mut changes);
                    }
                    let open = open_vec.get_or_insert_with(|| OpenVector {
                        base: hvo,
                        tag,
                        items: vec![],
                        own,
                    });
                    // Null/zero destinations come from outer joins that exist
                    // only to prove the source object has no entries.
                    if let Some(dst) = row.hvo(spec.col) {
                        open.items.push(dst);
                        if open.own {
                            cache.set_owner_link(dst, hvo, tag);
                        }
                    }
                }
                ColumnKind::TimeStamp => {
                    if let Some(b) = row.col(spec.col).bytes() {
                        cache.set_timestamp(hvo, b.to_vec());
                    }
                }
                ColumnKind::TimeStampIfMissing => {
                    if !cache.has_timestamp(hvo) {
                        if let Some(b) = row.col(spec.col).bytes() {
                            cache.set_timestamp(hvo, b.to_vec());
                        }
                    }
                }
            }
        }

        // A text column with no Fmt partner in the spec is cached as plain.
        if let Some(p) = pending.take() {
            let ws = p.ws.unwrap_or(WsId::NONE);
            let rs = RichString::new(p.text, ws);
            if p.multi {
                cache.set_multi_string(p.base, p.tag, ws, rs);
            } else {
                cache.set_string(p.base, p.tag, rs);
            }
        }
    }

    // End of rowset: flush the last accumulated vector.
    flush_vector(cache, &mut open_vec, opts, &mut changes);

    // Requested objects that the result set never mentioned: cache their
    // vector properties as explicitly empty and their atomic references as
    // null, so repeated lookups do not re-trigger loading indefinitely.
    for spec in specs {
        match spec.kind {
            ColumnKind::ObjVec | ColumnKind::ObjVecOwn => {
                let tag = tag_of(spec)?;
                for hvo in &opts.requested {
                    if cache.get_vector(*hvo, tag).is_none() {
                        cache.set_vector(*hvo, tag, vec![]);
                        if opts.notify {
                            changes.push(PropChange {
                                hvo: *hvo,
                                tag,
                                iv_min: 0,
                                cv_ins: 0,
                                cv_del: 0,
                            });
                        }
                    }
                }
            }
            ColumnKind::Obj | ColumnKind::ObjOwn => {
                let tag = tag_of(spec)?;
                for hvo in &opts.requested {
                    if cache.get_object(*hvo, tag).is_none() {
                        cache.set_object(*hvo, tag, None);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(changes)
}

fn tag_of(spec: &ColumnSpec) -> Result<FieldId, DataError> {
    spec.tag.ok_or_else(|| {
        DataError::MalformedData(format!("{} column with no field tag", spec.kind))
    })
}

fn flush_vector(
    cache: &mut ObjectGraphCache,
    open_vec: &mut Option<OpenVector>,
    opts: &LoadOptions,
    changes: &mut Vec<PropChange>,
) {
    let Some(v) = open_vec.take() else {
        return;
    };
    let prior_len = cache.get_vector(v.base, v.tag).map(|p| p.len());
    let cv_ins = v.items.len();
    cache.set_vector(v.base, v.tag, v.items);
    if opts.notify {
        changes.push(PropChange {
            hvo: v.base,
            tag: v.tag,
            iv_min: 0,
            cv_ins,
            // A previously uncached vector had nothing observable to delete.
            cv_del: prior_len.unwrap_or(0),
        });
    }
}
