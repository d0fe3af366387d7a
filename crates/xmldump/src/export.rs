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

//! The full-project XML export. Reads straight from the backing store,
//! bypassing the object cache entirely: on a large project the cache would
//! otherwise balloon with rows that are touched exactly once.
//!
//! The shape of the work: rebuild the ownership-hierarchy scratch table in
//! the store, bulk-load every property kind across all objects (one query
//! per kind, each fanned into a per-object table, O(total rows)), precompute
//! the cross-reference enrichment maps, then walk the hierarchy in document
//! order exactly once with an explicit stack of open tags.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use cellar_common::model::ids::{ClassId, FieldId, Hvo, WsId};
use cellar_common::{MetadataCache, ProgressSink, RichString};
use tracing::info;
use uuid::Uuid;

use cellar_db::store::{BackingStore, SqlCommand};

use crate::strings::props_to_attrs;
use crate::{hex_encode, xml_escape_attr, xml_escape_text, DiagnosticLog, XmlError};

/// Per-export configuration. The default writing systems are explicit here -
/// there is no process-global default.
#[derive(Clone, Debug)]
pub struct ExportContext {
    pub version: u32,
    pub default_analysis_ws: WsId,
    pub default_vernacular_ws: WsId,
    /// Writing-system id to code, for `ws=` attributes.
    pub ws_codes: HashMap<WsId, String>,
}

impl ExportContext {
    pub fn ws_code(&self, ws: WsId) -> String {
        self.ws_codes
            .get(&ws)
            .cloned()
            .unwrap_or_else(|| ws.0.to_string())
    }
}

struct HierRow {
    depth: usize,
    owner: Option<Hvo>,
    own_flid: Option<FieldId>,
    hvo: Hvo,
    clid: ClassId,
    guid: Uuid,
}

struct ScalarRow {
    flid: FieldId,
    rendering: String,
}

struct BytesRow {
    flid: FieldId,
    bytes: Vec<u8>,
}

struct UniRow {
    flid: FieldId,
    text: String,
}

struct StrRow {
    flid: FieldId,
    value: RichString,
}

struct MultiUniRow {
    flid: FieldId,
    ws: WsId,
    text: String,
}

struct MultiStrRow {
    flid: FieldId,
    ws: WsId,
    value: RichString,
}

struct RefRow {
    flid: FieldId,
    dst: Hvo,
}

/// Per-object tables for one property kind: built in O(rows), consumed once
/// per object during the walk.
struct KindTable<T> {
    by_obj: HashMap<Hvo, Vec<T>>,
}

impl<T> KindTable<T> {
    fn new() -> Self {
        KindTable {
            by_obj: HashMap::new(),
        }
    }

    fn push(&mut self, hvo: Hvo, row: T) {
        self.by_obj.entry(hvo).or_default().push(row);
    }

    fn take(&mut self, hvo: Hvo) -> Vec<T> {
        self.by_obj.remove(&hvo).unwrap_or_default()
    }
}

/// One open object tag on the walk stack, with the field wrapper currently
/// open underneath it (shared by consecutive children of the same field).
struct ObjFrame {
    hvo: Hvo,
    class_name: String,
    open_wrapper: Option<(FieldId, String)>,
}

pub struct XmlExporter<'a, S: BackingStore, M: MetadataCache> {
    store: &'a mut S,
    metadata: &'a M,
    ctx: ExportContext,
}

impl<'a, S: BackingStore, M: MetadataCache> XmlExporter<'a, S, M> {
    pub fn new(store: &'a mut S, metadata: &'a M, ctx: ExportContext) -> Self {
        XmlExporter {
            store,
            metadata,
            ctx,
        }
    }

    pub fn save_xml(
        &mut self,
        path: &Path,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), XmlError> {
        let mut log = DiagnosticLog::for_export(path)?;
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let result = self.write_document(&mut writer, &mut log, progress);
        writer.flush()?;
        match result {
            Ok(()) => {
                let entries = log.finish()?;
                if entries > 0 {
                    info!("export finished with {entries} logged diagnostics");
                }
                Ok(())
            }
            Err(e) => {
                log.log(None, &format!("export failed: {e}"));
                let _ = log.finish();
                Err(e)
            }
        }
    }

    /// The whole dump against any writer. Fatal structural anomalies abort;
    /// recoverable ones are logged and the walk continues.
    pub fn write_document<W: Write>(
        &mut self,
        out: &mut W,
        log: &mut DiagnosticLog,
        progress: &mut dyn ProgressSink,
    ) -> Result<(), XmlError> {
        // 1. Rebuild the hierarchy scratch table. This dominates wall time
        // on real projects, so progress is front-loaded on it.
        self.store.execute(&SqlCommand::new("exec UpdateHierarchy"))?;
        progress.step(40);

        let hierarchy = self.load_hierarchy()?;
        let guids: HashMap<Hvo, Uuid> = hierarchy.iter().map(|r| (r.hvo, r.guid)).collect();
        let owners: HashMap<Hvo, Hvo> = hierarchy
            .iter()
            .filter_map(|r| r.owner.map(|o| (r.hvo, o)))
            .collect();
        let classes: HashMap<Hvo, ClassId> =
            hierarchy.iter().map(|r| (r.hvo, r.clid)).collect();

        // 2. One bulk query per property kind, each into its own per-object
        // table.
        let mut scalars = self.load_scalars()?;
        progress.step(2);
        let mut binaries = self.load_bytes("BinaryValues$")?;
        progress.step(2);
        let mut images = self.load_bytes("ImageValues$")?;
        progress.step(2);
        let mut unicodes = self.load_unicode("UnicodeValues$")?;
        progress.step(2);
        let mut big_unicodes = self.load_unicode("BigUnicodeValues$")?;
        progress.step(2);
        let mut strings = self.load_strings("StringValues$")?;
        progress.step(2);
        let mut big_strings = self.load_strings("BigStringValues$")?;
        progress.step(2);
        let mut multi_unicodes = self.load_multi_unicode("MultiUnicodeValues$")?;
        progress.step(2);
        let mut multi_big_unicodes = self.load_multi_unicode("MultiBigUnicodeValues$")?;
        progress.step(2);
        let mut multi_strings = self.load_multi_strings("MultiStringValues$")?;
        progress.step(2);
        let mut multi_big_strings = self.load_multi_strings("MultiBigStringValues$")?;
        progress.step(2);
        let mut ref_atoms = self.load_refs("RefAtomValues$", 2)?;
        progress.step(2);
        let mut ref_colls = self.load_refs("RefCollValues$", 2)?;
        progress.step(2);
        let mut ref_seqs = self.load_refs("RefSeqValues$", 3)?;
        progress.step(2);

        // 3. Enrichment maps: Name/Abbreviation in the default analysis ws
        // (falling back to the owner at link time), reversal-index forms,
        // LexEntry/LexSense headwords.
        let mut names: HashMap<Hvo, String> = HashMap::new();
        let mut abbrs: HashMap<Hvo, String> = HashMap::new();
        let mut forms: HashMap<Hvo, String> = HashMap::new();
        for (hvo, rows) in multi_unicodes
            .by_obj
            .iter()
            .chain(multi_big_unicodes.by_obj.iter())
        {
            for row in rows {
                if row.ws != self.ctx.default_analysis_ws {
                    continue;
                }
                match self.metadata.field_name(row.flid) {
                    Ok("Name") => {
                        names.insert(*hvo, row.text.clone());
                    }
                    Ok("Abbreviation") => {
                        abbrs.insert(*hvo, row.text.clone());
                    }
                    _ => {}
                }
            }
        }
        for (hvo, rows) in multi_strings
            .by_obj
            .iter()
            .chain(multi_big_strings.by_obj.iter())
        {
            for row in rows {
                if row.ws != self.ctx.default_analysis_ws {
                    continue;
                }
                match self.metadata.field_name(row.flid) {
                    Ok("Name") => {
                        names.entry(*hvo).or_insert_with(|| row.value.text.clone());
                    }
                    Ok("Abbreviation") => {
                        abbrs.entry(*hvo).or_insert_with(|| row.value.text.clone());
                    }
                    _ => {}
                }
            }
        }
        for (hvo, rows) in unicodes.by_obj.iter().chain(big_unicodes.by_obj.iter()) {
            for row in rows {
                if let Ok("Form" | "StringRepresentation") = self.metadata.field_name(row.flid) {
                    forms.insert(*hvo, row.text.clone());
                }
            }
        }
        // Reversal-index hierarchical forms: the owner chain's forms joined
        // with "|".
        let reversal_forms: HashMap<Hvo, String> = {
            let mut out = HashMap::new();
            for row in &hierarchy {
                let Ok(class_name) = self.metadata.class_name(row.clid) else {
                    continue;
                };
                if class_name != "ReversalIndexEntry" {
                    continue;
                }
                let mut parts: Vec<String> = vec![];
                let mut cur = Some(row.hvo);
                while let Some(h) = cur {
                    let is_entry = classes
                        .get(&h)
                        .and_then(|c| self.metadata.class_name(*c).ok())
                        .map(|n| n == "ReversalIndexEntry")
                        .unwrap_or(false);
                    if !is_entry {
                        break;
                    }
                    parts.push(forms.get(&h).cloned().unwrap_or_default());
                    cur = owners.get(&h).copied();
                }
                parts.reverse();
                out.insert(row.hvo, parts.join("|"));
            }
            out
        };
        // Headwords come from a store function.
        let mut headwords: HashMap<Hvo, String> = HashMap::new();
        for row in self.store.rows(&SqlCommand::new("exec GetHeadwords$"))? {
            if let (Some(hvo), Some(text)) = (row.hvo(0), row.col(1).text()) {
                headwords.insert(hvo, text.to_string());
            }
        }

        // 4. The walk.
        writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
        writeln!(out, "<!DOCTYPE FwDatabase SYSTEM \"FwDatabase.dtd\">")?;
        writeln!(out, "<FwDatabase version=\"{}\">", self.ctx.version)?;
        self.write_additional_fields(out)?;

        let order = document_order(&hierarchy);
        let mut stack: Vec<ObjFrame> = vec![];
        let enrich = Enrichment {
            guids: &guids,
            owners: &owners,
            classes: &classes,
            names: &names,
            abbrs: &abbrs,
            reversal_forms: &reversal_forms,
            forms: &forms,
            headwords: &headwords,
        };

        for idx in order {
            let row = &hierarchy[idx];

            // Close tags until the top of the stack is this object's owner.
            while let Some(top) = stack.last() {
                if Some(top.hvo) == row.owner {
                    break;
                }
                close_frame(out, &mut stack)?;
            }

            // Field wrapper at the owner level.
            if let Some(owner_frame) = stack.last_mut() {
                let flid = row.own_flid.ok_or_else(|| {
                    XmlError::Fatal(format!("owned object {} has no owning field", row.hvo))
                })?;
                let wrapper_needed = owner_frame
                    .open_wrapper
                    .as_ref()
                    .map(|(f, _)| *f != flid)
                    .unwrap_or(true);
                if wrapper_needed {
                    if let Some((_, name)) = owner_frame.open_wrapper.take() {
                        writeln!(out, "</{name}>")?;
                    }
                    let field = self.metadata.field(flid).map_err(|e| {
                        log.log(None, &format!("unknown owning field {flid} on {}", row.hvo));
                        XmlError::Fatal(e.to_string())
                    })?;
                    let name = if field.custom.is_some() {
                        format!("CustomObj name=\"{}\"", xml_escape_attr(&field.name))
                    } else {
                        field.name.clone()
                    };
                    writeln!(out, "<{name}>")?;
                    let tag_name = if field.custom.is_some() {
                        "CustomObj".to_string()
                    } else {
                        field.name.clone()
                    };
                    owner_frame.open_wrapper = Some((flid, tag_name));
                }
            }

            let class_name = self.metadata.class_name(row.clid).map_err(|e| {
                log.log(
                    None,
                    &format!("unknown class {} for object {}", row.clid, row.hvo),
                );
                XmlError::Fatal(e.to_string())
            })?;
            writeln!(
                out,
                "<{class_name} id=\"I{}\">",
                row.guid.simple().to_string().to_uppercase()
            )?;

            // The object's own non-owning data.
            self.write_scalar_rows(out, scalars.take(row.hvo))?;
            self.write_bytes_rows(out, binaries.take(row.hvo), "Binary")?;
            self.write_bytes_rows(out, images.take(row.hvo), "Image")?;
            self.write_unicode_rows(out, unicodes.take(row.hvo))?;
            self.write_unicode_rows(out, big_unicodes.take(row.hvo))?;
            self.write_string_rows(out, strings.take(row.hvo))?;
            self.write_string_rows(out, big_strings.take(row.hvo))?;
            self.write_multi_unicode_rows(out, multi_unicodes.take(row.hvo))?;
            self.write_multi_unicode_rows(out, multi_big_unicodes.take(row.hvo))?;
            self.write_multi_string_rows(out, multi_strings.take(row.hvo))?;
            self.write_multi_string_rows(out, multi_big_strings.take(row.hvo))?;
            self.write_ref_rows(out, ref_atoms.take(row.hvo), row.clid, &enrich, log)?;
            self.write_ref_rows(out, ref_colls.take(row.hvo), row.clid, &enrich, log)?;
            self.write_ref_rows(out, ref_seqs.take(row.hvo), row.clid, &enrich, log)?;

            stack.push(ObjFrame {
                hvo: row.hvo,
                class_name: class_name.to_string(),
                open_wrapper: None,
            });
        }

        // 5. Unwind whatever is still open, then the root.
        while !stack.is_empty() {
            close_frame(out, &mut stack)?;
        }
        writeln!(out, "</FwDatabase>")?;
        progress.step(25);

        // 6. Clean up the scratch table.
        self.store
            .execute(&SqlCommand::new("delete from [ObjHierarchy$]"))?;
        progress.step(3);
        Ok(())
    }

    fn load_hierarchy(&mut self) -> Result<Vec<HierRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(
            "select [Depth], [Owner$], [OwnFlid$], [ObjId], [ClassId], [Guid$] from [ObjHierarchy$] order by [Depth], [ObjId], [OwnFlid$]",
        ))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(hvo) = row.hvo(3) else { continue };
            let Some(guid) = row.col(5).guid() else {
                continue;
            };
            out.push(HierRow {
                depth: row.int_or_zero(0) as usize,
                owner: row.hvo(1),
                own_flid: row.hvo(2).map(|h| FieldId::new(h.id())),
                hvo,
                clid: ClassId(row.int_or_zero(4) as u32),
                guid,
            });
        }
        Ok(out)
    }

    fn load_scalars(&mut self) -> Result<KindTable<ScalarRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(
            "select [Obj], [Flid], [Val] from [BasicValues$] order by [Obj], [Flid]",
        ))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid)) = (row.hvo(0), row.hvo(1)) else {
                continue;
            };
            let rendering = match row.col(2) {
                v if v.is_null() => "0".to_string(),
                v => v
                    .text()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| v.int_or_zero().to_string()),
            };
            table.push(
                hvo,
                ScalarRow {
                    flid: FieldId::new(flid.id()),
                    rendering,
                },
            );
        }
        Ok(table)
    }

    fn load_bytes(&mut self, view: &str) -> Result<KindTable<BytesRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(format!(
            "select [Obj], [Flid], [Val] from [{view}] order by [Obj], [Flid]"
        )))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid)) = (row.hvo(0), row.hvo(1)) else {
                continue;
            };
            table.push(
                hvo,
                BytesRow {
                    flid: FieldId::new(flid.id()),
                    bytes: row.col(2).bytes().unwrap_or_default().to_vec(),
                },
            );
        }
        Ok(table)
    }

    fn load_unicode(&mut self, view: &str) -> Result<KindTable<UniRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(format!(
            "select [Obj], [Flid], [Txt] from [{view}] order by [Obj], [Flid]"
        )))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid)) = (row.hvo(0), row.hvo(1)) else {
                continue;
            };
            table.push(
                hvo,
                UniRow {
                    flid: FieldId::new(flid.id()),
                    text: row.col(2).text().unwrap_or_default().to_string(),
                },
            );
        }
        Ok(table)
    }

    fn load_strings(&mut self, view: &str) -> Result<KindTable<StrRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(format!(
            "select [Obj], [Flid], [Txt], [Fmt] from [{view}] order by [Obj], [Flid]"
        )))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid)) = (row.hvo(0), row.hvo(1)) else {
                continue;
            };
            let text = row.col(2).text().unwrap_or_default();
            let fmt = row.col(3).bytes().unwrap_or_default();
            let value = RichString::from_parts(text, fmt, WsId::NONE)?;
            table.push(
                hvo,
                StrRow {
                    flid: FieldId::new(flid.id()),
                    value,
                },
            );
        }
        Ok(table)
    }

    fn load_multi_unicode(&mut self, view: &str) -> Result<KindTable<MultiUniRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(format!(
            "select [Obj], [Flid], [Ws], [Txt] from [{view}] order by [Obj], [Flid], [Ws]"
        )))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid)) = (row.hvo(0), row.hvo(1)) else {
                continue;
            };
            table.push(
                hvo,
                MultiUniRow {
                    flid: FieldId::new(flid.id()),
                    ws: WsId(row.int_or_zero(2) as i32),
                    text: row.col(3).text().unwrap_or_default().to_string(),
                },
            );
        }
        Ok(table)
    }

    fn load_multi_strings(&mut self, view: &str) -> Result<KindTable<MultiStrRow>, XmlError> {
        let rows = self.store.rows(&SqlCommand::new(format!(
            "select [Obj], [Flid], [Ws], [Txt], [Fmt] from [{view}] order by [Obj], [Flid], [Ws]"
        )))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid)) = (row.hvo(0), row.hvo(1)) else {
                continue;
            };
            let ws = WsId(row.int_or_zero(2) as i32);
            let text = row.col(3).text().unwrap_or_default();
            let fmt = row.col(4).bytes().unwrap_or_default();
            let value = RichString::from_parts(text, fmt, ws)?;
            table.push(
                hvo,
                MultiStrRow {
                    flid: FieldId::new(flid.id()),
                    ws,
                    value,
                },
            );
        }
        Ok(table)
    }

    fn load_refs(&mut self, view: &str, dst_col: usize) -> Result<KindTable<RefRow>, XmlError> {
        let order = if dst_col == 3 {
            "order by [Obj], [Flid], [Ord]"
        } else {
            "order by [Obj], [Flid]"
        };
        let rows = self.store.rows(&SqlCommand::new(format!(
            "select * from [{view}] {order}"
        )))?;
        let mut table = KindTable::new();
        for row in &rows {
            let (Some(hvo), Some(flid), Some(dst)) = (row.hvo(0), row.hvo(1), row.hvo(dst_col))
            else {
                continue;
            };
            table.push(
                hvo,
                RefRow {
                    flid: FieldId::new(flid.id()),
                    dst,
                },
            );
        }
        Ok(table)
    }

    fn write_additional_fields<W: Write>(&self, out: &mut W) -> Result<(), XmlError> {
        let custom = self.metadata.custom_fields();
        if custom.is_empty() {
            return Ok(());
        }
        writeln!(out, "<AdditionalFields>")?;
        for field in custom {
            let info = field.custom.as_ref().unwrap();
            let class_name = self.metadata.class_name(field.class).unwrap_or("?");
            let mut attrs = format!(
                "name=\"{}\" class=\"{}\" flid=\"{}\" type=\"{}\"",
                xml_escape_attr(&field.name),
                xml_escape_attr(class_name),
                field.id,
                field.prop_type
            );
            if let Some(dst) = field.dst_class {
                if let Ok(dst_name) = self.metadata.class_name(dst) {
                    attrs.push_str(&format!(" destclass=\"{}\"", xml_escape_attr(dst_name)));
                }
            }
            if let Some(min) = info.min {
                attrs.push_str(&format!(" min=\"{min}\""));
            }
            if let Some(max) = info.max {
                attrs.push_str(&format!(" max=\"{max}\""));
            }
            if let Some(big) = info.big {
                attrs.push_str(&format!(" big=\"{}\"", big as i32));
            }
            if let Some(root) = info.list_root {
                attrs.push_str(&format!(
                    " listRootId=\"I{}\"",
                    root.simple().to_string().to_uppercase()
                ));
            }
            if let Some(sel) = info.ws_selector {
                attrs.push_str(&format!(" wsSelector=\"{sel}\""));
            }
            if let Some(label) = &info.user_label {
                attrs.push_str(&format!(" userLabel=\"{}\"", xml_escape_attr(label)));
            }
            if let Some(help) = &info.help_string {
                attrs.push_str(&format!(" helpString=\"{}\"", xml_escape_attr(help)));
            }
            if let Some(ui) = &info.xml_ui {
                attrs.push_str(&format!(" xmlUI=\"{}\"", xml_escape_attr(ui)));
            }
            writeln!(out, "<CustomField {attrs}/>")?;
        }
        writeln!(out, "</AdditionalFields>")?;
        Ok(())
    }

    /// Open (and later close) the field wrapper for a leaf value, honoring
    /// the Custom* wrapper names for user-defined fields.
    fn wrapper_tag(&self, flid: FieldId, kind: &str) -> Result<(String, String), XmlError> {
        let field = self
            .metadata
            .field(flid)
            .map_err(|e| XmlError::Fatal(e.to_string()))?;
        if field.custom.is_some() {
            Ok((
                format!("{kind} name=\"{}\"", xml_escape_attr(&field.name)),
                kind.to_string(),
            ))
        } else {
            Ok((field.name.clone(), field.name.clone()))
        }
    }

    fn write_scalar_rows<W: Write>(
        &self,
        out: &mut W,
        rows: Vec<ScalarRow>,
    ) -> Result<(), XmlError> {
        for row in rows {
            // Zero-and-dot renderings are defaults and are omitted; the
            // importer reconstitutes the same default. Preserved for
            // round-trip fidelity with the existing dialect.
            if !row.rendering.is_empty()
                && row.rendering.chars().all(|c| c == '0' || c == '.')
            {
                continue;
            }
            let ptype = self.metadata.field_type(row.flid)?;
            let Some(element) = ptype.xml_element_name() else {
                continue;
            };
            let (open, close) = self.wrapper_tag(row.flid, "Custom")?;
            writeln!(
                out,
                "<{open}><{element} val=\"{}\"/></{close}>",
                xml_escape_attr(&row.rendering)
            )?;
        }
        Ok(())
    }

    fn write_bytes_rows<W: Write>(
        &self,
        out: &mut W,
        rows: Vec<BytesRow>,
        element: &str,
    ) -> Result<(), XmlError> {
        for row in rows {
            let (open, close) = self.wrapper_tag(row.flid, "Custom")?;
            writeln!(
                out,
                "<{open}><{element}>{}</{element}></{close}>",
                hex_encode(&row.bytes)
            )?;
        }
        Ok(())
    }

    fn write_unicode_rows<W: Write>(&self, out: &mut W, rows: Vec<UniRow>) -> Result<(), XmlError> {
        for row in rows {
            let (open, close) = self.wrapper_tag(row.flid, "Custom")?;
            writeln!(
                out,
                "<{open}><Uni>{}</Uni></{close}>",
                xml_escape_text(&row.text)
            )?;
        }
        Ok(())
    }

    fn write_string_rows<W: Write>(&self, out: &mut W, rows: Vec<StrRow>) -> Result<(), XmlError> {
        for row in rows {
            let (open, close) = self.wrapper_tag(row.flid, "CustomStr")?;
            writeln!(out, "<{open}>")?;
            self.write_str_element(out, "Str", None, &row.value)?;
            writeln!(out, "</{close}>")?;
        }
        Ok(())
    }

    fn write_multi_unicode_rows<W: Write>(
        &self,
        out: &mut W,
        rows: Vec<MultiUniRow>,
    ) -> Result<(), XmlError> {
        let mut open_wrapper: Option<(FieldId, String)> = None;
        for row in rows {
            if open_wrapper.as_ref().map(|(f, _)| *f) != Some(row.flid) {
                if let Some((_, close)) = open_wrapper.take() {
                    writeln!(out, "</{close}>")?;
                }
                let (open, close) = self.wrapper_tag(row.flid, "Custom")?;
                writeln!(out, "<{open}>")?;
                open_wrapper = Some((row.flid, close));
            }
            writeln!(
                out,
                "<AUni ws=\"{}\">{}</AUni>",
                xml_escape_attr(&self.ctx.ws_code(row.ws)),
                xml_escape_text(&row.text)
            )?;
        }
        if let Some((_, close)) = open_wrapper {
            writeln!(out, "</{close}>")?;
        }
        Ok(())
    }

    fn write_multi_string_rows<W: Write>(
        &self,
        out: &mut W,
        rows: Vec<MultiStrRow>,
    ) -> Result<(), XmlError> {
        let mut open_wrapper: Option<(FieldId, String)> = None;
        for row in rows {
            if open_wrapper.as_ref().map(|(f, _)| *f) != Some(row.flid) {
                if let Some((_, close)) = open_wrapper.take() {
                    writeln!(out, "</{close}>")?;
                }
                let (open, close) = self.wrapper_tag(row.flid, "CustomStr")?;
                writeln!(out, "<{open}>")?;
                open_wrapper = Some((row.flid, close));
            }
            self.write_str_element(out, "AStr", Some(row.ws), &row.value)?;
        }
        if let Some((_, close)) = open_wrapper {
            writeln!(out, "</{close}>")?;
        }
        Ok(())
    }

    fn write_str_element<W: Write>(
        &self,
        out: &mut W,
        element: &str,
        ws: Option<WsId>,
        value: &RichString,
    ) -> Result<(), XmlError> {
        match ws {
            Some(ws) => writeln!(
                out,
                "<{element} ws=\"{}\">",
                xml_escape_attr(&self.ctx.ws_code(ws))
            )?,
            None => writeln!(out, "<{element}>")?,
        }
        let mut offset = 0usize;
        let chars: Vec<char> = value.text.chars().collect();
        for run in &value.runs {
            let text: String = chars[offset.min(chars.len())..(offset + run.len).min(chars.len())]
                .iter()
                .collect();
            offset += run.len;
            let attrs = props_to_attrs(&run.props, |ws| self.ctx.ws_code(ws));
            let attr_text = attrs
                .iter()
                .map(|(k, v)| format!(" {k}=\"{}\"", xml_escape_attr(v)))
                .collect::<String>();
            writeln!(out, "<Run{attr_text}>{}</Run>", xml_escape_text(&text))?;
        }
        writeln!(out, "</{element}>")?;
        Ok(())
    }

    fn write_ref_rows<W: Write>(
        &self,
        out: &mut W,
        rows: Vec<RefRow>,
        referencing_clid: ClassId,
        enrich: &Enrichment<'_>,
        log: &mut DiagnosticLog,
    ) -> Result<(), XmlError> {
        let mut open_wrapper: Option<(FieldId, String)> = None;
        for row in rows {
            if open_wrapper.as_ref().map(|(f, _)| *f) != Some(row.flid) {
                if let Some((_, close)) = open_wrapper.take() {
                    writeln!(out, "</{close}>")?;
                }
                let (open, close) = self.wrapper_tag(row.flid, "CustomLink")?;
                writeln!(out, "<{open}>")?;
                open_wrapper = Some((row.flid, close));
            }

            let Some(guid) = enrich.guids.get(&row.dst) else {
                // A dangling reference does not abort the export; leave a
                // placeholder where the link would have been.
                log.log(
                    None,
                    &format!("reference to {} has no resolvable target", row.dst),
                );
                writeln!(out, "<!-- link target {} not found -->", row.dst)?;
                continue;
            };
            let mut attrs = format!("target=\"I{}\"", guid.simple().to_string().to_uppercase());

            let target_class = enrich
                .classes
                .get(&row.dst)
                .and_then(|c| self.metadata.class_name(*c).ok())
                .unwrap_or("");

            if let Some(name) = enrich.names.get(&row.dst) {
                attrs.push_str(&format!(
                    " ws=\"{}\" name=\"{}\"",
                    xml_escape_attr(&self.ctx.ws_code(self.ctx.default_analysis_ws)),
                    xml_escape_attr(name)
                ));
            } else if let Some(owner) = enrich.owners.get(&row.dst) {
                if let Some(name) = enrich.names.get(owner) {
                    attrs.push_str(&format!(" nameOwner=\"{}\"", xml_escape_attr(name)));
                }
            }
            if let Some(abbr) = enrich.abbrs.get(&row.dst) {
                attrs.push_str(&format!(" abbr=\"{}\"", xml_escape_attr(abbr)));
            } else if let Some(owner) = enrich.owners.get(&row.dst) {
                if let Some(abbr) = enrich.abbrs.get(owner) {
                    attrs.push_str(&format!(" abbrOwner=\"{}\"", xml_escape_attr(abbr)));
                }
            }
            if let Some(form) = enrich.reversal_forms.get(&row.dst) {
                attrs.push_str(&format!(" form=\"{}\"", xml_escape_attr(form)));
            } else if target_class == "PhEnvironment" {
                if let Some(form) = enrich.forms.get(&row.dst) {
                    attrs.push_str(&format!(" form=\"{}\"", xml_escape_attr(form)));
                }
            }
            // The LexReference special case: headword enrichment is chosen
            // by the referencing object's class.
            let referencing_is_lexref = self
                .metadata
                .class_name(referencing_clid)
                .map(|n| n == "LexReference")
                .unwrap_or(false);
            if referencing_is_lexref {
                if let Some(headword) = enrich.headwords.get(&row.dst) {
                    match target_class {
                        "LexEntry" => attrs.push_str(&format!(
                            " entry=\"{}\" wsv=\"{}\"",
                            xml_escape_attr(headword),
                            xml_escape_attr(&self.ctx.ws_code(self.ctx.default_vernacular_ws))
                        )),
                        "LexSense" => attrs.push_str(&format!(
                            " sense=\"{}\" wsa=\"{}\"",
                            xml_escape_attr(headword),
                            xml_escape_attr(&self.ctx.ws_code(self.ctx.default_analysis_ws))
                        )),
                        _ => {}
                    }
                }
            }

            writeln!(out, "<Link {attrs}/>")?;
        }
        if let Some((_, close)) = open_wrapper {
            writeln!(out, "</{close}>")?;
        }
        Ok(())
    }
}

struct Enrichment<'a> {
    guids: &'a HashMap<Hvo, Uuid>,
    owners: &'a HashMap<Hvo, Hvo>,
    classes: &'a HashMap<Hvo, ClassId>,
    names: &'a HashMap<Hvo, String>,
    abbrs: &'a HashMap<Hvo, String>,
    reversal_forms: &'a HashMap<Hvo, String>,
    forms: &'a HashMap<Hvo, String>,
    headwords: &'a HashMap<Hvo, String>,
}

/// Flatten the hierarchy rows into document order: depth-first from the
/// roots, children grouped by owning field so siblings of one field share a
/// wrapper.
fn document_order(hierarchy: &[HierRow]) -> Vec<usize> {
    let mut children: HashMap<Option<Hvo>, Vec<usize>> = HashMap::new();
    for (i, row) in hierarchy.iter().enumerate() {
        children.entry(row.owner).or_default().push(i);
    }
    for list in children.values_mut() {
        list.sort_by_key(|i| {
            (
                hierarchy[*i].own_flid.map(|f| f.id()).unwrap_or(0),
                *i,
            )
        });
    }
    let mut order = vec![];
    let mut stack: Vec<usize> = children.remove(&None).unwrap_or_default();
    stack.reverse();
    while let Some(idx) = stack.pop() {
        order.push(idx);
        if let Some(mut kids) = children.remove(&Some(hierarchy[idx].hvo)) {
            kids.reverse();
            for k in kids {
                stack.push(k);
            }
        }
    }
    order
}

fn close_frame<W: Write>(out: &mut W, stack: &mut Vec<ObjFrame>) -> Result<(), XmlError> {
    let Some(frame) = stack.pop() else {
        return Ok(());
    };
    if let Some((_, wrapper)) = frame.open_wrapper {
        writeln!(out, "</{wrapper}>")?;
    }
    writeln!(out, "</{}>", frame.class_name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_common::progress::CountingProgress;
    use cellar_common::{CustomFieldInfo, DictMetadata, PropType};
    use cellar_db::store::{Row, SqlValue};
    use cellar_db::testing::MockStore;
    use pretty_assertions::assert_eq;

    const PROJECT: ClassId = ClassId(1);
    const TEXT: ClassId = ClassId(15);
    const PARA: ClassId = ClassId(16);
    const POSS: ClassId = ClassId(7);

    const TEXTS: FieldId = FieldId::new(1001);
    const PARAGRAPHS: FieldId = FieldId::new(15001);
    const CONTENTS: FieldId = FieldId::new(16001);
    const LABEL: FieldId = FieldId::new(16002);
    const COUNTER: FieldId = FieldId::new(16003);
    const CATEGORY: FieldId = FieldId::new(16004);
    const POSS_NAME: FieldId = FieldId::new(7001);
    const POSSIBILITIES: FieldId = FieldId::new(1002);

    fn metadata() -> DictMetadata {
        let mut md = DictMetadata::new();
        md.add_class(ClassId(0), "CmObject", None);
        md.add_class(PROJECT, "LangProject", Some(ClassId(0)));
        md.add_class(TEXT, "StText", Some(ClassId(0)));
        md.add_class(PARA, "StTxtPara", Some(ClassId(0)));
        md.add_class(POSS, "CmPossibility", Some(ClassId(0)));
        md.add_field(TEXTS, "Texts", PROJECT, PropType::OwningCollection, Some(TEXT));
        md.add_field(
            POSSIBILITIES,
            "Possibilities",
            PROJECT,
            PropType::OwningSequence,
            Some(POSS),
        );
        md.add_field(PARAGRAPHS, "Paragraphs", TEXT, PropType::OwningSequence, Some(PARA));
        md.add_field(CONTENTS, "Contents", PARA, PropType::BigString, None);
        md.add_field(LABEL, "Label", PARA, PropType::Unicode, None);
        md.add_field(COUNTER, "Counter", PARA, PropType::Integer, None);
        md.add_field(
            CATEGORY,
            "Category",
            PARA,
            PropType::ReferenceAtomic,
            Some(POSS),
        );
        md.add_field(POSS_NAME, "Name", POSS, PropType::MultiUnicode, None);
        md
    }

    fn guid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn hier_row(depth: i64, owner: i64, flid: i64, id: i64, clid: i64, g: Uuid) -> Row {
        Row(vec![
            SqlValue::Int(depth),
            if owner == 0 {
                SqlValue::Null
            } else {
                SqlValue::Int(owner)
            },
            if flid == 0 {
                SqlValue::Null
            } else {
                SqlValue::Int(flid)
            },
            SqlValue::Int(id),
            SqlValue::Int(clid),
            SqlValue::Guid(g),
        ])
    }

    fn ctx() -> ExportContext {
        let mut ws_codes = HashMap::new();
        ws_codes.insert(WsId(1), "en".to_string());
        ws_codes.insert(WsId(2), "fr".to_string());
        ExportContext {
            version: 6,
            default_analysis_ws: WsId(1),
            default_vernacular_ws: WsId(2),
            ws_codes,
        }
    }

    fn export_to_string(store: &mut MockStore, md: &DictMetadata) -> (String, usize, u32) {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DiagnosticLog::for_export(&dir.path().join("out.xml")).unwrap();
        let mut progress = CountingProgress::default();
        let mut out: Vec<u8> = vec![];
        let mut exporter = XmlExporter::new(store, md, ctx());
        exporter
            .write_document(&mut out, &mut log, &mut progress)
            .unwrap();
        let entries = log.entry_count();
        log.finish().unwrap();
        (String::from_utf8(out).unwrap(), entries, progress.total)
    }

    fn scripted_store() -> MockStore {
        let mut store = MockStore::new();
        store.script(
            "[ObjHierarchy$]",
            vec![
                hier_row(1, 0, 0, 1, 1, guid(0x11)),
                hier_row(2, 1, 1001, 10, 15, guid(0x22)),
                hier_row(2, 1, 1002, 30, 7, guid(0x44)),
                hier_row(3, 10, 15001, 20, 16, guid(0x33)),
            ],
        );
        store
    }

    #[test]
    fn test_nesting_wrappers_and_leaf_values() {
        let mut store = scripted_store();
        store.script(
            "[UnicodeValues$]",
            vec![Row(vec![
                SqlValue::Int(20),
                SqlValue::Int(LABEL.id() as i64),
                SqlValue::Text("first paragraph".into()),
            ])],
        );
        store.script(
            "[BigStringValues$]",
            vec![Row(vec![
                SqlValue::Int(20),
                SqlValue::Int(CONTENTS.id() as i64),
                SqlValue::Text("Hello".into()),
                SqlValue::Bytes(RichString::new("Hello", WsId(1)).fmt_blob()),
            ])],
        );
        let (xml, errors, _) = export_to_string(&mut store, &metadata());

        assert_eq!(errors, 0);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<!DOCTYPE FwDatabase SYSTEM \"FwDatabase.dtd\">"));
        assert!(xml.contains("<FwDatabase version=\"6\">"));

        // Nesting: project > Texts wrapper > text > Paragraphs wrapper >
        // paragraph, in document order.
        let order = [
            "<LangProject id=\"I00000000000000000000000000000011\">",
            "<Texts>",
            "<StText id=\"I00000000000000000000000000000022\">",
            "<Paragraphs>",
            "<StTxtPara id=\"I00000000000000000000000000000033\">",
            "<Uni>first paragraph</Uni>",
            "<Run ws=\"en\">Hello</Run>",
            "</StTxtPara>",
            "</Paragraphs>",
            "</StText>",
            "</Texts>",
            "</LangProject>",
            "</FwDatabase>",
        ];
        let mut at = 0;
        for needle in order {
            let found = xml[at..].find(needle);
            assert!(found.is_some(), "missing or out of order: {needle}\n{xml}");
            at += found.unwrap();
        }
    }

    #[test]
    fn test_zero_scalars_omitted_nonzero_written() {
        let mut store = scripted_store();
        store.script(
            "[BasicValues$]",
            vec![
                Row(vec![
                    SqlValue::Int(20),
                    SqlValue::Int(COUNTER.id() as i64),
                    SqlValue::Text("0".into()),
                ]),
                Row(vec![
                    SqlValue::Int(10),
                    SqlValue::Int(COUNTER.id() as i64),
                    SqlValue::Text("0.0".into()),
                ]),
                Row(vec![
                    SqlValue::Int(30),
                    SqlValue::Int(COUNTER.id() as i64),
                    SqlValue::Text("7".into()),
                ]),
            ],
        );
        let (xml, _, _) = export_to_string(&mut store, &metadata());
        // All-zero-and-dot renderings are defaults and never written.
        assert!(!xml.contains("val=\"0\""));
        assert!(!xml.contains("val=\"0.0\""));
        assert!(xml.contains("<Integer val=\"7\"/>"));
    }

    #[test]
    fn test_link_enrichment_and_dangling_target() {
        let mut store = scripted_store();
        // The possibility (30) has an analysis-ws Name; paragraph 20
        // references it atomically, and also references a missing object.
        store.script(
            "[MultiUnicodeValues$]",
            vec![Row(vec![
                SqlValue::Int(30),
                SqlValue::Int(POSS_NAME.id() as i64),
                SqlValue::Int(1),
                SqlValue::Text("Noun".into()),
            ])],
        );
        store.script(
            "[RefAtomValues$]",
            vec![
                Row(vec![
                    SqlValue::Int(20),
                    SqlValue::Int(CATEGORY.id() as i64),
                    SqlValue::Int(30),
                ]),
                Row(vec![
                    SqlValue::Int(20),
                    SqlValue::Int(CATEGORY.id() as i64),
                    SqlValue::Int(999),
                ]),
            ],
        );
        let (xml, errors, _) = export_to_string(&mut store, &metadata());

        assert!(xml.contains(
            "<Link target=\"I00000000000000000000000000000044\" ws=\"en\" name=\"Noun\"/>"
        ));
        // The dangling reference leaves a comment, logs once, and the export
        // still completes.
        assert!(xml.contains("<!-- link target #999 not found -->"));
        assert_eq!(errors, 1);
        assert!(xml.contains("</FwDatabase>"));
    }

    #[test]
    fn test_custom_field_wrappers_and_additional_fields() {
        let mut md = metadata();
        md.add_custom_field(
            FieldId::new(16900),
            "Tone",
            PARA,
            PropType::Unicode,
            None,
            CustomFieldInfo {
                user_label: Some("Tone".into()),
                ..Default::default()
            },
        );
        let mut store = scripted_store();
        store.script(
            "[UnicodeValues$]",
            vec![Row(vec![
                SqlValue::Int(20),
                SqlValue::Int(16900),
                SqlValue::Text("high".into()),
            ])],
        );
        let (xml, _, _) = export_to_string(&mut store, &md);
        assert!(xml.contains("<AdditionalFields>"));
        assert!(xml.contains(
            "<CustomField name=\"Tone\" class=\"StTxtPara\" flid=\"16900\" type=\"Unicode\" userLabel=\"Tone\"/>"
        ));
        assert!(xml.contains("<Custom name=\"Tone\"><Uni>high</Uni></Custom>"));
    }

    #[test]
    fn test_unknown_class_is_fatal() {
        let mut store = MockStore::new();
        store.script(
            "[ObjHierarchy$]",
            vec![hier_row(1, 0, 0, 1, 9999, guid(0x11))],
        );
        let dir = tempfile::tempdir().unwrap();
        let mut log = DiagnosticLog::for_export(&dir.path().join("out.xml")).unwrap();
        let md = metadata();
        let mut exporter = XmlExporter::new(&mut store, &md, ctx());
        let mut out: Vec<u8> = vec![];
        let result =
            exporter.write_document(&mut out, &mut log, &mut cellar_common::NullProgress);
        assert!(matches!(result, Err(XmlError::Fatal(_))));
        assert_eq!(log.entry_count(), 1);
        let _ = log.finish();
    }

    #[test]
    fn test_progress_and_scratch_cleanup() {
        let mut store = scripted_store();
        let (_, _, total) = export_to_string(&mut store, &metadata());
        assert!(total <= 100);
        // The scratch hierarchy table was rebuilt and then emptied.
        assert_eq!(store.count_matching("exec UpdateHierarchy"), 1);
        assert_eq!(store.count_matching("delete from [ObjHierarchy$]"), 1);
    }

    #[test]
    fn test_multi_alternates_share_one_wrapper() {
        let mut store = scripted_store();
        store.script(
            "[MultiUnicodeValues$]",
            vec![
                Row(vec![
                    SqlValue::Int(30),
                    SqlValue::Int(POSS_NAME.id() as i64),
                    SqlValue::Int(1),
                    SqlValue::Text("Noun".into()),
                ]),
                Row(vec![
                    SqlValue::Int(30),
                    SqlValue::Int(POSS_NAME.id() as i64),
                    SqlValue::Int(2),
                    SqlValue::Text("Nom".into()),
                ]),
            ],
        );
        let (xml, _, _) = export_to_string(&mut store, &metadata());
        assert_eq!(xml.matches("<Name>").count(), 1);
        assert!(xml.contains("<AUni ws=\"en\">Noun</AUni>"));
        assert!(xml.contains("<AUni ws=\"fr\">Nom</AUni>"));
    }
}
