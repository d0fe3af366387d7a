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

//! The WorldPad document importer: a streaming parser over an explicit
//! element stack. Every opening tag is classified once (and cached) as
//! document, section, object, property name, basic property, or bad; bad
//! tags are logged and skipped, never fatal. Parsing is best-effort: the
//! caller gets the error count and decides whether a partial result is
//! acceptable.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use cellar_common::model::ids::{ClassId, FieldId, Hvo, WsId};
use cellar_common::{DictMetadata, MetadataCache, PropType, RichString, TextProps};
use lazy_static::lazy_static;
use xml::common::Position;
use xml::reader::{ParserConfig, XmlEvent};

use cellar_db::lazy_store::LazyLoadingStore;
use cellar_db::store::BackingStore;

use crate::strings::{parse_run_props, parse_string, skip_element, syntax_error, StringDialect};
use crate::{DiagnosticLog, WpxVersion, XmlError};

// ---------------------------------------------------------------------
// Native objects reconstructed from the document.
// ---------------------------------------------------------------------

/// A writing-system definition from the `<Languages>` section.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WsDef {
    pub code: String,
    pub name: Option<String>,
    pub locale: Option<i32>,
    pub right_to_left: Option<bool>,
    pub default_font: Option<String>,
    pub font_features: Option<String>,
    pub keyboard: Option<String>,
    pub legacy_mapping: Option<String>,
    pub description: Option<RichString>,
    pub collations: Vec<CollationDef>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollationDef {
    pub name: Option<String>,
    pub win_lcid: Option<i32>,
    pub win_collation: Option<String>,
    pub icu_rules: Option<String>,
}

/// A style from the `<Styles>` section. `based_on`/`next` are the names as
/// parsed; the indices are resolved against the section's styles in a second
/// pass on section close.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StyleDef {
    pub name: String,
    pub based_on: Option<String>,
    pub next: Option<String>,
    pub based_on_index: Option<usize>,
    pub next_index: Option<usize>,
    pub style_type: Option<i32>,
    pub is_built_in: Option<bool>,
    pub rules: Option<TextProps>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParaDef {
    pub style_name: Option<String>,
    pub style_rules: Option<TextProps>,
    pub contents: Option<RichString>,
}

/// Page-setup values are applied directly as parsed; the section close is a
/// pass-through. Numeric fields keep their field names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PageSetupDef {
    pub values: HashMap<String, i64>,
    pub header: Option<RichString>,
    pub footer: Option<RichString>,
}

/// Where reconstructed objects go. The writing-system factory returns the id
/// the rest of the document resolves the code to (an existing id when the
/// system is already known and not being overwritten).
pub trait ImportSink {
    fn writing_system(&mut self, ws: WsDef, old_variant: bool) -> Result<WsId, XmlError>;
    /// The whole Styles section at once, BasedOn/Next already resolved to
    /// indices where possible.
    fn styles(&mut self, styles: Vec<StyleDef>) -> Result<(), XmlError>;
    fn paragraph(&mut self, para: ParaDef) -> Result<(), XmlError>;
    fn page_setup(&mut self, page: PageSetupDef) -> Result<(), XmlError>;
}

#[derive(Debug, Default)]
pub struct ImportOutcome {
    /// Diagnostic entries logged. Zero means the log file was removed.
    pub errors: usize,
    /// Unresolvable writing-system codes counted instead of logged, when the
    /// resolver runs in probe mode.
    pub skipped_ws: usize,
    /// Codes of writing systems created by this parse, in document order.
    pub created_ws: Vec<String>,
    pub body_right_to_left: Option<bool>,
}

// ---------------------------------------------------------------------
// Writing-system id resolution.
// ---------------------------------------------------------------------

lazy_static! {
    /// Legacy locale codes normalized to ISO codes before lookup.
    static ref LEGACY_LOCALE_MAP: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("ENG", "en");
        m.insert("FRN", "fr");
        m.insert("GER", "de");
        m.insert("SPN", "es");
        m.insert("ITN", "it");
        m.insert("POR", "pt");
        m.insert("RUS", "ru");
        m.insert("NLD", "nl");
        m.insert("SWD", "sv");
        m.insert("IPA", "en-fonipa");
        m
    };
}

/// Resolves `ws=`/`enc=` attribute values. Seeded with every writing system
/// already known to the environment; systems created earlier in the same
/// parse are added as they appear. An unresolved code is logged as an error
/// by default, or silently counted when the caller only wants to know
/// whether anything was skipped (probing a standalone snippet).
pub struct WsResolver {
    map: HashMap<String, WsId>,
    log_unknown: bool,
    pub skipped: usize,
}

impl WsResolver {
    pub fn new(log_unknown: bool) -> Self {
        WsResolver {
            map: HashMap::new(),
            log_unknown,
            skipped: 0,
        }
    }

    pub fn insert(&mut self, code: &str, ws: WsId) {
        self.map.insert(Self::normalize(code), ws);
    }

    /// Legacy-locale-code to ISO normalization, then case folding.
    pub fn normalize(code: &str) -> String {
        if let Some(iso) = LEGACY_LOCALE_MAP.get(code) {
            return iso.to_string();
        }
        code.to_lowercase()
    }

    pub fn resolve(
        &mut self,
        code: &str,
        log: &mut DiagnosticLog,
        ctx: Option<(&str, u64)>,
    ) -> Option<WsId> {
        let normalized = Self::normalize(code);
        match self.map.get(&normalized) {
            Some(ws) => Some(*ws),
            None => {
                if self.log_unknown {
                    log.log(ctx, &format!("unknown writing system \"{code}\""));
                } else {
                    self.skipped += 1;
                }
                None
            }
        }
    }
}

// ---------------------------------------------------------------------
// Element classification.
// ---------------------------------------------------------------------

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum SectionKind {
    Languages,
    Styles,
    Body,
    PageSetup,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum BasicType {
    Boolean,
    Integer,
    Uni,
    AUni,
    Str,
    AStr,
    /// A bare `<Prop attrs/>` holding structured text properties.
    Props,
}

#[derive(Clone, Debug, PartialEq)]
enum ElemKind {
    Doc,
    Section(SectionKind),
    Object(ClassId),
    /// The legacy `LgEncoding` wrapper; its nested `LgWritingSystem` is the
    /// real object.
    EncodingShim,
    PropertyName { flid: FieldId, seq: bool },
    BulNumFontInfo,
    Basic(BasicType),
    Bad,
}

/// The tracked state of one open element.
struct OpenElem {
    tag: String,
    kind: ElemKind,
    handle: Option<OpenHandle>,
    /// For PropertyName: how many closed objects existed when it opened.
    prop_start: usize,
    /// For Uni/AUni: accumulated character data, and the alternate's ws.
    text: String,
    alt_ws: Option<WsId>,
}

/// The closed set of native objects the parser can hold mid-flight. No
/// untyped pointers: the variant is the runtime class.
enum OpenHandle {
    WritingSystem(WsDef),
    OldWritingSystem(WsDef),
    Collation(CollationDef),
    Style(StyleDef),
    Paragraph(ParaDef),
    PageInfo(PageSetupDef),
}

enum ClosedObject {
    WritingSystem(WsDef),
    OldWritingSystem(WsDef),
    Collation(CollationDef),
    Style(StyleDef),
    Paragraph(ParaDef),
    PageInfo(PageSetupDef),
}

enum BasicValue {
    Bool(bool),
    Int(i64),
    Uni(String),
    AUni(WsId, String),
    Str(RichString),
    AStr(WsId, RichString),
    Props(TextProps),
}

// ---------------------------------------------------------------------
// The importer.
// ---------------------------------------------------------------------

pub struct XmlImporter<'a, M: MetadataCache, K: ImportSink> {
    metadata: &'a M,
    sink: &'a mut K,
    pub ws_resolver: WsResolver,
    dialect: StringDialect,
    classify_cache: HashMap<String, ElemKind>,
    doc_name: String,
}

impl<'a, M: MetadataCache, K: ImportSink> XmlImporter<'a, M, K> {
    pub fn new(metadata: &'a M, sink: &'a mut K, ws_resolver: WsResolver) -> Self {
        XmlImporter {
            metadata,
            sink,
            ws_resolver,
            dialect: StringDialect::Unknown,
            classify_cache: HashMap::new(),
            doc_name: String::new(),
        }
    }

    pub fn load_xml(&mut self, path: &Path) -> Result<ImportOutcome, XmlError> {
        let file = File::open(path)?;
        let doc_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut log = DiagnosticLog::for_import(path)?;
        let result = self.load_from(BufReader::new(file), &doc_name, &mut log);
        match result {
            Ok(mut outcome) => {
                outcome.errors = log.entry_count();
                outcome.skipped_ws = self.ws_resolver.skipped;
                log.finish()?;
                Ok(outcome)
            }
            Err(e) => {
                log.log(None, &format!("import failed: {e}"));
                let _ = log.finish();
                Err(e)
            }
        }
    }

    /// Parse from any reader. The caller owns the diagnostic log; the error
    /// count in the returned outcome is the log's entry count at the end.
    pub fn load_from<R: Read>(
        &mut self,
        reader: R,
        doc_name: &str,
        log: &mut DiagnosticLog,
    ) -> Result<ImportOutcome, XmlError> {
        self.doc_name = doc_name.to_string();
        let mut parser = ParserConfig::new()
            .ignore_comments(true)
            .create_reader(reader);
        let mut open: Vec<OpenElem> = vec![];
        let mut closed: Vec<ClosedObject> = vec![];
        let mut outcome = ImportOutcome::default();

        loop {
            let pos = parser.position();
            let line = pos.row + 1;
            match parser.next() {
                Ok(XmlEvent::StartDocument { .. }) => {}
                Ok(XmlEvent::StartElement {
                    name, attributes, ..
                }) => {
                    let tag = name.local_name;
                    let kind = self.classify(&tag);
                    let attr =
                        |n: &str| attributes.iter().find(|a| a.name.local_name == n).map(|a| a.value.clone());

                    match kind {
                        ElemKind::Doc => {
                            if !open.is_empty() {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    "document element not outermost",
                                );
                                skip_element(&mut parser)?;
                                continue;
                            }
                            match attr("wpxVersion") {
                                Some(v) => match WpxVersion::parse(&v) {
                                    Some(version) if version.newer_than_supported() => {
                                        log.log(
                                            Some((&self.doc_name, line)),
                                            &format!(
                                                "document version {v} is newer than supported"
                                            ),
                                        );
                                    }
                                    Some(_) => {}
                                    None => {
                                        log.log(
                                            Some((&self.doc_name, line)),
                                            &format!("unparseable wpxVersion \"{v}\""),
                                        );
                                    }
                                },
                                None => {
                                    log.log(
                                        Some((&self.doc_name, line)),
                                        "missing wpxVersion attribute",
                                    );
                                }
                            }
                            open.push(OpenElem {
                                tag,
                                kind: ElemKind::Doc,
                                handle: None,
                                prop_start: 0,
                                text: String::new(),
                                alt_ws: None,
                            });
                        }
                        ElemKind::Section(section) => {
                            if !matches!(open.last().map(|o| &o.kind), Some(ElemKind::Doc)) {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    &format!("section <{tag}> not a direct child of the document"),
                                );
                                skip_element(&mut parser)?;
                                continue;
                            }
                            if section == SectionKind::Body {
                                outcome.body_right_to_left =
                                    attr("docRightToLeft").map(|v| v == "true");
                            }
                            open.push(OpenElem {
                                tag,
                                kind: ElemKind::Section(section),
                                handle: None,
                                prop_start: 0,
                                text: String::new(),
                                alt_ws: None,
                            });
                        }
                        ElemKind::EncodingShim => {
                            // Wrapper around a nested LgWritingSystem; the
                            // inner element is the object.
                            open.push(OpenElem {
                                tag,
                                kind: ElemKind::EncodingShim,
                                handle: None,
                                prop_start: 0,
                                text: String::new(),
                                alt_ws: None,
                            });
                        }
                        ElemKind::Object(clid) => {
                            let nested_ok = matches!(
                                open.last().map(|o| &o.kind),
                                Some(ElemKind::Section(_))
                                    | Some(ElemKind::PropertyName { .. })
                                    | Some(ElemKind::EncodingShim)
                            );
                            if !nested_ok {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    &format!("object <{tag}> outside any section"),
                                );
                                skip_element(&mut parser)?;
                                continue;
                            }
                            let handle = self.construct(&tag, clid, &open, log, line);
                            match handle {
                                Some(h) => open.push(OpenElem {
                                    tag,
                                    kind: ElemKind::Object(clid),
                                    handle: Some(h),
                                    prop_start: 0,
                                    text: String::new(),
                                    alt_ws: None,
                                }),
                                None => {
                                    skip_element(&mut parser)?;
                                }
                            }
                        }
                        ElemKind::PropertyName { flid, seq } => {
                            let parent_is_object = matches!(
                                open.last().map(|o| &o.kind),
                                Some(ElemKind::Object(_))
                            );
                            if !parent_is_object {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    &format!("property <{tag}> not inside an object"),
                                );
                                skip_element(&mut parser)?;
                                continue;
                            }
                            open.push(OpenElem {
                                tag,
                                kind: ElemKind::PropertyName { flid, seq },
                                handle: None,
                                prop_start: closed.len(),
                                text: String::new(),
                                alt_ws: None,
                            });
                        }
                        ElemKind::BulNumFontInfo => {
                            // Aggregates straight into the enclosing object's
                            // bullet/numbering font info.
                            let props = parse_run_props(
                                &attributes,
                                &mut self.ws_resolver,
                                log,
                                &self.doc_name,
                                line,
                            );
                            if let Some(obj) = open.iter_mut().rev().find(|o| o.handle.is_some()) {
                                apply_bul_num_font(obj.handle.as_mut().unwrap(), props);
                            } else {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    "BulNumFontInfo outside any object",
                                );
                            }
                            skip_element(&mut parser)?;
                        }
                        ElemKind::Basic(bt) => {
                            let Some((flid, _seq)) = enclosing_property(&open) else {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    &format!("basic value <{tag}> not inside a property"),
                                );
                                skip_element(&mut parser)?;
                                continue;
                            };
                            let ptype = self.metadata.field_type(flid)?;
                            if !basic_type_legal(bt, ptype) {
                                log.log(
                                    Some((&self.doc_name, line)),
                                    &format!(
                                        "<{tag}> is not a legal value for field {} ({ptype})",
                                        self.metadata.field_name(flid).unwrap_or("?")
                                    ),
                                );
                                skip_element(&mut parser)?;
                                continue;
                            }
                            match bt {
                                BasicType::Boolean => {
                                    let value = match attr("val").as_deref() {
                                        Some("true") => Some(true),
                                        Some("false") => Some(false),
                                        Some(other) => {
                                            log.log(
                                                Some((&self.doc_name, line)),
                                                &format!("bad Boolean val \"{other}\""),
                                            );
                                            None
                                        }
                                        None => {
                                            log.log(
                                                Some((&self.doc_name, line)),
                                                "Boolean element missing val attribute",
                                            );
                                            None
                                        }
                                    };
                                    if let Some(v) = value {
                                        self.apply(&mut open, flid, BasicValue::Bool(v), log, line);
                                    }
                                    skip_element(&mut parser)?;
                                }
                                BasicType::Integer => {
                                    let value = match attr("val") {
                                        Some(raw) => match raw.parse::<i32>() {
                                            Ok(n) => Some(n as i64),
                                            Err(_) => {
                                                log.log(
                                                    Some((&self.doc_name, line)),
                                                    &format!(
                                                        "Integer val \"{raw}\" is not a number in range"
                                                    ),
                                                );
                                                None
                                            }
                                        },
                                        None => {
                                            log.log(
                                                Some((&self.doc_name, line)),
                                                "Integer element missing val attribute",
                                            );
                                            None
                                        }
                                    };
                                    if let Some(v) = value {
                                        self.apply(&mut open, flid, BasicValue::Int(v), log, line);
                                    }
                                    skip_element(&mut parser)?;
                                }
                                BasicType::Props => {
                                    let props = parse_run_props(
                                        &attributes,
                                        &mut self.ws_resolver,
                                        log,
                                        &self.doc_name,
                                        line,
                                    );
                                    self.apply(&mut open, flid, BasicValue::Props(props), log, line);
                                    skip_element(&mut parser)?;
                                }
                                BasicType::Str | BasicType::AStr => {
                                    let alt_ws = match bt {
                                        BasicType::AStr => {
                                            let code = attr("ws").or_else(|| attr("enc"));
                                            match code {
                                                Some(c) => self.ws_resolver.resolve(
                                                    &c,
                                                    log,
                                                    Some((&self.doc_name, line)),
                                                ),
                                                None => {
                                                    log.log(
                                                        Some((&self.doc_name, line)),
                                                        "AStr missing ws attribute",
                                                    );
                                                    None
                                                }
                                            }
                                        }
                                        _ => None,
                                    };
                                    let default_ws = alt_ws.unwrap_or(WsId::NONE);
                                    // Hand the events to the string
                                    // sub-parser; it returns at our close tag.
                                    let value = parse_string(
                                        &mut parser,
                                        &tag,
                                        default_ws,
                                        &mut self.dialect,
                                        &mut self.ws_resolver,
                                        log,
                                        &self.doc_name,
                                    )?;
                                    let v = match bt {
                                        BasicType::AStr => {
                                            BasicValue::AStr(default_ws, value)
                                        }
                                        _ => BasicValue::Str(value),
                                    };
                                    self.apply(&mut open, flid, v, log, line);
                                }
                                BasicType::Uni | BasicType::AUni => {
                                    let alt_ws = if bt == BasicType::AUni {
                                        let code = attr("ws").or_else(|| attr("enc"));
                                        match code {
                                            Some(c) => self.ws_resolver.resolve(
                                                &c,
                                                log,
                                                Some((&self.doc_name, line)),
                                            ),
                                            None => None,
                                        }
                                    } else {
                                        None
                                    };
                                    open.push(OpenElem {
                                        tag,
                                        kind: ElemKind::Basic(bt),
                                        handle: None,
                                        prop_start: 0,
                                        text: String::new(),
                                        alt_ws,
                                    });
                                }
                            }
                        }
                        ElemKind::Bad => {
                            log.log(
                                Some((&self.doc_name, line)),
                                &format!("unrecognized element <{tag}>"),
                            );
                            skip_element(&mut parser)?;
                        }
                    }
                }
                Ok(XmlEvent::Characters(data)) | Ok(XmlEvent::CData(data)) => {
                    if let Some(top) = open.last_mut() {
                        if matches!(
                            top.kind,
                            ElemKind::Basic(BasicType::Uni) | ElemKind::Basic(BasicType::AUni)
                        ) {
                            top.text.push_str(&data);
                        }
                    }
                }
                Ok(XmlEvent::EndElement { name }) => {
                    let Some(top) = open.pop() else {
                        return Err(XmlError::Fatal(
                            "close tag with empty element stack".into(),
                        ));
                    };
                    if top.tag != name.local_name {
                        return Err(XmlError::Fatal(format!(
                            "unbalanced elements: <{}> closed by </{}>",
                            top.tag, name.local_name
                        )));
                    }
                    self.close_element(top, &mut open, &mut closed, &mut outcome, log, line)?;
                }
                Ok(XmlEvent::EndDocument) => {
                    if !open.is_empty() {
                        return Err(XmlError::Fatal(
                            "document ended with elements still open".into(),
                        ));
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(syntax_error(e)),
            }
        }

        outcome.errors = log.entry_count();
        outcome.skipped_ws = self.ws_resolver.skipped;
        Ok(outcome)
    }

    fn close_element(
        &mut self,
        top: OpenElem,
        open: &mut [OpenElem],
        closed: &mut Vec<ClosedObject>,
        outcome: &mut ImportOutcome,
        log: &mut DiagnosticLog,
        line: u64,
    ) -> Result<(), XmlError> {
        match top.kind {
            ElemKind::Basic(BasicType::Uni) => {
                if let Some((flid, _)) = enclosing_property(open) {
                    let text = top.text;
                    apply_to_open(open, flid, BasicValue::Uni(text), log, &self.doc_name, line);
                }
            }
            ElemKind::Basic(BasicType::AUni) => {
                if let Some((flid, _)) = enclosing_property(open) {
                    let ws = top.alt_ws.unwrap_or(WsId::NONE);
                    let text = top.text;
                    apply_to_open(
                        open,
                        flid,
                        BasicValue::AUni(ws, text),
                        log,
                        &self.doc_name,
                        line,
                    );
                }
            }
            ElemKind::Basic(_) => {}
            ElemKind::PropertyName { flid, seq } => {
                let children = closed.len() - top.prop_start;
                if !seq && children > 1 {
                    return Err(XmlError::Fatal(format!(
                        "{children} objects in non-sequence property {}",
                        self.metadata.field_name(flid).unwrap_or("?")
                    )));
                }
                // Pop exactly the children this property accumulated,
                // order-preserving; popping is the ownership transfer.
                let children: Vec<ClosedObject> = closed.split_off(top.prop_start);
                match open.iter_mut().rev().find(|o| o.handle.is_some()) {
                    Some(parent_elem) => {
                        let handle = parent_elem.handle.as_mut().unwrap();
                        for child in children {
                            // An old-variant writing system stays on the
                            // awaiting stack for the Languages dispatch; it
                            // is not a child of the property it appeared in.
                            if let ClosedObject::OldWritingSystem(ws) = child {
                                closed.push(ClosedObject::OldWritingSystem(ws));
                                continue;
                            }
                            attach_child(
                                &mut *handle,
                                flid,
                                child,
                                self.metadata,
                                log,
                                &self.doc_name,
                                line,
                            );
                        }
                    }
                    None => {
                        if !children.is_empty() {
                            log.log(
                                Some((&self.doc_name, line)),
                                "object children in a property with no enclosing object",
                            );
                        }
                    }
                }
            }
            ElemKind::Object(_) => {
                if let Some(handle) = top.handle {
                    closed.push(match handle {
                        OpenHandle::WritingSystem(ws) => ClosedObject::WritingSystem(ws),
                        OpenHandle::OldWritingSystem(ws) => ClosedObject::OldWritingSystem(ws),
                        OpenHandle::Collation(c) => ClosedObject::Collation(c),
                        OpenHandle::Style(s) => ClosedObject::Style(s),
                        OpenHandle::Paragraph(p) => ClosedObject::Paragraph(p),
                        OpenHandle::PageInfo(p) => ClosedObject::PageInfo(p),
                    });
                }
            }
            ElemKind::EncodingShim => {
                // The nested writing system is already on the closed stack.
            }
            ElemKind::Section(section) => {
                self.dispatch_section(section, closed, outcome, log, line)?;
            }
            ElemKind::Doc | ElemKind::BulNumFontInfo | ElemKind::Bad => {}
        }
        Ok(())
    }

    fn dispatch_section(
        &mut self,
        section: SectionKind,
        closed: &mut Vec<ClosedObject>,
        outcome: &mut ImportOutcome,
        log: &mut DiagnosticLog,
        line: u64,
    ) -> Result<(), XmlError> {
        let objects: Vec<ClosedObject> = std::mem::take(closed);
        match section {
            SectionKind::Languages => {
                for obj in objects {
                    let (ws, old) = match obj {
                        ClosedObject::WritingSystem(ws) => (ws, false),
                        ClosedObject::OldWritingSystem(ws) => (ws, true),
                        _ => {
                            log.log(
                                Some((&self.doc_name, line)),
                                "non-writing-system object in Languages section",
                            );
                            continue;
                        }
                    };
                    let code = ws.code.clone();
                    let id = self.sink.writing_system(ws, old)?;
                    self.ws_resolver.insert(&code, id);
                    outcome.created_ws.push(code);
                }
            }
            SectionKind::Styles => {
                let mut styles: Vec<StyleDef> = vec![];
                for obj in objects {
                    match obj {
                        ClosedObject::Style(s) => styles.push(s),
                        _ => log.log(
                            Some((&self.doc_name, line)),
                            "non-style object in Styles section",
                        ),
                    }
                }
                // Second pass: BasedOn/Next names recorded during parsing
                // become indices into this section's styles.
                let names: Vec<String> = styles.iter().map(|s| s.name.clone()).collect();
                for style in &mut styles {
                    if let Some(based_on) = &style.based_on {
                        style.based_on_index = names.iter().position(|n| n == based_on);
                        if style.based_on_index.is_none() {
                            log.log(
                                Some((&self.doc_name, line)),
                                &format!(
                                    "style \"{}\" is based on unknown style \"{based_on}\"",
                                    style.name
                                ),
                            );
                        }
                    }
                    if let Some(next) = &style.next {
                        style.next_index = names.iter().position(|n| n == next);
                        if style.next_index.is_none() {
                            log.log(
                                Some((&self.doc_name, line)),
                                &format!(
                                    "style \"{}\" has unknown next style \"{next}\"",
                                    style.name
                                ),
                            );
                        }
                    }
                }
                self.sink.styles(styles)?;
            }
            SectionKind::Body => {
                for obj in objects {
                    match obj {
                        ClosedObject::Paragraph(p) => self.sink.paragraph(p)?,
                        _ => log.log(
                            Some((&self.doc_name, line)),
                            "non-paragraph object in Body section",
                        ),
                    }
                }
            }
            SectionKind::PageSetup => {
                for obj in objects {
                    match obj {
                        ClosedObject::PageInfo(p) => self.sink.page_setup(p)?,
                        _ => log.log(
                            Some((&self.doc_name, line)),
                            "unexpected object in PageSetup section",
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the native object for an opening object tag. None means the
    /// element (and subtree) is skipped.
    fn construct(
        &mut self,
        tag: &str,
        _clid: ClassId,
        open: &[OpenElem],
        log: &mut DiagnosticLog,
        line: u64,
    ) -> Option<OpenHandle> {
        match tag {
            "LgWritingSystem" => {
                // A writing system nested inside another writing system is
                // the old-variant compatibility shim.
                let nested_in_ws = open.iter().any(|o| {
                    matches!(
                        o.handle,
                        Some(OpenHandle::WritingSystem(_)) | Some(OpenHandle::OldWritingSystem(_))
                    )
                });
                if nested_in_ws {
                    Some(OpenHandle::OldWritingSystem(WsDef::default()))
                } else {
                    Some(OpenHandle::WritingSystem(WsDef::default()))
                }
            }
            "LgCollation" => Some(OpenHandle::Collation(CollationDef::default())),
            "StStyle" => Some(OpenHandle::Style(StyleDef::default())),
            "StTxtPara" | "StPara" => Some(OpenHandle::Paragraph(ParaDef::default())),
            "PageInfo" => Some(OpenHandle::PageInfo(PageSetupDef::default())),
            other => {
                log.log(
                    Some((&self.doc_name, line)),
                    &format!("object class <{other}> is not supported in this document kind"),
                );
                None
            }
        }
    }

    fn apply(
        &mut self,
        open: &mut [OpenElem],
        flid: FieldId,
        value: BasicValue,
        log: &mut DiagnosticLog,
        line: u64,
    ) {
        apply_to_open(open, flid, value, log, &self.doc_name, line);
    }

    /// Classify a tag, computing once per distinct name.
    fn classify(&mut self, tag: &str) -> ElemKind {
        if let Some(kind) = self.classify_cache.get(tag) {
            return kind.clone();
        }
        let kind = self.classify_uncached(tag);
        self.classify_cache.insert(tag.to_string(), kind.clone());
        kind
    }

    fn classify_uncached(&self, tag: &str) -> ElemKind {
        // Fixed basic-type names first.
        match tag {
            "WpDoc" => return ElemKind::Doc,
            "Boolean" => return ElemKind::Basic(BasicType::Boolean),
            "Integer" => return ElemKind::Basic(BasicType::Integer),
            "Uni" => return ElemKind::Basic(BasicType::Uni),
            "AUni" => return ElemKind::Basic(BasicType::AUni),
            "Str" => return ElemKind::Basic(BasicType::Str),
            "AStr" => return ElemKind::Basic(BasicType::AStr),
            "Prop" => return ElemKind::Basic(BasicType::Props),
            "BulNumFontInfo" => return ElemKind::BulNumFontInfo,
            "LgEncoding" => return ElemKind::EncodingShim,
            _ => {}
        }
        // A digit marks a property name: FieldName + declaring class id.
        if tag.chars().any(|c| c.is_ascii_digit()) {
            if let Some((name, clid)) = split_trailing_digits(tag) {
                if let Ok(class_name) = self.metadata.class_name(ClassId(clid)) {
                    if let Some(flid) = self.metadata.field_id(class_name, name) {
                        let seq = self
                            .metadata
                            .field_type(flid)
                            .map(|t| t.is_vector())
                            .unwrap_or(false);
                        return ElemKind::PropertyName { flid, seq };
                    }
                }
            }
            return ElemKind::Bad;
        }
        // Then class names, then section names.
        if self.metadata.class_id(tag).is_some() {
            return ElemKind::Object(self.metadata.class_id(tag).unwrap());
        }
        match tag {
            "Languages" => ElemKind::Section(SectionKind::Languages),
            "Styles" => ElemKind::Section(SectionKind::Styles),
            "Body" => ElemKind::Section(SectionKind::Body),
            "PageSetup" => ElemKind::Section(SectionKind::PageSetup),
            _ => ElemKind::Bad,
        }
    }
}

fn split_trailing_digits(tag: &str) -> Option<(&str, u32)> {
    let digits_at = tag.find(|c: char| c.is_ascii_digit())?;
    let (name, digits) = tag.split_at(digits_at);
    if name.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((name, digits.parse().ok()?))
}

fn enclosing_property(open: &[OpenElem]) -> Option<(FieldId, bool)> {
    open.iter().rev().find_map(|o| match o.kind {
        ElemKind::PropertyName { flid, seq } => Some((flid, seq)),
        _ => None,
    })
}

fn basic_type_legal(bt: BasicType, ptype: PropType) -> bool {
    match bt {
        BasicType::Boolean => ptype == PropType::Boolean,
        BasicType::Integer => matches!(ptype, PropType::Integer | PropType::GenDate),
        BasicType::Uni => matches!(ptype, PropType::Unicode | PropType::BigUnicode),
        BasicType::AUni => matches!(ptype, PropType::MultiUnicode | PropType::MultiBigUnicode),
        BasicType::Str => matches!(ptype, PropType::String | PropType::BigString),
        BasicType::AStr => matches!(ptype, PropType::MultiString | PropType::MultiBigString),
        BasicType::Props => matches!(ptype, PropType::Binary | PropType::Image),
    }
}

/// Route a basic value into the right slot of the enclosing object. An
/// unsupported (class, field) pair is logged and skipped.
fn apply_to_open(
    open: &mut [OpenElem],
    flid: FieldId,
    value: BasicValue,
    log: &mut DiagnosticLog,
    doc_name: &str,
    line: u64,
) {
    let Some(obj) = open.iter_mut().rev().find(|o| o.handle.is_some()) else {
        log.log(Some((doc_name, line)), "value with no enclosing object");
        return;
    };
    let field = flid.id() % 1000;
    let handle = obj.handle.as_mut().unwrap();
    let ok = apply_basic(handle, field, value);
    if !ok {
        log.log(
            Some((doc_name, line)),
            &format!("field {flid} is not supported on this object class"),
        );
    }
}

// Field ordinals within their declaring class (flid % 1000). These are the
// WorldPad schema's fixed assignments; see `wp_schema`.
const F_NAME: i32 = 1;
const F_CODE: i32 = 2;
const F_LOCALE: i32 = 3;
const F_RIGHT_TO_LEFT: i32 = 4;
const F_DEFAULT_FONT: i32 = 5;
const F_FONT_FEATURES: i32 = 6;
const F_KEYBOARD: i32 = 7;
const F_LEGACY_MAPPING: i32 = 8;
const F_DESCRIPTION: i32 = 9;
const F_COLLATIONS: i32 = 10;
const F_WIN_LCID: i32 = 2;
const F_WIN_COLLATION: i32 = 3;
const F_ICU_RULES: i32 = 4;
const F_BASED_ON: i32 = 2;
const F_NEXT: i32 = 3;
const F_STYLE_TYPE: i32 = 4;
const F_IS_BUILT_IN: i32 = 5;
const F_RULES: i32 = 6;
const F_STYLE_NAME: i32 = 1;
const F_STYLE_RULES: i32 = 2;
const F_CONTENTS: i32 = 3;
const F_HEADER: i32 = 20;
const F_FOOTER: i32 = 21;

fn apply_basic(handle: &mut OpenHandle, field: i32, value: BasicValue) -> bool {
    match handle {
        OpenHandle::WritingSystem(ws) | OpenHandle::OldWritingSystem(ws) => {
            match (field, value) {
                (F_NAME, BasicValue::AUni(_, s)) | (F_NAME, BasicValue::Uni(s)) => {
                    ws.name = Some(s)
                }
                (F_CODE, BasicValue::Uni(s)) => ws.code = s,
                (F_LOCALE, BasicValue::Int(n)) => ws.locale = Some(n as i32),
                (F_RIGHT_TO_LEFT, BasicValue::Bool(b)) => ws.right_to_left = Some(b),
                (F_DEFAULT_FONT, BasicValue::Uni(s)) => ws.default_font = Some(s),
                (F_FONT_FEATURES, BasicValue::Uni(s)) => ws.font_features = Some(s),
                (F_KEYBOARD, BasicValue::Uni(s)) => ws.keyboard = Some(s),
                (F_LEGACY_MAPPING, BasicValue::Uni(s)) => ws.legacy_mapping = Some(s),
                (F_DESCRIPTION, BasicValue::AStr(_, s)) | (F_DESCRIPTION, BasicValue::Str(s)) => {
                    ws.description = Some(s)
                }
                _ => return false,
            }
        }
        OpenHandle::Collation(c) => match (field, value) {
            (F_NAME, BasicValue::AUni(_, s)) | (F_NAME, BasicValue::Uni(s)) => c.name = Some(s),
            (F_WIN_LCID, BasicValue::Int(n)) => c.win_lcid = Some(n as i32),
            (F_WIN_COLLATION, BasicValue::Uni(s)) => c.win_collation = Some(s),
            (F_ICU_RULES, BasicValue::Uni(s)) => c.icu_rules = Some(s),
            _ => return false,
        },
        OpenHandle::Style(s) => match (field, value) {
            (F_NAME, BasicValue::Uni(v)) => s.name = v,
            (F_BASED_ON, BasicValue::Uni(v)) => s.based_on = Some(v),
            (F_NEXT, BasicValue::Uni(v)) => s.next = Some(v),
            (F_STYLE_TYPE, BasicValue::Int(n)) => s.style_type = Some(n as i32),
            (F_IS_BUILT_IN, BasicValue::Bool(b)) => s.is_built_in = Some(b),
            (F_RULES, BasicValue::Props(p)) => s.rules = Some(p),
            _ => return false,
        },
        OpenHandle::Paragraph(p) => match (field, value) {
            (F_STYLE_NAME, BasicValue::Uni(v)) => p.style_name = Some(v),
            (F_STYLE_RULES, BasicValue::Props(v)) => p.style_rules = Some(v),
            (F_CONTENTS, BasicValue::Str(v)) => p.contents = Some(v),
            _ => return false,
        },
        OpenHandle::PageInfo(pg) => match (field, value) {
            (F_HEADER, BasicValue::Str(v)) | (F_HEADER, BasicValue::AStr(_, v)) => {
                pg.header = Some(v)
            }
            (F_FOOTER, BasicValue::Str(v)) | (F_FOOTER, BasicValue::AStr(_, v)) => {
                pg.footer = Some(v)
            }
            (n, BasicValue::Int(v)) => {
                pg.values.insert(format!("field{n}"), v);
            }
            _ => return false,
        },
    }
    true
}

fn apply_bul_num_font(handle: &mut OpenHandle, props: TextProps) {
    match handle {
        OpenHandle::Style(s) => {
            s.rules.get_or_insert_with(TextProps::default).bul_num_font_info =
                Some(Box::new(props));
        }
        OpenHandle::Paragraph(p) => {
            p.style_rules
                .get_or_insert_with(TextProps::default)
                .bul_num_font_info = Some(Box::new(props));
        }
        _ => {}
    }
}

/// Attach a closed child object popped off the awaiting stack to its
/// property on the parent.
fn attach_child<M: MetadataCache>(
    parent: &mut OpenHandle,
    flid: FieldId,
    child: ClosedObject,
    _metadata: &M,
    log: &mut DiagnosticLog,
    doc_name: &str,
    line: u64,
) {
    let field = flid.id() % 1000;
    match (parent, field, child) {
        (OpenHandle::WritingSystem(ws), F_COLLATIONS, ClosedObject::Collation(c))
        | (OpenHandle::OldWritingSystem(ws), F_COLLATIONS, ClosedObject::Collation(c)) => {
            ws.collations.push(c);
        }
        _ => {
            log.log(
                Some((doc_name, line)),
                &format!("object child not expected in property {flid}"),
            );
        }
    }
}

// ---------------------------------------------------------------------
// The built-in WorldPad schema and the cache-backed sink.
// ---------------------------------------------------------------------

/// The fixed WorldPad document schema: class ids and the field numbering the
/// property-element names encode.
pub fn wp_schema() -> DictMetadata {
    let mut md = DictMetadata::new();
    md.add_class(ClassId(0), "CmObject", None);
    md.add_class(ClassId(24), "LgWritingSystem", Some(ClassId(0)));
    md.add_class(ClassId(30), "LgCollation", Some(ClassId(0)));
    md.add_class(ClassId(17), "StStyle", Some(ClassId(0)));
    md.add_class(ClassId(14), "StPara", Some(ClassId(0)));
    md.add_class(ClassId(16), "StTxtPara", Some(ClassId(14)));
    md.add_class(ClassId(13), "PageInfo", Some(ClassId(0)));
    md.add_class(ClassId(15), "StText", Some(ClassId(0)));

    let f = |clid: u32, ord: i32| FieldId::new((clid as i32) * 1000 + ord);

    // LgWritingSystem
    md.add_field(f(24, F_NAME), "Name", ClassId(24), PropType::MultiUnicode, None);
    md.add_field(f(24, F_CODE), "Code", ClassId(24), PropType::Unicode, None);
    md.add_field(f(24, F_LOCALE), "Locale", ClassId(24), PropType::Integer, None);
    md.add_field(
        f(24, F_RIGHT_TO_LEFT),
        "RightToLeft",
        ClassId(24),
        PropType::Boolean,
        None,
    );
    md.add_field(
        f(24, F_DEFAULT_FONT),
        "DefaultSerif",
        ClassId(24),
        PropType::Unicode,
        None,
    );
    md.add_field(
        f(24, F_FONT_FEATURES),
        "FontVariation",
        ClassId(24),
        PropType::Unicode,
        None,
    );
    md.add_field(
        f(24, F_KEYBOARD),
        "KeymanKeyboard",
        ClassId(24),
        PropType::Unicode,
        None,
    );
    md.add_field(
        f(24, F_LEGACY_MAPPING),
        "LegacyMapping",
        ClassId(24),
        PropType::Unicode,
        None,
    );
    md.add_field(
        f(24, F_DESCRIPTION),
        "Description",
        ClassId(24),
        PropType::MultiString,
        None,
    );
    md.add_field(
        f(24, F_COLLATIONS),
        "Collations",
        ClassId(24),
        PropType::OwningSequence,
        Some(ClassId(30)),
    );

    // LgCollation
    md.add_field(f(30, F_NAME), "Name", ClassId(30), PropType::MultiUnicode, None);
    md.add_field(f(30, F_WIN_LCID), "WinLCID", ClassId(30), PropType::Integer, None);
    md.add_field(
        f(30, F_WIN_COLLATION),
        "WinCollation",
        ClassId(30),
        PropType::Unicode,
        None,
    );
    md.add_field(f(30, F_ICU_RULES), "ICURules", ClassId(30), PropType::Unicode, None);

    // StStyle
    md.add_field(f(17, F_NAME), "Name", ClassId(17), PropType::Unicode, None);
    md.add_field(f(17, F_BASED_ON), "BasedOn", ClassId(17), PropType::Unicode, None);
    md.add_field(f(17, F_NEXT), "Next", ClassId(17), PropType::Unicode, None);
    md.add_field(f(17, F_STYLE_TYPE), "Type", ClassId(17), PropType::Integer, None);
    md.add_field(
        f(17, F_IS_BUILT_IN),
        "IsBuiltIn",
        ClassId(17),
        PropType::Boolean,
        None,
    );
    md.add_field(f(17, F_RULES), "Rules", ClassId(17), PropType::Binary, None);

    // StTxtPara
    md.add_field(
        f(16, F_STYLE_NAME),
        "StyleName",
        ClassId(16),
        PropType::Unicode,
        None,
    );
    md.add_field(
        f(16, F_STYLE_RULES),
        "StyleRules",
        ClassId(16),
        PropType::Binary,
        None,
    );
    md.add_field(
        f(16, F_CONTENTS),
        "Contents",
        ClassId(16),
        PropType::BigString,
        None,
    );

    // StText
    md.add_field(
        FieldId::new(15001),
        "Paragraphs",
        ClassId(15),
        PropType::OwningSequence,
        Some(ClassId(14)),
    );

    // PageInfo
    md.add_field(f(13, 1), "TopMargin", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 2), "BottomMargin", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 3), "LeftMargin", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 4), "RightMargin", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 5), "HeaderMargin", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 6), "FooterMargin", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 7), "PageSize", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 8), "PageHeight", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 9), "PageWidth", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, 10), "PageOrientation", ClassId(13), PropType::Integer, None);
    md.add_field(f(13, F_HEADER), "Header", ClassId(13), PropType::String, None);
    md.add_field(f(13, F_FOOTER), "Footer", ClassId(13), PropType::String, None);

    md
}

/// An `ImportSink` that writes the document into a data cache through the
/// mutation API: paragraphs become owned objects with their contents set,
/// styles become style objects, writing systems get sequential ids.
pub struct CacheImportSink<'a, S: BackingStore, M: MetadataCache> {
    pub da: &'a mut LazyLoadingStore<S, M>,
    pub text_hvo: Hvo,
    pub paragraphs_flid: FieldId,
    pub para_class: u32,
    pub contents_flid: FieldId,
    pub styles_owner: Hvo,
    pub styles_flid: FieldId,
    pub style_class: u32,
    pub style_name_flid: FieldId,
    next_ws: i32,
    pub ws_ids: HashMap<String, WsId>,
    paragraphs_added: usize,
    styles_added: usize,
    pub page_setup: Option<PageSetupDef>,
}

impl<'a, S: BackingStore, M: MetadataCache> CacheImportSink<'a, S, M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        da: &'a mut LazyLoadingStore<S, M>,
        text_hvo: Hvo,
        paragraphs_flid: FieldId,
        para_class: u32,
        contents_flid: FieldId,
        styles_owner: Hvo,
        styles_flid: FieldId,
        style_class: u32,
        style_name_flid: FieldId,
    ) -> Self {
        CacheImportSink {
            da,
            text_hvo,
            paragraphs_flid,
            para_class,
            contents_flid,
            styles_owner,
            styles_flid,
            style_class,
            style_name_flid,
            next_ws: 1,
            ws_ids: HashMap::new(),
            paragraphs_added: 0,
            styles_added: 0,
            page_setup: None,
        }
    }
}

impl<'a, S: BackingStore, M: MetadataCache> ImportSink for CacheImportSink<'a, S, M> {
    fn writing_system(&mut self, ws: WsDef, _old_variant: bool) -> Result<WsId, XmlError> {
        let code = WsResolver::normalize(&ws.code);
        if let Some(existing) = self.ws_ids.get(&code) {
            // Already exists and we are not overwriting.
            return Ok(*existing);
        }
        let id = WsId(self.next_ws);
        self.next_ws += 1;
        self.ws_ids.insert(code, id);
        Ok(id)
    }

    fn styles(&mut self, styles: Vec<StyleDef>) -> Result<(), XmlError> {
        for style in styles {
            let hvo = self.da.make_new_object(
                self.style_class,
                self.styles_owner,
                self.styles_flid,
                Some(self.styles_added as i32),
            )?;
            self.styles_added += 1;
            self.da.set_unicode(hvo, self.style_name_flid, style.name)?;
        }
        Ok(())
    }

    fn paragraph(&mut self, para: ParaDef) -> Result<(), XmlError> {
        let hvo = self.da.make_new_object(
            self.para_class,
            self.text_hvo,
            self.paragraphs_flid,
            Some(self.paragraphs_added as i32),
        )?;
        self.paragraphs_added += 1;
        if let Some(contents) = para.contents {
            self.da.set_string(hvo, self.contents_flid, contents)?;
        }
        Ok(())
    }

    fn page_setup(&mut self, page: PageSetupDef) -> Result<(), XmlError> {
        self.page_setup = Some(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_db::testing::MockStore;
    use cellar_db::store::{Row, SqlValue};
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingSink {
        ws: Vec<(WsDef, bool)>,
        styles: Vec<StyleDef>,
        paragraphs: Vec<ParaDef>,
        pages: Vec<PageSetupDef>,
        next_ws: i32,
    }

    impl ImportSink for RecordingSink {
        fn writing_system(&mut self, ws: WsDef, old_variant: bool) -> Result<WsId, XmlError> {
            self.next_ws += 1;
            self.ws.push((ws, old_variant));
            Ok(WsId(self.next_ws))
        }

        fn styles(&mut self, styles: Vec<StyleDef>) -> Result<(), XmlError> {
            self.styles = styles;
            Ok(())
        }

        fn paragraph(&mut self, para: ParaDef) -> Result<(), XmlError> {
            self.paragraphs.push(para);
            Ok(())
        }

        fn page_setup(&mut self, page: PageSetupDef) -> Result<(), XmlError> {
            self.pages.push(page);
            Ok(())
        }
    }

    fn parse(doc: &str, sink: &mut RecordingSink) -> (ImportOutcome, usize) {
        // The environment already knows these systems; the resolver is
        // seeded with them at parse start.
        let mut resolver = WsResolver::new(true);
        resolver.insert("en", WsId(1));
        resolver.insert("fr", WsId(2));
        parse_with_resolver(doc, sink, resolver)
    }

    fn parse_with_resolver(
        doc: &str,
        sink: &mut RecordingSink,
        resolver: WsResolver,
    ) -> (ImportOutcome, usize) {
        let schema = wp_schema();
        let dir = tempfile::tempdir().unwrap();
        let mut log = DiagnosticLog::for_import(&dir.path().join("doc.wpx")).unwrap();
        let mut importer = XmlImporter::new(&schema, sink, resolver);
        let outcome = importer
            .load_from(Cursor::new(doc.as_bytes().to_vec()), "doc.wpx", &mut log)
            .unwrap();
        let errors = log.entry_count();
        log.finish().unwrap();
        (outcome, errors)
    }

    const FULL_DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<WpDoc wpxVersion="2.0">
  <Languages>
    <LgWritingSystem>
      <Code24><Uni>en</Uni></Code24>
      <Name24><AUni ws="en">English</AUni></Name24>
      <RightToLeft24><Boolean val="false"/></RightToLeft24>
      <Locale24><Integer val="1033"/></Locale24>
      <Collations24>
        <LgCollation>
          <WinLCID30><Integer val="1033"/></WinLCID30>
          <WinCollation30><Uni>Latin1_General_CI_AI</Uni></WinCollation30>
        </LgCollation>
      </Collations24>
    </LgWritingSystem>
  </Languages>
  <Styles>
    <StStyle>
      <Name17><Uni>Normal</Uni></Name17>
      <Rules17><Prop fontsize="10000mpt"/></Rules17>
    </StStyle>
    <StStyle>
      <Name17><Uni>Heading 1</Uni></Name17>
      <BasedOn17><Uni>Normal</Uni></BasedOn17>
      <Next17><Uni>Normal</Uni></Next17>
    </StStyle>
  </Styles>
  <Body docRightToLeft="false">
    <StTxtPara>
      <StyleName16><Uni>Normal</Uni></StyleName16>
      <Contents16><Str><Run ws="en">Hello world</Run></Str></Contents16>
    </StTxtPara>
  </Body>
</WpDoc>"#;

    #[test]
    fn test_full_document_import() {
        let mut sink = RecordingSink::default();
        let (outcome, errors) = parse(FULL_DOC, &mut sink);
        assert_eq!(errors, 0);
        assert_eq!(outcome.created_ws, vec!["en".to_string()]);
        assert_eq!(outcome.body_right_to_left, Some(false));

        let (ws, old) = &sink.ws[0];
        assert!(!old);
        assert_eq!(ws.code, "en");
        assert_eq!(ws.name.as_deref(), Some("English"));
        assert_eq!(ws.right_to_left, Some(false));
        assert_eq!(ws.locale, Some(1033));
        assert_eq!(ws.collations.len(), 1);
        assert_eq!(ws.collations[0].win_lcid, Some(1033));

        assert_eq!(sink.styles.len(), 2);
        assert_eq!(sink.styles[0].name, "Normal");
        assert_eq!(
            sink.styles[0].rules.as_ref().unwrap().font_size,
            Some(cellar_common::Measure::mpt(10000))
        );
        // BasedOn/Next resolved to indices in the second pass.
        assert_eq!(sink.styles[1].based_on_index, Some(0));
        assert_eq!(sink.styles[1].next_index, Some(0));

        assert_eq!(sink.paragraphs.len(), 1);
        let para = &sink.paragraphs[0];
        assert_eq!(para.style_name.as_deref(), Some("Normal"));
        let contents = para.contents.as_ref().unwrap();
        assert_eq!(contents.text, "Hello world");
        assert_eq!(contents.runs[0].props.ws, Some(WsId(1)));
    }

    #[test]
    fn test_newer_version_logged_not_fatal() {
        let doc = r#"<WpDoc wpxVersion="3.5"><Body docRightToLeft="true"></Body></WpDoc>"#;
        let mut sink = RecordingSink::default();
        let (outcome, errors) = parse(doc, &mut sink);
        assert_eq!(errors, 1);
        assert_eq!(outcome.body_right_to_left, Some(true));
    }

    #[test]
    fn test_bad_tag_logged_and_skipped() {
        let doc = r#"<WpDoc wpxVersion="2.0">
  <Styles>
    <NoSuchElement><Deeper/></NoSuchElement>
    <StStyle><Name17><Uni>Normal</Uni></Name17></StStyle>
  </Styles>
</WpDoc>"#;
        let mut sink = RecordingSink::default();
        let (_, errors) = parse(doc, &mut sink);
        assert_eq!(errors, 1);
        // Parsing continued past the bad element.
        assert_eq!(sink.styles.len(), 1);
        assert_eq!(sink.styles[0].name, "Normal");
    }

    #[test]
    fn test_multiple_objects_in_atomic_property_is_fatal() {
        // Collations is a sequence, so use a fabricated atomic case: two
        // styles inside BasedOn is nonsense the parser must refuse.
        let doc = r#"<WpDoc wpxVersion="2.0">
  <Styles>
    <StStyle>
      <BasedOn17>
        <StStyle><Name17><Uni>A</Uni></Name17></StStyle>
        <StStyle><Name17><Uni>B</Uni></Name17></StStyle>
      </BasedOn17>
    </StStyle>
  </Styles>
</WpDoc>"#;
        let schema = wp_schema();
        let dir = tempfile::tempdir().unwrap();
        let mut log = DiagnosticLog::for_import(&dir.path().join("doc.wpx")).unwrap();
        let mut sink = RecordingSink::default();
        let mut importer = XmlImporter::new(&schema, &mut sink, WsResolver::new(true));
        let result =
            importer.load_from(Cursor::new(doc.as_bytes().to_vec()), "doc.wpx", &mut log);
        assert!(matches!(result, Err(XmlError::Fatal(_))));
        log.finish().unwrap();
    }

    #[test]
    fn test_lg_encoding_wrapper_shim() {
        let doc = r#"<WpDoc wpxVersion="2.0">
  <Languages>
    <LgEncoding>
      <LgWritingSystem>
        <Code24><Uni>fr</Uni></Code24>
      </LgWritingSystem>
    </LgEncoding>
  </Languages>
</WpDoc>"#;
        let mut sink = RecordingSink::default();
        let (outcome, errors) = parse(doc, &mut sink);
        assert_eq!(errors, 0);
        assert_eq!(outcome.created_ws, vec!["fr".to_string()]);
        assert!(!sink.ws[0].1);
    }

    #[test]
    fn test_nested_writing_system_is_old_variant() {
        let doc = r#"<WpDoc wpxVersion="2.0">
  <Languages>
    <LgWritingSystem>
      <Code24><Uni>en</Uni></Code24>
      <Collations24>
        <LgWritingSystem>
          <Code24><Uni>en-old</Uni></Code24>
        </LgWritingSystem>
      </Collations24>
    </LgWritingSystem>
  </Languages>
</WpDoc>"#;
        let mut sink = RecordingSink::default();
        let (_, _) = parse(doc, &mut sink);
        let old_count = sink.ws.iter().filter(|(_, old)| *old).count();
        assert_eq!(old_count, 1);
    }

    #[test]
    fn test_legacy_enc_attribute_and_locale_normalization() {
        let mut resolver = WsResolver::new(true);
        resolver.insert("en", WsId(7));
        let doc = r#"<WpDoc wpxVersion="1.0">
  <Body docRightToLeft="false">
    <StTxtPara>
      <Contents16><Str><Run enc="ENG">legacy</Run></Str></Contents16>
    </StTxtPara>
  </Body>
</WpDoc>"#;
        let mut sink = RecordingSink::default();
        let (_, errors) = parse_with_resolver(doc, &mut sink, resolver);
        assert_eq!(errors, 0);
        let para = &sink.paragraphs[0];
        // "ENG" normalized to "en" and resolved through the seeded map,
        // landing in the old-writing-system slot.
        assert_eq!(
            para.contents.as_ref().unwrap().runs[0].props.old_ws,
            Some(WsId(7))
        );
    }

    #[test]
    fn test_probe_mode_counts_skips_instead_of_logging() {
        let doc = r#"<WpDoc wpxVersion="2.0">
  <Body docRightToLeft="false">
    <StTxtPara>
      <Contents16><Str><Run ws="zz-unknown">x</Run></Str></Contents16>
    </StTxtPara>
  </Body>
</WpDoc>"#;
        let mut sink = RecordingSink::default();
        let (outcome, errors) = parse_with_resolver(doc, &mut sink, WsResolver::new(false));
        assert_eq!(errors, 0);
        assert_eq!(outcome.skipped_ws, 1);
    }

    #[test]
    fn test_import_log_deleted_when_clean() {
        let schema = wp_schema();
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("doc.wpx");
        let log = DiagnosticLog::for_import(&data).unwrap();
        let log_path = log.path().to_path_buf();
        let mut sink = RecordingSink::default();
        let mut resolver = WsResolver::new(true);
        resolver.insert("en", WsId(1));
        let mut importer = XmlImporter::new(&schema, &mut sink, resolver);
        let mut log = log;
        importer
            .load_from(
                Cursor::new(FULL_DOC.as_bytes().to_vec()),
                "doc.wpx",
                &mut log,
            )
            .unwrap();
        log.finish().unwrap();
        assert!(!log_path.exists());
    }

    #[test]
    fn test_style_name_lands_in_cache_through_sink() {
        // <Name17><Uni>Normal</Uni></Name17> on an imported style must come
        // back from the cache as the style object's unicode Name.
        let schema = wp_schema();
        let mut da = LazyLoadingStore::new(MockStore::new(), wp_schema());
        da.store_mut().script(
            "CreateOwnedObject$",
            vec![Row(vec![
                SqlValue::Int(5),
                SqlValue::Guid(uuid::Uuid::new_v4()),
            ])],
        );
        da.store_mut().script(
            "[UpdStmp] from [CmObject]",
            vec![Row(vec![SqlValue::Bytes(vec![1; 8])])],
        );
        let styles_owner = Hvo::new(2);
        da.cache_mut().set_vector(styles_owner, FieldId::new(15001), vec![]);

        let doc = r#"<WpDoc wpxVersion="2.0">
  <Styles>
    <StStyle><Name17><Uni>Normal</Uni></Name17></StStyle>
  </Styles>
</WpDoc>"#;
        let dir = tempfile::tempdir().unwrap();
        let mut log = DiagnosticLog::for_import(&dir.path().join("doc.wpx")).unwrap();
        {
            let mut sink = CacheImportSink::new(
                &mut da,
                Hvo::new(3),
                FieldId::new(15001),
                16,
                FieldId::new(16003),
                styles_owner,
                FieldId::new(15001),
                17,
                FieldId::new(17001),
            );
            let mut importer = XmlImporter::new(&schema, &mut sink, WsResolver::new(true));
            importer
                .load_from(Cursor::new(doc.as_bytes().to_vec()), "doc.wpx", &mut log)
                .unwrap();
        }
        assert_eq!(log.finish().unwrap(), 0);

        assert_eq!(
            da.get_unicode_prop(Hvo::new(5), FieldId::new(17001)).unwrap(),
            Some("Normal".to_string())
        );
    }
}
