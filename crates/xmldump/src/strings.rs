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

//! The rich-text XML sub-dialect: `<Str>`/`<AStr>` content as a sequence of
//! formatted runs. Two historical encodings are accepted: the current form
//! wraps each run in `<Run attrs>text</Run>`; the legacy form interleaves
//! empty `<Prop attrs/>` elements with raw character data. Which one a
//! document uses is detected at the first `<Run>` or `<Prop>` seen and then
//! assumed for the whole document - deliberately not re-detected per string.
//!
//! Every run attribute is independently optional and independently
//! validated: a malformed value is logged and left unspecified, never
//! aborting the run.

use std::io::Read;

use cellar_common::{
    Align, Color, Measure, RichString, SuperSub, TextProps, TextRun, Toggle, Underline, WsId,
};
use xml::attribute::OwnedAttribute;
use xml::common::Position;
use xml::reader::{EventReader, XmlEvent};

use crate::import::WsResolver;
use crate::{DiagnosticLog, XmlError};

/// Which string encoding the document uses. Flips from Unknown exactly once.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum StringDialect {
    #[default]
    Unknown,
    RunBased,
    LegacyPropInterleaved,
}

/// Parse one `<Str>`/`<AStr>` body, consuming events through the matching
/// close tag. `end_tag` is the element we are inside; `default_ws` tags runs
/// that never declare their own writing system.
pub fn parse_string<R: Read>(
    parser: &mut EventReader<R>,
    end_tag: &str,
    default_ws: WsId,
    dialect: &mut StringDialect,
    ws_resolver: &mut WsResolver,
    log: &mut DiagnosticLog,
    doc_name: &str,
) -> Result<RichString, XmlError> {
    let mut text = String::new();
    let mut runs: Vec<TextRun> = vec![];
    // Legacy form: the most recent <Prop/> applies to the character data
    // that follows it.
    let mut legacy_props: Option<TextProps> = None;
    let mut in_run = false;
    let mut run_props = TextProps::default();
    let mut run_text = String::new();

    loop {
        let pos = parser.position();
        match parser.next() {
            Ok(XmlEvent::StartElement {
                name, attributes, ..
            }) => {
                let tag = name.local_name;
                match tag.as_str() {
                    "Run" => {
                        note_dialect(dialect, StringDialect::RunBased, log, doc_name, pos.row + 1);
                        in_run = true;
                        run_text.clear();
                        run_props = parse_run_props(
                            &attributes,
                            ws_resolver,
                            log,
                            doc_name,
                            pos.row + 1,
                        );
                    }
                    "Prop" => {
                        note_dialect(
                            dialect,
                            StringDialect::LegacyPropInterleaved,
                            log,
                            doc_name,
                            pos.row + 1,
                        );
                        // Character data gathered so far belongs to the
                        // previous prop.
                        flush_legacy(&mut text, &mut runs, &mut legacy_props, default_ws);
                        legacy_props = Some(parse_run_props(
                            &attributes,
                            ws_resolver,
                            log,
                            doc_name,
                            pos.row + 1,
                        ));
                    }
                    other => {
                        log.log(
                            Some((doc_name, pos.row + 1)),
                            &format!("unexpected element <{other}> inside <{end_tag}>"),
                        );
                        skip_element(parser)?;
                    }
                }
            }
            Ok(XmlEvent::Characters(data)) | Ok(XmlEvent::CData(data)) => {
                if in_run {
                    run_text.push_str(&data);
                } else {
                    text.push_str(&data);
                }
            }
            Ok(XmlEvent::Whitespace(data)) => {
                if in_run {
                    run_text.push_str(&data);
                }
            }
            Ok(XmlEvent::EndElement { name }) => {
                let tag = name.local_name;
                if tag == "Run" {
                    in_run = false;
                    let len = run_text.chars().count();
                    text.push_str(&run_text);
                    runs.push(TextRun {
                        len,
                        props: std::mem::take(&mut run_props),
                    });
                } else if tag == "Prop" {
                    // Empty element; its close carries nothing.
                } else if tag == end_tag {
                    flush_legacy(&mut text, &mut runs, &mut legacy_props, default_ws);
                    break;
                }
            }
            Ok(XmlEvent::EndDocument) => {
                return Err(XmlError::Fatal(format!(
                    "document ended inside <{end_tag}>"
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(syntax_error(e)),
        }
    }

    if runs.is_empty() {
        let len = text.chars().count();
        runs.push(TextRun {
            len,
            props: TextProps::with_ws(default_ws),
        });
    }
    Ok(RichString { text, runs })
}

fn flush_legacy(
    text: &mut String,
    runs: &mut Vec<TextRun>,
    legacy_props: &mut Option<TextProps>,
    default_ws: WsId,
) {
    let covered: usize = runs.iter().map(|r| r.len).sum();
    let tail = text.chars().count().saturating_sub(covered);
    if tail > 0 {
        let props = legacy_props
            .take()
            .unwrap_or_else(|| TextProps::with_ws(default_ws));
        runs.push(TextRun { len: tail, props });
    } else if let Some(props) = legacy_props.take() {
        // A prop with no following text still opens a (so far empty) run;
        // the next flush extends it.
        runs.push(TextRun { len: 0, props });
    }
}

pub(crate) fn syntax_error(e: xml::reader::Error) -> XmlError {
    let msg = e.to_string();
    if msg.contains("entity") {
        XmlError::ExternalEntity
    } else {
        XmlError::Syntax(msg)
    }
}

fn note_dialect(
    dialect: &mut StringDialect,
    seen: StringDialect,
    log: &mut DiagnosticLog,
    doc_name: &str,
    line: u64,
) {
    match *dialect {
        StringDialect::Unknown => *dialect = seen,
        current if current != seen => {
            // Detection is once per document by design; a mixed document is
            // logged and parsed under the first-seen encoding.
            log.log(
                Some((doc_name, line)),
                "string encoding differs from the one detected earlier in this document",
            );
        }
        _ => {}
    }
}

/// Skip a subtree we do not understand, keeping the element stack balanced.
pub(crate) fn skip_element<R: Read>(parser: &mut EventReader<R>) -> Result<(), XmlError> {
    let mut depth = 1usize;
    loop {
        match parser.next() {
            Ok(XmlEvent::StartElement { .. }) => depth += 1,
            Ok(XmlEvent::EndElement { .. }) => {
                depth -= 1;
                if depth == 0 {
                    return Ok(());
                }
            }
            Ok(XmlEvent::EndDocument) => {
                return Err(XmlError::Fatal("document ended inside skipped element".into()));
            }
            Ok(_) => {}
            Err(e) => return Err(syntax_error(e)),
        }
    }
}

/// Parse the optional run/paragraph property attributes of a `<Run>` or
/// `<Prop>` element. Unknown attributes and malformed values are logged and
/// skipped individually.
pub fn parse_run_props(
    attributes: &[OwnedAttribute],
    ws_resolver: &mut WsResolver,
    log: &mut DiagnosticLog,
    doc_name: &str,
    line: u64,
) -> TextProps {
    let mut props = TextProps::default();
    let ctx = Some((doc_name, line));

    for attr in attributes {
        let name = attr.name.local_name.as_str();
        let value = attr.value.as_str();
        match name {
            "ws" => props.ws = ws_resolver.resolve(value, log, ctx),
            "enc" => props.old_ws = ws_resolver.resolve(value, log, ctx),
            "namedStyle" => props.named_style = Some(value.to_string()),
            "fontFamily" => props.font_family = Some(value.to_string()),
            "bold" => props.bold = parse_toggle(name, value, log, ctx),
            "italic" => props.italic = parse_toggle(name, value, log, ctx),
            "superscript" => {
                props.superscript = match value {
                    "off" => Some(SuperSub::Off),
                    "super" => Some(SuperSub::Superscript),
                    "sub" => Some(SuperSub::Subscript),
                    other => {
                        log.log(ctx, &format!("bad superscript value \"{other}\""));
                        None
                    }
                }
            }
            "fontsize" => props.font_size = parse_measure(name, value, log, ctx),
            "offset" => props.offset = parse_measure(name, value, log, ctx),
            "lineHeight" => props.line_height = parse_measure(name, value, log, ctx),
            "forecolor" => props.fore_color = parse_color(name, value, log, ctx),
            "backcolor" => props.back_color = parse_color(name, value, log, ctx),
            "undercolor" => props.under_color = parse_color(name, value, log, ctx),
            "underline" => {
                props.underline = match value {
                    "none" => Some(Underline::None),
                    "single" => Some(Underline::Single),
                    "double" => Some(Underline::Double),
                    "dotted" => Some(Underline::Dotted),
                    "dashed" => Some(Underline::Dashed),
                    "squiggle" => Some(Underline::Squiggle),
                    "strikethrough" => Some(Underline::Strikethrough),
                    other => {
                        log.log(ctx, &format!("bad underline value \"{other}\""));
                        None
                    }
                }
            }
            "align" => {
                props.align = match value {
                    "leading" => Some(Align::Leading),
                    "left" => Some(Align::Left),
                    "center" => Some(Align::Center),
                    "right" => Some(Align::Right),
                    "trailing" => Some(Align::Trailing),
                    "justify" => Some(Align::Justify),
                    other => {
                        log.log(ctx, &format!("bad align value \"{other}\""));
                        None
                    }
                }
            }
            "firstIndent" => props.first_indent = parse_int(name, value, log, ctx),
            "leadIndent" => props.lead_indent = parse_int(name, value, log, ctx),
            "trailIndent" => props.trail_indent = parse_int(name, value, log, ctx),
            "spaceBefore" => props.space_before = parse_int(name, value, log, ctx),
            "spaceAfter" => props.space_after = parse_int(name, value, log, ctx),
            "borderTop" => props.border_top = parse_int(name, value, log, ctx),
            "borderBottom" => props.border_bottom = parse_int(name, value, log, ctx),
            "borderLeading" => props.border_leading = parse_int(name, value, log, ctx),
            "borderTrailing" => props.border_trailing = parse_int(name, value, log, ctx),
            "borderColor" => props.border_color = parse_color(name, value, log, ctx),
            "padTop" => props.pad_top = parse_int(name, value, log, ctx),
            "padBottom" => props.pad_bottom = parse_int(name, value, log, ctx),
            "padLeading" => props.pad_leading = parse_int(name, value, log, ctx),
            "padTrailing" => props.pad_trailing = parse_int(name, value, log, ctx),
            "bulNumScheme" => props.bul_num_scheme = parse_int(name, value, log, ctx),
            "bulNumStartAt" => props.bul_num_start_at = parse_int(name, value, log, ctx),
            "bulNumTxtBef" => props.bul_num_txt_bef = Some(value.to_string()),
            "bulNumTxtAft" => props.bul_num_txt_aft = Some(value.to_string()),
            "keepWithNext" => props.keep_with_next = parse_bool(name, value, log, ctx),
            "keepTogether" => props.keep_together = parse_bool(name, value, log, ctx),
            "widowOrphan" => props.widow_orphan = parse_bool(name, value, log, ctx),
            "rightToLeft" => props.right_to_left = parse_bool(name, value, log, ctx),
            other => {
                log.log(ctx, &format!("unknown run property attribute \"{other}\""));
            }
        }
    }
    props
}

fn parse_toggle(
    name: &str,
    value: &str,
    log: &mut DiagnosticLog,
    ctx: Option<(&str, u64)>,
) -> Option<Toggle> {
    match value {
        "off" => Some(Toggle::Off),
        "on" => Some(Toggle::On),
        "invert" => Some(Toggle::Invert),
        other => {
            log.log(ctx, &format!("bad {name} value \"{other}\""));
            None
        }
    }
}

fn parse_bool(
    name: &str,
    value: &str,
    log: &mut DiagnosticLog,
    ctx: Option<(&str, u64)>,
) -> Option<bool> {
    match value {
        "true" => Some(true),
        "false" => Some(false),
        other => {
            log.log(ctx, &format!("bad {name} value \"{other}\""));
            None
        }
    }
}

fn parse_int(
    name: &str,
    value: &str,
    log: &mut DiagnosticLog,
    ctx: Option<(&str, u64)>,
) -> Option<i32> {
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            log.log(ctx, &format!("bad {name} value \"{value}\""));
            None
        }
    }
}

/// Numeric size with an optional unit suffix: `10000mpt` or `10000rel`;
/// a bare number reads as millipoints.
fn parse_measure(
    name: &str,
    value: &str,
    log: &mut DiagnosticLog,
    ctx: Option<(&str, u64)>,
) -> Option<Measure> {
    let (digits, unit) = match value {
        v if v.ends_with("mpt") => (&v[..v.len() - 3], "mpt"),
        v if v.ends_with("rel") => (&v[..v.len() - 3], "rel"),
        v => (v, "mpt"),
    };
    match digits.parse::<i32>() {
        Ok(n) => Some(if unit == "rel" {
            Measure::rel(n)
        } else {
            Measure::mpt(n)
        }),
        Err(_) => {
            log.log(ctx, &format!("bad {name} value \"{value}\""));
            None
        }
    }
}

fn parse_color(
    name: &str,
    value: &str,
    log: &mut DiagnosticLog,
    ctx: Option<(&str, u64)>,
) -> Option<Color> {
    let named = match value {
        "transparent" => Some(Color::TRANSPARENT),
        "black" => Some(Color::from_rgb(0, 0, 0)),
        "white" => Some(Color::from_rgb(0xFF, 0xFF, 0xFF)),
        "red" => Some(Color::from_rgb(0xFF, 0, 0)),
        "green" => Some(Color::from_rgb(0, 0xFF, 0)),
        "blue" => Some(Color::from_rgb(0, 0, 0xFF)),
        "yellow" => Some(Color::from_rgb(0xFF, 0xFF, 0)),
        "magenta" => Some(Color::from_rgb(0xFF, 0, 0xFF)),
        "cyan" => Some(Color::from_rgb(0, 0xFF, 0xFF)),
        _ => None,
    };
    if named.is_some() {
        return named;
    }
    if value.len() == 6 {
        if let Ok(bits) = u32::from_str_radix(value, 16) {
            return Some(Color::from_bits(bits));
        }
    }
    log.log(ctx, &format!("bad {name} value \"{value}\""));
    None
}

/// The inverse of `parse_run_props`: the attribute list a run's properties
/// serialize to. Shared by the exporter so both directions agree.
pub fn props_to_attrs(props: &TextProps, ws_name: impl Fn(WsId) -> String) -> Vec<(String, String)> {
    let mut attrs: Vec<(String, String)> = vec![];
    let mut push = |name: &str, value: String| attrs.push((name.to_string(), value));

    if let Some(ws) = props.ws {
        push("ws", ws_name(ws));
    }
    if let Some(s) = &props.named_style {
        push("namedStyle", s.clone());
    }
    if let Some(s) = &props.font_family {
        push("fontFamily", s.clone());
    }
    if let Some(t) = props.bold {
        push("bold", toggle_str(t).to_string());
    }
    if let Some(t) = props.italic {
        push("italic", toggle_str(t).to_string());
    }
    if let Some(s) = props.superscript {
        let v = match s {
            SuperSub::Off => "off",
            SuperSub::Superscript => "super",
            SuperSub::Subscript => "sub",
        };
        push("superscript", v.to_string());
    }
    if let Some(m) = &props.font_size {
        push("fontsize", measure_str(m));
    }
    if let Some(m) = &props.offset {
        push("offset", measure_str(m));
    }
    if let Some(m) = &props.line_height {
        push("lineHeight", measure_str(m));
    }
    if let Some(c) = props.fore_color {
        push("forecolor", c.to_string());
    }
    if let Some(c) = props.back_color {
        push("backcolor", c.to_string());
    }
    if let Some(c) = props.under_color {
        push("undercolor", c.to_string());
    }
    if let Some(u) = props.underline {
        let v = match u {
            Underline::None => "none",
            Underline::Single => "single",
            Underline::Double => "double",
            Underline::Dotted => "dotted",
            Underline::Dashed => "dashed",
            Underline::Squiggle => "squiggle",
            Underline::Strikethrough => "strikethrough",
        };
        push("underline", v.to_string());
    }
    if let Some(a) = props.align {
        let v = match a {
            Align::Leading => "leading",
            Align::Left => "left",
            Align::Center => "center",
            Align::Right => "right",
            Align::Trailing => "trailing",
            Align::Justify => "justify",
        };
        push("align", v.to_string());
    }
    if let Some(n) = props.first_indent {
        push("firstIndent", n.to_string());
    }
    if let Some(n) = props.lead_indent {
        push("leadIndent", n.to_string());
    }
    if let Some(n) = props.trail_indent {
        push("trailIndent", n.to_string());
    }
    if let Some(n) = props.space_before {
        push("spaceBefore", n.to_string());
    }
    if let Some(n) = props.space_after {
        push("spaceAfter", n.to_string());
    }
    if let Some(n) = props.border_top {
        push("borderTop", n.to_string());
    }
    if let Some(n) = props.border_bottom {
        push("borderBottom", n.to_string());
    }
    if let Some(n) = props.border_leading {
        push("borderLeading", n.to_string());
    }
    if let Some(n) = props.border_trailing {
        push("borderTrailing", n.to_string());
    }
    if let Some(c) = props.border_color {
        push("borderColor", c.to_string());
    }
    if let Some(n) = props.pad_top {
        push("padTop", n.to_string());
    }
    if let Some(n) = props.pad_bottom {
        push("padBottom", n.to_string());
    }
    if let Some(n) = props.pad_leading {
        push("padLeading", n.to_string());
    }
    if let Some(n) = props.pad_trailing {
        push("padTrailing", n.to_string());
    }
    if let Some(n) = props.bul_num_scheme {
        push("bulNumScheme", n.to_string());
    }
    if let Some(n) = props.bul_num_start_at {
        push("bulNumStartAt", n.to_string());
    }
    if let Some(s) = &props.bul_num_txt_bef {
        push("bulNumTxtBef", s.clone());
    }
    if let Some(s) = &props.bul_num_txt_aft {
        push("bulNumTxtAft", s.clone());
    }
    if let Some(b) = props.keep_with_next {
        push("keepWithNext", b.to_string());
    }
    if let Some(b) = props.keep_together {
        push("keepTogether", b.to_string());
    }
    if let Some(b) = props.widow_orphan {
        push("widowOrphan", b.to_string());
    }
    if let Some(b) = props.right_to_left {
        push("rightToLeft", b.to_string());
    }
    attrs
}

fn toggle_str(t: Toggle) -> &'static str {
    match t {
        Toggle::Off => "off",
        Toggle::On => "on",
        Toggle::Invert => "invert",
    }
}

fn measure_str(m: &Measure) -> String {
    match m.unit {
        cellar_common::MeasureUnit::MilliPoint => format!("{}mpt", m.value),
        cellar_common::MeasureUnit::Relative => format!("{}rel", m.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use xml::ParserConfig;

    fn resolver() -> WsResolver {
        let mut r = WsResolver::new(true);
        r.insert("en", WsId(1));
        r.insert("fr", WsId(2));
        r
    }

    fn log_in(dir: &tempfile::TempDir) -> DiagnosticLog {
        DiagnosticLog::for_import(&dir.path().join("doc.wpx")).unwrap()
    }

    fn attr(name: &str, value: &str) -> OwnedAttribute {
        OwnedAttribute::new(xml::name::OwnedName::local(name), value)
    }

    #[test]
    fn test_prop_with_one_bad_attribute_keeps_the_good_one() {
        // bold="on" applies; italic="invalid-value" logs exactly one error
        // and stays unspecified.
        let dir = tempfile::tempdir().unwrap();
        let mut log = log_in(&dir);
        let mut ws = resolver();
        let attrs = vec![attr("bold", "on"), attr("italic", "invalid-value")];
        let props = parse_run_props(&attrs, &mut ws, &mut log, "doc.wpx", 3);
        assert_eq!(props.bold, Some(Toggle::On));
        assert_eq!(props.italic, None);
        assert_eq!(log.entry_count(), 1);
    }

    #[test]
    fn test_measure_units_and_colors() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = log_in(&dir);
        let mut ws = resolver();
        let attrs = vec![
            attr("fontsize", "10000mpt"),
            attr("lineHeight", "12000rel"),
            attr("offset", "500"),
            attr("forecolor", "red"),
            attr("backcolor", "00ff20"),
            attr("undercolor", "transparent"),
            attr("superscript", "sub"),
        ];
        let props = parse_run_props(&attrs, &mut ws, &mut log, "doc.wpx", 1);
        assert_eq!(props.font_size, Some(Measure::mpt(10000)));
        assert_eq!(props.line_height, Some(Measure::rel(12000)));
        assert_eq!(props.offset, Some(Measure::mpt(500)));
        assert_eq!(props.fore_color, Some(Color::from_rgb(0xFF, 0, 0)));
        assert_eq!(props.back_color, Some(Color::from_bits(0x00FF20)));
        assert_eq!(props.under_color, Some(Color::TRANSPARENT));
        assert_eq!(props.superscript, Some(SuperSub::Subscript));
        assert_eq!(log.entry_count(), 0);
    }

    fn parse_str_body(body: &str, dialect: &mut StringDialect) -> RichString {
        let xml_text = format!("<Str>{body}</Str>");
        let mut parser = ParserConfig::new()
            .create_reader(BufReader::new(std::io::Cursor::new(xml_text.into_bytes())));
        // Consume StartDocument and the opening <Str>.
        loop {
            match parser.next().unwrap() {
                XmlEvent::StartElement { name, .. } if name.local_name == "Str" => break,
                _ => {}
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let mut log = log_in(&dir);
        let mut ws = resolver();
        parse_string(
            &mut parser,
            "Str",
            WsId(1),
            dialect,
            &mut ws,
            &mut log,
            "doc.wpx",
        )
        .unwrap()
    }

    #[test]
    fn test_run_based_string() {
        let mut dialect = StringDialect::Unknown;
        let s = parse_str_body(
            r#"<Run ws="en">Hello </Run><Run ws="fr" bold="on">monde</Run>"#,
            &mut dialect,
        );
        assert_eq!(dialect, StringDialect::RunBased);
        assert_eq!(s.text, "Hello monde");
        assert_eq!(s.runs.len(), 2);
        assert_eq!(s.runs[0].len, 6);
        assert_eq!(s.runs[0].props.ws, Some(WsId(1)));
        assert_eq!(s.runs[1].props.ws, Some(WsId(2)));
        assert_eq!(s.runs[1].props.bold, Some(Toggle::On));
    }

    #[test]
    fn test_legacy_prop_interleaved_string() {
        let mut dialect = StringDialect::Unknown;
        let s = parse_str_body(
            r#"<Prop ws="en"/>plain <Prop ws="fr" italic="on"/>riche"#,
            &mut dialect,
        );
        assert_eq!(dialect, StringDialect::LegacyPropInterleaved);
        assert_eq!(s.text, "plain riche");
        assert_eq!(s.runs.len(), 2);
        assert_eq!(s.runs[0].len, 6);
        assert_eq!(s.runs[1].props.italic, Some(Toggle::On));
    }

    #[test]
    fn test_dialect_detected_once_not_per_string() {
        let mut dialect = StringDialect::Unknown;
        parse_str_body(r#"<Run ws="en">first</Run>"#, &mut dialect);
        assert_eq!(dialect, StringDialect::RunBased);
        // The next string in the same document keeps the detected dialect.
        parse_str_body(r#"<Run ws="en">second</Run>"#, &mut dialect);
        assert_eq!(dialect, StringDialect::RunBased);
    }

    #[test]
    fn test_run_attrs_round_trip_through_both_directions() {
        // What the exporter writes for a run, the importer reads back to the
        // same properties.
        let mut props = TextProps::with_ws(WsId(2));
        props.bold = Some(Toggle::Invert);
        props.superscript = Some(SuperSub::Superscript);
        props.font_size = Some(Measure::mpt(9_000));
        props.line_height = Some(Measure::rel(11_000));
        props.fore_color = Some(Color::from_rgb(0, 0xFF, 0x20));
        props.underline = Some(Underline::Dotted);
        props.named_style = Some("Emphasis".to_string());
        props.keep_with_next = Some(true);

        let attrs = props_to_attrs(&props, |ws| {
            if ws == WsId(2) { "fr".to_string() } else { ws.0.to_string() }
        });
        let attr_text = attrs
            .iter()
            .map(|(k, v)| format!(" {k}=\"{v}\""))
            .collect::<String>();

        let mut dialect = StringDialect::Unknown;
        let s = parse_str_body(&format!("<Run{attr_text}>x</Run>"), &mut dialect);
        assert_eq!(s.runs[0].props, props);
    }

    #[test]
    fn test_plain_text_gets_default_ws_run() {
        let mut dialect = StringDialect::Unknown;
        let s = parse_str_body("just text", &mut dialect);
        assert_eq!(s.text, "just text");
        assert_eq!(s.runs.len(), 1);
        assert_eq!(s.runs[0].props.ws, Some(WsId(1)));
    }
}
