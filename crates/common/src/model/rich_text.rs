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

//! Rich (run-formatted) text values: a text string plus a run table, each run
//! carrying an independently-optional set of character and paragraph
//! properties. The backing store holds the run table as an opaque binary
//! "format blob"; the codec here is the only place that layout is known.

use std::fmt::{Display, Formatter};

use crate::model::error::DataError;
use crate::model::ids::WsId;

/// Tri-state for boolean-ish character properties: absent means "unspecified",
/// which is distinct from all three of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Toggle {
    Off,
    On,
    /// Invert whatever the context supplies.
    Invert,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SuperSub {
    Off,
    Superscript,
    Subscript,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MeasureUnit {
    /// Thousandths of a printer's point.
    MilliPoint,
    /// Relative to the inherited value, in parts per ten thousand.
    Relative,
}

/// A sized value with its unit, e.g. font size or line height.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Measure {
    pub value: i32,
    pub unit: MeasureUnit,
}

impl Measure {
    pub fn mpt(value: i32) -> Self {
        Measure {
            value,
            unit: MeasureUnit::MilliPoint,
        }
    }

    pub fn rel(value: i32) -> Self {
        Measure {
            value,
            unit: MeasureUnit::Relative,
        }
    }
}

/// An RGB color, or the distinguished transparent value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Color(u32);

const TRANSPARENT_BITS: u32 = 0xC000_0000;

impl Color {
    pub const TRANSPARENT: Color = Color(TRANSPARENT_BITS);

    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Color(((r as u32) << 16) | ((g as u32) << 8) | (b as u32))
    }

    pub fn from_bits(bits: u32) -> Self {
        Color(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_transparent(&self) -> bool {
        self.0 == TRANSPARENT_BITS
    }
}

impl Display for Color {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_transparent() {
            write!(f, "transparent")
        } else {
            write!(f, "{:06x}", self.0 & 0x00FF_FFFF)
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Underline {
    None,
    Single,
    Double,
    Dotted,
    Dashed,
    Squiggle,
    Strikethrough,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Align {
    Leading,
    Left,
    Center,
    Right,
    Trailing,
    Justify,
}

/// One run's (or one paragraph's) formatting. Every field is independently
/// optional; an absent field inherits from style or context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TextProps {
    pub ws: Option<WsId>,
    /// The "old writing system" a legacy encoding attribute resolved to.
    pub old_ws: Option<WsId>,
    pub named_style: Option<String>,
    pub font_family: Option<String>,

    pub bold: Option<Toggle>,
    pub italic: Option<Toggle>,
    pub superscript: Option<SuperSub>,
    pub font_size: Option<Measure>,
    pub offset: Option<Measure>,
    pub fore_color: Option<Color>,
    pub back_color: Option<Color>,
    pub under_color: Option<Color>,
    pub underline: Option<Underline>,

    pub align: Option<Align>,
    pub first_indent: Option<i32>,
    pub lead_indent: Option<i32>,
    pub trail_indent: Option<i32>,
    pub space_before: Option<i32>,
    pub space_after: Option<i32>,
    pub line_height: Option<Measure>,
    pub right_to_left: Option<bool>,

    pub border_top: Option<i32>,
    pub border_bottom: Option<i32>,
    pub border_leading: Option<i32>,
    pub border_trailing: Option<i32>,
    pub border_color: Option<Color>,
    pub pad_top: Option<i32>,
    pub pad_bottom: Option<i32>,
    pub pad_leading: Option<i32>,
    pub pad_trailing: Option<i32>,

    pub bul_num_scheme: Option<i32>,
    pub bul_num_start_at: Option<i32>,
    pub bul_num_txt_bef: Option<String>,
    pub bul_num_txt_aft: Option<String>,
    pub bul_num_font_info: Option<Box<TextProps>>,

    pub keep_with_next: Option<bool>,
    pub keep_together: Option<bool>,
    pub widow_orphan: Option<bool>,
}

impl TextProps {
    pub fn with_ws(ws: WsId) -> Self {
        TextProps {
            ws: Some(ws),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TextProps::default()
    }
}

/// One run: a length (in chars) and the properties applying to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextRun {
    pub len: usize,
    pub props: TextProps,
}

/// A formatted string: text plus a run table covering it. Run lengths sum to
/// the text's char count; an empty string still carries one empty run so the
/// writing system survives the round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RichString {
    pub text: String,
    pub runs: Vec<TextRun>,
}

impl RichString {
    pub fn new(text: impl Into<String>, ws: WsId) -> Self {
        let text = text.into();
        let len = text.chars().count();
        RichString {
            text,
            runs: vec![TextRun {
                len,
                props: TextProps::with_ws(ws),
            }],
        }
    }

    /// The empty string tagged with a writing system. Used when a load finds
    /// both the text and format columns empty: the property is cached as this
    /// rather than left unset.
    pub fn empty(ws: WsId) -> Self {
        RichString::new(String::new(), ws)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// The writing system of the first run, if any run declares one.
    pub fn first_ws(&self) -> Option<WsId> {
        self.runs.iter().find_map(|r| r.props.ws)
    }

    /// Combine a text column and its formatting-blob column into one value.
    /// An empty pair synthesizes the tagged empty string.
    pub fn from_parts(text: &str, fmt_blob: &[u8], ws: WsId) -> Result<Self, DataError> {
        if text.is_empty() && fmt_blob.is_empty() {
            return Ok(RichString::empty(ws));
        }
        if fmt_blob.is_empty() {
            return Ok(RichString::new(text, ws));
        }
        let runs = blob::decode_runs(fmt_blob)?;
        Ok(RichString {
            text: text.to_string(),
            runs,
        })
    }

    /// Serialize the run table to the opaque format blob the backing store
    /// holds.
    pub fn fmt_blob(&self) -> Vec<u8> {
        blob::encode_runs(&self.runs)
    }
}

/// The binary layout of a format blob: little-endian, a u16 run count, then
/// per run a u32 char limit (cumulative) and a tagged property table. Tags
/// are part of the stored format; do not renumber.
mod blob {
    use super::*;

    // Integer-valued property tags.
    const IP_WS: u8 = 1;
    const IP_BOLD: u8 = 2;
    const IP_ITALIC: u8 = 3;
    const IP_SUPERSCRIPT: u8 = 4;
    const IP_FONT_SIZE: u8 = 5;
    const IP_OFFSET: u8 = 6;
    const IP_LINE_HEIGHT: u8 = 7;
    const IP_FORE_COLOR: u8 = 8;
    const IP_BACK_COLOR: u8 = 9;
    const IP_UNDER_COLOR: u8 = 10;
    const IP_UNDERLINE: u8 = 11;
    const IP_ALIGN: u8 = 12;
    const IP_FIRST_INDENT: u8 = 13;
    const IP_LEAD_INDENT: u8 = 14;
    const IP_TRAIL_INDENT: u8 = 15;
    const IP_SPACE_BEFORE: u8 = 16;
    const IP_SPACE_AFTER: u8 = 17;
    const IP_BORDER_TOP: u8 = 18;
    const IP_BORDER_BOTTOM: u8 = 19;
    const IP_BORDER_LEADING: u8 = 20;
    const IP_BORDER_TRAILING: u8 = 21;
    const IP_BORDER_COLOR: u8 = 22;
    const IP_PAD_TOP: u8 = 23;
    const IP_PAD_BOTTOM: u8 = 24;
    const IP_PAD_LEADING: u8 = 25;
    const IP_PAD_TRAILING: u8 = 26;
    const IP_KEEP_WITH_NEXT: u8 = 27;
    const IP_KEEP_TOGETHER: u8 = 28;
    const IP_WIDOW_ORPHAN: u8 = 29;
    const IP_RIGHT_TO_LEFT: u8 = 30;
    const IP_BUL_NUM_SCHEME: u8 = 31;
    const IP_BUL_NUM_START_AT: u8 = 32;
    const IP_OLD_WS: u8 = 33;

    // String-valued property tags.
    const SP_NAMED_STYLE: u8 = 1;
    const SP_FONT_FAMILY: u8 = 2;
    const SP_BUL_NUM_TXT_BEF: u8 = 3;
    const SP_BUL_NUM_TXT_AFT: u8 = 4;
    const SP_BUL_NUM_FONT_INFO: u8 = 5;

    struct Writer(Vec<u8>);

    impl Writer {
        fn u8(&mut self, v: u8) {
            self.0.push(v);
        }
        fn u16(&mut self, v: u16) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn i32(&mut self, v: i32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn u32(&mut self, v: u32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn int_prop(&mut self, tag: u8, variation: u8, value: i32) {
            self.u8(tag);
            self.u8(variation);
            self.i32(value);
        }
        fn str_prop(&mut self, tag: u8, bytes: &[u8]) {
            self.u8(tag);
            self.u16(bytes.len() as u16);
            self.0.extend_from_slice(bytes);
        }
    }

    fn toggle_bits(t: Toggle) -> i32 {
        match t {
            Toggle::Off => 0,
            Toggle::On => 1,
            Toggle::Invert => 2,
        }
    }

    fn toggle_from(v: i32) -> Result<Toggle, DataError> {
        match v {
            0 => Ok(Toggle::Off),
            1 => Ok(Toggle::On),
            2 => Ok(Toggle::Invert),
            _ => Err(DataError::MalformedData(format!("bad toggle value {v}"))),
        }
    }

    fn unit_bits(m: &Measure) -> u8 {
        match m.unit {
            MeasureUnit::MilliPoint => 0,
            MeasureUnit::Relative => 1,
        }
    }

    fn encode_props(props: &TextProps, w: &mut Writer) {
        let mut ints: Vec<(u8, u8, i32)> = vec![];

        if let Some(ws) = props.ws {
            ints.push((IP_WS, 0, ws.0));
        }
        if let Some(ws) = props.old_ws {
            ints.push((IP_OLD_WS, 0, ws.0));
        }
        if let Some(t) = props.bold {
            ints.push((IP_BOLD, 0, toggle_bits(t)));
        }
        if let Some(t) = props.italic {
            ints.push((IP_ITALIC, 0, toggle_bits(t)));
        }
        if let Some(s) = props.superscript {
            let v = match s {
                SuperSub::Off => 0,
                SuperSub::Superscript => 1,
                SuperSub::Subscript => 2,
            };
            ints.push((IP_SUPERSCRIPT, 0, v));
        }
        if let Some(m) = &props.font_size {
            ints.push((IP_FONT_SIZE, unit_bits(m), m.value));
        }
        if let Some(m) = &props.offset {
            ints.push((IP_OFFSET, unit_bits(m), m.value));
        }
        if let Some(m) = &props.line_height {
            ints.push((IP_LINE_HEIGHT, unit_bits(m), m.value));
        }
        if let Some(c) = props.fore_color {
            ints.push((IP_FORE_COLOR, 0, c.bits() as i32));
        }
        if let Some(c) = props.back_color {
            ints.push((IP_BACK_COLOR, 0, c.bits() as i32));
        }
        if let Some(c) = props.under_color {
            ints.push((IP_UNDER_COLOR, 0, c.bits() as i32));
        }
        if let Some(u) = props.underline {
            let v = match u {
                Underline::None => 0,
                Underline::Single => 1,
                Underline::Double => 2,
                Underline::Dotted => 3,
                Underline::Dashed => 4,
                Underline::Squiggle => 5,
                Underline::Strikethrough => 6,
            };
            ints.push((IP_UNDERLINE, 0, v));
        }
        if let Some(a) = props.align {
            let v = match a {
                Align::Leading => 0,
                Align::Left => 1,
                Align::Center => 2,
                Align::Right => 3,
                Align::Trailing => 4,
                Align::Justify => 5,
            };
            ints.push((IP_ALIGN, 0, v));
        }
        if let Some(v) = props.first_indent {
            ints.push((IP_FIRST_INDENT, 0, v));
        }
        if let Some(v) = props.lead_indent {
            ints.push((IP_LEAD_INDENT, 0, v));
        }
        if let Some(v) = props.trail_indent {
            ints.push((IP_TRAIL_INDENT, 0, v));
        }
        if let Some(v) = props.space_before {
            ints.push((IP_SPACE_BEFORE, 0, v));
        }
        if let Some(v) = props.space_after {
            ints.push((IP_SPACE_AFTER, 0, v));
        }
        if let Some(v) = props.border_top {
            ints.push((IP_BORDER_TOP, 0, v));
        }
        if let Some(v) = props.border_bottom {
            ints.push((IP_BORDER_BOTTOM, 0, v));
        }
        if let Some(v) = props.border_leading {
            ints.push((IP_BORDER_LEADING, 0, v));
        }
        if let Some(v) = props.border_trailing {
            ints.push((IP_BORDER_TRAILING, 0, v));
        }
        if let Some(c) = props.border_color {
            ints.push((IP_BORDER_COLOR, 0, c.bits() as i32));
        }
        if let Some(v) = props.pad_top {
            ints.push((IP_PAD_TOP, 0, v));
        }
        if let Some(v) = props.pad_bottom {
            ints.push((IP_PAD_BOTTOM, 0, v));
        }
        if let Some(v) = props.pad_leading {
            ints.push((IP_PAD_LEADING, 0, v));
        }
        if let Some(v) = props.pad_trailing {
            ints.push((IP_PAD_TRAILING, 0, v));
        }
        if let Some(b) = props.keep_with_next {
            ints.push((IP_KEEP_WITH_NEXT, 0, b as i32));
        }
        if let Some(b) = props.keep_together {
            ints.push((IP_KEEP_TOGETHER, 0, b as i32));
        }
        if let Some(b) = props.widow_orphan {
            ints.push((IP_WIDOW_ORPHAN, 0, b as i32));
        }
        if let Some(b) = props.right_to_left {
            ints.push((IP_RIGHT_TO_LEFT, 0, b as i32));
        }
        if let Some(v) = props.bul_num_scheme {
            ints.push((IP_BUL_NUM_SCHEME, 0, v));
        }
        if let Some(v) = props.bul_num_start_at {
            ints.push((IP_BUL_NUM_START_AT, 0, v));
        }

        let mut strs: Vec<(u8, Vec<u8>)> = vec![];
        if let Some(s) = &props.named_style {
            strs.push((SP_NAMED_STYLE, s.as_bytes().to_vec()));
        }
        if let Some(s) = &props.font_family {
            strs.push((SP_FONT_FAMILY, s.as_bytes().to_vec()));
        }
        if let Some(s) = &props.bul_num_txt_bef {
            strs.push((SP_BUL_NUM_TXT_BEF, s.as_bytes().to_vec()));
        }
        if let Some(s) = &props.bul_num_txt_aft {
            strs.push((SP_BUL_NUM_TXT_AFT, s.as_bytes().to_vec()));
        }
        if let Some(inner) = &props.bul_num_font_info {
            let mut iw = Writer(vec![]);
            encode_props(inner, &mut iw);
            strs.push((SP_BUL_NUM_FONT_INFO, iw.0));
        }

        w.u8(ints.len() as u8);
        w.u8(strs.len() as u8);
        for (tag, var, val) in &ints {
            w.int_prop(*tag, *var, *val);
        }
        for (tag, bytes) in &strs {
            w.str_prop(*tag, bytes);
        }
    }

    struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn u8(&mut self) -> Result<u8, DataError> {
            let b = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| DataError::MalformedData("truncated format blob".into()))?;
            self.pos += 1;
            Ok(b)
        }
        fn u16(&mut self) -> Result<u16, DataError> {
            let bytes = self.bytes(2)?;
            Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
        }
        fn i32(&mut self) -> Result<i32, DataError> {
            let bytes = self.bytes(4)?;
            Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        }
        fn u32(&mut self) -> Result<u32, DataError> {
            Ok(self.i32()? as u32)
        }
        fn bytes(&mut self, n: usize) -> Result<&'a [u8], DataError> {
            let end = self.pos + n;
            let s = self
                .buf
                .get(self.pos..end)
                .ok_or_else(|| DataError::MalformedData("truncated format blob".into()))?;
            self.pos = end;
            Ok(s)
        }
    }

    fn measure(var: u8, value: i32) -> Result<Measure, DataError> {
        let unit = match var {
            0 => MeasureUnit::MilliPoint,
            1 => MeasureUnit::Relative,
            _ => {
                return Err(DataError::MalformedData(format!(
                    "bad measure unit {var} in format blob"
                )));
            }
        };
        Ok(Measure { value, unit })
    }

    fn decode_props(r: &mut Reader) -> Result<TextProps, DataError> {
        let n_ints = r.u8()?;
        let n_strs = r.u8()?;
        let mut props = TextProps::default();
        for _ in 0..n_ints {
            let tag = r.u8()?;
            let var = r.u8()?;
            let val = r.i32()?;
            match tag {
                IP_WS => props.ws = Some(WsId(val)),
                IP_OLD_WS => props.old_ws = Some(WsId(val)),
                IP_BOLD => props.bold = Some(toggle_from(val)?),
                IP_ITALIC => props.italic = Some(toggle_from(val)?),
                IP_SUPERSCRIPT => {
                    props.superscript = Some(match val {
                        0 => SuperSub::Off,
                        1 => SuperSub::Superscript,
                        2 => SuperSub::Subscript,
                        _ => {
                            return Err(DataError::MalformedData(format!(
                                "bad superscript value {val}"
                            )));
                        }
                    })
                }
                IP_FONT_SIZE => props.font_size = Some(measure(var, val)?),
                IP_OFFSET => props.offset = Some(measure(var, val)?),
                IP_LINE_HEIGHT => props.line_height = Some(measure(var, val)?),
                IP_FORE_COLOR => props.fore_color = Some(Color::from_bits(val as u32)),
                IP_BACK_COLOR => props.back_color = Some(Color::from_bits(val as u32)),
                IP_UNDER_COLOR => props.under_color = Some(Color::from_bits(val as u32)),
                IP_UNDERLINE => {
                    props.underline = Some(match val {
                        0 => Underline::None,
                        1 => Underline::Single,
                        2 => Underline::Double,
                        3 => Underline::Dotted,
                        4 => Underline::Dashed,
                        5 => Underline::Squiggle,
                        6 => Underline::Strikethrough,
                        _ => {
                            return Err(DataError::MalformedData(format!(
                                "bad underline value {val}"
                            )));
                        }
                    })
                }
                IP_ALIGN => {
                    props.align = Some(match val {
                        0 => Align::Leading,
                        1 => Align::Left,
                        2 => Align::Center,
                        3 => Align::Right,
                        4 => Align::Trailing,
                        5 => Align::Justify,
                        _ => {
                            return Err(DataError::MalformedData(format!("bad align value {val}")));
                        }
                    })
                }
                IP_FIRST_INDENT => props.first_indent = Some(val),
                IP_LEAD_INDENT => props.lead_indent = Some(val),
                IP_TRAIL_INDENT => props.trail_indent = Some(val),
                IP_SPACE_BEFORE => props.space_before = Some(val),
                IP_SPACE_AFTER => props.space_after = Some(val),
                IP_BORDER_TOP => props.border_top = Some(val),
                IP_BORDER_BOTTOM => props.border_bottom = Some(val),
                IP_BORDER_LEADING => props.border_leading = Some(val),
                IP_BORDER_TRAILING => props.border_trailing = Some(val),
                IP_BORDER_COLOR => props.border_color = Some(Color::from_bits(val as u32)),
                IP_PAD_TOP => props.pad_top = Some(val),
                IP_PAD_BOTTOM => props.pad_bottom = Some(val),
                IP_PAD_LEADING => props.pad_leading = Some(val),
                IP_PAD_TRAILING => props.pad_trailing = Some(val),
                IP_KEEP_WITH_NEXT => props.keep_with_next = Some(val != 0),
                IP_KEEP_TOGETHER => props.keep_together = Some(val != 0),
                IP_WIDOW_ORPHAN => props.widow_orphan = Some(val != 0),
                IP_RIGHT_TO_LEFT => props.right_to_left = Some(val != 0),
                IP_BUL_NUM_SCHEME => props.bul_num_scheme = Some(val),
                IP_BUL_NUM_START_AT => props.bul_num_start_at = Some(val),
                _ => {
                    return Err(DataError::MalformedData(format!(
                        "unknown int property tag {tag} in format blob"
                    )));
                }
            }
        }
        for _ in 0..n_strs {
            let tag = r.u8()?;
            let len = r.u16()? as usize;
            let bytes = r.bytes(len)?;
            match tag {
                SP_BUL_NUM_FONT_INFO => {
                    let mut inner = Reader { buf: bytes, pos: 0 };
                    props.bul_num_font_info = Some(Box::new(decode_props(&mut inner)?));
                }
                _ => {
                    let s = std::str::from_utf8(bytes)
                        .map_err(|_| {
                            DataError::MalformedData("non-UTF-8 string in format blob".into())
                        })?
                        .to_string();
                    match tag {
                        SP_NAMED_STYLE => props.named_style = Some(s),
                        SP_FONT_FAMILY => props.font_family = Some(s),
                        SP_BUL_NUM_TXT_BEF => props.bul_num_txt_bef = Some(s),
                        SP_BUL_NUM_TXT_AFT => props.bul_num_txt_aft = Some(s),
                        _ => {
                            return Err(DataError::MalformedData(format!(
                                "unknown string property tag {tag} in format blob"
                            )));
                        }
                    }
                }
            }
        }
        Ok(props)
    }

    pub(super) fn encode_runs(runs: &[TextRun]) -> Vec<u8> {
        let mut w = Writer(vec![]);
        w.u16(runs.len() as u16);
        let mut lim = 0u32;
        for run in runs {
            lim += run.len as u32;
            w.u32(lim);
            encode_props(&run.props, &mut w);
        }
        w.0
    }

    pub(super) fn decode_runs(blob: &[u8]) -> Result<Vec<TextRun>, DataError> {
        let mut r = Reader { buf: blob, pos: 0 };
        let n_runs = r.u16()? as usize;
        let mut runs = Vec::with_capacity(n_runs);
        let mut prev_lim = 0u32;
        for _ in 0..n_runs {
            let lim = r.u32()?;
            if lim < prev_lim {
                return Err(DataError::MalformedData(
                    "run limits out of order in format blob".into(),
                ));
            }
            let props = decode_props(&mut r)?;
            runs.push(TextRun {
                len: (lim - prev_lim) as usize,
                props,
            });
            prev_lim = lim;
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_blob_round_trip_plain() {
        let s = RichString::new("hello", WsId(7));
        let blob = s.fmt_blob();
        let back = RichString::from_parts("hello", &blob, WsId::NONE).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn test_blob_round_trip_styled() {
        let mut props = TextProps::with_ws(WsId(3));
        props.bold = Some(Toggle::On);
        props.italic = Some(Toggle::Invert);
        props.superscript = Some(SuperSub::Subscript);
        props.font_size = Some(Measure::mpt(10_000));
        props.line_height = Some(Measure::rel(10_000));
        props.fore_color = Some(Color::from_rgb(0xff, 0, 0x20));
        props.back_color = Some(Color::TRANSPARENT);
        props.underline = Some(Underline::Squiggle);
        props.named_style = Some("Emphasized Text".to_string());
        props.font_family = Some("Charis SIL".to_string());

        let mut bullet_font = TextProps::default();
        bullet_font.font_family = Some("Wingdings".to_string());
        let mut para = TextProps::default();
        para.align = Some(Align::Justify);
        para.first_indent = Some(-3_000);
        para.bul_num_scheme = Some(101);
        para.bul_num_txt_bef = Some("(".to_string());
        para.bul_num_font_info = Some(Box::new(bullet_font));

        let s = RichString {
            text: "two runs here".to_string(),
            runs: vec![
                TextRun { len: 8, props },
                TextRun { len: 5, props: para },
            ],
        };
        let blob = s.fmt_blob();
        let back = RichString::from_parts("two runs here", &blob, WsId::NONE).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn test_empty_pair_synthesizes_tagged_empty() {
        let s = RichString::from_parts("", &[], WsId(11)).unwrap();
        assert!(s.is_empty());
        assert_eq!(s.first_ws(), Some(WsId(11)));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let s = RichString::new("x", WsId(2));
        let mut blob = s.fmt_blob();
        blob.truncate(blob.len() - 1);
        assert!(RichString::from_parts("x", &blob, WsId::NONE).is_err());
    }
}
