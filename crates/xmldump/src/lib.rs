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

//! XML round-trip for cellar databases: a full-project export written
//! straight from the backing store (bypassing the object cache), and a
//! streaming, best-effort importer for the WorldPad document dialect.
//!
//! Diagnostics go to a sibling log file next to the input/output file, one
//! line per issue, `file:line:` prefixed where parser context exists. The
//! log file and the status channel are independent: a logged line does not
//! mean the operation failed.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use cellar_common::DataError;
use thiserror::Error;

pub mod export;
pub mod import;
pub mod strings;

pub use export::{ExportContext, XmlExporter};
pub use import::{
    wp_schema, CacheImportSink, CollationDef, ImportOutcome, ImportSink, PageSetupDef, ParaDef,
    StyleDef, WsDef, WsResolver, XmlImporter,
};
pub use strings::{parse_run_props, props_to_attrs, StringDialect};

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data access error: {0}")]
    Data(#[from] DataError),
    #[error("xml syntax error: {0}")]
    Syntax(String),
    /// Structural anomalies that would corrupt the output or the parse:
    /// unknown class/owning field during export, unbalanced element stacks,
    /// multiple objects in a non-sequence property.
    #[error("fatal: {0}")]
    Fatal(String),
    /// The dialect forbids external entity references outright.
    #[error("external entity reference rejected")]
    ExternalEntity,
}

/// The WorldPad document dialect version gate. Major versions newer than
/// what we write are rejected (logged, parse continues without the guarantee).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WpxVersion {
    pub major: u32,
    pub minor: u32,
}

pub const WPX_CURRENT: WpxVersion = WpxVersion { major: 2, minor: 0 };

impl WpxVersion {
    pub fn parse(s: &str) -> Option<WpxVersion> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().unwrap_or("0").parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(WpxVersion { major, minor })
    }

    pub fn newer_than_supported(&self) -> bool {
        (self.major, self.minor) > (WPX_CURRENT.major, WPX_CURRENT.minor)
    }
}

/// A sibling diagnostic log: for `X.ext` it writes `X-Import.log` or
/// `X-Export.log` alongside. Deleted on `finish` when nothing was logged, so
/// a clean run leaves no empty artifact behind.
pub struct DiagnosticLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    entries: usize,
}

impl DiagnosticLog {
    pub fn sibling(data_path: &Path, suffix: &str) -> Result<Self, XmlError> {
        let stem = data_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        let path = data_path.with_file_name(format!("{stem}{suffix}.log"));
        Ok(DiagnosticLog {
            path,
            writer: None,
            entries: 0,
        })
    }

    pub fn for_import(data_path: &Path) -> Result<Self, XmlError> {
        Self::sibling(data_path, "-Import")
    }

    pub fn for_export(data_path: &Path) -> Result<Self, XmlError> {
        Self::sibling(data_path, "-Export")
    }

    /// Log one diagnostic line, `file:line:` prefixed when parser context is
    /// available.
    pub fn log(&mut self, context: Option<(&str, u64)>, message: &str) {
        self.entries += 1;
        let line = match context {
            Some((file, line)) => format!("{file}:{line}: {message}\n"),
            None => format!("{message}\n"),
        };
        if self.writer.is_none() {
            match File::create(&self.path) {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(e) => {
                    tracing::warn!("could not open diagnostic log {:?}: {e}", self.path);
                    return;
                }
            }
        }
        if let Some(w) = self.writer.as_mut() {
            let _ = w.write_all(line.as_bytes());
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, and delete the file when it never received an entry.
    pub fn finish(mut self) -> Result<usize, XmlError> {
        if let Some(mut w) = self.writer.take() {
            w.flush()?;
        }
        if self.entries == 0 && self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(self.entries)
    }
}

pub(crate) fn xml_escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn xml_escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\n' => out.push_str("&#10;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

#[allow(dead_code)]
pub(crate) fn hex_decode(s: &str) -> Option<Vec<u8>> {
    let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wpx_version_gate() {
        assert_eq!(
            WpxVersion::parse("2.0"),
            Some(WpxVersion { major: 2, minor: 0 })
        );
        assert!(!WpxVersion::parse("2.0").unwrap().newer_than_supported());
        assert!(!WpxVersion::parse("1.0").unwrap().newer_than_supported());
        assert!(WpxVersion::parse("2.1").unwrap().newer_than_supported());
        assert!(WpxVersion::parse("3.0").unwrap().newer_than_supported());
        assert_eq!(WpxVersion::parse("not-a-version"), None);
    }

    #[test]
    fn test_empty_log_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("doc.wpx");
        let log = DiagnosticLog::for_import(&data).unwrap();
        let path = log.path().to_path_buf();
        assert_eq!(log.finish().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_nonempty_log_survives_with_context_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("doc.wpx");
        let mut log = DiagnosticLog::for_import(&data).unwrap();
        log.log(Some(("doc.wpx", 12)), "bad italic value");
        let path = log.path().to_path_buf();
        assert_eq!(log.finish().unwrap(), 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "doc.wpx:12: bad italic value\n");
        assert!(path.ends_with("doc-Import.log"));
    }

    #[test]
    fn test_hex_round_trip() {
        let bytes = vec![0x00, 0x7F, 0xFF, 0x10];
        assert_eq!(hex_encode(&bytes), "007FFF10");
        assert_eq!(hex_decode("007FFF10"), Some(bytes));
        assert_eq!(hex_decode("0"), None);
        assert_eq!(hex_decode("zz"), None);
    }
}
