//! The entity spooler: one entity's bytes, decoded into a character stream
//! with peek/get semantics and line/column tracking.

use std::io;
use std::rc::Rc;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};
use log::warn;
use memchr::memmem;
use xvp_chars::{XmlAsciiChar, XmlChar};

use crate::decls::EntityDecl;
use crate::error::XmlErrCode;
use crate::source::EntitySource;

/// Returned by peek/get at end of entity.
pub(crate) const CH_EOF: char = '\0';

/// The encoding family sensed from the first bytes of an entity. An in-band
/// declaration may refine the converter but must stay within the family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncFamily {
    Utf8,
    Utf16Le,
    Utf16Be,
    Other8Bit,
}

/// Whether the entity was referenced from inside a quoted literal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefFrom {
    InsideLiteral,
    OutsideLiteral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    General,
    Parameter,
    Neither,
}

/// A diagnostic noticed while staging characters, drained by the parser when
/// the spooler is pushed.
pub(crate) struct StagedDiag {
    pub code: XmlErrCode,
    pub detail: String,
    pub line: u32,
    pub col: u32,
}

pub struct EntitySpooler {
    system_id: String,
    decl: Option<Rc<EntityDecl>>,
    chars: Vec<char>,
    pos: usize,
    line: u32,
    col: u32,
    prev_cr: bool,
    id: u32,
    interned: bool,
    from: RefFrom,
    kind: EntityKind,
    family: EncFamily,
    encoding_name: &'static str,
    staged: Vec<StagedDiag>,
}

/// Sense the family from a BOM or the byte pattern of `<?x`.
fn sense_family(bytes: &[u8]) -> EncFamily {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return EncFamily::Utf8;
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return EncFamily::Utf16Le;
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return EncFamily::Utf16Be;
    }
    if bytes.starts_with(&[0x3C, 0x00, 0x3F, 0x00]) {
        return EncFamily::Utf16Le;
    }
    if bytes.starts_with(&[0x00, 0x3C, 0x00, 0x3F]) {
        return EncFamily::Utf16Be;
    }
    if bytes.starts_with(b"<?xm") {
        return EncFamily::Utf8;
    }
    // no BOM and no declaration pattern: some ASCII-compatible 8-bit
    // encoding, decoded as UTF-8 unless a converter is forced
    EncFamily::Other8Bit
}

/// Pull the encoding label out of a leading `<?xml ... encoding='...' ...?>`
/// without committing to a converter. Only meaningful for the 8-bit families;
/// for UTF-16 the family already fixes the converter.
fn prescan_decl_encoding(bytes: &[u8]) -> Option<String> {
    let head = &bytes[..bytes.len().min(256)];
    if !head.starts_with(b"<?xml") {
        return None;
    }
    let end = memmem::find(head, b"?>")?;
    let decl = &head[..end];
    let at = memmem::find(decl, b"encoding")?;
    let mut rest = decl[at + b"encoding".len()..]
        .iter()
        .copied()
        .skip_while(|b| b.is_xml_whitespace());
    if rest.next() != Some(b'=') {
        return None;
    }
    let mut rest = rest.skip_while(|b| b.is_xml_whitespace());
    let quote = rest.next()?;
    if quote != b'\'' && quote != b'"' {
        return None;
    }
    let label: Vec<u8> = rest.take_while(|&b| b != quote).collect();
    String::from_utf8(label).ok()
}

impl EntitySpooler {
    /// Spools an external source: reads the bytes, senses the family, picks a
    /// converter (forced encoding wins, then the in-band declaration, then
    /// the sensed family) and decodes the whole entity.
    pub(crate) fn from_source(
        src: &dyn EntitySource,
        decl: Option<Rc<EntityDecl>>,
        id: u32,
        kind: EntityKind,
        from: RefFrom,
        ignore_bad_chars: bool,
    ) -> io::Result<Self> {
        let mut stream = src.make_stream()?;
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;

        let family = sense_family(&bytes);
        let mut staged = Vec::new();

        let encoding = match family {
            EncFamily::Utf16Le => UTF_16LE,
            EncFamily::Utf16Be => UTF_16BE,
            EncFamily::Utf8 | EncFamily::Other8Bit => {
                let label = src
                    .forced_encoding()
                    .map(str::to_string)
                    .or_else(|| prescan_decl_encoding(&bytes));
                match label {
                    Some(label) => match Encoding::for_label(label.as_bytes()) {
                        Some(enc) => enc,
                        None => {
                            staged.push(StagedDiag {
                                code: XmlErrCode::BadEncodingName,
                                detail: label,
                                line: 1,
                                col: 1,
                            });
                            UTF_8
                        }
                    },
                    None => UTF_8,
                }
            }
        };

        let (decoded, actual, had_errors) = encoding.decode(&bytes);
        if had_errors && !ignore_bad_chars {
            staged.push(StagedDiag {
                code: XmlErrCode::InvalidChar,
                detail: format!("input is not valid {}", actual.name()),
                line: 1,
                col: 1,
            });
        }

        let mut spooler = Self {
            system_id: src.system_id().to_string(),
            decl,
            chars: decoded.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            prev_cr: false,
            id,
            interned: false,
            from,
            kind,
            family,
            encoding_name: actual.name(),
            staged,
        };
        spooler.scrub_bad_chars(ignore_bad_chars);
        Ok(spooler)
    }

    /// Spools the already-decoded value of an internal entity. Marked
    /// interned so consumers skip redundant normalisation.
    pub(crate) fn from_internal(
        decl: Rc<EntityDecl>,
        value: &str,
        id: u32,
        kind: EntityKind,
        from: RefFrom,
    ) -> Self {
        Self {
            system_id: decl.name().to_string(),
            decl: Some(decl),
            chars: value.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            prev_cr: false,
            id,
            interned: true,
            from,
            kind,
            family: EncFamily::Utf8,
            encoding_name: UTF_8.name(),
            staged: Vec::new(),
        }
    }

    /// Replaces characters outside the XML `Char` production with U+0020 and
    /// stages a diagnostic per occurrence: a warning when substitution was
    /// asked for, a well-formedness error otherwise.
    fn scrub_bad_chars(&mut self, ignore_bad_chars: bool) {
        let mut line = 1u32;
        let mut col = 1u32;
        let mut prev_cr = false;
        for ch in self.chars.iter_mut() {
            if !ch.is_xml_char() {
                let code = if ignore_bad_chars {
                    warn!(
                        "replacing illegal char U+{:04X} at {}:{} in {}",
                        *ch as u32, line, col, self.system_id
                    );
                    XmlErrCode::BadCharReplaced
                } else {
                    XmlErrCode::InvalidChar
                };
                self.staged.push(StagedDiag {
                    code,
                    detail: format!("U+{:04X}", *ch as u32),
                    line,
                    col,
                });
                *ch = ' ';
            }
            match *ch {
                '\r' => {
                    line += 1;
                    col = 1;
                    prev_cr = true;
                }
                '\n' => {
                    if !prev_cr {
                        line += 1;
                    }
                    col = 1;
                    prev_cr = false;
                }
                _ => {
                    col += 1;
                    prev_cr = false;
                }
            }
        }
    }

    pub(crate) fn take_staged(&mut self) -> Vec<StagedDiag> {
        std::mem::take(&mut self.staged)
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub(crate) fn decl(&self) -> Option<&Rc<EntityDecl>> {
        self.decl.as_ref()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn interned(&self) -> bool {
        self.interned
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn ref_from(&self) -> RefFrom {
        self.from
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding_name
    }

    /// True when the entity is external (spooled from a source rather than
    /// an internalised value).
    pub fn is_external(&self) -> bool {
        !self.interned
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    /// Applied when an XML or text declaration discloses the encoding: the
    /// name must resolve and must be compatible with the auto-sensed family.
    pub(crate) fn set_decl_encoding(&mut self, name: &str) -> Result<(), XmlErrCode> {
        let enc = match Encoding::for_label(name.as_bytes()) {
            Some(enc) => enc,
            None => return Err(XmlErrCode::BadEncodingName),
        };
        let is_utf16 = enc == UTF_16LE || enc == UTF_16BE;
        let family_utf16 =
            self.family == EncFamily::Utf16Le || self.family == EncFamily::Utf16Be;
        if is_utf16 != family_utf16 {
            return Err(XmlErrCode::EncodingMismatch);
        }
        if !family_utf16 {
            self.encoding_name = enc.name();
        }
        Ok(())
    }

    // --- character stream ---------------------------------------------

    pub fn peek_next(&self) -> char {
        self.chars.get(self.pos).copied().unwrap_or(CH_EOF)
    }

    pub fn peek_ahead(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    pub fn get_next(&mut self) -> char {
        match self.chars.get(self.pos).copied() {
            Some(ch) => {
                self.pos += 1;
                match ch {
                    '\r' => {
                        self.line += 1;
                        self.col = 1;
                        self.prev_cr = true;
                    }
                    '\n' => {
                        if !self.prev_cr {
                            self.line += 1;
                        }
                        self.col = 1;
                        self.prev_cr = false;
                    }
                    _ => {
                        self.col += 1;
                        self.prev_cr = false;
                    }
                }
                ch
            }
            None => CH_EOF,
        }
    }

    pub fn get_next_if_not(&mut self, not: char) -> Option<char> {
        let ch = self.peek_next();
        if ch == CH_EOF || ch == not {
            None
        } else {
            Some(self.get_next())
        }
    }

    pub fn skipped_char(&mut self, to_skip: char) -> bool {
        if self.peek_next() == to_skip {
            self.get_next();
            true
        } else {
            false
        }
    }

    /// All-or-nothing string match; never crosses the end of the entity.
    pub fn skipped_string(&mut self, to_skip: &str) -> bool {
        let mut n = 0;
        for ch in to_skip.chars() {
            match self.peek_ahead(n) {
                Some(have) if have == ch => n += 1,
                _ => return false,
            }
        }
        for _ in 0..n {
            self.get_next();
        }
        true
    }

    pub fn skipped_quote(&mut self) -> Option<char> {
        match self.peek_next() {
            q @ '"' | q @ '\'' => {
                self.get_next();
                Some(q)
            }
            _ => None,
        }
    }

    pub fn skipped_space(&mut self) -> bool {
        if self.peek_next().is_xml_whitespace() {
            self.get_next();
            true
        } else {
            false
        }
    }

    /// Skips any run of whitespace. Returns `(advanced, hit_end)`.
    pub fn skip_spaces(&mut self) -> (bool, bool) {
        let mut advanced = false;
        loop {
            let ch = self.peek_next();
            if ch == CH_EOF {
                return (advanced, true);
            }
            if !ch.is_xml_whitespace() {
                return (advanced, false);
            }
            self.get_next();
            advanced = true;
        }
    }

    /// Consumes up to and including `to_find`; false if the entity drained
    /// first.
    pub fn skip_past(&mut self, to_find: char) -> bool {
        loop {
            let ch = self.get_next();
            if ch == CH_EOF {
                return false;
            }
            if ch == to_find {
                return true;
            }
        }
    }

    /// Reads a Name, or an Nmtoken when `allow_leading_nonstart` is set.
    /// Consumes nothing on failure.
    pub fn get_name(&mut self, allow_leading_nonstart: bool) -> Option<String> {
        let first = self.peek_next();
        let ok = if allow_leading_nonstart {
            first.is_xml_name_char()
        } else {
            first.is_xml_name_start_char()
        };
        if !ok {
            return None;
        }
        let mut name = String::new();
        name.push(self.get_next());
        while self.peek_next().is_xml_name_char() {
            name.push(self.get_next());
        }
        Some(name)
    }

    /// Appends consecutive whitespace to `out`; returns whether data is
    /// still available afterwards.
    pub fn get_spaces(&mut self, out: &mut String) -> bool {
        while self.peek_next().is_xml_whitespace() {
            out.push(self.get_next());
        }
        !self.at_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemBufEntitySrc;

    fn spool(text: &str) -> EntitySpooler {
        let src = MemBufEntitySrc::new("mem://t", text.as_bytes().to_vec());
        EntitySpooler::from_source(&src, None, 1, EntityKind::Neither, RefFrom::OutsideLiteral, false)
            .unwrap()
    }

    #[test]
    fn peek_and_get() {
        let mut sp = spool("ab");
        assert_eq!(sp.peek_next(), 'a');
        assert_eq!(sp.get_next(), 'a');
        assert_eq!(sp.get_next(), 'b');
        assert_eq!(sp.get_next(), CH_EOF);
        assert_eq!(sp.peek_next(), CH_EOF);
        assert!(sp.at_end());
    }

    #[test]
    fn get_next_if_not() {
        let mut sp = spool("ab");
        assert_eq!(sp.get_next_if_not('a'), None);
        assert_eq!(sp.get_next_if_not('x'), Some('a'));
        assert_eq!(sp.get_next_if_not('b'), None);
    }

    #[test]
    fn line_and_col_tracking() {
        let mut sp = spool("a\nb\r\nc\rd");
        assert_eq!((sp.line(), sp.col()), (1, 1));
        sp.get_next(); // a
        assert_eq!((sp.line(), sp.col()), (1, 2));
        sp.get_next(); // \n
        assert_eq!((sp.line(), sp.col()), (2, 1));
        sp.get_next(); // b
        sp.get_next(); // \r
        assert_eq!((sp.line(), sp.col()), (3, 1));
        sp.get_next(); // \n of \r\n counts once
        assert_eq!((sp.line(), sp.col()), (3, 1));
        sp.get_next(); // c
        sp.get_next(); // lone \r
        assert_eq!((sp.line(), sp.col()), (4, 1));
        assert_eq!(sp.get_next(), 'd');
    }

    #[test]
    fn skipped_string_is_all_or_nothing() {
        let mut sp = spool("<!DOCTYPE");
        assert!(!sp.skipped_string("<!DOCTYPES"));
        assert!(!sp.skipped_string("<!DOCTYPO"));
        assert_eq!(sp.peek_next(), '<');
        assert!(sp.skipped_string("<!DOCTYPE"));
        assert!(sp.at_end());
    }

    #[test]
    fn names_and_nmtokens() {
        let mut sp = spool("name1 -tok");
        assert_eq!(sp.get_name(false).as_deref(), Some("name1"));
        assert!(sp.skipped_space());
        assert_eq!(sp.get_name(false), None);
        assert_eq!(sp.get_name(true).as_deref(), Some("-tok"));
    }

    #[test]
    fn skip_spaces_reports_end() {
        let mut sp = spool("  x");
        assert_eq!(sp.skip_spaces(), (true, false));
        assert_eq!(sp.skip_spaces(), (false, false));
        sp.get_next();
        assert_eq!(sp.skip_spaces(), (false, true));
    }

    #[test]
    fn utf16le_auto_sense() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "<r/>".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let src = MemBufEntitySrc::new("mem://u16", bytes);
        let mut sp = EntitySpooler::from_source(
            &src,
            None,
            1,
            EntityKind::Neither,
            RefFrom::OutsideLiteral,
            false,
        )
        .unwrap();
        assert_eq!(sp.get_next(), '<');
        assert_eq!(sp.get_next(), 'r');
        assert_eq!(sp.encoding_name(), "UTF-16LE");
    }

    #[test]
    fn decl_encoding_prescan_selects_converter() {
        let src = MemBufEntitySrc::new(
            "mem://w",
            b"<?xml version='1.0' encoding='windows-1252'?><a>\xA4</a>".to_vec(),
        );
        let mut sp = EntitySpooler::from_source(
            &src,
            None,
            1,
            EntityKind::Neither,
            RefFrom::OutsideLiteral,
            false,
        )
        .unwrap();
        assert!(sp.skip_past('>'));
        assert!(sp.skipped_string("<a>"));
        assert_eq!(sp.get_next(), '\u{a4}');
    }

    #[test]
    fn decl_encoding_must_match_family() {
        use assert_matches::assert_matches;

        let mut sp = spool("<r/>");
        assert!(sp.set_decl_encoding("utf-8").is_ok());
        assert_matches!(
            sp.set_decl_encoding("utf-16le"),
            Err(XmlErrCode::EncodingMismatch)
        );
        assert_matches!(
            sp.set_decl_encoding("not-an-encoding"),
            Err(XmlErrCode::BadEncodingName)
        );
    }

    #[test]
    fn bad_chars_are_scrubbed() {
        let src = MemBufEntitySrc::new("mem://b", b"a\x0Bb".to_vec());
        let mut sp = EntitySpooler::from_source(
            &src,
            None,
            1,
            EntityKind::Neither,
            RefFrom::OutsideLiteral,
            true,
        )
        .unwrap();
        let staged = sp.take_staged();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].code, XmlErrCode::BadCharReplaced);
        assert_eq!((staged[0].line, staged[0].col), (1, 2));
        assert_eq!(sp.get_next(), 'a');
        assert_eq!(sp.get_next(), ' ');
        assert_eq!(sp.get_next(), 'b');
    }
}
