//! The parser core: the XML grammar driver.
//!
//! A parse moves through three phases: pre-content (XML declaration, misc
//! items, at most one DOCTYPE), content (the root element and everything in
//! it) and post-content (trailing misc items). The driver pulls characters
//! from the entity manager, consults the validator, and pushes events to the
//! registered handlers.

use std::cell::RefCell;
use std::rc::Rc;

use xvp_chars::{XmlAsciiChar, XmlChar};

use crate::attr::XmlAttr;
use crate::cm::ValidRes;
use crate::decls::{AttrType, CreateReason, EntityDecl, TextPolicy};
use crate::entitymgr::{EntityMgr, PushOutcome};
use crate::error::{Interrupt, PRes, XmlDiag, XmlErrCode, XmlFatal, XmlSeverity};
use crate::events::{
    XmlDTDEvents, XmlDocEvents, XmlEntityEvents, XmlErrorEvents, XmlLocation, XmlParseFlags,
    XmlParseOpts,
};
use crate::source::{
    compose_system_id, EntityResolver, EntitySource, MemBufEntitySrc, ResolveKind,
};
use crate::spooler::{EntityKind, RefFrom, StagedDiag, CH_EOF};
use crate::validator::DtdValidator;

pub(crate) mod dtd;

/// Character data is flushed to the handler once the aggregation buffer
/// reaches this size, even without a markup boundary.
const CHAR_FLUSH_LIMIT: usize = 32 * 1024;

/// One open element.
struct CtxFrame {
    elem_id: u32,
    /// Spooler id at which the start tag began; the end tag must originate
    /// in the same entity.
    spooler_id: u32,
    children: Vec<u32>,
}

/// What the content dispatcher decided the next construct is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Construct {
    Characters,
    StartTag,
    EndTag,
    CData,
    Comment,
    PI,
    Eoi,
    Unknown,
}

pub struct XmlParserCore {
    em: EntityMgr,
    validator: DtdValidator,
    opts: XmlParseOpts,
    flags: XmlParseFlags,
    max_errors: u32,
    err_count: u32,
    ctx: Vec<CtxFrame>,
    attrs: Vec<XmlAttr>,
    char_buf: String,
    char_buf_loc: XmlLocation,
    root_seen: bool,
    ended_buf: Vec<Rc<EntityDecl>>,
    doc_events: Option<Rc<RefCell<dyn XmlDocEvents>>>,
    dtd_events: Option<Rc<RefCell<dyn XmlDTDEvents>>>,
    ent_events: Option<Rc<RefCell<dyn XmlEntityEvents>>>,
    err_events: Option<Rc<RefCell<dyn XmlErrorEvents>>>,
    resolver: Option<Rc<RefCell<dyn EntityResolver>>>,
}

impl XmlParserCore {
    pub fn new() -> Self {
        Self {
            em: EntityMgr::new(),
            validator: DtdValidator::new(),
            opts: XmlParseOpts::empty(),
            flags: XmlParseFlags::default(),
            max_errors: 64,
            err_count: 0,
            ctx: Vec::new(),
            attrs: Vec::new(),
            char_buf: String::new(),
            char_buf_loc: XmlLocation::default(),
            root_seen: false,
            ended_buf: Vec::new(),
            doc_events: None,
            dtd_events: None,
            ent_events: None,
            err_events: None,
            resolver: None,
        }
    }

    pub fn set_opts(&mut self, opts: XmlParseOpts) {
        self.opts = opts;
        self.em
            .set_ignore_bad_chars(opts.contains(XmlParseOpts::IGNORE_BAD_CHARS));
    }

    pub fn opts(&self) -> XmlParseOpts {
        self.opts
    }

    pub fn set_flags(&mut self, flags: XmlParseFlags) {
        self.flags = flags;
    }

    pub fn flags(&self) -> XmlParseFlags {
        self.flags
    }

    pub fn set_max_errors(&mut self, max_errors: u32) {
        self.max_errors = max_errors.max(1);
    }

    pub fn error_count(&self) -> u32 {
        self.err_count
    }

    pub fn set_doc_events(&mut self, handler: Rc<RefCell<dyn XmlDocEvents>>) {
        self.doc_events = Some(handler);
    }

    pub fn set_dtd_events(&mut self, handler: Rc<RefCell<dyn XmlDTDEvents>>) {
        self.dtd_events = Some(handler);
    }

    pub fn set_entity_events(&mut self, handler: Rc<RefCell<dyn XmlEntityEvents>>) {
        self.ent_events = Some(handler);
    }

    pub fn set_error_events(&mut self, handler: Rc<RefCell<dyn XmlErrorEvents>>) {
        self.err_events = Some(handler);
    }

    pub fn set_entity_resolver(&mut self, resolver: Rc<RefCell<dyn EntityResolver>>) {
        self.resolver = Some(resolver);
    }

    pub fn validator(&self) -> &DtdValidator {
        &self.validator
    }

    pub fn validator_mut(&mut self) -> &mut DtdValidator {
        &mut self.validator
    }

    fn validating(&self) -> bool {
        self.opts.contains(XmlParseOpts::VALIDATE)
    }

    /// Clears all per-parse state. A locked validator keeps its DTD.
    pub fn reset(&mut self) {
        self.em.reset();
        self.validator.reset();
        self.ctx.clear();
        self.attrs.clear();
        self.char_buf.clear();
        self.err_count = 0;
        self.root_seen = false;
        self.ended_buf.clear();
        if let Some(h) = self.doc_events.clone() {
            h.borrow_mut().reset_document();
        }
        if let Some(h) = self.dtd_events.clone() {
            h.borrow_mut().reset_doc_type();
        }
        if let Some(h) = self.ent_events.clone() {
            h.borrow_mut().reset_entities();
        }
        if let Some(h) = self.err_events.clone() {
            h.borrow_mut().reset_errors();
        }
    }

    // --- entry points ---------------------------------------------------

    /// Parses a complete document from the given root entity. Diagnostics
    /// go to the error handler; the call itself fails only if a callback
    /// cancels the parse or the root entity cannot be opened.
    pub fn parse_root(&mut self, src: &dyn EntitySource) -> Result<(), XmlFatal> {
        self.reset();

        let spooler = match self.em.make_from_source(
            src,
            None,
            EntityKind::Neither,
            RefFrom::OutsideLiteral,
        ) {
            Ok(spooler) => spooler,
            Err(_) => return Err(XmlFatal::RootEntityOpen(src.system_id().to_string())),
        };
        let staged = match self.em.push_entity(spooler) {
            PushOutcome::Pushed(staged) => staged,
            PushOutcome::Recursive => {
                return Err(XmlFatal::RootEntityOpen(src.system_id().to_string()))
            }
        };

        let result = self.parse_document(src.system_id(), staged);

        // Janitor: whatever happened, no spooler stays open.
        while self.em.pop_entity_quiet().is_some() {}

        let end = self.fire_end_document(src.system_id());

        match result {
            Ok(()) | Err(Interrupt::MaxErrors) | Err(Interrupt::EndOfEntity { .. }) => match end {
                Ok(()) => Ok(()),
                Err(err) => Err(XmlFatal::Callback(err)),
            },
            Err(Interrupt::Callback(err)) => Err(XmlFatal::Callback(err)),
        }
    }

    /// Parses a document held in memory under a virtual system id.
    pub fn parse_buffer(&mut self, system_id: &str, bytes: &[u8]) -> Result<(), XmlFatal> {
        let src = MemBufEntitySrc::new(system_id, bytes.to_vec());
        self.parse_root(&src)
    }

    fn parse_document(&mut self, system_id: &str, staged: Vec<StagedDiag>) -> PRes<()> {
        if let Some(h) = self.doc_events.clone() {
            h.borrow_mut()
                .start_document(system_id)
                .map_err(Interrupt::Callback)?;
        }
        self.report_staged(staged)?;

        self.parse_prolog()?;
        if self.peek_next()? == CH_EOF {
            self.post_err(XmlErrCode::NoRootElement, "")?;
            return Ok(());
        }
        self.parse_content()?;
        self.parse_epilog()?;
        Ok(())
    }

    fn fire_end_document(&mut self, system_id: &str) -> Result<(), crate::error::XmlCbError> {
        match self.doc_events.clone() {
            Some(h) => h.borrow_mut().end_document(system_id),
            None => Ok(()),
        }
    }

    // --- low-level stream access, with entity-event draining -----------

    fn drain_ended(&mut self) -> PRes<()> {
        if self.ended_buf.is_empty() {
            return Ok(());
        }
        let ended = std::mem::take(&mut self.ended_buf);
        if self.flags.contains(XmlParseFlags::TOPOLOGY) {
            if let Some(h) = self.ent_events.clone() {
                for decl in &ended {
                    h.borrow_mut()
                        .end_entity(decl)
                        .map_err(Interrupt::Callback)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn peek_next(&mut self) -> PRes<char> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.peek_next(&mut ended);
        self.ended_buf = ended;
        let ch = result?;
        self.drain_ended()?;
        Ok(ch)
    }

    pub(crate) fn get_next(&mut self) -> PRes<char> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.get_next(&mut ended);
        self.ended_buf = ended;
        let ch = result?;
        self.drain_ended()?;
        Ok(ch)
    }

    pub(crate) fn get_next_if_not(&mut self, not: char) -> PRes<Option<char>> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.get_next_if_not(not, &mut ended);
        self.ended_buf = ended;
        let ch = result?;
        self.drain_ended()?;
        Ok(ch)
    }

    pub(crate) fn skipped_char(&mut self, to_skip: char) -> PRes<bool> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.skipped_char(to_skip, &mut ended);
        self.ended_buf = ended;
        let skipped = result?;
        self.drain_ended()?;
        Ok(skipped)
    }

    pub(crate) fn skipped_string(&mut self, to_skip: &str) -> PRes<bool> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.skipped_string(to_skip, &mut ended);
        self.ended_buf = ended;
        let skipped = result?;
        self.drain_ended()?;
        Ok(skipped)
    }

    pub(crate) fn skipped_quote(&mut self) -> PRes<Option<char>> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.skipped_quote(&mut ended);
        self.ended_buf = ended;
        let quote = result?;
        self.drain_ended()?;
        Ok(quote)
    }

    pub(crate) fn skipped_spaces(&mut self, cross_entities: bool) -> PRes<bool> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.skipped_spaces(cross_entities, &mut ended);
        self.ended_buf = ended;
        let skipped = result?;
        self.drain_ended()?;
        Ok(skipped)
    }

    pub(crate) fn get_name(&mut self, allow_leading_nonstart: bool) -> PRes<Option<String>> {
        let mut ended = std::mem::take(&mut self.ended_buf);
        let result = self.em.get_name(allow_leading_nonstart, &mut ended);
        self.ended_buf = ended;
        let name = result?;
        self.drain_ended()?;
        Ok(name)
    }

    pub(crate) fn peek_ahead(&self, n: usize) -> Option<char> {
        self.em.peek_ahead(n)
    }

    pub(crate) fn current_spooler_id(&self) -> u32 {
        self.em.current_spooler_id()
    }

    fn location(&self) -> XmlLocation {
        let (line, col, _) = self.em.position();
        XmlLocation { line, col }
    }

    // --- diagnostics -----------------------------------------------------

    /// Reports a diagnostic at the current position. Non-warnings count
    /// toward the error limit; hitting it raises the termination interrupt.
    pub(crate) fn post_err(&mut self, code: XmlErrCode, detail: &str) -> PRes<()> {
        let (line, col, system_id) = self.em.position();
        self.post_err_at(code, detail, line, col, &system_id)
    }

    fn post_err_at(
        &mut self,
        code: XmlErrCode,
        detail: &str,
        line: u32,
        col: u32,
        system_id: &str,
    ) -> PRes<()> {
        let diag = XmlDiag::new(code, detail, line, col, system_id);
        if diag.severity() != XmlSeverity::Warning {
            self.err_count += 1;
        }
        if let Some(h) = self.err_events.clone() {
            h.borrow_mut()
                .handle_error(&diag)
                .map_err(Interrupt::Callback)?;
        }
        if self.err_count >= self.max_errors {
            return Err(Interrupt::MaxErrors);
        }
        Ok(())
    }

    /// Validity diagnostics only fire when validation is on.
    pub(crate) fn post_validity(&mut self, code: XmlErrCode, detail: &str) -> PRes<()> {
        if self.validating() {
            self.post_err(code, detail)?;
        }
        Ok(())
    }

    fn report_staged(&mut self, staged: Vec<StagedDiag>) -> PRes<()> {
        let (_, _, system_id) = self.em.position();
        for diag in staged {
            self.post_err_at(diag.code, &diag.detail, diag.line, diag.col, &system_id)?;
        }
        Ok(())
    }

    // --- prolog ----------------------------------------------------------

    /// `<?xml` opens an XML declaration only when followed by whitespace;
    /// `<?xml-stylesheet` and friends are ordinary PIs.
    fn at_decl_start(&mut self) -> PRes<bool> {
        if self.peek_next()? != '<' {
            return Ok(false);
        }
        Ok(self.peek_ahead(1) == Some('?')
            && self.peek_ahead(2) == Some('x')
            && self.peek_ahead(3) == Some('m')
            && self.peek_ahead(4) == Some('l')
            && self
                .peek_ahead(5)
                .map(|c| c.is_xml_whitespace())
                .unwrap_or(false))
    }

    fn parse_prolog(&mut self) -> PRes<()> {
        if self.at_decl_start()? {
            self.skipped_string("<?xml")?;
            self.parse_xml_decl()?;
        }

        let mut seen_doctype = false;
        loop {
            let mut spaces = String::new();
            self.get_prolog_spaces(&mut spaces)?;
            if !spaces.is_empty() && self.flags.contains(XmlParseFlags::SPACE_BC) {
                let loc = self.location();
                if let Some(h) = self.doc_events.clone() {
                    h.borrow_mut()
                        .doc_characters(&spaces, false, true, loc)
                        .map_err(Interrupt::Callback)?;
                }
            }

            match self.peek_next()? {
                CH_EOF => return Ok(()),
                '<' => {
                    if self.skipped_string("<!--")? {
                        self.parse_comment_tail()?;
                    } else if self.skipped_string("<!DOCTYPE")? {
                        if seen_doctype {
                            self.post_err(XmlErrCode::MultipleDocTypes, "")?;
                            self.skip_doctype_blind()?;
                        } else {
                            seen_doctype = true;
                            self.parse_doctype()?;
                        }
                    } else if self.peek_ahead(1) == Some('?') {
                        self.get_next()?;
                        self.get_next()?;
                        self.parse_pi_from_target()?;
                    } else if self.peek_ahead(1) == Some('!') {
                        self.post_err(XmlErrCode::UnexpectedContent, "")?;
                        self.resync_past('>')?;
                    } else {
                        // root start tag
                        return Ok(());
                    }
                }
                _ => {
                    self.post_err(XmlErrCode::UnexpectedContent, "before root element")?;
                    self.get_next()?;
                }
            }
        }
    }

    fn get_prolog_spaces(&mut self, out: &mut String) -> PRes<()> {
        loop {
            match self.peek_next()? {
                c if c.is_xml_whitespace() => {
                    out.push(self.get_next()?);
                }
                _ => return Ok(()),
            }
        }
    }

    /// `<?xml` is already consumed. Validates the version/encoding/standalone
    /// ordering and values.
    fn parse_xml_decl(&mut self) -> PRes<()> {
        let mut version = String::new();
        let mut encoding = String::new();
        let mut standalone = String::new();

        self.skipped_spaces(false)?;
        if self.skipped_string("version")? {
            match self.parse_eq_quoted()? {
                Some(value) => version = value,
                None => self.post_err(XmlErrCode::BadXmlDecl, "bad version value")?,
            }
            if !version.starts_with("1.")
                || version.len() < 3
                || !version[2..].bytes().all(|b| b.is_ascii_digit())
            {
                self.post_err(XmlErrCode::BadXmlDecl, "version must be 1.x")?;
            }
        } else {
            self.post_err(XmlErrCode::BadXmlDecl, "version must come first")?;
        }

        self.skipped_spaces(false)?;
        if self.skipped_string("encoding")? {
            match self.parse_eq_quoted()? {
                Some(value) => encoding = value,
                None => self.post_err(XmlErrCode::BadXmlDecl, "bad encoding value")?,
            }
            self.skipped_spaces(false)?;
        }

        if self.skipped_string("standalone")? {
            match self.parse_eq_quoted()? {
                Some(value) => standalone = value,
                None => self.post_err(XmlErrCode::BadXmlDecl, "bad standalone value")?,
            }
            if standalone != "yes" && standalone != "no" {
                self.post_err(XmlErrCode::BadXmlDecl, "standalone must be yes or no")?;
            }
            self.skipped_spaces(false)?;
        }

        if !self.skipped_string("?>")? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "XML declaration")?;
            self.resync_past('>')?;
        }

        if !encoding.is_empty() {
            if let Err(code) = self.em.set_decl_encoding(&encoding) {
                self.post_err(code, &encoding)?;
            }
        }

        if self.flags.contains(XmlParseFlags::XML_DECL) {
            if let Some(h) = self.doc_events.clone() {
                h.borrow_mut()
                    .xml_decl(&version, &encoding, &standalone)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// `name = 'value'` with optional surrounding whitespace; used by the
    /// XML and text declarations where references are not recognised.
    pub(crate) fn parse_eq_quoted(&mut self) -> PRes<Option<String>> {
        self.skipped_spaces(false)?;
        if !self.skipped_char('=')? {
            self.post_err(XmlErrCode::ExpectedEquals, "")?;
            return Ok(None);
        }
        self.skipped_spaces(false)?;
        let quote = match self.skipped_quote()? {
            Some(quote) => quote,
            None => {
                self.post_err(XmlErrCode::ExpectedQuotedString, "")?;
                return Ok(None);
            }
        };
        let mut value = String::new();
        while let Some(c) = self.get_next_if_not(quote)? {
            value.push(c);
        }
        if !self.skipped_char(quote)? {
            self.post_err(XmlErrCode::UnexpectedEof, "in literal")?;
            return Ok(None);
        }
        Ok(Some(value))
    }

    // --- content ---------------------------------------------------------

    fn classify_content(&mut self) -> PRes<Construct> {
        Ok(match self.peek_next()? {
            CH_EOF => Construct::Eoi,
            '<' => match self.peek_ahead(1) {
                Some('/') => Construct::EndTag,
                Some('?') => Construct::PI,
                Some('!') => match self.peek_ahead(2) {
                    Some('-') => Construct::Comment,
                    Some('[') => Construct::CData,
                    _ => Construct::Unknown,
                },
                Some(c) if c.is_xml_name_start_char() => Construct::StartTag,
                _ => Construct::Unknown,
            },
            _ => Construct::Characters,
        })
    }

    fn parse_content(&mut self) -> PRes<()> {
        loop {
            match self.classify_content()? {
                Construct::Eoi => {
                    self.flush_chars(false)?;
                    if !self.ctx.is_empty() {
                        self.post_err(XmlErrCode::UnexpectedEof, "with open elements")?;
                    }
                    return Ok(());
                }
                Construct::StartTag => {
                    self.flush_chars(false)?;
                    self.parse_start_tag()?;
                }
                Construct::EndTag => {
                    self.flush_chars(false)?;
                    self.parse_end_tag()?;
                }
                Construct::CData => {
                    self.parse_cdata()?;
                }
                Construct::Comment => {
                    self.flush_chars(false)?;
                    self.get_next()?;
                    self.get_next()?;
                    if !self.skipped_string("--")? {
                        self.post_err(XmlErrCode::UnexpectedContent, "expected comment")?;
                        self.resync_past('>')?;
                        continue;
                    }
                    self.parse_comment_tail()?;
                }
                Construct::PI => {
                    self.flush_chars(false)?;
                    self.get_next()?;
                    self.get_next()?;
                    self.parse_pi_from_target()?;
                }
                Construct::Characters => {
                    self.parse_characters()?;
                }
                Construct::Unknown => {
                    self.post_err(XmlErrCode::UnexpectedContent, "")?;
                    self.resync_past('>')?;
                }
            }

            if self.root_seen && self.ctx.is_empty() {
                self.flush_chars(false)?;
                return Ok(());
            }
        }
    }

    fn resync_past(&mut self, to_find: char) -> PRes<()> {
        loop {
            match self.get_next()? {
                CH_EOF => return Ok(()),
                c if c == to_find => return Ok(()),
                _ => {}
            }
        }
    }

    // --- tags ------------------------------------------------------------

    fn parse_start_tag(&mut self) -> PRes<()> {
        let start_spooler = self.current_spooler_id();
        self.get_next()?; // <

        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "in start tag")?;
                return self.resync_past('>');
            }
        };

        let known = self.validator.elements.by_name(&name).is_some();
        let elem_id = self
            .validator
            .find_or_fault_elem(&name, CreateReason::InContent);
        if !known {
            self.post_validity(XmlErrCode::ElementNotDeclared, &name)?;
        }

        if !self.root_seen {
            if let Some(root_id) = self.validator.root_elem_id() {
                if root_id != elem_id {
                    self.post_validity(XmlErrCode::RootElementMismatch, &name)?;
                }
            }
        }

        self.validator.elements.get_mut(elem_id).clear_provided_flags();
        self.attrs.clear();

        let mut empty = false;
        let mut had_space = self.skipped_spaces(false)?;
        loop {
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in start tag")?;
                    return Ok(());
                }
                '>' => {
                    self.get_next()?;
                    break;
                }
                '/' => {
                    self.get_next()?;
                    if !self.skipped_char('>')? {
                        self.post_err(XmlErrCode::UnterminatedMarkup, "expected `/>`")?;
                        self.resync_past('>')?;
                    }
                    empty = true;
                    break;
                }
                _ => {
                    if !had_space {
                        self.post_err(XmlErrCode::ExpectedWhitespace, "between attributes")?;
                    }
                    self.parse_attribute(elem_id)?;
                    had_space = self.skipped_spaces(false)?;
                }
            }
        }

        if self.current_spooler_id() != start_spooler {
            self.post_err(XmlErrCode::PartialMarkup, &name)?;
        }

        self.inject_default_attrs(elem_id)?;

        self.root_seen = true;
        if let Some(parent) = self.ctx.last_mut() {
            parent.children.push(elem_id);
        }

        if self.flags.contains(XmlParseFlags::TAGS) {
            if let Some(h) = self.doc_events.clone() {
                let elem = self.validator.elements.get(elem_id);
                h.borrow_mut()
                    .start_tag(elem, &self.attrs, empty)
                    .map_err(Interrupt::Callback)?;
            }
        }

        if empty {
            if self.validating() {
                let result = {
                    let elem = self.validator.elements.get(elem_id);
                    self.validator.validate_content(elem, &[])
                };
                self.report_content_result(elem_id, result)?;
            }
            if self.flags.contains(XmlParseFlags::TAGS) {
                if let Some(h) = self.doc_events.clone() {
                    let elem = self.validator.elements.get(elem_id);
                    h.borrow_mut().end_tag(elem).map_err(Interrupt::Callback)?;
                }
            }
        } else {
            self.ctx.push(CtxFrame {
                elem_id,
                spooler_id: start_spooler,
                children: Vec::new(),
            });
        }
        Ok(())
    }

    fn parse_attribute(&mut self, elem_id: u32) -> PRes<()> {
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "attribute name")?;
                self.get_next()?;
                return Ok(());
            }
        };

        self.skipped_spaces(false)?;
        if !self.skipped_char('=')? {
            self.post_err(XmlErrCode::ExpectedEquals, &name)?;
            return Ok(());
        }
        self.skipped_spaces(false)?;

        let (attr_type, declared) = match self.validator.elements.get(elem_id).find_attr(&name) {
            Some(def) => (def.attr_type(), true),
            None => (AttrType::Cdata, false),
        };
        if !declared {
            self.post_validity(XmlErrCode::AttrNotDeclared, &name)?;
        }

        let value = match self.parse_attr_value(attr_type)? {
            Some(value) => value,
            None => return Ok(()),
        };

        if self.attrs.iter().any(|a| a.name() == name) {
            self.post_err(XmlErrCode::DuplicateAttr, &name)?;
            return Ok(());
        }

        if declared {
            if let Some(def) = self.validator.elements.get_mut(elem_id).find_attr_mut(&name) {
                def.set_provided(true);
            }
            if self.validating() {
                let verdict = {
                    let elem = self.validator.elements.get(elem_id);
                    match elem.find_attr(&name) {
                        Some(def) => self.validator.validate_attr(def, &value),
                        None => Ok(()),
                    }
                };
                if let Err((code, detail)) = verdict {
                    self.post_err(code, &detail)?;
                }
            }
        }

        self.attrs.push(XmlAttr::new(name, value, attr_type, true));
        Ok(())
    }

    /// Reads a quoted attribute value, expanding character and internal
    /// general entity references, and normalising whitespace per the
    /// attribute type. The closing quote must be found in the entity where
    /// the literal began.
    fn parse_attr_value(&mut self, attr_type: AttrType) -> PRes<Option<String>> {
        let quote = match self.skipped_quote()? {
            Some(quote) => quote,
            None => {
                self.post_err(XmlErrCode::ExpectedQuotedString, "attribute value")?;
                return Ok(None);
            }
        };
        let literal_spooler = self.current_spooler_id();

        let mut value = String::new();
        loop {
            let ch = self.peek_next()?;
            match ch {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in attribute value")?;
                    return Ok(None);
                }
                c if c == quote && self.current_spooler_id() == literal_spooler => {
                    self.get_next()?;
                    break;
                }
                '&' => {
                    self.get_next()?;
                    if self.peek_next()? == '#' {
                        if let Some(expanded) = self.parse_char_ref()? {
                            // escape-produced whitespace survives CDATA
                            // normalisation untouched
                            value.push(expanded);
                        }
                    } else {
                        self.expand_entity_in_literal(&mut value)?;
                    }
                }
                '<' => {
                    self.post_err(XmlErrCode::LtInAttrValue, "")?;
                    self.get_next()?;
                }
                '\t' | '\n' | '\r' => {
                    self.get_next()?;
                    value.push(' ');
                }
                _ => {
                    value.push(self.get_next()?);
                }
            }
        }

        if attr_type == AttrType::Cdata {
            Ok(Some(value))
        } else {
            Ok(Some(DtdValidator::normalize_attr_value(attr_type, &value)))
        }
    }

    /// Expands `&name;` inside a literal: predefined entities append their
    /// character, other internal entities push a spooler whose content
    /// flows into the literal, external entities are not allowed here.
    fn expand_entity_in_literal(&mut self, value: &mut String) -> PRes<()> {
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "entity reference")?;
                return Ok(());
            }
        };
        if !self.skipped_char(';')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "entity reference")?;
        }

        let decl = match self.validator.gen_entities.find(&name) {
            Some(decl) => Rc::new(decl.clone()),
            None => {
                self.post_err(XmlErrCode::EntityNotFound, &name)?;
                return Ok(());
            }
        };

        if decl.is_special() {
            value.push_str(decl.value().unwrap_or(""));
            return Ok(());
        }
        if decl.is_unparsed() {
            self.post_err(XmlErrCode::UnparsedEntityRef, &name)?;
            return Ok(());
        }
        if decl.is_external() {
            self.post_err(XmlErrCode::ExtEntityInAttr, &name)?;
            return Ok(());
        }

        let spooler =
            self.em
                .make_from_internal(decl, EntityKind::General, RefFrom::InsideLiteral);
        match self.em.push_entity(spooler) {
            PushOutcome::Pushed(_) => Ok(()),
            PushOutcome::Recursive => self.post_err(XmlErrCode::RecursiveEntityRef, &name),
        }
    }

    fn inject_default_attrs(&mut self, elem_id: u32) -> PRes<()> {
        use crate::decls::DefAttrType;

        let mut missing_required: Vec<String> = Vec::new();
        let mut defaults: Vec<XmlAttr> = Vec::new();
        {
            let elem = self.validator.elements.get(elem_id);
            for def in elem.attrs() {
                if def.provided() {
                    continue;
                }
                match def.def_type() {
                    DefAttrType::Required => missing_required.push(def.name().to_string()),
                    DefAttrType::Default | DefAttrType::Fixed => {
                        defaults.push(XmlAttr::new(
                            def.name(),
                            def.value(),
                            def.attr_type(),
                            false,
                        ));
                    }
                    DefAttrType::Implied => {}
                }
            }
        }
        for name in missing_required {
            self.post_validity(XmlErrCode::RequiredAttrMissing, &name)?;
        }
        self.attrs.extend(defaults);
        Ok(())
    }

    fn parse_end_tag(&mut self) -> PRes<()> {
        let end_spooler = self.current_spooler_id();
        self.get_next()?; // <
        self.get_next()?; // /

        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "in end tag")?;
                return self.resync_past('>');
            }
        };
        self.skipped_spaces(false)?;
        if !self.skipped_char('>')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "in end tag")?;
            self.resync_past('>')?;
        }

        let frame = match self.ctx.pop() {
            Some(frame) => frame,
            None => {
                self.post_err(XmlErrCode::MismatchedEndTag, &name)?;
                return Ok(());
            }
        };

        let open_name = self.validator.elements.get(frame.elem_id).name().to_string();
        if open_name != name {
            self.post_err(
                XmlErrCode::MismatchedEndTag,
                &format!("expected `{}`, found `{}`", open_name, name),
            )?;
        } else if frame.spooler_id != end_spooler {
            self.post_err(XmlErrCode::PartialMarkup, &name)?;
        }

        if self.validating() {
            let result = {
                let elem = self.validator.elements.get(frame.elem_id);
                self.validator.validate_content(elem, &frame.children)
            };
            self.report_content_result(frame.elem_id, result)?;
        }

        if self.flags.contains(XmlParseFlags::TAGS) {
            if let Some(h) = self.doc_events.clone() {
                let elem = self.validator.elements.get(frame.elem_id);
                h.borrow_mut().end_tag(elem).map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    fn report_content_result(&mut self, elem_id: u32, result: ValidRes) -> PRes<()> {
        let name = self.validator.elements.get(elem_id).name().to_string();
        match result {
            ValidRes::Success => Ok(()),
            ValidRes::Mismatch { at } => self.post_err(
                XmlErrCode::ContentMismatch,
                &format!("in `{}` at child {}", name, at),
            ),
            ValidRes::TooFew => self.post_err(XmlErrCode::ContentTooFew, &name),
            ValidRes::TooMany => self.post_err(XmlErrCode::ContentTooMany, &name),
        }
    }

    // --- character data --------------------------------------------------

    /// Aggregates character data up to the next markup or entity boundary.
    /// The throw-at-end mode is armed for the duration so that an ending
    /// entity flushes the buffered text, letting consumers observe entity
    /// topology.
    fn parse_characters(&mut self) -> PRes<()> {
        let prev = self.em.set_throw_at_end(true);
        let result = self.read_char_data();
        self.em.set_throw_at_end(prev);
        match result {
            Err(Interrupt::EndOfEntity { decl, .. }) => {
                self.flush_chars(false)?;
                if self.flags.contains(XmlParseFlags::TOPOLOGY) {
                    if let Some(h) = self.ent_events.clone() {
                        h.borrow_mut()
                            .end_entity(&decl)
                            .map_err(Interrupt::Callback)?;
                    }
                }
                Ok(())
            }
            other => other,
        }
    }

    fn read_char_data(&mut self) -> PRes<()> {
        if self.char_buf.is_empty() {
            self.char_buf_loc = self.location();
        }
        loop {
            let ch = self.peek_next()?;
            match ch {
                CH_EOF | '<' => {
                    return Ok(());
                }
                '&' => {
                    self.get_next()?;
                    if self.peek_next()? == '#' {
                        if let Some(expanded) = self.parse_char_ref()? {
                            self.char_buf.push(expanded);
                        }
                    } else {
                        self.expand_entity_in_content()?;
                    }
                }
                ']' => {
                    if self.peek_ahead(1) == Some(']') && self.peek_ahead(2) == Some('>') {
                        self.post_err(XmlErrCode::CDataEndInContent, "")?;
                        self.get_next()?;
                        self.get_next()?;
                        self.get_next()?;
                    } else {
                        let c = self.get_next()?;
                        self.char_buf.push(c);
                    }
                }
                _ => {
                    let c = self.get_next()?;
                    self.char_buf.push(c);
                }
            }
            if self.char_buf.len() >= CHAR_FLUSH_LIMIT {
                self.flush_chars(false)?;
                self.char_buf_loc = self.location();
            }
        }
    }

    /// `&#` was peeked (the `&` is consumed, `#` is not). Parses a decimal
    /// or hex character reference and checks the result is a legal XML
    /// character; surrogate code points are rejected here, which enforces
    /// correct pairing.
    pub(crate) fn parse_char_ref(&mut self) -> PRes<Option<char>> {
        self.get_next()?; // #
        let hex = self.skipped_char('x')?;
        let mut digits = String::new();
        loop {
            match self.peek_next()? {
                c if (hex && c.is_ascii_hexdigit()) || (!hex && c.is_ascii_digit()) => {
                    digits.push(self.get_next()?);
                }
                _ => break,
            }
        }
        if !self.skipped_char(';')? {
            self.post_err(XmlErrCode::InvalidCharRef, "missing `;`")?;
            return Ok(None);
        }
        if digits.is_empty() {
            self.post_err(XmlErrCode::InvalidCharRef, "no digits")?;
            return Ok(None);
        }
        let radix = if hex { 16 } else { 10 };
        let code = match u32::from_str_radix(&digits, radix) {
            Ok(code) => code,
            Err(_) => {
                self.post_err(XmlErrCode::InvalidCharRef, &digits)?;
                return Ok(None);
            }
        };
        if (0xD800..=0xDFFF).contains(&code) {
            self.post_err(XmlErrCode::UnpairedSurrogate, &digits)?;
            return Ok(None);
        }
        match char::from_u32(code) {
            Some(c) if c.is_xml_char() => Ok(Some(c)),
            _ => {
                self.post_err(XmlErrCode::InvalidCharRef, &digits)?;
                Ok(None)
            }
        }
    }

    /// Expands `&name;` in content. Internal entities push a spooler and
    /// parsing resumes inside; external parsed entities are resolved and
    /// pushed the same way, after their text declaration is consumed.
    fn expand_entity_in_content(&mut self) -> PRes<()> {
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "entity reference")?;
                return Ok(());
            }
        };
        if !self.skipped_char(';')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "entity reference")?;
        }

        let decl = match self.validator.gen_entities.find(&name) {
            Some(decl) => Rc::new(decl.clone()),
            None => {
                self.post_err(XmlErrCode::EntityNotFound, &name)?;
                return Ok(());
            }
        };

        if decl.is_special() {
            self.char_buf.push_str(decl.value().unwrap_or(""));
            return Ok(());
        }
        if decl.is_unparsed() {
            self.post_err(XmlErrCode::UnparsedEntityRef, &name)?;
            return Ok(());
        }

        // Flush before the entity starts so handlers see the boundary.
        self.flush_chars(false)?;
        if self.flags.contains(XmlParseFlags::TOPOLOGY) {
            if let Some(h) = self.ent_events.clone() {
                h.borrow_mut()
                    .start_entity(&decl)
                    .map_err(Interrupt::Callback)?;
            }
        }

        if decl.is_internal() {
            let spooler =
                self.em
                    .make_from_internal(decl, EntityKind::General, RefFrom::OutsideLiteral);
            match self.em.push_entity(spooler) {
                PushOutcome::Pushed(_) => {}
                PushOutcome::Recursive => {
                    self.post_err(XmlErrCode::RecursiveEntityRef, &name)?;
                }
            }
        } else {
            self.push_external_entity(&decl, EntityKind::General, ResolveKind::GeneralEntity)?;
        }
        self.char_buf_loc = self.location();
        Ok(())
    }

    /// Resolves an external entity via the registered resolver, falling
    /// back to composing its system id against the nearest external parent,
    /// then pushes a spooler over it and eats any text declaration.
    pub(crate) fn push_external_entity(
        &mut self,
        decl: &Rc<EntityDecl>,
        kind: EntityKind,
        resolve_kind: ResolveKind,
    ) -> PRes<()> {
        let parent = self.em.last_external_system_id().unwrap_or_default();
        let resolved: Option<Rc<dyn EntitySource>> = match self.resolver.clone() {
            Some(resolver) => resolver.borrow_mut().resolve(
                decl.public_id(),
                decl.system_id(),
                decl.name(),
                &parent,
                resolve_kind,
            ),
            None => None,
        };

        let src: Rc<dyn EntitySource> = match resolved {
            Some(src) => src,
            None => {
                let system_id = compose_system_id(decl.system_id(), &parent);
                Rc::new(crate::source::FileEntitySrc::new(system_id))
            }
        };

        let spooler = match self.em.make_from_source(
            src.as_ref(),
            Some(decl.clone()),
            kind,
            RefFrom::OutsideLiteral,
        ) {
            Ok(spooler) => spooler,
            Err(err) => {
                return self.post_err(
                    XmlErrCode::EntityOpenFailure,
                    &format!("{}: {}", src.system_id(), err),
                );
            }
        };
        match self.em.push_entity(spooler) {
            PushOutcome::Pushed(staged) => {
                self.report_staged(staged)?;
                self.parse_text_decl()?;
                Ok(())
            }
            PushOutcome::Recursive => self.post_err(XmlErrCode::RecursiveEntityRef, decl.name()),
        }
    }

    /// Consumes a `<?xml version encoding?>` text declaration at the start
    /// of an external entity, if present.
    pub(crate) fn parse_text_decl(&mut self) -> PRes<()> {
        if !self.at_decl_start()? {
            return Ok(());
        }
        self.skipped_string("<?xml")?;

        let mut version = String::new();
        let mut encoding = String::new();

        self.skipped_spaces(false)?;
        if self.skipped_string("version")? {
            if let Some(value) = self.parse_eq_quoted()? {
                version = value;
            }
            self.skipped_spaces(false)?;
        }
        if self.skipped_string("encoding")? {
            if let Some(value) = self.parse_eq_quoted()? {
                encoding = value;
            }
            self.skipped_spaces(false)?;
        }
        if !self.skipped_string("?>")? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "text declaration")?;
            self.resync_past('>')?;
        }

        if !encoding.is_empty() {
            if let Err(code) = self.em.set_decl_encoding(&encoding) {
                self.post_err(code, &encoding)?;
            }
        }

        if self.flags.contains(XmlParseFlags::TEXT_DECL) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .text_decl(&version, &encoding)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// Flushes aggregated character data, applying the open element's text
    /// policy: no text in EMPTY elements, only ignorable whitespace in
    /// element-only content.
    fn flush_chars(&mut self, is_cdata: bool) -> PRes<()> {
        if self.char_buf.is_empty() {
            return Ok(());
        }
        let text = std::mem::take(&mut self.char_buf);
        let loc = self.char_buf_loc;

        let policy = match self.ctx.last() {
            Some(frame) => self.validator.elements.get(frame.elem_id).text_policy(),
            None => TextPolicy::AnyText,
        };
        let all_space = text.chars().all(|c| c.is_xml_whitespace());
        let mut ignorable = false;
        match policy {
            TextPolicy::AnyText => {}
            TextPolicy::SpaceOnly => {
                if all_space && !is_cdata {
                    ignorable = true;
                } else {
                    let elem_name = match self.ctx.last() {
                        Some(frame) => {
                            self.validator.elements.get(frame.elem_id).name().to_string()
                        }
                        None => String::new(),
                    };
                    self.post_validity(XmlErrCode::TextInElementOnly, &elem_name)?;
                }
            }
            TextPolicy::NoText => {
                let elem_name = match self.ctx.last() {
                    Some(frame) => self.validator.elements.get(frame.elem_id).name().to_string(),
                    None => String::new(),
                };
                self.post_validity(XmlErrCode::ContentTooMany, &elem_name)?;
            }
        }

        let wanted = if ignorable {
            self.flags.contains(XmlParseFlags::IGNORABLE_SPACE)
        } else {
            self.flags.contains(XmlParseFlags::CHARS)
        };
        if wanted {
            if let Some(h) = self.doc_events.clone() {
                h.borrow_mut()
                    .doc_characters(&text, is_cdata, ignorable, loc)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    // --- CDATA, comments, PIs -------------------------------------------

    fn parse_cdata(&mut self) -> PRes<()> {
        if !self.skipped_string("<![CDATA[")? {
            self.post_err(XmlErrCode::UnexpectedContent, "expected CDATA section")?;
            return self.resync_past('>');
        }
        // plain character data before the section flushes first
        self.flush_chars(false)?;
        self.char_buf_loc = self.location();

        loop {
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in CDATA section")?;
                    return Ok(());
                }
                ']' => {
                    if self.peek_ahead(1) == Some(']') && self.peek_ahead(2) == Some('>') {
                        self.get_next()?;
                        self.get_next()?;
                        self.get_next()?;
                        break;
                    }
                    let c = self.get_next()?;
                    self.char_buf.push(c);
                }
                '<' => {
                    if self.peek_ahead(1) == Some('!')
                        && self.peek_ahead(2) == Some('[')
                        && self.skipped_string("<![CDATA[")?
                    {
                        self.post_err(XmlErrCode::NestedCData, "")?;
                        continue;
                    }
                    let c = self.get_next()?;
                    self.char_buf.push(c);
                }
                _ => {
                    let c = self.get_next()?;
                    self.char_buf.push(c);
                }
            }
        }
        self.flush_chars(true)
    }

    /// `<!--` is already consumed. `--` may only appear as part of the
    /// closing `-->`.
    fn parse_comment_tail(&mut self) -> PRes<()> {
        let loc = self.location();
        let mut text = String::new();
        loop {
            match self.get_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in comment")?;
                    return Ok(());
                }
                '-' => {
                    if self.skipped_char('-')? {
                        if self.skipped_char('>')? {
                            break;
                        }
                        self.post_err(XmlErrCode::DoubleDashInComment, "")?;
                        text.push_str("--");
                    } else {
                        text.push('-');
                    }
                }
                c => text.push(c),
            }
        }
        if self.flags.contains(XmlParseFlags::COMMENTS) {
            if let Some(h) = self.doc_events.clone() {
                h.borrow_mut()
                    .doc_comment(&text, loc)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// `<?` is already consumed; reads the target and delegates.
    fn parse_pi_from_target(&mut self) -> PRes<()> {
        let target = match self.get_name(false)? {
            Some(target) => target,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "PI target")?;
                return self.resync_past('>');
            }
        };
        self.parse_pi_tail(&target)
    }

    /// Target is read; parses the data up to `?>` and emits the event.
    fn parse_pi_tail(&mut self, target: &str) -> PRes<()> {
        let loc = self.location();
        if target.eq_ignore_ascii_case("xml") {
            self.post_err(XmlErrCode::BadPITarget, target)?;
        }

        let mut data = String::new();
        self.skipped_spaces(false)?;
        loop {
            match self.get_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in processing instruction")?;
                    return Ok(());
                }
                '?' => {
                    if self.skipped_char('>')? {
                        break;
                    }
                    data.push('?');
                }
                c => data.push(c),
            }
        }

        if self.flags.contains(XmlParseFlags::PIS) {
            if let Some(h) = self.doc_events.clone() {
                h.borrow_mut()
                    .doc_pi(target, &data, loc)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    // --- epilog ----------------------------------------------------------

    fn parse_epilog(&mut self) -> PRes<()> {
        loop {
            let mut spaces = String::new();
            self.get_prolog_spaces(&mut spaces)?;
            if !spaces.is_empty() && self.flags.contains(XmlParseFlags::SPACE_AC) {
                let loc = self.location();
                if let Some(h) = self.doc_events.clone() {
                    h.borrow_mut()
                        .doc_characters(&spaces, false, true, loc)
                        .map_err(Interrupt::Callback)?;
                }
            }

            match self.peek_next()? {
                CH_EOF => return Ok(()),
                '<' => {
                    if self.skipped_string("<!--")? {
                        self.parse_comment_tail()?;
                    } else if self.peek_ahead(1) == Some('?') {
                        self.get_next()?;
                        self.get_next()?;
                        self.parse_pi_from_target()?;
                    } else {
                        self.post_err(XmlErrCode::UnexpectedContent, "after root element")?;
                        self.resync_past('>')?;
                    }
                }
                _ => {
                    self.post_err(XmlErrCode::UnexpectedContent, "after root element")?;
                    self.get_next()?;
                }
            }
        }
    }
}

impl Default for XmlParserCore {
    fn default() -> Self {
        Self::new()
    }
}
