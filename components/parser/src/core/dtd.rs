//! The DOCTYPE grammar: markup declarations, subsets, conditional sections
//! and parameter-entity expansion. These methods fill the validator's pools.

use std::rc::Rc;

use xvp_chars::XmlAsciiChar;

use crate::cm::{ChildModel, CmSpecNode, ContentModel, MixedModel};
use crate::decls::{
    AttrDef, AttrType, ContentModelType, CreateReason, DefAttrType, EntityDecl, NotationDecl,
};
use crate::entitymgr::PushOutcome;
use crate::error::{Interrupt, PRes, XmlErrCode};
use crate::events::{XmlParseFlags, XmlParseOpts};
use crate::source::ResolveKind;
use crate::spooler::{EntityKind, RefFrom, CH_EOF};
use crate::validator::DtdValidator;

use super::XmlParserCore;

/// Where DTD markup is being parsed; parameter entities behave differently
/// in the internal and external subsets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Subset {
    Internal,
    External,
}

impl XmlParserCore {
    fn dtd_events_on(&self) -> bool {
        !self.opts.contains(XmlParseOpts::IGNORE_DTD)
    }

    /// `<!DOCTYPE` is already consumed.
    pub(super) fn parse_doctype(&mut self) -> PRes<()> {
        if self.validator.is_locked() {
            return self.eat_doctype();
        }

        self.skipped_spaces(false)?;
        let root_name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "DOCTYPE root name")?;
                return self.resync_past('>');
            }
        };
        let root_id = self
            .validator
            .find_or_fault_elem(&root_name, CreateReason::AsRootElem);
        self.validator.root_elem_id = Some(root_id);

        self.skipped_spaces(false)?;
        let (public_id, system_id) = match self.peek_next()? {
            'S' | 'P' => self.parse_external_id(false)?,
            _ => (String::new(), String::new()),
        };

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::DOC_TYPE) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .doc_type(&root_name, &public_id, &system_id)
                    .map_err(Interrupt::Callback)?;
            }
        }

        self.skipped_spaces(false)?;
        if self.skipped_char('[')? {
            let open_spooler = self.current_spooler_id();
            if self.dtd_events_on() {
                if let Some(h) = self.dtd_events.clone() {
                    h.borrow_mut().start_int_subset().map_err(Interrupt::Callback)?;
                }
            }
            self.parse_int_subset(open_spooler)?;
            if self.dtd_events_on() {
                if let Some(h) = self.dtd_events.clone() {
                    h.borrow_mut().end_int_subset().map_err(Interrupt::Callback)?;
                }
            }
            self.skipped_spaces(false)?;
        }

        if !self.skipped_char('>')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "DOCTYPE")?;
            self.resync_past('>')?;
        }

        // The external subset is read after the whole DOCTYPE declaration.
        if !system_id.is_empty() || !public_id.is_empty() {
            self.parse_ext_subset(&root_name, &public_id, &system_id)?;
        }

        if self.validating() && self.dtd_events_on() {
            let mut reported = Vec::new();
            self.validator
                .post_dtd_checks(&mut |code, detail| reported.push((code, detail)));
            for (code, detail) in reported {
                self.post_err(code, &detail)?;
            }
        }

        if self.opts.contains(XmlParseOpts::IGNORE_DTD) {
            self.validator.reset();
        }

        if self.dtd_events_on() {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut().end_doc_type().map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// A locked validator re-uses its compiled DTD: the DOCTYPE is consumed
    /// without interpretation, and an internal subset is rejected.
    fn eat_doctype(&mut self) -> PRes<()> {
        self.skipped_spaces(false)?;
        self.get_name(false)?;
        self.skipped_spaces(false)?;
        if matches!(self.peek_next()?, 'S' | 'P') {
            self.parse_external_id(false)?;
        }
        self.skipped_spaces(false)?;
        if self.skipped_char('[')? {
            self.post_err(XmlErrCode::IntSubsetNotAllowed, "")?;
            let mut depth = 1u32;
            loop {
                match self.get_next()? {
                    CH_EOF => break,
                    '[' => depth += 1,
                    ']' => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            self.skipped_spaces(false)?;
        }
        if !self.skipped_char('>')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "DOCTYPE")?;
            self.resync_past('>')?;
        }
        Ok(())
    }

    /// Consumes a DOCTYPE that follows an already-reported extra one.
    pub(super) fn skip_doctype_blind(&mut self) -> PRes<()> {
        let mut depth = 0u32;
        loop {
            match self.get_next()? {
                CH_EOF => return Ok(()),
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                '>' if depth == 0 => return Ok(()),
                _ => {}
            }
        }
    }

    /// `SYSTEM S SystemLiteral` or `PUBLIC S PubidLiteral (S SystemLiteral)`.
    /// With `public_only_ok` (notations) the system literal after a public
    /// id may be absent.
    fn parse_external_id(&mut self, public_only_ok: bool) -> PRes<(String, String)> {
        if self.skipped_string("SYSTEM")? {
            self.req_ws()?;
            let system = self.parse_quoted_literal()?.unwrap_or_default();
            return Ok((String::new(), system));
        }
        if self.skipped_string("PUBLIC")? {
            self.req_ws()?;
            let public = self.parse_quoted_literal()?.unwrap_or_default();
            for c in public.chars() {
                if !c.is_xml_pubid_char() {
                    self.post_err(XmlErrCode::InvalidChar, "in public id")?;
                    break;
                }
            }
            let had_ws = self.skipped_spaces(false)?;
            let system = if had_ws && matches!(self.peek_next()?, '"' | '\'') {
                self.parse_quoted_literal()?.unwrap_or_default()
            } else if public_only_ok {
                String::new()
            } else {
                self.post_err(XmlErrCode::ExpectedQuotedString, "system literal")?;
                String::new()
            };
            return Ok((public, system));
        }
        self.post_err(XmlErrCode::BadExternalId, "")?;
        Ok((String::new(), String::new()))
    }

    /// A plain quoted literal; no references are recognised and the closing
    /// quote must be in the entity where the literal began.
    fn parse_quoted_literal(&mut self) -> PRes<Option<String>> {
        let quote = match self.skipped_quote()? {
            Some(quote) => quote,
            None => {
                self.post_err(XmlErrCode::ExpectedQuotedString, "")?;
                return Ok(None);
            }
        };
        let literal_spooler = self.current_spooler_id();
        let mut value = String::new();
        loop {
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in literal")?;
                    return Ok(None);
                }
                c if c == quote => {
                    if self.current_spooler_id() != literal_spooler {
                        self.post_err(XmlErrCode::PartialMarkup, "literal")?;
                    }
                    self.get_next()?;
                    return Ok(Some(value));
                }
                _ => {
                    let c = self.get_next()?;
                    value.push(c);
                }
            }
        }
    }

    // --- subsets ---------------------------------------------------------

    fn parse_int_subset(&mut self, open_spooler: u32) -> PRes<()> {
        loop {
            self.dtd_ws(Subset::Internal)?;
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in internal subset")?;
                    return Ok(());
                }
                ']' => {
                    if self.current_spooler_id() != open_spooler {
                        self.post_err(XmlErrCode::PartialMarkup, "internal subset")?;
                    }
                    self.get_next()?;
                    return Ok(());
                }
                '%' => {
                    self.get_next()?;
                    self.expand_pe_ref()?;
                }
                _ => self.parse_markup_item(Subset::Internal)?,
            }
        }
    }

    fn parse_ext_subset(
        &mut self,
        root_name: &str,
        public_id: &str,
        system_id: &str,
    ) -> PRes<()> {
        let mut decl = EntityDecl::external(
            format!("[dtd {}]", root_name),
            public_id,
            system_id,
        );
        decl.set_parameter(true);
        let decl = Rc::new(decl);

        let base_depth = self.em.depth();
        self.push_external_entity(&decl, EntityKind::Parameter, ResolveKind::ExternalSubset)?;
        if self.em.depth() == base_depth {
            // the push failed and was reported; nothing to read
            return Ok(());
        }

        if self.dtd_events_on() {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut().start_ext_subset().map_err(Interrupt::Callback)?;
            }
        }

        loop {
            // forces the pop of drained spoolers before the depth test
            let ch = self.peek_next()?;
            if self.em.depth() <= base_depth || ch == CH_EOF {
                break;
            }
            if ch.is_xml_whitespace() {
                self.dtd_ws(Subset::External)?;
                continue;
            }
            match ch {
                '%' => {
                    self.get_next()?;
                    self.expand_pe_ref()?;
                }
                _ => self.parse_markup_item(Subset::External)?,
            }
        }

        if self.dtd_events_on() {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut().end_ext_subset().map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// Whitespace between declarations, reported through the DTD handler
    /// when subscribed.
    fn dtd_ws(&mut self, subset: Subset) -> PRes<bool> {
        let mut spaces = String::new();
        loop {
            match self.peek_next()? {
                c if c.is_xml_whitespace() => {
                    let c = self.get_next()?;
                    spaces.push(c);
                }
                _ => break,
            }
        }
        if spaces.is_empty() {
            return Ok(false);
        }
        let flag = match subset {
            Subset::Internal => XmlParseFlags::SPACE_ISS,
            Subset::External => XmlParseFlags::SPACE_ESS,
        };
        if self.dtd_events_on() && self.flags.contains(flag) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .doctype_ws(&spaces)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(true)
    }

    fn req_ws(&mut self) -> PRes<()> {
        if !self.skipped_spaces(true)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "")?;
        }
        Ok(())
    }

    /// One markup item: a declaration, comment, PI or conditional section.
    /// A declaration must end in the entity it began in.
    fn parse_markup_item(&mut self, subset: Subset) -> PRes<()> {
        let start_spooler = self.current_spooler_id();

        if self.skipped_string("<!--")? {
            return self.parse_dtd_comment();
        }
        if self.skipped_string("<![")? {
            if subset == Subset::Internal {
                self.post_err(XmlErrCode::CondSectionInIntSubset, "")?;
                return self.skip_conditional_blind();
            }
            return self.parse_conditional();
        }
        if self.skipped_string("<?")? {
            return self.parse_dtd_pi();
        }

        let handled = if self.skipped_string("<!ELEMENT")? {
            self.parse_element_decl(subset)?;
            true
        } else if self.skipped_string("<!ATTLIST")? {
            self.parse_attlist_decl(subset)?;
            true
        } else if self.skipped_string("<!ENTITY")? {
            self.parse_entity_decl(subset)?;
            true
        } else if self.skipped_string("<!NOTATION")? {
            self.parse_notation_decl(subset)?;
            true
        } else {
            false
        };

        if !handled {
            self.post_err(XmlErrCode::UnexpectedContent, "in DTD")?;
            return self.resync_past('>');
        }

        if self.current_spooler_id() != start_spooler {
            self.post_err(XmlErrCode::PartialMarkup, "markup declaration")?;
        }
        Ok(())
    }

    fn parse_dtd_comment(&mut self) -> PRes<()> {
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
        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::COMMENTS) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .doctype_comment(&text)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    fn parse_dtd_pi(&mut self) -> PRes<()> {
        let target = match self.get_name(false)? {
            Some(target) => target,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "PI target")?;
                return self.resync_past('>');
            }
        };
        if target.eq_ignore_ascii_case("xml") {
            self.post_err(XmlErrCode::BadPITarget, &target)?;
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
        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::PIS) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .doctype_pi(&target, &data)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    // --- conditional sections -------------------------------------------

    /// `<![` is consumed. Only reached in the external subset.
    fn parse_conditional(&mut self) -> PRes<()> {
        self.skipped_spaces(true)?;
        let include = if self.skipped_string("INCLUDE")? {
            true
        } else if self.skipped_string("IGNORE")? {
            false
        } else {
            self.post_err(XmlErrCode::BadConditionalKeyword, "")?;
            return self.skip_conditional_blind();
        };
        self.skipped_spaces(true)?;
        if !self.skipped_char('[')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "conditional section")?;
            return self.skip_conditional_blind();
        }

        if !include {
            return self.skip_ignore_section();
        }

        loop {
            self.dtd_ws(Subset::External)?;
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in conditional section")?;
                    return Ok(());
                }
                ']' => {
                    if self.skipped_string("]]>")? {
                        return Ok(());
                    }
                    self.post_err(XmlErrCode::UnexpectedContent, "expected `]]>`")?;
                    self.get_next()?;
                }
                '%' => {
                    self.get_next()?;
                    self.expand_pe_ref()?;
                }
                _ => self.parse_markup_item(Subset::External)?,
            }
        }
    }

    /// Skips an IGNORE section, respecting balanced `<![` ... `]]>` nesting.
    fn skip_ignore_section(&mut self) -> PRes<()> {
        let mut depth = 1u32;
        loop {
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in IGNORE section")?;
                    return Ok(());
                }
                '<' => {
                    if self.skipped_string("<![")? {
                        depth += 1;
                    } else {
                        self.get_next()?;
                    }
                }
                ']' => {
                    if self.skipped_string("]]>")? {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(());
                        }
                    } else {
                        self.get_next()?;
                    }
                }
                _ => {
                    self.get_next()?;
                }
            }
        }
    }

    fn skip_conditional_blind(&mut self) -> PRes<()> {
        self.skip_ignore_section()
    }

    // --- parameter entities ---------------------------------------------

    /// `%` is consumed: expands `name;` by pushing a spooler over the
    /// parameter entity's value or external content.
    pub(super) fn expand_pe_ref(&mut self) -> PRes<()> {
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "parameter entity reference")?;
                return Ok(());
            }
        };
        if !self.skipped_char(';')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "parameter entity reference")?;
        }

        let decl = match self.validator.param_entities.find(&name) {
            Some(decl) => Rc::new(decl.clone()),
            None => {
                self.post_err(XmlErrCode::EntityNotFound, &format!("%{};", name))?;
                return Ok(());
            }
        };

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
                    .make_from_internal(decl, EntityKind::Parameter, RefFrom::OutsideLiteral);
            match self.em.push_entity(spooler) {
                PushOutcome::Pushed(_) => Ok(()),
                PushOutcome::Recursive => self.post_err(XmlErrCode::RecursiveEntityRef, &name),
            }
        } else {
            self.push_external_entity(&decl, EntityKind::Parameter, ResolveKind::ParamEntity)
        }
    }

    /// Whitespace inside a declaration. In the external subset a parameter
    /// entity reference may stand in for (or extend) whitespace; in the
    /// internal subset that is not legal inside markup.
    fn decl_ws(&mut self, subset: Subset) -> PRes<bool> {
        let mut any = false;
        loop {
            if self.skipped_spaces(true)? {
                any = true;
            }
            if self.peek_next()? == '%' {
                if subset == Subset::Internal {
                    // report once and expand anyway to stay in sync
                    self.post_err(XmlErrCode::PERefInMarkup, "")?;
                }
                self.get_next()?;
                self.expand_pe_ref()?;
                any = true;
                continue;
            }
            return Ok(any);
        }
    }

    // --- <!ELEMENT ------------------------------------------------------

    fn parse_element_decl(&mut self, subset: Subset) -> PRes<()> {
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after <!ELEMENT")?;
        }
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "element name")?;
                return self.resync_past('>');
            }
        };
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "before content model")?;
        }

        let (model_type, model) = match self.parse_content_spec(subset)? {
            Some(parsed) => parsed,
            None => return self.resync_past('>'),
        };

        self.decl_ws(subset)?;
        if !self.skipped_char('>')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "in <!ELEMENT>")?;
            self.resync_past('>')?;
        }

        let elem_id = self
            .validator
            .find_or_fault_elem(&name, CreateReason::Declared);
        let ignored = self.validator.elements.get(elem_id).is_declared()
            && self.validator.elements.get(elem_id).reason() == CreateReason::Declared
            && self.validator.elements.get(elem_id).content_model().is_some();
        if ignored {
            self.post_validity(XmlErrCode::DuplicateElementDecl, &name)?;
        } else {
            let elem = self.validator.elements.get_mut(elem_id);
            elem.set_reason(CreateReason::Declared);
            elem.set_model_type(model_type);
            elem.set_content_model(model);
        }

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::MARKUP) {
            if let Some(h) = self.dtd_events.clone() {
                let elem = self.validator.elements.get(elem_id);
                h.borrow_mut()
                    .element_decl(elem, ignored)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// `EMPTY`, `ANY`, a mixed model or a children model.
    fn parse_content_spec(
        &mut self,
        subset: Subset,
    ) -> PRes<Option<(ContentModelType, ContentModel)>> {
        if self.skipped_string("EMPTY")? {
            return Ok(Some((ContentModelType::Empty, ContentModel::Empty)));
        }
        if self.skipped_string("ANY")? {
            return Ok(Some((ContentModelType::Any, ContentModel::Any)));
        }
        if !self.skipped_char('(')? {
            self.post_err(XmlErrCode::BadContentModel, "expected `(`")?;
            return Ok(None);
        }
        self.decl_ws(subset)?;

        if self.skipped_string("#PCDATA")? {
            return self.parse_mixed_tail(subset);
        }

        let spec = match self.parse_cm_group_body(subset)? {
            Some(spec) => spec,
            None => return Ok(None),
        };
        let spec = self.parse_quantifier(spec)?;
        let model = ChildModel::compile(&spec);
        Ok(Some((
            ContentModelType::Children,
            ContentModel::Children(model),
        )))
    }

    /// `(#PCDATA` is consumed: the rest is `(| name)* )*` or `)`.
    fn parse_mixed_tail(
        &mut self,
        subset: Subset,
    ) -> PRes<Option<(ContentModelType, ContentModel)>> {
        let mut ids = Vec::new();
        loop {
            self.decl_ws(subset)?;
            if self.skipped_char(')')? {
                // `)*` is required once names are listed
                let starred = self.skipped_char('*')?;
                if !ids.is_empty() && !starred {
                    self.post_err(XmlErrCode::BadContentModel, "mixed model needs `)*`")?;
                }
                let model = MixedModel::new(ids);
                return Ok(Some((ContentModelType::Mixed, ContentModel::Mixed(model))));
            }
            if !self.skipped_char('|')? {
                self.post_err(XmlErrCode::BadContentModel, "in mixed model")?;
                return Ok(None);
            }
            self.decl_ws(subset)?;
            match self.get_name(false)? {
                Some(name) => {
                    let id = self
                        .validator
                        .find_or_fault_elem(&name, CreateReason::AsContentModel);
                    ids.push(id);
                }
                None => {
                    self.post_err(XmlErrCode::ExpectedName, "in mixed model")?;
                    return Ok(None);
                }
            }
        }
    }

    /// The body of a parenthesised group whose `(` is consumed. Within one
    /// group only one of `,` and `|` may appear; nested groups may differ.
    fn parse_cm_group_body(&mut self, subset: Subset) -> PRes<Option<CmSpecNode>> {
        let mut items: Vec<CmSpecNode> = Vec::new();
        let mut sep: Option<char> = None;

        loop {
            self.decl_ws(subset)?;
            let item = match self.parse_cm_item(subset)? {
                Some(item) => item,
                None => return Ok(None),
            };
            items.push(item);

            self.decl_ws(subset)?;
            match self.peek_next()? {
                ')' => {
                    self.get_next()?;
                    break;
                }
                c @ ',' | c @ '|' => {
                    self.get_next()?;
                    match sep {
                        None => sep = Some(c),
                        Some(prev) if prev == c => {}
                        Some(_) => {
                            self.post_err(
                                XmlErrCode::BadContentModel,
                                "`,` and `|` cannot mix in one group",
                            )?;
                        }
                    }
                }
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in content model")?;
                    return Ok(None);
                }
                _ => {
                    self.post_err(XmlErrCode::BadContentModel, "expected `,`, `|` or `)`")?;
                    return Ok(None);
                }
            }
        }

        let alt = sep == Some('|');
        let mut iter = items.into_iter();
        let first = match iter.next() {
            Some(first) => first,
            None => {
                self.post_err(XmlErrCode::BadContentModel, "empty group")?;
                return Ok(None);
            }
        };
        let combined = iter.fold(first, |acc, item| {
            if alt {
                CmSpecNode::alt(acc, item)
            } else {
                CmSpecNode::seq(acc, item)
            }
        });
        Ok(Some(combined))
    }

    /// A name or nested group, with an optional trailing quantifier.
    fn parse_cm_item(&mut self, subset: Subset) -> PRes<Option<CmSpecNode>> {
        let node = if self.skipped_char('(')? {
            match self.parse_cm_group_body(subset)? {
                Some(node) => node,
                None => return Ok(None),
            }
        } else {
            match self.get_name(false)? {
                Some(name) => {
                    let id = self
                        .validator
                        .find_or_fault_elem(&name, CreateReason::AsContentModel);
                    CmSpecNode::leaf(id)
                }
                None => {
                    self.post_err(XmlErrCode::BadContentModel, "expected a name or `(`")?;
                    return Ok(None);
                }
            }
        };
        Ok(Some(self.parse_quantifier(node)?))
    }

    fn parse_quantifier(&mut self, node: CmSpecNode) -> PRes<CmSpecNode> {
        Ok(match self.peek_next()? {
            '?' => {
                self.get_next()?;
                CmSpecNode::opt(node)
            }
            '*' => {
                self.get_next()?;
                CmSpecNode::rep(node)
            }
            '+' => {
                self.get_next()?;
                CmSpecNode::plus(node)
            }
            _ => node,
        })
    }

    // --- <!ATTLIST ------------------------------------------------------

    fn parse_attlist_decl(&mut self, subset: Subset) -> PRes<()> {
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after <!ATTLIST")?;
        }
        let elem_name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "ATTLIST element name")?;
                return self.resync_past('>');
            }
        };
        let elem_id = self
            .validator
            .find_or_fault_elem(&elem_name, CreateReason::AsAttList);

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::MARKUP) {
            if let Some(h) = self.dtd_events.clone() {
                let elem = self.validator.elements.get(elem_id);
                h.borrow_mut()
                    .start_att_list(elem)
                    .map_err(Interrupt::Callback)?;
            }
        }

        loop {
            self.decl_ws(subset)?;
            match self.peek_next()? {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in <!ATTLIST>")?;
                    break;
                }
                '>' => {
                    self.get_next()?;
                    break;
                }
                _ => self.parse_attr_def(elem_id, subset)?,
            }
        }

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::MARKUP) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut().end_att_list().map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    fn parse_attr_def(&mut self, elem_id: u32, subset: Subset) -> PRes<()> {
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "attribute name")?;
                return self.resync_past('>');
            }
        };
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "before attribute type")?;
        }

        let attr_type = self.parse_attr_type(subset)?;
        let mut enum_values = Vec::new();
        if matches!(attr_type, AttrType::Notation | AttrType::Enumeration) {
            enum_values = self.parse_enum_list(subset, attr_type == AttrType::Notation)?;
        }

        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "before default declaration")?;
        }

        let (def_type, raw_default) = self.parse_default_decl(attr_type)?;

        let mut def = AttrDef::new(&name, attr_type, def_type);
        def.set_enum_values(enum_values);
        if let Some(raw) = raw_default {
            // default values are normalised at declaration time
            let normalized = if attr_type == AttrType::Cdata {
                raw
            } else {
                DtdValidator::normalize_attr_value(attr_type, &raw)
            };
            if self.validating() {
                if let Err((code, detail)) = self.validator.validate_attr(&def, &normalized) {
                    self.post_err(code, &detail)?;
                }
            }
            def.set_value(normalized);
        }

        let added = self.validator.elements.get_mut(elem_id).add_attr(def.clone());
        if !added && self.validating() {
            self.post_err(XmlErrCode::AttrDefRedeclared, &name)?;
        }

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::MARKUP) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .attr_def(&def, !added)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    fn parse_attr_type(&mut self, subset: Subset) -> PRes<AttrType> {
        // longest keywords first
        if self.skipped_string("CDATA")? {
            return Ok(AttrType::Cdata);
        }
        if self.skipped_string("IDREFS")? {
            return Ok(AttrType::IdRefs);
        }
        if self.skipped_string("IDREF")? {
            return Ok(AttrType::IdRef);
        }
        if self.skipped_string("ID")? {
            return Ok(AttrType::Id);
        }
        if self.skipped_string("ENTITIES")? {
            return Ok(AttrType::Entities);
        }
        if self.skipped_string("ENTITY")? {
            return Ok(AttrType::Entity);
        }
        if self.skipped_string("NMTOKENS")? {
            return Ok(AttrType::NmTokens);
        }
        if self.skipped_string("NMTOKEN")? {
            return Ok(AttrType::NmToken);
        }
        if self.skipped_string("NOTATION")? {
            if !self.decl_ws(subset)? {
                self.post_err(XmlErrCode::ExpectedWhitespace, "after NOTATION")?;
            }
            return Ok(AttrType::Notation);
        }
        if self.peek_next()? == '(' {
            return Ok(AttrType::Enumeration);
        }
        self.post_err(XmlErrCode::BadAttrType, "")?;
        Ok(AttrType::Cdata)
    }

    /// `( v1 | v2 | ... )`; NOTATION lists hold Names, enumerations hold
    /// Nmtokens.
    fn parse_enum_list(&mut self, subset: Subset, names_only: bool) -> PRes<Vec<String>> {
        let mut values = Vec::new();
        if !self.skipped_char('(')? {
            self.post_err(XmlErrCode::ExpectedQuotedString, "expected `(`")?;
            return Ok(values);
        }
        loop {
            self.decl_ws(subset)?;
            match self.get_name(!names_only)? {
                Some(value) => values.push(value),
                None => {
                    self.post_err(XmlErrCode::ExpectedName, "in enumeration")?;
                    break;
                }
            }
            self.decl_ws(subset)?;
            if self.skipped_char(')')? {
                break;
            }
            if !self.skipped_char('|')? {
                self.post_err(XmlErrCode::UnterminatedMarkup, "in enumeration")?;
                break;
            }
        }
        Ok(values)
    }

    fn parse_default_decl(&mut self, attr_type: AttrType) -> PRes<(DefAttrType, Option<String>)> {
        if self.skipped_string("#REQUIRED")? {
            return Ok((DefAttrType::Required, None));
        }
        if self.skipped_string("#IMPLIED")? {
            return Ok((DefAttrType::Implied, None));
        }
        if self.skipped_string("#FIXED")? {
            self.req_ws()?;
            let value = self.parse_attr_value(attr_type)?;
            return Ok((DefAttrType::Fixed, value));
        }
        let value = self.parse_attr_value(attr_type)?;
        Ok((DefAttrType::Default, value))
    }

    // --- <!ENTITY -------------------------------------------------------

    fn parse_entity_decl(&mut self, subset: Subset) -> PRes<()> {
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after <!ENTITY")?;
        }

        let is_pe = self.skipped_char('%')?;
        if is_pe && !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after `%`")?;
        }

        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "entity name")?;
                return self.resync_past('>');
            }
        };
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after entity name")?;
        }

        let mut decl = match self.peek_next()? {
            '"' | '\'' => {
                let value = self.parse_entity_value(subset)?.unwrap_or_default();
                EntityDecl::internal(&name, value)
            }
            _ => {
                let (public_id, system_id) = self.parse_external_id(false)?;
                let mut decl = EntityDecl::external(&name, public_id, system_id);
                let had_ws = self.decl_ws(subset)?;
                if had_ws && self.skipped_string("NDATA")? {
                    if is_pe {
                        self.post_err(
                            XmlErrCode::BadExternalId,
                            "parameter entities cannot be unparsed",
                        )?;
                    }
                    self.req_ws()?;
                    match self.get_name(false)? {
                        Some(notation) => decl.set_notation(notation),
                        None => self.post_err(XmlErrCode::ExpectedName, "NDATA notation")?,
                    }
                }
                decl
            }
        };
        decl.set_parameter(is_pe);
        decl.set_from_internal_subset(subset == Subset::Internal);

        self.decl_ws(subset)?;
        if !self.skipped_char('>')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "in <!ENTITY>")?;
            self.resync_past('>')?;
        }

        // first declaration wins
        let existing = if is_pe {
            self.validator.param_entities.find(&name)
        } else {
            self.validator.gen_entities.find(&name)
        };
        let (ignored, silent) = match existing {
            Some(existing) => (true, existing.is_special()),
            None => (false, false),
        };
        if !ignored {
            if is_pe {
                self.validator.param_entities.add(decl.clone());
            } else {
                self.validator.gen_entities.add(decl.clone());
            }
        } else if !silent {
            self.post_err(XmlErrCode::EntityRedeclared, &name)?;
        }

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::MARKUP) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .entity_decl(&decl, ignored)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }

    /// An entity value literal: character references expand, parameter
    /// entity references expand in the external subset, general entity
    /// references are stored untouched. The closing quote must appear in
    /// the entity where the literal began.
    fn parse_entity_value(&mut self, subset: Subset) -> PRes<Option<String>> {
        let quote = match self.skipped_quote()? {
            Some(quote) => quote,
            None => {
                self.post_err(XmlErrCode::ExpectedQuotedString, "entity value")?;
                return Ok(None);
            }
        };
        let literal_spooler = self.current_spooler_id();
        let mut value = String::new();
        loop {
            let ch = self.peek_next()?;
            match ch {
                CH_EOF => {
                    self.post_err(XmlErrCode::UnexpectedEof, "in entity value")?;
                    return Ok(None);
                }
                c if c == quote && self.current_spooler_id() == literal_spooler => {
                    self.get_next()?;
                    return Ok(Some(value));
                }
                '&' => {
                    self.get_next()?;
                    if self.peek_next()? == '#' {
                        if let Some(expanded) = self.parse_char_ref()? {
                            value.push(expanded);
                        }
                    } else {
                        // a general entity reference is carried through
                        value.push('&');
                    }
                }
                '%' => {
                    self.get_next()?;
                    if subset == Subset::Internal {
                        self.post_err(XmlErrCode::PERefInMarkup, "in entity value")?;
                    }
                    self.expand_pe_ref()?;
                }
                _ => {
                    let c = self.get_next()?;
                    value.push(c);
                }
            }
        }
    }

    // --- <!NOTATION -----------------------------------------------------

    fn parse_notation_decl(&mut self, subset: Subset) -> PRes<()> {
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after <!NOTATION")?;
        }
        let name = match self.get_name(false)? {
            Some(name) => name,
            None => {
                self.post_err(XmlErrCode::ExpectedName, "notation name")?;
                return self.resync_past('>');
            }
        };
        if !self.decl_ws(subset)? {
            self.post_err(XmlErrCode::ExpectedWhitespace, "after notation name")?;
        }

        let (public_id, system_id) = self.parse_external_id(true)?;

        self.decl_ws(subset)?;
        if !self.skipped_char('>')? {
            self.post_err(XmlErrCode::UnterminatedMarkup, "in <!NOTATION>")?;
            self.resync_past('>')?;
        }

        let decl = NotationDecl::new(&name, public_id, system_id);
        let ignored = self.validator.notations.find(&name).is_some();
        if ignored {
            self.post_err(XmlErrCode::NotationRedeclared, &name)?;
        } else {
            self.validator.notations.add(decl.clone());
        }

        if self.dtd_events_on() && self.flags.contains(XmlParseFlags::MARKUP) {
            if let Some(h) = self.dtd_events.clone() {
                h.borrow_mut()
                    .notation_decl(&decl, ignored)
                    .map_err(Interrupt::Callback)?;
            }
        }
        Ok(())
    }
}
