//! Event handler contracts and parse option/subscription flags.
//!
//! All handler methods are optional: every one has a default `Ok(())` body,
//! so an embedder implements only what it cares about. Returning `Err` from
//! any callback cancels the parse.

use bitflags::bitflags;

use crate::attr::XmlAttr;
use crate::decls::{AttrDef, ElemDecl, EntityDecl, NotationDecl};
use crate::error::{CbResult, XmlDiag};

bitflags! {
    /// Behavioural options for a parse.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct XmlParseOpts: u32 {
        /// Enable DTD-based validation and declaration-mismatch diagnostics.
        const VALIDATE = 0x0001;
        /// Parse the DOCTYPE syntactically, then discard its content.
        const IGNORE_DTD = 0x0002;
        /// Replace disallowed characters with U+0020 and warn instead of
        /// reporting a well-formedness error.
        const IGNORE_BAD_CHARS = 0x0004;
    }
}

bitflags! {
    /// Event subscription flags: which callbacks actually fire.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct XmlParseFlags: u32 {
        const XML_DECL = 0x0000_0001;
        const TEXT_DECL = 0x0000_0002;
        const DOC_TYPE = 0x0000_0004;
        /// Entity start/end events, exposing entity topology.
        const TOPOLOGY = 0x0000_0008;
        /// DTD markup declarations.
        const MARKUP = 0x0000_0010;
        const TAGS = 0x0000_0020;
        const CHARS = 0x0000_0040;
        const IGNORABLE_SPACE = 0x0000_0080;
        /// Whitespace before the root element.
        const SPACE_BC = 0x0000_0100;
        /// Whitespace after the root element.
        const SPACE_AC = 0x0000_0200;
        /// Whitespace in the internal subset.
        const SPACE_ISS = 0x0000_0400;
        /// Whitespace in the external subset.
        const SPACE_ESS = 0x0000_0800;
        const COMMENTS = 0x0000_1000;
        const PIS = 0x0000_2000;

        const ALL = 0x0000_3FFF;
    }
}

impl Default for XmlParseFlags {
    fn default() -> Self {
        XmlParseFlags::TAGS | XmlParseFlags::CHARS | XmlParseFlags::COMMENTS | XmlParseFlags::PIS
    }
}

/// Where an event happened, for handlers that track positions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XmlLocation {
    pub line: u32,
    pub col: u32,
}

pub trait XmlDocEvents {
    fn start_document(&mut self, _system_id: &str) -> CbResult {
        Ok(())
    }

    fn end_document(&mut self, _system_id: &str) -> CbResult {
        Ok(())
    }

    fn xml_decl(&mut self, _version: &str, _encoding: &str, _standalone: &str) -> CbResult {
        Ok(())
    }

    fn start_tag(
        &mut self,
        _elem: &ElemDecl,
        _attrs: &[XmlAttr],
        _empty: bool,
    ) -> CbResult {
        Ok(())
    }

    fn end_tag(&mut self, _elem: &ElemDecl) -> CbResult {
        Ok(())
    }

    fn doc_characters(
        &mut self,
        _text: &str,
        _is_cdata: bool,
        _is_ignorable: bool,
        _location: XmlLocation,
    ) -> CbResult {
        Ok(())
    }

    fn doc_comment(&mut self, _text: &str, _location: XmlLocation) -> CbResult {
        Ok(())
    }

    fn doc_pi(&mut self, _target: &str, _value: &str, _location: XmlLocation) -> CbResult {
        Ok(())
    }

    fn reset_document(&mut self) {}
}

pub trait XmlDTDEvents {
    fn doc_type(&mut self, _root_name: &str, _public_id: &str, _system_id: &str) -> CbResult {
        Ok(())
    }

    fn start_int_subset(&mut self) -> CbResult {
        Ok(())
    }

    fn end_int_subset(&mut self) -> CbResult {
        Ok(())
    }

    fn start_ext_subset(&mut self) -> CbResult {
        Ok(())
    }

    fn end_ext_subset(&mut self) -> CbResult {
        Ok(())
    }

    fn end_doc_type(&mut self) -> CbResult {
        Ok(())
    }

    fn element_decl(&mut self, _decl: &ElemDecl, _ignored: bool) -> CbResult {
        Ok(())
    }

    fn start_att_list(&mut self, _elem: &ElemDecl) -> CbResult {
        Ok(())
    }

    fn end_att_list(&mut self) -> CbResult {
        Ok(())
    }

    fn attr_def(&mut self, _attr: &AttrDef, _ignored: bool) -> CbResult {
        Ok(())
    }

    fn entity_decl(&mut self, _decl: &EntityDecl, _ignored: bool) -> CbResult {
        Ok(())
    }

    fn notation_decl(&mut self, _decl: &NotationDecl, _ignored: bool) -> CbResult {
        Ok(())
    }

    fn text_decl(&mut self, _version: &str, _encoding: &str) -> CbResult {
        Ok(())
    }

    fn doctype_ws(&mut self, _text: &str) -> CbResult {
        Ok(())
    }

    fn doctype_comment(&mut self, _text: &str) -> CbResult {
        Ok(())
    }

    fn doctype_pi(&mut self, _target: &str, _value: &str) -> CbResult {
        Ok(())
    }

    fn reset_doc_type(&mut self) {}
}

pub trait XmlEntityEvents {
    fn start_entity(&mut self, _decl: &EntityDecl) -> CbResult {
        Ok(())
    }

    fn end_entity(&mut self, _decl: &EntityDecl) -> CbResult {
        Ok(())
    }

    fn reset_entities(&mut self) {}
}

pub trait XmlErrorEvents {
    fn handle_error(&mut self, _diag: &XmlDiag) -> CbResult {
        Ok(())
    }

    fn reset_errors(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_cover_content_events() {
        let flags = XmlParseFlags::default();
        assert!(flags.contains(XmlParseFlags::TAGS));
        assert!(flags.contains(XmlParseFlags::CHARS));
        assert!(!flags.contains(XmlParseFlags::TOPOLOGY));
    }

    #[test]
    fn all_is_the_union() {
        assert_eq!(XmlParseFlags::ALL, XmlParseFlags::all());
    }
}
