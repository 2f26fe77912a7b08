//! The DTD validator: declaration pools and runtime validation.
//!
//! The DTD grammar itself is parsed by the driver (see `core::dtd`), which
//! fills these pools. At runtime the validator answers two questions: is
//! this attribute value legal for its declaration, and is this child
//! sequence legal for its element.

use xvp_chars::XmlChar;

use crate::cm::{ContentModel, ValidRes};
use crate::decls::{AttrDef, AttrType, CreateReason, DefAttrType, ElemDecl, EntityDecl, NotationDecl};
use crate::error::XmlErrCode;
use crate::pool::{NameIdPool, PoolElem};

pub struct DtdValidator {
    pub(crate) elements: NameIdPool<ElemDecl>,
    pub(crate) gen_entities: NameIdPool<EntityDecl>,
    pub(crate) notations: NameIdPool<NotationDecl>,
    pub(crate) param_entities: NameIdPool<EntityDecl>,
    pub(crate) root_elem_id: Option<u32>,
    locked: bool,
}

/// The five predefined character entities, always present and flagged
/// special. Redeclaring one is legal and ignored.
const SPECIAL_ENTITIES: &[(&str, &str)] = &[
    ("amp", "&"),
    ("lt", "<"),
    ("gt", ">"),
    ("quot", "\""),
    ("apos", "'"),
];

impl DtdValidator {
    pub fn new() -> Self {
        let mut validator = Self {
            elements: NameIdPool::new(),
            gen_entities: NameIdPool::new(),
            notations: NameIdPool::new(),
            param_entities: NameIdPool::new(),
            root_elem_id: None,
            locked: false,
        };
        validator.seed_special_entities();
        validator
    }

    fn seed_special_entities(&mut self) {
        for (name, value) in SPECIAL_ENTITIES {
            self.gen_entities.add(EntityDecl::special(name, value));
        }
    }

    /// A locked validator keeps its compiled DTD across parses; the driver
    /// then eats the DOCTYPE without re-interpreting it.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn reset(&mut self) {
        if self.locked {
            return;
        }
        self.elements.remove_all();
        self.gen_entities.remove_all();
        self.notations.remove_all();
        self.param_entities.remove_all();
        self.root_elem_id = None;
        self.seed_special_entities();
    }

    /// Looks up an element by name, faulting in a declaration with the
    /// given creation reason when absent.
    pub fn find_or_fault_elem(&mut self, name: &str, reason: CreateReason) -> u32 {
        match self.elements.by_name(name) {
            Some(id) => id,
            None => self.elements.add(ElemDecl::new(name, reason)),
        }
    }

    pub fn root_elem_id(&self) -> Option<u32> {
        self.root_elem_id
    }

    // --- attribute validation ------------------------------------------

    /// Validates a normalised value against its declaration. `Ok(())` or
    /// the diagnostic to report.
    pub fn validate_attr(&self, def: &AttrDef, value: &str) -> Result<(), (XmlErrCode, String)> {
        if def.def_type() == DefAttrType::Fixed && value != def.value() {
            return Err((
                XmlErrCode::FixedValueMismatch,
                format!("attribute `{}`", def.name()),
            ));
        }

        match def.attr_type() {
            AttrType::Cdata => Ok(()),
            attr_type => {
                if value.is_empty() {
                    return Err((
                        XmlErrCode::BadValueForType,
                        format!("attribute `{}` may not be empty", def.name()),
                    ));
                }
                let tokens: Vec<&str> = value.split(' ').collect();
                if tokens.len() > 1 && !attr_type.is_list() {
                    return Err((
                        XmlErrCode::BadValueForType,
                        format!("attribute `{}` takes a single token", def.name()),
                    ));
                }
                for token in tokens {
                    self.validate_attr_token(def, attr_type, token)?;
                }
                Ok(())
            }
        }
    }

    fn validate_attr_token(
        &self,
        def: &AttrDef,
        attr_type: AttrType,
        token: &str,
    ) -> Result<(), (XmlErrCode, String)> {
        let mut chars = token.chars();
        let first_ok = match chars.next() {
            Some(first) => {
                if attr_type.is_token_type() {
                    first.is_xml_name_char()
                } else {
                    first.is_xml_name_start_char()
                }
            }
            None => false,
        };
        if !first_ok || !chars.all(|c| c.is_xml_name_char()) {
            return Err((
                XmlErrCode::BadValueForType,
                format!("token `{}` of attribute `{}`", token, def.name()),
            ));
        }

        match attr_type {
            AttrType::Entity | AttrType::Entities => {
                let unparsed = self
                    .gen_entities
                    .find(token)
                    .map(|decl| decl.is_unparsed())
                    .unwrap_or(false);
                if !unparsed {
                    return Err((XmlErrCode::EntityAttrNotUnparsed, token.to_string()));
                }
            }
            AttrType::Notation | AttrType::Enumeration => {
                if !def.enum_values().iter().any(|v| v == token) {
                    return Err((XmlErrCode::NotInEnumList, token.to_string()));
                }
            }
            // ID/IDREF cross-reference tracking is deliberately not done;
            // the shape check above is all that applies.
            _ => {}
        }
        Ok(())
    }

    // --- content validation --------------------------------------------

    pub fn validate_content(&self, elem: &ElemDecl, child_ids: &[u32]) -> ValidRes {
        match elem.content_model() {
            Some(model) => model.validate(child_ids),
            None => ContentModel::Any.validate(child_ids),
        }
    }

    // --- declaration-time value normalisation --------------------------

    /// Normalises an attribute value per its type: for CDATA each literal
    /// tab/LF/CR becomes a space; for every other type runs of whitespace
    /// collapse to one space and leading/trailing spaces are stripped.
    pub fn normalize_attr_value(attr_type: AttrType, raw: &str) -> String {
        match attr_type {
            AttrType::Cdata => raw
                .chars()
                .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
                .collect(),
            _ => {
                let mut out = String::with_capacity(raw.len());
                let mut last_space = true;
                for c in raw.chars() {
                    if c == ' ' || c == '\t' || c == '\n' || c == '\r' {
                        if !last_space {
                            out.push(' ');
                            last_space = true;
                        }
                    } else {
                        out.push(c);
                        last_space = false;
                    }
                }
                if out.ends_with(' ') {
                    out.pop();
                }
                out
            }
        }
    }

    // --- post-DTD checks ------------------------------------------------

    /// Runs once the DOCTYPE closes. Reports elements that were mentioned
    /// but never declared (an error for the root, a warning otherwise),
    /// elements with more than one ID attribute, NOTATION attribute values
    /// naming undeclared notations, and NDATA entities naming undeclared
    /// notations.
    pub fn post_dtd_checks(&self, report: &mut dyn FnMut(XmlErrCode, String)) {
        for elem in self.elements.iter() {
            if !elem.is_declared() && elem.reason() != CreateReason::InContent {
                if Some(elem.id()) == self.root_elem_id {
                    report(
                        XmlErrCode::ElementNotDeclared,
                        format!("root element `{}`", elem.name()),
                    );
                } else {
                    report(XmlErrCode::ElementNeverDeclared, elem.name().to_string());
                }
            }

            let id_count = elem
                .attrs()
                .iter()
                .filter(|a| a.attr_type() == AttrType::Id)
                .count();
            if id_count > 1 {
                report(XmlErrCode::MultipleIdAttrs, elem.name().to_string());
            }

            for attr in elem.attrs() {
                if attr.attr_type() == AttrType::Notation {
                    for value in attr.enum_values() {
                        if self.notations.by_name(value).is_none() {
                            report(
                                XmlErrCode::NotationNotDeclared,
                                format!("`{}` in attribute `{}`", value, attr.name()),
                            );
                        }
                    }
                }
            }
        }

        for entity in self.gen_entities.iter() {
            if let Some(notation) = entity.notation() {
                if self.notations.by_name(notation).is_none() {
                    report(
                        XmlErrCode::NotationNotDeclared,
                        format!("`{}` in entity `{}`", notation, entity.name()),
                    );
                }
            }
        }
    }
}

impl Default for DtdValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(attr_type: AttrType, def_type: DefAttrType) -> AttrDef {
        AttrDef::new("a", attr_type, def_type)
    }

    #[test]
    fn special_entities_are_seeded() {
        let validator = DtdValidator::new();
        for (name, value) in SPECIAL_ENTITIES {
            let decl = validator.gen_entities.find(name).unwrap();
            assert!(decl.is_special());
            assert_eq!(decl.value(), Some(*value));
        }
    }

    #[test]
    fn cdata_accepts_anything() {
        let validator = DtdValidator::new();
        let d = def(AttrType::Cdata, DefAttrType::Implied);
        assert!(validator.validate_attr(&d, "anything at all <>&").is_ok());
        assert!(validator.validate_attr(&d, "").is_ok());
    }

    #[test]
    fn fixed_value_must_match() {
        let validator = DtdValidator::new();
        let mut d = def(AttrType::Cdata, DefAttrType::Fixed);
        d.set_value("x");
        assert!(validator.validate_attr(&d, "x").is_ok());
        assert_eq!(
            validator.validate_attr(&d, "y").unwrap_err().0,
            XmlErrCode::FixedValueMismatch
        );
    }

    #[test]
    fn nmtoken_shape() {
        let validator = DtdValidator::new();
        let d = def(AttrType::NmToken, DefAttrType::Implied);
        assert!(validator.validate_attr(&d, "-leading-dash-ok").is_ok());
        assert!(validator.validate_attr(&d, "two tokens").is_err());
        assert!(validator.validate_attr(&d, "").is_err());
        assert!(validator.validate_attr(&d, "ba?d").is_err());
    }

    #[test]
    fn idref_needs_name_start() {
        let validator = DtdValidator::new();
        let d = def(AttrType::IdRef, DefAttrType::Implied);
        assert!(validator.validate_attr(&d, "ok").is_ok());
        assert_eq!(
            validator.validate_attr(&d, "-bad").unwrap_err().0,
            XmlErrCode::BadValueForType
        );
    }

    #[test]
    fn entity_attr_requires_unparsed_entity() {
        let mut validator = DtdValidator::new();
        let d = def(AttrType::Entity, DefAttrType::Implied);
        assert_eq!(
            validator.validate_attr(&d, "img").unwrap_err().0,
            XmlErrCode::EntityAttrNotUnparsed
        );
        let mut decl = EntityDecl::external("img", "", "img.gif");
        decl.set_notation("gif");
        validator.gen_entities.add(decl);
        assert!(validator.validate_attr(&d, "img").is_ok());
        // a parsed internal entity does not qualify
        validator.gen_entities.add(EntityDecl::internal("txt", "v"));
        assert_eq!(
            validator.validate_attr(&d, "txt").unwrap_err().0,
            XmlErrCode::EntityAttrNotUnparsed
        );
    }

    #[test]
    fn enumeration_membership() {
        let validator = DtdValidator::new();
        let mut d = def(AttrType::Enumeration, DefAttrType::Implied);
        d.set_enum_values(vec!["red".to_string(), "blue".to_string()]);
        assert!(validator.validate_attr(&d, "red").is_ok());
        assert_eq!(
            validator.validate_attr(&d, "green").unwrap_err().0,
            XmlErrCode::NotInEnumList
        );
    }

    #[test]
    fn normalisation_is_idempotent() {
        let once = DtdValidator::normalize_attr_value(AttrType::NmTokens, "  foo  bar  ");
        assert_eq!(once, "foo bar");
        let twice = DtdValidator::normalize_attr_value(AttrType::NmTokens, &once);
        assert_eq!(twice, once);

        let cdata = DtdValidator::normalize_attr_value(AttrType::Cdata, "a\tb\nc");
        assert_eq!(cdata, "a b c");
        assert_eq!(
            DtdValidator::normalize_attr_value(AttrType::Cdata, &cdata),
            cdata
        );
    }

    #[test]
    fn post_dtd_reports_undeclared_notation() {
        let mut validator = DtdValidator::new();
        let mut decl = EntityDecl::external("img", "", "img.gif");
        decl.set_notation("gif");
        validator.gen_entities.add(decl);

        let mut reported = Vec::new();
        validator.post_dtd_checks(&mut |code, detail| reported.push((code, detail)));
        assert!(reported
            .iter()
            .any(|(code, _)| *code == XmlErrCode::NotationNotDeclared));
    }

    #[test]
    fn post_dtd_reports_undeclared_root() {
        let mut validator = DtdValidator::new();
        let root = validator.find_or_fault_elem("r", CreateReason::AsRootElem);
        validator.root_elem_id = Some(root);
        let mut reported = Vec::new();
        validator.post_dtd_checks(&mut |code, detail| reported.push((code, detail)));
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, XmlErrCode::ElementNotDeclared);
    }

    #[test]
    fn locked_validator_survives_reset() {
        let mut validator = DtdValidator::new();
        validator.find_or_fault_elem("r", CreateReason::Declared);
        validator.lock();
        validator.reset();
        assert!(validator.elements.by_name("r").is_some());
        validator.unlock();
        validator.reset();
        assert!(validator.elements.by_name("r").is_none());
    }
}
