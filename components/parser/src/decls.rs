//! DTD declaration records: elements, attributes, entities, notations.

use crate::cm::ContentModel;
use crate::pool::PoolElem;

/// Which code path first faulted an element declaration into the pool. Only
/// `Declared` means an `<!ELEMENT>` was actually seen; the others exist so
/// the post-DTD pass can report elements that were used but never declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateReason {
    Declared,
    AsRootElem,
    AsContentModel,
    AsAttList,
    InContent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentModelType {
    Any,
    Empty,
    Mixed,
    Children,
}

/// What character data an element may legally hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextPolicy {
    AnyText,
    SpaceOnly,
    NoText,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrType {
    Cdata,
    Id,
    IdRef,
    IdRefs,
    Entity,
    Entities,
    NmToken,
    NmTokens,
    Notation,
    Enumeration,
}

impl AttrType {
    /// The multi-token types, whose values are whitespace-separated lists.
    pub fn is_list(self) -> bool {
        matches!(self, AttrType::IdRefs | AttrType::Entities | AttrType::NmTokens)
    }

    /// Types whose tokens may start with any name char, not just a
    /// name-start char.
    pub fn is_token_type(self) -> bool {
        matches!(self, AttrType::NmToken | AttrType::NmTokens | AttrType::Enumeration)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefAttrType {
    Required,
    Implied,
    Fixed,
    Default,
}

#[derive(Clone, Debug)]
pub struct AttrDef {
    name: String,
    attr_type: AttrType,
    def_type: DefAttrType,
    value: String,
    enum_values: Vec<String>,
    provided: bool,
}

impl AttrDef {
    pub fn new(name: impl ToString, attr_type: AttrType, def_type: DefAttrType) -> Self {
        Self {
            name: name.to_string(),
            attr_type,
            def_type,
            value: String::new(),
            enum_values: Vec::new(),
            provided: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attr_type(&self) -> AttrType {
        self.attr_type
    }

    pub fn def_type(&self) -> DefAttrType {
        self.def_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl ToString) {
        self.value = value.to_string();
    }

    pub fn enum_values(&self) -> &[String] {
        &self.enum_values
    }

    pub fn set_enum_values(&mut self, values: Vec<String>) {
        self.enum_values = values;
    }

    /// Transient per-start-tag flag, cleared when a new instance of the
    /// owning element begins.
    pub fn provided(&self) -> bool {
        self.provided
    }

    pub fn set_provided(&mut self, provided: bool) {
        self.provided = provided;
    }
}

#[derive(Clone, Debug)]
pub struct ElemDecl {
    name: String,
    id: u32,
    reason: CreateReason,
    model_type: ContentModelType,
    model: Option<ContentModel>,
    attrs: Vec<AttrDef>,
}

impl ElemDecl {
    pub fn new(name: impl ToString, reason: CreateReason) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            reason,
            model_type: ContentModelType::Any,
            model: None,
            attrs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reason(&self) -> CreateReason {
        self.reason
    }

    pub fn set_reason(&mut self, reason: CreateReason) {
        self.reason = reason;
    }

    pub fn is_declared(&self) -> bool {
        self.reason == CreateReason::Declared
    }

    pub fn model_type(&self) -> ContentModelType {
        self.model_type
    }

    pub fn set_model_type(&mut self, model_type: ContentModelType) {
        self.model_type = model_type;
    }

    pub fn content_model(&self) -> Option<&ContentModel> {
        self.model.as_ref()
    }

    pub fn set_content_model(&mut self, model: ContentModel) {
        self.model = Some(model);
    }

    /// Derived from the declared content type; undeclared elements accept
    /// anything.
    pub fn text_policy(&self) -> TextPolicy {
        if !self.is_declared() {
            return TextPolicy::AnyText;
        }
        match self.model_type {
            ContentModelType::Any | ContentModelType::Mixed => TextPolicy::AnyText,
            ContentModelType::Children => TextPolicy::SpaceOnly,
            ContentModelType::Empty => TextPolicy::NoText,
        }
    }

    pub fn attrs(&self) -> &[AttrDef] {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut [AttrDef] {
        &mut self.attrs
    }

    pub fn find_attr(&self, name: &str) -> Option<&AttrDef> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn find_attr_mut(&mut self, name: &str) -> Option<&mut AttrDef> {
        self.attrs.iter_mut().find(|a| a.name == name)
    }

    /// First declaration wins; returns false if the attribute was already
    /// declared.
    pub fn add_attr(&mut self, attr: AttrDef) -> bool {
        if self.find_attr(attr.name()).is_some() {
            return false;
        }
        self.attrs.push(attr);
        true
    }

    pub fn clear_provided_flags(&mut self) {
        for attr in &mut self.attrs {
            attr.provided = false;
        }
    }
}

impl PoolElem for ElemDecl {
    fn key(&self) -> &str {
        &self.name
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }
}

#[derive(Clone, Debug)]
pub struct EntityDecl {
    name: String,
    id: u32,
    value: Option<String>,
    public_id: String,
    system_id: String,
    notation: Option<String>,
    special: bool,
    is_pe: bool,
    from_int_subset: bool,
}

impl EntityDecl {
    pub fn internal(name: impl ToString, value: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            value: Some(value.to_string()),
            public_id: String::new(),
            system_id: String::new(),
            notation: None,
            special: false,
            is_pe: false,
            from_int_subset: false,
        }
    }

    pub fn external(
        name: impl ToString,
        public_id: impl ToString,
        system_id: impl ToString,
    ) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            value: None,
            public_id: public_id.to_string(),
            system_id: system_id.to_string(),
            notation: None,
            special: false,
            is_pe: false,
            from_int_subset: false,
        }
    }

    /// One of the five predefined character entities.
    pub(crate) fn special(name: &str, value: &str) -> Self {
        let mut decl = Self::internal(name, value);
        decl.special = true;
        decl
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn notation(&self) -> Option<&str> {
        self.notation.as_deref()
    }

    pub fn set_notation(&mut self, notation: impl ToString) {
        self.notation = Some(notation.to_string());
    }

    pub fn is_special(&self) -> bool {
        self.special
    }

    pub fn is_parameter(&self) -> bool {
        self.is_pe
    }

    pub fn set_parameter(&mut self, is_pe: bool) {
        self.is_pe = is_pe;
    }

    pub fn from_internal_subset(&self) -> bool {
        self.from_int_subset
    }

    pub fn set_from_internal_subset(&mut self, from: bool) {
        self.from_int_subset = from;
    }

    pub fn is_internal(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_external(&self) -> bool {
        self.value.is_none()
    }

    /// Unparsed entities carry an NDATA notation and may only appear as the
    /// value of an ENTITY/ENTITIES attribute.
    pub fn is_unparsed(&self) -> bool {
        self.notation.is_some()
    }
}

impl PoolElem for EntityDecl {
    fn key(&self) -> &str {
        &self.name
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }
}

#[derive(Clone, Debug)]
pub struct NotationDecl {
    name: String,
    id: u32,
    public_id: String,
    system_id: String,
}

impl NotationDecl {
    pub fn new(name: impl ToString, public_id: impl ToString, system_id: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            public_id: public_id.to_string(),
            system_id: system_id.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }
}

impl PoolElem for NotationDecl {
    fn key(&self) -> &str {
        &self.name
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn set_id(&mut self, id: u32) {
        self.id = id;
    }
}
