//! An attribute instance as reported on a start tag.

use crate::decls::AttrType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlAttr {
    name: String,
    value: String,
    attr_type: AttrType,
    explicit: bool,
}

impl XmlAttr {
    pub fn new(
        name: impl ToString,
        value: impl ToString,
        attr_type: AttrType,
        explicit: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            attr_type,
            explicit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The fully normalised value.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn attr_type(&self) -> AttrType {
        self.attr_type
    }

    /// False when the value was injected from the declaration default.
    pub fn explicit(&self) -> bool {
        self.explicit
    }
}
