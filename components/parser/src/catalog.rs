//! Public-id catalog: maps public ids to entity sources so external
//! entities can be satisfied without touching their system ids.

use std::collections::HashMap;
use std::rc::Rc;

use crate::source::{EntityResolver, EntitySource, ResolveKind};

/// The fixed DTD of the XML file format that backs a standard catalog.
pub const CATALOG_DTD: &str = "<?xml encoding='UTF-8'?>\n\
<!ELEMENT CIDStdCat:Catalog (CIDStdCat:MapItem*)>\n\
<!ELEMENT CIDStdCat:MapItem EMPTY>\n\
<!ATTLIST CIDStdCat:MapItem\n\
          CIDStdCat:PublicId CDATA #REQUIRED\n\
          CIDStdCat:MapTo CDATA #REQUIRED>\n";

/// Element and attribute names of the catalog file format.
pub const CATALOG_ROOT: &str = "CIDStdCat:Catalog";
pub const CATALOG_MAP_ITEM: &str = "CIDStdCat:MapItem";
pub const CATALOG_PUBLIC_ID: &str = "CIDStdCat:PublicId";
pub const CATALOG_MAP_TO: &str = "CIDStdCat:MapTo";

#[derive(Default)]
pub struct XmlCatalog {
    map: HashMap<String, Rc<dyn EntitySource>>,
}

impl XmlCatalog {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Maps a public id; an existing mapping is replaced.
    pub fn add(&mut self, public_id: impl ToString, src: Rc<dyn EntitySource>) {
        self.map.insert(public_id.to_string(), src);
    }

    pub fn remove(&mut self, public_id: &str) -> bool {
        self.map.remove(public_id).is_some()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn lookup(&self, public_id: &str) -> Option<Rc<dyn EntitySource>> {
        self.map.get(public_id).cloned()
    }
}

impl EntityResolver for XmlCatalog {
    fn resolve(
        &mut self,
        public_id: &str,
        _system_id: &str,
        _entity_name: &str,
        _parent_system_id: &str,
        _kind: ResolveKind,
    ) -> Option<Rc<dyn EntitySource>> {
        if public_id.is_empty() {
            return None;
        }
        self.lookup(public_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemBufEntitySrc;

    #[test]
    fn add_lookup_remove() {
        let mut cat = XmlCatalog::new();
        let src: Rc<dyn EntitySource> =
            Rc::new(MemBufEntitySrc::new("mem://dtd", b"<!ELEMENT r EMPTY>".to_vec()));
        cat.add("-//Test//EN", src);
        assert!(cat.lookup("-//Test//EN").is_some());
        assert!(cat.lookup("-//Other//EN").is_none());
        assert!(cat.remove("-//Test//EN"));
        assert!(!cat.remove("-//Test//EN"));
        assert!(cat.is_empty());
    }

    #[test]
    fn resolver_only_answers_public_ids() {
        let mut cat = XmlCatalog::new();
        let src: Rc<dyn EntitySource> =
            Rc::new(MemBufEntitySrc::new("mem://dtd", Vec::new()));
        cat.add("-//Test//EN", src);
        assert!(cat
            .resolve("-//Test//EN", "ignored.dtd", "", "", ResolveKind::ExternalSubset)
            .is_some());
        assert!(cat
            .resolve("", "file.dtd", "", "", ResolveKind::GeneralEntity)
            .is_none());
    }
}
