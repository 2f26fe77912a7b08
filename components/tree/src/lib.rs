//! Tree layer: subscribes to the parser's event stream and materialises an
//! in-memory document of typed nodes, with a restricted `/name[n]/...` path
//! lookup. Also hosts the file-backed standard catalog, whose fixed DTD is
//! embedded in the parser crate.

use std::cell::RefCell;
use std::rc::Rc;

use xvp_parser::{
    CbResult, ElemDecl, EntityResolver, EntitySource, FileEntitySrc, MemBufEntitySrc, ResolveKind,
    XmlAttr, XmlCatalog, XmlDiag, XmlDocEvents, XmlErrorEvents, XmlFatal, XmlLocation,
    XmlParseFlags, XmlParseOpts, XmlParserCore, CATALOG_DTD, CATALOG_MAP_ITEM, CATALOG_MAP_TO,
    CATALOG_PUBLIC_ID, CATALOG_ROOT,
};

/// Node text appended to an existing text node grows its buffer by a
/// quarter, and at least this much, to amortise repeated small appends.
const TEXT_GROW_MIN: usize = 4 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XtAttr {
    pub name: String,
    pub value: String,
    pub explicit: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XtElement {
    pub name: String,
    pub attrs: Vec<XtAttr>,
    pub children: Vec<XtNode>,
}

impl XtElement {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XtNode::Text(text) = child {
                out.push_str(&text.text);
            }
        }
        out
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &XtElement> {
        self.children.iter().filter_map(|node| match node {
            XtNode::Element(elem) => Some(elem),
            _ => None,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XtText {
    pub text: String,
    pub is_cdata: bool,
    pub is_ignorable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XtComment {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XtPI {
    pub target: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XtNode {
    Element(XtElement),
    Text(XtText),
    Comment(XtComment),
    PI(XtPI),
}

/// A parsed document: the root element plus any comments and PIs outside it,
/// in document order.
#[derive(Clone, Debug, Default)]
pub struct XtDocument {
    pub items: Vec<XtNode>,
}

impl XtDocument {
    pub fn root(&self) -> Option<&XtElement> {
        self.items.iter().find_map(|node| match node {
            XtNode::Element(elem) => Some(elem),
            _ => None,
        })
    }

    /// Restricted path lookup: `/name1/name2[n]/name3`, where `[n]` is a
    /// 1-based instance selector among same-named siblings. Returns the
    /// final element and the chain of child indices leading to it.
    pub fn find_path(&self, path: &str) -> Option<(&XtElement, Vec<usize>)> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());

        let (root_name, root_inst) = parse_segment(segments.next()?)?;
        let root = self.root()?;
        if root.name != root_name || root_inst != 1 {
            return None;
        }
        let root_idx = self
            .items
            .iter()
            .position(|node| matches!(node, XtNode::Element(_)))?;

        let mut indices = vec![root_idx];
        let mut current = root;
        for segment in segments {
            let (name, instance) = parse_segment(segment)?;
            let mut seen = 0usize;
            let mut found = None;
            for (idx, node) in current.children.iter().enumerate() {
                if let XtNode::Element(elem) = node {
                    if elem.name == name {
                        seen += 1;
                        if seen == instance {
                            found = Some((idx, elem));
                            break;
                        }
                    }
                }
            }
            let (idx, elem) = found?;
            indices.push(idx);
            current = elem;
        }
        Some((current, indices))
    }
}

fn parse_segment(segment: &str) -> Option<(&str, usize)> {
    if let Some(open) = segment.find('[') {
        if !segment.ends_with(']') {
            return None;
        }
        let name = &segment[..open];
        let num = &segment[open + 1..segment.len() - 1];
        let instance: usize = num.parse().ok()?;
        if name.is_empty() || instance == 0 {
            return None;
        }
        Some((name, instance))
    } else if segment.is_empty() {
        None
    } else {
        Some((segment, 1))
    }
}

/// Event handler that builds the tree. Element and text nodes are recycled
/// through free lists across documents.
#[derive(Default)]
struct TreeBuilder {
    stack: Vec<XtElement>,
    items: Vec<XtNode>,
    free_elems: Vec<XtElement>,
    free_texts: Vec<XtText>,
    diags: Vec<XmlDiag>,
}

impl TreeBuilder {
    fn alloc_element(&mut self, name: &str, attrs: &[XmlAttr]) -> XtElement {
        let mut elem = self.free_elems.pop().unwrap_or_default();
        elem.name.clear();
        elem.name.push_str(name);
        elem.attrs.clear();
        elem.attrs.extend(attrs.iter().map(|a| XtAttr {
            name: a.name().to_string(),
            value: a.value().to_string(),
            explicit: a.explicit(),
        }));
        elem.children.clear();
        elem
    }

    fn alloc_text(&mut self, text: &str, is_cdata: bool, is_ignorable: bool) -> XtText {
        let mut node = self.free_texts.pop().unwrap_or_default();
        node.text.clear();
        node.text.push_str(text);
        node.is_cdata = is_cdata;
        node.is_ignorable = is_ignorable;
        node
    }

    fn recycle(&mut self, node: XtNode) {
        match node {
            XtNode::Element(mut elem) => {
                let children = std::mem::take(&mut elem.children);
                for child in children {
                    self.recycle(child);
                }
                self.free_elems.push(elem);
            }
            XtNode::Text(text) => self.free_texts.push(text),
            XtNode::Comment(_) | XtNode::PI(_) => {}
        }
    }

    fn attach(&mut self, node: XtNode) {
        match self.stack.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.items.push(node),
        }
    }

    fn take_document(&mut self) -> XtDocument {
        // drain any half-open elements left behind by a failed parse
        while let Some(elem) = self.stack.pop() {
            self.attach(XtNode::Element(elem));
        }
        XtDocument {
            items: std::mem::take(&mut self.items),
        }
    }

    fn take_diags(&mut self) -> Vec<XmlDiag> {
        std::mem::take(&mut self.diags)
    }
}

fn append_text(target: &mut String, extra: &str) {
    let needed = target.len() + extra.len();
    if needed > target.capacity() {
        let grown = (target.capacity() + target.capacity() / 4)
            .max(target.capacity() + TEXT_GROW_MIN)
            .max(needed);
        target.reserve(grown - target.len());
    }
    target.push_str(extra);
}

impl XmlDocEvents for TreeBuilder {
    fn start_tag(&mut self, elem: &ElemDecl, attrs: &[XmlAttr], _empty: bool) -> CbResult {
        let node = self.alloc_element(elem.name(), attrs);
        self.stack.push(node);
        Ok(())
    }

    fn end_tag(&mut self, _elem: &ElemDecl) -> CbResult {
        if let Some(elem) = self.stack.pop() {
            self.attach(XtNode::Element(elem));
        }
        Ok(())
    }

    fn doc_characters(
        &mut self,
        text: &str,
        is_cdata: bool,
        is_ignorable: bool,
        _location: XmlLocation,
    ) -> CbResult {
        if let Some(parent) = self.stack.last_mut() {
            if let Some(XtNode::Text(last)) = parent.children.last_mut() {
                append_text(&mut last.text, text);
                return Ok(());
            }
        }
        let node = self.alloc_text(text, is_cdata, is_ignorable);
        self.attach(XtNode::Text(node));
        Ok(())
    }

    fn doc_comment(&mut self, text: &str, _location: XmlLocation) -> CbResult {
        self.attach(XtNode::Comment(XtComment {
            text: text.to_string(),
        }));
        Ok(())
    }

    fn doc_pi(&mut self, target: &str, value: &str, _location: XmlLocation) -> CbResult {
        self.attach(XtNode::PI(XtPI {
            target: target.to_string(),
            value: value.to_string(),
        }));
        Ok(())
    }

    fn reset_document(&mut self) {
        while let Some(elem) = self.stack.pop() {
            self.free_elems.push(elem);
        }
        let items = std::mem::take(&mut self.items);
        for item in items {
            self.recycle(item);
        }
    }
}

impl XmlErrorEvents for TreeBuilder {
    fn handle_error(&mut self, diag: &XmlDiag) -> CbResult {
        self.diags.push(diag.clone());
        Ok(())
    }

    fn reset_errors(&mut self) {
        self.diags.clear();
    }
}

/// A parser that materialises documents as trees.
pub struct XmlTreeParser {
    core: XmlParserCore,
    builder: Rc<RefCell<TreeBuilder>>,
}

impl XmlTreeParser {
    pub fn new() -> Self {
        let builder = Rc::new(RefCell::new(TreeBuilder::default()));
        let mut core = XmlParserCore::new();
        core.set_doc_events(builder.clone());
        core.set_error_events(builder.clone());
        core.set_flags(XmlParseFlags::default());
        Self { core, builder }
    }

    pub fn set_opts(&mut self, opts: XmlParseOpts) {
        self.core.set_opts(opts);
    }

    pub fn set_flags(&mut self, flags: XmlParseFlags) {
        self.core.set_flags(flags);
    }

    pub fn set_entity_resolver(&mut self, resolver: Rc<RefCell<dyn EntityResolver>>) {
        self.core.set_entity_resolver(resolver);
    }

    /// Parses and returns the document tree together with the diagnostics
    /// that fired.
    pub fn parse_root(
        &mut self,
        src: &dyn EntitySource,
    ) -> Result<(XtDocument, Vec<XmlDiag>), XmlFatal> {
        self.core.parse_root(src)?;
        let mut builder = self.builder.borrow_mut();
        let doc = builder.take_document();
        let diags = builder.take_diags();
        Ok((doc, diags))
    }

    pub fn parse_buffer(
        &mut self,
        system_id: &str,
        bytes: &[u8],
    ) -> Result<(XtDocument, Vec<XmlDiag>), XmlFatal> {
        let src = MemBufEntitySrc::new(system_id, bytes.to_vec());
        self.parse_root(&src)
    }
}

impl Default for XmlTreeParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves every external-subset request to the embedded catalog DTD.
struct CatalogDtdResolver;

impl EntityResolver for CatalogDtdResolver {
    fn resolve(
        &mut self,
        _public_id: &str,
        _system_id: &str,
        _entity_name: &str,
        _parent_system_id: &str,
        kind: ResolveKind,
    ) -> Option<Rc<dyn EntitySource>> {
        if kind == ResolveKind::ExternalSubset {
            Some(Rc::new(MemBufEntitySrc::new(
                "builtin://catalog.dtd",
                CATALOG_DTD.as_bytes().to_vec(),
            )))
        } else {
            None
        }
    }
}

/// Loads a standard XML-file-backed catalog: a `CIDStdCat:Catalog` root of
/// `CIDStdCat:MapItem` entries, validated against the embedded DTD. Each
/// entry maps a public id to a file source.
pub fn parse_std_catalog(
    src: &dyn EntitySource,
) -> Result<(XmlCatalog, Vec<XmlDiag>), XmlFatal> {
    let mut parser = XmlTreeParser::new();
    parser.set_opts(XmlParseOpts::VALIDATE);
    parser.set_entity_resolver(Rc::new(RefCell::new(CatalogDtdResolver)));

    let (doc, diags) = parser.parse_root(src)?;

    let mut catalog = XmlCatalog::new();
    if let Some(root) = doc.root() {
        if root.name == CATALOG_ROOT {
            for item in root.child_elements() {
                if item.name != CATALOG_MAP_ITEM {
                    continue;
                }
                if let (Some(public_id), Some(map_to)) =
                    (item.attr(CATALOG_PUBLIC_ID), item.attr(CATALOG_MAP_TO))
                {
                    catalog.add(public_id, Rc::new(FileEntitySrc::new(map_to)));
                }
            }
        }
    }
    Ok((catalog, diags))
}
