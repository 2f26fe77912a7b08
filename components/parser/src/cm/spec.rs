//! The content-spec AST built while parsing a parenthesised content model.
//!
//! Strictly a tree: each node owns its children, so cyclic references are
//! impossible by construction. The tree is owned by the element declaration
//! until the model is compiled, then dropped.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmSpecNode {
    Leaf { elem_id: u32 },
    Seq(Box<CmSpecNode>, Box<CmSpecNode>),
    Alt(Box<CmSpecNode>, Box<CmSpecNode>),
    ZeroOrOne(Box<CmSpecNode>),
    ZeroOrMore(Box<CmSpecNode>),
    OneOrMore(Box<CmSpecNode>),
}

impl CmSpecNode {
    pub fn leaf(elem_id: u32) -> Self {
        CmSpecNode::Leaf { elem_id }
    }

    pub fn seq(left: CmSpecNode, right: CmSpecNode) -> Self {
        CmSpecNode::Seq(Box::new(left), Box::new(right))
    }

    pub fn alt(left: CmSpecNode, right: CmSpecNode) -> Self {
        CmSpecNode::Alt(Box::new(left), Box::new(right))
    }

    pub fn opt(child: CmSpecNode) -> Self {
        CmSpecNode::ZeroOrOne(Box::new(child))
    }

    pub fn rep(child: CmSpecNode) -> Self {
        CmSpecNode::ZeroOrMore(Box::new(child))
    }

    pub fn plus(child: CmSpecNode) -> Self {
        CmSpecNode::OneOrMore(Box::new(child))
    }
}
