//! Compiles a children-mode content model into a DFA.
//!
//! Classic Aho/Sethi/Ullman construction: the spec tree is rewritten into a
//! normalised form (`+` and `?` eliminated, the whole model wrapped with a
//! distinguished end-of-content leaf), leaves are numbered left to right,
//! firstpos/lastpos/followpos are computed over position bitsets, and subset
//! construction yields the transition table.

use std::collections::HashMap;

use crate::cm::spec::CmSpecNode;
use crate::cm::{ValidRes, EOC_ID, EPSILON_ID};

/// "no transition" sentinel in the table.
const NO_TRANS: u32 = u32::MAX;

#[derive(Clone, Debug)]
pub struct ChildModel {
    /// Column labels: the distinct element ids of the model, in first-seen
    /// order.
    elem_list: Vec<u32>,
    /// `trans[state * elem_list.len() + col]`, `NO_TRANS` when absent.
    trans: Vec<u32>,
    finals: Vec<bool>,
    accepts_empty: bool,
}

/// Rewritten node set: only leaves, sequences, alternations and `*` remain.
/// A leaf holds its numbered position, or none for epsilon.
enum RNode {
    Leaf(Option<usize>),
    Seq(Box<RNode>, Box<RNode>),
    Alt(Box<RNode>, Box<RNode>),
    Rep(Box<RNode>),
}

struct Rewriter {
    /// Element id per numbered leaf position.
    leaf_ids: Vec<u32>,
}

impl Rewriter {
    fn make_leaf(&mut self, elem_id: u32) -> RNode {
        if elem_id == EPSILON_ID {
            return RNode::Leaf(None);
        }
        let pos = self.leaf_ids.len();
        self.leaf_ids.push(elem_id);
        RNode::Leaf(Some(pos))
    }

    fn rewrite(&mut self, node: &CmSpecNode) -> RNode {
        match node {
            CmSpecNode::Leaf { elem_id } => self.make_leaf(*elem_id),
            CmSpecNode::Seq(l, r) => {
                RNode::Seq(Box::new(self.rewrite(l)), Box::new(self.rewrite(r)))
            }
            CmSpecNode::Alt(l, r) => {
                RNode::Alt(Box::new(self.rewrite(l)), Box::new(self.rewrite(r)))
            }
            // X? == X | epsilon
            CmSpecNode::ZeroOrOne(c) => RNode::Alt(
                Box::new(self.rewrite(c)),
                Box::new(self.make_leaf(EPSILON_ID)),
            ),
            CmSpecNode::ZeroOrMore(c) => RNode::Rep(Box::new(self.rewrite(c))),
            // X+ == X , X*  with the copy getting fresh positions
            CmSpecNode::OneOrMore(c) => RNode::Seq(
                Box::new(self.rewrite(c)),
                Box::new(RNode::Rep(Box::new(self.rewrite(c)))),
            ),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PosSet {
    bits: Box<[u64]>,
}

impl PosSet {
    fn empty(leaf_count: usize) -> Self {
        Self {
            bits: vec![0u64; (leaf_count + 63) / 64].into_boxed_slice(),
        }
    }

    fn set(&mut self, pos: usize) {
        self.bits[pos / 64] |= 1 << (pos % 64);
    }

    fn test(&self, pos: usize) -> bool {
        self.bits[pos / 64] & (1 << (pos % 64)) != 0
    }

    fn or_with(&mut self, other: &PosSet) {
        for (word, src) in self.bits.iter_mut().zip(other.bits.iter()) {
            *word |= src;
        }
    }

    fn is_empty(&self) -> bool {
        self.bits.iter().all(|&word| word == 0)
    }

    fn positions<'a>(&'a self) -> impl Iterator<Item = usize> + 'a {
        self.bits.iter().enumerate().flat_map(|(wi, &word)| {
            (0..64usize)
                .filter(move |&bit| word & (1u64 << bit) != 0)
                .map(move |bit| wi * 64 + bit)
        })
    }
}

struct Facts {
    nullable: bool,
    first: PosSet,
    last: PosSet,
}

/// One bottom-up pass computing nullable/firstpos/lastpos and accumulating
/// followpos at the Seq and Rep nodes.
fn analyze(node: &RNode, leaf_count: usize, follow: &mut [PosSet]) -> Facts {
    match node {
        RNode::Leaf(pos) => {
            let mut first = PosSet::empty(leaf_count);
            let mut last = PosSet::empty(leaf_count);
            match pos {
                Some(p) => {
                    first.set(*p);
                    last.set(*p);
                    Facts {
                        nullable: false,
                        first,
                        last,
                    }
                }
                None => Facts {
                    nullable: true,
                    first,
                    last,
                },
            }
        }
        RNode::Seq(l, r) => {
            let fl = analyze(l, leaf_count, follow);
            let fr = analyze(r, leaf_count, follow);
            for p in fl.last.positions() {
                follow[p].or_with(&fr.first);
            }
            let mut first = fl.first;
            if fl.nullable {
                first.or_with(&fr.first);
            }
            let mut last = fr.last;
            if fr.nullable {
                last.or_with(&fl.last);
            }
            Facts {
                nullable: fl.nullable && fr.nullable,
                first,
                last,
            }
        }
        RNode::Alt(l, r) => {
            let fl = analyze(l, leaf_count, follow);
            let fr = analyze(r, leaf_count, follow);
            let mut first = fl.first;
            first.or_with(&fr.first);
            let mut last = fl.last;
            last.or_with(&fr.last);
            Facts {
                nullable: fl.nullable || fr.nullable,
                first,
                last,
            }
        }
        RNode::Rep(c) => {
            let fc = analyze(c, leaf_count, follow);
            for p in fc.last.positions() {
                follow[p].or_with(&fc.first);
            }
            Facts {
                nullable: true,
                first: fc.first,
                last: fc.last,
            }
        }
    }
}

fn nullable(node: &RNode) -> bool {
    match node {
        RNode::Leaf(pos) => pos.is_none(),
        RNode::Seq(l, r) => nullable(l) && nullable(r),
        RNode::Alt(l, r) => nullable(l) || nullable(r),
        RNode::Rep(_) => true,
    }
}

impl ChildModel {
    pub fn compile(spec: &CmSpecNode) -> Self {
        let mut rewriter = Rewriter {
            leaf_ids: Vec::new(),
        };
        let body = rewriter.rewrite(spec);
        let accepts_empty = nullable(&body);
        let eoc = rewriter.make_leaf(EOC_ID);
        let root = RNode::Seq(Box::new(body), Box::new(eoc));

        let leaf_ids = rewriter.leaf_ids;
        let leaf_count = leaf_ids.len();
        let eoc_pos = leaf_count - 1;

        let mut follow = vec![PosSet::empty(leaf_count); leaf_count];
        let root_facts = analyze(&root, leaf_count, &mut follow);

        // Column labels: dedup the real element ids in first-seen order. The
        // end-of-content id never appears as input, so it gets no column.
        let mut elem_list: Vec<u32> = Vec::new();
        for &id in leaf_ids.iter().take(eoc_pos) {
            if !elem_list.contains(&id) {
                elem_list.push(id);
            }
        }
        let ncols = elem_list.len();

        let mut states: Vec<PosSet> = vec![root_facts.first.clone()];
        let mut index: HashMap<PosSet, u32> = HashMap::new();
        index.insert(root_facts.first, 0);
        let mut trans: Vec<u32> = Vec::with_capacity(4 * leaf_count * ncols.max(1));

        let mut cur = 0usize;
        while cur < states.len() {
            let cur_set = states[cur].clone();
            let row_base = trans.len();
            trans.resize(row_base + ncols, NO_TRANS);
            for (col, &eid) in elem_list.iter().enumerate() {
                let mut target = PosSet::empty(leaf_count);
                for p in cur_set.positions() {
                    if leaf_ids[p] == eid {
                        target.or_with(&follow[p]);
                    }
                }
                if target.is_empty() {
                    continue;
                }
                let next = match index.get(&target) {
                    Some(&id) => id,
                    None => {
                        let id = states.len() as u32;
                        states.push(target.clone());
                        index.insert(target, id);
                        id
                    }
                };
                trans[row_base + col] = next;
            }
            cur += 1;
        }

        let finals = states.iter().map(|s| s.test(eoc_pos)).collect();

        Self {
            elem_list,
            trans,
            finals,
            accepts_empty,
        }
    }

    pub fn accepts_empty(&self) -> bool {
        self.accepts_empty
    }

    pub fn elem_ids(&self) -> &[u32] {
        &self.elem_list
    }

    /// Walks the DFA over the child sequence. The column for each id is
    /// found by linear scan; the list is never longer than the leaf count.
    pub fn validate(&self, child_ids: &[u32]) -> ValidRes {
        if child_ids.is_empty() {
            return if self.accepts_empty {
                ValidRes::Success
            } else {
                ValidRes::TooFew
            };
        }

        let ncols = self.elem_list.len();
        let mut state = 0usize;
        for (at, &id) in child_ids.iter().enumerate() {
            let col = match self.elem_list.iter().position(|&e| e == id) {
                Some(col) => col,
                None => return ValidRes::Mismatch { at },
            };
            let next = self.trans[state * ncols + col];
            if next == NO_TRANS {
                return ValidRes::Mismatch { at };
            }
            state = next as usize;
        }

        if self.finals[state] {
            ValidRes::Success
        } else {
            ValidRes::TooFew
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cm::spec::CmSpecNode as N;

    // <!ELEMENT p (a,b?,c+)>
    fn abc_model() -> ChildModel {
        let spec = N::seq(
            N::leaf(1),
            N::seq(N::opt(N::leaf(2)), N::plus(N::leaf(3))),
        );
        ChildModel::compile(&spec)
    }

    #[test]
    fn seq_with_opt_and_plus() {
        let model = abc_model();
        assert_eq!(model.validate(&[1, 3]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 2, 3]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 2, 3, 3, 3]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 3, 2]), ValidRes::Mismatch { at: 2 });
        assert_eq!(model.validate(&[1]), ValidRes::TooFew);
        assert_eq!(model.validate(&[]), ValidRes::TooFew);
        assert_eq!(model.validate(&[2]), ValidRes::Mismatch { at: 0 });
    }

    #[test]
    fn alternation() {
        // (a|b)*
        let spec = N::rep(N::alt(N::leaf(1), N::leaf(2)));
        let model = ChildModel::compile(&spec);
        assert!(model.accepts_empty());
        assert_eq!(model.validate(&[]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 2, 2, 1]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 9]), ValidRes::Mismatch { at: 1 });
    }

    #[test]
    fn nested_groups() {
        // (a,(b|c))+
        let spec = N::plus(N::seq(N::leaf(1), N::alt(N::leaf(2), N::leaf(3))));
        let model = ChildModel::compile(&spec);
        assert!(!model.accepts_empty());
        assert_eq!(model.validate(&[1, 2]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 3, 1, 2]), ValidRes::Success);
        assert_eq!(model.validate(&[1]), ValidRes::TooFew);
        assert_eq!(model.validate(&[1, 2, 1]), ValidRes::TooFew);
        assert_eq!(model.validate(&[2]), ValidRes::Mismatch { at: 0 });
    }

    #[test]
    fn empty_acceptance_matches_nullability() {
        // a?
        let spec = N::opt(N::leaf(1));
        let model = ChildModel::compile(&spec);
        assert!(model.accepts_empty());
        assert_eq!(model.validate(&[]), ValidRes::Success);
        assert_eq!(model.validate(&[1]), ValidRes::Success);
        assert_eq!(model.validate(&[1, 1]), ValidRes::Mismatch { at: 1 });
    }

    #[test]
    fn repeated_name_shares_a_column() {
        // (a,a)
        let spec = N::seq(N::leaf(1), N::leaf(1));
        let model = ChildModel::compile(&spec);
        assert_eq!(model.elem_ids(), &[1]);
        assert_eq!(model.validate(&[1, 1]), ValidRes::Success);
        assert_eq!(model.validate(&[1]), ValidRes::TooFew);
        assert_eq!(model.validate(&[1, 1, 1]), ValidRes::Mismatch { at: 2 });
    }
}
