//! Content models: the parse-time spec AST and the compiled runtime
//! checkers used to validate element content.

mod dfa;
mod mixed;
mod spec;

pub use dfa::ChildModel;
pub use mixed::MixedModel;
pub use spec::CmSpecNode;

/// Reserved pseudo element ids used by the DFA compiler. They behave like
/// element ids in position sets but never name a real declaration.
pub(crate) const EOC_ID: u32 = u32::MAX - 1;
pub(crate) const EPSILON_ID: u32 = u32::MAX - 2;

/// Outcome of validating a child sequence against a content model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidRes {
    Success,
    /// A child was not acceptable at this point; `at` is its index.
    Mismatch { at: usize },
    /// Content ended before the model was satisfied.
    TooFew,
    /// Content was present where none is allowed.
    TooMany,
}

/// A compiled content model, ready for runtime validation.
#[derive(Clone, Debug)]
pub enum ContentModel {
    Any,
    Empty,
    Mixed(MixedModel),
    Children(ChildModel),
}

impl ContentModel {
    pub fn validate(&self, child_ids: &[u32]) -> ValidRes {
        match self {
            ContentModel::Any => ValidRes::Success,
            ContentModel::Empty => {
                if child_ids.is_empty() {
                    ValidRes::Success
                } else {
                    ValidRes::TooMany
                }
            }
            ContentModel::Mixed(mixed) => mixed.validate(child_ids),
            ContentModel::Children(dfa) => dfa.validate(child_ids),
        }
    }
}
