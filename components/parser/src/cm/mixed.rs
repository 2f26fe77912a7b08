//! The lightweight checker for `(#PCDATA | a | b | ...)*` models.
//!
//! Recognised syntactically while parsing the model, so no DFA is built:
//! order and repetition do not matter, only membership. Character data is
//! validated at emission time, not here.

use crate::cm::ValidRes;

#[derive(Clone, Debug)]
pub struct MixedModel {
    ids: Vec<u32>,
}

impl MixedModel {
    pub fn new(ids: Vec<u32>) -> Self {
        let mut deduped = Vec::with_capacity(ids.len());
        for id in ids {
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }
        Self { ids: deduped }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// The empty sequence is always acceptable for a mixed model.
    pub fn validate(&self, child_ids: &[u32]) -> ValidRes {
        for (at, id) in child_ids.iter().enumerate() {
            if !self.ids.contains(id) {
                return ValidRes::Mismatch { at };
            }
        }
        ValidRes::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_only() {
        let model = MixedModel::new(vec![3, 7, 3]);
        assert_eq!(model.ids(), &[3, 7]);
        assert_eq!(model.validate(&[]), ValidRes::Success);
        assert_eq!(model.validate(&[7, 3, 7]), ValidRes::Success);
        assert_eq!(model.validate(&[3, 9]), ValidRes::Mismatch { at: 1 });
    }
}
