//! The entity manager: a stack of spoolers multiplexed into one logical
//! character stream.
//!
//! Most operations delegate to the top spooler; when it drains, the manager
//! pops it, fires the end-of-entity event and retries on the next one down.
//! While the throw-at-end mode is armed, draining a spooler that carries an
//! entity declaration instead raises `Interrupt::EndOfEntity` so the caller
//! can flush buffered character data at the entity boundary.

use std::rc::Rc;

use log::trace;

use crate::decls::EntityDecl;
use crate::error::{Interrupt, PRes};
use crate::source::EntitySource;
use crate::spooler::{EntityKind, EntitySpooler, RefFrom, StagedDiag, CH_EOF};

pub(crate) enum PushOutcome {
    Pushed(Vec<StagedDiag>),
    /// The entity's name is already on the stack.
    Recursive,
}

pub(crate) struct EntityMgr {
    stack: Vec<EntitySpooler>,
    throw_at_end: bool,
    next_id: u32,
    ignore_bad_chars: bool,
    /// Position of the last popped spooler, reported while the stack is
    /// empty.
    last_pos: (u32, u32, String),
}

impl EntityMgr {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            throw_at_end: false,
            next_id: 0,
            ignore_bad_chars: false,
            last_pos: (1, 1, String::new()),
        }
    }

    pub fn reset(&mut self) {
        self.stack.clear();
        self.throw_at_end = false;
        self.next_id = 0;
        self.last_pos = (1, 1, String::new());
    }

    pub fn set_ignore_bad_chars(&mut self, ignore: bool) {
        self.ignore_bad_chars = ignore;
    }

    /// Arms or disarms throw-at-end; returns the previous setting so scoped
    /// callers can restore it.
    pub fn set_throw_at_end(&mut self, throw: bool) -> bool {
        std::mem::replace(&mut self.throw_at_end, throw)
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    fn next_spooler_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn make_from_source(
        &mut self,
        src: &dyn EntitySource,
        decl: Option<Rc<EntityDecl>>,
        kind: EntityKind,
        from: RefFrom,
    ) -> std::io::Result<EntitySpooler> {
        let id = self.next_spooler_id();
        EntitySpooler::from_source(src, decl, id, kind, from, self.ignore_bad_chars)
    }

    pub fn make_from_internal(
        &mut self,
        decl: Rc<EntityDecl>,
        kind: EntityKind,
        from: RefFrom,
    ) -> EntitySpooler {
        let id = self.next_spooler_id();
        let value = decl.value().unwrap_or("").to_string();
        EntitySpooler::from_internal(decl, &value, id, kind, from)
    }

    /// Pushes a spooler after checking the stack for a declaration of the
    /// same entity name, which would mean runaway recursion.
    pub fn push_entity(&mut self, mut spooler: EntitySpooler) -> PushOutcome {
        if let Some(decl) = spooler.decl() {
            let name = decl.name();
            let recursive = self
                .stack
                .iter()
                .any(|sp| sp.decl().map(|d| d.name() == name).unwrap_or(false));
            if recursive {
                return PushOutcome::Recursive;
            }
        }
        trace!("push entity spooler {} ({})", spooler.id(), spooler.system_id());
        let staged = spooler.take_staged();
        self.stack.push(spooler);
        PushOutcome::Pushed(staged)
    }

    /// Pops the top spooler. Returns the declaration of the entity that
    /// ended (if it had one) so the caller can fire the end-of-entity event,
    /// or `None` when the stack was already empty. Raises the end-of-entity
    /// interrupt when armed.
    fn pop_entity(&mut self) -> PRes<Option<Option<Rc<EntityDecl>>>> {
        let spooler = match self.stack.pop() {
            Some(spooler) => spooler,
            None => return Ok(None),
        };
        trace!("pop entity spooler {} ({})", spooler.id(), spooler.system_id());
        self.last_pos = (
            spooler.line(),
            spooler.col(),
            spooler.system_id().to_string(),
        );
        let decl = spooler.decl().cloned();
        if self.throw_at_end {
            if let Some(decl) = decl {
                return Err(Interrupt::EndOfEntity {
                    decl,
                    spooler_id: spooler.id(),
                });
            }
            return Ok(Some(None));
        }
        Ok(Some(decl))
    }

    /// Pops the top spooler and hands back the ended declaration without any
    /// throw-at-end handling; used by the driver's janitor when unwinding.
    pub fn pop_entity_quiet(&mut self) -> Option<Option<Rc<EntityDecl>>> {
        let spooler = self.stack.pop()?;
        self.last_pos = (
            spooler.line(),
            spooler.col(),
            spooler.system_id().to_string(),
        );
        Some(spooler.decl().cloned())
    }

    pub fn top_ref(&self) -> Option<&EntitySpooler> {
        self.stack.last()
    }

    // --- delegating operations, with pop-and-retry -------------------

    /// Each pop produces the ended entity declaration so the caller can
    /// report it; `ended` collects them in pop order.
    pub fn peek_next(&mut self, ended: &mut Vec<Rc<EntityDecl>>) -> PRes<char> {
        loop {
            if let Some(spooler) = self.stack.last() {
                if !spooler.at_end() {
                    return Ok(spooler.peek_next());
                }
            } else {
                return Ok(CH_EOF);
            }
            match self.pop_entity()? {
                Some(Some(decl)) => ended.push(decl),
                Some(None) => {}
                None => return Ok(CH_EOF),
            }
        }
    }

    pub fn get_next(&mut self, ended: &mut Vec<Rc<EntityDecl>>) -> PRes<char> {
        loop {
            if let Some(spooler) = self.stack.last_mut() {
                if !spooler.at_end() {
                    return Ok(spooler.get_next());
                }
            } else {
                return Ok(CH_EOF);
            }
            match self.pop_entity()? {
                Some(Some(decl)) => ended.push(decl),
                Some(None) => {}
                None => return Ok(CH_EOF),
            }
        }
    }

    pub fn get_next_if_not(
        &mut self,
        not: char,
        ended: &mut Vec<Rc<EntityDecl>>,
    ) -> PRes<Option<char>> {
        let ch = self.peek_next(ended)?;
        if ch == CH_EOF || ch == not {
            return Ok(None);
        }
        Ok(Some(self.get_next(ended)?))
    }

    pub fn skipped_char(&mut self, to_skip: char, ended: &mut Vec<Rc<EntityDecl>>) -> PRes<bool> {
        if self.peek_next(ended)? == to_skip {
            self.get_next(ended)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// String matches never cross an entity boundary.
    pub fn skipped_string(&mut self, to_skip: &str, ended: &mut Vec<Rc<EntityDecl>>) -> PRes<bool> {
        self.peek_next(ended)?;
        match self.stack.last_mut() {
            Some(spooler) => Ok(spooler.skipped_string(to_skip)),
            None => Ok(false),
        }
    }

    pub fn skipped_quote(&mut self, ended: &mut Vec<Rc<EntityDecl>>) -> PRes<Option<char>> {
        match self.peek_next(ended)? {
            q @ '"' | q @ '\'' => {
                self.get_next(ended)?;
                Ok(Some(q))
            }
            _ => Ok(None),
        }
    }

    /// Skips whitespace; with `cross_entities` the skip continues through
    /// end-of-entity boundaries, otherwise it stops at the first one.
    pub fn skipped_spaces(
        &mut self,
        cross_entities: bool,
        ended: &mut Vec<Rc<EntityDecl>>,
    ) -> PRes<bool> {
        let mut skipped = false;
        loop {
            let hit_end = match self.stack.last_mut() {
                Some(spooler) => {
                    let (advanced, hit_end) = spooler.skip_spaces();
                    skipped |= advanced;
                    hit_end
                }
                None => return Ok(skipped),
            };
            if !hit_end || (!cross_entities && skipped) {
                return Ok(skipped);
            }
            match self.pop_entity()? {
                Some(Some(decl)) => ended.push(decl),
                Some(None) => {}
                None => return Ok(skipped),
            }
        }
    }

    /// Reads a Name (or Nmtoken) from the top spooler; names never cross
    /// entity boundaries.
    pub fn get_name(
        &mut self,
        allow_leading_nonstart: bool,
        ended: &mut Vec<Rc<EntityDecl>>,
    ) -> PRes<Option<String>> {
        self.peek_next(ended)?;
        match self.stack.last_mut() {
            Some(spooler) => Ok(spooler.get_name(allow_leading_nonstart)),
            None => Ok(None),
        }
    }

    pub fn peek_ahead(&self, n: usize) -> Option<char> {
        self.top_ref().and_then(|spooler| spooler.peek_ahead(n))
    }

    // --- position and identity ----------------------------------------

    pub fn current_spooler_id(&self) -> u32 {
        self.top_ref().map(|sp| sp.id()).unwrap_or(0)
    }

    /// `(line, col, system_id)` of the top spooler, falling back to the
    /// position where the last spooler ended.
    pub fn position(&self) -> (u32, u32, String) {
        match self.top_ref() {
            Some(spooler) => (
                spooler.line(),
                spooler.col(),
                spooler.system_id().to_string(),
            ),
            None => self.last_pos.clone(),
        }
    }

    /// Walks down to the nearest external entity; relative system ids of
    /// newly referenced entities resolve against it.
    pub fn last_external_system_id(&self) -> Option<String> {
        self.stack
            .iter()
            .rev()
            .find(|sp| sp.is_external())
            .map(|sp| sp.system_id().to_string())
    }

    pub fn set_decl_encoding(&mut self, name: &str) -> Result<(), crate::error::XmlErrCode> {
        match self.stack.last_mut() {
            Some(spooler) => spooler.set_decl_encoding(name),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemBufEntitySrc;

    fn push_text(mgr: &mut EntityMgr, text: &str, decl: Option<Rc<EntityDecl>>) {
        let src = MemBufEntitySrc::new("mem://t", text.as_bytes().to_vec());
        let spooler = mgr
            .make_from_source(&src, decl, EntityKind::Neither, RefFrom::OutsideLiteral)
            .unwrap();
        match mgr.push_entity(spooler) {
            PushOutcome::Pushed(_) => {}
            PushOutcome::Recursive => panic!("unexpected recursion"),
        }
    }

    #[test]
    fn pops_through_to_lower_entities() {
        let mut mgr = EntityMgr::new();
        let mut ended = Vec::new();
        push_text(&mut mgr, "cd", None);
        push_text(&mut mgr, "ab", None);
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('a'));
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('b'));
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('c'));
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('d'));
        assert_eq!(mgr.get_next(&mut ended).ok(), Some(CH_EOF));
        assert!(mgr.is_empty());
    }

    #[test]
    fn recursion_is_detected() {
        let mut mgr = EntityMgr::new();
        let decl = Rc::new(EntityDecl::internal("e", "text"));
        let spooler = mgr.make_from_internal(decl.clone(), EntityKind::General, RefFrom::OutsideLiteral);
        assert!(matches!(mgr.push_entity(spooler), PushOutcome::Pushed(_)));
        let again = mgr.make_from_internal(decl, EntityKind::General, RefFrom::OutsideLiteral);
        assert!(matches!(mgr.push_entity(again), PushOutcome::Recursive));
    }

    #[test]
    fn throw_at_end_raises_for_declared_entities() {
        let mut mgr = EntityMgr::new();
        let mut ended = Vec::new();
        push_text(&mut mgr, "x", None);
        let decl = Rc::new(EntityDecl::internal("e", "a"));
        let spooler = mgr.make_from_internal(decl, EntityKind::General, RefFrom::OutsideLiteral);
        assert!(matches!(mgr.push_entity(spooler), PushOutcome::Pushed(_)));

        mgr.set_throw_at_end(true);
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('a'));
        match mgr.get_next(&mut ended) {
            Err(Interrupt::EndOfEntity { decl, .. }) => assert_eq!(decl.name(), "e"),
            _ => panic!("expected end-of-entity interrupt"),
        }
        // the entity was popped by the interrupt; the outer one continues
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('x'));
    }

    #[test]
    fn end_of_entity_events_collected_without_throw() {
        let mut mgr = EntityMgr::new();
        let mut ended = Vec::new();
        push_text(&mut mgr, "x", None);
        let decl = Rc::new(EntityDecl::internal("e", "a"));
        let spooler = mgr.make_from_internal(decl, EntityKind::General, RefFrom::OutsideLiteral);
        assert!(matches!(mgr.push_entity(spooler), PushOutcome::Pushed(_)));

        assert_eq!(mgr.get_next(&mut ended).ok(), Some('a'));
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('x'));
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].name(), "e");
    }

    #[test]
    fn skipped_spaces_crossing_entities() {
        let mut mgr = EntityMgr::new();
        let mut ended = Vec::new();
        push_text(&mut mgr, "  x", None);
        let decl = Rc::new(EntityDecl::internal("e", "  "));
        let spooler = mgr.make_from_internal(decl, EntityKind::Parameter, RefFrom::OutsideLiteral);
        assert!(matches!(mgr.push_entity(spooler), PushOutcome::Pushed(_)));

        assert!(mgr.skipped_spaces(true, &mut ended).unwrap());
        assert_eq!(mgr.get_next(&mut ended).ok(), Some('x'));
    }

    #[test]
    fn last_external_system_id_skips_internal_entities() {
        let mut mgr = EntityMgr::new();
        push_text(&mut mgr, "x", None);
        let decl = Rc::new(EntityDecl::internal("e", "a"));
        let spooler = mgr.make_from_internal(decl, EntityKind::General, RefFrom::OutsideLiteral);
        assert!(matches!(mgr.push_entity(spooler), PushOutcome::Pushed(_)));
        assert_eq!(mgr.last_external_system_id().as_deref(), Some("mem://t"));
    }
}
