//! Validating XML 1.0 parser with an integrated DTD engine.
//!
//! The parser consumes a root entity (file, memory buffer or user-supplied
//! source) plus any externally referenced DTD subsets and entities, reports
//! well-formedness and validity diagnostics through an error handler, and
//! pushes structured events (tags, characters, comments, PIs, DTD markup)
//! to the registered handlers.
//!
//! ```no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use xvp_parser::{MemBufEntitySrc, XmlDocEvents, XmlParserCore};
//!
//! struct Printer;
//!
//! impl XmlDocEvents for Printer {
//!     fn start_tag(
//!         &mut self,
//!         elem: &xvp_parser::ElemDecl,
//!         _attrs: &[xvp_parser::XmlAttr],
//!         _empty: bool,
//!     ) -> xvp_parser::CbResult {
//!         println!("<{}>", elem.name());
//!         Ok(())
//!     }
//! }
//!
//! let mut parser = XmlParserCore::new();
//! parser.set_doc_events(Rc::new(RefCell::new(Printer)));
//! let src = MemBufEntitySrc::new("mem://doc", b"<r><a/></r>".to_vec());
//! parser.parse_root(&src).unwrap();
//! ```

mod attr;
mod catalog;
mod cm;
mod core;
mod decls;
mod entitymgr;
mod error;
mod events;
mod pool;
mod source;
mod spooler;
mod validator;

pub use crate::attr::XmlAttr;
pub use crate::catalog::{
    XmlCatalog, CATALOG_DTD, CATALOG_MAP_ITEM, CATALOG_MAP_TO, CATALOG_PUBLIC_ID, CATALOG_ROOT,
};
pub use crate::cm::{ChildModel, CmSpecNode, ContentModel, MixedModel, ValidRes};
pub use crate::core::XmlParserCore;
pub use crate::decls::{
    AttrDef, AttrType, ContentModelType, CreateReason, DefAttrType, ElemDecl, EntityDecl,
    NotationDecl, TextPolicy,
};
pub use crate::error::{
    CbResult, XmlCbError, XmlDiag, XmlErrCode, XmlFatal, XmlSeverity,
};
pub use crate::events::{
    XmlDTDEvents, XmlDocEvents, XmlEntityEvents, XmlErrorEvents, XmlLocation, XmlParseFlags,
    XmlParseOpts,
};
pub use crate::pool::{CursorInvalidated, NameIdPool, PoolCursor, PoolElem};
pub use crate::source::{
    compose_system_id, EntityResolver, EntitySource, FileEntitySrc, MemBufEntitySrc, ResolveKind,
};
pub use crate::spooler::{EncFamily, EntityKind, EntitySpooler, RefFrom};
pub use crate::validator::DtdValidator;
