//! Entity sources: where an entity's bytes come from.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A named provider of an entity's bytes.
///
/// Sources are shared by reference counting (`Rc<dyn EntitySource>`); a
/// spooler holds one reference for as long as it spools.
pub trait EntitySource {
    fn public_id(&self) -> &str;

    fn system_id(&self) -> &str;

    /// Encoding forced by the creator of the source, overriding both
    /// auto-sensing and any in-band declaration.
    fn forced_encoding(&self) -> Option<&str> {
        None
    }

    /// Opens a fresh byte stream over the entity.
    fn make_stream(&self) -> io::Result<Box<dyn Read>>;
}

/// An entity stored in a file.
pub struct FileEntitySrc {
    path: PathBuf,
    public_id: String,
    system_id: String,
}

impl FileEntitySrc {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let system_id = path.to_string_lossy().into_owned();
        Self {
            path,
            public_id: String::new(),
            system_id,
        }
    }

    pub fn with_public_id(mut self, public_id: impl ToString) -> Self {
        self.public_id = public_id.to_string();
        self
    }
}

impl EntitySource for FileEntitySrc {
    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn make_stream(&self) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

/// An entity held in memory, with a virtual system id.
pub struct MemBufEntitySrc {
    bytes: Rc<Vec<u8>>,
    public_id: String,
    system_id: String,
    forced_encoding: Option<String>,
}

impl MemBufEntitySrc {
    pub fn new(system_id: impl ToString, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: Rc::new(bytes.into()),
            public_id: String::new(),
            system_id: system_id.to_string(),
            forced_encoding: None,
        }
    }

    pub fn with_public_id(mut self, public_id: impl ToString) -> Self {
        self.public_id = public_id.to_string();
        self
    }

    pub fn with_encoding(mut self, encoding: impl ToString) -> Self {
        self.forced_encoding = Some(encoding.to_string());
        self
    }
}

impl EntitySource for MemBufEntitySrc {
    fn public_id(&self) -> &str {
        &self.public_id
    }

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn forced_encoding(&self) -> Option<&str> {
        self.forced_encoding.as_deref()
    }

    fn make_stream(&self) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(SharedBufRead {
            bytes: self.bytes.clone(),
            pos: 0,
        }))
    }
}

struct SharedBufRead {
    bytes: Rc<Vec<u8>>,
    pos: usize,
}

impl Read for SharedBufRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.bytes[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

/// What kind of entity a resolver is being asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveKind {
    ExternalSubset,
    ParamEntity,
    GeneralEntity,
}

/// Maps entity identifiers to sources before the default path composition
/// kicks in. Returning `None` falls back to resolving the system id against
/// the nearest external parent entity.
pub trait EntityResolver {
    fn resolve(
        &mut self,
        public_id: &str,
        system_id: &str,
        entity_name: &str,
        parent_system_id: &str,
        kind: ResolveKind,
    ) -> Option<Rc<dyn EntitySource>>;
}

/// Composes a (possibly relative) system id against the system id of the
/// entity it was referenced from.
pub fn compose_system_id(system_id: &str, parent_system_id: &str) -> String {
    let absolute = system_id.contains("://")
        || system_id.starts_with('/')
        || system_id.chars().nth(1) == Some(':');
    if absolute || parent_system_id.is_empty() {
        return system_id.to_string();
    }
    match parent_system_id.rfind(|c| c == '/' || c == '\\') {
        Some(idx) => format!("{}/{}", &parent_system_id[..idx], system_id),
        None => system_id.to_string(),
    }
}
