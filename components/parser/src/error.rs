//! Diagnostic codes and the internal control-flow interrupts.

use std::fmt;
use std::rc::Rc;

use crate::decls::EntityDecl;

/// Severity of a reported diagnostic.
///
/// Warnings are advisory and do not count toward the error limit. Errors are
/// well-formedness violations. Validation diagnostics only fire when DTD
/// validation is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmlSeverity {
    Warning,
    Error,
    Validation,
}

/// Diagnostic codes, range partitioned by severity so that the code alone
/// identifies it: 1..=999 warnings, 1000..=2999 well-formedness errors,
/// 3000.. validity errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum XmlErrCode {
    // Warnings
    EntityRedeclared = 1,
    AttrDefRedeclared = 2,
    ElementNeverDeclared = 3,
    BadCharReplaced = 4,
    NotationRedeclared = 5,

    // Well-formedness errors
    UnexpectedEof = 1000,
    ExpectedName = 1001,
    ExpectedWhitespace = 1002,
    ExpectedEquals = 1003,
    ExpectedQuotedString = 1004,
    ExpectedElement = 1005,
    UnterminatedMarkup = 1006,
    InvalidChar = 1008,
    InvalidCharRef = 1009,
    UnpairedSurrogate = 1010,
    EntityNotFound = 1011,
    RecursiveEntityRef = 1012,
    ExtEntityInAttr = 1013,
    LtInAttrValue = 1014,
    CDataEndInContent = 1015,
    DoubleDashInComment = 1016,
    BadPITarget = 1017,
    DuplicateAttr = 1018,
    MismatchedEndTag = 1019,
    PartialMarkup = 1020,
    UnexpectedContent = 1021,
    MultipleDocTypes = 1022,
    BadXmlDecl = 1023,
    BadEncodingName = 1025,
    EncodingMismatch = 1026,
    EntityOpenFailure = 1027,
    NestedCData = 1028,
    NoRootElement = 1030,
    PERefInMarkup = 1031,
    CondSectionInIntSubset = 1032,
    BadConditionalKeyword = 1033,
    BadContentModel = 1036,
    BadAttrType = 1037,
    BadExternalId = 1039,
    UnparsedEntityRef = 1041,
    IntSubsetNotAllowed = 1042,

    // Validity errors
    ElementNotDeclared = 3000,
    AttrNotDeclared = 3001,
    RequiredAttrMissing = 3002,
    FixedValueMismatch = 3003,
    BadValueForType = 3004,
    NotInEnumList = 3005,
    EntityAttrNotUnparsed = 3006,
    ContentMismatch = 3007,
    ContentTooFew = 3008,
    ContentTooMany = 3009,
    TextInElementOnly = 3010,
    MultipleIdAttrs = 3011,
    NotationNotDeclared = 3012,
    RootElementMismatch = 3013,
    DuplicateElementDecl = 3014,
}

impl XmlErrCode {
    pub fn severity(self) -> XmlSeverity {
        let code = self as u32;
        if code < 1000 {
            XmlSeverity::Warning
        } else if code < 3000 {
            XmlSeverity::Error
        } else {
            XmlSeverity::Validation
        }
    }

    fn base_message(self) -> &'static str {
        use XmlErrCode::*;
        match self {
            EntityRedeclared => "entity is already declared, ignoring redeclaration",
            AttrDefRedeclared => "attribute is already declared for this element, ignoring",
            ElementNeverDeclared => "element was referenced but never declared",
            BadCharReplaced => "character is not legal in XML, replaced with a space",
            NotationRedeclared => "notation is already declared, ignoring redeclaration",

            UnexpectedEof => "unexpected end of input",
            ExpectedName => "expected an XML name",
            ExpectedWhitespace => "whitespace was expected here",
            ExpectedEquals => "expected `=`",
            ExpectedQuotedString => "expected a quoted string",
            ExpectedElement => "expected an element",
            UnterminatedMarkup => "markup was not terminated",
            InvalidChar => "character is not legal in XML",
            InvalidCharRef => "invalid character reference",
            UnpairedSurrogate => "a high surrogate must be followed by a low surrogate",
            EntityNotFound => "reference to undeclared entity",
            RecursiveEntityRef => "recursive entity reference",
            ExtEntityInAttr => "external entities cannot be referenced in attribute values",
            LtInAttrValue => "`<` is not allowed in attribute values",
            CDataEndInContent => "`]]>` is not allowed in character data",
            DoubleDashInComment => "`--` is not allowed inside a comment",
            BadPITarget => "`xml` is not a legal processing instruction target",
            DuplicateAttr => "attribute appears more than once in this tag",
            MismatchedEndTag => "end tag does not match open element",
            PartialMarkup => "markup began in one entity and ended in another",
            UnexpectedContent => "content is not legal here",
            MultipleDocTypes => "only one DOCTYPE declaration is allowed",
            BadXmlDecl => "malformed XML declaration",
            BadEncodingName => "invalid encoding name",
            EncodingMismatch => "declared encoding contradicts the auto-sensed family",
            EntityOpenFailure => "could not open entity",
            NestedCData => "CDATA sections cannot nest",
            NoRootElement => "no root element found",
            PERefInMarkup => {
                "parameter entity references are not legal in markup in the internal subset"
            }
            CondSectionInIntSubset => {
                "conditional sections are only legal in the external subset"
            }
            BadConditionalKeyword => "expected INCLUDE or IGNORE",
            BadContentModel => "malformed content model",
            BadAttrType => "unknown attribute type",
            BadExternalId => "expected PUBLIC or SYSTEM",
            UnparsedEntityRef => "unparsed entities cannot be referenced in content",
            IntSubsetNotAllowed => "internal subset is not allowed with a locked validator",

            ElementNotDeclared => "element is not declared",
            AttrNotDeclared => "attribute is not declared for this element",
            RequiredAttrMissing => "required attribute was not provided",
            FixedValueMismatch => "value does not match the #FIXED default",
            BadValueForType => "value is not legal for the attribute type",
            NotInEnumList => "value is not in the declared enumeration",
            EntityAttrNotUnparsed => "value must name an unparsed entity",
            ContentMismatch => "child is not allowed here by the content model",
            ContentTooFew => "content ended before the content model was satisfied",
            ContentTooMany => "element was declared EMPTY but has content",
            TextInElementOnly => "character data is not allowed in element-only content",
            MultipleIdAttrs => "only one ID attribute may be declared per element",
            NotationNotDeclared => "notation is not declared",
            RootElementMismatch => "root element does not match the DOCTYPE name",
            DuplicateElementDecl => "element is already declared",
        }
    }
}

/// A positioned diagnostic as handed to the error event handler.
#[derive(Clone, Debug)]
pub struct XmlDiag {
    pub code: XmlErrCode,
    pub text: String,
    pub line: u32,
    pub col: u32,
    pub system_id: String,
}

impl XmlDiag {
    pub fn new(code: XmlErrCode, detail: &str, line: u32, col: u32, system_id: &str) -> Self {
        let text = if detail.is_empty() {
            code.base_message().to_string()
        } else {
            format!("{}: {}", code.base_message(), detail)
        };
        Self {
            code,
            text,
            line,
            col,
            system_id: system_id.to_string(),
        }
    }

    pub fn severity(&self) -> XmlSeverity {
        self.code.severity()
    }
}

impl fmt::Display for XmlDiag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} [{}] at {}:{} in {}: {}",
            self.severity(),
            self.code as u32,
            self.line,
            self.col,
            self.system_id,
            self.text
        )
    }
}

/// Error returned from an event callback to cancel the parse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XmlCbError(pub String);

impl fmt::Display for XmlCbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback error: {}", self.0)
    }
}

impl std::error::Error for XmlCbError {}

/// Result type for event callbacks.
pub type CbResult = Result<(), XmlCbError>;

/// The only ways `parse_root` itself can fail; everything else is reported
/// through the error event handler.
#[derive(Debug)]
pub enum XmlFatal {
    /// A callback returned an error.
    Callback(XmlCbError),
    /// The root entity could not be opened.
    RootEntityOpen(String),
}

impl fmt::Display for XmlFatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XmlFatal::Callback(err) => write!(f, "{}", err),
            XmlFatal::RootEntityOpen(id) => write!(f, "could not open root entity {}", id),
        }
    }
}

impl std::error::Error for XmlFatal {}

/// Internal control flow. Neither variant escapes `parse_root`.
///
/// `EndOfEntity` is raised by the entity manager when the throw-at-end mode
/// is armed and a spooler with an entity declaration drains; the parser uses
/// it to flush aggregated character data at entity boundaries. `MaxErrors`
/// unwinds the parse once the error limit is reached.
#[derive(Debug)]
pub(crate) enum Interrupt {
    EndOfEntity {
        decl: Rc<EntityDecl>,
        spooler_id: u32,
    },
    MaxErrors,
    Callback(XmlCbError),
}

pub(crate) type PRes<T> = Result<T, Interrupt>;
