//! End-to-end tests driving the parser over in-memory documents with a
//! recording handler.

use std::cell::RefCell;
use std::rc::Rc;

use xvp_parser::{
    AttrDef, CbResult, ElemDecl, EntityDecl, EntityResolver, EntitySource, MemBufEntitySrc,
    ResolveKind, XmlAttr, XmlDTDEvents, XmlDiag, XmlDocEvents, XmlEntityEvents, XmlErrCode,
    XmlErrorEvents, XmlLocation, XmlParseFlags, XmlParseOpts, XmlParserCore,
};

#[derive(Default)]
struct Recorder {
    events: Vec<String>,
    diags: Vec<XmlDiag>,
}

impl Recorder {
    fn codes(&self) -> Vec<XmlErrCode> {
        self.diags.iter().map(|d| d.code).collect()
    }
}

impl XmlDocEvents for Recorder {
    fn start_document(&mut self, _system_id: &str) -> CbResult {
        self.events.push("start-doc".to_string());
        Ok(())
    }

    fn end_document(&mut self, _system_id: &str) -> CbResult {
        self.events.push("end-doc".to_string());
        Ok(())
    }

    fn xml_decl(&mut self, version: &str, encoding: &str, standalone: &str) -> CbResult {
        self.events
            .push(format!("decl[{}|{}|{}]", version, encoding, standalone));
        Ok(())
    }

    fn start_tag(&mut self, elem: &ElemDecl, attrs: &[XmlAttr], empty: bool) -> CbResult {
        let attrs: Vec<String> = attrs
            .iter()
            .map(|a| format!("{}={}({})", a.name(), a.value(), a.explicit()))
            .collect();
        self.events.push(format!(
            "start[{} empty={} {}]",
            elem.name(),
            empty,
            attrs.join(",")
        ));
        Ok(())
    }

    fn end_tag(&mut self, elem: &ElemDecl) -> CbResult {
        self.events.push(format!("end[{}]", elem.name()));
        Ok(())
    }

    fn doc_characters(
        &mut self,
        text: &str,
        is_cdata: bool,
        is_ignorable: bool,
        _location: XmlLocation,
    ) -> CbResult {
        self.events.push(format!(
            "chars[{} cdata={} ign={}]",
            text, is_cdata, is_ignorable
        ));
        Ok(())
    }

    fn doc_comment(&mut self, text: &str, _location: XmlLocation) -> CbResult {
        self.events.push(format!("comment[{}]", text));
        Ok(())
    }

    fn doc_pi(&mut self, target: &str, value: &str, _location: XmlLocation) -> CbResult {
        self.events.push(format!("pi[{} {}]", target, value));
        Ok(())
    }
}

impl XmlDTDEvents for Recorder {
    fn doc_type(&mut self, root_name: &str, _public_id: &str, _system_id: &str) -> CbResult {
        self.events.push(format!("doctype[{}]", root_name));
        Ok(())
    }

    fn entity_decl(&mut self, decl: &EntityDecl, ignored: bool) -> CbResult {
        self.events
            .push(format!("entity-decl[{} ignored={}]", decl.name(), ignored));
        Ok(())
    }

    fn attr_def(&mut self, attr: &AttrDef, ignored: bool) -> CbResult {
        self.events
            .push(format!("attr-def[{} ignored={}]", attr.name(), ignored));
        Ok(())
    }
}

impl XmlEntityEvents for Recorder {
    fn start_entity(&mut self, decl: &EntityDecl) -> CbResult {
        self.events.push(format!("start-ent[{}]", decl.name()));
        Ok(())
    }

    fn end_entity(&mut self, decl: &EntityDecl) -> CbResult {
        self.events.push(format!("end-ent[{}]", decl.name()));
        Ok(())
    }
}

impl XmlErrorEvents for Recorder {
    fn handle_error(&mut self, diag: &XmlDiag) -> CbResult {
        self.diags.push(diag.clone());
        Ok(())
    }
}

fn build_parser(opts: XmlParseOpts, flags: XmlParseFlags) -> (XmlParserCore, Rc<RefCell<Recorder>>) {
    let mut parser = XmlParserCore::new();
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    parser.set_doc_events(recorder.clone());
    parser.set_dtd_events(recorder.clone());
    parser.set_entity_events(recorder.clone());
    parser.set_error_events(recorder.clone());
    parser.set_opts(opts);
    parser.set_flags(flags);
    (parser, recorder)
}

fn parse_with(input: &str, opts: XmlParseOpts, flags: XmlParseFlags) -> Rc<RefCell<Recorder>> {
    let (mut parser, recorder) = build_parser(opts, flags);
    parser
        .parse_buffer("mem://doc", input.as_bytes())
        .expect("parse_root must not fail");
    recorder
}

fn parse(input: &str) -> Rc<RefCell<Recorder>> {
    parse_with(input, XmlParseOpts::empty(), XmlParseFlags::default())
}

fn parse_validating(input: &str) -> Rc<RefCell<Recorder>> {
    parse_with(input, XmlParseOpts::VALIDATE, XmlParseFlags::default())
}

mod minimal_documents {
    use super::*;

    #[test]
    fn empty_root_element() {
        let r = parse_with(
            "<?xml version=\"1.0\"?><r/>",
            XmlParseOpts::empty(),
            XmlParseFlags::default() | XmlParseFlags::XML_DECL,
        );
        let r = r.borrow();
        assert_eq!(
            r.events,
            vec![
                "start-doc",
                "decl[1.0||]",
                "start[r empty=true ]",
                "end[r]",
                "end-doc",
            ]
        );
        assert!(r.diags.is_empty());
    }

    #[test]
    fn nested_elements_and_text() {
        let r = parse("<a><b>hi</b></a>");
        let r = r.borrow();
        assert_eq!(
            r.events,
            vec![
                "start-doc",
                "start[a empty=false ]",
                "start[b empty=false ]",
                "chars[hi cdata=false ign=false]",
                "end[b]",
                "end[a]",
                "end-doc",
            ]
        );
        assert!(r.diags.is_empty());
    }

    #[test]
    fn full_xml_decl() {
        let r = parse_with(
            "<?xml version='1.0' encoding='UTF-8' standalone='yes'?><r/>",
            XmlParseOpts::empty(),
            XmlParseFlags::default() | XmlParseFlags::XML_DECL,
        );
        let r = r.borrow();
        assert!(r.events.contains(&"decl[1.0|UTF-8|yes]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn decl_out_of_order_is_an_error() {
        let r = parse("<?xml version='1.0' standalone='yes' encoding='UTF-8'?><r/>");
        assert!(!r.borrow().diags.is_empty());
    }

    #[test]
    fn empty_input_reports_missing_root() {
        let r = parse("");
        assert_eq!(r.borrow().codes(), vec![XmlErrCode::NoRootElement]);
    }

    #[test]
    fn comments_and_pis_around_root() {
        let r = parse("<!-- pre --><?app data?><r/><!-- post -->");
        let r = r.borrow();
        assert_eq!(
            r.events,
            vec![
                "start-doc",
                "comment[ pre ]",
                "pi[app data]",
                "start[r empty=true ]",
                "end[r]",
                "comment[ post ]",
                "end-doc",
            ]
        );
        assert!(r.diags.is_empty());
    }
}

mod attributes {
    use super::*;

    #[test]
    fn explicit_attribute() {
        let r = parse("<r a=\"v\" b='w'/>");
        let r = r.borrow();
        assert!(r
            .events
            .contains(&"start[r empty=true a=v(true),b=w(true)]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn defaulted_attribute_is_not_explicit() {
        let r = parse("<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA \"x\">]><r/>");
        let r = r.borrow();
        assert!(r.events.contains(&"start[r empty=true a=x(false)]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn provided_attribute_beats_default() {
        let r = parse("<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA \"x\">]><r a='y'/>");
        let r = r.borrow();
        assert!(r.events.contains(&"start[r empty=true a=y(true)]".to_string()));
    }

    #[test]
    fn required_attribute_missing() {
        let r = parse_validating(
            "<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA #REQUIRED>]><r/>",
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::RequiredAttrMissing));
    }

    #[test]
    fn nmtokens_value_is_collapsed() {
        let r = parse("<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a NMTOKENS #IMPLIED>]>\
             <r a=\"  foo  bar  \"/>");
        let r = r.borrow();
        assert!(r.events.contains(&"start[r empty=true a=foo bar(true)]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn duplicate_attribute_is_an_error() {
        let r = parse("<r a='1' a='2'/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::DuplicateAttr));
    }

    #[test]
    fn literal_lt_in_value_is_an_error() {
        let r = parse("<r a=\"x<y\"/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::LtInAttrValue));
    }

    #[test]
    fn entity_expansion_in_value() {
        let r = parse("<!DOCTYPE r [<!ELEMENT r EMPTY><!ENTITY t \"T\">]><r a=\"x&t;y\"/>");
        let r = r.borrow();
        assert!(r.events.contains(&"start[r empty=true a=xTy(true)]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn predefined_entities_in_value() {
        let r = parse("<r a=\"&lt;&amp;&gt;\"/>");
        let r = r.borrow();
        assert!(r.events.contains(&"start[r empty=true a=<&>(true)]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn fixed_attribute_mismatch() {
        let r = parse_validating(
            "<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA #FIXED \"x\">]><r a='y'/>",
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::FixedValueMismatch));
    }
}

mod content_models {
    use super::*;

    const DTD: &str = "<!DOCTYPE p [\
        <!ELEMENT p (a,b?,c+)>\
        <!ELEMENT a EMPTY>\
        <!ELEMENT b EMPTY>\
        <!ELEMENT c EMPTY>\
        ]>";

    #[test]
    fn valid_sequence() {
        let r = parse_validating(&format!("{}<p><a/><c/></p>", DTD));
        assert!(r.borrow().diags.is_empty());
    }

    #[test]
    fn mismatch_at_child_index() {
        let r = parse_validating(&format!("{}<p><a/><c/><b/></p>", DTD));
        let r = r.borrow();
        assert_eq!(r.codes(), vec![XmlErrCode::ContentMismatch]);
        assert!(r.diags[0].text.contains("at child 2"));
    }

    #[test]
    fn too_few_children() {
        let r = parse_validating(&format!("{}<p><a/></p>", DTD));
        assert_eq!(r.borrow().codes(), vec![XmlErrCode::ContentTooFew]);
    }

    #[test]
    fn empty_element_with_content() {
        let r = parse_validating("<!DOCTYPE r [<!ELEMENT r EMPTY>]><r><r/></r>");
        let codes = r.borrow().codes();
        assert!(codes.contains(&XmlErrCode::ContentTooMany));
    }

    #[test]
    fn mixed_content() {
        let r = parse_validating(
            "<!DOCTYPE m [<!ELEMENT m (#PCDATA|x)*><!ELEMENT x EMPTY>]>\
             <m>hi<x/>there</m>",
        );
        let r = r.borrow();
        assert!(r.diags.is_empty());
        let got: Vec<String> = r
            .events
            .iter()
            .filter(|e| e.starts_with("chars") || e.contains("[x"))
            .cloned()
            .collect();
        assert_eq!(
            got,
            vec![
                "chars[hi cdata=false ign=false]",
                "start[x empty=true ]",
                "end[x]",
                "chars[there cdata=false ign=false]",
            ]
        );
    }

    #[test]
    fn text_in_element_only_content() {
        let r = parse_validating(
            "<!DOCTYPE p [<!ELEMENT p (a)><!ELEMENT a EMPTY>]><p>x<a/></p>",
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::TextInElementOnly));
    }

    #[test]
    fn whitespace_in_element_only_content_is_ignorable() {
        let r = parse_with(
            "<!DOCTYPE p [<!ELEMENT p (a)><!ELEMENT a EMPTY>]><p> <a/> </p>",
            XmlParseOpts::VALIDATE,
            XmlParseFlags::default() | XmlParseFlags::IGNORABLE_SPACE,
        );
        let r = r.borrow();
        assert!(r.diags.is_empty());
        assert!(r.events.contains(&"chars[  cdata=false ign=true]".to_string())
            || r.events.contains(&"chars[ cdata=false ign=true]".to_string()));
    }

    #[test]
    fn undeclared_element_reported() {
        let r = parse_validating("<!DOCTYPE r [<!ELEMENT r ANY>]><r><u/></r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::ElementNotDeclared));
    }

    #[test]
    fn root_name_mismatch() {
        let r = parse_validating("<!DOCTYPE r [<!ELEMENT r EMPTY><!ELEMENT x EMPTY>]><x/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::RootElementMismatch));
    }
}

mod references {
    use super::*;

    #[test]
    fn predefined_entities_expand_to_single_chars() {
        let r = parse("<r>&amp;&lt;&gt;&quot;&apos;</r>");
        let r = r.borrow();
        assert!(r
            .events
            .contains(&"chars[&<>\"' cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn char_refs_decimal_and_hex() {
        let r = parse("<r>&#x41;&#66;</r>");
        let r = r.borrow();
        assert!(r.events.contains(&"chars[AB cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn supplementary_plane_char_ref() {
        let r = parse("<r>&#x1F600;</r>");
        let r = r.borrow();
        assert!(r
            .events
            .contains(&"chars[\u{1F600} cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn surrogate_char_ref_is_rejected() {
        let r = parse("<r>&#xD800;</r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::UnpairedSurrogate));
    }

    #[test]
    fn undeclared_entity() {
        let r = parse("<r>&nosuch;</r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::EntityNotFound));
    }

    #[test]
    fn internal_entity_expansion() {
        let r = parse("<!DOCTYPE r [<!ELEMENT r ANY><!ENTITY e \"mid\">]><r>a&e;b</r>");
        let r = r.borrow();
        let chars: Vec<&String> = r.events.iter().filter(|e| e.starts_with("chars")).collect();
        assert_eq!(
            chars,
            vec![
                "chars[a cdata=false ign=false]",
                "chars[mid cdata=false ign=false]",
                "chars[b cdata=false ign=false]",
            ]
        );
        assert!(r.diags.is_empty());
    }

    #[test]
    fn entity_topology_events() {
        let r = parse_with(
            "<!DOCTYPE r [<!ENTITY e \"mid\">]><r>a&e;b</r>",
            XmlParseOpts::empty(),
            XmlParseFlags::default() | XmlParseFlags::TOPOLOGY,
        );
        let r = r.borrow();
        let interesting: Vec<&String> = r
            .events
            .iter()
            .filter(|e| e.starts_with("chars") || e.contains("-ent["))
            .collect();
        assert_eq!(
            interesting,
            vec![
                "chars[a cdata=false ign=false]",
                "start-ent[e]",
                "chars[mid cdata=false ign=false]",
                "end-ent[e]",
                "chars[b cdata=false ign=false]",
            ]
        );
    }

    #[test]
    fn recursive_entity_is_diagnosed_not_hung() {
        let r = parse("<!DOCTYPE r [<!ENTITY e \"&e;\">]><r>&e;</r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::RecursiveEntityRef));
    }

    #[test]
    fn mutually_recursive_entities() {
        let r = parse(
            "<!DOCTYPE r [<!ENTITY a \"x&b;\"><!ENTITY b \"y&a;\">]><r>&a;</r>",
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::RecursiveEntityRef));
    }

    #[test]
    fn nested_entities_expand() {
        let r = parse("<!DOCTYPE r [<!ENTITY inner \"X\"><!ENTITY outer \"a&inner;b\">]>\
             <r>&outer;</r>");
        let r = r.borrow();
        let text: String = r
            .events
            .iter()
            .filter(|e| e.starts_with("chars["))
            .map(|e| {
                e.trim_start_matches("chars[")
                    .split(" cdata=")
                    .next()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(text, "aXb");
        assert!(r.diags.is_empty());
    }
}

mod cdata_and_comments {
    use super::*;

    #[test]
    fn cdata_section() {
        let r = parse("<r><![CDATA[<greeting> & such]]></r>");
        let r = r.borrow();
        assert!(r
            .events
            .contains(&"chars[<greeting> & such cdata=true ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn cdata_with_brackets() {
        let r = parse("<r><![CDATA[]]]]></r>");
        let r = r.borrow();
        assert!(r.events.contains(&"chars[]] cdata=true ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn cdata_end_in_char_data_is_an_error() {
        let r = parse("<r>]]></r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::CDataEndInContent));
    }

    #[test]
    fn lone_bracket_is_fine() {
        let r = parse("<r>a]b</r>");
        let r = r.borrow();
        assert!(r.events.contains(&"chars[a]b cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn double_dash_in_comment() {
        let r = parse("<r><!-- a--b --></r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::DoubleDashInComment));
    }

    #[test]
    fn pi_target_xml_in_body() {
        let r = parse("<r><?xml bad?></r>");
        assert!(r.borrow().codes().contains(&XmlErrCode::BadPITarget));
    }
}

mod structure_errors {
    use super::*;

    #[test]
    fn mismatched_end_tag() {
        let r = parse("<r></x>");
        assert!(r.borrow().codes().contains(&XmlErrCode::MismatchedEndTag));
    }

    #[test]
    fn open_element_at_eof() {
        let r = parse("<r><a>");
        assert!(r.borrow().codes().contains(&XmlErrCode::UnexpectedEof));
    }

    #[test]
    fn content_after_root() {
        let r = parse("<r/><r/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::UnexpectedContent));
    }

    #[test]
    fn text_before_root() {
        let r = parse("abc<r/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::UnexpectedContent));
    }

    #[test]
    fn second_doctype() {
        let r = parse("<!DOCTYPE r [<!ELEMENT r EMPTY>]><!DOCTYPE r []><r/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::MultipleDocTypes));
    }
}

mod error_limits {
    use super::*;

    #[test]
    fn max_errors_terminates_the_parse() {
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::empty(), XmlParseFlags::default());
        parser.set_max_errors(2);
        parser
            .parse_buffer("mem://doc", b"<r>]]>]]>]]>]]>]]></r>")
            .unwrap();
        let r = recorder.borrow();
        assert_eq!(r.diags.len(), 2);
        // EndDocument still fires after the abort
        assert_eq!(r.events.last().map(|s| s.as_str()), Some("end-doc"));
    }

    #[test]
    fn reparse_after_failure_matches_fresh_parse() {
        let doc = b"<r><a></b></r>";
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::empty(), XmlParseFlags::default());
        parser.parse_buffer("mem://doc", doc).unwrap();
        let first: Vec<XmlErrCode> = recorder.borrow().codes();
        assert!(!first.is_empty());

        parser.parse_buffer("mem://doc", doc).unwrap();
        // the recorder keeps accumulating; the second run appends the same
        // diagnostics again
        let all = recorder.borrow().codes();
        assert_eq!(all.len(), first.len() * 2);
        assert_eq!(&all[first.len()..], &first[..]);
    }
}

mod external_entities {
    use super::*;

    /// Maps system ids to in-memory sources.
    struct MapResolver {
        map: Vec<(String, Vec<u8>)>,
    }

    impl EntityResolver for MapResolver {
        fn resolve(
            &mut self,
            _public_id: &str,
            system_id: &str,
            _entity_name: &str,
            _parent_system_id: &str,
            _kind: ResolveKind,
        ) -> Option<Rc<dyn EntitySource>> {
            self.map
                .iter()
                .find(|(id, _)| id == system_id)
                .map(|(id, bytes)| {
                    Rc::new(MemBufEntitySrc::new(id.clone(), bytes.clone()))
                        as Rc<dyn EntitySource>
                })
        }
    }

    fn parse_with_resolver(
        input: &str,
        map: Vec<(&str, &str)>,
        opts: XmlParseOpts,
    ) -> Rc<RefCell<Recorder>> {
        let (mut parser, recorder) = build_parser(opts, XmlParseFlags::default());
        let resolver = MapResolver {
            map: map
                .into_iter()
                .map(|(id, text)| (id.to_string(), text.as_bytes().to_vec()))
                .collect(),
        };
        parser.set_entity_resolver(Rc::new(RefCell::new(resolver)));
        parser
            .parse_buffer("mem://doc", input.as_bytes())
            .expect("parse_root must not fail");
        recorder
    }

    #[test]
    fn external_subset_supplies_declarations() {
        let r = parse_with_resolver(
            "<!DOCTYPE r SYSTEM \"r.dtd\"><r a='v'/>",
            vec![("r.dtd", "<!ELEMENT r EMPTY><!ATTLIST r a CDATA #IMPLIED>")],
            XmlParseOpts::VALIDATE,
        );
        assert!(r.borrow().diags.is_empty());
    }

    #[test]
    fn external_general_entity_in_content() {
        let r = parse_with_resolver(
            "<!DOCTYPE r [<!ELEMENT r ANY><!ENTITY ext SYSTEM \"chunk.xml\">]><r>&ext;</r>",
            vec![("chunk.xml", "hello")],
            XmlParseOpts::empty(),
        );
        let r = r.borrow();
        assert!(r
            .events
            .contains(&"chars[hello cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn external_entity_with_text_decl() {
        let r = parse_with_resolver(
            "<!DOCTYPE r [<!ELEMENT r ANY><!ENTITY ext SYSTEM \"chunk.xml\">]><r>&ext;</r>",
            vec![("chunk.xml", "<?xml version='1.0' encoding='utf-8'?>payload")],
            XmlParseOpts::empty(),
        );
        let r = r.borrow();
        assert!(r
            .events
            .contains(&"chars[payload cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn unresolvable_external_entity_is_reported() {
        let r = parse_with_resolver(
            "<!DOCTYPE r [<!ELEMENT r ANY><!ENTITY ext SYSTEM \"mem://nowhere/x.xml\">]>\
             <r>&ext;</r>",
            vec![],
            XmlParseOpts::empty(),
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::EntityOpenFailure));
    }

    #[test]
    fn external_entity_not_allowed_in_attr_value() {
        let r = parse_with_resolver(
            "<!DOCTYPE r [<!ELEMENT r ANY><!ENTITY ext SYSTEM \"chunk.xml\">]><r a=\"&ext;\"/>",
            vec![("chunk.xml", "x")],
            XmlParseOpts::empty(),
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::ExtEntityInAttr));
    }

    #[test]
    fn conditional_sections_in_external_subset() {
        let r = parse_with_resolver(
            "<!DOCTYPE r SYSTEM \"r.dtd\"><r><a/></r>",
            vec![(
                "r.dtd",
                "<![INCLUDE[<!ELEMENT r (a)><!ELEMENT a EMPTY>]]>\
                 <![IGNORE[<!ELEMENT r (b)><!garbage]]>",
            )],
            XmlParseOpts::VALIDATE,
        );
        assert!(r.borrow().diags.is_empty());
    }
}

mod dtd_details {
    use super::*;

    #[test]
    fn parameter_entity_between_declarations() {
        let r = parse_validating(
            "<!DOCTYPE r [<!ENTITY % pe \"<!ELEMENT r EMPTY>\">%pe;]><r/>",
        );
        assert!(r.borrow().diags.is_empty());
    }

    #[test]
    fn unparsed_entity_checks() {
        let r = parse_validating(
            "<!DOCTYPE r [\
             <!NOTATION gif SYSTEM \"viewer\">\
             <!ELEMENT r EMPTY>\
             <!ATTLIST r pic ENTITY #IMPLIED>\
             <!ENTITY img SYSTEM \"i.gif\" NDATA gif>\
             ]><r pic=\"img\"/>",
        );
        assert!(r.borrow().diags.is_empty());
    }

    #[test]
    fn entity_attr_must_name_unparsed_entity() {
        let r = parse_validating(
            "<!DOCTYPE r [\
             <!ELEMENT r EMPTY>\
             <!ATTLIST r pic ENTITY #IMPLIED>\
             ]><r pic=\"nope\"/>",
        );
        assert!(r
            .borrow()
            .codes()
            .contains(&XmlErrCode::EntityAttrNotUnparsed));
    }

    #[test]
    fn ndata_without_notation_declaration() {
        let r = parse_validating(
            "<!DOCTYPE r [\
             <!ELEMENT r EMPTY>\
             <!ENTITY img SYSTEM \"i.gif\" NDATA gif>\
             ]><r/>",
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::NotationNotDeclared));
    }

    #[test]
    fn duplicate_element_declaration() {
        let r = parse_validating(
            "<!DOCTYPE r [<!ELEMENT r EMPTY><!ELEMENT r ANY>]><r/>",
        );
        assert!(r
            .borrow()
            .codes()
            .contains(&XmlErrCode::DuplicateElementDecl));
    }

    #[test]
    fn duplicate_entity_declaration_first_wins() {
        let r = parse(
            "<!DOCTYPE r [<!ELEMENT r ANY><!ENTITY e \"one\"><!ENTITY e \"two\">]><r>&e;</r>",
        );
        let r = r.borrow();
        assert!(r.events.contains(&"chars[one cdata=false ign=false]".to_string()));
        assert!(r.codes().contains(&XmlErrCode::EntityRedeclared));
    }

    #[test]
    fn duplicate_attr_def_is_ignored() {
        let r = parse_validating(
            "<!DOCTYPE r [<!ELEMENT r EMPTY>\
             <!ATTLIST r a CDATA \"x\">\
             <!ATTLIST r a ID #IMPLIED>\
             ]><r/>",
        );
        let r = r.borrow();
        // the first declaration's default still applies
        assert!(r.events.contains(&"start[r empty=true a=x(false)]".to_string()));
        assert!(r.codes().contains(&XmlErrCode::AttrDefRedeclared));
    }

    #[test]
    fn enumeration_attr() {
        let r = parse_validating(
            "<!DOCTYPE r [<!ELEMENT r EMPTY>\
             <!ATTLIST r kind (red|blue) \"red\">\
             ]><r kind='blue'/>",
        );
        assert!(r.borrow().diags.is_empty());

        let r = parse_validating(
            "<!DOCTYPE r [<!ELEMENT r EMPTY>\
             <!ATTLIST r kind (red|blue) \"red\">\
             ]><r kind='green'/>",
        );
        assert!(r.borrow().codes().contains(&XmlErrCode::NotInEnumList));
    }

    #[test]
    fn conditional_section_rejected_in_internal_subset() {
        let r = parse("<!DOCTYPE r [<![INCLUDE[<!ELEMENT r EMPTY>]]>]><r/>");
        assert!(r
            .borrow()
            .codes()
            .contains(&XmlErrCode::CondSectionInIntSubset));
    }

    #[test]
    fn ignore_dtd_discards_declarations() {
        let r = parse_with(
            "<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA \"x\">]><r/>",
            XmlParseOpts::IGNORE_DTD,
            XmlParseFlags::default(),
        );
        let r = r.borrow();
        // no default injection once the DTD content is discarded
        assert!(r.events.contains(&"start[r empty=true ]".to_string()));
    }
}

mod options {
    use super::*;

    #[test]
    fn bad_chars_are_errors_by_default() {
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::empty(), XmlParseFlags::default());
        parser.parse_buffer("mem://doc", b"<r>a\x0Bb</r>").unwrap();
        assert!(recorder.borrow().codes().contains(&XmlErrCode::InvalidChar));
    }

    #[test]
    fn ignore_bad_chars_substitutes_and_warns() {
        let (mut parser, recorder) = build_parser(
            XmlParseOpts::IGNORE_BAD_CHARS,
            XmlParseFlags::default(),
        );
        parser.parse_buffer("mem://doc", b"<r>a\x0Bb</r>").unwrap();
        let r = recorder.borrow();
        assert_eq!(r.codes(), vec![XmlErrCode::BadCharReplaced]);
        assert!(r.events.contains(&"chars[a b cdata=false ign=false]".to_string()));
    }

    #[test]
    fn locked_validator_is_reused_across_parses() {
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::VALIDATE, XmlParseFlags::default());
        parser
            .parse_buffer(
                "mem://1",
                b"<!DOCTYPE r [<!ELEMENT r EMPTY><!ATTLIST r a CDATA \"x\">]><r/>",
            )
            .unwrap();
        assert!(recorder.borrow().diags.is_empty());

        parser.validator_mut().lock();

        // the DOCTYPE is eaten without re-interpretation; the compiled DTD
        // still drives defaulting and validation
        parser.parse_buffer("mem://2", b"<!DOCTYPE r><r/>").unwrap();
        let r = recorder.borrow();
        assert!(r.diags.is_empty());
        assert_eq!(
            r.events
                .iter()
                .filter(|e| *e == "start[r empty=true a=x(false)]")
                .count(),
            2
        );
    }

    #[test]
    fn locked_validator_rejects_internal_subset() {
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::VALIDATE, XmlParseFlags::default());
        parser
            .parse_buffer("mem://1", b"<!DOCTYPE r [<!ELEMENT r EMPTY>]><r/>")
            .unwrap();
        parser.validator_mut().lock();
        parser
            .parse_buffer("mem://2", b"<!DOCTYPE r [<!ELEMENT r EMPTY>]><r/>")
            .unwrap();
        assert!(recorder
            .borrow()
            .codes()
            .contains(&XmlErrCode::IntSubsetNotAllowed));
    }
}

mod encodings {
    use super::*;

    #[test]
    fn utf16le_document() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "<?xml version='1.0'?><r>\u{e9}</r>".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::empty(), XmlParseFlags::default());
        parser.parse_buffer("mem://u16", &bytes).unwrap();
        let r = recorder.borrow();
        assert!(r
            .events
            .contains(&"chars[\u{e9} cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn eight_bit_document_with_declared_encoding() {
        let mut bytes = b"<?xml version='1.0' encoding='windows-1252'?><r>".to_vec();
        bytes.push(0xA4);
        bytes.extend_from_slice(b"</r>");
        let (mut parser, recorder) =
            build_parser(XmlParseOpts::empty(), XmlParseFlags::default());
        parser.parse_buffer("mem://w1252", &bytes).unwrap();
        let r = recorder.borrow();
        assert!(r
            .events
            .contains(&"chars[\u{a4} cdata=false ign=false]".to_string()));
        assert!(r.diags.is_empty());
    }

    #[test]
    fn bad_declared_encoding_name() {
        let r = parse("<?xml version='1.0' encoding='no-such-enc'?><r/>");
        assert!(r.borrow().codes().contains(&XmlErrCode::BadEncodingName));
    }
}
