//! Namespace-aware XML tree used for signature and encryption processing.
//!
//! The tree keeps what exclusive canonicalization needs: the resolved
//! namespace of every element and attribute, the declarations made on each
//! element, and text content. Comments and processing instructions are
//! dropped while parsing; DOCTYPE declarations are rejected outright so
//! entity expansion never reaches the validator.

use std::collections::BTreeMap;

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use thiserror::Error;

pub const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting accepted by the parser. The tree walkers below
/// recurse once per level, so this also bounds their stack use.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("DOCTYPE declarations are not accepted")]
    DocType,

    #[error("Unbound namespace prefix '{0}'")]
    UnboundPrefix(String),

    #[error("Document has no root element")]
    NoRoot,

    #[error("Unexpected content after the root element")]
    TrailingContent,

    #[error("Unclosed element '{0}'")]
    Unclosed(String),

    #[error("Elements nest deeper than {0} levels")]
    TooDeep(usize),
}

/// Namespace bindings in scope: prefix (`None` is the default namespace) to URI.
pub type Scope = BTreeMap<Option<String>, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    fn qualified_name(&self) -> String {
        qualify(self.prefix.as_deref(), &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub prefix: Option<String>,
    pub name: String,
    pub namespace: Option<String>,
    /// Namespace declarations written on this element, in document order.
    pub declarations: Vec<(Option<String>, String)>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a complete document and return its root element.
pub fn parse(xml: &str) -> Result<Element, XmlError> {
    parse_in_scope(xml, &Scope::new())
}

/// Parse a document fragment whose prefixes may be bound by an enclosing
/// document (decrypted assertions are the common case).
pub fn parse_in_scope(xml: &str, inherited: &Scope) -> Result<Element, XmlError> {
    let normalized = xml.replace("\r\n", "\n").replace('\r', "\n");
    let mut reader = Reader::from_str(&normalized);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<(Element, Scope)> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| XmlError::Syntax(e.to_string()))?;

        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(XmlError::TrailingContent);
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep(MAX_DEPTH));
                }
                let parent = stack.last().map(|(_, scope)| scope).unwrap_or(inherited);
                let opened = open_element(&start, parent)?;
                stack.push(opened);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(XmlError::TrailingContent);
                }
                if stack.len() >= MAX_DEPTH {
                    return Err(XmlError::TooDeep(MAX_DEPTH));
                }
                let parent = stack.last().map(|(_, scope)| scope).unwrap_or(inherited);
                let (element, _) = open_element(&start, parent)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let (element, _) = stack
                    .pop()
                    .ok_or_else(|| XmlError::Syntax("unexpected end tag".to_string()))?;
                attach(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                let value = text
                    .unescape()
                    .map_err(|e| XmlError::Syntax(e.to_string()))?;
                push_text(&mut stack, &value)?;
            }
            Event::CData(data) => {
                let value = String::from_utf8(data.into_inner().into_owned())
                    .map_err(|e| XmlError::Syntax(e.to_string()))?;
                push_text(&mut stack, &value)?;
            }
            Event::DocType(_) => return Err(XmlError::DocType),
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some((element, _)) = stack.pop() {
        return Err(XmlError::Unclosed(element.qualified_name()));
    }
    root.ok_or(XmlError::NoRoot)
}

fn open_element(start: &BytesStart<'_>, parent: &Scope) -> Result<(Element, Scope), XmlError> {
    let mut scope = parent.clone();
    let mut declarations = Vec::new();
    let mut raw_attributes = Vec::new();

    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Syntax(e.to_string()))?;
        let key = std::str::from_utf8(attr.key.into_inner())
            .map_err(|e| XmlError::Syntax(e.to_string()))?
            .to_string();
        let value = normalize_attribute_value(&attr.value)?;

        if key == "xmlns" {
            if value.is_empty() {
                scope.remove(&None);
            } else {
                scope.insert(None, value.clone());
            }
            declarations.push((None, value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.insert(Some(prefix.to_string()), value.clone());
            declarations.push((Some(prefix.to_string()), value));
        } else {
            raw_attributes.push((key, value));
        }
    }

    let qname = std::str::from_utf8(start.name().into_inner())
        .map_err(|e| XmlError::Syntax(e.to_string()))?;
    let (prefix, name) = split_qname(qname);
    let namespace = resolve(&scope, prefix.as_deref())?;

    let mut attributes = Vec::with_capacity(raw_attributes.len());
    for (key, value) in raw_attributes {
        let (prefix, name) = split_qname(&key);
        // Unprefixed attributes never take the default namespace.
        let namespace = match prefix.as_deref() {
            Some(p) => resolve(&scope, Some(p))?,
            None => None,
        };
        attributes.push(Attribute {
            prefix,
            name,
            namespace,
            value,
        });
    }

    let element = Element {
        prefix,
        name,
        namespace,
        declarations,
        attributes,
        children: Vec::new(),
    };
    Ok((element, scope))
}

/// Attribute-value normalization: literal whitespace characters become
/// spaces before references are expanded, so `&#9;` survives as a tab.
fn normalize_attribute_value(raw: &[u8]) -> Result<String, XmlError> {
    let raw = std::str::from_utf8(raw).map_err(|e| XmlError::Syntax(e.to_string()))?;
    let spaced: String = raw
        .chars()
        .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
        .collect();
    quick_xml::escape::unescape(&spaced)
        .map(|value| value.into_owned())
        .map_err(|e| XmlError::Syntax(e.to_string()))
}

fn attach(stack: &mut [(Element, Scope)], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some((parent, _)) => parent.children.push(Node::Element(element)),
        None => *root = Some(element),
    }
}

fn push_text(stack: &mut [(Element, Scope)], value: &str) -> Result<(), XmlError> {
    let Some((parent, _)) = stack.last_mut() else {
        if value.trim().is_empty() {
            return Ok(());
        }
        return Err(XmlError::Syntax("text outside the root element".to_string()));
    };
    if let Some(Node::Text(existing)) = parent.children.last_mut() {
        existing.push_str(value);
    } else {
        parent.children.push(Node::Text(value.to_string()));
    }
    Ok(())
}

fn resolve(scope: &Scope, prefix: Option<&str>) -> Result<Option<String>, XmlError> {
    match prefix {
        Some("xml") => Ok(Some(XML_NS.to_string())),
        Some(p) => scope
            .get(&Some(p.to_string()))
            .cloned()
            .map(Some)
            .ok_or_else(|| XmlError::UnboundPrefix(p.to_string())),
        None => Ok(scope.get(&None).cloned()),
    }
}

fn split_qname(qname: &str) -> (Option<String>, String) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, qname.to_string()),
    }
}

fn qualify(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{p}:{name}"),
        None => name.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Construction and navigation
// ─────────────────────────────────────────────────────────────────────────────

impl Element {
    pub fn new(prefix: Option<&str>, name: &str, namespace: Option<&str>) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            declarations: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn declare(mut self, prefix: Option<&str>, uri: &str) -> Self {
        self.declarations
            .push((prefix.map(str::to_string), uri.to_string()));
        self
    }

    /// Add an unqualified attribute.
    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.children.push(Node::Text(text.to_string()));
        self
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|a| a.prefix.is_none() && a.name == name)
        {
            existing.value = value.to_string();
            return;
        }
        self.attributes.push(Attribute {
            prefix: None,
            name: name.to_string(),
            namespace: None,
            value: value.to_string(),
        });
    }

    pub fn qualified_name(&self) -> String {
        qualify(self.prefix.as_deref(), &self.name)
    }

    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// Value of an unqualified attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> {
        self.elements().filter(move |e| e.is(namespace, name))
    }

    pub fn child<'a>(&'a self, namespace: &str, name: &str) -> Option<&'a Element> {
        self.elements().find(|e| e.is(namespace, name))
    }

    /// Index into `children` of the first matching child element.
    pub fn child_position(&self, namespace: &str, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|node| matches!(node, Node::Element(e) if e.is(namespace, name)))
    }

    pub fn insert_child(&mut self, index: usize, child: Element) {
        let index = index.min(self.children.len());
        self.children.insert(index, Node::Element(child));
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Every element in this subtree (including `self`) carrying `ID="id"`.
    pub fn find_by_id(&self, id: &str) -> Vec<&Element> {
        let mut found = Vec::new();
        self.collect_ids(id, &mut found);
        found
    }

    fn collect_ids<'a>(&'a self, id: &str, found: &mut Vec<&'a Element>) {
        if self.attr("ID") == Some(id) {
            found.push(self);
        }
        for child in self.elements() {
            child.collect_ids(id, found);
        }
    }

    /// Namespace bindings in effect at `target`'s parent, if `target` lies
    /// within this subtree. The walk compares node identity, not content.
    pub fn scope_of(&self, target: &Element) -> Option<Scope> {
        self.scope_walk(target, &Scope::new())
    }

    fn scope_walk(&self, target: &Element, inherited: &Scope) -> Option<Scope> {
        if std::ptr::eq(self, target) {
            return Some(inherited.clone());
        }
        let scope = self.extend_scope(inherited);
        self.elements()
            .find_map(|child| child.scope_walk(target, &scope))
    }

    /// `inherited` plus the declarations made on this element.
    pub fn extend_scope(&self, inherited: &Scope) -> Scope {
        let mut scope = inherited.clone();
        for (prefix, uri) in &self.declarations {
            if prefix.is_none() && uri.is_empty() {
                scope.remove(&None);
            } else {
                scope.insert(prefix.clone(), uri.clone());
            }
        }
        scope
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Serialization
    // ─────────────────────────────────────────────────────────────────────────

    /// Serialize with the declarations and attribute order as held.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        let qname = self.qualified_name();
        out.push('<');
        out.push_str(&qname);
        for (prefix, uri) in &self.declarations {
            write_declaration(out, prefix.as_deref(), uri);
        }
        for attr in &self.attributes {
            write_attribute(out, &attr.qualified_name(), &attr.value);
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(element) => element.write_xml(out),
                Node::Text(text) => escape_text(out, text),
            }
        }
        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }

    /// Exclusive XML canonicalization (without comments) of this subtree.
    ///
    /// `inherited` is the namespace scope at this element's parent; it only
    /// matters for prefixes named in `inclusive_prefixes` (`#default` names
    /// the default namespace). `exclude` is omitted from the output by node
    /// identity, which is how the enveloped-signature transform is applied.
    pub fn canonicalize(
        &self,
        inherited: &Scope,
        inclusive_prefixes: &[String],
        exclude: Option<&Element>,
    ) -> String {
        let mut out = String::new();
        self.write_canonical(
            &mut out,
            inherited,
            &Scope::new(),
            inclusive_prefixes,
            exclude,
        );
        out
    }

    fn write_canonical(
        &self,
        out: &mut String,
        inherited: &Scope,
        rendered: &Scope,
        inclusive_prefixes: &[String],
        exclude: Option<&Element>,
    ) {
        let in_scope = self.extend_scope(inherited);

        // Visibly utilized prefixes, bound to the URIs they resolved to.
        let mut utilized: Scope = Scope::new();
        utilized.insert(self.prefix.clone(), self.namespace.clone().unwrap_or_default());
        for attr in &self.attributes {
            if let Some(prefix) = &attr.prefix
                && prefix != "xml"
            {
                utilized.insert(Some(prefix.clone()), attr.namespace.clone().unwrap_or_default());
            }
        }
        for prefix in inclusive_prefixes {
            let key = (prefix != "#default").then(|| prefix.clone());
            if let Some(uri) = in_scope.get(&key) {
                utilized.entry(key).or_insert_with(|| uri.clone());
            }
        }

        let mut rendered_here = rendered.clone();
        let mut declarations = Vec::new();
        for (prefix, uri) in utilized {
            let current = rendered.get(&prefix).map(String::as_str).unwrap_or("");
            if current != uri {
                declarations.push((prefix.clone(), uri.clone()));
                rendered_here.insert(prefix, uri);
            }
        }

        let mut attributes: Vec<&Attribute> = self.attributes.iter().collect();
        attributes.sort_by(|a, b| {
            let a_ns = a.namespace.as_deref().unwrap_or("");
            let b_ns = b.namespace.as_deref().unwrap_or("");
            a_ns.cmp(b_ns).then_with(|| a.name.cmp(&b.name))
        });

        let qname = self.qualified_name();
        out.push('<');
        out.push_str(&qname);
        for (prefix, uri) in &declarations {
            write_declaration(out, prefix.as_deref(), uri);
        }
        for attr in attributes {
            write_attribute(out, &attr.qualified_name(), &attr.value);
        }
        out.push('>');
        for child in &self.children {
            match child {
                Node::Element(element) => {
                    if exclude.is_some_and(|excluded| std::ptr::eq(element, excluded)) {
                        continue;
                    }
                    element.write_canonical(
                        out,
                        &in_scope,
                        &rendered_here,
                        inclusive_prefixes,
                        exclude,
                    );
                }
                Node::Text(text) => escape_text(out, text),
            }
        }
        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
}

fn write_declaration(out: &mut String, prefix: Option<&str>, uri: &str) {
    let name = match prefix {
        Some(p) => format!("xmlns:{p}"),
        None => "xmlns".to_string(),
    };
    write_attribute(out, &name, uri);
}

fn write_attribute(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    escape_attribute(out, value);
    out.push('"');
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

/// Escape a value for embedding in hand-assembled XML text or attributes.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
