//! In-memory model of the semantic graph produced by language analyzers.
//!
//! Nodes are consumed as already-decoded records: an identity ([`VName`]), a
//! kind, a fact map and an ordered list of outgoing edges. The core never
//! mutates them.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const TEXT: &str = "/kythe/text";
pub const TEXT_ENCODING: &str = "/kythe/text/encoding";
pub const LOC_START: &str = "/kythe/loc/start";
pub const LOC_END: &str = "/kythe/loc/end";
pub const CODE: &str = "/kythe/code";
pub const NODE_KIND: &str = "/kythe/node/kind";

const TICKET_SCHEME: &str = "kythe:";

/// Stable identity of a graph node. Empty fields are unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct VName {
    pub corpus: String,
    pub language: String,
    pub root: String,
    pub path: String,
    pub signature: String,
}

impl VName {
    pub fn with_signature(signature: &str) -> Self {
        VName {
            signature: signature.to_string(),
            ..Default::default()
        }
    }

    pub fn with_path(path: &str) -> Self {
        VName {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Identity of the file containing this node.
    pub fn file(&self) -> VName {
        VName {
            corpus: self.corpus.clone(),
            root: self.root.clone(),
            path: self.path.clone(),
            ..Default::default()
        }
    }

    pub fn ticket(&self) -> Ticket {
        Ticket::from_vname(self)
    }
}

/// Canonical string encoding of a [`VName`]:
/// `kythe:[//corpus][?lang=L][?path=P][?root=R][#signature]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(String);

impl Ticket {
    pub fn from_vname(vname: &VName) -> Self {
        let mut out = String::from(TICKET_SCHEME);
        if !vname.corpus.is_empty() {
            out.push_str("//");
            escape_into(&mut out, &vname.corpus, false);
        }
        for (key, value) in [
            ("lang", &vname.language),
            ("path", &vname.path),
            ("root", &vname.root),
        ] {
            if value.is_empty() {
                continue;
            }
            out.push('?');
            out.push_str(key);
            out.push('=');
            escape_into(&mut out, value, false);
        }
        if !vname.signature.is_empty() {
            out.push('#');
            escape_into(&mut out, &vname.signature, true);
        }
        Ticket(out)
    }

    /// Parse and canonicalize a ticket string.
    pub fn parse(raw: &str) -> Result<Self> {
        Ok(Self::from_vname(&Self::decode(raw)?))
    }

    /// Decode a ticket string back into its [`VName`].
    pub fn decode(raw: &str) -> Result<VName> {
        let rest = raw
            .trim()
            .strip_prefix(TICKET_SCHEME)
            .ok_or_else(|| Error::Parse(format!("ticket {raw:?} lacks the kythe: scheme")))?;
        let (rest, signature) = match rest.split_once('#') {
            Some((head, sig)) => (head, Some(sig)),
            None => (rest, None),
        };
        let mut vname = VName::default();
        if let Some(sig) = signature {
            vname.signature = unescape(sig)?;
        }
        let mut params = rest.split('?');
        let authority = params.next().unwrap_or_default();
        if let Some(corpus) = authority.strip_prefix("//") {
            vname.corpus = unescape(corpus)?;
        } else if !authority.is_empty() {
            return Err(Error::Parse(format!(
                "ticket {raw:?} has an unexpected authority {authority:?}"
            )));
        }
        for param in params {
            let Some((key, value)) = param.split_once('=') else {
                return Err(Error::Parse(format!("ticket {raw:?} has malformed parameter {param:?}")));
            };
            let value = unescape(value)?;
            match key {
                "lang" => vname.language = value,
                "path" => vname.path = value,
                "root" => vname.root = value,
                other => {
                    return Err(Error::Parse(format!(
                        "ticket {raw:?} has unknown parameter {other:?}"
                    )));
                }
            }
        }
        Ok(vname)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_into(out: &mut String, value: &str, escape_slash: bool) {
    for byte in value.bytes() {
        let reserved = matches!(byte, b'%' | b'?' | b'#') || (escape_slash && byte == b'/');
        if reserved || byte <= b' ' || byte >= 0x7f {
            out.push_str(&format!("%{byte:02X}"));
        } else {
            out.push(byte as char);
        }
    }
}

fn unescape(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = value
                .get(idx + 1..idx + 3)
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| Error::Parse(format!("bad percent escape in {value:?}")))?;
            out.push(hex);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).map_err(|err| Error::Parse(format!("ticket is not utf-8: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    File,
    Anchor,
    Record,
    Function,
    Variable,
    Interface,
    Package,
    TypeAlias,
    Constant,
    Other(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::File => "file",
            Self::Anchor => "anchor",
            Self::Record => "record",
            Self::Function => "function",
            Self::Variable => "variable",
            Self::Interface => "interface",
            Self::Package => "package",
            Self::TypeAlias => "talias",
            Self::Constant => "constant",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for NodeKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "file" => Self::File,
            "anchor" => Self::Anchor,
            "record" => Self::Record,
            "function" => Self::Function,
            "variable" => Self::Variable,
            "interface" => Self::Interface,
            "package" => Self::Package,
            "talias" => Self::TypeAlias,
            "constant" => Self::Constant,
            _ => Self::Other(value),
        }
    }
}

impl From<NodeKind> for String {
    fn from(value: NodeKind) -> Self {
        match value {
            NodeKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// How an anchor relates to the node its edge points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorRelation {
    Reference,
    Definition,
    Declaration,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EdgeKind {
    Ref,
    RefCall,
    RefImports,
    Defines,
    DefinesBinding,
    Completes,
    CompletesUniquely,
    ChildOf,
    Typed,
    Overrides,
    Unknown(String),
}

impl EdgeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ref => "/kythe/edge/ref",
            Self::RefCall => "/kythe/edge/ref/call",
            Self::RefImports => "/kythe/edge/ref/imports",
            Self::Defines => "/kythe/edge/defines",
            Self::DefinesBinding => "/kythe/edge/defines/binding",
            Self::Completes => "/kythe/edge/completes",
            Self::CompletesUniquely => "/kythe/edge/completes/uniquely",
            Self::ChildOf => "/kythe/edge/childof",
            Self::Typed => "/kythe/edge/typed",
            Self::Overrides => "/kythe/edge/overrides",
            Self::Unknown(name) => name,
        }
    }

    /// Relation bucket for this edge when it leaves an anchor.
    pub fn relation(&self) -> AnchorRelation {
        match self {
            Self::Ref | Self::RefCall | Self::RefImports => AnchorRelation::Reference,
            Self::Defines | Self::DefinesBinding => AnchorRelation::Definition,
            Self::Completes | Self::CompletesUniquely => AnchorRelation::Declaration,
            Self::ChildOf | Self::Typed | Self::Overrides | Self::Unknown(_) => {
                AnchorRelation::Ignored
            }
        }
    }
}

impl From<String> for EdgeKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "/kythe/edge/ref" => Self::Ref,
            "/kythe/edge/ref/call" => Self::RefCall,
            "/kythe/edge/ref/imports" => Self::RefImports,
            "/kythe/edge/defines" => Self::Defines,
            "/kythe/edge/defines/binding" => Self::DefinesBinding,
            "/kythe/edge/completes" => Self::Completes,
            "/kythe/edge/completes/uniquely" => Self::CompletesUniquely,
            "/kythe/edge/childof" => Self::ChildOf,
            "/kythe/edge/typed" => Self::Typed,
            "/kythe/edge/overrides" => Self::Overrides,
            _ => Self::Unknown(value),
        }
    }
}

impl From<EdgeKind> for String {
    fn from(value: EdgeKind) -> Self {
        match value {
            EdgeKind::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub kind: EdgeKind,
    pub target: VName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub source: VName,
    pub kind: NodeKind,
    #[serde(default, with = "crate::util::fact_map")]
    pub facts: BTreeMap<String, Vec<u8>>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphNode {
    pub fn new(source: VName, kind: NodeKind) -> Self {
        GraphNode {
            source,
            kind,
            facts: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn with_fact(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.facts.insert(name.to_string(), value.into());
        self
    }

    pub fn with_edge(mut self, kind: EdgeKind, target: VName) -> Self {
        self.edges.push(Edge { kind, target });
        self
    }

    pub fn fact(&self, name: &str) -> Option<&[u8]> {
        self.facts.get(name).map(Vec::as_slice)
    }

    pub fn ticket(&self) -> Ticket {
        self.source.ticket()
    }

    /// Decimal byte offset stored in `LOC_START`/`LOC_END`.
    pub fn loc_offset(&self, name: &str) -> Result<i64> {
        let raw = self
            .fact(name)
            .ok_or_else(|| Error::Parse(format!("missing {name}")))?;
        std::str::from_utf8(raw)
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .ok_or_else(|| {
                Error::Parse(format!(
                    "non-numeric {name}: {:?}",
                    String::from_utf8_lossy(raw)
                ))
            })
    }

    pub fn from_json_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_follow_the_canonical_layout() {
        assert_eq!(VName::with_signature("simpleDecor").ticket().as_str(), "kythe:#simpleDecor");
        assert_eq!(VName::with_path("path").ticket().as_str(), "kythe:?path=path");
        assert_eq!(VName::default().ticket().as_str(), "kythe:");

        let full = VName {
            corpus: "example.com/repo".into(),
            language: "go".into(),
            root: "out".into(),
            path: "a b/c.go".into(),
            signature: "pkg/Type#1".into(),
        };
        let ticket = full.ticket();
        assert_eq!(
            ticket.as_str(),
            "kythe://example.com/repo?lang=go?path=a%20b/c.go?root=out#pkg%2FType%231"
        );
        assert_eq!(Ticket::decode(ticket.as_str()).unwrap(), full);
    }

    #[test]
    fn ticket_parse_rejects_foreign_schemes() {
        assert!(matches!(Ticket::parse("http://x"), Err(Error::Parse(_))));
        assert!(matches!(Ticket::parse("kythe:?bogus=1"), Err(Error::Parse(_))));
        assert!(matches!(Ticket::parse("kythe:#bad%zz"), Err(Error::Parse(_))));
        assert_eq!(Ticket::parse("  kythe:?path=p ").unwrap().as_str(), "kythe:?path=p");
    }

    #[test]
    fn file_identity_drops_signature_and_language() {
        let anchor = VName {
            corpus: "c".into(),
            language: "rust".into(),
            root: "r".into(),
            path: "src/lib.rs".into(),
            signature: "anchor1".into(),
        };
        let file = anchor.file();
        assert_eq!(file.path, "src/lib.rs");
        assert_eq!(file.corpus, "c");
        assert!(file.signature.is_empty());
        assert!(file.language.is_empty());
    }

    #[test]
    fn edge_kinds_map_to_relations_totally() {
        assert_eq!(EdgeKind::Ref.relation(), AnchorRelation::Reference);
        assert_eq!(EdgeKind::RefCall.relation(), AnchorRelation::Reference);
        assert_eq!(EdgeKind::DefinesBinding.relation(), AnchorRelation::Definition);
        assert_eq!(EdgeKind::Completes.relation(), AnchorRelation::Declaration);
        assert_eq!(EdgeKind::ChildOf.relation(), AnchorRelation::Ignored);
        let custom = EdgeKind::from("/acme/edge/special".to_string());
        assert_eq!(custom, EdgeKind::Unknown("/acme/edge/special".into()));
        assert_eq!(custom.relation(), AnchorRelation::Ignored);
        assert_eq!(String::from(EdgeKind::Defines), "/kythe/edge/defines");
    }

    #[test]
    fn loc_offsets_must_be_decimal() {
        let node = GraphNode::new(VName::with_signature("a"), NodeKind::Anchor)
            .with_fact(LOC_START, "12")
            .with_fact(LOC_END, "x1");
        assert_eq!(node.loc_offset(LOC_START).unwrap(), 12);
        assert!(matches!(node.loc_offset(LOC_END), Err(Error::Parse(_))));
        assert!(matches!(node.loc_offset(TEXT), Err(Error::Parse(_))));
    }

    #[test]
    fn nodes_decode_from_json_lines() {
        let node = GraphNode::from_json_line(
            r#"{"source":{"path":"p","signature":"a1"},"kind":"anchor",
                "facts":{"/kythe/loc/start":"0","/kythe/loc/end":"4"},
                "edges":[{"kind":"/kythe/edge/ref","target":{"signature":"t"}}]}"#,
        )
        .unwrap();
        assert_eq!(node.kind, NodeKind::Anchor);
        assert_eq!(node.fact(LOC_END), Some(&b"4"[..]));
        assert_eq!(node.edges[0].kind, EdgeKind::Ref);
        assert_eq!(node.edges[0].target.ticket().as_str(), "kythe:#t");
    }
}
