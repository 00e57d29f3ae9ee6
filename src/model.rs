use crate::error::{Error, Result};
use crate::graph::{AnchorRelation, EdgeKind, NODE_KIND, NodeKind, Ticket};
use crate::span::Span;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Written first, with an empty value, into every store this pipeline builds.
pub const COLUMNAR_TABLE_MARKER: &[u8] = b"kythe:columnar";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Decorations,
    CrossReferences,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Decorations, Table::CrossReferences];

    pub fn tag(self) -> &'static [u8] {
        match self {
            Table::Decorations => b"decor:",
            Table::CrossReferences => b"xrefs:",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Decorations => "decor",
            Table::CrossReferences => "xrefs",
        }
    }

    pub fn key(self, ticket: &Ticket) -> Vec<u8> {
        let tag = self.tag();
        let mut key = Vec::with_capacity(tag.len() + ticket.as_bytes().len());
        key.extend_from_slice(tag);
        key.extend_from_slice(ticket.as_bytes());
        key
    }

    /// Recover the ticket portion of a key from this table.
    pub fn ticket_of(self, key: &[u8]) -> Option<&str> {
        key.strip_prefix(self.tag())
            .and_then(|rest| std::str::from_utf8(rest).ok())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "decor" | "decorations" => Ok(Table::Decorations),
            "xrefs" | "cross_references" => Ok(Table::CrossReferences),
            other => Err(format!("unknown table {other:?} (expected decor or xrefs)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DecorationReference {
    pub span: Span,
    pub edge_kind: EdgeKind,
    pub target: Ticket,
    pub anchor: Ticket,
}

/// Everything served for one file: its text and every anchor edge in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecorationRecord {
    pub file: Ticket,
    pub source_text: Option<Vec<u8>>,
    pub encoding: Option<String>,
    /// Sorted by span start, span end, edge kind, then target.
    pub references: Vec<DecorationReference>,
    /// Anchors dropped for malformed locations.
    pub dropped_anchors: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnchorEntry {
    pub parent: Ticket,
    pub span: Span,
    pub anchor: Ticket,
    pub edge_kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelatedNode {
    pub relation: EdgeKind,
    pub ticket: Ticket,
    /// Kind of the related node, when the graph carries it.
    pub node_kind: Option<NodeKind>,
}

/// Everything served for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReferenceRecord {
    pub ticket: Ticket,
    pub marked_source: Option<MarkedSource>,
    pub node_kind: Option<NodeKind>,
    /// Node facts, minus the encoded display blob.
    pub facts: BTreeMap<String, Vec<u8>>,
    /// Set only when exactly one definition anchor targets this node.
    pub definition: Option<Ticket>,
    pub anchors: BTreeMap<AnchorRelation, Vec<AnchorEntry>>,
    pub related: Vec<RelatedNode>,
}

impl CrossReferenceRecord {
    pub fn bucket(&self, relation: AnchorRelation) -> &[AnchorEntry] {
        self.anchors.get(&relation).map(Vec::as_slice).unwrap_or_default()
    }

    /// The anchor entry behind `definition`, if any.
    pub fn definition_anchor(&self) -> Option<&AnchorEntry> {
        let ticket = self.definition.as_ref()?;
        self.bucket(AnchorRelation::Definition)
            .iter()
            .find(|entry| &entry.anchor == ticket)
    }

    /// Facts as served to clients, with the node kind synthesized.
    pub fn node_facts(&self) -> BTreeMap<String, Vec<u8>> {
        let mut facts = self.facts.clone();
        if let Some(kind) = &self.node_kind {
            facts.insert(NODE_KIND.to_string(), kind.as_str().as_bytes().to_vec());
        }
        facts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkedSourceKind {
    #[default]
    Box,
    Type,
    Parameter,
    Identifier,
    Context,
    Initializer,
    Modifier,
}

/// Structured rendering of a symbol's signature, carried in the `CODE` fact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkedSource {
    pub kind: MarkedSourceKind,
    pub pre_text: String,
    pub child: Vec<MarkedSource>,
    pub post_child_text: String,
    pub post_text: String,
}

impl MarkedSource {
    pub fn identifier(text: &str) -> Self {
        MarkedSource {
            kind: MarkedSourceKind::Identifier,
            pre_text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| Error::Parse(format!("undecodable marked source: {err}")))
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing plain strings and vectors cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Flatten to display text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        out.push_str(&self.pre_text);
        for (idx, child) in self.child.iter().enumerate() {
            if idx > 0 {
                out.push_str(&self.post_child_text);
            }
            child.render_into(out);
        }
        out.push_str(&self.post_text);
    }
}

pub fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(record)?)
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::VName;

    #[test]
    fn table_keys_are_tag_prefixed() {
        let ticket = VName::with_path("a.go").ticket();
        let key = Table::Decorations.key(&ticket);
        assert_eq!(key, b"decor:kythe:?path=a.go".to_vec());
        assert_eq!(Table::Decorations.ticket_of(&key), Some("kythe:?path=a.go"));
        assert_eq!(Table::CrossReferences.ticket_of(&key), None);
        assert!(!key.starts_with(COLUMNAR_TABLE_MARKER));
    }

    #[test]
    fn marked_source_renders_children() {
        let ms = MarkedSource {
            kind: MarkedSourceKind::Box,
            pre_text: "fn ".into(),
            child: vec![
                MarkedSource::identifier("a"),
                MarkedSource::identifier("b"),
            ],
            post_child_text: ", ".into(),
            post_text: ")".into(),
        };
        assert_eq!(ms.render(), "fn a, b)");
        assert_eq!(MarkedSource::decode(&ms.encode()).unwrap(), ms);
        assert!(matches!(MarkedSource::decode(b"\x00garbage"), Err(Error::Parse(_))));
    }

    #[test]
    fn node_facts_include_kind() {
        let record = CrossReferenceRecord {
            ticket: VName::with_signature("s").ticket(),
            marked_source: None,
            node_kind: Some(NodeKind::Record),
            facts: BTreeMap::from([("/x".to_string(), b"1".to_vec())]),
            definition: None,
            anchors: BTreeMap::new(),
            related: Vec::new(),
        };
        let facts = record.node_facts();
        assert_eq!(facts.get(NODE_KIND).map(Vec::as_slice), Some(&b"record"[..]));
        assert_eq!(facts.len(), 2);
        assert!(record.bucket(AnchorRelation::Reference).is_empty());
        assert!(record.definition_anchor().is_none());
    }
}
