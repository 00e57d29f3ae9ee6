//! Read-only query service over a finalized serving store.
//!
//! Every request is answered from point lookups and nothing is cached
//! between requests, so one service value can be shared by any number of
//! threads.

use crate::config::Config;
use crate::db::{KeyValueStore, StoreDigest, StoreFormat, digest};
use crate::error::{Error, Result};
use crate::graph::{AnchorRelation, EdgeKind, NodeKind, Ticket};
use crate::model::{
    AnchorEntry, CrossReferenceRecord, DecorationRecord, MarkedSource, RelatedNode, Table,
    decode_record,
};
use crate::span::{Normalizer, Span};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod filter;

pub use filter::FactFilter;

/// Cancellation handle for one request. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancelled: Arc<AtomicBool>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once `cancel` has been called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub ticket: String,
    /// Restricts returned references to those inside this span.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DecorationsRequest {
    pub location: Location,
    pub source_text: bool,
    pub references: bool,
    pub target_definitions: bool,
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub span: Span,
    pub kind: EdgeKind,
    pub target_ticket: Ticket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_definition: Option<Ticket>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default, with = "crate::util::fact_map")]
    pub facts: BTreeMap<String, Vec<u8>>,
}

/// An anchor as served: where it is and the line it sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub ticket: Ticket,
    pub kind: EdgeKind,
    pub parent: Ticket,
    pub span: Span,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_span: Option<Span>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecorationsReply {
    pub location: Location,
    #[serde(with = "crate::util::opt_bytes", skip_serializing_if = "Option::is_none")]
    pub source_text: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    pub reference: Vec<Reference>,
    pub nodes: BTreeMap<String, NodeInfo>,
    pub definition_locations: BTreeMap<String, Anchor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    #[default]
    #[serde(rename = "NONE")]
    NoReferences,
    #[serde(rename = "ALL_REFERENCES")]
    AllReferences,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefinitionKind {
    #[default]
    #[serde(rename = "NONE")]
    NoDefinitions,
    #[serde(rename = "ALL_DEFINITIONS")]
    AllDefinitions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeclarationKind {
    #[default]
    #[serde(rename = "NONE")]
    NoDeclarations,
    #[serde(rename = "ALL_DECLARATIONS")]
    AllDeclarations,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossReferencesRequest {
    pub ticket: Vec<String>,
    pub filter: Vec<String>,
    pub reference_kind: ReferenceKind,
    pub definition_kind: DefinitionKind,
    pub declaration_kind: DeclarationKind,
    /// Node-kind globs selecting related nodes. Empty selects all, `NONE` none.
    pub related_node_kind: Vec<String>,
    /// Anchors per bucket; 0 means the configured maximum.
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedNodeInfo {
    pub relation_kind: EdgeKind,
    pub ticket: Ticket,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_kind: Option<NodeKind>,
}

/// Which related nodes a cross-references request asked for.
enum RelatedSelection {
    All,
    Nothing,
    Kinds(FactFilter),
}

impl RelatedSelection {
    fn from_request(kinds: &[String]) -> Self {
        if kinds.iter().any(|kind| kind.trim() == "NONE") {
            return RelatedSelection::Nothing;
        }
        let filter = FactFilter::compile(kinds);
        if filter.is_empty() {
            RelatedSelection::All
        } else {
            RelatedSelection::Kinds(filter)
        }
    }

    fn selects(&self, node: &RelatedNode) -> bool {
        match self {
            RelatedSelection::All => true,
            RelatedSelection::Nothing => false,
            RelatedSelection::Kinds(filter) => node
                .node_kind
                .as_ref()
                .is_some_and(|kind| filter.matches(kind.as_str())),
        }
    }
}

/// Bucket sizes before `page_size` capping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub references: usize,
    pub definitions: usize,
    pub declarations: usize,
    pub related_nodes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossReferenceSet {
    pub ticket: Ticket,
    /// `marked_source` flattened to plain text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marked_source: Option<MarkedSource>,
    #[serde(default)]
    pub reference: Vec<Anchor>,
    #[serde(default)]
    pub definition: Vec<Anchor>,
    #[serde(default)]
    pub declaration: Vec<Anchor>,
    #[serde(default)]
    pub related_node: Vec<RelatedNodeInfo>,
    #[serde(default)]
    pub total: Totals,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossReferencesReply {
    pub cross_references: BTreeMap<String, CrossReferenceSet>,
    pub nodes: BTreeMap<String, NodeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub ticket: String,
    pub bytes: usize,
}

/// Text and line table of one file, loaded for snippets.
struct FileText {
    text: Vec<u8>,
    normalizer: Normalizer,
}

/// Per-request memo of parent files, keyed by file ticket.
type FileCache = HashMap<Ticket, Option<FileText>>;

pub struct XRefService<S> {
    store: S,
    format: StoreFormat,
}

impl<S: KeyValueStore> XRefService<S> {
    /// Wrap `store`, rejecting it unless it carries the table marker.
    pub fn open(store: S) -> Result<Self> {
        let format = StoreFormat::detect(&store)?;
        tracing::debug!(?format, "serving store opened");
        Ok(XRefService { store, format })
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn decorations(&self, ctx: &QueryContext, req: &DecorationsRequest) -> Result<DecorationsReply> {
        ctx.check()?;
        let ticket = Ticket::parse(&req.location.ticket)?;
        tracing::debug!(ticket = %ticket, "decorations");
        let record: DecorationRecord = self
            .fetch(ctx, Table::Decorations, &ticket)?
            .ok_or_else(|| Error::NotFound(format!("decorations for {ticket}")))?;

        let mut reply = DecorationsReply {
            location: Location {
                ticket: ticket.to_string(),
                span: req.location.span,
            },
            ..Default::default()
        };
        if req.source_text {
            reply.source_text = record.source_text.clone();
            reply.encoding = record.encoding.clone();
        }

        // The filter projects target node facts; it never drops references.
        let filter = self.resolve_filter(&req.filter);
        let references: Vec<_> = record
            .references
            .iter()
            .filter(|r| req.location.span.is_none_or(|within| within.contains(&r.span)))
            .collect();

        let wants_targets = req.target_definitions || !filter.is_empty();
        let mut targets: BTreeMap<Ticket, Option<CrossReferenceRecord>> = BTreeMap::new();
        if wants_targets {
            let distinct: BTreeSet<&Ticket> = references.iter().map(|r| &r.target).collect();
            for target in distinct {
                let xref = self.fetch(ctx, Table::CrossReferences, target)?;
                targets.insert(target.clone(), xref);
            }
        }

        if req.references {
            let mut files = FileCache::new();
            for reference in &references {
                let mut target_definition = None;
                if req.target_definitions {
                    let def = targets
                        .get(&reference.target)
                        .and_then(Option::as_ref)
                        .and_then(CrossReferenceRecord::definition_anchor);
                    if let Some(entry) = def {
                        target_definition = Some(entry.anchor.clone());
                        if !reply.definition_locations.contains_key(entry.anchor.as_str()) {
                            let anchor = self.anchor(ctx, &mut files, entry)?;
                            reply
                                .definition_locations
                                .insert(entry.anchor.to_string(), anchor);
                        }
                    }
                }
                reply.reference.push(Reference {
                    span: reference.span,
                    kind: reference.edge_kind.clone(),
                    target_ticket: reference.target.clone(),
                    target_definition,
                });
            }
        }

        if !filter.is_empty() {
            for (target, xref) in &targets {
                let Some(xref) = xref else { continue };
                let facts = filter.filter_facts(&xref.node_facts());
                if !facts.is_empty() {
                    reply.nodes.insert(target.to_string(), NodeInfo { facts });
                }
            }
        }

        Ok(reply)
    }

    pub fn cross_references(
        &self,
        ctx: &QueryContext,
        req: &CrossReferencesRequest,
    ) -> Result<CrossReferencesReply> {
        ctx.check()?;
        if req.ticket.is_empty() {
            return Err(Error::InvalidRequest("no tickets requested".to_string()));
        }
        let tickets: BTreeSet<Ticket> = req
            .ticket
            .iter()
            .map(|raw| Ticket::parse(raw))
            .collect::<Result<_>>()?;
        tracing::debug!(tickets = tickets.len(), "cross_references");

        let max_page = Config::get().max_page_size.max(1);
        let page_size = match req.page_size {
            0 => max_page,
            n => n.min(max_page),
        };
        let filter = self.resolve_filter(&req.filter);
        let related = RelatedSelection::from_request(&req.related_node_kind);

        let mut reply = CrossReferencesReply::default();
        let mut files = FileCache::new();
        for ticket in &tickets {
            let Some(record) = self.fetch::<CrossReferenceRecord>(ctx, Table::CrossReferences, ticket)?
            else {
                tracing::debug!(ticket = %ticket, "no cross-references");
                continue;
            };

            let mut set = CrossReferenceSet {
                ticket: ticket.clone(),
                display: record.marked_source.as_ref().map(MarkedSource::render),
                marked_source: record.marked_source.clone(),
                reference: Vec::new(),
                definition: Vec::new(),
                declaration: Vec::new(),
                related_node: Vec::new(),
                total: Totals::default(),
            };

            if req.reference_kind == ReferenceKind::AllReferences {
                let bucket = record.bucket(AnchorRelation::Reference);
                set.total.references = bucket.len();
                set.reference = self.anchors(ctx, &mut files, bucket, page_size)?;
            }
            if req.definition_kind == DefinitionKind::AllDefinitions {
                let bucket = record.bucket(AnchorRelation::Definition);
                set.total.definitions = bucket.len();
                set.definition = self.anchors(ctx, &mut files, bucket, page_size)?;
            }
            if req.declaration_kind == DeclarationKind::AllDeclarations {
                let bucket = record.bucket(AnchorRelation::Declaration);
                set.total.declarations = bucket.len();
                set.declaration = self.anchors(ctx, &mut files, bucket, page_size)?;
            }

            set.related_node = record
                .related
                .iter()
                .filter(|node| related.selects(node))
                .map(|node| RelatedNodeInfo {
                    relation_kind: node.relation.clone(),
                    ticket: node.ticket.clone(),
                    node_kind: node.node_kind.clone(),
                })
                .collect();
            set.total.related_nodes = set.related_node.len();

            if !filter.is_empty() {
                let facts = filter.filter_facts(&record.node_facts());
                if !facts.is_empty() {
                    reply.nodes.insert(ticket.to_string(), NodeInfo { facts });
                }
                for related in &set.related_node {
                    if reply.nodes.contains_key(related.ticket.as_str()) {
                        continue;
                    }
                    let node: Option<CrossReferenceRecord> =
                        self.fetch(ctx, Table::CrossReferences, &related.ticket)?;
                    if let Some(node) = node {
                        let facts = filter.filter_facts(&node.node_facts());
                        if !facts.is_empty() {
                            reply.nodes.insert(related.ticket.to_string(), NodeInfo { facts });
                        }
                    }
                }
            }

            reply.cross_references.insert(ticket.to_string(), set);
        }
        Ok(reply)
    }

    /// Row count and content hash of each table.
    pub fn stats(&self) -> Result<StoreDigest> {
        digest(&self.store)
    }

    /// Tickets stored in `table`, in key order.
    pub fn entries(&self, table: Table, limit: Option<usize>) -> Result<Vec<TableEntry>> {
        let mut out = Vec::new();
        for entry in self.store.scan_prefix(table.tag()) {
            if limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            let (key, value) = entry?;
            let ticket = table
                .ticket_of(&key)
                .map(str::to_string)
                .unwrap_or_else(|| String::from_utf8_lossy(&key).into_owned());
            out.push(TableEntry {
                ticket,
                bytes: value.len(),
            });
        }
        Ok(out)
    }

    fn resolve_filter(&self, requested: &[String]) -> FactFilter {
        let filter = FactFilter::compile(requested);
        if filter.is_empty() {
            FactFilter::compile(&Config::get().default_filter)
        } else {
            filter
        }
    }

    fn fetch<T: DeserializeOwned>(&self, ctx: &QueryContext, table: Table, ticket: &Ticket) -> Result<Option<T>> {
        ctx.check()?;
        match self.store.get(&table.key(ticket))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn anchors(
        &self,
        ctx: &QueryContext,
        files: &mut FileCache,
        bucket: &[AnchorEntry],
        page_size: usize,
    ) -> Result<Vec<Anchor>> {
        bucket
            .iter()
            .take(page_size)
            .map(|entry| self.anchor(ctx, files, entry))
            .collect()
    }

    fn anchor(&self, ctx: &QueryContext, files: &mut FileCache, entry: &AnchorEntry) -> Result<Anchor> {
        if !files.contains_key(&entry.parent) {
            let record: Option<DecorationRecord> = self.fetch(ctx, Table::Decorations, &entry.parent)?;
            let file = record.and_then(|record| record.source_text).map(|text| FileText {
                normalizer: Normalizer::new(&text),
                text,
            });
            files.insert(entry.parent.clone(), file);
        }

        let snippet = files
            .get(&entry.parent)
            .and_then(Option::as_ref)
            .and_then(|file| file.normalizer.line_snippet(&file.text, &entry.span.start));
        let (snippet, snippet_span) = match snippet {
            Some((text, span)) => (Some(text.into_owned()), Some(span)),
            None => (None, None),
        };

        Ok(Anchor {
            ticket: entry.anchor.clone(),
            kind: entry.edge_kind.clone(),
            parent: entry.parent.clone(),
            span: entry.span,
            snippet,
            snippet_span,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{KeyValueWriter, MemoryStore};
    use crate::graph::{EdgeKind, GraphNode, LOC_END, LOC_START, NodeKind, TEXT, VName};
    use crate::pipeline;

    fn service(nodes: &[GraphNode]) -> XRefService<MemoryStore> {
        let store = MemoryStore::new();
        let mut writer = store.writer();
        pipeline::run(nodes).write_to(&mut writer).unwrap();
        writer.close().unwrap();
        XRefService::open(store).unwrap()
    }

    fn fixture() -> Vec<GraphNode> {
        let file = VName::with_path("f");
        let anchor = |sig: &str, start: i64, end: i64, kind: EdgeKind, target: &str| {
            GraphNode::new(
                VName {
                    path: "f".into(),
                    signature: sig.into(),
                    ..Default::default()
                },
                NodeKind::Anchor,
            )
            .with_fact(LOC_START, start.to_string())
            .with_fact(LOC_END, end.to_string())
            .with_edge(kind, VName::with_signature(target))
        };
        vec![
            GraphNode::new(file, NodeKind::File).with_fact(TEXT, "fn go() {}\ngo();\n"),
            anchor("def", 3, 5, EdgeKind::DefinesBinding, "go"),
            anchor("call", 11, 13, EdgeKind::RefCall, "go"),
            GraphNode::new(VName::with_signature("go"), NodeKind::Function)
                .with_edge(EdgeKind::ChildOf, VName::with_signature("mod")),
            GraphNode::new(VName::with_signature("mod"), NodeKind::Package),
        ]
    }

    #[test]
    fn stores_without_marker_are_rejected() {
        assert!(matches!(XRefService::open(MemoryStore::new()), Err(Error::Format(_))));
    }

    #[test]
    fn span_restriction_limits_references() {
        let svc = service(&fixture());
        let req = DecorationsRequest {
            location: Location {
                ticket: "kythe:?path=f".into(),
                span: Some(Span::unknown(10, 20)),
            },
            references: true,
            ..Default::default()
        };
        let reply = svc.decorations(&QueryContext::new(), &req).unwrap();
        assert_eq!(reply.reference.len(), 1);
        assert_eq!(reply.reference[0].kind, EdgeKind::RefCall);
        assert!(reply.source_text.is_none());
    }

    #[test]
    fn fact_filter_projects_nodes_without_dropping_references() {
        let svc = service(&fixture());
        let req = DecorationsRequest {
            location: Location {
                ticket: "kythe:?path=f".into(),
                span: None,
            },
            references: true,
            filter: vec!["/kythe/node/kind".into()],
            ..Default::default()
        };
        let reply = svc.decorations(&QueryContext::new(), &req).unwrap();
        assert_eq!(reply.reference.len(), 2);
        assert_eq!(reply.nodes.len(), 1);
        assert_eq!(
            reply.nodes["kythe:#go"].facts.get("/kythe/node/kind").map(Vec::as_slice),
            Some(&b"function"[..])
        );
    }

    #[test]
    fn related_nodes_paging_and_totals() {
        let svc = service(&fixture());
        let req = CrossReferencesRequest {
            ticket: vec!["kythe:#go".into()],
            reference_kind: ReferenceKind::AllReferences,
            definition_kind: DefinitionKind::AllDefinitions,
            related_node_kind: vec!["**".into()],
            filter: vec!["/kythe/node/kind".into()],
            page_size: 1,
            ..Default::default()
        };
        let reply = svc.cross_references(&QueryContext::new(), &req).unwrap();
        let set = &reply.cross_references["kythe:#go"];
        assert_eq!(set.total.references, 1);
        assert_eq!(set.total.definitions, 1);
        assert_eq!(set.reference[0].snippet.as_deref(), Some("go();"));
        assert_eq!(set.definition[0].snippet.as_deref(), Some("fn go() {}"));
        assert_eq!(set.related_node.len(), 1);
        assert_eq!(set.related_node[0].relation_kind, EdgeKind::ChildOf);
        assert_eq!(
            reply.nodes["kythe:#mod"].facts.get("/kythe/node/kind").map(Vec::as_slice),
            Some(&b"package"[..])
        );
        assert!(set.declaration.is_empty());
    }

    #[test]
    fn related_nodes_select_by_node_kind() {
        let svc = service(&fixture());
        let mut req = CrossReferencesRequest {
            ticket: vec!["kythe:#go".into()],
            ..Default::default()
        };
        let reply = svc.cross_references(&QueryContext::new(), &req).unwrap();
        let related = &reply.cross_references["kythe:#go"].related_node;
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].ticket.as_str(), "kythe:#mod");
        assert_eq!(related[0].node_kind, Some(NodeKind::Package));

        req.related_node_kind = vec!["record".into()];
        let reply = svc.cross_references(&QueryContext::new(), &req).unwrap();
        let set = &reply.cross_references["kythe:#go"];
        assert!(set.related_node.is_empty());
        assert_eq!(set.total.related_nodes, 0);

        req.related_node_kind = vec!["pack*".into()];
        let reply = svc.cross_references(&QueryContext::new(), &req).unwrap();
        assert_eq!(reply.cross_references["kythe:#go"].related_node.len(), 1);
    }

    #[test]
    fn related_none_selects_nothing() {
        let svc = service(&fixture());
        let req = CrossReferencesRequest {
            ticket: vec!["kythe:#go".into()],
            related_node_kind: vec!["NONE".into()],
            ..Default::default()
        };
        let reply = svc.cross_references(&QueryContext::new(), &req).unwrap();
        assert!(reply.cross_references["kythe:#go"].related_node.is_empty());
        assert!(reply.cross_references["kythe:#go"].reference.is_empty());
    }

    #[test]
    fn empty_ticket_list_is_invalid() {
        let svc = service(&fixture());
        let err = svc
            .cross_references(&QueryContext::new(), &CrossReferencesRequest::default())
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn entries_list_table_tickets() {
        let svc = service(&fixture());
        let decor = svc.entries(Table::Decorations, None).unwrap();
        assert_eq!(decor.len(), 1);
        assert_eq!(decor[0].ticket, "kythe:?path=f");
        let xrefs = svc.entries(Table::CrossReferences, Some(1)).unwrap();
        assert_eq!(xrefs.len(), 1);
        assert_eq!(svc.stats().unwrap().cross_references.rows, 2);
    }
}
