use navidx::db::{KeyValueWriter, MemoryStore, SqliteStore};
use navidx::graph::{EdgeKind, GraphNode, LOC_END, LOC_START, NodeKind, TEXT, Ticket, VName};
use navidx::model::{MarkedSource, MarkedSourceKind};
use navidx::pipeline;
use navidx::service::{
    Anchor, CrossReferenceSet, CrossReferencesRequest, DeclarationKind, DefinitionKind,
    QueryContext, ReferenceKind, Totals, XRefService,
};
use navidx::span::{Point, Span};
use pretty_assertions::assert_eq;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use tempfile::TempDir;

const SYMBOL: &str = "kythe:?path=path#signature";

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn build_store(fixture: &str) -> (XRefService<SqliteStore>, TempDir) {
    let file = File::open(fixture_path(fixture)).unwrap();
    let (nodes, _) = pipeline::read_nodes(BufReader::new(file)).unwrap();

    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("serving.sqlite");
    let mut writer = SqliteStore::create(&db_path).unwrap();
    pipeline::run(&nodes).write_to(&mut writer).unwrap();
    writer.close().unwrap();

    let service = XRefService::open(SqliteStore::open(&db_path).unwrap()).unwrap();
    (service, temp_dir)
}

fn memory_service(nodes: &[GraphNode]) -> XRefService<MemoryStore> {
    let store = MemoryStore::new();
    let mut writer = store.writer();
    pipeline::run(nodes).write_to(&mut writer).unwrap();
    writer.close().unwrap();
    XRefService::open(store).unwrap()
}

fn pt(byte_offset: i64, line_number: i64, column_offset: i64) -> Point {
    Point {
        byte_offset,
        line_number,
        column_offset,
    }
}

fn identifier() -> MarkedSource {
    MarkedSource {
        kind: MarkedSourceKind::Identifier,
        pre_text: "identifier".to_string(),
        ..Default::default()
    }
}

#[test]
fn requested_node_carries_marked_source_and_facts() {
    let (service, _dir) = build_store("simple_xrefs.jsonl");
    let req = CrossReferencesRequest {
        ticket: vec![SYMBOL.to_string()],
        filter: vec!["**".to_string()],
        related_node_kind: vec!["NONE".to_string()],
        ..Default::default()
    };
    let reply = service.cross_references(&QueryContext::new(), &req).unwrap();

    assert_eq!(
        reply.cross_references[SYMBOL],
        CrossReferenceSet {
            ticket: Ticket::parse(SYMBOL).unwrap(),
            display: Some("identifier".to_string()),
            marked_source: Some(identifier()),
            reference: Vec::new(),
            definition: Vec::new(),
            declaration: Vec::new(),
            related_node: Vec::new(),
            total: Totals::default(),
        }
    );
    let facts = &reply.nodes[SYMBOL].facts;
    assert_eq!(facts.get("/kythe/node/kind"), Some(&b"record".to_vec()));
    assert!(!facts.contains_key("/kythe/code"));
}

#[test]
fn references_carry_line_snippets() {
    let (service, _dir) = build_store("simple_xrefs.jsonl");
    let req = CrossReferencesRequest {
        ticket: vec![SYMBOL.to_string()],
        reference_kind: ReferenceKind::AllReferences,
        ..Default::default()
    };
    let reply = service.cross_references(&QueryContext::new(), &req).unwrap();
    assert!(reply.nodes.is_empty());

    let set = &reply.cross_references[SYMBOL];
    assert_eq!(set.marked_source, Some(identifier()));
    assert_eq!(set.total.references, 1);
    assert_eq!(
        set.reference,
        vec![Anchor {
            ticket: Ticket::parse("kythe:?path=path#anchor1").unwrap(),
            kind: EdgeKind::Ref,
            parent: Ticket::parse("kythe:?path=path").unwrap(),
            span: Span {
                start: pt(5, 1, 5),
                end: pt(9, 1, 9),
            },
            snippet: Some("blah blah".to_string()),
            snippet_span: Some(Span {
                start: pt(0, 1, 0),
                end: pt(9, 1, 9),
            }),
        }]
    );
}

#[test]
fn unknown_tickets_are_omitted() {
    let (service, _dir) = build_store("simple_xrefs.jsonl");
    let req = CrossReferencesRequest {
        ticket: vec!["kythe:#nothing".to_string(), SYMBOL.to_string()],
        reference_kind: ReferenceKind::AllReferences,
        ..Default::default()
    };
    let reply = service.cross_references(&QueryContext::new(), &req).unwrap();
    assert_eq!(reply.cross_references.len(), 1);
    assert!(reply.cross_references.contains_key(SYMBOL));
}

#[test]
fn cancelled_context_fails_the_call() {
    let (service, _dir) = build_store("simple_xrefs.jsonl");
    let ctx = QueryContext::new();
    let other = ctx.clone();
    other.cancel();
    assert!(ctx.is_cancelled());
    let req = CrossReferencesRequest {
        ticket: vec![SYMBOL.to_string()],
        ..Default::default()
    };
    let err = service.cross_references(&ctx, &req).unwrap_err();
    assert_eq!(err.code(), "cancelled");
}

fn anchor(sig: &str, start: i64, end: i64, kind: EdgeKind, target: &str) -> GraphNode {
    GraphNode::new(
        VName {
            path: "lib.rs".into(),
            signature: sig.into(),
            ..Default::default()
        },
        NodeKind::Anchor,
    )
    .with_fact(LOC_START, start.to_string())
    .with_fact(LOC_END, end.to_string())
    .with_edge(kind, VName::with_signature(target))
}

fn many_references() -> Vec<GraphNode> {
    let text = "trait T;\nimpl T;\nuse T;\nuse T;\nuse T;\n";
    vec![
        GraphNode::new(VName::with_path("lib.rs"), NodeKind::File).with_fact(TEXT, text),
        anchor("decl", 6, 7, EdgeKind::Completes, "T"),
        anchor("def", 14, 15, EdgeKind::Defines, "T"),
        anchor("u1", 21, 22, EdgeKind::Ref, "T"),
        anchor("u2", 28, 29, EdgeKind::Ref, "T"),
        anchor("u3", 35, 36, EdgeKind::Ref, "T"),
        GraphNode::new(VName::with_signature("T"), NodeKind::Interface),
    ]
}

#[test]
fn buckets_page_and_report_totals() {
    let service = memory_service(&many_references());
    let req = CrossReferencesRequest {
        ticket: vec!["kythe:#T".to_string()],
        reference_kind: ReferenceKind::AllReferences,
        definition_kind: DefinitionKind::AllDefinitions,
        declaration_kind: DeclarationKind::AllDeclarations,
        page_size: 2,
        ..Default::default()
    };
    let reply = service.cross_references(&QueryContext::new(), &req).unwrap();
    let set = &reply.cross_references["kythe:#T"];
    assert_eq!(
        set.total,
        Totals {
            references: 3,
            definitions: 1,
            declarations: 1,
            related_nodes: 0,
        }
    );
    assert_eq!(set.reference.len(), 2);
    let snippets: Vec<_> = set.reference.iter().map(|a| a.snippet.as_deref()).collect();
    assert_eq!(snippets, vec![Some("use T;"), Some("use T;")]);
    assert_eq!(set.reference[0].span.start, pt(21, 3, 4));
    assert_eq!(set.definition[0].snippet.as_deref(), Some("impl T;"));
    assert_eq!(set.declaration[0].snippet.as_deref(), Some("trait T;"));
}

#[test]
fn anchors_without_file_text_have_no_snippet() {
    let nodes = vec![anchor("u", 0, 1, EdgeKind::Ref, "X")];
    let service = memory_service(&nodes);
    let req = CrossReferencesRequest {
        ticket: vec!["kythe:#X".to_string()],
        reference_kind: ReferenceKind::AllReferences,
        ..Default::default()
    };
    let reply = service.cross_references(&QueryContext::new(), &req).unwrap();
    let found = &reply.cross_references["kythe:#X"].reference[0];
    assert!(found.snippet.is_none());
    assert!(found.snippet_span.is_none());
    assert!(!found.span.start.is_known());
}
