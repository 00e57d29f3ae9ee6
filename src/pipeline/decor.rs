use super::{Group, merge_groups};
use crate::graph::{
    AnchorRelation, EdgeKind, GraphNode, LOC_END, LOC_START, NodeKind, TEXT, TEXT_ENCODING,
    Ticket, VName,
};
use crate::model::{DecorationRecord, DecorationReference};
use crate::span::{Normalizer, Span, normalize_span};
use rayon::prelude::*;
use std::collections::HashMap;

/// File and anchor nodes sharing one file identity.
#[derive(Debug, Default)]
pub(crate) struct FileGroup<'a> {
    pub files: Vec<&'a GraphNode>,
    pub anchors: Vec<&'a GraphNode>,
}

impl Group for FileGroup<'_> {
    fn absorb(&mut self, other: Self) {
        self.files.extend(other.files);
        self.anchors.extend(other.anchors);
    }
}

pub(crate) fn group_by_file<'a>(nodes: &'a [GraphNode]) -> HashMap<VName, FileGroup<'a>> {
    nodes
        .par_iter()
        .fold(HashMap::new, |mut groups: HashMap<VName, FileGroup<'a>>, node| {
            match node.kind {
                NodeKind::File => groups.entry(node.source.file()).or_default().files.push(node),
                NodeKind::Anchor => groups
                    .entry(node.source.file())
                    .or_default()
                    .anchors
                    .push(node),
                _ => {}
            }
            groups
        })
        .reduce(HashMap::new, merge_groups)
}

/// An anchor whose offsets resolved against its file, with the edges that
/// land in a decoration or cross-reference bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAnchor {
    pub ticket: Ticket,
    pub parent: Ticket,
    pub span: Span,
    pub edges: Vec<(EdgeKind, Ticket)>,
}

#[derive(Debug, Default)]
pub(crate) struct FileBuild {
    /// `None` when the group had anchors but no file node.
    pub record: Option<DecorationRecord>,
    pub anchors: Vec<NormalizedAnchor>,
    pub dropped: usize,
}

pub(crate) fn build_file(file: VName, group: FileGroup<'_>) -> FileBuild {
    let parent = file.ticket();

    // Re-delivered file nodes collapse to one; prefer the copy carrying text.
    let file_node = group.files.iter().copied().max_by(|a, b| {
        a.fact(TEXT)
            .is_some()
            .cmp(&b.fact(TEXT).is_some())
            .then_with(|| a.facts.cmp(&b.facts))
    });
    let text = file_node.and_then(|node| node.fact(TEXT));
    let normalizer = text.map(Normalizer::new);

    let mut anchors = Vec::with_capacity(group.anchors.len());
    let mut dropped = 0;
    for node in &group.anchors {
        match normalize_anchor(node, &parent, normalizer.as_ref()) {
            Some(anchor) => anchors.push(anchor),
            None => dropped += 1,
        }
    }

    let record = file_node.map(|node| {
        let mut references: Vec<DecorationReference> = anchors
            .iter()
            .flat_map(|anchor| {
                anchor.edges.iter().map(|(kind, target)| DecorationReference {
                    span: anchor.span,
                    edge_kind: kind.clone(),
                    target: target.clone(),
                    anchor: anchor.ticket.clone(),
                })
            })
            .collect();
        references.sort_by(|a, b| {
            a.span
                .start
                .byte_offset
                .cmp(&b.span.start.byte_offset)
                .then_with(|| a.span.end.byte_offset.cmp(&b.span.end.byte_offset))
                .then_with(|| a.edge_kind.as_str().cmp(b.edge_kind.as_str()))
                .then_with(|| a.target.cmp(&b.target))
                .then_with(|| a.cmp(b))
        });
        references.dedup();

        DecorationRecord {
            file: parent.clone(),
            source_text: text.map(<[u8]>::to_vec),
            encoding: node
                .fact(TEXT_ENCODING)
                .map(|raw| String::from_utf8_lossy(raw).into_owned()),
            references,
            dropped_anchors: u32::try_from(dropped).unwrap_or(u32::MAX),
        }
    });

    FileBuild {
        record,
        anchors,
        dropped,
    }
}

fn normalize_anchor(
    node: &GraphNode,
    parent: &Ticket,
    normalizer: Option<&Normalizer>,
) -> Option<NormalizedAnchor> {
    let ticket = node.ticket();
    let offsets = node
        .loc_offset(LOC_START)
        .and_then(|start| Ok((start, node.loc_offset(LOC_END)?)));
    let (start, end) = match offsets {
        Ok(offsets) => offsets,
        Err(err) => {
            tracing::warn!(anchor = %ticket, file = %parent, "dropping anchor: {err}");
            return None;
        }
    };
    if end < start {
        tracing::warn!(anchor = %ticket, file = %parent, start, end, "dropping anchor with inverted span");
        return None;
    }

    let (span, error) = normalize_span(normalizer, start, end);
    if let Some(err) = error {
        tracing::warn!(anchor = %ticket, file = %parent, "clamped anchor span: {err}");
    }

    let edges = node
        .edges
        .iter()
        .filter(|edge| edge.kind.relation() != AnchorRelation::Ignored)
        .map(|edge| (edge.kind.clone(), edge.target.ticket()))
        .collect();

    Some(NormalizedAnchor {
        ticket,
        parent: parent.clone(),
        span,
        edges,
    })
}
