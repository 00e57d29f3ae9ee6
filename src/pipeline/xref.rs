use super::{Group, NormalizedAnchor, merge_groups};
use crate::graph::{AnchorRelation, CODE, GraphNode, NodeKind, Ticket};
use crate::model::{AnchorEntry, CrossReferenceRecord, MarkedSource, RelatedNode};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

/// Everything known about one target ticket before reduction.
#[derive(Debug, Default)]
struct TargetGroup<'a> {
    nodes: Vec<&'a GraphNode>,
    anchors: Vec<(AnchorRelation, AnchorEntry)>,
}

impl Group for TargetGroup<'_> {
    fn absorb(&mut self, other: Self) {
        self.nodes.extend(other.nodes);
        self.anchors.extend(other.anchors);
    }
}

pub(crate) fn build(nodes: &[GraphNode], anchors: &[NormalizedAnchor]) -> Vec<CrossReferenceRecord> {
    let kinds = node_kinds(nodes);
    let groups = group_by_target(nodes, anchors);
    groups
        .into_par_iter()
        .map(|(ticket, group)| reduce(ticket, group, &kinds))
        .collect()
}

/// Kind of every node ticket; re-delivered nodes keep the greatest kind.
fn node_kinds(nodes: &[GraphNode]) -> HashMap<Ticket, NodeKind> {
    let mut kinds: HashMap<Ticket, NodeKind> = HashMap::new();
    for node in nodes {
        let kind = kinds.entry(node.ticket()).or_insert_with(|| node.kind.clone());
        if node.kind > *kind {
            *kind = node.kind.clone();
        }
    }
    kinds
}

fn group_by_target<'a>(
    nodes: &'a [GraphNode],
    anchors: &[NormalizedAnchor],
) -> HashMap<Ticket, TargetGroup<'a>> {
    let by_anchor = anchors
        .par_iter()
        .fold(HashMap::new, |mut groups: HashMap<Ticket, TargetGroup<'a>>, anchor| {
            for (kind, target) in &anchor.edges {
                let entry = AnchorEntry {
                    parent: anchor.parent.clone(),
                    span: anchor.span,
                    anchor: anchor.ticket.clone(),
                    edge_kind: kind.clone(),
                };
                groups
                    .entry(target.clone())
                    .or_default()
                    .anchors
                    .push((kind.relation(), entry));
            }
            groups
        })
        .reduce(HashMap::new, merge_groups);

    let by_node = nodes
        .par_iter()
        .filter(|node| !matches!(node.kind, NodeKind::File | NodeKind::Anchor))
        .fold(HashMap::new, |mut groups: HashMap<Ticket, TargetGroup<'a>>, node| {
            groups.entry(node.ticket()).or_default().nodes.push(node);
            groups
        })
        .reduce(HashMap::new, merge_groups);

    merge_groups(by_anchor, by_node)
}

fn reduce(
    ticket: Ticket,
    group: TargetGroup<'_>,
    kinds: &HashMap<Ticket, NodeKind>,
) -> CrossReferenceRecord {
    let node = group
        .nodes
        .iter()
        .copied()
        .max_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.facts.cmp(&b.facts)));

    let marked_source = node.and_then(|node| {
        let raw = node.fact(CODE)?;
        match MarkedSource::decode(raw) {
            Ok(ms) => Some(ms),
            Err(err) => {
                tracing::warn!(node = %ticket, "ignoring code fact: {err}");
                None
            }
        }
    });

    let facts = node
        .map(|node| {
            node.facts
                .iter()
                .filter(|(name, _)| name.as_str() != CODE)
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect()
        })
        .unwrap_or_default();

    let mut anchors: BTreeMap<AnchorRelation, Vec<AnchorEntry>> = BTreeMap::new();
    for (relation, entry) in group.anchors {
        if relation != AnchorRelation::Ignored {
            anchors.entry(relation).or_default().push(entry);
        }
    }
    for bucket in anchors.values_mut() {
        bucket.sort();
        bucket.dedup();
    }

    let definition = match anchors.get(&AnchorRelation::Definition).map(Vec::as_slice) {
        Some([only]) => Some(only.anchor.clone()),
        _ => None,
    };

    let mut related: Vec<RelatedNode> = group
        .nodes
        .iter()
        .flat_map(|node| node.edges.iter())
        .filter(|edge| edge.kind.relation() == AnchorRelation::Ignored)
        .map(|edge| {
            let ticket = edge.target.ticket();
            RelatedNode {
                relation: edge.kind.clone(),
                node_kind: kinds.get(&ticket).cloned(),
                ticket,
            }
        })
        .collect();
    related.sort();
    related.dedup();

    CrossReferenceRecord {
        ticket,
        marked_source,
        node_kind: node.map(|node| node.kind.clone()),
        facts,
        definition,
        anchors,
        related,
    }
}
