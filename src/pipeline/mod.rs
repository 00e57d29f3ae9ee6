//! Batch stage turning graph nodes into serving records.
//!
//! Nodes are processed independently and combined only through two
//! group-by-key steps: by file (decorations, anchor spans) and by target
//! ticket (cross-references). Each group is reduced deterministically, so
//! neither thread scheduling nor input order shows up in the output.

use crate::db::KeyValueWriter;
use crate::error::Result;
use crate::graph::{GraphNode, NodeKind};
use crate::model::{COLUMNAR_TABLE_MARKER, CrossReferenceRecord, DecorationRecord, Table, encode_record};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::io::BufRead;

pub mod decor;
pub mod xref;

pub use decor::NormalizedAnchor;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub nodes: usize,
    pub files: usize,
    pub anchors: usize,
    pub dropped_anchors: usize,
    pub decorations: usize,
    pub cross_references: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutput {
    /// Sorted by file ticket.
    pub decorations: Vec<DecorationRecord>,
    /// Sorted by target ticket.
    pub cross_references: Vec<CrossReferenceRecord>,
    pub stats: PipelineStats,
}

/// Run both builders over `nodes`.
pub fn run(nodes: &[GraphNode]) -> PipelineOutput {
    let groups = decor::group_by_file(nodes);
    let builds: Vec<decor::FileBuild> = groups
        .into_par_iter()
        .map(|(file, group)| decor::build_file(file, group))
        .collect();

    let mut decorations = Vec::new();
    let mut anchors = Vec::new();
    let mut dropped_anchors = 0;
    for build in builds {
        dropped_anchors += build.dropped;
        anchors.extend(build.anchors);
        if let Some(record) = build.record {
            decorations.push(record);
        }
    }
    decorations.par_sort_unstable_by(|a, b| a.file.cmp(&b.file));

    let mut cross_references = xref::build(nodes, &anchors);
    cross_references.par_sort_unstable_by(|a, b| a.ticket.cmp(&b.ticket));

    let stats = PipelineStats {
        nodes: nodes.len(),
        files: nodes.iter().filter(|n| n.kind == NodeKind::File).count(),
        anchors: nodes.iter().filter(|n| n.kind == NodeKind::Anchor).count(),
        dropped_anchors,
        decorations: decorations.len(),
        cross_references: cross_references.len(),
    };
    tracing::info!(
        nodes = stats.nodes,
        decorations = stats.decorations,
        cross_references = stats.cross_references,
        dropped_anchors = stats.dropped_anchors,
        "pipeline finished"
    );

    PipelineOutput {
        decorations,
        cross_references,
        stats,
    }
}

impl PipelineOutput {
    /// Persist every record through one writer: table marker first, then
    /// decorations, then cross-references. Returns the number of writes.
    pub fn write_to<W: KeyValueWriter>(&self, writer: &mut W) -> Result<usize> {
        writer.write(COLUMNAR_TABLE_MARKER, &[])?;
        let mut written = 1;

        // Encoding is independent per record; the writer stays single-threaded.
        let encoded: Vec<(Vec<u8>, Vec<u8>)> = self
            .decorations
            .par_iter()
            .map(|record| Ok((Table::Decorations.key(&record.file), encode_record(record)?)))
            .collect::<Result<_>>()?;
        for (key, value) in &encoded {
            writer.write(key, value)?;
            written += 1;
        }

        let encoded: Vec<(Vec<u8>, Vec<u8>)> = self
            .cross_references
            .par_iter()
            .map(|record| {
                Ok((
                    Table::CrossReferences.key(&record.ticket),
                    encode_record(record)?,
                ))
            })
            .collect::<Result<_>>()?;
        for (key, value) in &encoded {
            writer.write(key, value)?;
            written += 1;
        }

        tracing::info!(records = written, "serving tables written");
        Ok(written)
    }
}

/// Read JSON-lines graph nodes. Malformed lines are skipped with a warning;
/// the second value counts them.
pub fn read_nodes<R: BufRead>(reader: R) -> Result<(Vec<GraphNode>, usize)> {
    let mut nodes = Vec::new();
    let mut skipped = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match GraphNode::from_json_line(&line) {
            Ok(node) => nodes.push(node),
            Err(err) => {
                tracing::warn!(line = idx + 1, "skipping malformed node: {err}");
                skipped += 1;
            }
        }
    }
    Ok((nodes, skipped))
}

/// Per-key accumulator combined by the parallel fold/reduce.
pub(crate) trait Group: Default + Send {
    fn absorb(&mut self, other: Self);
}

pub(crate) fn merge_groups<K, G>(a: HashMap<K, G>, b: HashMap<K, G>) -> HashMap<K, G>
where
    K: Eq + Hash,
    G: Group,
{
    let (mut big, small) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    for (key, group) in small {
        big.entry(key).or_default().absorb(group);
    }
    big
}
