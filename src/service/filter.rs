use std::collections::BTreeMap;
use wildmatch::WildMatch;

#[derive(Debug, Clone)]
enum Segment {
    /// `**`: any run of segments, including none.
    AnyRun,
    Literal(String),
    Wild(WildMatch),
}

impl Segment {
    fn matches(&self, part: &str) -> bool {
        match self {
            Segment::AnyRun => true,
            Segment::Literal(text) => text == part,
            Segment::Wild(pattern) => pattern.matches(part),
        }
    }
}

#[derive(Debug, Clone)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn compile(raw: &str) -> Self {
        let mut segments: Vec<Segment> = Vec::new();
        for part in raw.trim_start_matches('/').split('/') {
            let segment = if part == "**" {
                if matches!(segments.last(), Some(Segment::AnyRun)) {
                    continue;
                }
                Segment::AnyRun
            } else if part.contains(['*', '?']) {
                Segment::Wild(WildMatch::new(part))
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }
        Pattern { segments }
    }

    fn matches(&self, parts: &[&str]) -> bool {
        match_segments(&self.segments, parts)
    }
}

fn match_segments(segments: &[Segment], parts: &[&str]) -> bool {
    match segments.split_first() {
        None => parts.is_empty(),
        Some((Segment::AnyRun, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((segment, rest)) => match parts.split_first() {
            Some((part, tail)) => segment.matches(part) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// Compiled set of fact-name globs. A name passes when any pattern matches.
#[derive(Debug, Clone, Default)]
pub struct FactFilter {
    patterns: Vec<Pattern>,
}

impl FactFilter {
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> Self {
        FactFilter {
            patterns: patterns
                .iter()
                .map(|raw| raw.as_ref().trim())
                .filter(|raw| !raw.is_empty())
                .map(Pattern::compile)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let parts: Vec<&str> = name.trim_start_matches('/').split('/').collect();
        self.patterns.iter().any(|pattern| pattern.matches(&parts))
    }

    pub fn filter_facts(&self, facts: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, Vec<u8>> {
        facts
            .iter()
            .filter(|(name, _)| self.matches(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_star_matches_everything() {
        let filter = FactFilter::compile(&["**"]);
        assert!(filter.matches("/kythe/node/kind"));
        assert!(filter.matches("/kythe/edge/ref/call"));
        assert!(filter.matches("/x"));
    }

    #[test]
    fn segments_match_literally_or_by_wildcard() {
        let filter = FactFilter::compile(&["/kythe/node/*", "/acme/**/flag?"]);
        assert!(filter.matches("/kythe/node/kind"));
        assert!(!filter.matches("/kythe/node/kind/extra"));
        assert!(!filter.matches("/kythe/text"));
        assert!(filter.matches("/acme/flag1"));
        assert!(filter.matches("/acme/a/b/flagX"));
        assert!(!filter.matches("/acme/a/flag"));
    }

    #[test]
    fn trailing_double_star_spans_the_rest() {
        let filter = FactFilter::compile(&["/kythe/edge/**"]);
        assert!(filter.matches("/kythe/edge/ref"));
        assert!(filter.matches("/kythe/edge/ref/call"));
        assert!(filter.matches("/kythe/edge"));
        assert!(!filter.matches("/kythe/node/kind"));
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = FactFilter::compile::<&str>(&[]);
        assert!(filter.is_empty());
        assert!(!filter.matches("/kythe/node/kind"));
        assert!(FactFilter::compile(&["", "  "]).is_empty());
    }

    #[test]
    fn filter_facts_keeps_matching_names() {
        let facts = BTreeMap::from([
            ("/kythe/node/kind".to_string(), b"record".to_vec()),
            ("/kythe/text".to_string(), b"x".to_vec()),
        ]);
        let kept = FactFilter::compile(&["/kythe/node/kind"]).filter_facts(&facts);
        assert_eq!(kept.len(), 1);
        assert_eq!(FactFilter::compile(&["**"]).filter_facts(&facts), facts);
    }
}
