//! Annotator XML output parser.
//!
//! The annotator emits one `MMOs` document per invocation, with concepts in
//! two shapes: a candidate list (`Candidates`) and a mapping list
//! (`MappingCandidates`). Both are emitted here, mapping-list concepts with
//! `is_mapping` set.
//!
//! Optional-field absence never fails a job; missing fields become empty
//! strings or `None`. The only hard failures are malformed XML and a missing
//! top-level result structure.

use crate::error::JobError;
use notemill_protocol::Concept;
use roxmltree::{Document, Node};
use std::path::Path;

/// Parse an annotator XML file into concept records.
pub fn parse_file(path: &Path) -> Result<Vec<Concept>, JobError> {
    let xml = std::fs::read_to_string(path)?;
    parse_concepts(&xml)
}

/// Parse an annotator XML document into an ordered concept sequence.
pub fn parse_concepts(xml: &str) -> Result<Vec<Concept>, JobError> {
    if xml.trim().is_empty() {
        return Err(JobError::Parse("empty annotator output".into()));
    }
    let doc = Document::parse(xml).map_err(|e| JobError::Parse(e.to_string()))?;
    let root = doc.root_element();
    if !matches!(root.tag_name().name(), "MMOs" | "MMO") {
        return Err(JobError::Parse(format!(
            "unexpected top-level element <{}>",
            root.tag_name().name()
        )));
    }

    let mut concepts = Vec::new();
    let mmos: Vec<Node> = if root.has_tag_name("MMO") {
        vec![root]
    } else {
        root.descendants().filter(|n| n.has_tag_name("MMO")).collect()
    };

    for mmo in mmos {
        for (list_tag, is_mapping) in [("Candidates", false), ("MappingCandidates", true)] {
            for list in mmo.descendants().filter(|n| n.has_tag_name(list_tag)) {
                for candidate in list.descendants().filter(|n| n.has_tag_name("Candidate")) {
                    concepts.push(concept_from_node(candidate, is_mapping));
                }
            }
        }
    }

    Ok(concepts)
}

fn concept_from_node(candidate: Node, is_mapping: bool) -> Concept {
    let matched = child_text(candidate, "CandidateMatched");
    let preferred = {
        let p = child_text(candidate, "CandidatePreferred");
        if p.is_empty() {
            matched.clone()
        } else {
            p
        }
    };

    // Concept span: repeated start/length tokens win, then a direct
    // <Position x= y=> pair, then the enclosing phrase span.
    let mut span = span_from_positional(candidate.descendants().filter(|n| n.has_tag_name("PositionalInfo")));
    if span.is_none() {
        span = span_from_position_attr(candidate);
    }

    let phrase = candidate
        .ancestors()
        .find(|n| n.is_element() && n.has_tag_name("Phrase"));
    let phrase_span = phrase.and_then(phrase_span_of);
    if span.is_none() {
        span = phrase_span;
    }

    let phrase_text = {
        let text = phrase.map(phrase_text_of).unwrap_or_default();
        if text.is_empty() {
            matched.clone()
        } else {
            text
        }
    };

    Concept {
        cui: child_text(candidate, "CandidateCUI"),
        score: child_text(candidate, "CandidateScore"),
        matched,
        preferred_name: preferred,
        phrase_text,
        semantic_types: texts_of(candidate, "SemType"),
        sources: sources_of(candidate),
        start: span.map(|(s, _)| s),
        length: span.map(|(_, l)| l),
        phrase_start: phrase_span.map(|(s, _)| s),
        phrase_length: phrase_span.map(|(_, l)| l),
        utterance_id: utterance_id_of(candidate),
        negated: child_text(candidate, "Negated") == "1",
        is_mapping,
    }
}

/// Text of the first descendant with the given tag, trimmed, or empty.
fn child_text(node: Node, tag: &str) -> String {
    node.descendants()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

fn texts_of(node: Node, tag: &str) -> Vec<String> {
    node.descendants()
        .filter(|n| n.has_tag_name(tag))
        .filter_map(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Source vocabularies come either as individual <Source> elements or as one
/// <Sources> element holding a separator-joined list. Deduplicated in order.
fn sources_of(candidate: Node) -> Vec<String> {
    let mut sources = texts_of(candidate, "Source");
    for joined in texts_of(candidate, "Sources") {
        for token in joined
            .replace('|', ":")
            .replace(',', ":")
            .split(':')
            .map(str::trim)
        {
            if !token.is_empty() {
                sources.push(token.to_string());
            }
        }
    }
    let mut seen = std::collections::HashSet::new();
    sources.retain(|s| seen.insert(s.clone()));
    sources
}

fn attr_either<'a, 'i>(node: Node<'a, 'i>, a: &str, b: &str) -> Option<&'a str> {
    node.attribute(a).or_else(|| node.attribute(b))
}

/// Compute the zero-based (start, total length) span from one or more
/// `PositionalInfo` nodes. Each node carries either "start/len" tokens
/// (space- or semicolon-separated) or start/length attributes. The span is
/// the minimum start through the maximum end.
fn span_from_positional<'a, 'i: 'a, I: Iterator<Item = Node<'a, 'i>>>(
    nodes: I,
) -> Option<(u32, u32)> {
    let mut tokens: Vec<(u32, u32)> = Vec::new();
    for pn in nodes {
        let text = pn.text().map(str::trim).unwrap_or("");
        if !text.is_empty() {
            for chunk in text.replace(';', " ").split_whitespace() {
                if let Some((s, l)) = chunk.split_once('/') {
                    if let (Ok(s), Ok(l)) = (s.trim().parse(), l.trim().parse()) {
                        tokens.push((s, l));
                    }
                }
            }
        } else if let (Some(s), Some(l)) = (
            attr_either(pn, "start", "Start"),
            attr_either(pn, "length", "Length"),
        ) {
            if let (Ok(s), Ok(l)) = (s.trim().parse(), l.trim().parse()) {
                tokens.push((s, l));
            }
        }
    }
    span_of_tokens(&tokens)
}

fn span_of_tokens(tokens: &[(u32, u32)]) -> Option<(u32, u32)> {
    let start = tokens.iter().map(|(s, _)| *s).min()?;
    let end = tokens.iter().map(|(s, l)| s + l).max()?;
    let length = end.saturating_sub(start);
    if length == 0 {
        return None;
    }
    Some((start, length))
}

/// Newer annotator builds report the span as a single <Position x= y=> pair,
/// x already zero-based.
fn span_from_position_attr(candidate: Node) -> Option<(u32, u32)> {
    let position = candidate
        .descendants()
        .find(|n| n.has_tag_name("Position"))?;
    let start: u32 = position.attribute("x")?.trim().parse().ok()?;
    let length: u32 = position.attribute("y")?.trim().parse().ok()?;
    if length == 0 {
        return None;
    }
    Some((start, length))
}

/// Span of the whole phrase: its first PositionalInfo child, falling back to
/// a "Pos" attribute carrying the same token format.
fn phrase_span_of(phrase: Node) -> Option<(u32, u32)> {
    if let Some(pn) = phrase
        .descendants()
        .find(|n| n.has_tag_name("PositionalInfo"))
    {
        if let Some(span) = span_from_positional(std::iter::once(pn)) {
            return Some(span);
        }
    }
    let pos_attr = phrase.attribute("Pos")?;
    let tokens: Vec<(u32, u32)> = pos_attr
        .replace(';', " ")
        .split_whitespace()
        .filter_map(|chunk| {
            let (s, l) = chunk.split_once('/')?;
            Some((s.trim().parse().ok()?, l.trim().parse().ok()?))
        })
        .collect();
    span_of_tokens(&tokens)
}

fn phrase_text_of(phrase: Node) -> String {
    let from_child = child_text(phrase, "PhraseText");
    if !from_child.is_empty() {
        return from_child;
    }
    if let Some(attr) = phrase.attribute("text") {
        let attr = attr.trim();
        if !attr.is_empty() {
            return attr.to_string();
        }
    }
    phrase
        .text()
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

/// Utterance id from the nearest enclosing utterance element, trying the
/// attribute spellings seen across annotator builds, then a direct
/// UtteranceNumber child.
fn utterance_id_of(candidate: Node) -> Option<u32> {
    if let Some(utterance) = candidate
        .ancestors()
        .find(|n| n.is_element() && n.has_tag_name("Utterance"))
    {
        for attr in ["id", "Index", "index", "number", "Number"] {
            if let Some(value) = utterance.attribute(attr) {
                if let Ok(id) = value.trim().parse() {
                    return Some(id);
                }
            }
        }
    }
    child_text(candidate, "UtteranceNumber").parse().ok()
}
