// src/chunker.rs
//
// =============================================================================
// RAGKEEPER: CHUNKER
// =============================================================================
//
// Splits a document into overlapping text pieces. Strategy is a tagged
// variant dispatched in a `match`, not an injected closure: adding a new
// splitting rule means adding a match arm, never handing the pipeline a
// function pointer to carry around.

use crate::config::{ChunkingStrategyKind, PipelineConfig, SemanticBreakpointType};
use crate::document::Document;
use crate::embedding::EmbeddingProvider;
use crate::error::IndexError;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub source: String,
    pub ordinal: usize,
    pub title: String,
    pub url: String,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ChunkingStrategy {
    Recursive { chunk_size: usize, chunk_overlap: usize },
    Semantic {
        breakpoint_type: SemanticBreakpointType,
        threshold_amount: f64,
        min_chunk_size: usize,
    },
}

impl ChunkingStrategy {
    pub fn from_config(config: &PipelineConfig, chunk_size: usize, chunk_overlap: usize) -> Self {
        match config.chunking_strategy {
            ChunkingStrategyKind::Recursive => ChunkingStrategy::Recursive {
                chunk_size,
                chunk_overlap,
            },
            ChunkingStrategyKind::Semantic => ChunkingStrategy::Semantic {
                breakpoint_type: config.semantic_breakpoint_type,
                threshold_amount: config.semantic_breakpoint_threshold_amount,
                min_chunk_size: config.semantic_min_chunk_size,
            },
        }
    }
}

const SEPARATORS: &[&str] = &["\n", ". ", " ", ""];

/// Walks `text` with `pulldown-cmark` and returns one entry per top-level
/// block (paragraph, heading, list item, code block), markup stripped. Used
/// as the first, Markdown-aware splitting pass so a blank line inside a code
/// fence or a tight list item doesn't get treated as a paragraph break the
/// way a literal `"\n\n"` split would.
pub fn markdown_paragraphs(text: &str) -> Vec<String> {
    use pulldown_cmark::{Event, Parser, Tag, TagEnd};

    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for event in Parser::new(text) {
        match event {
            Event::Start(Tag::Paragraph)
            | Event::Start(Tag::Heading { .. })
            | Event::Start(Tag::Item)
            | Event::Start(Tag::CodeBlock(_)) => depth += 1,
            Event::End(TagEnd::Paragraph)
            | Event::End(TagEnd::Heading(_))
            | Event::End(TagEnd::Item)
            | Event::End(TagEnd::CodeBlock) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let block = current.trim().to_string();
                    if !block.is_empty() {
                        paragraphs.push(block);
                    }
                    current.clear();
                }
            }
            Event::Text(t) | Event::Code(t) => current.push_str(&t),
            Event::SoftBreak | Event::HardBreak => current.push(' '),
            _ => {}
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        paragraphs.push(tail);
    }
    paragraphs
}

/// Recursively splits `text` into fragments that fit under `chunk_size`,
/// packing pieces with `chunk_overlap` characters of tail carried into the
/// next chunk. The first split attempt is Markdown-aware paragraph
/// detection; if that alone doesn't produce small-enough pieces it falls
/// through to `SEPARATORS` for progressively finer literal splitting.
/// Deterministic: same input, same parameters, same chunk list.
fn recursive_split(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if text.chars().count() <= chunk_size {
        return if text.is_empty() { Vec::new() } else { vec![text.to_string()] };
    }

    let pieces = split_on_first_working_separator(text, chunk_size);
    pack_pieces(&pieces, chunk_size, chunk_overlap)
}

fn split_on_first_working_separator(text: &str, chunk_size: usize) -> Vec<String> {
    let paragraphs = markdown_paragraphs(text);
    if paragraphs.len() > 1 && paragraphs.iter().any(|p| p.chars().count() <= chunk_size) {
        return paragraphs;
    }

    for sep in SEPARATORS {
        if sep.is_empty() {
            return text.chars().map(|c| c.to_string()).collect();
        }
        let parts: Vec<&str> = text.split(sep).filter(|p| !p.is_empty()).collect();
        if parts.len() > 1 && parts.iter().any(|p| p.chars().count() <= chunk_size) {
            return parts.into_iter().map(|p| p.to_string()).collect();
        }
    }
    text.chars().map(|c| c.to_string()).collect()
}

fn pack_pieces(pieces: &[String], chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if piece.chars().count() > chunk_size {
            if !current.is_empty() {
                chunks.push(current.clone());
                current = tail(&current, chunk_overlap);
            }
            chunks.extend(recursive_split(piece, chunk_size, chunk_overlap));
            continue;
        }

        let candidate_len = current.chars().count() + piece.chars().count();
        if candidate_len > chunk_size && !current.is_empty() {
            chunks.push(current.clone());
            current = tail(&current, chunk_overlap);
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn tail(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= n {
        text.to_string()
    } else {
        chars[chars.len() - n..].iter().collect()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b)) as f64
}

fn breakpoint_threshold(distances: &[f64], kind: SemanticBreakpointType, amount: f64) -> f64 {
    if distances.is_empty() {
        return f64::MAX;
    }
    let mut sorted = distances.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mean: f64 = distances.iter().sum::<f64>() / distances.len() as f64;
    let variance: f64 =
        distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / distances.len() as f64;
    let stddev = variance.sqrt();

    match kind {
        SemanticBreakpointType::Percentile => {
            let idx = ((amount / 100.0) * (sorted.len() as f64 - 1.0)).round() as usize;
            sorted[idx.min(sorted.len() - 1)]
        }
        SemanticBreakpointType::Stddev => mean + amount * stddev,
        SemanticBreakpointType::Iqr => {
            let q1 = sorted[sorted.len() / 4];
            let q3 = sorted[(sorted.len() * 3) / 4];
            q3 + amount * (q3 - q1)
        }
        SemanticBreakpointType::Gradient => {
            let mut max_gradient = 0.0;
            for w in sorted.windows(2) {
                max_gradient = f64::max(max_gradient, w[1] - w[0]);
            }
            mean + max_gradient * amount / 100.0
        }
    }
}

fn semantic_split(
    text: &str,
    embedder: &dyn EmbeddingProvider,
    breakpoint_type: SemanticBreakpointType,
    threshold_amount: f64,
    min_chunk_size: usize,
) -> Result<Vec<String>, IndexError> {
    let sentences: Vec<&str> = text
        .split(". ")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if sentences.len() <= 1 {
        return Ok(if text.is_empty() { Vec::new() } else { vec![text.to_string()] });
    }

    let embeddings = embedder.embed_batch(&sentences)?;
    let distances: Vec<f64> = embeddings
        .windows(2)
        .map(|w| cosine_distance(&w[0], &w[1]))
        .collect();
    let threshold = breakpoint_threshold(&distances, breakpoint_type, threshold_amount);

    let mut chunks = Vec::new();
    let mut current = String::new();
    for (i, sentence) in sentences.iter().enumerate() {
        if !current.is_empty() {
            current.push_str(". ");
        }
        current.push_str(sentence);

        let should_break = i < distances.len() && distances[i] > threshold;
        if should_break && current.chars().count() >= min_chunk_size {
            chunks.push(current.clone());
            current.clear();
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

pub fn chunk_document(
    doc: &Document,
    strategy: &ChunkingStrategy,
    embedder: &dyn EmbeddingProvider,
) -> Result<Vec<Chunk>, IndexError> {
    let pieces = match strategy {
        ChunkingStrategy::Recursive { chunk_size, chunk_overlap } => {
            recursive_split(&doc.content, *chunk_size, *chunk_overlap)
        }
        ChunkingStrategy::Semantic {
            breakpoint_type,
            threshold_amount,
            min_chunk_size,
        } => semantic_split(&doc.content, embedder, *breakpoint_type, *threshold_amount, *min_chunk_size)?,
    };

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(ordinal, content)| Chunk {
            content,
            source: doc.source.clone(),
            ordinal,
            title: doc.title.clone(),
            url: doc.url.clone(),
            categories: doc.categories.clone(),
        })
        .collect())
}

/// Widens `chunk_size` for long-tailed corpora, narrows it for short-document
/// corpora, bounded by `[min_size, max_size]`.
pub fn adaptive_chunk_parameters(
    documents: &[Document],
    base_chunk_size: usize,
    base_overlap: usize,
) -> (usize, usize) {
    if documents.is_empty() {
        return (base_chunk_size, base_overlap);
    }
    let lengths: Vec<f64> = documents.iter().map(|d| d.content_length as f64).collect();
    let mean = lengths.iter().sum::<f64>() / lengths.len() as f64;
    let mut sorted = lengths.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let p95_idx = ((sorted.len() as f64 - 1.0) * 0.95).round() as usize;
    let p95 = sorted[p95_idx.min(sorted.len() - 1)];

    const MIN_SIZE: usize = 200;
    const MAX_SIZE: usize = 4000;

    let adjusted = if p95 > mean * 3.0 {
        (base_chunk_size as f64 * 1.5) as usize
    } else if mean < 500.0 {
        (base_chunk_size as f64 * 0.6) as usize
    } else {
        base_chunk_size
    };
    let chunk_size = adjusted.clamp(MIN_SIZE, MAX_SIZE);
    let overlap = (chunk_size / 5).min(base_overlap.max(chunk_size / 5));
    (chunk_size, overlap.min(chunk_size.saturating_sub(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recursive_split_is_deterministic() {
        let text = "Paragraph one is here.\n\nParagraph two follows with more words to fill space.\n\nParagraph three.";
        let a = recursive_split(text, 40, 10);
        let b = recursive_split(text, 40, 10);
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = recursive_split("short", 1000, 200);
        assert_eq!(chunks, vec!["short".to_string()]);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(recursive_split("", 1000, 200).is_empty());
    }

    #[test]
    fn markdown_paragraphs_splits_on_block_structure() {
        let text = "# Title\n\nFirst paragraph.\n\n- item one\n- item two\n";
        let blocks = markdown_paragraphs(text);
        assert_eq!(blocks, vec!["Title", "First paragraph.", "item one", "item two"]);
    }

    #[test]
    fn markdown_paragraphs_keeps_blank_line_inside_code_fence_as_one_block() {
        let text = "```\nfn main() {\n\n}\n```\n";
        let blocks = markdown_paragraphs(text);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].contains("fn main"));
    }

    #[test]
    fn adaptive_sizing_widens_for_long_tail() {
        let mut docs = Vec::new();
        for _ in 0..9 {
            docs.push(make_doc(400));
        }
        docs.push(make_doc(20_000));
        let (size, _) = adaptive_chunk_parameters(&docs, 1000, 200);
        assert!(size >= 1000);
    }

    fn make_doc(length: usize) -> Document {
        Document {
            content: "x".repeat(length),
            source: "s".into(),
            title: "T".into(),
            date: None,
            categories: vec![],
            description: None,
            cover_image: None,
            cover_video: None,
            reading_time: None,
            published: true,
            url: "u".into(),
            post_slug: "s".into(),
            content_length: length,
            content_checksum: "c".into(),
            last_modified: 0,
        }
    }
}
