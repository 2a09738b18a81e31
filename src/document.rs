// src/document.rs
//
// =============================================================================
// RAGKEEPER: DOCUMENT LOADER
// =============================================================================
//
// Walks a directory tree, matches a glob pattern, and parses each Markdown
// file's leading frontmatter block into a typed, immutable `Document`. Each
// stage downstream treats Document as a value -- nothing here mutates a
// Document in place once constructed.

use crate::config::PipelineConfig;
use crate::ledger::checksum_hex;
use crate::error::IndexError;
use glob::Pattern;
use log::warn;
use serde::Deserialize;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub content: String,
    pub source: String,
    pub title: String,
    pub date: Option<String>,
    pub categories: Vec<String>,
    pub description: Option<String>,
    pub cover_image: Option<String>,
    pub cover_video: Option<String>,
    pub reading_time: Option<u32>,
    pub published: bool,
    pub url: String,
    pub post_slug: String,
    pub content_length: usize,
    pub content_checksum: String,
    pub last_modified: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Frontmatter {
    title: Option<String>,
    date: Option<String>,
    categories: Vec<String>,
    description: Option<String>,
    cover_image: Option<String>,
    cover_video: Option<String>,
    reading_time: Option<u32>,
    published: Option<bool>,
}

/// Splits a file's text into `(frontmatter_yaml, body)`. Files without a
/// leading `---` delimiter have no frontmatter at all.
fn split_frontmatter(text: &str) -> (Option<&str>, &str) {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let Some(rest) = text.strip_prefix("---") else {
        return (None, text);
    };
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    match rest.find("\n---") {
        Some(end) => {
            let fm = &rest[..end];
            let after = &rest[end + 4..];
            let body = after.strip_prefix('\n').unwrap_or(after);
            (Some(fm), body)
        }
        None => (None, text),
    }
}

fn humanize_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut c = w.chars();
            match c.next() {
                Some(first) => first.to_uppercase().collect::<String>() + c.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn slug_from_path(path: &Path) -> String {
    path.parent()
        .and_then(|p| p.file_name())
        .and_then(|s| s.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("untitled")
                .to_string()
        })
}

fn join_url(base: &str, relative: &str) -> String {
    if relative.starts_with("http://") || relative.starts_with("https://") {
        return relative.to_string();
    }
    let base = base.trim_end_matches('/');
    let rel = relative.trim_start_matches('/');
    if base.is_empty() {
        format!("/{rel}")
    } else {
        format!("{base}/{rel}")
    }
}

/// Extracts a YouTube video id from a bare id, watch URL, or short URL, and
/// returns the canonical embed URL. Falls back to the original string
/// unrecognised.
fn normalize_cover_video(raw: &str) -> String {
    let id = if let Some(q) = raw.split("v=").nth(1) {
        q.split('&').next().unwrap_or(q)
    } else if let Some(tail) = raw.rsplit('/').next() {
        tail
    } else {
        raw
    };
    if id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') && !id.is_empty() {
        format!("https://www.youtube.com/embed/{id}")
    } else {
        raw.to_string()
    }
}

/// Counts characters across the text `pulldown-cmark` actually extracts
/// (markup stripped, block boundaries preserved) -- the same text the
/// Chunker's paragraph splitter operates on, so the two agree on what "the
/// text" is.
fn content_length_chars(body: &str) -> usize {
    crate::chunker::markdown_paragraphs(body)
        .iter()
        .map(|p| p.chars().count())
        .sum()
}

pub struct DocumentLoader;

impl DocumentLoader {
    /// Loads all Markdown documents matching the configured pattern under
    /// `config.data_dir`. Per-file frontmatter errors are soft: a warning is
    /// logged and the document is kept with defaults. Directory-level I/O
    /// failures abort the load.
    pub fn load(config: &PipelineConfig) -> Result<Vec<Document>, IndexError> {
        let pattern = Pattern::new(&config.data_dir_pattern)
            .map_err(|e| IndexError::Load(format!("invalid glob {:?}: {e}", config.data_dir_pattern)))?;

        if !config.data_dir.exists() {
            return Ok(Vec::new());
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(&config.data_dir) {
            let entry = entry.map_err(|e| IndexError::Load(format!("directory walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if !pattern.matches(&file_name) {
                continue;
            }
            match Self::load_one(entry.path(), config) {
                Ok(Some(doc)) => documents.push(doc),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }

        documents.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(documents)
    }

    fn load_one(path: &Path, config: &PipelineConfig) -> Result<Option<Document>, IndexError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| IndexError::Load(format!("cannot read {:?}: {e}", path)))?;
        let last_modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let (fm_text, body) = split_frontmatter(&text);
        let fm: Frontmatter = match fm_text {
            Some(yaml) => match serde_yaml::from_str(yaml) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("malformed frontmatter in {:?}, using defaults: {e}", path);
                    Frontmatter::default()
                }
            },
            None => Frontmatter::default(),
        };

        let slug = slug_from_path(path);
        let title = fm.title.unwrap_or_else(|| humanize_slug(&slug));
        let cover_image = fm.cover_image.map(|c| join_url(&config.blog_base_url, &c));
        let cover_video = fm.cover_video.map(|v| normalize_cover_video(&v));
        let published = fm.published.unwrap_or(true);

        if config.index_only_published && !published {
            return Ok(None);
        }

        let source = path.to_string_lossy().to_string();
        let checksum = checksum_hex(config.checksum_algorithm, body.as_bytes());

        Ok(Some(Document {
            content: body.to_string(),
            source,
            title,
            date: fm.date,
            categories: fm.categories,
            description: fm.description,
            cover_image,
            cover_video,
            reading_time: fm.reading_time,
            published,
            url: join_url(&config.blog_base_url, &slug),
            post_slug: slug,
            content_length: content_length_chars(body),
            content_checksum: checksum,
            last_modified,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_frontmatter_and_body() {
        let text = "---\ntitle: Hi\n---\nBody text\n";
        let (fm, body) = split_frontmatter(text);
        assert_eq!(fm, Some("title: Hi"));
        assert_eq!(body, "Body text\n");
    }

    #[test]
    fn missing_frontmatter_is_whole_body() {
        let text = "Just a body, no delimiters.";
        let (fm, body) = split_frontmatter(text);
        assert_eq!(fm, None);
        assert_eq!(body, text);
    }

    #[test]
    fn humanizes_slug() {
        assert_eq!(humanize_slug("my-first-post"), "My First Post");
    }

    #[test]
    fn normalizes_youtube_watch_url() {
        let embed = normalize_cover_video("https://www.youtube.com/watch?v=abc123&t=5");
        assert_eq!(embed, "https://www.youtube.com/embed/abc123");
    }

    #[test]
    fn join_url_handles_relative_and_absolute() {
        assert_eq!(join_url("https://x.com", "img.png"), "https://x.com/img.png");
        assert_eq!(
            join_url("https://x.com", "https://y.com/img.png"),
            "https://y.com/img.png"
        );
    }
}
