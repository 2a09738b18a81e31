// src/config.rs
//
// =============================================================================
// RAGKEEPER: CONFIGURATION RECORD
// =============================================================================
//
// A flat, typed configuration record. Unknown keys are rejected at parse
// time via `deny_unknown_fields` -- a typo'd key should fail loudly rather
// than silently doing nothing in an unattended scheduled run.

use crate::error::IndexError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        ChecksumAlgorithm::Sha256
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategyKind {
    Semantic,
    Recursive,
}

impl Default for ChunkingStrategyKind {
    fn default() -> Self {
        ChunkingStrategyKind::Semantic
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SemanticBreakpointType {
    Percentile,
    Stddev,
    Iqr,
    Gradient,
}

impl Default for SemanticBreakpointType {
    fn default() -> Self {
        SemanticBreakpointType::Percentile
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IncrementalMode {
    Auto,
    Incremental,
    Full,
}

impl Default for IncrementalMode {
    fn default() -> Self {
        IncrementalMode::Auto
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/")
}
fn default_pattern() -> String {
    "*.md".to_string()
}
fn default_true() -> bool {
    true
}
fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_semantic_threshold() -> f64 {
    95.0
}
fn default_semantic_min_chunk() -> usize {
    100
}
fn default_incremental_fallback_threshold() -> f64 {
    0.8
}
fn default_batch_size() -> usize {
    50
}
fn default_batch_pause_seconds() -> f64 {
    0.1
}
fn default_max_concurrent_operations() -> usize {
    5
}
fn default_max_backup_files() -> usize {
    3
}
fn default_collection_name() -> String {
    "blog_posts".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

/// The flat configuration record described in SPEC_FULL §6. Deserialized
/// from YAML; unknown top-level keys are a parse-time `ConfigError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub data_dir_pattern: String,
    pub web_urls: Vec<String>,
    pub blog_base_url: String,
    pub index_only_published: bool,

    pub use_chunking: bool,
    pub chunking_strategy: ChunkingStrategyKind,
    pub adaptive_chunking: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub semantic_breakpoint_type: SemanticBreakpointType,
    pub semantic_breakpoint_threshold_amount: f64,
    pub semantic_min_chunk_size: usize,

    pub collection_name: String,
    pub embedding_model: String,
    pub vector_store_url: Option<String>,
    pub vector_store_path: PathBuf,

    pub force_recreate: bool,
    pub incremental_mode: IncrementalMode,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub auto_detect_changes: bool,
    pub incremental_fallback_threshold: f64,

    pub enable_batch_processing: bool,
    pub batch_size: usize,
    pub batch_pause_seconds: f64,
    pub max_concurrent_operations: usize,

    pub max_backup_files: usize,

    pub ledger_path: PathBuf,
    pub reports_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            data_dir_pattern: default_pattern(),
            web_urls: Vec::new(),
            blog_base_url: String::new(),
            index_only_published: default_true(),

            use_chunking: default_true(),
            chunking_strategy: ChunkingStrategyKind::default(),
            adaptive_chunking: default_true(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            semantic_breakpoint_type: SemanticBreakpointType::default(),
            semantic_breakpoint_threshold_amount: default_semantic_threshold(),
            semantic_min_chunk_size: default_semantic_min_chunk(),

            collection_name: default_collection_name(),
            embedding_model: default_embedding_model(),
            vector_store_url: None,
            vector_store_path: PathBuf::from("data/vector_store"),

            force_recreate: false,
            incremental_mode: IncrementalMode::default(),
            checksum_algorithm: ChecksumAlgorithm::default(),
            auto_detect_changes: default_true(),
            incremental_fallback_threshold: default_incremental_fallback_threshold(),

            enable_batch_processing: default_true(),
            batch_size: default_batch_size(),
            batch_pause_seconds: default_batch_pause_seconds(),
            max_concurrent_operations: default_max_concurrent_operations(),

            max_backup_files: default_max_backup_files(),

            ledger_path: PathBuf::from("data/metadata_ledger.csv"),
            reports_path: PathBuf::from("data/run_reports.log"),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| IndexError::Config(format!("failed to read {:?}: {e}", path.as_ref())))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, IndexError> {
        let cfg: PipelineConfig =
            serde_yaml::from_str(text).map_err(|e| IndexError::Config(format!("invalid config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.batch_size == 0 {
            return Err(IndexError::Config("batch_size must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(IndexError::Config("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IndexError::Config(
                "chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.incremental_fallback_threshold) {
            return Err(IndexError::Config(
                "incremental_fallback_threshold must be between 0 and 1".into(),
            ));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(IndexError::Config("embedding_model must be set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = PipelineConfig::from_yaml_str("data_dir: foo\nbogus_key: 1\n").unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }

    #[test]
    fn rejects_overlap_gte_size() {
        let mut cfg = PipelineConfig::default();
        cfg.chunk_overlap = cfg.chunk_size;
        assert!(cfg.validate().is_err());
    }
}
