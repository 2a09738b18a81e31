// src/pipeline.rs
//
// =============================================================================
// RAGKEEPER: PIPELINE ENGINE
// =============================================================================
//
// Orchestrates one end-to-end run. Stateless: every invocation takes a
// config snapshot and returns a `RunReport`; nothing here survives between
// runs except what's written to the ledger, the store, and the report log.

use crate::change::{self, ChangeSets};
use crate::chunker::{self, Chunk, ChunkingStrategy};
use crate::clock::SharedClock;
use crate::config::{IncrementalMode, PipelineConfig};
use crate::document::DocumentLoader;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::IndexError;
use crate::ledger::{Ledger, LedgerRow};
use crate::perf::PerformanceMonitor;
use crate::report::{RunCounts, RunReport, RunReportLog, RunStatus};
use crate::vector_store::{self, VectorStore};
use log::{error, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub enum RunMode {
    Incremental,
    FullRebuild,
}

fn decide_mode(config: &PipelineConfig, sets: &ChangeSets, ledger_len: usize) -> RunMode {
    if config.force_recreate {
        return RunMode::FullRebuild;
    }
    match config.incremental_mode {
        IncrementalMode::Full => RunMode::FullRebuild,
        IncrementalMode::Incremental => RunMode::Incremental,
        IncrementalMode::Auto => {
            let ratio = change::change_ratio(sets, ledger_len);
            if ratio < config.incremental_fallback_threshold {
                RunMode::Incremental
            } else {
                RunMode::FullRebuild
            }
        }
    }
}

pub struct PipelineEngine {
    monitor: PerformanceMonitor,
    clock: SharedClock,
}

impl PipelineEngine {
    pub fn new(monitor: PerformanceMonitor, clock: SharedClock) -> Self {
        Self { monitor, clock }
    }

    /// Runs one end-to-end pipeline execution for `job_id` using `config`.
    /// Always returns a `RunReport`, even on failure, and always appends it
    /// to the report log before returning.
    pub async fn run(&self, job_id: &str, config: &PipelineConfig) -> RunReport {
        let start_time = self.clock.now();
        let report = self.run_inner(config).await;
        let end_time = self.clock.now();

        let report = match report {
            Ok((status, counts, errors, warnings)) => RunReport {
                job_id: job_id.to_string(),
                start_time,
                end_time,
                status,
                counts,
                error_list: errors,
                warnings,
            },
            Err(e) => RunReport {
                job_id: job_id.to_string(),
                start_time,
                end_time,
                status: RunStatus::Failure,
                counts: RunCounts::default(),
                error_list: vec![e.to_string()],
                warnings: Vec::new(),
            },
        };

        let report_log = RunReportLog::new(&config.reports_path);
        if let Err(e) = report_log.append(&report) {
            error!("failed to append run report for job {job_id}: {e}");
        }

        report
    }

    async fn run_inner(
        &self,
        config: &PipelineConfig,
    ) -> Result<(RunStatus, RunCounts, Vec<String>, Vec<String>), IndexError> {
        let mut warnings = Vec::new();
        let mut counts = RunCounts::default();

        let load_scope = self.monitor.start("load", 0);
        let documents = DocumentLoader::load(config)?;
        load_scope.finish();
        counts.loaded = documents.len();

        let ledger = Ledger::new(&config.ledger_path);
        let ledger_rows = ledger.load()?;
        let backup_path = ledger.backup(self.clock.now())?;

        let sets = change::detect_changes(&documents, &ledger_rows);
        counts.new = sets.new.len();
        counts.modified = sets.modified.len();
        counts.deleted = sets.deleted_sources.len();

        let mode = decide_mode(config, &sets, ledger_rows.len());

        let (chunk_size, chunk_overlap) = if config.adaptive_chunking {
            chunker::adaptive_chunk_parameters(&documents, config.chunk_size, config.chunk_overlap)
        } else {
            (config.chunk_size, config.chunk_overlap)
        };
        let strategy = ChunkingStrategy::from_config(config, chunk_size, chunk_overlap);
        let embedder: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::build_provider(&config.embedding_model, config.vector_store_url.as_deref()));

        let run_result = match mode {
            RunMode::FullRebuild => {
                self.run_full_rebuild(config, &documents, &strategy, embedder.clone(), &mut counts, &mut warnings)
                    .await
            }
            RunMode::Incremental => {
                self.run_incremental(config, &sets, &strategy, embedder.clone(), &mut counts, &mut warnings)
                    .await
            }
        };

        match run_result {
            Ok(new_rows) => {
                ledger.save(&new_rows)?;
                ledger.cleanup_backups(config.max_backup_files)?;
                Ok((RunStatus::Success, counts, Vec::new(), warnings))
            }
            Err(PipelineFailure::BeforeMutation(e)) => {
                if let Some(_backup) = &backup_path {
                    if let Err(restore_err) = ledger.restore_latest() {
                        warn!("failed to restore ledger backup after failed run: {restore_err}");
                    }
                }
                Err(e)
            }
            Err(PipelineFailure::Partial { rows, errors }) => {
                ledger.save(&rows)?;
                Ok((RunStatus::Partial, counts, errors, warnings))
            }
        }
    }

    async fn run_full_rebuild(
        &self,
        config: &PipelineConfig,
        documents: &[crate::document::Document],
        strategy: &ChunkingStrategy,
        embedder: Arc<dyn EmbeddingProvider>,
        counts: &mut RunCounts,
        warnings: &mut Vec<String>,
    ) -> Result<HashMap<String, LedgerRow>, PipelineFailure> {
        let store: Arc<dyn VectorStore> = Arc::from(
            vector_store::open_store(&PipelineConfig {
                force_recreate: true,
                ..config.clone()
            })
            .map_err(PipelineFailure::BeforeMutation)?,
        );

        let mut all_chunks: Vec<Chunk> = Vec::new();
        for doc in documents {
            match chunker::chunk_document(doc, strategy, embedder.as_ref()) {
                Ok(chunks) => all_chunks.extend(chunks),
                Err(e) => warnings.push(format!("skipped {}: {e}", doc.source)),
            }
        }
        counts.chunked = all_chunks.len();

        let pause = Duration::from_secs_f64(config.batch_pause_seconds);
        let result = vector_store::add_chunks_batched(
            store,
            all_chunks,
            embedder,
            config.batch_size,
            pause,
            config.max_concurrent_operations,
        )
        .await;
        counts.upserted = result.succeeded_items.len();

        if !result.failed_items_with_errors.is_empty() {
            let errors: Vec<String> = result
                .failed_items_with_errors
                .iter()
                .map(|(c, e)| format!("{}: {e}", c.source))
                .collect();
            let mut rows = HashMap::new();
            let now = self.clock.now();
            let succeeded_sources: std::collections::HashSet<&str> =
                result.succeeded_items.iter().map(|c| c.source.as_str()).collect();
            for doc in documents {
                if succeeded_sources.contains(doc.source.as_str()) {
                    rows.insert(
                        doc.source.clone(),
                        LedgerRow {
                            source: doc.source.clone(),
                            content_checksum: doc.content_checksum.clone(),
                            last_modified: doc.last_modified,
                            indexed_timestamp: now.timestamp(),
                            indexed: true,
                        },
                    );
                }
            }
            return Err(PipelineFailure::Partial { rows, errors });
        }

        let now = self.clock.now();
        let rows: HashMap<String, LedgerRow> = documents
            .iter()
            .map(|doc| {
                (
                    doc.source.clone(),
                    LedgerRow {
                        source: doc.source.clone(),
                        content_checksum: doc.content_checksum.clone(),
                        last_modified: doc.last_modified,
                        indexed_timestamp: now.timestamp(),
                        indexed: true,
                    },
                )
            })
            .collect();
        Ok(rows)
    }

    async fn run_incremental(
        &self,
        config: &PipelineConfig,
        sets: &ChangeSets,
        strategy: &ChunkingStrategy,
        embedder: Arc<dyn EmbeddingProvider>,
        counts: &mut RunCounts,
        warnings: &mut Vec<String>,
    ) -> Result<HashMap<String, LedgerRow>, PipelineFailure> {
        let store = vector_store::open_store(config).map_err(PipelineFailure::BeforeMutation)?;

        let to_remove: Vec<String> = sets
            .deleted_sources
            .iter()
            .cloned()
            .chain(sets.modified.iter().map(|d| d.source.clone()))
            .collect();

        let mut chunks_by_source: HashMap<String, Vec<Chunk>> = HashMap::new();
        for doc in sets.new.iter().chain(sets.modified.iter()) {
            match chunker::chunk_document(doc, strategy, embedder.as_ref()) {
                Ok(chunks) => {
                    counts.chunked += chunks.len();
                    chunks_by_source.insert(doc.source.clone(), chunks);
                }
                Err(e) => warnings.push(format!("skipped {}: {e}", doc.source)),
            }
        }

        let update = match store
            .incremental_update(&to_remove, &chunks_by_source, embedder.as_ref(), config.max_concurrent_operations)
            .await
        {
            Ok(update) => update,
            Err(e) => {
                // Deletions may already have landed in the store by the time
                // this fails, so it is a partial run, not a clean no-op: fall
                // back to the unchanged rows rather than discarding the whole
                // run via a full ledger restore.
                let now = self.clock.now();
                let mut rows = HashMap::new();
                for doc in sets.unchanged.iter() {
                    rows.insert(
                        doc.source.clone(),
                        LedgerRow {
                            source: doc.source.clone(),
                            content_checksum: doc.content_checksum.clone(),
                            last_modified: doc.last_modified,
                            indexed_timestamp: now.timestamp(),
                            indexed: true,
                        },
                    );
                }
                return Err(PipelineFailure::Partial {
                    rows,
                    errors: vec![format!("incremental update failed: {e}")],
                });
            }
        };

        counts.removed = update.removed_count;
        counts.upserted = update.added_count;

        let now = self.clock.now();
        let mut rows = HashMap::new();
        for doc in sets.unchanged.iter() {
            rows.insert(
                doc.source.clone(),
                LedgerRow {
                    source: doc.source.clone(),
                    content_checksum: doc.content_checksum.clone(),
                    last_modified: doc.last_modified,
                    indexed_timestamp: now.timestamp(),
                    indexed: true,
                },
            );
        }
        for doc in sets.new.iter().chain(sets.modified.iter()) {
            if update.failed_sources.contains(&doc.source) {
                continue;
            }
            rows.insert(
                doc.source.clone(),
                LedgerRow {
                    source: doc.source.clone(),
                    content_checksum: doc.content_checksum.clone(),
                    last_modified: doc.last_modified,
                    indexed_timestamp: now.timestamp(),
                    indexed: true,
                },
            );
        }

        if !update.failed_sources.is_empty() {
            return Err(PipelineFailure::Partial {
                rows,
                errors: update
                    .failed_sources
                    .iter()
                    .map(|s| format!("{s}: embedding or store failure"))
                    .collect(),
            });
        }

        Ok(rows)
    }
}

enum PipelineFailure {
    BeforeMutation(IndexError),
    Partial {
        rows: HashMap<String, LedgerRow>,
        errors: Vec<String>,
    },
}
