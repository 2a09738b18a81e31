// End-to-end scenarios against the public pipeline and scheduler API.

use ragkeeper::clock::SystemClock;
use ragkeeper::config::{ChunkingStrategyKind, IncrementalMode, PipelineConfig};
use ragkeeper::perf::PerformanceMonitor;
use ragkeeper::pipeline::PipelineEngine;
use ragkeeper::report::RunStatus;
use ragkeeper::scheduler::Scheduler;
use ragkeeper::trigger::{IntervalTrigger, Trigger};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn base_config(root: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        data_dir: root.join("data"),
        chunking_strategy: ChunkingStrategyKind::Recursive,
        adaptive_chunking: false,
        chunk_size: 50,
        chunk_overlap: 10,
        vector_store_path: root.join("store"),
        ledger_path: root.join("ledger.csv"),
        reports_path: root.join("reports.log"),
        ..PipelineConfig::default()
    }
}

fn write_doc(root: &std::path::Path, name: &str, body: &str) {
    let dir = root.join("data");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), body).unwrap();
}

fn engine() -> PipelineEngine {
    PipelineEngine::new(PerformanceMonitor::new(64), Arc::new(SystemClock))
}

#[tokio::test]
async fn empty_to_two_new_documents_are_indexed() {
    let dir = tempdir().unwrap();
    write_doc(dir.path(), "a.md", "Alpha document body repeated enough to span a couple of chunks of text.");
    write_doc(dir.path(), "b.md", "Beta document body, also long enough to be split into more than one piece.");

    let config = base_config(dir.path());
    let report = engine().run("job-1", &config).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.counts.loaded, 2);
    assert_eq!(report.counts.new, 2);
    assert_eq!(report.counts.modified, 0);
    assert_eq!(report.counts.deleted, 0);
    assert_eq!(report.counts.upserted, report.counts.chunked);

    let ledger = ragkeeper::ledger::Ledger::new(&config.ledger_path);
    let rows = ledger.load().unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn modify_one_leaves_the_other_untouched() {
    let dir = tempdir().unwrap();
    write_doc(dir.path(), "a.md", "Alpha document body repeated enough to span a couple of chunks of text.");
    write_doc(dir.path(), "b.md", "Beta document body, also long enough to be split into more than one piece.");
    let config = base_config(dir.path());
    engine().run("job-1", &config).await;

    let ledger = ragkeeper::ledger::Ledger::new(&config.ledger_path);
    let before = ledger.load().unwrap();
    let a_source = before.keys().find(|k| k.ends_with("a.md")).unwrap().clone();
    let b_source = before.keys().find(|k| k.ends_with("b.md")).unwrap().clone();
    let b_row_before = before[&b_source].clone();

    write_doc(dir.path(), "a.md", "Alpha document body has now changed completely, different words entirely.");
    let report = engine().run("job-2", &config).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.counts.new, 0);
    assert_eq!(report.counts.modified, 1);
    assert_eq!(report.counts.deleted, 0);

    let after = ledger.load().unwrap();
    assert_eq!(after.len(), 2);
    assert_ne!(after[&a_source].content_checksum, before[&a_source].content_checksum);
    assert_eq!(after[&b_source], b_row_before);
}

#[tokio::test]
async fn delete_one_removes_its_ledger_row() {
    let dir = tempdir().unwrap();
    write_doc(dir.path(), "a.md", "Alpha document body repeated enough to span a couple of chunks of text.");
    write_doc(dir.path(), "b.md", "Beta document body, also long enough to be split into more than one piece.");
    let config = base_config(dir.path());
    engine().run("job-1", &config).await;

    fs::remove_file(dir.path().join("data").join("b.md")).unwrap();
    let report = engine().run("job-2", &config).await;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.counts.deleted, 1);

    let ledger = ragkeeper::ledger::Ledger::new(&config.ledger_path);
    let rows = ledger.load().unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows.keys().next().unwrap().ends_with("a.md"));
}

#[tokio::test]
async fn high_change_ratio_falls_back_to_full_rebuild() {
    let dir = tempdir().unwrap();
    for i in 0..10 {
        write_doc(dir.path(), &format!("doc{i}.md"), &format!("Document number {i} with some body text padding it out."));
    }
    let mut config = base_config(dir.path());
    config.incremental_mode = IncrementalMode::Auto;
    config.incremental_fallback_threshold = 0.5;
    engine().run("job-1", &config).await;

    // Drop four documents and add six new ones; total-changed / ledger_len
    // comes out well above the 0.5 fallback threshold, forcing a rebuild.
    for i in 0..4 {
        fs::remove_file(dir.path().join("data").join(format!("doc{i}.md"))).unwrap();
    }
    for i in 10..16 {
        write_doc(dir.path(), &format!("doc{i}.md"), &format!("Fresh document {i} added on the second pass."));
    }
    let report = engine().run("job-2", &config).await;

    assert_eq!(report.status, RunStatus::Success);
    let ledger = ragkeeper::ledger::Ledger::new(&config.ledger_path);
    let rows = ledger.load().unwrap();
    // Full rebuild reindexes exactly what is currently on disk: 6 kept + 6 new = 12.
    assert_eq!(rows.len(), 12);
}

#[tokio::test]
async fn concurrent_trigger_of_the_same_job_is_recorded_as_missed() {
    let dir = tempdir().unwrap();
    write_doc(dir.path(), "a.md", "Solitary document, just long enough to produce a single chunk of output text.");

    let mut config = base_config(dir.path());
    config.batch_size = 10;
    config.max_concurrent_operations = 1;
    config.batch_pause_seconds = 2.0;

    let clock = Arc::new(SystemClock);
    let scheduler = Scheduler::open(dir.path().join("jobs.db"), clock, engine()).unwrap();
    scheduler
        .create_job(
            "slow-job",
            Trigger::Interval(IntervalTrigger {
                minutes: 60,
                hours: 0,
                days: 0,
            }),
            config,
        )
        .unwrap();

    scheduler.trigger_now("slow-job").unwrap();
    scheduler.trigger_now("slow-job").unwrap();

    // Give the first dispatch time to acquire its guard and enter the
    // batch pause; the second trigger should find the guard held.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mid_stats = scheduler.stats();
    assert_eq!(mid_stats.jobs_missed, 1);
    assert_eq!(mid_stats.jobs_executed, 0);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let final_stats = scheduler.stats();
    assert_eq!(final_stats.jobs_executed, 1);
    assert_eq!(final_stats.jobs_missed, 1);
}
