// src/health.rs
//
// =============================================================================
// RAGKEEPER: HEALTH CHECKER
// =============================================================================
//
// Aggregates five independent checks into one status. Resource checks use
// `sysinfo` for CPU/memory detection.

use crate::config::PipelineConfig;
use crate::ledger::Ledger;
use crate::vector_store::VectorStore;
use serde::Serialize;
use sysinfo::{CpuRefreshKind, Disks, MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Warning,
    Unhealthy,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: Status,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: Status,
    pub checks: Vec<CheckResult>,
    pub recommendations: Vec<String>,
    pub errors: Vec<String>,
}

const WARNING_THRESHOLD: f64 = 80.0;
const CRITICAL_THRESHOLD: f64 = 95.0;

pub async fn check_health(
    config: &PipelineConfig,
    store: &dyn VectorStore,
    max_backup_age_days: i64,
) -> HealthReport {
    let mut checks = Vec::new();
    let mut recommendations = Vec::new();
    let mut errors = Vec::new();

    checks.push(check_ledger_integrity(config));
    checks.push(check_store_reachability(store).await);
    let (backup_check, backup_rec) = check_backup_health(config, max_backup_age_days);
    checks.push(backup_check);
    if let Some(rec) = backup_rec {
        recommendations.push(rec);
    }
    checks.push(check_config_sanity(config));
    checks.push(check_system_resources());

    for check in &checks {
        if check.status == Status::Error {
            errors.push(format!("{}: {}", check.name, check.detail));
        }
        if check.status != Status::Healthy && check.status != Status::Error {
            recommendations.push(format!("{}: {}", check.name, check.detail));
        }
    }

    let overall = checks
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(Status::Healthy);

    HealthReport {
        overall,
        checks,
        recommendations,
        errors,
    }
}

fn check_ledger_integrity(config: &PipelineConfig) -> CheckResult {
    let ledger = Ledger::new(&config.ledger_path);
    match ledger.load() {
        Ok(rows) => CheckResult {
            name: "ledger_integrity".into(),
            status: Status::Healthy,
            detail: format!("{} rows", rows.len()),
        },
        Err(e) => CheckResult {
            name: "ledger_integrity".into(),
            status: Status::Error,
            detail: e.to_string(),
        },
    }
}

async fn check_store_reachability(store: &dyn VectorStore) -> CheckResult {
    if store.validate_health().await {
        CheckResult {
            name: "vector_store".into(),
            status: Status::Healthy,
            detail: "reachable".into(),
        }
    } else {
        CheckResult {
            name: "vector_store".into(),
            status: Status::Unhealthy,
            detail: "validate_health probe failed".into(),
        }
    }
}

fn check_backup_health(config: &PipelineConfig, max_age_days: i64) -> (CheckResult, Option<String>) {
    let ledger = Ledger::new(&config.ledger_path);
    let parent = config.ledger_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let stem = config
        .ledger_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("ledger")
        .to_string();
    let prefix = format!("{}.csv.bak.", stem);

    let mut backups = Vec::new();
    if let Ok(entries) = std::fs::read_dir(parent) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    backups.push(entry.path());
                }
            }
        }
    }
    let _ = &ledger;

    let count = backups.len();
    if count > config.max_backup_files {
        return (
            CheckResult {
                name: "backup_health".into(),
                status: Status::Warning,
                detail: format!("{count} backups exceeds retention of {}", config.max_backup_files),
            },
            Some("run cleanup_backups to prune old ledger backups".into()),
        );
    }

    let oldest_age_days = backups
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .filter_map(|m| m.modified().ok())
        .filter_map(|t| t.elapsed().ok())
        .map(|d| d.as_secs() as i64 / 86_400)
        .max()
        .unwrap_or(0);

    if oldest_age_days > max_age_days {
        (
            CheckResult {
                name: "backup_health".into(),
                status: Status::Warning,
                detail: format!("oldest backup is {oldest_age_days} days old"),
            },
            Some("rotate ledger backups; oldest exceeds configured age".into()),
        )
    } else {
        (
            CheckResult {
                name: "backup_health".into(),
                status: Status::Healthy,
                detail: format!("{count} backups"),
            },
            None,
        )
    }
}

fn check_config_sanity(config: &PipelineConfig) -> CheckResult {
    match config.validate() {
        Ok(()) => CheckResult {
            name: "configuration".into(),
            status: Status::Healthy,
            detail: "ok".into(),
        },
        Err(e) => CheckResult {
            name: "configuration".into(),
            status: Status::Unhealthy,
            detail: e.to_string(),
        },
    }
}

fn check_system_resources() -> CheckResult {
    let mut system = System::new_with_specifics(
        RefreshKind::nothing()
            .with_memory(MemoryRefreshKind::everything())
            .with_cpu(CpuRefreshKind::everything()),
    );
    system.refresh_memory();
    system.refresh_cpu_usage();

    let memory_percent = if system.total_memory() > 0 {
        100.0 * system.used_memory() as f64 / system.total_memory() as f64
    } else {
        0.0
    };
    let cpu_percent = system.global_cpu_usage() as f64;

    let disks = Disks::new_with_refreshed_list();
    let (total_space, available_space) = disks
        .iter()
        .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
    let disk_percent = if total_space > 0 {
        100.0 * (total_space - available_space) as f64 / total_space as f64
    } else {
        0.0
    };

    let worst = memory_percent.max(cpu_percent).max(disk_percent);

    let status = if worst >= CRITICAL_THRESHOLD {
        Status::Unhealthy
    } else if worst >= WARNING_THRESHOLD {
        Status::Warning
    } else {
        Status::Healthy
    };

    CheckResult {
        name: "system_resources".into(),
        status,
        detail: format!("memory={memory_percent:.1}% cpu={cpu_percent:.1}% disk={disk_percent:.1}%"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_picks_worst() {
        assert!(Status::Error > Status::Unhealthy);
        assert!(Status::Unhealthy > Status::Warning);
        assert!(Status::Warning > Status::Healthy);
    }

    #[test]
    fn config_sanity_rejects_bad_config() {
        let mut config = PipelineConfig::default();
        config.batch_size = 0;
        let result = check_config_sanity(&config);
        assert_eq!(result.status, Status::Unhealthy);
    }
}
