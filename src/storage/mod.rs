//! SQLite run history -- schema, inserts and queries.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::orchestrator::RunReport;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Persist a finished run, its sub-test verdicts and criterion values.
pub fn save_run(pool: &Pool, report: &RunReport) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let state = &report.state;

    tx.execute(
        "INSERT OR REPLACE INTO runs
            (id, name, status, reason, marker_published, created_at, started_at, finished_at, report_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            state.id,
            state.name,
            state.status.as_str(),
            state.reason,
            state.marker_published,
            state.created_at.to_rfc3339(),
            state.started_at.map(|t| t.to_rfc3339()),
            state.finished_at.map(|t| t.to_rfc3339()),
            serde_json::to_string(report)?,
        ],
    )?;

    for v in &state.verdicts {
        tx.execute(
            "INSERT INTO subtest_verdicts (run_id, name, verdict, reason) VALUES (?1, ?2, ?3, ?4)",
            params![state.id, v.name, v.verdict.to_string(), v.reason],
        )?;
    }

    for cfg in &report.configurations {
        for c in &cfg.criteria {
            let status = serde_json::to_value(c.status)?;
            tx.execute(
                "INSERT INTO metric_results (run_id, configuration, label, value, status)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    state.id,
                    cfg.configuration.to_string(),
                    c.label,
                    c.value,
                    status.as_str().unwrap_or_default(),
                ],
            )?;
        }
    }

    tx.commit()?;
    tracing::debug!(run = %state.id, status = %state.status, "run saved");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub name: String,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubTestRow {
    pub name: String,
    pub verdict: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricRow {
    pub configuration: String,
    pub label: String,
    pub value: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub subtests: Vec<SubTestRow>,
    pub metrics: Vec<MetricRow>,
}

/// Most recent runs first.
pub fn list_runs(pool: &Pool, limit: u32) -> Result<Vec<RunSummary>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, status, reason, created_at, finished_at
         FROM runs ORDER BY created_at DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit], |row| {
            Ok(RunSummary {
                id: row.get(0)?,
                name: row.get(1)?,
                status: row.get(2)?,
                reason: row.get(3)?,
                created_at: row.get(4)?,
                finished_at: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_run(pool: &Pool, id: &str) -> Result<Option<RunDetail>> {
    let conn = pool.get()?;
    let summary = conn
        .query_row(
            "SELECT id, name, status, reason, created_at, finished_at FROM runs WHERE id = ?1",
            [id],
            |row| {
                Ok(RunSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                    reason: row.get(3)?,
                    created_at: row.get(4)?,
                    finished_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    let Some(summary) = summary else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT name, verdict, reason FROM subtest_verdicts WHERE run_id = ?1 ORDER BY id",
    )?;
    let subtests = stmt
        .query_map([id], |row| {
            Ok(SubTestRow {
                name: row.get(0)?,
                verdict: row.get(1)?,
                reason: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT configuration, label, value, status FROM metric_results WHERE run_id = ?1 ORDER BY id",
    )?;
    let metrics = stmt
        .query_map([id], |row| {
            Ok(MetricRow {
                configuration: row.get(0)?,
                label: row.get(1)?,
                value: row.get(2)?,
                status: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(RunDetail {
        summary,
        subtests,
        metrics,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::criteria::{CriterionResult, CriterionStatus};
    use crate::metrics::TestConfiguration;
    use crate::orchestrator::ConfigurationReport;
    use crate::outcome::SubTestVerdict;
    use crate::state::{RunState, RunStatus};
    use std::collections::BTreeMap;

    fn report(name: &str, status: RunStatus) -> RunReport {
        let mut state = RunState::new(name);
        state.status = status;
        state.verdicts = vec![SubTestVerdict::failed(
            format!("{}[connections=64]", name),
            "tx_pps below 1000000",
        )];
        RunReport {
            state,
            capabilities: BTreeMap::new(),
            configurations: vec![ConfigurationReport {
                configuration: TestConfiguration {
                    connections: Some(64),
                    ..Default::default()
                },
                verdict: SubTestVerdict::passed("x"),
                criteria: vec![CriterionResult {
                    label: "sender.tx_pps(mean)".to_string(),
                    value: 900000.0,
                    min: Some(1000000.0),
                    max: None,
                    status: CriterionStatus::OutOfRange,
                }],
                terminations: vec![],
                samples: 10,
            }],
        }
    }

    #[test]
    fn test_save_and_fetch_run() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("nested").join("lisorch.db");
        let pool = open_pool(&db).unwrap();

        let r = report("testpmd", RunStatus::Failed);
        save_run(&pool, &r).unwrap();

        let detail = get_run(&pool, &r.state.id).unwrap().unwrap();
        assert_eq!(detail.summary.status, "failed");
        assert_eq!(detail.subtests.len(), 1);
        assert_eq!(detail.subtests[0].verdict, "failed");
        assert_eq!(detail.metrics[0].configuration, "connections=64");
        assert_eq!(detail.metrics[0].status, "out_of_range");

        assert!(get_run(&pool, "missing").unwrap().is_none());
    }

    #[test]
    fn test_list_runs_newest_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("lisorch.db");
        let pool = open_pool(&db).unwrap();

        let mut first = report("a", RunStatus::Completed);
        first.state.created_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        let second = report("b", RunStatus::Aborted);
        save_run(&pool, &first).unwrap();
        save_run(&pool, &second).unwrap();

        let runs = list_runs(&pool, 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].name, "b");
        assert_eq!(list_runs(&pool, 1).unwrap().len(), 1);
    }
}
