//! SQLite-backed store for test runs and per-agent rollups. All access goes
//! through one async connection; writers batch inside transactions.

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::Connection;

use crate::error::{PersistError, PersistResult};
use crate::run::{AgentResult, TestRun, TestRunResults, TestRunStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS test_runs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    test_plan_json TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    duration TEXT,
    agent_count INTEGER NOT NULL,
    parameters_json TEXT,
    results_json TEXT
);
CREATE TABLE IF NOT EXISTS agent_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    test_run_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    region TEXT,
    requests INTEGER NOT NULL,
    errors INTEGER NOT NULL,
    avg_latency_ms REAL NOT NULL,
    min_latency_ms REAL NOT NULL,
    max_latency_ms REAL NOT NULL,
    status_codes_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_results_test_run_id
    ON agent_results(test_run_id);
";

/// Fixed-width UTC timestamps: lossless, and string comparison orders
/// chronologically.
fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

struct RunRow {
    id: String,
    name: String,
    test_plan_json: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration: Option<String>,
    agent_count: i64,
    parameters_json: Option<String>,
    results_json: Option<String>,
}

impl RunRow {
    fn from_sql(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            test_plan_json: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            duration: row.get(7)?,
            agent_count: row.get(8)?,
            parameters_json: row.get(9)?,
            results_json: row.get(10)?,
        })
    }

    fn into_test_run(self) -> PersistResult<TestRun> {
        let test_plan = serde_json::from_str(&self.test_plan_json).map_err(|source| {
            PersistError::Decode {
                context: "test plan",
                source,
            }
        })?;
        let parameters = match self.parameters_json.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(serde_json::from_str(raw).map_err(|source| PersistError::Decode {
                context: "run parameters",
                source,
            })?),
        };
        let results: Option<TestRunResults> = match self.results_json.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(serde_json::from_str(raw).map_err(|source| PersistError::Decode {
                context: "run results",
                source,
            })?),
        };

        Ok(TestRun {
            id: self.id,
            name: self.name,
            test_plan,
            status: TestRunStatus::parse(&self.status).unwrap_or(TestRunStatus::Failed),
            created_at: parse_ts(&self.created_at).unwrap_or_else(Utc::now),
            started_at: self.started_at.as_deref().and_then(parse_ts),
            completed_at: self.completed_at.as_deref().and_then(parse_ts),
            duration: self.duration,
            results,
            min_agents: u32::try_from(self.agent_count).unwrap_or(1),
            parameters,
        })
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (or creates) the database and applies migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema fails.
    pub async fn open(dsn: &str) -> PersistResult<Self> {
        let conn = if dsn == ":memory:" {
            Connection::open_in_memory().await
        } else {
            Connection::open(dsn).await
        }
        .map_err(|source| PersistError::Open {
            dsn: dsn.to_owned(),
            source,
        })?;

        conn.call(|conn| {
            conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|source| PersistError::Call {
            context: "apply schema",
            source,
        })?;

        Ok(Self { conn })
    }

    /// Inserts or replaces the run row.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save_test_run(&self, run: &TestRun) -> PersistResult<()> {
        let test_plan_json =
            serde_json::to_string(&run.test_plan).map_err(|source| PersistError::Decode {
                context: "test plan",
                source,
            })?;
        let parameters_json = run
            .parameters
            .as_ref()
            .map(|value| {
                serde_json::to_string(value).map_err(|source| PersistError::Decode {
                    context: "run parameters",
                    source,
                })
            })
            .transpose()?;
        let results_json = run
            .results
            .as_ref()
            .map(|value| {
                serde_json::to_string(value).map_err(|source| PersistError::Decode {
                    context: "run results",
                    source,
                })
            })
            .transpose()?;

        let id = run.id.clone();
        let name = run.name.clone();
        let status = run.status.as_str().to_owned();
        let created_at = format_ts(run.created_at);
        let started_at = run.started_at.map(format_ts);
        let completed_at = run.completed_at.map(format_ts);
        let duration = run.duration.clone();
        let agent_count = i64::from(run.min_agents);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO test_runs
                     (id, name, test_plan_json, status, created_at, started_at,
                      completed_at, duration, agent_count, parameters_json, results_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        id,
                        name,
                        test_plan_json,
                        status,
                        created_at,
                        started_at,
                        completed_at,
                        duration,
                        agent_count,
                        parameters_json,
                        results_json
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "save test run",
                source,
            })
    }

    /// # Errors
    ///
    /// Returns [`PersistError::NotFound`] when the id has no row.
    pub async fn get_test_run(&self, id: &str) -> PersistResult<TestRun> {
        let id_owned = id.to_owned();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, test_plan_json, status, created_at, started_at,
                            completed_at, duration, agent_count, parameters_json, results_json
                     FROM test_runs WHERE id = ?1",
                )?;
                let mut rows = stmt.query_map([id_owned], RunRow::from_sql)?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "get test run",
                source,
            })?;

        row.ok_or_else(|| PersistError::NotFound { id: id.to_owned() })?
            .into_test_run()
    }

    /// Most recent runs first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn list_test_runs(&self, limit: u32, offset: u32) -> PersistResult<Vec<TestRun>> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, test_plan_json, status, created_at, started_at,
                            completed_at, duration, agent_count, parameters_json, results_json
                     FROM test_runs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(
                        rusqlite::params![i64::from(limit), i64::from(offset)],
                        RunRow::from_sql,
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "list test runs",
                source,
            })?;

        rows.into_iter().map(RunRow::into_test_run).collect()
    }

    /// Removes the run and its agent results.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_test_run(&self, id: &str) -> PersistResult<()> {
        let id = id.to_owned();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM agent_results WHERE test_run_id = ?1", [&id])?;
                tx.execute("DELETE FROM test_runs WHERE id = ?1", [&id])?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "delete test run",
                source,
            })
    }

    /// Deletes every run in `status`; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_test_runs_by_status(&self, status: &str) -> PersistResult<u64> {
        let status = status.to_owned();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM agent_results WHERE test_run_id IN
                     (SELECT id FROM test_runs WHERE status = ?1)",
                    [&status],
                )?;
                let deleted = tx.execute("DELETE FROM test_runs WHERE status = ?1", [&status])?;
                tx.commit()?;
                Ok(deleted as u64)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "bulk delete by status",
                source,
            })
    }

    /// Deletes runs created before `cutoff`; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn delete_test_runs_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> PersistResult<u64> {
        let cutoff = format_ts(cutoff);
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM agent_results WHERE test_run_id IN
                     (SELECT id FROM test_runs WHERE created_at < ?1)",
                    [&cutoff],
                )?;
                let deleted =
                    tx.execute("DELETE FROM test_runs WHERE created_at < ?1", [&cutoff])?;
                tx.commit()?;
                Ok(deleted as u64)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "bulk delete by age",
                source,
            })
    }

    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub async fn count_test_runs(&self) -> PersistResult<u64> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM test_runs", [], |row| row.get(0))?;
                Ok(count as u64)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "count test runs",
                source,
            })
    }

    /// # Errors
    ///
    /// Returns an error if the count query fails.
    pub async fn count_test_runs_by_status(&self, status: &str) -> PersistResult<u64> {
        let status = status.to_owned();
        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM test_runs WHERE status = ?1",
                    [&status],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "count test runs by status",
                source,
            })
    }

    /// Replaces the stored rollups for `test_run_id` with `results`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn save_agent_results(
        &self,
        test_run_id: &str,
        results: &[AgentResult],
    ) -> PersistResult<()> {
        let mut rows = Vec::with_capacity(results.len());
        for result in results {
            let status_codes_json = serde_json::to_string(&result.status_codes).map_err(
                |source| PersistError::Decode {
                    context: "status codes",
                    source,
                },
            )?;
            rows.push((
                result.agent_id.clone(),
                result.region.clone(),
                result.requests as i64,
                result.errors as i64,
                result.avg_latency_ms,
                result.min_latency_ms,
                result.max_latency_ms,
                status_codes_json,
            ));
        }
        let test_run_id = test_run_id.to_owned();
        let updated_at = format_ts(Utc::now());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM agent_results WHERE test_run_id = ?1",
                    [&test_run_id],
                )?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO agent_results
                         (test_run_id, agent_id, region, requests, errors, avg_latency_ms,
                          min_latency_ms, max_latency_ms, status_codes_json, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    )?;
                    for row in rows {
                        stmt.execute(rusqlite::params![
                            test_run_id,
                            row.0,
                            row.1,
                            row.2,
                            row.3,
                            row.4,
                            row.5,
                            row.6,
                            row.7,
                            updated_at
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "save agent results",
                source,
            })
    }

    /// # Errors
    ///
    /// Returns an error if the query or row decoding fails.
    pub async fn get_agent_results(&self, test_run_id: &str) -> PersistResult<Vec<AgentResult>> {
        let test_run_id = test_run_id.to_owned();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, region, requests, errors, avg_latency_ms,
                            min_latency_ms, max_latency_ms, status_codes_json
                     FROM agent_results WHERE test_run_id = ?1",
                )?;
                let rows = stmt
                    .query_map([&test_run_id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, f64>(4)?,
                            row.get::<_, f64>(5)?,
                            row.get::<_, f64>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(|source| PersistError::Call {
                context: "get agent results",
                source,
            })?;

        rows.into_iter()
            .map(|row| {
                let status_codes = serde_json::from_str(&row.7).map_err(|source| {
                    PersistError::Decode {
                        context: "status codes",
                        source,
                    }
                })?;
                Ok(AgentResult {
                    agent_id: row.0,
                    region: row.1.unwrap_or_default(),
                    requests: row.2.max(0) as u64,
                    errors: row.3.max(0) as u64,
                    avg_latency_ms: row.4,
                    min_latency_ms: row.5,
                    max_latency_ms: row.6,
                    status_codes,
                })
            })
            .collect()
    }
}
