//! SQLite persistence for builds, logs, costs, and pause gates.
//!
//! The connection sits behind a `std::sync::Mutex`; callers hold it only for
//! the duration of one statement or transaction. Logs and costs are
//! append-only and never revised.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::models::{
    Build, BuildCostRow, BuildLogRow, BuildStatus, BuildSummary, GateKind, LogLevel, LogSource,
    PendingGate, TargetKind,
};

pub struct BuildStore {
    conn: Mutex<Connection>,
}

impl BuildStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .context("Failed to set busy timeout")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                project_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                target_kind TEXT NOT NULL,
                target_ref TEXT NOT NULL,
                working_dir TEXT NOT NULL,
                current_phase INTEGER NOT NULL DEFAULT 0,
                completed_phases INTEGER NOT NULL DEFAULT -1,
                loop_count INTEGER NOT NULL DEFAULT 0,
                contract_batch TEXT,
                spend_cap_usd REAL NOT NULL DEFAULT 10.0,
                gate_kind TEXT,
                gate_payload TEXT,
                gate_registered_at TEXT,
                paused_at TEXT,
                error_detail TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS build_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                ts TEXT NOT NULL,
                source TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                event_kind TEXT
            );

            CREATE TABLE IF NOT EXISTS build_costs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                usd REAL NOT NULL,
                ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contract_snapshots (
                build_id TEXT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                content TEXT NOT NULL,
                PRIMARY KEY (build_id, path)
            );

            CREATE INDEX IF NOT EXISTS idx_build_logs_build ON build_logs(build_id, ts);
            CREATE INDEX IF NOT EXISTS idx_build_costs_build ON build_costs(build_id);
            CREATE INDEX IF NOT EXISTS idx_builds_user ON builds(user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_builds_project ON builds(project_id, status);
            ",
        )
        .context("Failed to create tables")?;
        Ok(())
    }

    // ── Builds ────────────────────────────────────────────────────────

    pub fn create(&self, build: &Build) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO builds (id, project_id, user_id, status, target_kind, target_ref,
                                 working_dir, current_phase, completed_phases, loop_count,
                                 contract_batch, spend_cap_usd, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                build.id,
                build.project_id,
                build.user_id,
                build.status.as_str(),
                build.target_kind.as_str(),
                build.target_ref,
                build.working_dir,
                build.current_phase,
                build.completed_phases,
                build.loop_count,
                build.contract_batch,
                build.spend_cap_usd,
                build.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert build")?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Build>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT id, project_id, user_id, status, target_kind, target_ref, working_dir,
                        current_phase, completed_phases, loop_count, contract_batch,
                        spend_cap_usd, gate_kind, gate_payload, gate_registered_at, paused_at,
                        error_detail, created_at, completed_at
                 FROM builds WHERE id = ?1",
            )
            .context("Failed to prepare get build")?;
        let mut rows = stmt
            .query_map(params![id], row_to_build)
            .context("Failed to query build")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read build row")??)),
            None => Ok(None),
        }
    }

    pub fn update_status(
        &self,
        id: &str,
        status: BuildStatus,
        error_detail: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        let completed_at = status.is_terminal().then(|| Utc::now().to_rfc3339());
        conn.execute(
            "UPDATE builds SET status = ?1, error_detail = COALESCE(?2, error_detail),
                    completed_at = COALESCE(?3, completed_at),
                    paused_at = CASE WHEN ?1 = 'paused' THEN ?4 ELSE paused_at END
             WHERE id = ?5",
            params![
                status.as_str(),
                error_detail,
                completed_at,
                Utc::now().to_rfc3339(),
                id
            ],
        )
        .context("Failed to update build status")?;
        Ok(())
    }

    pub fn set_phase(&self, id: &str, phase: u32) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE builds SET current_phase = ?1 WHERE id = ?2",
            params![phase, id],
        )
        .context("Failed to set phase")?;
        Ok(())
    }

    /// Update the audit-loop bookkeeping. `completed_phases` only moves
    /// forward; a regression here would break monotonicity.
    pub fn set_progress(&self, id: &str, completed_phases: i64, loop_count: u32) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE builds SET completed_phases = MAX(completed_phases, ?1), loop_count = ?2
             WHERE id = ?3",
            params![completed_phases, loop_count, id],
        )
        .context("Failed to set progress")?;
        Ok(())
    }

    pub fn set_contract_batch(&self, id: &str, digest: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE builds SET contract_batch = ?1 WHERE id = ?2",
            params![digest, id],
        )
        .context("Failed to set contract batch")?;
        Ok(())
    }

    // ── Gates ─────────────────────────────────────────────────────────

    pub fn set_gate(&self, id: &str, gate: &PendingGate) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE builds SET gate_kind = ?1, gate_payload = ?2, gate_registered_at = ?3
             WHERE id = ?4",
            params![
                gate.kind.as_str(),
                serde_json::to_string(&gate.payload)?,
                gate.registered_at.to_rfc3339(),
                id
            ],
        )
        .context("Failed to set gate")?;
        Ok(())
    }

    pub fn clear_gate(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "UPDATE builds SET gate_kind = NULL, gate_payload = NULL, gate_registered_at = NULL,
                    paused_at = NULL
             WHERE id = ?1",
            params![id],
        )
        .context("Failed to clear gate")?;
        Ok(())
    }

    // ── Logs and costs ────────────────────────────────────────────────

    pub fn append_log(
        &self,
        build_id: &str,
        source: LogSource,
        level: LogLevel,
        message: &str,
        event_kind: Option<&str>,
    ) -> Result<BuildLogRow> {
        let ts = Utc::now();
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO build_logs (build_id, ts, source, level, message, event_kind)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                build_id,
                ts.to_rfc3339(),
                source.as_str(),
                level.as_str(),
                message,
                event_kind
            ],
        )
        .context("Failed to append log")?;
        Ok(BuildLogRow {
            id: conn.last_insert_rowid(),
            build_id: build_id.to_string(),
            ts,
            source,
            level,
            message: message.to_string(),
            event_kind: event_kind.map(String::from),
        })
    }

    pub fn list_logs(
        &self,
        build_id: &str,
        after_ts: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<BuildLogRow>> {
        let conn = self.conn.lock().expect("store lock");
        let after = after_ts
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string());
        let mut stmt = conn
            .prepare(
                "SELECT id, build_id, ts, source, level, message, event_kind
                 FROM build_logs WHERE build_id = ?1 AND ts > ?2
                 ORDER BY id LIMIT ?3",
            )
            .context("Failed to prepare list_logs")?;
        let rows = stmt
            .query_map(params![build_id, after, limit], row_to_log)
            .context("Failed to query logs")?;
        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.context("Failed to read log row")??);
        }
        Ok(logs)
    }

    pub fn append_cost(
        &self,
        build_id: &str,
        phase: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        usd: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock");
        conn.execute(
            "INSERT INTO build_costs (build_id, phase, model, input_tokens, output_tokens, usd, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                build_id,
                phase,
                model,
                input_tokens,
                output_tokens,
                usd,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to append cost")?;
        Ok(())
    }

    pub fn list_costs(&self, build_id: &str) -> Result<Vec<BuildCostRow>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT id, build_id, phase, model, input_tokens, output_tokens, usd, ts
                 FROM build_costs WHERE build_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_costs")?;
        let rows = stmt
            .query_map(params![build_id], |row| {
                Ok(BuildCostRow {
                    id: row.get(0)?,
                    build_id: row.get(1)?,
                    phase: row.get(2)?,
                    model: row.get(3)?,
                    input_tokens: row.get::<_, i64>(4)? as u64,
                    output_tokens: row.get::<_, i64>(5)? as u64,
                    usd: row.get(6)?,
                    ts: parse_ts(&row.get::<_, String>(7)?),
                })
            })
            .context("Failed to query costs")?;
        let mut costs = Vec::new();
        for row in rows {
            costs.push(row.context("Failed to read cost row")?);
        }
        Ok(costs)
    }

    // ── Contract snapshots ────────────────────────────────────────────

    /// Pin the contract batch for a build: all files and the digest land in
    /// one transaction so a crash cannot leave a half-pinned batch.
    pub fn snapshot_contracts(
        &self,
        build_id: &str,
        digest: &str,
        files: &[(String, String)],
    ) -> Result<()> {
        let mut conn = self.conn.lock().expect("store lock");
        let tx = conn.transaction().context("Failed to open transaction")?;
        for (path, content) in files {
            tx.execute(
                "INSERT OR REPLACE INTO contract_snapshots (build_id, path, content)
                 VALUES (?1, ?2, ?3)",
                params![build_id, path, content],
            )
            .context("Failed to insert contract snapshot")?;
        }
        tx.execute(
            "UPDATE builds SET contract_batch = ?1 WHERE id = ?2",
            params![digest, build_id],
        )
        .context("Failed to pin contract batch")?;
        tx.commit().context("Failed to commit contract snapshot")?;
        Ok(())
    }

    pub fn get_contracts(&self, build_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT path, content FROM contract_snapshots WHERE build_id = ?1 ORDER BY path",
            )
            .context("Failed to prepare get_contracts")?;
        let rows = stmt
            .query_map(params![build_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query contracts")?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("Failed to read contract row")?);
        }
        Ok(files)
    }

    /// Cascade-delete a build and everything hanging off it.
    pub fn delete_build(&self, build_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().expect("store lock");
        let tx = conn.transaction().context("Failed to open transaction")?;
        tx.execute(
            "DELETE FROM build_logs WHERE build_id = ?1",
            params![build_id],
        )?;
        tx.execute(
            "DELETE FROM build_costs WHERE build_id = ?1",
            params![build_id],
        )?;
        tx.execute(
            "DELETE FROM contract_snapshots WHERE build_id = ?1",
            params![build_id],
        )?;
        let count = tx.execute("DELETE FROM builds WHERE id = ?1", params![build_id])?;
        tx.commit().context("Failed to commit delete")?;
        Ok(count > 0)
    }

    // ── Startup scan and rate-limit queries ──────────────────────────

    /// Builds left in a non-terminal state by a previous process.
    pub fn find_unfinished(&self) -> Result<Vec<Build>> {
        let conn = self.conn.lock().expect("store lock");
        let mut stmt = conn
            .prepare(
                "SELECT id, project_id, user_id, status, target_kind, target_ref, working_dir,
                        current_phase, completed_phases, loop_count, contract_batch,
                        spend_cap_usd, gate_kind, gate_payload, gate_registered_at, paused_at,
                        error_detail, created_at, completed_at
                 FROM builds WHERE status IN ('running', 'paused', 'pending')",
            )
            .context("Failed to prepare find_unfinished")?;
        let rows = stmt
            .query_map([], row_to_build)
            .context("Failed to query unfinished builds")?;
        let mut builds = Vec::new();
        for row in rows {
            builds.push(row.context("Failed to read build row")??);
        }
        Ok(builds)
    }

    pub fn count_builds_since(&self, user_id: i64, since: DateTime<Utc>) -> Result<u32> {
        let conn = self.conn.lock().expect("store lock");
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM builds WHERE user_id = ?1 AND created_at > ?2",
                params![user_id, since.to_rfc3339()],
                |row| row.get(0),
            )
            .context("Failed to count recent builds")?;
        Ok(count)
    }

    pub fn count_active_for_project(&self, project_id: i64) -> Result<u32> {
        let conn = self.conn.lock().expect("store lock");
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM builds WHERE project_id = ?1
                 AND status IN ('pending', 'running', 'paused')",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to count active builds")?;
        Ok(count)
    }

    pub fn count_active_for_user(&self, user_id: i64) -> Result<u32> {
        let conn = self.conn.lock().expect("store lock");
        let count: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM builds WHERE user_id = ?1
                 AND status IN ('pending', 'running', 'paused')",
                params![user_id],
                |row| row.get(0),
            )
            .context("Failed to count active builds")?;
        Ok(count)
    }

    // ── Summary ──────────────────────────────────────────────────────

    /// Aggregate the ledgers into the control surface's summary view.
    pub fn summary(&self, build_id: &str) -> Result<Option<BuildSummary>> {
        let Some(build) = self.get(build_id)? else {
            return Ok(None);
        };
        let mut summary = BuildSummary {
            build_id: build_id.to_string(),
            status: build.status.as_str().to_string(),
            phases_completed: build.completed_phases + 1,
            loop_count: build.loop_count,
            ..Default::default()
        };
        let end = build.completed_at.unwrap_or_else(Utc::now);
        summary.elapsed_secs = (end - build.created_at).num_seconds().max(0);

        let conn = self.conn.lock().expect("store lock");

        {
            let mut stmt = conn.prepare(
                "SELECT message FROM build_logs WHERE build_id = ?1 AND event_kind = 'tool_use'",
            )?;
            let rows = stmt.query_map(params![build_id], |row| row.get::<_, String>(0))?;
            for row in rows {
                let message = row?;
                let tool = message.split_whitespace().next().unwrap_or("unknown");
                *summary.tool_calls.entry(tool.to_string()).or_insert(0) += 1;
            }
        }

        summary.files_written = conn.query_row(
            "SELECT COUNT(*) FROM build_logs WHERE build_id = ?1
             AND event_kind IN ('file_created', 'file_modified')",
            params![build_id],
            |row| row.get::<_, i64>(0),
        )? as u64;

        summary.commits = conn.query_row(
            "SELECT COUNT(*) FROM build_logs WHERE build_id = ?1 AND source = 'git'
             AND message LIKE 'committed%'",
            params![build_id],
            |row| row.get::<_, i64>(0),
        )? as u64;

        {
            let mut stmt = conn.prepare(
                "SELECT message FROM build_logs WHERE build_id = ?1 AND event_kind = 'test_run'",
            )?;
            let rows = stmt.query_map(params![build_id], |row| row.get::<_, String>(0))?;
            for row in rows {
                let message = row?;
                let (p, f) = parse_test_totals(&message);
                summary.tests_passed += p;
                summary.tests_failed += f;
            }
        }

        let (input, output, usd): (i64, i64, f64) = conn.query_row(
            "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                    COALESCE(SUM(usd), 0.0)
             FROM build_costs WHERE build_id = ?1",
            params![build_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        summary.input_tokens = input as u64;
        summary.output_tokens = output as u64;
        summary.total_cost_usd = usd;

        Ok(Some(summary))
    }
}

/// Pull "(N passed, M failed)" totals back out of a test_run log line.
fn parse_test_totals(message: &str) -> (u64, u64) {
    let grab = |marker: &str| -> u64 {
        message
            .split(marker)
            .next()
            .and_then(|prefix| prefix.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty()).last())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    };
    (grab(" passed"), grab(" failed"))
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

type SqlResult<T> = std::result::Result<T, rusqlite::Error>;

fn row_to_build(row: &rusqlite::Row<'_>) -> SqlResult<Result<Build>> {
    let status_str: String = row.get(3)?;
    let target_kind_str: String = row.get(4)?;
    let gate_kind: Option<String> = row.get(12)?;
    let gate_payload: Option<String> = row.get(13)?;
    let gate_registered_at: Option<String> = row.get(14)?;
    let paused_at: Option<String> = row.get(15)?;
    let created_at: String = row.get(17)?;
    let completed_at: Option<String> = row.get(18)?;

    let build = (|| -> Result<Build> {
        let pending_gate = match (gate_kind, gate_payload, gate_registered_at) {
            (Some(kind), Some(payload), Some(at)) => Some(PendingGate {
                kind: GateKind::from_str(&kind).map_err(anyhow::Error::msg)?,
                payload: serde_json::from_str(&payload)?,
                registered_at: parse_ts(&at),
            }),
            _ => None,
        };
        Ok(Build {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            status: BuildStatus::from_str(&status_str).map_err(anyhow::Error::msg)?,
            target_kind: TargetKind::from_str(&target_kind_str).map_err(anyhow::Error::msg)?,
            target_ref: row.get(5)?,
            working_dir: row.get(6)?,
            current_phase: row.get(7)?,
            completed_phases: row.get(8)?,
            loop_count: row.get(9)?,
            contract_batch: row.get(10)?,
            spend_cap_usd: row.get(11)?,
            pending_gate,
            paused_at: paused_at.as_deref().map(parse_ts),
            error_detail: row.get(16)?,
            created_at: parse_ts(&created_at),
            completed_at: completed_at.as_deref().map(parse_ts),
        })
    })();
    Ok(build)
}

fn row_to_log(row: &rusqlite::Row<'_>) -> SqlResult<Result<BuildLogRow>> {
    let ts: String = row.get(2)?;
    let source: String = row.get(3)?;
    let level: String = row.get(4)?;
    let log = (|| -> Result<BuildLogRow> {
        Ok(BuildLogRow {
            id: row.get(0)?,
            build_id: row.get(1)?,
            ts: parse_ts(&ts),
            source: LogSource::from_str(&source).map_err(anyhow::Error::msg)?,
            level: LogLevel::from_str(&level).map_err(anyhow::Error::msg)?,
            message: row.get(5)?,
            event_kind: row.get(6)?,
        })
    })();
    Ok(log)
}
