//! The ledger over the shared database.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use flanes_db::Database;
use flanes_types::names::{validate_lane_name, validate_workspace_name};
use flanes_types::{epoch_seconds, CostRecord, Intent, ObjectId};

use crate::error::{LedgerError, LedgerResult};
use crate::types::{
    Lane, Transition, TransitionStatus, WorkspaceRecord, WorkspaceStatus,
};

/// Input for [`Ledger::insert_transition`]. Id, status, cost, and timestamp
/// are assigned by the ledger.
#[derive(Clone, Debug)]
pub struct NewTransition {
    /// The state the change was made against.
    pub from_state: Option<ObjectId>,
    /// The resulting state; must already be in the store.
    pub to_state: ObjectId,
    /// Owning lane; must exist.
    pub lane: String,
    /// Why the change was made.
    pub intent: Intent,
}

/// The metadata ledger.
///
/// All methods serialize through the shared database connection, which is
/// what makes `accept` totally ordered within a lane.
pub struct Ledger {
    db: Arc<Database>,
}

const TRANSITION_COLUMNS: &str = "t.id, t.from_state, t.to_state, t.lane, i.data, t.status, \
     t.created_at, t.eval_summary, t.tokens_in, t.tokens_out, t.api_calls, t.wall_time_ms";

impl Ledger {
    /// Create a ledger over the shared database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    // -------------------------------------------------------------------
    // States
    // -------------------------------------------------------------------

    /// Whether a state object is present in the store.
    pub fn state_exists(&self, id: &ObjectId) -> LedgerResult<bool> {
        let conn = self.db.lock();
        state_exists_in(&conn, id)
    }

    // -------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------

    /// Insert a proposed transition together with its intent.
    ///
    /// Validates that the lane exists and `to_state` is a stored state
    /// before committing either row.
    pub fn insert_transition(&self, new: NewTransition) -> LedgerResult<Transition> {
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(LedgerError::from)?;

        if !lane_exists_in(&tx, &new.lane)? {
            return Err(LedgerError::LaneNotFound(new.lane));
        }
        if !state_exists_in(&tx, &new.to_state)? {
            return Err(LedgerError::StateMissing(new.to_state));
        }

        let id = Uuid::new_v4();
        let created_at = epoch_seconds();
        let intent_json = serde_json::to_string(&new.intent)
            .map_err(|e| LedgerError::CorruptedRow(e.to_string()))?;

        tx.execute(
            "INSERT INTO intents (id, data) VALUES (?1, ?2)",
            params![new.intent.id.to_string(), intent_json],
        )?;
        tx.execute(
            "INSERT INTO transitions
                 (id, from_state, to_state, lane, intent_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                new.from_state.map(|s| s.to_hex()),
                new.to_state.to_hex(),
                new.lane,
                new.intent.id.to_string(),
                TransitionStatus::Proposed.as_str(),
                created_at,
            ],
        )?;
        tx.commit()?;

        debug!(transition = %id, lane = %new.lane, "transition proposed");
        Ok(Transition {
            id,
            from_state: new.from_state,
            to_state: new.to_state,
            lane: new.lane,
            intent: new.intent,
            cost: CostRecord::zero(),
            status: TransitionStatus::Proposed,
            created_at,
            eval_summary: None,
        })
    }

    /// Load a transition with its intent.
    pub fn get_transition(&self, id: &Uuid) -> LedgerResult<Transition> {
        let conn = self.db.lock();
        conn.query_row(
            &format!(
                "SELECT {TRANSITION_COLUMNS} FROM transitions t
                 JOIN intents i ON i.id = t.intent_id
                 WHERE t.id = ?1"
            ),
            [id.to_string()],
            transition_from_row,
        )
        .optional()?
        .ok_or(LedgerError::TransitionNotFound(*id))?
    }

    /// Change a transition's status along a legal edge, optionally
    /// recording an evaluator summary.
    pub fn set_transition_status(
        &self,
        id: &Uuid,
        status: TransitionStatus,
        summary: Option<&str>,
    ) -> LedgerResult<()> {
        let conn = self.db.lock();
        let current = current_status_in(&conn, id)?;
        if !current.can_become(status) {
            return Err(LedgerError::IllegalStatusChange {
                from: current,
                to: status,
            });
        }
        conn.execute(
            "UPDATE transitions SET status = ?2,
                    eval_summary = COALESCE(?3, eval_summary)
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), summary],
        )?;
        debug!(transition = %id, from = %current, to = %status, "status changed");
        Ok(())
    }

    /// Accrue cost onto a still-open transition. Returns the new total.
    pub fn update_cost(&self, id: &Uuid, delta: &CostRecord) -> LedgerResult<CostRecord> {
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(LedgerError::from)?;

        let status = current_status_in(&tx, id)?;
        if !status.allows_cost_accrual() {
            return Err(LedgerError::CostLocked { id: *id, status });
        }
        tx.execute(
            "UPDATE transitions SET
                 tokens_in    = tokens_in + ?2,
                 tokens_out   = tokens_out + ?3,
                 api_calls    = api_calls + ?4,
                 wall_time_ms = wall_time_ms + ?5
             WHERE id = ?1",
            params![
                id.to_string(),
                delta.tokens_in as i64,
                delta.tokens_out as i64,
                delta.api_calls as i64,
                delta.wall_time_ms as i64,
            ],
        )?;
        let total = tx.query_row(
            "SELECT tokens_in, tokens_out, api_calls, wall_time_ms
             FROM transitions WHERE id = ?1",
            [id.to_string()],
            cost_from_row,
        )?;
        tx.commit()?;
        Ok(total)
    }

    /// Accept a transition: set its status and advance the lane head, as
    /// one atomic step.
    ///
    /// Refuses with [`LedgerError::StaleProposal`] if the lane head no
    /// longer equals the transition's `from_state`.
    pub fn accept_transition(
        &self,
        id: &Uuid,
        summary: Option<&str>,
    ) -> LedgerResult<Transition> {
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(LedgerError::from)?;

        let (status, lane, from_state, to_state) = tx
            .query_row(
                "SELECT status, lane, from_state, to_state FROM transitions WHERE id = ?1",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or(LedgerError::TransitionNotFound(*id))?;

        let status = parse_status(&status)?;
        if !status.can_become(TransitionStatus::Accepted) {
            return Err(LedgerError::IllegalStatusChange {
                from: status,
                to: TransitionStatus::Accepted,
            });
        }

        let from_state = parse_opt_hex(from_state.as_deref())?;
        let to_state = parse_hex(&to_state)?;
        let head = lane_head_in(&tx, &lane)?;
        if head != from_state {
            return Err(LedgerError::StaleProposal {
                lane,
                expected: from_state,
                head,
            });
        }

        tx.execute(
            "UPDATE transitions SET status = ?2,
                    eval_summary = COALESCE(?3, eval_summary)
             WHERE id = ?1",
            params![
                id.to_string(),
                TransitionStatus::Accepted.as_str(),
                summary
            ],
        )?;
        tx.execute(
            "UPDATE lanes SET head_state = ?2 WHERE name = ?1",
            params![lane, to_state.to_hex()],
        )?;
        tx.commit()?;

        info!(transition = %id, lane = %lane, head = %to_state.short_hex(), "accepted");
        drop(conn);
        self.get_transition(id)
    }

    /// The transition that produced `to_state`, if one is recorded.
    /// Accepted transitions win over settled or open ones.
    pub fn transition_for_state(
        &self,
        to_state: &ObjectId,
    ) -> LedgerResult<Option<Transition>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!(
                "SELECT {TRANSITION_COLUMNS} FROM transitions t
                 JOIN intents i ON i.id = t.intent_id
                 WHERE t.to_state = ?1
                 ORDER BY (t.status = 'accepted') DESC, t.created_at DESC
                 LIMIT 1"
            ),
            [to_state.to_hex()],
            transition_from_row,
        )
        .optional()?
        .transpose()
    }

    /// Recent transitions, newest first, optionally filtered by lane and
    /// status.
    pub fn history(
        &self,
        lane: Option<&str>,
        limit: usize,
        status: Option<TransitionStatus>,
    ) -> LedgerResult<Vec<Transition>> {
        let conn = self.db.lock();
        let mut sql = format!(
            "SELECT {TRANSITION_COLUMNS} FROM transitions t
             JOIN intents i ON i.id = t.intent_id WHERE 1=1"
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(lane) = lane {
            sql.push_str(" AND t.lane = ?1");
            args.push(lane.to_string());
        }
        if let Some(status) = status {
            sql.push_str(&format!(" AND t.status = ?{}", args.len() + 1));
            args.push(status.as_str().to_string());
        }
        sql.push_str(&format!(
            " ORDER BY t.created_at DESC, t.rowid DESC LIMIT ?{}",
            args.len() + 1
        ));
        let limit = limit.min(i64::MAX as usize) as i64;
        args.push(limit.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter()),
            transition_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Substring search over prompts, tags, and agent identity.
    pub fn search(&self, query: &str) -> LedgerResult<Vec<Transition>> {
        // Matching lives in Intent::matches; the scan stays in SQL only to
        // stream rows.
        let all = self.history(None, usize::MAX, None)?;
        Ok(all
            .into_iter()
            .filter(|t| t.intent.matches(query))
            .collect())
    }

    /// Total cost accrued across all transitions in a lane.
    pub fn aggregate_cost(&self, lane: &str) -> LedgerResult<CostRecord> {
        let conn = self.db.lock();
        let cost = conn.query_row(
            "SELECT COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0),
                    COALESCE(SUM(api_calls), 0), COALESCE(SUM(wall_time_ms), 0)
             FROM transitions WHERE lane = ?1",
            [lane],
            cost_from_row,
        )?;
        Ok(cost)
    }

    // -------------------------------------------------------------------
    // Lanes
    // -------------------------------------------------------------------

    /// Create a lane. The name is validated before any side effect.
    pub fn create_lane(
        &self,
        name: &str,
        head_state: Option<ObjectId>,
        fork_base: Option<ObjectId>,
    ) -> LedgerResult<Lane> {
        validate_lane_name(name)?;
        let created_at = epoch_seconds();
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO lanes (name, head_state, fork_base, created_at, metadata)
             VALUES (?1, ?2, ?3, ?4, '{}')",
            params![
                name,
                head_state.map(|s| s.to_hex()),
                fork_base.map(|s| s.to_hex()),
                created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(LedgerError::LaneExists(name.to_string()));
        }
        info!(lane = %name, "lane created");
        Ok(Lane {
            name: name.to_string(),
            head_state,
            fork_base,
            created_at,
            metadata: BTreeMap::new(),
        })
    }

    /// Load a lane by name.
    pub fn get_lane(&self, name: &str) -> LedgerResult<Lane> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT name, head_state, fork_base, created_at, metadata
             FROM lanes WHERE name = ?1",
            [name],
            lane_from_row,
        )
        .optional()?
        .ok_or_else(|| LedgerError::LaneNotFound(name.to_string()))?
    }

    /// Point a lane's head at a new state.
    pub fn set_lane_head(&self, name: &str, head: Option<ObjectId>) -> LedgerResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE lanes SET head_state = ?2 WHERE name = ?1",
            params![name, head.map(|s| s.to_hex())],
        )?;
        if updated == 0 {
            return Err(LedgerError::LaneNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Replace a lane's metadata map.
    pub fn set_lane_metadata(
        &self,
        name: &str,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> LedgerResult<()> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| LedgerError::CorruptedRow(e.to_string()))?;
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE lanes SET metadata = ?2 WHERE name = ?1",
            params![name, json],
        )?;
        if updated == 0 {
            return Err(LedgerError::LaneNotFound(name.to_string()));
        }
        Ok(())
    }

    /// All lanes, sorted by name.
    pub fn list_lanes(&self) -> LedgerResult<Vec<Lane>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, head_state, fork_base, created_at, metadata
             FROM lanes ORDER BY name",
        )?;
        let rows = stmt.query_map([], lane_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Delete a lane row. Transitions recorded against it stay for history.
    pub fn delete_lane(&self, name: &str) -> LedgerResult<()> {
        let conn = self.db.lock();
        let deleted = conn.execute("DELETE FROM lanes WHERE name = ?1", [name])?;
        if deleted == 0 {
            return Err(LedgerError::LaneNotFound(name.to_string()));
        }
        info!(lane = %name, "lane deleted");
        Ok(())
    }

    // -------------------------------------------------------------------
    // Workspace rows
    // -------------------------------------------------------------------

    /// Record a workspace. The name is validated before any side effect.
    pub fn insert_workspace(&self, record: &WorkspaceRecord) -> LedgerResult<()> {
        validate_workspace_name(&record.name)?;
        let conn = self.db.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO workspaces
                 (name, lane, base_state, created_at, status, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.name,
                record.lane,
                record.base_state.map(|s| s.to_hex()),
                record.created_at,
                record.status.as_str(),
                record.agent_id,
            ],
        )?;
        if inserted == 0 {
            return Err(LedgerError::WorkspaceExists(record.name.clone()));
        }
        Ok(())
    }

    /// Load a workspace row.
    pub fn get_workspace(&self, name: &str) -> LedgerResult<WorkspaceRecord> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT name, lane, base_state, created_at, status, agent_id
             FROM workspaces WHERE name = ?1",
            [name],
            workspace_from_row,
        )
        .optional()?
        .ok_or_else(|| LedgerError::WorkspaceNotFound(name.to_string()))?
    }

    /// All workspace rows, sorted by name.
    pub fn list_workspaces(&self) -> LedgerResult<Vec<WorkspaceRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT name, lane, base_state, created_at, status, agent_id
             FROM workspaces ORDER BY name",
        )?;
        let rows = stmt.query_map([], workspace_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Update a workspace's base state and status.
    pub fn update_workspace(
        &self,
        name: &str,
        base_state: Option<ObjectId>,
        status: WorkspaceStatus,
    ) -> LedgerResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE workspaces SET base_state = ?2, status = ?3 WHERE name = ?1",
            params![name, base_state.map(|s| s.to_hex()), status.as_str()],
        )?;
        if updated == 0 {
            return Err(LedgerError::WorkspaceNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Delete a workspace row.
    pub fn delete_workspace(&self, name: &str) -> LedgerResult<()> {
        let conn = self.db.lock();
        let deleted = conn.execute("DELETE FROM workspaces WHERE name = ?1", [name])?;
        if deleted == 0 {
            return Err(LedgerError::WorkspaceNotFound(name.to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish()
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_hex(s: &str) -> LedgerResult<ObjectId> {
    ObjectId::from_hex(s).map_err(|e| LedgerError::CorruptedRow(format!("bad hash {s:?}: {e}")))
}

fn parse_opt_hex(s: Option<&str>) -> LedgerResult<Option<ObjectId>> {
    s.map(parse_hex).transpose()
}

fn parse_status(s: &str) -> LedgerResult<TransitionStatus> {
    TransitionStatus::parse(s)
        .ok_or_else(|| LedgerError::CorruptedRow(format!("bad status {s:?}")))
}

fn state_exists_in(conn: &Connection, id: &ObjectId) -> LedgerResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM states WHERE hash = ?1",
        [id.to_hex()],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn lane_exists_in(conn: &Connection, name: &str) -> LedgerResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM lanes WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn lane_head_in(conn: &Connection, name: &str) -> LedgerResult<Option<ObjectId>> {
    let head: Option<Option<String>> = conn
        .query_row(
            "SELECT head_state FROM lanes WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    match head {
        None => Err(LedgerError::LaneNotFound(name.to_string())),
        Some(head) => parse_opt_hex(head.as_deref()),
    }
}

fn current_status_in(conn: &Connection, id: &Uuid) -> LedgerResult<TransitionStatus> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM transitions WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match status {
        None => Err(LedgerError::TransitionNotFound(*id)),
        Some(s) => parse_status(&s),
    }
}

fn cost_from_row(row: &Row<'_>) -> rusqlite::Result<CostRecord> {
    Ok(CostRecord {
        tokens_in: row.get::<_, i64>(0)? as u64,
        tokens_out: row.get::<_, i64>(1)? as u64,
        api_calls: row.get::<_, i64>(2)? as u64,
        wall_time_ms: row.get::<_, i64>(3)? as u64,
    })
}

fn transition_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerResult<Transition>> {
    let id: String = row.get(0)?;
    let from_state: Option<String> = row.get(1)?;
    let to_state: String = row.get(2)?;
    let lane: String = row.get(3)?;
    let intent_json: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: i64 = row.get(6)?;
    let eval_summary: Option<String> = row.get(7)?;
    let cost = CostRecord {
        tokens_in: row.get::<_, i64>(8)? as u64,
        tokens_out: row.get::<_, i64>(9)? as u64,
        api_calls: row.get::<_, i64>(10)? as u64,
        wall_time_ms: row.get::<_, i64>(11)? as u64,
    };

    Ok((|| {
        let intent: Intent = serde_json::from_str(&intent_json)
            .map_err(|e| LedgerError::CorruptedRow(format!("bad intent: {e}")))?;
        Ok(Transition {
            id: Uuid::parse_str(&id)
                .map_err(|e| LedgerError::CorruptedRow(format!("bad uuid {id:?}: {e}")))?,
            from_state: parse_opt_hex(from_state.as_deref())?,
            to_state: parse_hex(&to_state)?,
            lane,
            intent,
            cost,
            status: parse_status(&status)?,
            created_at,
            eval_summary,
        })
    })())
}

fn lane_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerResult<Lane>> {
    let name: String = row.get(0)?;
    let head_state: Option<String> = row.get(1)?;
    let fork_base: Option<String> = row.get(2)?;
    let created_at: i64 = row.get(3)?;
    let metadata_json: String = row.get(4)?;

    Ok((|| {
        let metadata: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(&metadata_json)
                .map_err(|e| LedgerError::CorruptedRow(format!("bad lane metadata: {e}")))?;
        Ok(Lane {
            name,
            head_state: parse_opt_hex(head_state.as_deref())?,
            fork_base: parse_opt_hex(fork_base.as_deref())?,
            created_at,
            metadata,
        })
    })())
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerResult<WorkspaceRecord>> {
    let name: String = row.get(0)?;
    let lane: String = row.get(1)?;
    let base_state: Option<String> = row.get(2)?;
    let created_at: i64 = row.get(3)?;
    let status: String = row.get(4)?;
    let agent_id: Option<String> = row.get(5)?;

    Ok((|| {
        Ok(WorkspaceRecord {
            name,
            lane,
            base_state: parse_opt_hex(base_state.as_deref())?,
            created_at,
            status: WorkspaceStatus::parse(&status)
                .ok_or_else(|| LedgerError::CorruptedRow(format!("bad status {status:?}")))?,
            agent_id,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BudgetLimits;
    use flanes_store::{Cas, SqliteObjectStore, StoreLimits};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        cas: Cas,
        ledger: Ledger,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("store.db")).unwrap());
        let backend = SqliteObjectStore::new(Arc::clone(&db), dir.path().join("blobs"));
        let cas = Cas::new(Arc::new(backend), StoreLimits::default());
        let ledger = Ledger::new(Arc::clone(&db));
        Fixture {
            _dir: dir,
            db,
            cas,
            ledger,
        }
    }

    fn put_state(f: &Fixture, marker: &[u8], parent: Option<ObjectId>) -> ObjectId {
        let blob = f.cas.put_blob(marker).unwrap();
        let tree = f
            .cas
            .put_tree(vec![flanes_store::TreeEntry::blob(
                "marker",
                blob,
                flanes_store::EntryMode::Regular,
            )])
            .unwrap();
        f.cas.put_state(tree, parent).unwrap()
    }

    fn propose(f: &Fixture, lane: &str, from: Option<ObjectId>, to: ObjectId) -> Transition {
        f.ledger
            .insert_transition(NewTransition {
                from_state: from,
                to_state: to,
                lane: lane.into(),
                intent: Intent::new("test change", "agent-1", "coder"),
            })
            .unwrap()
    }

    #[test]
    fn insert_transition_requires_lane() {
        let f = fixture();
        let s0 = put_state(&f, b"s0", None);
        let err = f
            .ledger
            .insert_transition(NewTransition {
                from_state: None,
                to_state: s0,
                lane: "missing".into(),
                intent: Intent::new("p", "a", "t"),
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::LaneNotFound(_)));
    }

    #[test]
    fn insert_transition_requires_stored_state() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let ghost = ObjectId::from_bytes(b"not stored");
        let err = f
            .ledger
            .insert_transition(NewTransition {
                from_state: None,
                to_state: ghost,
                lane: "main".into(),
                intent: Intent::new("p", "a", "t"),
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::StateMissing(_)));
    }

    #[test]
    fn accept_advances_head() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let t = propose(&f, "main", None, s0);

        let accepted = f.ledger.accept_transition(&t.id, None).unwrap();
        assert_eq!(accepted.status, TransitionStatus::Accepted);
        assert_eq!(f.ledger.get_lane("main").unwrap().head_state, Some(s0));
    }

    #[test]
    fn accept_refuses_stale_proposal() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let s1 = put_state(&f, b"s1", Some(s0));

        // Two proposals race from the empty head.
        let t1 = propose(&f, "main", None, s0);
        let t2 = propose(&f, "main", None, s1);

        f.ledger.accept_transition(&t1.id, None).unwrap();
        let err = f.ledger.accept_transition(&t2.id, None).unwrap_err();
        assert!(matches!(err, LedgerError::StaleProposal { .. }));
        // The losing proposal is untouched; the head stayed at s0.
        assert_eq!(
            f.ledger.get_transition(&t2.id).unwrap().status,
            TransitionStatus::Proposed
        );
        assert_eq!(f.ledger.get_lane("main").unwrap().head_state, Some(s0));
    }

    #[test]
    fn accept_twice_is_illegal() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let t = propose(&f, "main", None, s0);
        f.ledger.accept_transition(&t.id, None).unwrap();
        let err = f.ledger.accept_transition(&t.id, None).unwrap_err();
        assert!(matches!(err, LedgerError::IllegalStatusChange { .. }));
    }

    #[test]
    fn reject_captures_summary() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let t = propose(&f, "main", None, s0);

        f.ledger
            .set_transition_status(&t.id, TransitionStatus::Rejected, Some("tests failed"))
            .unwrap();
        let loaded = f.ledger.get_transition(&t.id).unwrap();
        assert_eq!(loaded.status, TransitionStatus::Rejected);
        assert_eq!(loaded.eval_summary.as_deref(), Some("tests failed"));
        // Head unchanged.
        assert_eq!(f.ledger.get_lane("main").unwrap().head_state, None);
    }

    #[test]
    fn rejected_is_never_unrejected() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let t = propose(&f, "main", None, s0);
        f.ledger
            .set_transition_status(&t.id, TransitionStatus::Rejected, None)
            .unwrap();
        let err = f
            .ledger
            .set_transition_status(&t.id, TransitionStatus::Accepted, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::IllegalStatusChange { .. }));
    }

    #[test]
    fn cost_accrues_while_open_then_freezes() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let t = propose(&f, "main", None, s0);

        let total = f
            .ledger
            .update_cost(
                &t.id,
                &CostRecord {
                    tokens_in: 100,
                    tokens_out: 40,
                    api_calls: 2,
                    wall_time_ms: 900,
                },
            )
            .unwrap();
        assert_eq!(total.tokens_in, 100);

        let total = f
            .ledger
            .update_cost(
                &t.id,
                &CostRecord {
                    tokens_in: 50,
                    ..CostRecord::zero()
                },
            )
            .unwrap();
        assert_eq!(total.tokens_in, 150);

        f.ledger.accept_transition(&t.id, None).unwrap();
        let err = f
            .ledger
            .update_cost(
                &t.id,
                &CostRecord {
                    tokens_in: 1,
                    ..CostRecord::zero()
                },
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::CostLocked { .. }));
    }

    #[test]
    fn history_filters_and_orders() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        f.ledger.create_lane("feat", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let s1 = put_state(&f, b"s1", Some(s0));

        let t0 = propose(&f, "main", None, s0);
        f.ledger.accept_transition(&t0.id, None).unwrap();
        let t1 = propose(&f, "main", Some(s0), s1);
        let _tf = propose(&f, "feat", None, s0);

        let main_history = f.ledger.history(Some("main"), 10, None).unwrap();
        assert_eq!(main_history.len(), 2);
        // Newest first.
        assert_eq!(main_history[0].id, t1.id);

        let accepted = f
            .ledger
            .history(Some("main"), 10, Some(TransitionStatus::Accepted))
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].id, t0.id);

        let everything = f.ledger.history(None, 2, None).unwrap();
        assert_eq!(everything.len(), 2);
    }

    #[test]
    fn search_matches_prompt_and_tags() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        f.ledger
            .insert_transition(NewTransition {
                from_state: None,
                to_state: s0,
                lane: "main".into(),
                intent: Intent::new("Add OAuth login flow", "agent-7", "coder")
                    .with_tag("security"),
            })
            .unwrap();

        assert_eq!(f.ledger.search("oauth").unwrap().len(), 1);
        assert_eq!(f.ledger.search("SECURITY").unwrap().len(), 1);
        assert_eq!(f.ledger.search("database").unwrap().len(), 0);
    }

    #[test]
    fn aggregate_cost_sums_lane() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let s1 = put_state(&f, b"s1", Some(s0));

        let t0 = propose(&f, "main", None, s0);
        f.ledger
            .update_cost(
                &t0.id,
                &CostRecord {
                    tokens_in: 10,
                    api_calls: 1,
                    ..CostRecord::zero()
                },
            )
            .unwrap();
        f.ledger.accept_transition(&t0.id, None).unwrap();

        let t1 = propose(&f, "main", Some(s0), s1);
        f.ledger
            .update_cost(
                &t1.id,
                &CostRecord {
                    tokens_in: 5,
                    api_calls: 2,
                    ..CostRecord::zero()
                },
            )
            .unwrap();

        let total = f.ledger.aggregate_cost("main").unwrap();
        assert_eq!(total.tokens_in, 15);
        assert_eq!(total.api_calls, 3);
    }

    #[test]
    fn lane_crud() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        assert!(matches!(
            f.ledger.create_lane("main", None, None).unwrap_err(),
            LedgerError::LaneExists(_)
        ));
        assert!(matches!(
            f.ledger.create_lane("bad/name", None, None).unwrap_err(),
            LedgerError::InvalidName(_)
        ));

        let lanes = f.ledger.list_lanes().unwrap();
        assert_eq!(lanes.len(), 1);

        f.ledger.delete_lane("main").unwrap();
        assert!(matches!(
            f.ledger.get_lane("main").unwrap_err(),
            LedgerError::LaneNotFound(_)
        ));
    }

    #[test]
    fn lane_budget_metadata_persists() {
        let f = fixture();
        let mut lane = f.ledger.create_lane("main", None, None).unwrap();
        lane.set_budget(&BudgetLimits {
            tokens_in: Some(500),
            ..BudgetLimits::default()
        });
        f.ledger.set_lane_metadata("main", &lane.metadata).unwrap();

        let loaded = f.ledger.get_lane("main").unwrap();
        assert_eq!(loaded.budget().unwrap().tokens_in, Some(500));
    }

    #[test]
    fn workspace_rows_crud() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let record = WorkspaceRecord {
            name: "agent-ws".into(),
            lane: "main".into(),
            base_state: None,
            created_at: epoch_seconds(),
            status: WorkspaceStatus::Active,
            agent_id: Some("agent-1".into()),
        };
        f.ledger.insert_workspace(&record).unwrap();
        assert!(matches!(
            f.ledger.insert_workspace(&record).unwrap_err(),
            LedgerError::WorkspaceExists(_)
        ));

        let s0 = put_state(&f, b"s0", None);
        f.ledger
            .update_workspace("agent-ws", Some(s0), WorkspaceStatus::Idle)
            .unwrap();
        let loaded = f.ledger.get_workspace("agent-ws").unwrap();
        assert_eq!(loaded.base_state, Some(s0));
        assert_eq!(loaded.status, WorkspaceStatus::Idle);

        assert_eq!(f.ledger.list_workspaces().unwrap().len(), 1);
        f.ledger.delete_workspace("agent-ws").unwrap();
        assert!(f.ledger.list_workspaces().unwrap().is_empty());
    }

    #[test]
    fn transition_for_state_prefers_accepted() {
        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        f.ledger.create_lane("feat", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);

        // Same to_state proposed on two lanes; only one accepted.
        let _open = propose(&f, "feat", None, s0);
        let t = propose(&f, "main", None, s0);
        f.ledger.accept_transition(&t.id, None).unwrap();

        let found = f.ledger.transition_for_state(&s0).unwrap().unwrap();
        assert_eq!(found.id, t.id);
    }

    #[test]
    fn concurrent_accepts_serialize() {
        use std::thread;

        let f = fixture();
        f.ledger.create_lane("main", None, None).unwrap();
        let s0 = put_state(&f, b"s0", None);
        let t1 = propose(&f, "main", None, s0);
        let s1 = put_state(&f, b"s1", Some(s0));
        let t2 = propose(&f, "main", None, s1);

        let ledger_a = Ledger::new(Arc::clone(&f.db));
        let ledger_b = Ledger::new(Arc::clone(&f.db));
        let id1 = t1.id;
        let id2 = t2.id;

        let ha = thread::spawn(move || ledger_a.accept_transition(&id1, None).is_ok());
        let hb = thread::spawn(move || ledger_b.accept_transition(&id2, None).is_ok());
        let ok_a = ha.join().unwrap();
        let ok_b = hb.join().unwrap();

        // Exactly one of the racing proposals lands.
        assert!(ok_a ^ ok_b, "exactly one accept must win");
    }
}
