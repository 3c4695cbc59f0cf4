//! The `Repository` handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use flanes_db::Database;
use flanes_diff::{diff_trees, TreeDiff};
use flanes_gate::{EvalContext, EvaluationPipeline, EvaluationReport, Evaluator, Verdict};
use flanes_gc::{Collector, GcOptions, GcReport};
use flanes_ledger::{
    BudgetLimits, BudgetStanding, Lane, Ledger, NewTransition, Transition, TransitionStatus,
    WorkspaceRecord, WorkspaceStatus,
};
use flanes_merge::{apply_diff, plan_promotion};
use flanes_store::{Cas, SqliteObjectStore, WorldState};
use flanes_types::{epoch_seconds, CancelToken, CostRecord, Intent, ObjectId};
use flanes_workspace::{write_descriptor, WorkspaceManager, MAIN_WORKSPACE};

use crate::config::RepoConfig;
use crate::error::{RepoError, RepoResult};
use crate::instance::InstanceLock;

/// Caller-supplied fields for a checkpoint.
#[derive(Clone, Debug)]
pub struct CheckpointOptions {
    /// Identity of the agent making the change.
    pub agent_id: String,
    /// Kind of agent.
    pub agent_type: String,
    /// Model identifier, when model-backed.
    pub model: Option<String>,
    /// Labels attached to the intent.
    pub tags: Vec<String>,
    /// Evaluate immediately and settle the transition by the verdict.
    pub auto_accept: bool,
    /// With `auto_accept`: accept even when a required evaluator failed.
    /// The failing outcomes are still recorded on the transition.
    pub accept_on_failure: bool,
    /// Cancellation for the snapshot walk.
    pub cancel: CancelToken,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            agent_type: "coder".to_string(),
            model: None,
            tags: Vec::new(),
            auto_accept: false,
            accept_on_failure: false,
            cancel: CancelToken::new(),
        }
    }
}

/// What a checkpoint did.
#[derive(Debug)]
pub struct CheckpointResult {
    /// The created transition, or `None` when nothing changed.
    pub transition: Option<Transition>,
    /// The evaluation report, when `auto_accept` ran the gate.
    pub evaluation: Option<EvaluationReport>,
    /// Budget dimensions past their alert threshold.
    pub budget_warnings: Vec<String>,
}

impl CheckpointResult {
    /// Returns `true` if the workspace matched the lane head and no
    /// transition was created.
    pub fn is_no_change(&self) -> bool {
        self.transition.is_none()
    }
}

/// What a promotion did.
#[derive(Debug)]
pub struct PromoteResult {
    /// The accepted promotion transition, or `None` if the source brought
    /// nothing new.
    pub transition: Option<Transition>,
    /// The target lane's head after the operation.
    pub new_head: Option<ObjectId>,
}

/// One step of a lineage walk.
#[derive(Debug)]
pub struct TraceEntry {
    /// The state at this step.
    pub state: ObjectId,
    /// Its creation time.
    pub created_at: i64,
    /// The transition that produced it, when one is recorded.
    pub transition: Option<Transition>,
}

/// A snapshot of repository-wide facts.
#[derive(Debug)]
pub struct RepoInfo {
    /// Repository root directory.
    pub root: PathBuf,
    /// Ledger schema version.
    pub schema_version: i64,
    /// All lanes.
    pub lanes: Vec<Lane>,
    /// All workspace rows.
    pub workspaces: Vec<WorkspaceRecord>,
}

/// One open repository: store, ledger, workspaces, gate, and collector
/// behind a single handle.
pub struct Repository {
    root: PathBuf,
    config: RepoConfig,
    db: Arc<Database>,
    cas: Arc<Cas>,
    ledger: Ledger,
    workspaces: WorkspaceManager,
    pipeline: EvaluationPipeline,
    _fence: InstanceLock,
}

impl Repository {
    // -------------------------------------------------------------------
    // Open / init
    // -------------------------------------------------------------------

    /// Initialize a new repository at `root` and open it.
    ///
    /// Creates `.state/`, the configuration document, the database, the
    /// default lane, and the `main` workspace mapped onto `root` itself.
    pub fn init(root: &Path) -> RepoResult<Self> {
        let state_dir = root.join(".state");
        let config_path = state_dir.join("config.json");
        if config_path.exists() {
            return Err(RepoError::AlreadyInitialized(root.to_path_buf()));
        }
        std::fs::create_dir_all(&state_dir).map_err(|e| RepoError::io(&state_dir, e))?;

        let config = RepoConfig::default();
        config.save(&config_path)?;

        let repo = Self::open_with_config(root, config)?;

        repo.ledger.create_lane(&repo.config.default_lane, None, None)?;
        let record = WorkspaceRecord {
            name: MAIN_WORKSPACE.to_string(),
            lane: repo.config.default_lane.clone(),
            base_state: None,
            created_at: epoch_seconds(),
            status: WorkspaceStatus::Active,
            agent_id: None,
        };
        repo.ledger.insert_workspace(&record)?;
        write_descriptor(&repo.workspaces.descriptor_path(MAIN_WORKSPACE), &record)?;

        info!(root = %root.display(), "repository initialized");
        Ok(repo)
    }

    /// Open an existing repository at `root`.
    pub fn open(root: &Path) -> RepoResult<Self> {
        let config_path = root.join(".state").join("config.json");
        if !config_path.exists() {
            return Err(RepoError::NotARepository(root.to_path_buf()));
        }
        let config = RepoConfig::load(&config_path)?;
        Self::open_with_config(root, config)
    }

    fn open_with_config(root: &Path, config: RepoConfig) -> RepoResult<Self> {
        let state_dir = root.join(".state");
        let fence = InstanceLock::acquire(&state_dir)?;

        let db = Arc::new(Database::open(&state_dir.join("store.db"))?);
        let backend = SqliteObjectStore::new(Arc::clone(&db), state_dir.join("blobs"));
        let cas = Arc::new(Cas::new(Arc::new(backend), config.store_limits()));
        let ledger = Ledger::new(Arc::clone(&db));
        let workspaces = WorkspaceManager::new(Arc::clone(&cas), Arc::clone(&db), root);

        Ok(Self {
            root: root.to_path_buf(),
            config,
            db,
            cas,
            ledger,
            workspaces,
            pipeline: EvaluationPipeline::new(),
            _fence: fence,
        })
    }

    /// Close the repository, releasing the instance fence.
    pub fn close(self) {}

    // -------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------

    /// Repository root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Active configuration.
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// The content-addressed store.
    pub fn cas(&self) -> &Cas {
        &self.cas
    }

    /// The metadata ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The workspace manager.
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Register an evaluator adapter on the gate pipeline.
    pub fn register_evaluator(&mut self, evaluator: Box<dyn Evaluator>) {
        self.pipeline.add(evaluator);
    }

    // -------------------------------------------------------------------
    // Checkpoint / accept / reject
    // -------------------------------------------------------------------

    /// Snapshot a workspace and propose the result as a transition on its
    /// lane.
    ///
    /// Returns without creating anything when the snapshot matches the
    /// lane head. Budget limits are consulted before the transition is
    /// created: exceeding any dimension fails, crossing the alert
    /// threshold only warns.
    pub fn checkpoint(
        &self,
        workspace: &str,
        prompt: &str,
        opts: CheckpointOptions,
    ) -> RepoResult<CheckpointResult> {
        let ws = self.ledger.get_workspace(workspace)?;
        let lane = self.ledger.get_lane(&ws.lane)?;

        let mut budget_warnings = Vec::new();
        if let Some(budget) = lane.budget() {
            let spent = self.ledger.aggregate_cost(&lane.name)?;
            match budget.standing(&spent) {
                BudgetStanding::Exceeded { dimensions } => {
                    return Err(RepoError::BudgetExceeded {
                        lane: lane.name,
                        dimensions,
                    });
                }
                BudgetStanding::Warning { dimensions } => {
                    warn!(lane = %lane.name, ?dimensions, "lane nearing its budget");
                    budget_warnings =
                        dimensions.iter().map(|d| d.to_string()).collect();
                }
                BudgetStanding::Ok => {}
            }
        }

        let _lock = self.workspaces.acquire_lock(workspace)?;
        let parent = ws.base_state.or(lane.head_state);
        let snap = self.workspaces.snapshot(workspace, parent, &opts.cancel)?;

        // Nothing changed relative to the lane head: no transition.
        if let Some(head) = lane.head_state {
            if self.cas.get_state(&head)?.root_tree == snap.root_tree {
                return Ok(CheckpointResult {
                    transition: None,
                    evaluation: None,
                    budget_warnings,
                });
            }
        }

        let mut intent = Intent::new(prompt, &opts.agent_id, &opts.agent_type);
        intent.model = opts.model.clone();
        for tag in &opts.tags {
            intent.tags.insert(tag.clone());
        }

        let transition = self.ledger.insert_transition(NewTransition {
            from_state: lane.head_state,
            to_state: snap.state,
            lane: ws.lane.clone(),
            intent,
        })?;

        self.update_workspace_record(workspace, Some(snap.state), WorkspaceStatus::Active)?;

        if !opts.auto_accept {
            return Ok(CheckpointResult {
                transition: Some(transition),
                evaluation: None,
                budget_warnings,
            });
        }

        let report = self.run_gate(&transition.id, workspace, prompt)?;
        let settled = match report.verdict() {
            Verdict::Accept => self
                .ledger
                .accept_transition(&transition.id, Some(&report.summary()))?,
            Verdict::Reject if opts.accept_on_failure => {
                warn!(
                    transition = %transition.id,
                    "accepting despite required evaluator failure"
                );
                self.ledger
                    .accept_transition(&transition.id, Some(&report.summary()))?
            }
            Verdict::Reject => {
                self.ledger.set_transition_status(
                    &transition.id,
                    TransitionStatus::Rejected,
                    Some(&report.summary()),
                )?;
                self.ledger.get_transition(&transition.id)?
            }
        };

        Ok(CheckpointResult {
            transition: Some(settled),
            evaluation: Some(report),
            budget_warnings,
        })
    }

    /// Run the evaluation gate against a proposed transition.
    pub fn evaluate(
        &self,
        transition_id: &Uuid,
        workspace: &str,
    ) -> RepoResult<EvaluationReport> {
        let transition = self.ledger.get_transition(transition_id)?;
        self.run_gate(transition_id, workspace, &transition.intent.prompt)
    }

    fn run_gate(
        &self,
        transition_id: &Uuid,
        workspace: &str,
        prompt: &str,
    ) -> RepoResult<EvaluationReport> {
        self.ledger.set_transition_status(
            transition_id,
            TransitionStatus::Evaluating,
            None,
        )?;
        let workspace_dir = self.workspaces.workspace_dir(workspace);
        let transition = self.ledger.get_transition(transition_id)?;
        let ctx = EvalContext {
            workspace_dir: &workspace_dir,
            lane: &transition.lane,
            transition_id: *transition_id,
            prompt,
        };
        Ok(self.pipeline.run(&ctx))
    }

    /// Accept a transition, advancing its lane head atomically.
    pub fn accept(&self, transition_id: &Uuid, summary: Option<&str>) -> RepoResult<Transition> {
        Ok(self.ledger.accept_transition(transition_id, summary)?)
    }

    /// Reject a transition, recording the evaluator summary.
    pub fn reject(&self, transition_id: &Uuid, summary: Option<&str>) -> RepoResult<Transition> {
        self.ledger
            .set_transition_status(transition_id, TransitionStatus::Rejected, summary)?;
        Ok(self.ledger.get_transition(transition_id)?)
    }

    /// Accrue cost onto a still-open transition.
    pub fn accrue_cost(&self, transition_id: &Uuid, delta: &CostRecord) -> RepoResult<CostRecord> {
        Ok(self.ledger.update_cost(transition_id, delta)?)
    }

    // -------------------------------------------------------------------
    // Promote
    // -------------------------------------------------------------------

    /// Compose the source lane's changes since the common ancestor into
    /// the target lane.
    ///
    /// With conflicts and `force == false`, fails with
    /// [`RepoError::PromoteConflict`] and mutates nothing. With `force`,
    /// the source side wins at every conflicting path. File contents are
    /// never merged.
    pub fn promote(
        &self,
        source_lane: &str,
        target_lane: &str,
        force: bool,
    ) -> RepoResult<PromoteResult> {
        let source = self.ledger.get_lane(source_lane)?;
        let target = self.ledger.get_lane(target_lane)?;
        let source_head = source
            .head_state
            .ok_or_else(|| RepoError::EmptyLane(source_lane.to_string()))?;

        // An empty target fast-forwards to the source head; the shared
        // history this creates is what later promotions diff against.
        let (new_state, from_state) = match target.head_state {
            None => (source_head, None),
            Some(target_head) => {
                let plan = plan_promotion(&self.cas, &source_head, &target_head)?;
                if plan.source_diff.is_empty() {
                    return Ok(PromoteResult {
                        transition: None,
                        new_head: Some(target_head),
                    });
                }
                if !plan.is_clean() && !force {
                    return Err(RepoError::PromoteConflict {
                        paths: plan.conflicts,
                    });
                }

                let target_tree = self.cas.get_state(&target_head)?.root_tree;
                let new_tree = apply_diff(&self.cas, &target_tree, &plan.source_diff)?;
                if new_tree == target_tree {
                    // Every source change already landed on the target.
                    return Ok(PromoteResult {
                        transition: None,
                        new_head: Some(target_head),
                    });
                }
                let new_state = self.cas.put_state(new_tree, Some(target_head))?;
                (new_state, Some(target_head))
            }
        };

        let mut intent = Intent::new(
            format!("Promote {source_lane} into {target_lane}"),
            "system",
            "promoter",
        )
        .with_tag("promote");
        intent.metadata.insert(
            "from".to_string(),
            serde_json::Value::String(source_lane.to_string()),
        );

        let transition = self.ledger.insert_transition(NewTransition {
            from_state,
            to_state: new_state,
            lane: target_lane.to_string(),
            intent,
        })?;
        let accepted = self
            .ledger
            .accept_transition(&transition.id, Some("promotion"))?;

        info!(
            source = source_lane,
            target = target_lane,
            head = %new_state.short_hex(),
            forced = force,
            "promoted"
        );
        Ok(PromoteResult {
            transition: Some(accepted),
            new_head: Some(new_state),
        })
    }

    // -------------------------------------------------------------------
    // Workspaces
    // -------------------------------------------------------------------

    /// Create a workspace on a lane and materialize the lane head into it.
    pub fn create_workspace(
        &self,
        name: &str,
        lane: &str,
        agent_id: Option<String>,
    ) -> RepoResult<WorkspaceRecord> {
        let lane_row = self.ledger.get_lane(lane)?;
        let record = WorkspaceRecord {
            name: name.to_string(),
            lane: lane.to_string(),
            base_state: lane_row.head_state,
            created_at: epoch_seconds(),
            status: WorkspaceStatus::Active,
            agent_id,
        };
        self.ledger.insert_workspace(&record)?;
        write_descriptor(&self.workspaces.descriptor_path(name), &record)?;

        if let Some(head) = lane_row.head_state {
            let _lock = self.workspaces.acquire_lock(name)?;
            self.workspaces
                .materialize(name, &head, &CancelToken::new())?;
        }
        Ok(record)
    }

    /// Bring a workspace up to its lane head with the minimal write set.
    pub fn update_workspace(&self, name: &str) -> RepoResult<Option<ObjectId>> {
        let ws = self.ledger.get_workspace(name)?;
        let lane = self.ledger.get_lane(&ws.lane)?;
        let Some(head) = lane.head_state else {
            return Ok(None);
        };
        if ws.base_state == Some(head) {
            return Ok(Some(head));
        }

        let _lock = self.workspaces.acquire_lock(name)?;
        self.workspaces.update(name, &head, &CancelToken::new())?;
        self.update_workspace_record(name, Some(head), WorkspaceStatus::Active)?;
        Ok(Some(head))
    }

    /// Force a workspace back to a known state, clearing any dirty marker.
    /// This is the recovery path for interrupted writes.
    pub fn restore(&self, name: &str, state: &ObjectId) -> RepoResult<()> {
        let _lock = self.workspaces.acquire_lock(name)?;
        self.workspaces.clear_dirty(name)?;
        self.workspaces
            .materialize(name, state, &CancelToken::new())?;
        self.update_workspace_record(name, Some(*state), WorkspaceStatus::Active)?;
        Ok(())
    }

    /// Remove a workspace's directory; the row is kept, marked disposed.
    pub fn remove_workspace(&self, name: &str) -> RepoResult<()> {
        let _lock = self.workspaces.acquire_lock(name)?;
        self.workspaces.remove_workspace_dir(name)?;
        let ws = self.ledger.get_workspace(name)?;
        self.ledger
            .update_workspace(name, ws.base_state, WorkspaceStatus::Disposed)?;
        let _ = std::fs::remove_file(self.workspaces.descriptor_path(name));
        Ok(())
    }

    fn update_workspace_record(
        &self,
        name: &str,
        base_state: Option<ObjectId>,
        status: WorkspaceStatus,
    ) -> RepoResult<()> {
        self.ledger.update_workspace(name, base_state, status)?;
        let record = self.ledger.get_workspace(name)?;
        write_descriptor(&self.workspaces.descriptor_path(name), &record)?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Lanes and budgets
    // -------------------------------------------------------------------

    /// Create a lane, optionally forked at another lane's current head.
    pub fn create_lane(&self, name: &str, fork_from: Option<&str>) -> RepoResult<Lane> {
        let fork_head = match fork_from {
            Some(source) => self.ledger.get_lane(source)?.head_state,
            None => None,
        };
        Ok(self.ledger.create_lane(name, fork_head, fork_head)?)
    }

    /// Delete a lane row.
    pub fn delete_lane(&self, name: &str) -> RepoResult<()> {
        Ok(self.ledger.delete_lane(name)?)
    }

    /// Set a lane's budget limits.
    pub fn set_budget(&self, lane: &str, budget: &BudgetLimits) -> RepoResult<()> {
        let mut row = self.ledger.get_lane(lane)?;
        row.set_budget(budget);
        Ok(self.ledger.set_lane_metadata(lane, &row.metadata)?)
    }

    /// A lane's budget limits and current spend.
    pub fn budget_status(
        &self,
        lane: &str,
    ) -> RepoResult<(CostRecord, Option<BudgetLimits>)> {
        let row = self.ledger.get_lane(lane)?;
        let spent = self.ledger.aggregate_cost(lane)?;
        Ok((spent, row.budget()))
    }

    // -------------------------------------------------------------------
    // Lineage, diff, search
    // -------------------------------------------------------------------

    /// Walk `parent_id` from a state, pairing each step with the
    /// transition that produced it.
    pub fn trace(&self, state: &ObjectId) -> RepoResult<Vec<TraceEntry>> {
        let mut entries = Vec::new();
        let mut cursor = Some(*state);
        while let Some(id) = cursor {
            let world: WorldState = self.cas.get_state(&id)?;
            entries.push(TraceEntry {
                state: id,
                created_at: world.created_at,
                transition: self.ledger.transition_for_state(&id)?,
            });
            cursor = world.parent_id;
        }
        Ok(entries)
    }

    /// Path-level diff between two states.
    pub fn diff(&self, a: &ObjectId, b: &ObjectId) -> RepoResult<TreeDiff> {
        let tree_a = self.cas.get_state(a)?.root_tree;
        let tree_b = self.cas.get_state(b)?.root_tree;
        Ok(diff_trees(&self.cas, Some(&tree_a), Some(&tree_b))?)
    }

    /// Recent transitions, newest first.
    pub fn history(
        &self,
        lane: Option<&str>,
        limit: usize,
        status: Option<TransitionStatus>,
    ) -> RepoResult<Vec<Transition>> {
        Ok(self.ledger.history(lane, limit, status)?)
    }

    /// Substring search over prompts, tags, and agent identity.
    pub fn search(&self, query: &str) -> RepoResult<Vec<Transition>> {
        Ok(self.ledger.search(query)?)
    }

    /// Repository-wide facts.
    pub fn info(&self) -> RepoResult<RepoInfo> {
        Ok(RepoInfo {
            root: self.root.clone(),
            schema_version: self.db.schema_version()?,
            lanes: self.ledger.list_lanes()?,
            workspaces: self.ledger.list_workspaces()?,
        })
    }

    // -------------------------------------------------------------------
    // Garbage collection
    // -------------------------------------------------------------------

    /// Run the mark-and-sweep collector. Dry-run unless the options say
    /// otherwise.
    pub fn gc(&self, opts: &GcOptions) -> RepoResult<GcReport> {
        let collector = Collector::new(
            Arc::clone(&self.db),
            self.root.join(".state").join("blobs"),
        );
        Ok(collector.collect(opts)?)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use flanes_gate::{EvalOutcome, GateResult};
    use flanes_merge::flatten_tree;
    use flanes_store::ObjectKind;

    fn test_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        let repo = Repository::init(&root).unwrap();
        (dir, repo)
    }

    fn write_files(dir: &Path, files: &[(&str, &str)]) {
        for (path, contents) in files {
            let abs = dir.join(path);
            fs::create_dir_all(abs.parent().unwrap()).unwrap();
            fs::write(abs, contents).unwrap();
        }
    }

    /// Checkpoint the named workspace and accept the result.
    fn commit(repo: &Repository, workspace: &str, prompt: &str) -> Transition {
        let result = repo
            .checkpoint(workspace, prompt, CheckpointOptions::default())
            .unwrap();
        let t = result.transition.expect("change expected");
        repo.accept(&t.id, None).unwrap()
    }

    fn read_tree_file(repo: &Repository, state: &ObjectId, path: &str) -> Option<Vec<u8>> {
        let tree = repo.cas().get_state(state).unwrap().root_tree;
        let files = flatten_tree(repo.cas(), &tree).unwrap();
        files.get(path).map(|e| repo.cas().get_blob(&e.hash).unwrap())
    }

    struct FixedEval {
        name: &'static str,
        required: bool,
        passes: bool,
    }

    impl Evaluator for FixedEval {
        fn name(&self) -> &str {
            self.name
        }
        fn required(&self) -> bool {
            self.required
        }
        fn evaluate(&self, _ctx: &EvalContext<'_>) -> GateResult<EvalOutcome> {
            Ok(EvalOutcome {
                name: self.name.to_string(),
                passed: self.passes,
                required: self.required,
                detail: None,
            })
        }
    }

    // -------------------------------------------------------------------
    // Init / open
    // -------------------------------------------------------------------

    #[test]
    fn init_creates_layout_and_defaults() {
        let (_dir, repo) = test_repo();
        let state_dir = repo.root().join(".state");
        assert!(state_dir.join("config.json").exists());
        assert!(state_dir.join("store.db").exists());

        let info = repo.info().unwrap();
        assert_eq!(info.lanes.len(), 1);
        assert_eq!(info.lanes[0].name, "main");
        assert_eq!(info.workspaces.len(), 1);
        assert_eq!(info.workspaces[0].name, MAIN_WORKSPACE);
    }

    #[test]
    fn init_twice_fails() {
        let (_dir, repo) = test_repo();
        let root = repo.root().to_path_buf();
        drop(repo);
        assert!(matches!(
            Repository::init(&root).unwrap_err(),
            RepoError::AlreadyInitialized(_)
        ));
    }

    #[test]
    fn open_requires_initialization() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Repository::open(dir.path()).unwrap_err(),
            RepoError::NotARepository(_)
        ));
    }

    #[test]
    fn open_from_another_host_is_fenced() {
        let (_dir, repo) = test_repo();
        let root = repo.root().to_path_buf();
        drop(repo);

        // Fake a fresh marker from a different host.
        let marker = root.join(".state").join("instance.lock");
        let remote = flanes_workspace::LockOwner {
            pid: 4242,
            hostname: "other-host".into(),
            started_at: epoch_seconds(),
        };
        fs::write(&marker, serde_json::to_vec(&remote).unwrap()).unwrap();

        assert!(matches!(
            Repository::open(&root).unwrap_err(),
            RepoError::InstanceLocked { .. }
        ));
    }

    // -------------------------------------------------------------------
    // Checkpoint / accept
    // -------------------------------------------------------------------

    #[test]
    fn accept_advances_head() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("hello.txt", "hello\n")]);

        let result = repo
            .checkpoint(MAIN_WORKSPACE, "init", CheckpointOptions::default())
            .unwrap();
        let t0 = result.transition.unwrap();
        assert_eq!(t0.status, TransitionStatus::Proposed);
        assert_eq!(t0.from_state, None);

        let accepted = repo.accept(&t0.id, None).unwrap();
        assert_eq!(accepted.status, TransitionStatus::Accepted);

        let lane = repo.ledger().get_lane("main").unwrap();
        assert_eq!(lane.head_state, Some(t0.to_state));

        let history = repo.history(Some("main"), 10, None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, t0.id);
    }

    #[test]
    fn checkpoint_without_changes_is_a_noop() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("a.txt", "a")]);
        commit(&repo, MAIN_WORKSPACE, "init");

        let result = repo
            .checkpoint(MAIN_WORKSPACE, "nothing new", CheckpointOptions::default())
            .unwrap();
        assert!(result.is_no_change());
        assert_eq!(repo.history(Some("main"), 10, None).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_proposals_one_goes_stale() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("base.txt", "base")]);
        commit(&repo, MAIN_WORKSPACE, "init");

        repo.create_workspace("ws-a", "main", None).unwrap();
        repo.create_workspace("ws-b", "main", None).unwrap();
        write_files(&repo.workspaces().workspace_dir("ws-a"), &[("a.txt", "a")]);
        write_files(&repo.workspaces().workspace_dir("ws-b"), &[("b.txt", "b")]);

        let ta = repo
            .checkpoint("ws-a", "add a", CheckpointOptions::default())
            .unwrap()
            .transition
            .unwrap();
        let tb = repo
            .checkpoint("ws-b", "add b", CheckpointOptions::default())
            .unwrap()
            .transition
            .unwrap();

        repo.accept(&ta.id, None).unwrap();
        let err = repo.accept(&tb.id, None).unwrap_err();
        assert!(matches!(
            err,
            RepoError::Ledger(flanes_ledger::LedgerError::StaleProposal { .. })
        ));
        // The orchestrator's recovery path: refresh, re-apply, re-checkpoint.
        repo.update_workspace("ws-b").unwrap();
        write_files(&repo.workspaces().workspace_dir("ws-b"), &[("b.txt", "b")]);
        let retry = repo
            .checkpoint("ws-b", "add b again", CheckpointOptions::default())
            .unwrap()
            .transition
            .unwrap();
        repo.accept(&retry.id, None).unwrap();
        let head = repo.ledger().get_lane("main").unwrap().head_state.unwrap();
        assert!(read_tree_file(&repo, &head, "a.txt").is_some());
        assert!(read_tree_file(&repo, &head, "b.txt").is_some());
    }

    #[test]
    fn auto_accept_with_passing_gate() {
        let (_dir, mut repo) = test_repo();
        repo.register_evaluator(Box::new(FixedEval {
            name: "tests",
            required: true,
            passes: true,
        }));
        write_files(repo.root(), &[("a.txt", "a")]);

        let result = repo
            .checkpoint(
                MAIN_WORKSPACE,
                "init",
                CheckpointOptions {
                    auto_accept: true,
                    ..CheckpointOptions::default()
                },
            )
            .unwrap();
        let t = result.transition.unwrap();
        assert_eq!(t.status, TransitionStatus::Accepted);
        assert!(result.evaluation.unwrap().outcomes[0].passed);
        assert_eq!(
            repo.ledger().get_lane("main").unwrap().head_state,
            Some(t.to_state)
        );
    }

    #[test]
    fn auto_accept_rejects_on_required_failure() {
        let (_dir, mut repo) = test_repo();
        repo.register_evaluator(Box::new(FixedEval {
            name: "tests",
            required: true,
            passes: false,
        }));
        write_files(repo.root(), &[("a.txt", "a")]);

        let result = repo
            .checkpoint(
                MAIN_WORKSPACE,
                "init",
                CheckpointOptions {
                    auto_accept: true,
                    ..CheckpointOptions::default()
                },
            )
            .unwrap();
        let t = result.transition.unwrap();
        assert_eq!(t.status, TransitionStatus::Rejected);
        assert!(t.eval_summary.unwrap().contains("failed: tests"));
        // Head never moved.
        assert_eq!(repo.ledger().get_lane("main").unwrap().head_state, None);
    }

    #[test]
    fn accept_on_failure_records_but_does_not_block() {
        let (_dir, mut repo) = test_repo();
        repo.register_evaluator(Box::new(FixedEval {
            name: "tests",
            required: true,
            passes: false,
        }));
        write_files(repo.root(), &[("a.txt", "a")]);

        let result = repo
            .checkpoint(
                MAIN_WORKSPACE,
                "init",
                CheckpointOptions {
                    auto_accept: true,
                    accept_on_failure: true,
                    ..CheckpointOptions::default()
                },
            )
            .unwrap();
        let t = result.transition.unwrap();
        assert_eq!(t.status, TransitionStatus::Accepted);
        // The failing outcome is still stored.
        assert!(t.eval_summary.unwrap().contains("failed: tests"));
        assert_eq!(
            repo.ledger().get_lane("main").unwrap().head_state,
            Some(t.to_state)
        );
    }

    // -------------------------------------------------------------------
    // Promote
    // -------------------------------------------------------------------

    fn setup_fork(repo: &Repository) -> ObjectId {
        // main at head M containing README.md = "A"; lane feat forked at M
        // with its own workspace.
        write_files(repo.root(), &[("README.md", "A")]);
        let m = commit(repo, MAIN_WORKSPACE, "init").to_state;
        repo.create_lane("feat", Some("main")).unwrap();
        repo.create_workspace("feat-ws", "feat", Some("agent-7".into()))
            .unwrap();
        m
    }

    #[test]
    fn promote_clean_composes_source_changes() {
        let (_dir, repo) = test_repo();
        setup_fork(&repo);

        write_files(
            &repo.workspaces().workspace_dir("feat-ws"),
            &[("auth.py", "x")],
        );
        commit(&repo, "feat-ws", "add auth");

        let result = repo.promote("feat", "main", false).unwrap();
        let new_head = result.new_head.unwrap();
        assert_eq!(
            repo.ledger().get_lane("main").unwrap().head_state,
            Some(new_head)
        );
        assert_eq!(read_tree_file(&repo, &new_head, "README.md").unwrap(), b"A");
        assert_eq!(read_tree_file(&repo, &new_head, "auth.py").unwrap(), b"x");

        // The promotion transition is tagged with its source lane.
        let t = result.transition.unwrap();
        assert_eq!(t.status, TransitionStatus::Accepted);
        assert_eq!(
            t.intent.metadata.get("from"),
            Some(&serde_json::Value::String("feat".into()))
        );
    }

    #[test]
    fn promote_conflict_blocks_then_force_wins() {
        let (_dir, repo) = test_repo();
        setup_fork(&repo);

        // Both sides modify README.md.
        write_files(repo.root(), &[("README.md", "B")]);
        commit(&repo, MAIN_WORKSPACE, "main edit");
        write_files(
            &repo.workspaces().workspace_dir("feat-ws"),
            &[("README.md", "C")],
        );
        commit(&repo, "feat-ws", "feat edit");

        let head_before = repo.ledger().get_lane("main").unwrap().head_state;
        let err = repo.promote("feat", "main", false).unwrap_err();
        match err {
            RepoError::PromoteConflict { paths } => {
                assert_eq!(paths.len(), 1);
                assert_eq!(paths[0].path, "README.md");
                assert_eq!(paths[0].source.to_string(), "modified");
                assert_eq!(paths[0].target.to_string(), "modified");
            }
            other => panic!("expected PromoteConflict, got {other:?}"),
        }
        // No mutation happened.
        assert_eq!(
            repo.ledger().get_lane("main").unwrap().head_state,
            head_before
        );

        // Forced: source content wins.
        let result = repo.promote("feat", "main", true).unwrap();
        let new_head = result.new_head.unwrap();
        assert_eq!(read_tree_file(&repo, &new_head, "README.md").unwrap(), b"C");
    }

    #[test]
    fn promote_into_empty_lane_fast_forwards() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("a.txt", "a")]);
        let head = commit(&repo, MAIN_WORKSPACE, "init").to_state;

        repo.create_lane("release", None).unwrap();
        let result = repo.promote("main", "release", false).unwrap();
        assert_eq!(result.new_head, Some(head));
        assert_eq!(
            repo.ledger().get_lane("release").unwrap().head_state,
            Some(head)
        );
    }

    #[test]
    fn promote_with_nothing_new_is_a_noop() {
        let (_dir, repo) = test_repo();
        setup_fork(&repo);
        // feat never diverged from main.
        let result = repo.promote("feat", "main", false).unwrap();
        assert!(result.transition.is_none());
    }

    // -------------------------------------------------------------------
    // Workspace sync
    // -------------------------------------------------------------------

    #[test]
    fn update_workspace_follows_lane_head() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("app.py", "v1"), ("lib.py", "lib")]);
        commit(&repo, MAIN_WORKSPACE, "init");
        repo.create_workspace("agent-ws", "main", None).unwrap();

        write_files(repo.root(), &[("app.py", "v2")]);
        commit(&repo, MAIN_WORKSPACE, "bump");

        let head = repo.update_workspace("agent-ws").unwrap().unwrap();
        let ws_dir = repo.workspaces().workspace_dir("agent-ws");
        assert_eq!(fs::read_to_string(ws_dir.join("app.py")).unwrap(), "v2");
        assert_eq!(
            repo.ledger().get_workspace("agent-ws").unwrap().base_state,
            Some(head)
        );
    }

    #[test]
    fn restore_recovers_a_dirty_workspace() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("a.txt", "good")]);
        let head = commit(&repo, MAIN_WORKSPACE, "init").to_state;
        repo.create_workspace("agent-ws", "main", None).unwrap();

        // Simulate an interrupted write: dirty marker plus mangled content.
        let ws_dir = repo.workspaces().workspace_dir("agent-ws");
        fs::write(ws_dir.join("a.txt"), "mangled").unwrap();
        flanes_workspace::write_dirty(&ws_dir, head).unwrap();

        // Snapshots refuse while dirty.
        let err = repo
            .checkpoint("agent-ws", "oops", CheckpointOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            RepoError::Workspace(flanes_workspace::WorkspaceError::Dirty { .. })
        ));

        repo.restore("agent-ws", &head).unwrap();
        assert_eq!(fs::read_to_string(ws_dir.join("a.txt")).unwrap(), "good");
        assert!(repo.workspaces().is_dirty("agent-ws").unwrap().is_none());
    }

    // -------------------------------------------------------------------
    // Budgets
    // -------------------------------------------------------------------

    #[test]
    fn budget_exceeded_blocks_before_any_side_effect() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("a.txt", "a")]);
        commit(&repo, MAIN_WORKSPACE, "init");

        repo.set_budget(
            "main",
            &BudgetLimits {
                tokens_in: Some(100),
                ..BudgetLimits::default()
            },
        )
        .unwrap();

        // Cost can only accrue on an open transition.
        write_files(repo.root(), &[("b.txt", "b")]);
        let open = repo
            .checkpoint(MAIN_WORKSPACE, "spend", CheckpointOptions::default())
            .unwrap()
            .transition
            .unwrap();
        repo.accrue_cost(
            &open.id,
            &CostRecord {
                tokens_in: 150,
                ..CostRecord::zero()
            },
        )
        .unwrap();

        write_files(repo.root(), &[("c.txt", "c")]);
        let before = repo.history(Some("main"), 100, None).unwrap().len();
        let err = repo
            .checkpoint(MAIN_WORKSPACE, "blocked", CheckpointOptions::default())
            .unwrap_err();
        assert!(matches!(err, RepoError::BudgetExceeded { .. }));
        // No transition was created.
        assert_eq!(repo.history(Some("main"), 100, None).unwrap().len(), before);
    }

    #[test]
    fn budget_warning_is_surfaced_not_blocking() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("a.txt", "a")]);
        commit(&repo, MAIN_WORKSPACE, "init");

        repo.set_budget(
            "main",
            &BudgetLimits {
                tokens_in: Some(1_000),
                alert_threshold_pct: Some(50),
                ..BudgetLimits::default()
            },
        )
        .unwrap();

        write_files(repo.root(), &[("b.txt", "b")]);
        let open = repo
            .checkpoint(MAIN_WORKSPACE, "spend", CheckpointOptions::default())
            .unwrap()
            .transition
            .unwrap();
        repo.accrue_cost(
            &open.id,
            &CostRecord {
                tokens_in: 600,
                ..CostRecord::zero()
            },
        )
        .unwrap();

        write_files(repo.root(), &[("c.txt", "c")]);
        let result = repo
            .checkpoint(MAIN_WORKSPACE, "warned", CheckpointOptions::default())
            .unwrap();
        assert_eq!(result.budget_warnings, vec!["tokens_in".to_string()]);
        assert!(result.transition.is_some());
    }

    // -------------------------------------------------------------------
    // Lineage, diff, search
    // -------------------------------------------------------------------

    #[test]
    fn trace_walks_parent_chain_with_transitions() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("f.txt", "one")]);
        let t0 = commit(&repo, MAIN_WORKSPACE, "first");
        write_files(repo.root(), &[("f.txt", "two")]);
        let t1 = commit(&repo, MAIN_WORKSPACE, "second");

        let entries = repo.trace(&t1.to_state).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state, t1.to_state);
        assert_eq!(entries[0].transition.as_ref().unwrap().id, t1.id);
        assert_eq!(entries[1].state, t0.to_state);
        assert_eq!(entries[1].transition.as_ref().unwrap().id, t0.id);
    }

    #[test]
    fn diff_between_states() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("keep.txt", "k"), ("old.txt", "o")]);
        let t0 = commit(&repo, MAIN_WORKSPACE, "first");
        fs::remove_file(repo.root().join("old.txt")).unwrap();
        write_files(repo.root(), &[("new.txt", "n")]);
        let t1 = commit(&repo, MAIN_WORKSPACE, "second");

        let diff = repo.diff(&t0.to_state, &t1.to_state).unwrap();
        assert!(diff.added.contains_key("new.txt"));
        assert!(diff.removed.contains_key("old.txt"));
        assert!(!diff.modified.contains_key("keep.txt"));
    }

    #[test]
    fn search_finds_prompts_and_tags() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("auth.py", "x")]);
        let result = repo
            .checkpoint(
                MAIN_WORKSPACE,
                "Implement OAuth login",
                CheckpointOptions {
                    tags: vec!["security".into()],
                    ..CheckpointOptions::default()
                },
            )
            .unwrap();
        repo.accept(&result.transition.unwrap().id, None).unwrap();

        assert_eq!(repo.search("oauth").unwrap().len(), 1);
        assert_eq!(repo.search("security").unwrap().len(), 1);
        assert!(repo.search("nothing-here").unwrap().is_empty());
    }

    // -------------------------------------------------------------------
    // Garbage collection end-to-end
    // -------------------------------------------------------------------

    #[test]
    fn gc_collects_rejected_branch_and_keeps_live_history() {
        let (_dir, repo) = test_repo();
        write_files(repo.root(), &[("keep.txt", "kept-content")]);
        let t0 = commit(&repo, MAIN_WORKSPACE, "init");
        let s0 = t0.to_state;

        // Propose S0 -> S1 and reject it.
        write_files(repo.root(), &[("junk.txt", "junk-content")]);
        let t1 = repo
            .checkpoint(MAIN_WORKSPACE, "doomed", CheckpointOptions::default())
            .unwrap()
            .transition
            .unwrap();
        let s1 = t1.to_state;
        repo.reject(&t1.id, Some("evaluators failed")).unwrap();
        // Reset the workspace to the surviving head before collecting.
        repo.restore(MAIN_WORKSPACE, &s0).unwrap();
        fs::remove_file(repo.root().join("junk.txt")).unwrap();

        let report = repo
            .gc(&GcOptions {
                max_age_days: 0,
                dry_run: false,
            })
            .unwrap();
        assert_eq!(report.deleted_transitions, 1);
        assert_eq!(report.deleted_states, 1);

        let junk_blob = ObjectId::from_bytes(b"junk-content");
        let kept_blob = ObjectId::from_bytes(b"kept-content");
        assert!(!repo.cas().has(ObjectKind::State, &s1).unwrap());
        assert!(!repo.cas().has(ObjectKind::Blob, &junk_blob).unwrap());
        assert!(repo.cas().has(ObjectKind::State, &s0).unwrap());
        assert!(repo.cas().has(ObjectKind::Blob, &kept_blob).unwrap());

        // A second run finds nothing further.
        let again = repo
            .gc(&GcOptions {
                max_age_days: 0,
                dry_run: false,
            })
            .unwrap();
        assert_eq!(again.deleted_objects, 0);
        assert_eq!(again.deleted_states, 0);
        assert_eq!(again.deleted_transitions, 0);
    }
}
