//! Ledger row types: transitions, lanes, workspaces, budgets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flanes_types::{CostRecord, Intent, ObjectId};

/// Lifecycle of a transition.
///
/// `proposed → evaluating → {accepted, rejected}`. An accepted transition
/// may later become `superseded` when a lane history is rewritten by an
/// import adapter, but it is never un-accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    /// Created, not yet evaluated.
    Proposed,
    /// Evaluation in progress.
    Evaluating,
    /// Accepted; the lane head advanced to `to_state`.
    Accepted,
    /// Rejected by evaluation or by the caller.
    Rejected,
    /// Accepted, then replaced by a history rewrite. Preserved for
    /// interoperability; nothing in core creates it.
    Superseded,
}

impl TransitionStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Evaluating => "evaluating",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Superseded => "superseded",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(Self::Proposed),
            "evaluating" => Some(Self::Evaluating),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "superseded" => Some(Self::Superseded),
            _ => None,
        }
    }

    /// Whether this status permits moving to `next`.
    pub fn can_become(&self, next: TransitionStatus) -> bool {
        use TransitionStatus::*;
        matches!(
            (self, next),
            (Proposed, Evaluating)
                | (Proposed, Accepted)
                | (Proposed, Rejected)
                | (Evaluating, Accepted)
                | (Evaluating, Rejected)
                | (Accepted, Superseded)
        )
    }

    /// Whether cost may still accrue on a transition in this status.
    pub fn allows_cost_accrual(&self) -> bool {
        matches!(self, Self::Proposed | Self::Evaluating)
    }
}

impl std::fmt::Display for TransitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposed or realized move between two world states on a lane.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Unique identifier.
    pub id: Uuid,
    /// The state the change was made against. `None` for the first
    /// transition on an empty lane.
    pub from_state: Option<ObjectId>,
    /// The resulting state. Always present in the CAS before the row is
    /// committed.
    pub to_state: ObjectId,
    /// The lane this transition belongs to.
    pub lane: String,
    /// Why the change was made.
    pub intent: Intent,
    /// Accrued cost.
    pub cost: CostRecord,
    /// Lifecycle status.
    pub status: TransitionStatus,
    /// Creation time, seconds since the epoch.
    pub created_at: i64,
    /// Evaluator summary captured at accept/reject time.
    pub eval_summary: Option<String>,
}

/// A named, append-only chain of accepted world states.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    /// Lane name, matching the validated name pattern.
    pub name: String,
    /// Current head, or `None` for an empty lane. Mutates only via accept
    /// or promote.
    pub head_state: Option<ObjectId>,
    /// The state this lane was forked from, if any.
    pub fork_base: Option<ObjectId>,
    /// Creation time, seconds since the epoch.
    pub created_at: i64,
    /// Free-form metadata; budgets live under [`BUDGET_METADATA_KEY`].
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Metadata key under which a lane's budget limits are stored.
pub const BUDGET_METADATA_KEY: &str = "budget";

impl Lane {
    /// Parse the lane's budget limits out of its metadata, if set.
    pub fn budget(&self) -> Option<BudgetLimits> {
        let value = self.metadata.get(BUDGET_METADATA_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Store budget limits into the lane's metadata.
    pub fn set_budget(&mut self, budget: &BudgetLimits) {
        self.metadata.insert(
            BUDGET_METADATA_KEY.to_string(),
            serde_json::to_value(budget).expect("budget serializes"),
        );
    }
}

/// Per-lane resource limits with an alert threshold.
///
/// A `None` field is unlimited. The alert threshold is a percentage of any
/// limit; crossing it warns the caller without blocking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Input-token limit.
    pub tokens_in: Option<u64>,
    /// Output-token limit.
    pub tokens_out: Option<u64>,
    /// API-call limit.
    pub api_calls: Option<u64>,
    /// Wall-clock limit, milliseconds.
    pub wall_time_ms: Option<u64>,
    /// Alert when spend crosses this percentage of any limit.
    pub alert_threshold_pct: Option<u8>,
}

/// Where a lane's aggregated spend sits relative to its budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BudgetStanding {
    /// Under every limit and below the alert threshold.
    Ok,
    /// Past the alert threshold on the named dimensions, but under the limits.
    Warning { dimensions: Vec<&'static str> },
    /// At or over the limit on the named dimensions.
    Exceeded { dimensions: Vec<&'static str> },
}

impl BudgetLimits {
    const DEFAULT_ALERT_PCT: u8 = 80;

    /// Classify `spent` against these limits.
    pub fn standing(&self, spent: &CostRecord) -> BudgetStanding {
        let dims: [(&'static str, Option<u64>, u64); 4] = [
            ("tokens_in", self.tokens_in, spent.tokens_in),
            ("tokens_out", self.tokens_out, spent.tokens_out),
            ("api_calls", self.api_calls, spent.api_calls),
            ("wall_time_ms", self.wall_time_ms, spent.wall_time_ms),
        ];

        let mut exceeded = Vec::new();
        let mut warned = Vec::new();
        let alert_pct = self.alert_threshold_pct.unwrap_or(Self::DEFAULT_ALERT_PCT) as u128;

        for (name, limit, used) in dims {
            let Some(limit) = limit else { continue };
            if used >= limit {
                exceeded.push(name);
            } else if (used as u128) * 100 >= (limit as u128) * alert_pct {
                warned.push(name);
            }
        }

        if !exceeded.is_empty() {
            BudgetStanding::Exceeded { dimensions: exceeded }
        } else if !warned.is_empty() {
            BudgetStanding::Warning { dimensions: warned }
        } else {
            BudgetStanding::Ok
        }
    }
}

/// Lifecycle of a workspace row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    /// In use by an agent.
    Active,
    /// Materialized but not in use.
    Idle,
    /// Base state has fallen behind its lane head.
    Stale,
    /// Directory removed; row kept for history.
    Disposed,
}

impl WorkspaceStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Stale => "stale",
            Self::Disposed => "disposed",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "idle" => Some(Self::Idle),
            "stale" => Some(Self::Stale),
            "disposed" => Some(Self::Disposed),
            _ => None,
        }
    }
}

/// A workspace row: which lane it serves and what state it was built from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    /// Workspace name; `main` maps to the repository root.
    pub name: String,
    /// Lane the workspace tracks.
    pub lane: String,
    /// The state the directory was last materialized or snapshotted from.
    pub base_state: Option<ObjectId>,
    /// Creation time, seconds since the epoch.
    pub created_at: i64,
    /// Lifecycle status.
    pub status: WorkspaceStatus,
    /// Agent currently bound to the workspace, if any.
    pub agent_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for status in [
            TransitionStatus::Proposed,
            TransitionStatus::Evaluating,
            TransitionStatus::Accepted,
            TransitionStatus::Rejected,
            TransitionStatus::Superseded,
        ] {
            assert_eq!(TransitionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransitionStatus::parse("bogus"), None);
    }

    #[test]
    fn legal_status_edges() {
        use TransitionStatus::*;
        assert!(Proposed.can_become(Evaluating));
        assert!(Proposed.can_become(Accepted));
        assert!(Proposed.can_become(Rejected));
        assert!(Evaluating.can_become(Accepted));
        assert!(Evaluating.can_become(Rejected));
        assert!(Accepted.can_become(Superseded));
    }

    #[test]
    fn illegal_status_edges() {
        use TransitionStatus::*;
        // Accepted is never unaccepted.
        assert!(!Accepted.can_become(Rejected));
        assert!(!Accepted.can_become(Proposed));
        assert!(!Rejected.can_become(Accepted));
        assert!(!Rejected.can_become(Superseded));
        assert!(!Superseded.can_become(Accepted));
        assert!(!Evaluating.can_become(Proposed));
    }

    #[test]
    fn cost_accrual_gate() {
        use TransitionStatus::*;
        assert!(Proposed.allows_cost_accrual());
        assert!(Evaluating.allows_cost_accrual());
        assert!(!Accepted.allows_cost_accrual());
        assert!(!Rejected.allows_cost_accrual());
        assert!(!Superseded.allows_cost_accrual());
    }

    #[test]
    fn lane_budget_roundtrip() {
        let mut lane = Lane {
            name: "main".into(),
            head_state: None,
            fork_base: None,
            created_at: 0,
            metadata: BTreeMap::new(),
        };
        assert!(lane.budget().is_none());

        let budget = BudgetLimits {
            tokens_in: Some(1_000),
            api_calls: Some(50),
            ..BudgetLimits::default()
        };
        lane.set_budget(&budget);
        assert_eq!(lane.budget(), Some(budget));
    }

    #[test]
    fn budget_standing_ok() {
        let budget = BudgetLimits {
            tokens_in: Some(1_000),
            ..BudgetLimits::default()
        };
        let spent = CostRecord {
            tokens_in: 100,
            ..CostRecord::zero()
        };
        assert_eq!(budget.standing(&spent), BudgetStanding::Ok);
    }

    #[test]
    fn budget_standing_warning_at_threshold() {
        let budget = BudgetLimits {
            tokens_in: Some(1_000),
            alert_threshold_pct: Some(80),
            ..BudgetLimits::default()
        };
        let spent = CostRecord {
            tokens_in: 800,
            ..CostRecord::zero()
        };
        assert_eq!(
            budget.standing(&spent),
            BudgetStanding::Warning {
                dimensions: vec!["tokens_in"]
            }
        );
    }

    #[test]
    fn budget_standing_exceeded_at_limit() {
        let budget = BudgetLimits {
            api_calls: Some(50),
            ..BudgetLimits::default()
        };
        let spent = CostRecord {
            api_calls: 50,
            ..CostRecord::zero()
        };
        assert_eq!(
            budget.standing(&spent),
            BudgetStanding::Exceeded {
                dimensions: vec!["api_calls"]
            }
        );
    }

    #[test]
    fn unlimited_budget_never_trips() {
        let budget = BudgetLimits::default();
        let spent = CostRecord {
            tokens_in: u64::MAX,
            tokens_out: u64::MAX,
            api_calls: u64::MAX,
            wall_time_ms: u64::MAX,
        };
        assert_eq!(budget.standing(&spent), BudgetStanding::Ok);
    }

    #[test]
    fn workspace_status_roundtrip() {
        for status in [
            WorkspaceStatus::Active,
            WorkspaceStatus::Idle,
            WorkspaceStatus::Stale,
            WorkspaceStatus::Disposed,
        ] {
            assert_eq!(WorkspaceStatus::parse(status.as_str()), Some(status));
        }
    }
}
