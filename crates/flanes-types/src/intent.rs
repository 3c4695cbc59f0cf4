//! Intents and cost records: the "why" and "how much" of a transition.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::object::ObjectId;

/// Structured description of why a change was made.
///
/// Every transition carries exactly one intent. The free-form `metadata` map
/// holds collaborator-specific keys; core code only interprets the named
/// fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Unique identifier for this intent.
    pub id: Uuid,
    /// The prompt or instruction that drove the change.
    pub prompt: String,
    /// Identity of the agent that produced the change.
    pub agent_id: String,
    /// Kind of agent (e.g. "coder", "reviewer", "human").
    pub agent_type: String,
    /// Model identifier, when the agent is model-backed.
    pub model: Option<String>,
    /// Free-form labels for search and grouping.
    pub tags: BTreeSet<String>,
    /// Content addresses of context objects consulted while producing the change.
    pub context_refs: Vec<ObjectId>,
    /// Collaborator-specific metadata, validated only at the boundary.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Intent {
    /// Create a new intent with a fresh id and the given prompt and agent.
    pub fn new(
        prompt: impl Into<String>,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            model: None,
            tags: BTreeSet::new(),
            context_refs: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Set the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns `true` if the prompt, any tag, or the agent identity contains
    /// `query` (case-insensitive substring match).
    pub fn matches(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        self.prompt.to_lowercase().contains(&q)
            || self.agent_id.to_lowercase().contains(&q)
            || self.agent_type.to_lowercase().contains(&q)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&q))
    }
}

/// Resource accounting for one transition.
///
/// All fields are additive; [`CostRecord::add`] accumulates deltas. The
/// ledger only permits accrual while the owning transition is still in the
/// `proposed` or `evaluating` state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostRecord {
    /// Input tokens consumed.
    pub tokens_in: u64,
    /// Output tokens produced.
    pub tokens_out: u64,
    /// Number of API calls made.
    pub api_calls: u64,
    /// Wall-clock time spent, in milliseconds.
    pub wall_time_ms: u64,
}

impl CostRecord {
    /// A zeroed cost record.
    pub fn zero() -> Self {
        Self::default()
    }

    /// Accumulate another record into this one (saturating).
    pub fn add(&mut self, delta: &CostRecord) {
        self.tokens_in = self.tokens_in.saturating_add(delta.tokens_in);
        self.tokens_out = self.tokens_out.saturating_add(delta.tokens_out);
        self.api_calls = self.api_calls.saturating_add(delta.api_calls);
        self.wall_time_ms = self.wall_time_ms.saturating_add(delta.wall_time_ms);
    }

    /// Sum of two records (saturating).
    pub fn sum(mut self, other: &CostRecord) -> Self {
        self.add(other);
        self
    }

    /// Returns `true` if every field is zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}
