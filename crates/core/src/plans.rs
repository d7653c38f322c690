//! Pending confirmation plans.
//!
//! A plan moves `Pending -> Executing -> Executed` and never back. The
//! `Pending -> Executing` step ([`PlanStore::claim`]) happens under the store
//! lock, so two concurrent confirmations of one plan cannot both run it.
//!
//! Unconfirmed plans expire after the TTL. Executed plans are dropped on the
//! same schedule but leave their id behind in a bounded spent set, so a late
//! second confirmation still reports `AlreadyExecuted`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_PLAN_TTL: Duration = Duration::from_secs(900);
pub const DEFAULT_MAX_PLANS: usize = 1000;

/// Spent ids remembered per live-plan slot.
const SPENT_IDS_PER_PLAN: usize = 10;

/// `pln_<YYYYMMDD>_<HHMMSSmmm>_<6 hex>`, UTC. Sorts by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("pln_{}_{}", stamp, &suffix[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlanId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PlanId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanState {
    Pending,
    Executing,
    Executed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationPlan {
    pub plan_id: PlanId,
    pub session_id: String,
    pub tool_name: String,
    pub args: Value,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub state: PlanState,
}

impl ConfirmationPlan {
    /// True once the plan has been acted upon.
    pub fn executed(&self) -> bool {
        self.state != PlanState::Pending
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan '{0}' not found")]
    NotFound(PlanId),
    #[error("Plan '{0}' has already been executed")]
    AlreadyExecuted(PlanId),
}

#[derive(Default)]
struct Plans {
    live: HashMap<PlanId, ConfirmationPlan>,
    spent: HashSet<PlanId>,
    spent_order: VecDeque<PlanId>,
}

impl Plans {
    /// Drops a plan from the live map, remembering its id if it was executed.
    fn retire(&mut self, plan_id: &PlanId, spent_capacity: usize) {
        let Some(plan) = self.live.remove(plan_id) else {
            return;
        };
        if plan.state != PlanState::Executed || !self.spent.insert(plan.plan_id.clone()) {
            return;
        }
        self.spent_order.push_back(plan.plan_id);
        while self.spent_order.len() > spent_capacity {
            if let Some(oldest) = self.spent_order.pop_front() {
                self.spent.remove(&oldest);
            }
        }
    }

    fn missing(&self, plan_id: &PlanId) -> PlanError {
        if self.spent.contains(plan_id) {
            PlanError::AlreadyExecuted(plan_id.clone())
        } else {
            PlanError::NotFound(plan_id.clone())
        }
    }
}

pub struct PlanStore {
    plans: Mutex<Plans>,
    ttl: Duration,
    max_plans: usize,
}

impl PlanStore {
    pub fn new(ttl: Duration, max_plans: usize) -> Self {
        Self {
            plans: Mutex::new(Plans::default()),
            ttl,
            max_plans: max_plans.max(1),
        }
    }

    fn spent_capacity(&self) -> usize {
        self.max_plans.saturating_mul(SPENT_IDS_PER_PLAN)
    }

    pub fn create(
        &self,
        session_id: &str,
        tool_name: &str,
        args: Value,
        summary: impl Into<String>,
    ) -> PlanId {
        let plan_id = PlanId::generate();
        let plan = ConfirmationPlan {
            plan_id: plan_id.clone(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
            summary: summary.into(),
            created_at: Utc::now(),
            state: PlanState::Pending,
        };

        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans);
        while plans.live.len() >= self.max_plans {
            if !self.evict_oldest(&mut plans) {
                break;
            }
        }
        plans.live.insert(plan_id.clone(), plan);

        info!(plan_id = %plan_id, tool = tool_name, session_id, "Created confirmation plan");
        plan_id
    }

    pub fn get(&self, plan_id: &PlanId) -> Option<ConfirmationPlan> {
        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans);
        plans.live.get(plan_id).cloned()
    }

    /// A plan that can still be confirmed, or why it cannot.
    pub fn pending(&self, plan_id: &PlanId) -> Result<ConfirmationPlan, PlanError> {
        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans);
        match plans.live.get(plan_id) {
            None => Err(plans.missing(plan_id)),
            Some(plan) if plan.executed() => Err(PlanError::AlreadyExecuted(plan_id.clone())),
            Some(plan) => Ok(plan.clone()),
        }
    }

    /// Atomically moves a pending plan to `Executing` and returns it.
    pub fn claim(&self, plan_id: &PlanId) -> Result<ConfirmationPlan, PlanError> {
        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans);
        let missing = plans.missing(plan_id);
        let plan = plans.live.get_mut(plan_id).ok_or(missing)?;
        if plan.executed() {
            return Err(PlanError::AlreadyExecuted(plan_id.clone()));
        }
        plan.state = PlanState::Executing;
        Ok(plan.clone())
    }

    /// Idempotent; unknown ids are ignored.
    pub fn mark_executed(&self, plan_id: &PlanId) {
        if let Some(plan) = self.plans.lock().live.get_mut(plan_id) {
            plan.state = PlanState::Executed;
        }
    }

    pub fn delete(&self, plan_id: &PlanId) -> Option<ConfirmationPlan> {
        self.plans.lock().live.remove(plan_id)
    }

    /// Removes a plan that has not been acted upon.
    pub fn cancel(&self, plan_id: &PlanId) -> Result<ConfirmationPlan, PlanError> {
        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans);
        match plans.live.get(plan_id) {
            None => Err(plans.missing(plan_id)),
            Some(plan) if plan.executed() => Err(PlanError::AlreadyExecuted(plan_id.clone())),
            Some(_) => plans
                .live
                .remove(plan_id)
                .ok_or_else(|| PlanError::NotFound(plan_id.clone())),
        }
    }

    /// Drops expired plans; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans)
    }

    /// Live plans; spent ids are not counted.
    pub fn len(&self) -> usize {
        self.plans.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_for_session(&self, session_id: &str) -> Vec<ConfirmationPlan> {
        let mut plans = self.plans.lock();
        self.evict_expired(&mut plans);
        let mut pending: Vec<ConfirmationPlan> = plans
            .live
            .values()
            .filter(|p| p.session_id == session_id && p.state == PlanState::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.plan_id.cmp(&b.plan_id));
        pending
    }

    fn evict_expired(&self, plans: &mut Plans) -> usize {
        let now = Utc::now();
        // A plan that is running is kept until it finishes.
        let expired: Vec<PlanId> = plans
            .live
            .values()
            .filter(|plan| plan.state != PlanState::Executing && plan.age(now) >= self.ttl)
            .map(|plan| plan.plan_id.clone())
            .collect();
        for plan_id in &expired {
            plans.retire(plan_id, self.spent_capacity());
        }
        if !expired.is_empty() {
            debug!("Evicted {} expired plans", expired.len());
        }
        expired.len()
    }

    /// Evicts the oldest executed plan, or failing that the oldest pending one.
    fn evict_oldest(&self, plans: &mut Plans) -> bool {
        let oldest_in = |state: PlanState| {
            plans
                .live
                .values()
                .filter(|p| p.state == state)
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.plan_id.cmp(&b.plan_id)))
                .map(|p| p.plan_id.clone())
        };
        let oldest = oldest_in(PlanState::Executed).or_else(|| oldest_in(PlanState::Pending));
        match oldest {
            Some(id) => {
                debug!(plan_id = %id, "Evicted oldest plan");
                plans.retire(&id, self.spent_capacity());
                true
            }
            None => false,
        }
    }
}

impl Default for PlanStore {
    fn default() -> Self {
        Self::new(DEFAULT_PLAN_TTL, DEFAULT_MAX_PLANS)
    }
}
