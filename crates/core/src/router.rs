use crate::invocation::{self, Invocation};
use crate::plans::{ConfirmationPlan, PlanError, PlanId, PlanStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tiergate_audit::{AuditAction, AuditError, AuditEvent, AuditRecord, AuditTrail};
use tiergate_policy::{TierDecision, TierPolicy};
use tiergate_tools::{ErrorCode, Tool, ToolRegistry, ToolResult, ToolSpec};
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Added to a tool's own timeout before the router gives up on it.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    /// The tool ran for real.
    Executed,
    /// A plan was created and waits for `execute_confirmed_plan`.
    PendingConfirmation,
    /// Explicit dry run; nothing was changed and no plan exists.
    Previewed,
    /// Refused before the tool ran (unknown tool, tier, failed preview).
    Rejected,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterOutcome {
    pub result: ToolResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<PlanId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub state: InvocationState,
}

impl RouterOutcome {
    fn new(result: ToolResult, state: InvocationState) -> Self {
        Self {
            result,
            plan_id: None,
            summary: None,
            state,
        }
    }

    fn pending(result: ToolResult, plan_id: PlanId, summary: String) -> Self {
        Self {
            result,
            plan_id: Some(plan_id),
            summary: Some(summary),
            state: InvocationState::PendingConfirmation,
        }
    }
}

/// Entry point for transports: tier policy, confirmation plans, execution
/// and audit.
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    plans: Arc<PlanStore>,
    audit: Arc<dyn AuditTrail>,
    policy: TierPolicy,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        plans: Arc<PlanStore>,
        audit: Arc<dyn AuditTrail>,
        policy: TierPolicy,
    ) -> Self {
        Self {
            registry,
            plans,
            audit,
            policy,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn plans(&self) -> &PlanStore {
        &self.plans
    }

    pub fn policy(&self) -> TierPolicy {
        self.policy
    }

    pub fn parse_invocation(text: &str) -> Option<Invocation> {
        invocation::parse_invocation(text)
    }

    pub async fn execute(
        &self,
        tool_name: &str,
        args: &Value,
        session_id: &str,
        dry_run: bool,
    ) -> RouterOutcome {
        let request_id = Uuid::new_v4().to_string();

        let tool = match self.registry.lookup(tool_name) {
            Some(tool) => tool,
            None => {
                warn!(tool = tool_name, session_id, request_id = %request_id, "Unknown tool");
                return RouterOutcome::new(
                    ToolResult::failure(
                        ErrorCode::ToolNotFound,
                        format!("Tool '{}' not found", tool_name),
                    ),
                    InvocationState::Rejected,
                );
            }
        };
        let spec = tool.spec().clone();

        info!(
            tool = %spec.name,
            tier = %spec.tier,
            session_id,
            request_id = %request_id,
            dry_run,
            "Dispatching tool"
        );

        let needs_confirmation = match self.policy.check(spec.tier, spec.requires_confirmation) {
            TierDecision::Denied(max_tier) => {
                warn!(tool = %spec.name, tier = %spec.tier, max_tier = %max_tier, "Tier not permitted");
                let result = ToolResult::failure(
                    ErrorCode::TierNotPermitted,
                    format!(
                        "Tool '{}' is tier '{}' but at most '{}' is permitted",
                        spec.name, spec.tier, max_tier
                    ),
                );
                self.record(
                    AuditRecord::new(session_id, &request_id, AuditEvent::PolicyDenied, AuditAction::Deny)
                        .with_tool(&spec.name, spec.tier)
                        .with_details(json!({ "args": args }))
                        .with_result(result_value(&result)),
                );
                return RouterOutcome::new(result, InvocationState::Rejected);
            }
            TierDecision::RequiresConfirmation => true,
            TierDecision::Allowed => false,
        };

        if dry_run {
            let result = self.run_tool(tool, args, true).await;
            self.record_execution(session_id, &request_id, &spec, args, &result, AuditAction::DryRun, false);
            return RouterOutcome::new(result, InvocationState::Previewed);
        }

        if needs_confirmation {
            return self
                .stage_plan(tool, &spec, args, session_id, &request_id)
                .await;
        }

        let result = self.run_tool(tool, args, false).await;
        self.record_execution(session_id, &request_id, &spec, args, &result, AuditAction::Execute, false);
        RouterOutcome::new(result, InvocationState::Executed)
    }

    /// Runs the preview and, if it succeeds, stores the real args as a plan.
    async fn stage_plan(
        &self,
        tool: Arc<dyn Tool>,
        spec: &ToolSpec,
        args: &Value,
        session_id: &str,
        request_id: &str,
    ) -> RouterOutcome {
        let preview = if spec.supports_dry_run {
            self.run_tool(tool, args, true).await
        } else {
            describe_without_running(tool.as_ref(), args)
        };

        self.record_execution(session_id, request_id, spec, args, &preview, AuditAction::DryRun, false);

        if !preview.ok {
            return RouterOutcome::new(preview, InvocationState::Rejected);
        }

        let summary = format!("Tool '{}' will perform: {}", spec.name, preview_text(&preview));
        let plan_id = self
            .plans
            .create(session_id, &spec.name, args.clone(), summary.clone());
        info!(plan_id = %plan_id, tool = %spec.name, session_id, request_id, "Awaiting confirmation");

        RouterOutcome::pending(preview, plan_id, summary)
    }

    pub async fn execute_confirmed_plan(&self, plan_id: &PlanId) -> ToolResult {
        let request_id = Uuid::new_v4().to_string();

        let plan = match self.plans.pending(plan_id) {
            Ok(plan) => plan,
            Err(e) => return plan_failure(e),
        };

        let tool = match self.registry.lookup(&plan.tool_name) {
            Some(tool) => tool,
            None => {
                return ToolResult::failure(
                    ErrorCode::ToolNotFound,
                    format!("Tool '{}' not found", plan.tool_name),
                )
            }
        };

        // The check above is advisory; only the claim is authoritative.
        let plan = match self.plans.claim(plan_id) {
            Ok(plan) => plan,
            Err(e) => return plan_failure(e),
        };
        let spec = tool.spec().clone();

        info!(
            plan_id = %plan_id,
            tool = %spec.name,
            tier = %spec.tier,
            session_id = %plan.session_id,
            request_id = %request_id,
            "Executing confirmed plan"
        );

        let result = self.run_tool(tool, &plan.args, false).await;
        self.plans.mark_executed(plan_id);

        self.record_execution(
            &plan.session_id,
            &request_id,
            &spec,
            &plan.args,
            &result,
            AuditAction::ExecuteConfirmed,
            true,
        );
        result
    }

    pub fn cancel_plan(&self, plan_id: &PlanId) -> ToolResult {
        let plan: ConfirmationPlan = match self.plans.cancel(plan_id) {
            Ok(plan) => plan,
            Err(e) => return plan_failure(e),
        };

        info!(plan_id = %plan_id, tool = %plan.tool_name, session_id = %plan.session_id, "Cancelled plan");

        let result = ToolResult::success(json!({
            "plan_id": plan.plan_id,
            "tool": plan.tool_name,
            "cancelled": true,
        }));

        let mut record = AuditRecord::new(
            &plan.session_id,
            Uuid::new_v4().to_string(),
            AuditEvent::PlanCancelled,
            AuditAction::Cancel,
        )
        .with_details(json!({ "plan_id": plan.plan_id, "args": plan.args }))
        .with_result(result_value(&result));
        match self.registry.lookup(&plan.tool_name) {
            Some(tool) => record = record.with_tool(&plan.tool_name, tool.spec().tier),
            None => record.tool_name = Some(plan.tool_name.clone()),
        }
        self.record(record);

        result
    }

    /// Newest first.
    pub fn recent_audit(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        self.audit.recent(limit, offset)
    }

    /// Runs the tool on its own task so a panic or a hang cannot take the
    /// caller with it.
    async fn run_tool(&self, tool: Arc<dyn Tool>, args: &Value, dry_run: bool) -> ToolResult {
        let name = tool.spec().name.clone();
        let deadline = tool.spec().timeout() + DEADLINE_GRACE;
        let fault_code = tool.kind().fault_code();
        let args = args.clone();

        let mut handle = tokio::spawn(async move { tool.execute(&args, dry_run).await });

        match timeout(deadline, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    error!(tool = %name, "Tool execution panicked");
                } else {
                    error!(tool = %name, "Tool execution cancelled");
                }
                ToolResult::failure(fault_code, format!("Tool '{}' failed internally", name))
            }
            Err(_) => {
                handle.abort();
                warn!(tool = %name, "Tool exceeded its {}s deadline", deadline.as_secs());
                ToolResult::failure(
                    ErrorCode::Timeout,
                    format!("Tool '{}' timed out after {}s", name, deadline.as_secs()),
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_execution(
        &self,
        session_id: &str,
        request_id: &str,
        spec: &ToolSpec,
        args: &Value,
        result: &ToolResult,
        action: AuditAction,
        user_confirmed: bool,
    ) {
        let event = if result.is_error(ErrorCode::AccessDenied) {
            AuditEvent::AccessDenied
        } else {
            AuditEvent::ToolExecution
        };
        self.record(
            AuditRecord::new(session_id, request_id, event, action)
                .with_tool(&spec.name, spec.tier)
                .with_details(json!({ "args": args }))
                .with_result(result_value(result))
                .confirmed(user_confirmed),
        );
    }

    /// Audit failures never change the outcome of a request.
    fn record(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(&record) {
            error!(
                session_id = %record.session_id,
                request_id = %record.request_id,
                action = %record.action,
                "Failed to write audit record: {}",
                e
            );
        }
    }
}

/// Preview for a tool that must be confirmed but has no dry-run mode of its
/// own. Arguments are still checked so a plan is never built on bad input.
fn describe_without_running(tool: &dyn Tool, args: &Value) -> ToolResult {
    let spec = tool.spec();
    if let Err(message) = tool.validate_args(args) {
        return ToolResult::failure(
            ErrorCode::InvalidArguments,
            format!("Invalid arguments for tool '{}': {}", spec.name, message),
        );
    }
    ToolResult::success(json!({
        "dry_run": true,
        "tool": spec.name,
        "args": args,
        "message": format!("Would run '{}' with arguments {}", spec.name, args),
    }))
}

fn preview_text(preview: &ToolResult) -> String {
    let Some(data) = &preview.data else {
        return preview.message.clone().unwrap_or_default();
    };
    for key in ["message", "command"] {
        if let Some(text) = data.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    data.to_string()
}

fn plan_failure(error: PlanError) -> ToolResult {
    let code = match error {
        PlanError::NotFound(_) => ErrorCode::PlanNotFound,
        PlanError::AlreadyExecuted(_) => ErrorCode::PlanAlreadyExecuted,
    };
    ToolResult::failure(code, error.to_string())
}

fn result_value(result: &ToolResult) -> Value {
    serde_json::to_value(result).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_text_prefers_message() {
        let preview = ToolResult::success(json!({"message": "Would move 3 photos", "command": "mv"}));
        assert_eq!(preview_text(&preview), "Would move 3 photos");
    }

    #[test]
    fn test_preview_text_falls_back_to_command_then_json() {
        let preview = ToolResult::success(json!({"command": "apt-get install -y htop"}));
        assert_eq!(preview_text(&preview), "apt-get install -y htop");

        let preview = ToolResult::success(json!({"count": 2}));
        assert_eq!(preview_text(&preview), r#"{"count":2}"#);
    }

    #[test]
    fn test_plan_failure_codes() {
        let id = PlanId::from("pln_x");
        assert!(plan_failure(PlanError::NotFound(id.clone())).is_error(ErrorCode::PlanNotFound));
        assert!(plan_failure(PlanError::AlreadyExecuted(id)).is_error(ErrorCode::PlanAlreadyExecuted));
    }
}
