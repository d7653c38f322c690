use async_trait::async_trait;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tiergate_audit::{
    AuditAction, AuditError, AuditEvent, AuditRecord, AuditTrail, SqliteAuditTrail,
};
use tiergate_core::{InvocationState, PlanId, PlanStore, ToolRouter};
use tiergate_executor::{
    CommandInvoker, ProcessOutput, ProcessSandbox, SandboxBackend, SandboxRequest,
};
use tiergate_policy::{AccessRoots, AccessValidator, Tier, TierPolicy};
use tiergate_tools::{
    preflight, register_builtin_tools, ArgsValidator, ErrorCode, Tool, ToolDefaults,
    ToolRegistry, ToolResult, ToolSpec,
};

/// Counts previews and real runs.
struct ScriptedTool {
    spec: ToolSpec,
    validator: ArgsValidator,
    previews: AtomicUsize,
    runs: AtomicUsize,
    panics: bool,
}

impl ScriptedTool {
    fn new(spec: ToolSpec) -> Arc<Self> {
        let spec = ToolSpec {
            args_schema: json!({
                "type": "object",
                "properties": { "target": { "type": "string" } },
                "required": ["target"]
            }),
            ..spec
        };
        Arc::new(Self {
            validator: ArgsValidator::compile(&spec).unwrap(),
            spec,
            previews: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            panics: false,
        })
    }

    fn panicking(spec: ToolSpec) -> Arc<Self> {
        let validator = ArgsValidator::compile(&spec).unwrap();
        Arc::new(Self {
            spec,
            validator,
            previews: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            panics: true,
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn previews(&self) -> usize {
        self.previews.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn spec(&self) -> &ToolSpec {
        &self.spec
    }

    fn validate_args(&self, args: &Value) -> Result<(), String> {
        self.validator.validate(args)
    }

    async fn execute(&self, args: &Value, dry_run: bool) -> ToolResult {
        if let Some(rejected) = preflight(self, args, dry_run) {
            return rejected;
        }
        if self.panics {
            panic!("tool blew up");
        }
        if dry_run {
            self.previews.fetch_add(1, Ordering::SeqCst);
            return ToolResult::success(json!({
                "dry_run": true,
                "message": format!("Would touch {}", args["target"].as_str().unwrap_or("")),
            }));
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        ToolResult::success(json!({ "touched": args["target"] }))
    }
}

#[derive(Default)]
struct CountingSandbox {
    calls: AtomicUsize,
    argv: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ProcessSandbox for CountingSandbox {
    fn backend(&self) -> SandboxBackend {
        SandboxBackend::Direct
    }

    fn command_line(&self, request: &SandboxRequest) -> Vec<String> {
        request.argv.clone()
    }

    async fn run(&self, request: &SandboxRequest) -> ProcessOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.argv.lock().unwrap().push(request.argv.clone());
        ProcessOutput {
            ok: true,
            exit_code: 0,
            stdout: "done".to_string(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            failure: None,
        }
    }
}

struct BrokenAudit;

impl AuditTrail for BrokenAudit {
    fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Err(AuditError::Corrupt("disk full".to_string()))
    }

    fn recent(&self, _limit: usize, _offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(Vec::new())
    }
}

fn router_with(tools: Vec<Arc<dyn Tool>>, policy: TierPolicy) -> ToolRouter {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    ToolRouter::new(
        Arc::new(registry),
        Arc::new(PlanStore::default()),
        Arc::new(SqliteAuditTrail::in_memory().unwrap()),
        policy,
    )
}

fn reader() -> Arc<ScriptedTool> {
    ScriptedTool::new(ToolSpec::new("reader", "Reads", json!({})))
}

fn mover() -> Arc<ScriptedTool> {
    ScriptedTool::new(
        ToolSpec::new("mover", "Moves", json!({}))
            .with_tier(Tier::WriteSafe)
            .with_confirmation(),
    )
}

struct Workspace {
    _temp: TempDir,
    base: PathBuf,
    sandbox: Arc<CountingSandbox>,
    router: ToolRouter,
}

/// Builtin catalog rooted in a temp dir, with a sandbox that never spawns.
fn workspace() -> Workspace {
    let temp = TempDir::new().unwrap();
    let base = temp.path().canonicalize().unwrap();
    for dir in ["inbox", "organized", "debs"] {
        fs::create_dir_all(base.join(dir)).unwrap();
    }
    let roots = AccessRoots::new(
        [base.to_str().unwrap()],
        [
            base.join("organized").to_str().unwrap(),
            base.join("debs").to_str().unwrap(),
        ],
    );
    let sandbox = Arc::new(CountingSandbox::default());
    let invoker = Arc::new(CommandInvoker::new(
        Arc::new(AccessValidator::new(roots)),
        sandbox.clone(),
    ));
    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, invoker, ToolDefaults::default()).unwrap();

    let router = ToolRouter::new(
        Arc::new(registry),
        Arc::new(PlanStore::default()),
        Arc::new(SqliteAuditTrail::in_memory().unwrap()),
        TierPolicy::default(),
    );
    Workspace {
        _temp: temp,
        base,
        sandbox,
        router,
    }
}

#[tokio::test]
async fn test_read_only_tool_executes_immediately() {
    let tool = reader();
    let router = router_with(vec![tool.clone()], TierPolicy::default());

    let outcome = router
        .execute("reader", &json!({"target": "/tmp"}), "s1", false)
        .await;

    assert!(outcome.result.ok, "{:?}", outcome.result);
    assert_eq!(outcome.state, InvocationState::Executed);
    assert!(outcome.plan_id.is_none());
    assert_eq!(tool.runs(), 1);

    let audit = router.recent_audit(10, 0).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::Execute);
    assert_eq!(audit[0].tool_name.as_deref(), Some("reader"));
    assert_eq!(audit[0].details, Some(json!({"args": {"target": "/tmp"}})));
    assert!(!audit[0].user_confirmed);
}

#[tokio::test]
async fn test_confirmation_flow() {
    let tool = mover();
    let router = router_with(vec![tool.clone()], TierPolicy::default());
    let args = json!({"target": "~/Pictures/Inbox"});

    let outcome = router.execute("mover", &args, "s1", false).await;
    assert!(outcome.result.ok);
    assert_eq!(outcome.state, InvocationState::PendingConfirmation);
    assert_eq!(
        outcome.summary.as_deref(),
        Some("Tool 'mover' will perform: Would touch ~/Pictures/Inbox")
    );
    assert_eq!(tool.previews(), 1);
    assert_eq!(tool.runs(), 0);

    let plan_id = outcome.plan_id.unwrap();
    let plan = router.plans().get(&plan_id).unwrap();
    assert_eq!(plan.args, args);
    assert_eq!(plan.session_id, "s1");

    let preview_audit = router.recent_audit(1, 0).unwrap().remove(0);
    assert_eq!(preview_audit.action, AuditAction::DryRun);
    assert!(!preview_audit.user_confirmed);

    let result = router.execute_confirmed_plan(&plan_id).await;
    assert!(result.ok, "{:?}", result);
    assert_eq!(result.data.unwrap()["touched"], "~/Pictures/Inbox");
    assert_eq!(tool.runs(), 1);

    let confirmed_audit = router.recent_audit(1, 0).unwrap().remove(0);
    assert_eq!(confirmed_audit.action, AuditAction::ExecuteConfirmed);
    assert_eq!(confirmed_audit.session_id, "s1");
    assert!(confirmed_audit.user_confirmed);

    let again = router.execute_confirmed_plan(&plan_id).await;
    assert!(again.is_error(ErrorCode::PlanAlreadyExecuted));
    assert_eq!(tool.runs(), 1);
}

#[tokio::test]
async fn test_second_confirmation_after_ttl_is_already_executed() {
    let tool = mover();
    let mut registry = ToolRegistry::new();
    registry.register(tool.clone()).unwrap();
    let router = ToolRouter::new(
        Arc::new(registry),
        Arc::new(PlanStore::new(std::time::Duration::from_millis(50), 10)),
        Arc::new(SqliteAuditTrail::in_memory().unwrap()),
        TierPolicy::default(),
    );

    let plan_id = router
        .execute("mover", &json!({"target": "x"}), "s1", false)
        .await
        .plan_id
        .unwrap();
    assert!(router.execute_confirmed_plan(&plan_id).await.ok);

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(router.plans().prune(), 1);

    let again = router.execute_confirmed_plan(&plan_id).await;
    assert!(again.is_error(ErrorCode::PlanAlreadyExecuted), "{:?}", again);
    assert_eq!(tool.runs(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_confirmations_execute_once() {
    let tool = mover();
    let router = Arc::new(router_with(vec![tool.clone()], TierPolicy::default()));
    let plan_id = router
        .execute("mover", &json!({"target": "x"}), "s1", false)
        .await
        .plan_id
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let router = router.clone();
            let plan_id = plan_id.clone();
            tokio::spawn(async move { router.execute_confirmed_plan(&plan_id).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.ok {
            succeeded += 1;
        } else {
            assert!(result.is_error(ErrorCode::PlanAlreadyExecuted), "{:?}", result);
        }
    }
    assert_eq!(succeeded, 1);
    assert_eq!(tool.runs(), 1);
}

#[tokio::test]
async fn test_unknown_plan() {
    let router = router_with(vec![mover()], TierPolicy::default());
    let result = router
        .execute_confirmed_plan(&PlanId::from("pln_20240101_000000000_abcdef"))
        .await;
    assert!(result.is_error(ErrorCode::PlanNotFound));
    assert!(router.recent_audit(10, 0).unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_tool_writes_no_audit() {
    let router = router_with(vec![reader()], TierPolicy::default());
    let outcome = router.execute("rm_rf", &json!({}), "s1", false).await;

    assert!(outcome.result.is_error(ErrorCode::ToolNotFound));
    assert_eq!(outcome.state, InvocationState::Rejected);
    assert!(router.plans().is_empty());
    assert!(router.recent_audit(10, 0).unwrap().is_empty());
}

#[tokio::test]
async fn test_explicit_dry_run_creates_no_plan() {
    let tool = mover();
    let router = router_with(vec![tool.clone()], TierPolicy::default());

    let outcome = router
        .execute("mover", &json!({"target": "x"}), "s1", true)
        .await;
    assert!(outcome.result.ok);
    assert_eq!(outcome.state, InvocationState::Previewed);
    assert!(outcome.plan_id.is_none());
    assert!(router.plans().is_empty());
    assert_eq!(tool.runs(), 0);
    assert_eq!(
        router.recent_audit(1, 0).unwrap()[0].action,
        AuditAction::DryRun
    );
}

#[tokio::test]
async fn test_dry_run_unsupported() {
    let router = router_with(vec![reader()], TierPolicy::default());
    let outcome = router
        .execute("reader", &json!({"target": "x"}), "s1", true)
        .await;
    assert!(outcome.result.is_error(ErrorCode::DryRunNotSupported));
}

#[tokio::test]
async fn test_failed_preview_creates_no_plan() {
    let tool = mover();
    let router = router_with(vec![tool.clone()], TierPolicy::default());

    let outcome = router.execute("mover", &json!({"target": 7}), "s1", false).await;
    assert!(outcome.result.is_error(ErrorCode::InvalidArguments));
    assert_eq!(outcome.state, InvocationState::Rejected);
    assert!(outcome.plan_id.is_none());
    assert!(router.plans().is_empty());
}

#[tokio::test]
async fn test_tier_above_policy_is_refused() {
    let installer = ScriptedTool::new(
        ToolSpec::new("installer", "Installs", json!({}))
            .with_tier(Tier::SystemChange)
            .with_confirmation(),
    );
    let router = router_with(
        vec![installer.clone()],
        TierPolicy::new(Tier::WriteSafe, Tier::SystemChange),
    );

    let outcome = router
        .execute("installer", &json!({"target": "htop"}), "s1", false)
        .await;
    assert!(outcome.result.is_error(ErrorCode::TierNotPermitted));
    assert_eq!(installer.previews(), 0);
    assert!(router.plans().is_empty());

    let audit = router.recent_audit(1, 0).unwrap().remove(0);
    assert_eq!(audit.event_type, AuditEvent::PolicyDenied);
    assert_eq!(audit.action, AuditAction::Deny);
    assert_eq!(audit.tier, Some(Tier::SystemChange));
}

#[tokio::test]
async fn test_confirm_from_tier_without_dry_run() {
    let writer = ScriptedTool::new(
        ToolSpec::new("writer", "Writes", json!({})).with_tier(Tier::WriteSafe),
    );
    let router = router_with(
        vec![writer.clone()],
        TierPolicy::new(Tier::SystemChange, Tier::WriteSafe),
    );

    let outcome = router
        .execute("writer", &json!({"target": "a"}), "s1", false)
        .await;
    assert_eq!(outcome.state, InvocationState::PendingConfirmation);
    assert_eq!(writer.previews(), 0);
    assert_eq!(writer.runs(), 0);

    let result = router
        .execute_confirmed_plan(&outcome.plan_id.unwrap())
        .await;
    assert!(result.ok);
    assert_eq!(writer.runs(), 1);
}

#[tokio::test]
async fn test_panicking_tool_is_contained() {
    let router = router_with(
        vec![ScriptedTool::panicking(ToolSpec::new(
            "fragile",
            "Panics",
            json!({"type": "object"}),
        ))],
        TierPolicy::default(),
    );

    let outcome = router.execute("fragile", &json!({}), "s1", false).await;
    assert!(outcome.result.is_error(ErrorCode::NativeToolError));

    let audit = router.recent_audit(1, 0).unwrap().remove(0);
    assert_eq!(audit.result.unwrap()["error_code"], "native_tool_error");
}

#[tokio::test]
async fn test_cancel_plan() {
    let tool = mover();
    let router = router_with(vec![tool.clone()], TierPolicy::default());
    let plan_id = router
        .execute("mover", &json!({"target": "x"}), "s1", false)
        .await
        .plan_id
        .unwrap();

    let cancelled = router.cancel_plan(&plan_id);
    assert!(cancelled.ok);
    let audit = router.recent_audit(1, 0).unwrap().remove(0);
    assert_eq!(audit.event_type, AuditEvent::PlanCancelled);
    assert_eq!(audit.action, AuditAction::Cancel);
    assert_eq!(audit.tool_name.as_deref(), Some("mover"));

    let confirm = router.execute_confirmed_plan(&plan_id).await;
    assert!(confirm.is_error(ErrorCode::PlanNotFound));
    assert!(router.cancel_plan(&plan_id).is_error(ErrorCode::PlanNotFound));
    assert_eq!(tool.runs(), 0);
}

#[tokio::test]
async fn test_cancel_after_execution() {
    let router = router_with(vec![mover()], TierPolicy::default());
    let plan_id = router
        .execute("mover", &json!({"target": "x"}), "s1", false)
        .await
        .plan_id
        .unwrap();
    router.execute_confirmed_plan(&plan_id).await;

    assert!(router
        .cancel_plan(&plan_id)
        .is_error(ErrorCode::PlanAlreadyExecuted));
}

#[tokio::test]
async fn test_audit_failure_does_not_change_result() {
    let tool = reader();
    let mut registry = ToolRegistry::new();
    registry.register(tool.clone()).unwrap();
    let router = ToolRouter::new(
        Arc::new(registry),
        Arc::new(PlanStore::default()),
        Arc::new(BrokenAudit),
        TierPolicy::default(),
    );

    let outcome = router
        .execute("reader", &json!({"target": "x"}), "s1", false)
        .await;
    assert!(outcome.result.ok);
    assert_eq!(tool.runs(), 1);
}

#[tokio::test]
async fn test_alias_resolves_through_router() {
    let ws = workspace();
    let outcome = ws.router.execute("ps", &json!({}), "s1", false).await;
    assert!(outcome.result.ok, "{:?}", outcome.result);
    assert_eq!(ws.sandbox.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        ws.router.recent_audit(1, 0).unwrap()[0].tool_name.as_deref(),
        Some("ps_command")
    );
}

#[tokio::test]
async fn test_apt_install_outside_write_roots_never_spawns() {
    let ws = workspace();
    let outcome = ws
        .router
        .execute(
            "apt_install",
            &json!({"package": "htop", "work_dir": "/etc"}),
            "s1",
            false,
        )
        .await;

    assert!(outcome.result.is_error(ErrorCode::AccessDenied), "{:?}", outcome.result);
    assert!(outcome.plan_id.is_none());
    assert!(ws.router.plans().is_empty());
    assert_eq!(ws.sandbox.calls.load(Ordering::SeqCst), 0);

    let audit = ws.router.recent_audit(1, 0).unwrap().remove(0);
    assert_eq!(audit.event_type, AuditEvent::AccessDenied);
}

#[tokio::test]
async fn test_apt_install_local_package_outside_roots_never_spawns() {
    let ws = workspace();
    let outcome = ws
        .router
        .execute("apt_install", &json!({"package": "/var/tmp/x.deb"}), "s1", false)
        .await;

    assert!(outcome.result.is_error(ErrorCode::AccessDenied), "{:?}", outcome.result);
    assert!(outcome.plan_id.is_none());
    assert!(ws.router.plans().is_empty());
    assert_eq!(ws.sandbox.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_apt_install_confirmed_runs_once() {
    let ws = workspace();
    let debs = ws.base.join("debs");
    let outcome = ws
        .router
        .execute(
            "apt_install",
            &json!({"package": "htop", "work_dir": debs.to_str().unwrap()}),
            "s1",
            false,
        )
        .await;
    assert_eq!(outcome.state, InvocationState::PendingConfirmation);
    assert_eq!(
        outcome.summary.as_deref(),
        Some("Tool 'apt_install' will perform: Would execute: /usr/bin/sudo -n apt-get install -y htop")
    );
    assert_eq!(ws.sandbox.calls.load(Ordering::SeqCst), 0);

    let result = ws
        .router
        .execute_confirmed_plan(&outcome.plan_id.unwrap())
        .await;
    assert!(result.ok, "{:?}", result);
    assert_eq!(ws.sandbox.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        ws.sandbox.argv.lock().unwrap()[0],
        vec!["/usr/bin/sudo", "-n", "apt-get", "install", "-y", "htop"]
    );
}

#[tokio::test]
async fn test_organize_photos_plan_then_confirm() {
    let ws = workspace();
    let inbox = ws.base.join("inbox");
    let organized = ws.base.join("organized");
    fs::write(inbox.join("a.jpg"), b"a").unwrap();
    fs::write(inbox.join("b.png"), b"b").unwrap();
    let args = json!({
        "input_dir": inbox.to_str().unwrap(),
        "output_dir": organized.to_str().unwrap(),
    });

    let outcome = ws.router.execute("organize_photos", &args, "s1", false).await;
    assert_eq!(outcome.state, InvocationState::PendingConfirmation);
    assert_eq!(outcome.result.data.as_ref().unwrap()["total_photos"], 2);
    assert!(inbox.join("a.jpg").exists());

    let plan_id = outcome.plan_id.unwrap();
    let result = ws.router.execute_confirmed_plan(&plan_id).await;
    assert!(result.ok, "{:?}", result);
    assert_eq!(result.data.unwrap()["moved"], 2);
    assert!(!inbox.join("a.jpg").exists());

    let again = ws.router.execute_confirmed_plan(&plan_id).await;
    assert!(again.is_error(ErrorCode::PlanAlreadyExecuted));
}

#[tokio::test]
async fn test_parse_then_execute() {
    let tool = reader();
    let router = router_with(vec![tool.clone()], TierPolicy::default());
    let reply = "Let me look.\n```json\n{\"tool\": \"reader\", \"args\": {\"target\": \"/srv\"}}\n```";

    let invocation = ToolRouter::parse_invocation(reply).unwrap();
    let outcome = router
        .execute(&invocation.tool_name, &invocation.args_value(), "s1", false)
        .await;
    assert!(outcome.result.ok);
    assert_eq!(tool.runs(), 1);
}
