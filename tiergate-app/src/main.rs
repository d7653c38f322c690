use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io;
use std::process::ExitCode;
use tiergate_app::cli::USAGE;
use tiergate_app::{build_router, init_logging, parse_args, Command, Config, Repl};
use tiergate_core::{InvocationState, ToolRouter};
use uuid::Uuid;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &[String]) -> Result<ExitCode> {
    let cli = parse_args(args).context("Invalid command line (try --help)")?;
    if cli.command == Command::Help {
        println!("{USAGE}");
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::discover(cli.config.as_deref())?;
    init_logging(&config.logging);
    let router = build_router(&config)?;

    match cli.command {
        Command::Tools => {
            print_json(&router.registry().list_specs())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Audit { limit, offset } => {
            let records = router
                .recent_audit(limit, offset)
                .context("Failed to read audit trail")?;
            print_json(&records)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            tool,
            args,
            session,
            dry_run,
            yes,
        } => run_once(&router, &tool, args.as_deref(), session, dry_run, yes).await,
        Command::Repl => {
            let session = new_session_id();
            Repl::new(&router, session)
                .run(io::stdin().lock(), io::stdout())
                .await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Help => Ok(ExitCode::SUCCESS),
    }
}

async fn run_once(
    router: &ToolRouter,
    tool: &str,
    raw_args: Option<&str>,
    session: Option<String>,
    dry_run: bool,
    yes: bool,
) -> Result<ExitCode> {
    let args: Value = match raw_args {
        Some(raw) => serde_json::from_str(raw).context("Tool arguments must be valid JSON")?,
        None => json!({}),
    };
    if !args.is_object() {
        bail!("Tool arguments must be a JSON object");
    }
    let session = session.unwrap_or_else(new_session_id);

    let outcome = router.execute(tool, &args, &session, dry_run).await;
    print_json(&outcome)?;

    let mut ok = outcome.result.ok;
    if outcome.state == InvocationState::PendingConfirmation {
        match (&outcome.plan_id, yes) {
            (Some(plan_id), true) => {
                let confirmed = router.execute_confirmed_plan(plan_id).await;
                ok = confirmed.ok;
                print_json(&confirmed)?;
            }
            (Some(plan_id), false) => {
                eprintln!("Plan {plan_id} needs confirmation; rerun with --yes to execute.");
                // Plans are in-memory and do not outlive this process.
                router.cancel_plan(plan_id);
            }
            (None, _) => {}
        }
    }

    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn new_session_id() -> String {
    format!("cli_{}", Uuid::new_v4().simple())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
