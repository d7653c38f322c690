//! Line-oriented loop: free text is scanned for a tool invocation, slash
//! commands manage plans and inspect the audit trail.

use anyhow::Result;
use serde::Serialize;
use std::io::{BufRead, Write};
use tiergate_core::{InvocationState, PlanId, RouterOutcome, ToolRouter};
use tiergate_tools::ToolResult;

const DEFAULT_AUDIT_LIMIT: usize = 10;

const HELP: &str = "\
Commands:
  /tools            List registered tools
  /plans            List plans waiting for confirmation
  /confirm <id>     Execute a pending plan
  /cancel <id>      Discard a pending plan
  /audit [n]        Show the n most recent audit records
  /help             Show this help
  /quit             Exit

Anything else is scanned for a {\"tool\": ..., \"args\": {...}} object.";

#[derive(Debug, PartialEq, Eq)]
pub enum ReplReply {
    Print(String),
    Quit,
}

pub struct Repl<'a> {
    router: &'a ToolRouter,
    session_id: String,
}

impl<'a> Repl<'a> {
    pub fn new(router: &'a ToolRouter, session_id: impl Into<String>) -> Self {
        Self {
            router,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn run<R: BufRead, W: Write>(&self, input: R, mut out: W) -> Result<()> {
        writeln!(out, "tiergate session {} (type /help for commands)", self.session_id)?;
        write!(out, "tiergate> ")?;
        out.flush()?;

        for line in input.lines() {
            match self.handle_line(&line?).await {
                ReplReply::Quit => break,
                ReplReply::Print(text) if text.is_empty() => {}
                ReplReply::Print(text) => writeln!(out, "{text}")?,
            }
            write!(out, "tiergate> ")?;
            out.flush()?;
        }
        writeln!(out)?;
        Ok(())
    }

    pub async fn handle_line(&self, line: &str) -> ReplReply {
        let line = line.trim();
        if line.is_empty() {
            return ReplReply::Print(String::new());
        }

        let Some(command) = line.strip_prefix('/') else {
            return ReplReply::Print(self.handle_text(line).await);
        };

        let mut parts = command.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();

        let text = match (name, arg) {
            ("quit" | "exit", _) => return ReplReply::Quit,
            ("help", _) => HELP.to_string(),
            ("tools", _) => pretty(&self.router.registry().capabilities()),
            ("plans", _) => self.list_plans(),
            ("confirm", Some(id)) => {
                let result = self.router.execute_confirmed_plan(&PlanId::from(id)).await;
                format_result(&result)
            }
            ("cancel", Some(id)) => format_result(&self.router.cancel_plan(&PlanId::from(id))),
            ("confirm" | "cancel", None) => format!("Usage: /{name} <plan_id>"),
            ("audit", limit) => self.show_audit(limit),
            _ => format!("Unknown command '/{name}'. Type /help for commands."),
        };
        ReplReply::Print(text)
    }

    async fn handle_text(&self, text: &str) -> String {
        let Some(invocation) = ToolRouter::parse_invocation(text) else {
            return "No tool invocation found. Send {\"tool\": \"<name>\", \"args\": {...}} or /help."
                .to_string();
        };

        let mut lines = Vec::new();
        if let Some(explain) = &invocation.explanation {
            lines.push(format!("# {explain}"));
        }
        let outcome = self
            .router
            .execute(&invocation.tool_name, &invocation.args_value(), &self.session_id, false)
            .await;
        lines.push(format_outcome(&outcome));
        lines.join("\n")
    }

    fn list_plans(&self) -> String {
        let pending = self.router.plans().pending_for_session(&self.session_id);
        if pending.is_empty() {
            return "No pending plans.".to_string();
        }
        pending
            .iter()
            .map(|plan| format!("{}  {}", plan.plan_id, plan.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn show_audit(&self, limit: Option<&str>) -> String {
        let limit = match limit.map(str::parse::<usize>) {
            None => DEFAULT_AUDIT_LIMIT,
            Some(Ok(n)) if n > 0 => n,
            Some(_) => return "Usage: /audit [n], n > 0".to_string(),
        };
        match self.router.recent_audit(limit, 0) {
            Ok(records) => pretty(&records),
            Err(e) => format!("Failed to read audit trail: {e}"),
        }
    }
}

pub fn format_outcome(outcome: &RouterOutcome) -> String {
    let mut text = format_result(&outcome.result);
    if outcome.state == InvocationState::PendingConfirmation {
        if let (Some(plan_id), Some(summary)) = (&outcome.plan_id, &outcome.summary) {
            text.push_str(&format!(
                "\n\n{summary}\nConfirm with: /confirm {plan_id}\nDiscard with: /cancel {plan_id}"
            ));
        }
    }
    text
}

pub fn format_result(result: &ToolResult) -> String {
    pretty(result)
}

fn pretty<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {e}>"))
}
