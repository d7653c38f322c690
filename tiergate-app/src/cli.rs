use anyhow::{bail, Context, Result};
use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: tiergate [--config <path>] <command>

Commands:
  tools                                   Print the tool catalog as JSON
  run <tool> [json-args] [options]        Execute one tool
      --session <id>                      Session id (default: random)
      --dry-run                           Preview only
      --yes                               Confirm a resulting plan immediately
  audit [--limit <n>] [--offset <n>]      Print recent audit records
  repl                                    Interactive loop (default)

The config file defaults to ./tiergate.toml or $TIERGATE_CONFIG.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Tools,
    Run {
        tool: String,
        args: Option<String>,
        session: Option<String>,
        dry_run: bool,
        yes: bool,
    },
    Audit {
        limit: usize,
        offset: usize,
    },
    Repl,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub config: Option<PathBuf>,
    pub command: Command,
}

fn value_of<'a>(flag: &str, rest: &mut impl Iterator<Item = &'a String>) -> Result<&'a String> {
    rest.next()
        .with_context(|| format!("{flag} requires a value"))
}

fn number_of<'a>(flag: &str, rest: &mut impl Iterator<Item = &'a String>) -> Result<usize> {
    let raw = value_of(flag, rest)?;
    raw.parse()
        .with_context(|| format!("{flag} expects a number, got '{raw}'"))
}

/// Parses `argv` without the program name.
pub fn parse_args(argv: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut positional: Vec<&String> = Vec::new();
    let mut session = None;
    let mut dry_run = false;
    let mut yes = false;
    let mut limit = 20;
    let mut offset = 0;

    let mut rest = argv.iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--config" | "-c" => config = Some(PathBuf::from(value_of(arg, &mut rest)?)),
            "--session" => session = Some(value_of(arg, &mut rest)?.clone()),
            "--dry-run" => dry_run = true,
            "--yes" | "-y" => yes = true,
            "--limit" => limit = number_of(arg, &mut rest)?,
            "--offset" => offset = number_of(arg, &mut rest)?,
            "--help" | "-h" => {
                return Ok(Cli {
                    config,
                    command: Command::Help,
                })
            }
            flag if flag.starts_with("--") => bail!("Unknown option '{flag}'"),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().map(String::as_str) {
        None | Some("repl") => Command::Repl,
        Some("tools") => Command::Tools,
        Some("audit") => Command::Audit { limit, offset },
        Some("help") => Command::Help,
        Some("run") => {
            let tool = positional
                .next()
                .context("run requires a tool name")?
                .clone();
            Command::Run {
                tool,
                args: positional.next().cloned(),
                session,
                dry_run,
                yes,
            }
        }
        Some(other) => bail!("Unknown command '{other}'"),
    };

    if let Some(extra) = positional.next() {
        bail!("Unexpected argument '{extra}'");
    }

    Ok(Cli { config, command })
}
