pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod repl;

pub use bootstrap::{build_registry, build_router, init_logging, open_audit};
pub use cli::{parse_args, Cli, Command};
pub use config::Config;
pub use repl::{Repl, ReplReply};
