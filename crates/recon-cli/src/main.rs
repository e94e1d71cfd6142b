mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::exec::ExecArgs;
use commands::kill::KillArgs;
use commands::run::RunArgs;
use opts::WorkerOpts;

#[derive(Parser, Debug)]
#[command(name = "recon-worker", version, about = "Run recon tools in sandboxed worker containers")]
struct Cli {
    #[command(flatten)]
    opts: WorkerOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report runtime and worker image health
    Health,

    /// Run a command in a disposable container
    Run(RunArgs),

    /// Run commands one after another in a session container
    Exec(ExecArgs),

    /// List session containers present on the runtime
    Sessions,

    /// Force-kill every container belonging to a session key
    Kill(KillArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.opts);
    let opts = &cli.opts;

    match cli.command {
        Command::Health => commands::health::cmd_health(opts).await,
        Command::Run(args) => commands::run::cmd_run(opts, &args).await,
        Command::Exec(args) => commands::exec::cmd_exec(opts, &args).await,
        Command::Sessions => commands::sessions::cmd_sessions(opts).await,
        Command::Kill(args) => commands::kill::cmd_kill(opts, &args).await,
    }
}

fn setup_logging(opts: &WorkerOpts) {
    let default = if opts.quiet { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_collects_commands_and_env() {
        let cli = Cli::try_parse_from([
            "recon-worker",
            "--json",
            "exec",
            "--session",
            "scan-1",
            "--env",
            "TARGET=example.com",
            "cd /tmp",
            "pwd",
        ])
        .unwrap();
        assert!(cli.opts.json);
        match cli.command {
            Command::Exec(args) => {
                assert_eq!(args.session, "scan-1");
                assert_eq!(args.env, vec![("TARGET".to_owned(), "example.com".to_owned())]);
                assert_eq!(args.commands, vec!["cd /tmp".to_owned(), "pwd".to_owned()]);
                assert!(!args.keep);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn malformed_env_is_rejected() {
        let parsed = Cli::try_parse_from(["recon-worker", "exec", "--env", "NOVALUE", "id"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_accepts_a_per_command_timeout() {
        let cli = Cli::try_parse_from([
            "recon-worker",
            "run",
            "--tool",
            "nmap",
            "--timeout-ms",
            "5000",
            "nmap -sV example.com",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.timeout_ms, Some(5000));
                assert_eq!(args.tool, "nmap");
                assert_eq!(args.command, "nmap -sV example.com");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
