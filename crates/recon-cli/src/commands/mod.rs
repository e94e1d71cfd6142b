pub mod exec;
pub mod health;
pub mod kill;
pub mod run;
pub mod sessions;

use std::io::Write;

use anyhow::Result;
use recon_engine::ToolExecutionResult;

/// Human rendering of a tool result: raw output, then a status line on stderr.
pub(crate) fn print_result(result: &ToolExecutionResult) -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.write_all(result.stdout.as_bytes())?;
    stdout.flush()?;
    let mut stderr = std::io::stderr();
    stderr.write_all(result.stderr.as_bytes())?;
    let status = if result.timed_out {
        "timed out".to_owned()
    } else {
        match result.exit_code {
            Some(code) => format!("exit {code}"),
            None => "killed".to_owned(),
        }
    };
    let mut notes = vec![status, format!("{} ms", result.duration_ms())];
    if result.stdout_truncated || result.stderr_truncated {
        notes.push("output truncated".to_owned());
    }
    writeln!(stderr, "-- {}", notes.join(", "))?;
    Ok(())
}
