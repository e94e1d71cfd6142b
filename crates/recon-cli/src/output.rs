//! Output helpers for human and JSON modes.
//!
//! JSON mode prints the serialized value on stdout and respects `--pretty`.
//! Human mode hands the value to a command-specific printer.

use anyhow::Result;
use serde::Serialize;

use crate::opts::WorkerOpts;

pub fn print_output<T, F>(opts: &WorkerOpts, value: &T, human: F) -> Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> Result<()>,
{
    if opts.pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    } else if opts.json {
        println!("{}", serde_json::to_string(value)?);
        Ok(())
    } else {
        human(value)
    }
}
