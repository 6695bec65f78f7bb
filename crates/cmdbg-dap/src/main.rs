use std::path::PathBuf;

use clap::Parser;
use cmdbg_dap::{ServerOptions, SessionEnd};
use miette::miette;

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: &str = "debug";
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "cmdbg-dap", version, about = "Debug adapter for list-file scripts")]
struct Cli {
    /// List file to run under the debugger
    script: PathBuf,

    /// Copy all DAP traffic into this file
    #[arg(long)]
    trace_file: Option<PathBuf>,

    /// Log filter used when CMDBG_LOG is not set
    #[arg(long, default_value = DEFAULT_LOG_LEVEL)]
    log_level: String,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let end = cmdbg_dap::start(ServerOptions {
        script: cli.script,
        trace_file: cli.trace_file,
        log_level: cli.log_level,
    })
    .map_err(|e| miette!(e.to_string()))?;

    if end
        == (SessionEnd::Disconnected {
            terminate_debuggee: true,
        })
    {
        // The script may still be running on the host thread.
        std::process::exit(0);
    }

    Ok(())
}
