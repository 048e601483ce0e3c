//! writer: write a string to a file, replacing any previous contents.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "writer")]
#[command(version = "0.1.0")]
#[command(about = "Writes a text string to a file", long_about = None)]
struct Args {
    /// File path
    writefile: PathBuf,

    /// Text string that will be written to the file
    writestr: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match std::fs::write(&args.writefile, &args.writestr) {
        Ok(()) => {
            debug!(path = %args.writefile.display(), text = %args.writestr, "Wrote file");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(path = %args.writefile.display(), error = %e, "Could not write file");
            ExitCode::FAILURE
        }
    }
}
