//! Repository tasks for Tessera
//!
//! `cargo xtask cli-reference` renders the operator reference for the
//! `tessera` binary into `docs/cli-reference.md`. With `--check` it only
//! reports whether the committed reference has drifted from the clap
//! definitions.

use anyhow::{bail, Context};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};

const REFERENCE_FILE: &str = "cli-reference.md";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Keeps the tessera operator reference in sync with its flags", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Render docs/cli-reference.md from the tessera flag definitions
    #[command(visible_alias = "generate-cli-docs")]
    CliReference {
        /// Directory that holds the reference
        #[arg(short, long, default_value = "docs")]
        output_dir: PathBuf,

        /// Fail if the reference on disk is stale instead of rewriting it
        #[arg(long)]
        check: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::CliReference { output_dir, check } => cli_reference(&output_dir, check)?,
    }

    Ok(())
}

fn cli_reference(output_dir: &Path, check: bool) -> anyhow::Result<()> {
    let file_path = output_dir.join(REFERENCE_FILE);
    let content = render_reference();

    if check {
        let current = fs::read_to_string(&file_path)
            .with_context(|| format!("reading {}", file_path.display()))?;
        if current != content {
            bail!(
                "{} is stale; run `cargo xtask cli-reference`",
                file_path.display()
            );
        }
        println!("{} is up to date", file_path.display());
        return Ok(());
    }

    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    fs::write(&file_path, content).with_context(|| format!("writing {}", file_path.display()))?;
    println!("Wrote {}", file_path.display());
    Ok(())
}

fn render_reference() -> String {
    let markdown = clap_markdown::help_markdown::<tessera_cli::Cli>();

    format!(
        r#"# Tessera CLI Reference

## Overview

`tessera` uploads tiled or volumetric image data through an ingest job managed
by a remote ingest service. Work units are leased from a queue, rendered by the
configured plugins, written to object storage, and acknowledged. The job is
completed once the queue has drained and the service has counted every unit.

## Quick Start

```bash
# Preview the job and upload with 8 workers
tessera ingest.json --processes-nb 8

# Resume a job after an interruption
tessera ingest.json --job-id 1234

# Upload without automatic completion, then complete once every client is done
tessera ingest.json --job-id 1234 --manual-complete
tessera ingest.json --job-id 1234 --complete

# Cancel a job and discard its remaining work
tessera ingest.json --job-id 1234 --cancel

# Dry run against in-process queue, storage and backend
tessera ingest.json --local --force
```

## Commands

{markdown}

## Environment Variables

- `INTERN_TOKEN` - API token for the ingest service (falls back to `~/.intern/intern.cfg`)
- `TESSERA_WORKERS`, `TESSERA_RAMP_DELAY_MS`, `TESSERA_DRAIN_SAMPLES` and the other `TESSERA_*` variables - engine tuning
- `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_FILE` - logging

---

*Generated from the `tessera` flag definitions by `cargo xtask cli-reference`.*
"#
    )
}
