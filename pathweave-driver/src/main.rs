// SPDX-License-Identifier: Apache-2.0

//! Command line driver that runs a pathweave search with an external path
//! resolver and an external test generator.
//!
//! Sample usage:
//!
//! ```shell
//! $ pathweave --seeds seeds.txt \
//!     --resolver "resolve-paths --classpath build" \
//!     --generator "generate-tests --classpath build" \
//!     --timeout-secs 300 --tests-out generated.jsonl
//! ```
//!
//! Settings not given on the command line come from `--config`, or from
//! `pathweave.toml` in the working directory when present.

mod corpus;
mod driver_config;
mod process;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pathweave::SearchPipeline;

use crate::driver_config::{default_config_path, DriverConfig, Overrides};
use crate::process::{ProcessCollaborator, ProcessGenerator, ProcessResolver};

#[derive(Debug, Parser)]
#[command(name = "pathweave")]
#[command(version)]
#[command(about = "Two-stage path search with external resolver and generator processes")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Newline-delimited seed tests; each non-empty line is one payload.
    #[arg(long)]
    seeds: PathBuf,

    /// Path resolver command line, e.g. "resolve-paths --flag". Overrides
    /// `[resolver]` in the config. Split on whitespace without quoting; put
    /// arguments that contain spaces in the config's `args` list instead.
    #[arg(long)]
    resolver: Option<String>,

    /// Test generator command line. Overrides `[generator]` in the config.
    /// Split on whitespace like `--resolver`.
    #[arg(long)]
    generator: Option<String>,

    /// Global time budget for the search, in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Worker threads per stage.
    #[arg(long)]
    workers: Option<usize>,

    /// Append generated tests to this file as JSON lines.
    #[arg(long)]
    tests_out: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let args = Args::parse();
    log::info!("pathweave starting; version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = DriverConfig::load(config_path.as_deref())?;
    config.apply(&Overrides {
        resolver: args.resolver.clone(),
        generator: args.generator.clone(),
        timeout_secs: args.timeout_secs,
        workers: args.workers,
    });
    config.search.validate()?;

    let resolver_command = config.resolver.as_ref().ok_or_else(|| {
        anyhow::anyhow!("no resolver command; pass --resolver or set [resolver] in the config")
    })?;
    let generator_command = config.generator.as_ref().ok_or_else(|| {
        anyhow::anyhow!("no generator command; pass --generator or set [generator] in the config")
    })?;
    let resolver = ProcessResolver::new(ProcessCollaborator::locate("resolver", resolver_command)?);
    let generator = ProcessGenerator::new(
        ProcessCollaborator::locate("generator", generator_command)?,
        config.kill_grace(),
    );

    let seeds = corpus::read_seeds(&args.seeds)?;
    if seeds.is_empty() {
        log::warn!("{} contains no seeds; nothing to search", args.seeds.display());
    }

    let pipeline = SearchPipeline::new(
        config.search.clone(),
        Arc::new(resolver),
        Arc::new(generator),
    )?;
    {
        let abort = pipeline.abort_handle();
        ctrlc::set_handler(move || {
            abort.abort();
        })?;
    }

    let report = pipeline.run(seeds)?;
    if let Some(tests_out) = &args.tests_out {
        corpus::append_tests(tests_out, &report.tests)?;
    }
    println!("{}", report);
    Ok(())
}
