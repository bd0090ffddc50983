//! Command execution: build the engine and drive one operator request

use crate::error::{CliError, Result};
use crate::estimate::Estimate;
use crate::progress::ProgressDisplay;
use crate::summary::{exit_code, render_summary};
use crate::token::resolve_api_token;
use crate::Cli;
use std::sync::Arc;
use tessera_engine::aws::AwsConnector;
use tessera_engine::memory::{MemoryBackend, MemoryConnector};
use tessera_engine::{
    Backend, Engine, EngineSettings, HttpBackend, HttpBackendOptions, JobConfig, JobId,
    PluginRegistry, ResourceConnector,
};
use tracing::{info, warn};

/// Ask a yes/no question unless `force` is set. A dismissed prompt counts as no.
pub fn confirm(prompt: &str, force: bool) -> Result<bool> {
    if force {
        return Ok(true);
    }
    match inquire::Confirm::new(prompt).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(
            inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted,
        ) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn build_engine(cli: &Cli, config: &JobConfig, settings: EngineSettings) -> Result<Engine> {
    let (backend, connector): (Arc<dyn Backend>, Arc<dyn ResourceConnector>) = if cli.local {
        let backend = Arc::new(MemoryBackend::new());
        let connector = Arc::new(MemoryConnector::new(backend.clone()));
        (backend as Arc<dyn Backend>, connector as Arc<dyn ResourceConnector>)
    } else {
        let token = resolve_api_token(cli.api_token.as_deref())?;
        let options = HttpBackendOptions {
            request_timeout: settings.network_timeout,
            ..HttpBackendOptions::default()
        };
        let backend = Arc::new(HttpBackend::new(&config.client.backend, &token, options)?);
        let connector = Arc::new(AwsConnector::new(&settings));
        (backend as Arc<dyn Backend>, connector as Arc<dyn ResourceConnector>)
    };
    Ok(Engine::new(settings, backend, connector, PluginRegistry::with_builtins())?)
}

/// Stop workers on Ctrl-C. The job itself stays resumable.
fn install_interrupt_handler(engine: &Engine) {
    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping upload workers");
            eprintln!("\nStopping workers. The job is not cancelled and can be resumed with --job-id.");
            shutdown.cancel();
        }
    });
}

/// Run the request described by `cli` and return the process exit code
pub async fn execute(cli: &Cli) -> Result<i32> {
    let config_path = cli
        .config_file
        .as_ref()
        .ok_or_else(|| CliError::usage("an ingest job configuration file is required"))?;
    let config = JobConfig::from_file(config_path)?;
    let settings = cli.apply_overrides(EngineSettings::from_env()?);
    let engine = build_engine(cli, &config, settings)?;
    info!(
        config = %config_path.display(),
        local = cli.local,
        workers = engine.settings().worker_count,
        "Tessera starting"
    );

    if cli.cancel {
        return cancel(cli, &engine).await;
    }
    if cli.complete {
        return complete(cli, &engine).await;
    }
    upload(cli, &engine, &config).await
}

fn required_job_id(cli: &Cli, flag: &str) -> Result<JobId> {
    cli.job_id()
        .ok_or_else(|| CliError::usage(format!("{flag} requires --job-id")))
}

async fn cancel(cli: &Cli, engine: &Engine) -> Result<i32> {
    let job_id = required_job_id(cli, "--cancel")?;
    if !confirm(&format!("Are you sure you want to cancel ingest job {job_id}?"), cli.force)? {
        println!("Command ignored. Job not cancelled.");
        return Ok(0);
    }
    engine.cancel(&job_id).await?;
    println!("Ingest job {job_id} successfully cancelled.");
    Ok(0)
}

async fn complete(cli: &Cli, engine: &Engine) -> Result<i32> {
    let job_id = required_job_id(cli, "--complete")?;
    engine.complete_manually(&job_id).await?;
    println!("Ingest job {job_id} complete.");
    Ok(0)
}

async fn upload(cli: &Cli, engine: &Engine, config: &JobConfig) -> Result<i32> {
    let job = match cli.job_id() {
        Some(job_id) => {
            if !confirm(&format!("Are you sure you want to resume ingest job {job_id}?"), cli.force)? {
                println!("Exiting");
                return Ok(0);
            }
            engine.join(&job_id).await?
        },
        None => {
            println!("{}\n", Estimate::from_config(config)?);
            if !confirm("Would you like to create a NEW ingest job?", cli.force)? {
                println!("Exiting");
                return Ok(0);
            }
            let job = engine.create(config).await?;
            println!("Created ingest job {}", job.id);
            if !confirm("Do you want to start uploading now?", cli.force)? {
                println!(
                    "OK - Your job is waiting for you. You can resume by providing ingest job id '{}' to the client.",
                    job.id
                );
                return Ok(0);
            }
            job
        },
    };

    install_interrupt_handler(engine);
    let display = ProgressDisplay::spawn(engine.subscribe_progress(), job.expected_units);
    let result = engine.run(config, Some(&job.id)).await;
    display.finish();

    let summary = result?;
    println!("{}", render_summary(&summary));
    Ok(exit_code(&summary))
}
