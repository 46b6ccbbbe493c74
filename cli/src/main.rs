//! Toolcall CLI - replays a chat turn's tool calls against the lifecycle engine.
//!
//! ```text
//! toolcall <scenario.jsonl | ->
//! ```
//!
//! Each line of the scenario is one [`scenario::Step`]. The run prints every
//! transition, the final state of each tool call and the registry views.
//! Logs go to `~/.toolcall/logs/toolcall.log`, filtered by `RUST_LOG`.

mod scenario;
mod simulated;

use std::{
    env,
    fs::{self, File, OpenOptions},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use toolcall_engine::LifecycleConfig;

use crate::scenario::Runner;

const USAGE: &str = "usage: toolcall <scenario.jsonl | ->";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let source = env::args().nth(1).context(USAGE)?;
    let config = load_config();
    let steps = scenario::parse(&read_scenario(&source)?)?;

    let mut runner = Runner::new(&config);
    let report = runner.run(steps).await?;
    print!("{report}");
    Ok(())
}

fn load_config() -> LifecycleConfig {
    match LifecycleConfig::load() {
        Ok(Some(config)) => config,
        Ok(None) => LifecycleConfig::default(),
        Err(err) => {
            tracing::warn!(path = %err.path().display(), "Using default config: {err}");
            LifecycleConfig::default()
        }
    }
}

fn read_scenario(source: &str) -> Result<String> {
    if source == "-" {
        let mut input = String::new();
        io::stdin()
            .read_to_string(&mut input)
            .context("failed to read scenario from stdin")?;
        return Ok(input);
    }
    fs::read_to_string(Path::new(source)).with_context(|| format!("failed to read {source}"))
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // stdout carries the report, so logs fall back to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.toolcall/logs/toolcall.log
    if let Some(config_path) = LifecycleConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("toolcall.log"));
    }

    candidates.push(PathBuf::from(".toolcall").join("logs").join("toolcall.log"));

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_falls_back_to_working_directory() {
        let candidates = log_file_candidates();
        assert_eq!(
            candidates.last(),
            Some(&PathBuf::from(".toolcall/logs/toolcall.log"))
        );
    }

    #[test]
    fn read_scenario_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("turn.jsonl");
        fs::write(&path, "{\"op\":\"stop\"}\n").unwrap();

        let input = read_scenario(path.to_str().unwrap()).unwrap();
        assert_eq!(scenario::parse(&input).unwrap().len(), 1);
    }

    #[test]
    fn read_scenario_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.jsonl");

        let err = read_scenario(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("failed to read"));
    }
}
