use anyhow::{bail, Context, Result};
use clap::Parser;
use llm_dispatch::admission::{Admission, AdmissionPolicy, RateLimiter, RequestMetadata};
use llm_dispatch::engine::{BatchInput, EngineBackend, LocalEngine, RemoteEngine, RemoteEngineConfig};
use llm_dispatch::error::EngineError;
use llm_dispatch::gpu::ImbalanceReport;
use llm_dispatch::scheduler::SchedulerStats;
use llm_dispatch::{GenerationRequest, InferenceEngine, ModelKey, Scheduler, SchedulerConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scheduler config file (JSON or YAML). Falls back to LLM_DISPATCH_CONFIG,
    /// then dispatch-config.json, then built-in defaults.
    #[arg(long)]
    config: Option<String>,

    /// Ollama-compatible service to forward batches to. Without it prompts are
    /// echoed back by an in-process engine.
    #[arg(long)]
    remote_url: Option<String>,

    /// Per-prompt timeout for the remote service, in seconds
    #[arg(long, default_value_t = 120)]
    remote_timeout: u64,

    #[arg(long)]
    model: String,

    #[arg(long)]
    revision: Option<String>,

    #[arg(long, default_value_t = 128)]
    max_tokens: usize,

    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Client identity used for rate limiting
    #[arg(long, default_value = "cli")]
    client_id: String,

    /// Apply the per-client rate limit (5 requests per minute)
    #[arg(long, default_value_t = false)]
    rate_limit: bool,

    /// Mirror logs to this file
    #[arg(long)]
    log_file: Option<String>,

    /// Prompts to dispatch
    #[arg(required = true)]
    prompts: Vec<String>,
}

#[derive(Serialize)]
struct PromptOutcome {
    request_id: Option<String>,
    prompt: String,
    output: Option<String>,
    error: Option<String>,
}

fn config_log(logger: ftail::Ftail, log_file: &str) -> Result<(), ftail::error::FtailError> {
    use tracing::log::LevelFilter;
    let mut cfg_filter = LevelFilter::Info;
    if let Ok(level) = std::env::var("RUST_LOG") {
        let log_level_names: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];
        let log_levels: [LevelFilter; 6] = [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        let level = level.to_uppercase();
        for (name, filter) in log_level_names.iter().zip(log_levels) {
            if level.contains(name) {
                cfg_filter = filter;
            }
        }
    }
    if std::path::Path::new(log_file).exists() {
        let _ = std::fs::remove_file(log_file);
    }
    logger
        .console(cfg_filter)
        .single_file(log_file, true, cfg_filter)
        .init()
}

fn build_engine(args: &Args) -> EngineBackend {
    match &args.remote_url {
        Some(url) => {
            info!("Using remote engine at {url}");
            RemoteEngine::new(
                RemoteEngineConfig::new(url.clone())
                    .with_timeout(Duration::from_secs(args.remote_timeout)),
            )
            .into()
        }
        None => {
            info!("No --remote-url given, using the in-process echo engine");
            let key = model_key(args);
            LocalEngine::new()
                .with_model(
                    key,
                    |input: &BatchInput| -> Result<Vec<String>, EngineError> {
                        Ok(input
                            .prompts
                            .iter()
                            .map(|p| format!("[{}] {}", input.model, p))
                            .collect())
                    },
                )
                .into()
        }
    }
}

fn build_report(
    outcomes: &[PromptOutcome],
    stats: &SchedulerStats,
    imbalance: Option<&ImbalanceReport>,
) -> serde_json::Value {
    serde_json::json!({
        "results": outcomes,
        "stats": stats,
        "imbalance": imbalance,
    })
}

fn model_key(args: &Args) -> ModelKey {
    match &args.revision {
        Some(rev) => ModelKey::with_revision(args.model.clone(), rev.clone()),
        None => ModelKey::new(args.model.clone()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    match &args.log_file {
        Some(log_file) => {
            if config_log(ftail::Ftail::new(), log_file).is_err() {
                bail!("failed to initialise file logging to {log_file}");
            }
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
        }
    }

    let config = SchedulerConfig::load(args.config.as_deref()).context("loading scheduler config")?;
    let engine: Arc<dyn InferenceEngine> = Arc::new(build_engine(&args));
    let scheduler = Scheduler::new(config, engine).context("building scheduler")?;

    let key = model_key(&args);
    let limiter = args.rate_limit.then(RateLimiter::default);
    let mut pending = Vec::with_capacity(args.prompts.len());
    for prompt in &args.prompts {
        if let Some(limiter) = &limiter {
            let verdict = limiter.check(&RequestMetadata::new(args.client_id.clone(), key.to_string()));
            if let Admission::Deny(reason) = verdict {
                warn!("Request denied: {reason}");
                pending.push((prompt.clone(), Err(reason)));
                continue;
            }
        }
        let request = GenerationRequest::prompt(prompt.clone())
            .with_max_tokens(args.max_tokens)
            .with_temperature(args.temperature);
        match scheduler.enqueue(key.clone(), request) {
            Ok(handle) => pending.push((prompt.clone(), Ok(handle))),
            Err(e) => pending.push((prompt.clone(), Err(e.to_string()))),
        }
    }

    let mut outcomes = Vec::with_capacity(pending.len());
    for (prompt, admitted) in pending {
        let outcome = match admitted {
            Ok(handle) => {
                let request_id = Some(handle.request_id().to_string());
                match handle.wait().await {
                    Ok(output) => PromptOutcome {
                        request_id,
                        prompt,
                        output: Some(output),
                        error: None,
                    },
                    Err(e) => PromptOutcome {
                        request_id,
                        prompt,
                        output: None,
                        error: Some(e.to_string()),
                    },
                }
            }
            Err(reason) => PromptOutcome {
                request_id: None,
                prompt,
                output: None,
                error: Some(reason),
            },
        };
        outcomes.push(outcome);
    }

    let imbalance = scheduler.imbalance_report();
    let stats = scheduler.stats();
    scheduler.shutdown().await;

    let report = build_report(&outcomes, &stats, imbalance.as_ref());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_carries_imbalance_next_to_stats() {
        let args = Args::parse_from(["llm-dispatch", "--model", "echo", "hello"]);
        let engine: Arc<dyn InferenceEngine> = Arc::new(build_engine(&args));
        let config = SchedulerConfig::default()
            .with_gpu_ids(vec![0, 1])
            .with_batch_interval(Duration::from_millis(10));
        let scheduler = Scheduler::new(config, engine).unwrap();
        let handle = scheduler
            .enqueue(model_key(&args), GenerationRequest::prompt("hello"))
            .unwrap();
        let output = handle.wait().await.unwrap();

        let outcomes = vec![PromptOutcome {
            request_id: Some(handle.request_id().to_string()),
            prompt: "hello".to_string(),
            output: Some(output),
            error: None,
        }];
        let imbalance = scheduler.imbalance_report();
        let report = build_report(&outcomes, &scheduler.stats(), imbalance.as_ref());

        assert_eq!(report["results"][0]["output"], "[echo] hello");
        assert_eq!(report["stats"]["load_balancer"]["total_requests"], 1);
        assert!(report["imbalance"].is_object());
        scheduler.shutdown().await;
    }
}
