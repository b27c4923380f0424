// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::env;
use std::time::Instant;
use the_offload::batch::BatchRunner;
use the_offload::config::{load_and_validate_config, OffloadConfig, PipelineConfig, StageDefinition};
use the_offload::observability::init_tracing;
use the_offload::pipeline::Pipeline;
use the_offload::pool::{TaskOptions, WorkerPool};
use the_offload::traits::{from_fn, FunctionError};

fn integer(x: &Value) -> Result<i64, FunctionError> {
    x.as_i64()
        .ok_or_else(|| FunctionError::new(format!("expected an integer, got {}", x)))
}

fn register_demo_functions(pool: &WorkerPool) {
    pool.register("double", from_fn(|x: Value| Ok(json!(integer(&x)? * 2))));
    pool.register("add_one", from_fn(|x: Value| Ok(json!(integer(&x)? + 1))));
    pool.register("square", from_fn(|x: Value| Ok(json!(integer(&x)?.pow(2)))));
}

/// Pipeline used when the config file does not define one.
fn default_pipeline() -> PipelineConfig {
    let stage = |id: &str, function: &str| StageDefinition {
        id: id.to_string(),
        name: None,
        function: function.to_string(),
        max_retries: 0,
        retry_delay_ms: 0,
        timeout_ms: None,
        priority: None,
    };
    PipelineConfig {
        name: "numbers".to_string(),
        stop_on_error: true,
        stages: vec![stage("inc", "add_one"), stage("dbl", "double")],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        eprintln!("Usage: {} [config.yaml|config.toml]", args[0]);
        eprintln!("Example: {} configs/demo.yaml", args[0]);
        std::process::exit(1);
    }

    let config = match args.get(1) {
        Some(path) => load_and_validate_config(path).with_context(|| format!("loading {}", path))?,
        None => OffloadConfig::default(),
    };

    println!("🚀 Offload Demo");
    println!("═══════════════");
    println!("Max workers: {}", config.pool.max_workers);
    println!();

    let pool = WorkerPool::new(config.pool.clone())?;
    register_demo_functions(&pool);
    pool.initialize().await?;

    // Single call
    let started = Instant::now();
    let doubled = pool.execute("double", json!(21), TaskOptions::default()).await?;
    println!("📦 double(21) = {} ({:.2?})", doubled, started.elapsed());

    // Pipeline
    let pipeline_config = config.pipeline.clone().unwrap_or_else(default_pipeline);
    let pipeline = Pipeline::from_config(pool.clone(), &pipeline_config);
    let output = pipeline.run(json!(5)).await?;
    println!(
        "🔗 Pipeline '{}' over 5: stages {:?} -> {}",
        pipeline.name(),
        output.stage_results,
        output.output
    );

    // Batch
    let runner = match config.batch.function {
        Some(_) => BatchRunner::from_config(pool.clone(), &config.batch)?,
        None => BatchRunner::new(pool.clone(), "square").with_concurrency(2),
    };
    let batch = runner.run(vec![json!(1), json!(2), json!(3), json!(4)]).await;
    println!(
        "⚡ Batch '{}': {:?} (success rate {:.0}%)",
        runner.function_name(),
        batch.successful,
        batch.success_rate * 100.0
    );

    println!();
    println!("📊 Pipeline report:");
    println!("{}", serde_json::to_string_pretty(&pipeline.report())?);
    println!();
    println!("📈 Pool stats:");
    println!("{}", serde_json::to_string_pretty(&pool.get_stats())?);

    pool.terminate();
    println!("\n🎉 Demo complete!");
    Ok(())
}
