//! `chainwatch replay`: run a block fixture through its pipelines.
//!
//! Fixture format (YAML or JSON):
//! ```yaml
//! description: witness on large blocks
//! blocks:
//!   - { number: 1, hash: "0x01", parent_hash: "0x00" }
//!   - { number: 2, hash: "0x02", parent_hash: "0x01" }
//! responses:
//!   - { method: get_dynamic_global_properties, result: { current_witness: gtg } }
//!   - { method: get_dynamic_global_properties, block: 2, error: "connection reset" }
//! pipelines:
//!   - name: witness
//!     block_number: 2          # optional gate
//!     provide:
//!       - { field: props, method: get_dynamic_global_properties }
//! ```
//!
//! Every response and provider defaults to the `core` API. A `headers`
//! pipeline delivering each block's raw header is always registered when a
//! `get_block_header` response exists.

use anyhow::{Context, Result};
use chainwatch_core::{
    BlockRef, Engine, EngineConfig, EngineMetrics, FetchClassifier, FetchRequest,
    MemoryBlockSource, Notification, Observer, CORE_API,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    description: Option<String>,
    blocks: Vec<BlockRef>,
    #[serde(default)]
    responses: Vec<ScriptedResponse>,
    #[serde(default)]
    pipelines: Vec<PipelineDef>,
    #[serde(default)]
    engine: Option<EngineConfig>,
}

#[derive(Debug, Deserialize)]
struct ScriptedResponse {
    #[serde(default = "core_api")]
    api: String,
    method: String,
    #[serde(default)]
    block: Option<u64>,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PipelineDef {
    name: String,
    #[serde(default)]
    block_number: Option<u64>,
    #[serde(default)]
    provide: Vec<ProvideDef>,
}

#[derive(Debug, Deserialize)]
struct ProvideDef {
    field: String,
    #[serde(default = "core_api")]
    api: String,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

fn core_api() -> String {
    CORE_API.to_string()
}

/// One line of replay output.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Event {
    Delivered { pipeline: String, block: u64, data: Value },
    Failed { pipeline: String, block: u64, stage: usize, error: String },
}

#[derive(Debug)]
struct Report {
    events: Vec<Event>,
    metrics: EngineMetrics,
}

pub async fn run(path: &Path, as_json: bool) -> Result<()> {
    let fixture = load(path)?;
    if let Some(description) = &fixture.description {
        if !as_json {
            println!("Replaying: {description}");
        }
    }

    let report = replay(fixture).await?;

    for event in &report.events {
        if as_json {
            println!("{}", serde_json::to_string(event)?);
            continue;
        }
        match event {
            Event::Delivered { pipeline, block, data } => {
                println!("✓ [{pipeline}] block #{block}: {data}");
            }
            Event::Failed { pipeline, block, stage, error } => {
                println!("✗ [{pipeline}] block #{block} stage {stage}: {error}");
            }
        }
    }

    let m = &report.metrics;
    if as_json {
        println!("{}", serde_json::to_string(m)?);
    } else {
        println!();
        println!("Blocks:       {} dispatched, {} skipped", m.blocks_dispatched, m.blocks_skipped);
        println!(
            "Evaluations:  {} delivered, {} skipped, {} failed",
            m.evaluations_delivered, m.evaluations_skipped, m.evaluations_failed
        );
        println!(
            "Classifiers:  {} computed, {} served from cache",
            m.classifier_computes, m.classifier_cache_hits
        );
    }
    Ok(())
}

fn load(path: &Path) -> Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read fixture '{}'", path.display()))?;
    parse(&raw, path.extension().and_then(|e| e.to_str()))
        .with_context(|| format!("invalid fixture '{}'", path.display()))
}

fn parse(raw: &str, extension: Option<&str>) -> Result<Fixture> {
    Ok(match extension {
        Some("json") => serde_json::from_str(raw)?,
        _ => serde_yaml::from_str(raw)?,
    })
}

async fn replay(fixture: Fixture) -> Result<Report> {
    let source = Arc::new(MemoryBlockSource::named("fixture"));
    let has_headers = fixture
        .responses
        .iter()
        .any(|r| r.api == CORE_API && r.method == "get_block_header");
    for response in fixture.responses {
        match (response.error, response.block) {
            (Some(reason), Some(block)) => source.fail_at(&response.api, &response.method, block, &reason),
            (Some(reason), None) => source.fail(&response.api, &response.method, &reason),
            (None, Some(block)) => source.respond_at(&response.api, &response.method, block, response.result),
            (None, None) => source.respond(&response.api, &response.method, response.result),
        }
    }

    let engine = Engine::builder(source.clone())
        .config(fixture.engine.unwrap_or_default())
        .build();
    let (observer, mut rx) = Observer::channel();

    if has_headers {
        engine
            .observe("headers")
            .on_block()
            .provide_block_header()
            .subscribe(observer.clone())?;
    }
    for def in fixture.pipelines {
        let mut builder = engine.observe(def.name.clone());
        if let Some(number) = def.block_number {
            builder = builder.on_block_number(number);
        }
        for provide in def.provide {
            let request = FetchRequest::new(provide.api, provide.method, provide.params);
            builder = builder.provide_classifier(provide.field, FetchClassifier::<Value>::new(request));
        }
        builder
            .subscribe(observer.clone())
            .with_context(|| format!("cannot register pipeline '{}'", def.name))?;
    }
    drop(observer);

    let mut previous: Option<&BlockRef> = None;
    for block in &fixture.blocks {
        if let Some(parent) = previous {
            if !block.extends(parent) {
                warn!(block = block.number, parent = parent.number, "fixture block does not extend its predecessor");
            }
        }
        source.push_block(block.clone());
        previous = Some(block);
    }
    source.close();

    engine.run().await.context("block stream failed")?;
    engine.flush().await;

    let mut events = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        events.push(match notification {
            Notification::Delivered(d) => Event::Delivered {
                pipeline: d.pipeline,
                block: d.block.number,
                data: Value::Object(d.data),
            },
            Notification::Failed(f) => Event::Failed {
                pipeline: f.pipeline,
                block: f.block.number,
                stage: f.stage,
                error: f.error.to_string(),
            },
        });
    }

    Ok(Report {
        events,
        metrics: engine.metrics(),
    })
}
