use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use gemma_bridge::app::{Dispatcher, GenerationParams, InferenceRequest};
use gemma_bridge::bridge::{error_payload, Bridge, HostSink};
use gemma_bridge::core::{EventBus, LoadConfig, LoaderRegistry, LoggingHandler, ModelManager};
use gemma_bridge::downloader::Downloader;
use gemma_bridge::envconfig::EnvConfig;
use gemma_bridge::CoreError;

pub struct RunOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub stop: Vec<String>,
    pub context_length: Option<usize>,
}

pub async fn run(config: &EnvConfig, model: &Path, prompt: &str, options: RunOptions) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(anyhow!("a prompt is required"));
    }

    let events = Arc::new(EventBus::new());
    events.subscribe(LoggingHandler);
    let models = Arc::new(
        ModelManager::new(Arc::new(LoaderRegistry::with_defaults()), &config.models_dir)
            .memory_budget(config.memory_budget)
            .events(events),
    );
    let dispatcher = Dispatcher::new(Arc::clone(&models), config.dispatcher());

    let mut load_config = LoadConfig::default();
    if let Some(len) = options.context_length {
        load_config = load_config.context_length(len);
    }
    let handle = {
        let models = Arc::clone(&models);
        let path = model.to_path_buf();
        tokio::task::spawn_blocking(move || models.load(path, load_config)).await??
    };

    let mut params = GenerationParams::default()
        .max_tokens(options.max_tokens)
        .temperature(options.temperature);
    params.seed = options.seed;
    params.stop = options.stop;

    let mut stream = dispatcher.submit(InferenceRequest::new(handle, prompt).params(params)).await?;
    let request_id = stream.request_id();

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                write!(stdout, "{}", event.fragment)?;
                stdout.flush()?;
                if event.is_final {
                    writeln!(stdout)?;
                    if let Some(error) = event.error {
                        return Err(anyhow!("generation failed: {}", error));
                    }
                    if let Some(reason) = event.finish_reason {
                        tracing::debug!("Finished: {}", reason.as_str());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                dispatcher.cancel(request_id);
            }
        }
    }

    let models = Arc::clone(&models);
    tokio::task::spawn_blocking(move || models.unload(handle)).await??;
    Ok(())
}

#[derive(Deserialize)]
struct HostCall {
    id: Value,
    method: String,
    #[serde(default)]
    args: Value,
}

/// Writes host events to stdout as `{"event", "payload"}` lines.
struct LineSink {
    out: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl HostSink for LineSink {
    async fn notify(&self, event: &str, payload: Value) {
        let _ = self.out.send(json!({ "event": event, "payload": payload }));
    }
}

pub async fn stdio(config: &EnvConfig) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let sink = Arc::new(LineSink { out: tx.clone() });
    let bridge = Arc::new(Bridge::from_config(config, sink));

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let line = message.to_string() + "\n";
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    tracing::info!("Bridge ready on stdio (models in {})", config.models_dir.display());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let call: HostCall = match serde_json::from_str(&line) {
            Ok(call) => call,
            Err(e) => {
                let err = CoreError::Protocol(e.to_string());
                let _ = tx.send(json!({ "id": Value::Null, "error": error_payload(&err) }));
                continue;
            }
        };

        let bridge = Arc::clone(&bridge);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = match bridge.invoke(&call.method, call.args).await {
                Ok(result) => json!({ "id": call.id, "result": result }),
                Err(err) => json!({ "id": call.id, "error": error_payload(&err) }),
            };
            let _ = tx.send(reply);
        });
    }

    // Host closed stdin.
    bridge.invoke("cleanup", Value::Null).await?;
    drop(tx);
    drop(bridge);
    writer.await.context("stdout writer")?;
    Ok(())
}

pub async fn pull(config: &EnvConfig, url: &str, file_name: Option<&str>, sha256: Option<&str>) -> Result<()> {
    let downloader = Downloader::new(&config.models_dir);

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% ({elapsed})")?
            .progress_chars("#>-"),
    );

    let result = downloader
        .download(url, file_name, sha256, |p| bar.set_position(p as u64))
        .await;
    bar.finish_and_clear();

    let path = result?;
    println!("Downloaded {}", path.display());
    Ok(())
}
