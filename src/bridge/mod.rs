pub mod identify;
pub mod payload;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::app::{Dispatcher, FinishReason, InferenceRequest, TokenEvent, TokenStream};
use crate::core::{Event, EventBus, LoaderRegistry, LoggingHandler, ModelManager};
use crate::downloader::Downloader;
use crate::envconfig::EnvConfig;
use crate::error::{CoreError, Result};
use identify::Identification;
use payload::{CancelArgs, DownloadArgs, GenerateArgs, HandleArgs, IdentifyArgs, LoadModelArgs, NoArgs, TokenPayload};

pub use payload::error_payload;

pub const TOKEN_EVENT: &str = "token";
pub const DOWNLOAD_PROGRESS_EVENT: &str = "downloadProgress";

const CLEANUP_GRACE: Duration = Duration::from_secs(5);

/// Receives events pushed to the embedding UI.
#[async_trait]
pub trait HostSink: Send + Sync {
    async fn notify(&self, event: &str, payload: Value);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    LoadModel,
    Generate,
    Cancel,
    UnloadModel,
    IsModelReady,
    DownloadModel,
    GetDownloadProgress,
    Cleanup,
    IdentifyObject,
}

static OPERATIONS: Lazy<HashMap<&'static str, Operation>> =
    Lazy::new(|| Operation::ALL.iter().map(|op| (op.name(), *op)).collect());

impl Operation {
    pub const ALL: [Operation; 9] = [
        Operation::LoadModel,
        Operation::Generate,
        Operation::Cancel,
        Operation::UnloadModel,
        Operation::IsModelReady,
        Operation::DownloadModel,
        Operation::GetDownloadProgress,
        Operation::Cleanup,
        Operation::IdentifyObject,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::LoadModel => "loadModel",
            Operation::Generate => "generate",
            Operation::Cancel => "cancel",
            Operation::UnloadModel => "unloadModel",
            Operation::IsModelReady => "isModelReady",
            Operation::DownloadModel => "downloadModel",
            Operation::GetDownloadProgress => "getDownloadProgress",
            Operation::Cleanup => "cleanup",
            Operation::IdentifyObject => "identifyObject",
        }
    }

    pub fn from_name(name: &str) -> Option<Operation> {
        OPERATIONS.get(name).copied()
    }
}

/// Host-facing adapter: decodes operation payloads, calls into the core and
/// pushes streamed output to the host sink.
pub struct Bridge {
    models: Arc<ModelManager>,
    dispatcher: Arc<Dispatcher>,
    downloader: Arc<Downloader>,
    sink: Arc<dyn HostSink>,
}

impl Bridge {
    pub fn new(dispatcher: Arc<Dispatcher>, downloader: Arc<Downloader>, sink: Arc<dyn HostSink>) -> Self {
        Self {
            models: Arc::clone(dispatcher.models()),
            dispatcher,
            downloader,
            sink,
        }
    }

    /// Wires up the default loaders, manager, dispatcher and downloader.
    pub fn from_config(config: &EnvConfig, sink: Arc<dyn HostSink>) -> Self {
        let events = Arc::new(EventBus::new());
        events.subscribe(LoggingHandler);

        let models = ModelManager::new(Arc::new(LoaderRegistry::with_defaults()), &config.models_dir)
            .memory_budget(config.memory_budget)
            .events(events);
        let dispatcher = Dispatcher::new(Arc::new(models), config.dispatcher());
        let downloader = Downloader::new(&config.models_dir);

        Self::new(Arc::new(dispatcher), Arc::new(downloader), sink)
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn invoke(&self, method: &str, args: Value) -> Result<Value> {
        let op = Operation::from_name(method)
            .ok_or_else(|| CoreError::Protocol(format!("unknown operation: {}", method)))?;
        tracing::debug!("Invoking {}", op.name());

        match op {
            Operation::LoadModel => {
                let args: LoadModelArgs = decode(op, args)?;
                let models = Arc::clone(&self.models);
                let handle = blocking(move || models.load(args.model_path, args.config)).await?;
                Ok(json!({ "handleId": handle }))
            }
            Operation::Generate => {
                let args: GenerateArgs = decode(op, args)?;
                let request = InferenceRequest::new(args.handle_id, args.prompt).params(args.params);
                let stream = self.dispatcher.submit(request).await?;
                let request_id = stream.request_id();
                tokio::spawn(forward_tokens(stream, Arc::clone(&self.sink)));
                Ok(json!({ "requestId": request_id }))
            }
            Operation::Cancel => {
                let args: CancelArgs = decode(op, args)?;
                Ok(json!({ "cancelled": self.dispatcher.cancel(args.request_id) }))
            }
            Operation::UnloadModel => {
                let args: HandleArgs = decode(op, args)?;
                let models = Arc::clone(&self.models);
                blocking(move || models.unload(args.handle_id)).await?;
                Ok(json!({ "success": true }))
            }
            Operation::IsModelReady => {
                let args: HandleArgs = decode(op, args)?;
                Ok(json!({ "ready": self.models.is_ready(args.handle_id) }))
            }
            Operation::DownloadModel => {
                let args: DownloadArgs = decode(op, args)?;
                self.download(args).await
            }
            Operation::GetDownloadProgress => {
                let _: NoArgs = decode(op, args)?;
                encode(op, self.downloader.progress())
            }
            Operation::Cleanup => {
                let _: NoArgs = decode(op, args)?;
                self.cleanup().await;
                Ok(json!({ "success": true }))
            }
            Operation::IdentifyObject => {
                let args: IdentifyArgs = decode(op, args)?;
                let identification = self.identify(args).await?;
                encode(op, identification)
            }
        }
    }

    /// Runs one generation to completion and reads an identification out of
    /// the answer. Tokens are not pushed to the host.
    async fn identify(&self, args: IdentifyArgs) -> Result<Identification> {
        let prompt = identify::build_prompt(
            args.prompt.as_deref().unwrap_or(identify::DEFAULT_PROMPT),
            args.observations.as_deref(),
        );
        let stream = self
            .dispatcher
            .submit(InferenceRequest::new(args.handle_id, prompt).params(args.params))
            .await?;
        let request_id = stream.request_id();

        let events: Vec<TokenEvent> = stream.collect().await;
        let answer: String = events.iter().map(|e| e.fragment.as_str()).collect();
        match events.last().and_then(|e| e.finish_reason) {
            Some(FinishReason::StopSequence) | Some(FinishReason::MaxTokens) => {}
            Some(FinishReason::Cancelled) => {
                return Err(CoreError::Runtime(format!("identification {} was cancelled", request_id)));
            }
            Some(FinishReason::Error) | None => {
                let reason = events
                    .last()
                    .and_then(|e| e.error.clone())
                    .unwrap_or_else(|| "generation ended without a result".to_string());
                return Err(CoreError::Runtime(reason));
            }
        }

        if answer.trim().is_empty() {
            return Err(CoreError::Runtime("model returned an empty answer".into()));
        }
        tracing::debug!("Identification {} answered with {} chars", request_id, answer.len());
        Ok(Identification::parse(&answer))
    }

    async fn download(&self, args: DownloadArgs) -> Result<Value> {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let sink = Arc::clone(&self.sink);
        let events = Arc::clone(self.models.event_bus());
        let url = args.model_url.clone();

        let forward = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                events.publish(Event::DownloadProgress { url: url.clone(), progress });
                let status = if progress >= 100 { "completed" } else { "downloading" };
                sink.notify(DOWNLOAD_PROGRESS_EVENT, json!({ "progress": progress, "status": status }))
                    .await;
            }
        });

        let result = self
            .downloader
            .download(&args.model_url, args.file_name.as_deref(), args.sha256.as_deref(), move |p| {
                let _ = tx.send(p);
            })
            .await;
        // Progress events go out before the result.
        let _ = forward.await;

        let path = result?;
        Ok(json!({
            "success": true,
            "progress": 100,
            "path": path.to_string_lossy(),
        }))
    }

    /// Cancels every session, waits briefly for workers to drain, then
    /// unloads every model.
    async fn cleanup(&self) {
        let cancelled = self.dispatcher.cancel_all();
        let deadline = Instant::now() + CLEANUP_GRACE;
        while self.dispatcher.active_sessions() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let models = Arc::clone(&self.models);
        let (unloaded, busy) = match tokio::task::spawn_blocking(move || models.shutdown()).await {
            Ok(counts) => counts,
            Err(e) => {
                tracing::warn!("Cleanup worker failed: {}", e);
                (0, 0)
            }
        };
        tracing::info!(
            "Cleanup: cancelled {} session(s), unloaded {} model(s), {} still busy",
            cancelled,
            unloaded,
            busy
        );
    }
}

fn encode<T: Serialize>(op: Operation, value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| CoreError::Runtime(format!("{} result: {}", op.name(), e)))
}

fn decode<T: DeserializeOwned>(op: Operation, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| CoreError::Protocol(format!("{}: {}", op.name(), e)))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CoreError::Runtime(format!("worker task failed: {}", e)))?
}

async fn forward_tokens(mut stream: TokenStream, sink: Arc<dyn HostSink>) {
    while let Some(event) = stream.next().await {
        match serde_json::to_value(TokenPayload::new(&event)) {
            Ok(payload) => sink.notify(TOKEN_EVENT, payload).await,
            Err(e) => tracing::warn!("Dropping unserializable token event: {}", e),
        }
    }
}
