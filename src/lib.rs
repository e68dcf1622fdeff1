pub mod app;
pub mod bridge;
pub mod core;
pub mod downloader;
pub mod envconfig;
pub mod error;
pub mod sample;

pub use app::{
    Dispatcher, DispatcherConfig, FinishReason, GenerationParams, InferenceRequest, OverloadPolicy, RequestId,
    TokenEvent, TokenStream,
};
pub use bridge::{Bridge, HostSink, Operation};
pub use core::{
    HandleId, LoadConfig, LoaderRegistry, ModelManager, ModelMeta, ModelState, Quantization, Runtime, RuntimeFault,
    RuntimeLoader, TokenId,
};
pub use downloader::{DownloadProgress, DownloadStatus, Downloader};
pub use envconfig::EnvConfig;
pub use error::{CoreError, Result};
