pub mod dispatcher;
pub mod request;
pub mod stream;

pub use dispatcher::{Dispatcher, DispatcherConfig, OverloadPolicy, TokenStream};
pub use request::{GenerationParams, InferenceRequest, RequestId};
pub use stream::{FinishReason, GenerationSession, SessionControl, TokenEvent};
