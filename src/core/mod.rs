pub mod events;
pub mod model;
pub mod runtime;
pub mod tokenizer;

pub use events::{Event, EventBus, EventHandler, LoggingHandler};
pub use model::{HandleId, HandleInfo, LoadConfig, ModelLease, ModelManager, ModelMeta, ModelState, Quantization};
pub use runtime::{LoaderRegistry, Runtime, RuntimeFault, RuntimeLoader, TokenId};
pub use tokenizer::{Tokenizer, TokenizerKind, Vocabulary};
