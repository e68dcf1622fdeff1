use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::model::HandleId;

pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Lifecycle notifications. Token output does not go through here; it flows
/// on each request's own stream.
#[derive(Debug, Clone)]
pub enum Event {
    ModelLoading { handle: HandleId, path: PathBuf },
    ModelLoaded { handle: HandleId, path: PathBuf },
    ModelUnloaded { handle: HandleId },
    ModelFaulted { handle: HandleId, reason: String },
    GenerationStarted { request_id: u64, handle: HandleId },
    GenerationFinished { request_id: u64, tokens: usize, reason: String },
    DownloadProgress { url: String, progress: u8 },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

pub type HandlerId = usize;

/// Fan-out of lifecycle events to subscribed handlers and per-kind callbacks.
/// Owned by whoever builds the core; there is no process-wide bus.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>,
    callbacks: RwLock<HashMap<&'static str, Vec<EventCallback>>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<H: EventHandler + 'static>(&self, handler: H) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    /// Registers a callback for one event kind, e.g. `"model_loaded"`.
    pub fn subscribe_to(&self, kind: &'static str, callback: EventCallback) {
        self.callbacks.write().entry(kind).or_default().push(callback);
    }

    pub fn unsubscribe(&self, id: HandlerId) {
        self.handlers.write().retain(|(h, _)| *h != id);
    }

    pub fn publish(&self, event: Event) {
        for (_, handler) in self.handlers.read().iter() {
            handler.handle(&event);
        }
        if let Some(callbacks) = self.callbacks.read().get(event.kind()) {
            callbacks.iter().for_each(|cb| cb(&event));
        }
    }
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ModelLoading { .. } => "model_loading",
            Event::ModelLoaded { .. } => "model_loaded",
            Event::ModelUnloaded { .. } => "model_unloaded",
            Event::ModelFaulted { .. } => "model_faulted",
            Event::GenerationStarted { .. } => "generation_started",
            Event::GenerationFinished { .. } => "generation_finished",
            Event::DownloadProgress { .. } => "download_progress",
        }
    }
}

pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &Event) {
        match event {
            Event::ModelFaulted { .. } => tracing::warn!("Event: {:?}", event),
            Event::DownloadProgress { .. } => tracing::trace!("Event: {:?}", event),
            _ => tracing::debug!("Event: {:?}", event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(Arc<AtomicUsize>);

    impl EventHandler for Counter {
        fn handle(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_handlers_see_every_event() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(Counter(Arc::clone(&seen)));

        bus.publish(Event::ModelUnloaded { handle: 1 });
        bus.publish(Event::ModelUnloaded { handle: 2 });
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        bus.unsubscribe(id);
        bus.publish(Event::ModelUnloaded { handle: 3 });
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callbacks_filter_by_kind() {
        let bus = EventBus::new();
        let loaded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loaded);
        bus.subscribe_to(
            "model_loaded",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(Event::ModelUnloaded { handle: 1 });
        bus.publish(Event::ModelLoaded { handle: 1, path: PathBuf::from("m.gguf") });
        assert_eq!(loaded.load(Ordering::SeqCst), 1);
    }
}
