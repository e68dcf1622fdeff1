use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::app::request::{GenerationParams, RequestId};
use crate::core::{Runtime, RuntimeFault, TokenId};
use crate::sample::Sampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// A stop sequence matched or the model ended its turn.
    StopSequence,
    /// The token bound or the context window was reached.
    MaxTokens,
    Cancelled,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::StopSequence => "stop-sequence",
            FinishReason::MaxTokens => "max-tokens",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenEvent {
    pub request_id: RequestId,
    pub seq: u64,
    pub fragment: String,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

const RUNNING: u8 = 0;
const CANCELLED: u8 = 1;
const FINISHED: u8 = 2;

/// Cancellation flag shared between the dispatcher and the worker.
///
/// Whichever side flips it first wins: an acknowledged `cancel` guarantees the
/// stream ends with `cancelled`, and a stream that already finished refuses
/// the cancel.
#[derive(Debug, Default)]
pub struct SessionControl {
    state: AtomicU8,
}

impl SessionControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn finish(&self) -> bool {
        self.state
            .compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Runtime state of one admitted request.
pub struct GenerationSession {
    pub request_id: RequestId,
    pub prompt: String,
    pub params: GenerationParams,
    pub control: Arc<SessionControl>,
    pub output: String,
}

impl GenerationSession {
    pub fn new(request_id: RequestId, prompt: String, params: GenerationParams, control: Arc<SessionControl>) -> Self {
        Self {
            request_id,
            prompt,
            params,
            control,
            output: String::new(),
        }
    }
}

/// Lazy, finite stream of token events for one session.
///
/// Each `next` runs at most a handful of decode steps: it keeps stepping only
/// while a step produced no emittable text (held-back stop-sequence prefixes or
/// incomplete UTF-8). After the final event it returns `None` forever.
pub struct Generation<'a> {
    runtime: &'a mut dyn Runtime,
    session: GenerationSession,
    sampler: Sampler,
    input: Vec<TokenId>,
    position: usize,
    generated: usize,
    seq: u64,
    pending: Vec<u8>,
    emitted: usize,
    started: bool,
    done: bool,
    fault: Option<RuntimeFault>,
}

/// Single terminal event for a session that ends before its first decode
/// step. A cancel acknowledged earlier still reports `cancelled`.
pub fn refuse(session: &GenerationSession, message: impl Into<String>) -> TokenEvent {
    let cancelled = !session.control.finish();
    TokenEvent {
        request_id: session.request_id,
        seq: 0,
        fragment: String::new(),
        is_final: true,
        finish_reason: Some(if cancelled { FinishReason::Cancelled } else { FinishReason::Error }),
        error: if cancelled { None } else { Some(message.into()) },
    }
}

/// Starts generating for `session` on `runtime`. The request's seed wins over
/// `default_seed`; with neither the draw is seeded from entropy.
pub fn run<'a>(session: GenerationSession, runtime: &'a mut dyn Runtime, default_seed: Option<u64>) -> Generation<'a> {
    let params = &session.params;
    let sampler = Sampler::new(
        params.temperature,
        params.top_k,
        params.top_p,
        params.seed.or(default_seed),
    );
    Generation {
        runtime,
        session,
        sampler,
        input: Vec::new(),
        position: 0,
        generated: 0,
        seq: 0,
        pending: Vec::new(),
        emitted: 0,
        started: false,
        done: false,
        fault: None,
    }
}

enum Step {
    Continue(String),
    Finish(FinishReason, String),
}

impl<'a> Generation<'a> {
    pub fn request_id(&self) -> RequestId {
        self.session.request_id
    }

    pub fn output(&self) -> &str {
        &self.session.output
    }

    pub fn generated_tokens(&self) -> usize {
        self.generated
    }

    /// The fault that ended the stream, if any.
    pub fn fault(&self) -> Option<&RuntimeFault> {
        self.fault.as_ref()
    }

    fn prefill(&mut self) -> Result<(), RuntimeFault> {
        self.runtime.reset();
        self.input = self.runtime.encode(&self.session.prompt)?;
        if self.input.is_empty() {
            return Err(RuntimeFault::recoverable("prompt encoded to zero tokens"));
        }
        let context = self.runtime.meta().context_length;
        if self.input.len() >= context {
            return Err(RuntimeFault::recoverable(format!(
                "prompt is {} tokens, context window is {}",
                self.input.len(),
                context
            )));
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Step, RuntimeFault> {
        let logits = self.runtime.forward(&self.input, self.position)?;
        self.position += self.input.len();
        let token = self.sampler.sample(&logits);
        self.generated += 1;

        if self.runtime.is_end_of_sequence(token) {
            return Ok(Step::Finish(FinishReason::StopSequence, self.flush()));
        }

        let bytes = self.runtime.token_bytes(token)?;
        self.pending.extend_from_slice(&bytes);
        self.drain_utf8();

        if let Some(at) = self.find_stop() {
            let fragment = self.session.output[self.emitted..at].to_string();
            self.session.output.truncate(at);
            self.emitted = at;
            self.pending.clear();
            return Ok(Step::Finish(FinishReason::StopSequence, fragment));
        }

        let context = self.runtime.meta().context_length;
        if self.generated >= self.session.params.max_tokens || self.position >= context {
            return Ok(Step::Finish(FinishReason::MaxTokens, self.flush()));
        }

        self.input = vec![token];
        let safe = self.session.output.len() - self.held_back();
        let fragment = self.session.output[self.emitted..safe].to_string();
        self.emitted = safe;
        Ok(Step::Continue(fragment))
    }

    /// Moves the longest valid UTF-8 prefix of `pending` into the output.
    fn drain_utf8(&mut self) {
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_some() => {
                // Invalid rather than incomplete: replace and move on.
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.session.output.push_str(&text);
                self.pending.clear();
                return;
            }
            Err(e) => e.valid_up_to(),
        };
        let rest = self.pending.split_off(valid);
        if let Ok(text) = std::str::from_utf8(&self.pending) {
            self.session.output.push_str(text);
        }
        self.pending = rest;
    }

    /// Byte offset in the output where the earliest complete stop sequence
    /// begins, searching only text not yet emitted.
    fn find_stop(&self) -> Option<usize> {
        let tail = &self.session.output[self.emitted..];
        self.session
            .params
            .stop
            .iter()
            .filter_map(|stop| tail.find(stop.as_str()))
            .min()
            .map(|at| self.emitted + at)
    }

    /// Length of the longest output suffix that could still grow into a stop
    /// sequence. That text is withheld until it is disambiguated.
    fn held_back(&self) -> usize {
        let tail = &self.session.output[self.emitted..];
        self.session
            .params
            .stop
            .iter()
            .filter_map(|stop| {
                (1..stop.len().min(tail.len() + 1))
                    .rev()
                    .filter(|&n| stop.is_char_boundary(n) && tail.is_char_boundary(tail.len() - n))
                    .find(|&n| tail.ends_with(&stop[..n]))
            })
            .max()
            .unwrap_or(0)
    }

    /// Everything generated but not yet emitted, including incomplete bytes.
    fn flush(&mut self) -> String {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.session.output.push_str(&text);
            self.pending.clear();
        }
        let fragment = self.session.output[self.emitted..].to_string();
        self.emitted = self.session.output.len();
        fragment
    }

    fn event(&mut self, fragment: String, finish: Option<FinishReason>) -> TokenEvent {
        let event = TokenEvent {
            request_id: self.session.request_id,
            seq: self.seq,
            fragment,
            is_final: finish.is_some(),
            finish_reason: finish,
            error: None,
        };
        self.seq += 1;
        event
    }

    fn terminal(&mut self, reason: FinishReason, fragment: String) -> TokenEvent {
        self.done = true;
        // An acknowledged cancel overrides a natural finish on the same step.
        let reason = if reason == FinishReason::Cancelled || self.session.control.finish() {
            reason
        } else {
            FinishReason::Cancelled
        };
        self.event(fragment, Some(reason))
    }

    fn failed(&mut self, fault: RuntimeFault) -> TokenEvent {
        let fragment = self.flush();
        self.done = true;
        // An acknowledged cancel still ends as `cancelled`; the fault is kept
        // so the handle can be marked.
        let cancelled = !self.session.control.finish();
        let mut event = if cancelled {
            self.event(fragment, Some(FinishReason::Cancelled))
        } else {
            self.event(fragment, Some(FinishReason::Error))
        };
        if !cancelled {
            event.error = Some(fault.message.clone());
        }
        self.fault = Some(fault);
        event
    }
}

impl<'a> Iterator for Generation<'a> {
    type Item = TokenEvent;

    fn next(&mut self) -> Option<TokenEvent> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;
            if self.session.control.is_cancelled() {
                return Some(self.terminal(FinishReason::Cancelled, String::new()));
            }
            if let Err(fault) = self.prefill() {
                return Some(self.failed(fault));
            }
        }

        loop {
            if self.session.control.is_cancelled() {
                let fragment = self.flush();
                return Some(self.terminal(FinishReason::Cancelled, fragment));
            }

            match self.step() {
                Err(fault) => return Some(self.failed(fault)),
                Ok(Step::Finish(reason, fragment)) => return Some(self.terminal(reason, fragment)),
                Ok(Step::Continue(fragment)) => {
                    if self.session.control.is_cancelled() {
                        let rest = self.flush();
                        return Some(self.terminal(FinishReason::Cancelled, fragment + &rest));
                    }
                    if !fragment.is_empty() {
                        return Some(self.event(fragment, None));
                    }
                }
            }
        }
    }
}

impl<'a> std::iter::FusedIterator for Generation<'a> {}
