//! Core hook types shared across crates.
//!
//! A turn passes through five extension points. At each point the registered
//! handlers run one after another in ascending priority order, each seeing the
//! text produced by the previous one. A handler can let the payload through,
//! replace its text, or intercept the stage with a final response. Handler
//! errors and panics never escape [`HookRegistry::dispatch`].

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    chrono::{DateTime, Local},
    futures::FutureExt,
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::context::ConversationContext;

// ── HookPoint ───────────────────────────────────────────────────────────────

/// Extension points, in the order a turn reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    PreMerge,
    PostMerge,
    MessageAppended,
    PreLlmRequest,
    LlmResponse,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl HookPoint {
    /// All variants, in pipeline order.
    pub const ALL: &'static [HookPoint] = &[
        Self::PreMerge,
        Self::PostMerge,
        Self::MessageAppended,
        Self::PreLlmRequest,
        Self::LlmResponse,
    ];

    /// MessageAppended can only pass or modify.
    pub fn allows_intercept(&self) -> bool {
        !matches!(self, Self::MessageAppended)
    }

    /// Stages whose text is a structured JSON document.
    pub fn carries_document(&self) -> bool {
        matches!(self, Self::PreLlmRequest | Self::LlmResponse)
    }
}

// ── HookPayload ─────────────────────────────────────────────────────────────

/// Stage-specific payload. Each variant has one primary text field that
/// handlers may replace; the rest is read-only context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "point")]
pub enum HookPayload {
    PreMerge {
        fragment: String,
        source: String,
        timestamp: DateTime<Local>,
    },
    PostMerge {
        text: String,
        timestamp: DateTime<Local>,
    },
    MessageAppended {
        original: String,
        appended: String,
        full: String,
        index: usize,
    },
    PreLlmRequest {
        request: String,
        user_text: String,
    },
    LlmResponse {
        response: String,
    },
}

impl HookPayload {
    /// Returns the [`HookPoint`] variant that matches this payload.
    pub fn point(&self) -> HookPoint {
        match self {
            Self::PreMerge { .. } => HookPoint::PreMerge,
            Self::PostMerge { .. } => HookPoint::PostMerge,
            Self::MessageAppended { .. } => HookPoint::MessageAppended,
            Self::PreLlmRequest { .. } => HookPoint::PreLlmRequest,
            Self::LlmResponse { .. } => HookPoint::LlmResponse,
        }
    }

    /// The text a `Modified` outcome replaces.
    pub fn text(&self) -> &str {
        match self {
            Self::PreMerge { fragment, .. } => fragment,
            Self::PostMerge { text, .. } => text,
            Self::MessageAppended { full, .. } => full,
            Self::PreLlmRequest { request, .. } => request,
            Self::LlmResponse { response } => response,
        }
    }

    /// Copy of this payload with the primary text replaced.
    #[must_use]
    pub fn with_text(&self, text: String) -> Self {
        let mut next = self.clone();
        match &mut next {
            Self::PreMerge { fragment, .. } => *fragment = text,
            Self::PostMerge { text: t, .. } => *t = text,
            Self::MessageAppended { full, .. } => *full = text,
            Self::PreLlmRequest { request, .. } => *request = text,
            Self::LlmResponse { response } => *response = text,
        }
        next
    }
}

// ── HookOutcome ─────────────────────────────────────────────────────────────

/// The outcome a hook handler returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HookOutcome {
    /// Let the payload through untouched.
    #[default]
    Continue,
    /// Replace the payload's primary text for the rest of the stage.
    Modified(String),
    /// Stop the stage and answer with this response.
    Intercepted(String),
}

// ── HookHandler trait ───────────────────────────────────────────────────────

/// Trait implemented by every extension handler.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Identity of this handler; re-registering the same name replaces it.
    fn name(&self) -> &str;

    /// Extension the handler belongs to, for logs.
    fn extension(&self) -> &str {
        self.name()
    }

    /// Which points this handler subscribes to.
    fn points(&self) -> &[HookPoint];

    /// Priority for ordering. Lower values run first. Default is 0.
    fn priority(&self) -> i32 {
        0
    }

    /// Handle one payload at `point`.
    async fn handle(
        &self,
        point: HookPoint,
        payload: &HookPayload,
        ctx: &dyn ConversationContext,
    ) -> Result<HookOutcome>;
}

// ── HookStats ───────────────────────────────────────────────────────────────

/// Per-handler health statistics for circuit breaker logic.
pub struct HookStats {
    pub call_count: AtomicU64,
    pub failure_count: AtomicU64,
    pub consecutive_failures: AtomicU64,
    pub total_latency_us: AtomicU64,
    pub disabled: AtomicBool,
    pub disabled_at: std::sync::Mutex<Option<Instant>>,
}

impl HookStats {
    pub fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            disabled_at: std::sync::Mutex::new(None),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn avg_latency(&self) -> Duration {
        let calls = self.call_count.load(Ordering::Relaxed);
        if calls == 0 {
            return Duration::ZERO;
        }
        let total = self.total_latency_us.load(Ordering::Relaxed);
        Duration::from_micros(total / calls)
    }
}

impl Default for HookStats {
    fn default() -> Self {
        Self::new()
    }
}

// ── Handler entry (with stats) ──────────────────────────────────────────────

struct HandlerEntry {
    handler: Arc<dyn HookHandler>,
    stats: Arc<HookStats>,
    priority: i32,
    /// Registration sequence, breaks priority ties.
    seq: u64,
}

/// A registered handler as seen from outside the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    pub name: String,
    pub extension: String,
    pub priority: i32,
}

// ── HookRegistry ────────────────────────────────────────────────────────────

/// Holds the ordered handler chains and runs a payload through them.
pub struct HookRegistry {
    handlers: HashMap<HookPoint, Vec<HandlerEntry>>,
    stats: HashMap<String, Arc<HookStats>>,
    next_seq: u64,
    /// Maximum consecutive failures before auto-disabling a handler.
    circuit_breaker_threshold: u64,
    /// Cooldown period before re-enabling a circuit-broken handler.
    circuit_breaker_cooldown: Duration,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            stats: HashMap::new(),
            next_seq: 0,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }

    /// Set circuit breaker parameters. A threshold of 0 disables the breaker.
    pub fn with_circuit_breaker(mut self, threshold: u64, cooldown: Duration) -> Self {
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_cooldown = cooldown;
        self
    }

    /// Register a handler at every point it subscribes to, using its own priority.
    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        let priority = handler.priority();
        self.register_with_priority(handler, priority);
    }

    /// Register a handler at every point it subscribes to under `priority`.
    pub fn register_with_priority(&mut self, handler: Arc<dyn HookHandler>, priority: i32) {
        for &point in handler.points() {
            self.register_at(point, priority, Arc::clone(&handler));
        }
        info!(
            handler = handler.name(),
            extension = handler.extension(),
            priority,
            "hook handler registered"
        );
    }

    /// Register `handler` at a single point. A handler with the same name at
    /// that point is replaced and keeps its original registration slot.
    pub fn register_at(&mut self, point: HookPoint, priority: i32, handler: Arc<dyn HookHandler>) {
        let stats = Arc::clone(
            self.stats
                .entry(handler.name().to_string())
                .or_insert_with(|| Arc::new(HookStats::new())),
        );
        let handlers = self.handlers.entry(point).or_default();

        if let Some(existing) = handlers
            .iter_mut()
            .find(|e| e.handler.name() == handler.name())
        {
            debug!(handler = handler.name(), point = %point, "replacing hook handler");
            existing.handler = handler;
            existing.priority = priority;
        } else {
            handlers.push(HandlerEntry {
                handler,
                stats,
                priority,
                seq: self.next_seq,
            });
            self.next_seq += 1;
        }

        // Ascending priority, then registration order.
        handlers.sort_by_key(|h| (h.priority, h.seq));
    }

    /// Returns true if any handlers are registered for the given point.
    pub fn has_handlers(&self, point: HookPoint) -> bool {
        self.handlers.get(&point).is_some_and(|v| !v.is_empty())
    }

    /// Handlers at `point` in execution order.
    pub fn handlers_at(&self, point: HookPoint) -> Vec<HandlerInfo> {
        self.handlers
            .get(&point)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| HandlerInfo {
                        name: e.handler.name().to_string(),
                        extension: e.handler.extension().to_string(),
                        priority: e.priority,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get stats for a named handler. Returns None if not found.
    pub fn handler_stats(&self, name: &str) -> Option<Arc<HookStats>> {
        self.stats.get(name).map(Arc::clone)
    }

    /// List all registered handler names (deduplicated).
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stats.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a handler is circuit-broken and potentially re-enable it.
    fn check_circuit_breaker(&self, entry: &HandlerEntry) -> bool {
        if self.circuit_breaker_threshold == 0 {
            return false;
        }

        let is_disabled = entry.stats.disabled.load(Ordering::Relaxed);

        if !is_disabled {
            let consecutive_failures = entry.stats.consecutive_failures.load(Ordering::Relaxed);
            if consecutive_failures >= self.circuit_breaker_threshold {
                entry.stats.disabled.store(true, Ordering::Relaxed);
                *entry
                    .stats
                    .disabled_at
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                warn!(
                    handler = entry.handler.name(),
                    extension = entry.handler.extension(),
                    "hook circuit breaker tripped after {} consecutive failures",
                    self.circuit_breaker_threshold
                );
                return true;
            }
            return false;
        }

        // Already disabled; re-enable once the cooldown has elapsed.
        let disabled_at = entry
            .stats
            .disabled_at
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(at) = *disabled_at
            && at.elapsed() >= self.circuit_breaker_cooldown
        {
            drop(disabled_at);
            entry.stats.disabled.store(false, Ordering::Relaxed);
            entry.stats.consecutive_failures.store(0, Ordering::Relaxed);
            info!(
                handler = entry.handler.name(),
                "hook circuit breaker reset after cooldown"
            );
            return false;
        }
        true
    }

    /// Run `payload` through the chain registered at its point.
    ///
    /// - The first [`HookOutcome::Intercepted`] stops the chain and is returned.
    /// - Each [`HookOutcome::Modified`] becomes the input of the next handler;
    ///   the composed text is returned as `Modified`.
    /// - Otherwise [`HookOutcome::Continue`] is returned.
    ///
    /// Handler errors and panics are logged and count as `Continue`.
    pub async fn dispatch(
        &self,
        payload: &HookPayload,
        ctx: &dyn ConversationContext,
    ) -> HookOutcome {
        let point = payload.point();
        let handlers = match self.handlers.get(&point) {
            Some(h) if !h.is_empty() => h,
            _ => return HookOutcome::Continue,
        };

        debug!(point = %point, count = handlers.len(), "dispatching hook point");

        let mut current = payload.clone();
        let mut modified = false;

        for entry in handlers {
            if self.check_circuit_breaker(entry) {
                continue;
            }

            let name = entry.handler.name();
            let extension = entry.handler.extension();
            let start = Instant::now();
            let result = AssertUnwindSafe(entry.handler.handle(point, &current, ctx))
                .catch_unwind()
                .await;
            let latency = start.elapsed();

            match result {
                Ok(Ok(HookOutcome::Continue)) => {
                    entry.stats.record_success(latency);
                },
                Ok(Ok(HookOutcome::Modified(text))) => {
                    entry.stats.record_success(latency);
                    if point.carries_document()
                        && serde_json::from_str::<serde_json::Value>(&text).is_err()
                    {
                        warn!(handler = name, extension, point = %point, "hook returned a malformed document, keeping previous one");
                        continue;
                    }
                    debug!(handler = name, point = %point, "hook modified payload");
                    current = current.with_text(text);
                    modified = true;
                },
                Ok(Ok(HookOutcome::Intercepted(response))) => {
                    entry.stats.record_success(latency);
                    if !point.allows_intercept() {
                        debug!(handler = name, point = %point, "hook intercept on pass-or-modify point (ignored)");
                        continue;
                    }
                    info!(handler = name, extension, point = %point, "hook intercepted stage");
                    return HookOutcome::Intercepted(response);
                },
                Ok(Err(e)) => {
                    entry.stats.record_failure(latency);
                    warn!(handler = name, extension, point = %point, error = %e, "hook handler failed");
                },
                Err(panic) => {
                    entry.stats.record_failure(latency);
                    warn!(
                        handler = name,
                        extension,
                        point = %point,
                        panic = %panic_message(&*panic),
                        "hook handler panicked"
                    );
                },
            }
        }

        if modified {
            HookOutcome::Modified(current.text().to_string())
        } else {
            HookOutcome::Continue
        }
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
