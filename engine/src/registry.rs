//! Registry of tool call lifecycles.
//!
//! Lifecycles are created lazily per tool call id and never evicted. The
//! registry subscribes to each lifecycle it creates and recomputes the
//! executing / previewing / complete views on every transition, so the views
//! always agree with the lifecycles' current states.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;

use toolcall_types::{LifecycleStatus, ToolCallIdentity};

use crate::backend::{ExecutionBackend, TaskStore};
use crate::cancel::CancelToken;
use crate::lifecycle::{EngineContext, ToolCallLifecycle, ToolKinds};

/// Snapshot of the derived views. A lifecycle appears in at most one view.
#[derive(Debug, Clone, Default)]
pub struct RegistryViews {
    /// `execute` and `execute:streaming`.
    pub executing: Vec<ToolCallLifecycle>,
    /// `init` and `pending`.
    pub previewing: Vec<ToolCallLifecycle>,
    pub complete: Vec<ToolCallLifecycle>,
}

impl RegistryViews {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.executing.is_empty() || !self.previewing.is_empty()
    }
}

#[derive(Default)]
struct Lifecycles {
    ordered: Vec<ToolCallLifecycle>,
    by_id: HashMap<String, usize>,
}

struct RegistryInner {
    context: Arc<EngineContext>,
    lifecycles: Mutex<Lifecycles>,
    views: watch::Sender<RegistryViews>,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Lifecycles> {
        self.lifecycles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Rebuild and publish the views from the current lifecycle states.
    fn recompute(&self) {
        let lifecycles = self.lock();
        let mut views = RegistryViews::default();
        for lifecycle in &lifecycles.ordered {
            let status = lifecycle.status();
            if status.is_executing() {
                views.executing.push(lifecycle.clone());
            } else if status.is_previewing() {
                views.previewing.push(lifecycle.clone());
            } else if status == LifecycleStatus::Complete {
                views.complete.push(lifecycle.clone());
            }
        }
        // Published under the lock so snapshots go out in order.
        self.views.send_replace(views);
    }
}

/// Keyed cache of lifecycles sharing one outer cancellation token.
#[derive(Clone)]
pub struct LifecycleRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleRegistry")
            .field("context", &self.inner.context)
            .field("lifecycles", &self.inner.lock().ordered.len())
            .finish_non_exhaustive()
    }
}

impl LifecycleRegistry {
    /// Registry with the default tool names and a fresh outer token.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime. Use
    /// [`LifecycleRegistry::with_runtime`] to pass a handle explicitly.
    pub fn new(backend: Arc<dyn ExecutionBackend>, task_store: Arc<dyn TaskStore>) -> Self {
        Self::with_options(backend, task_store, ToolKinds::default(), CancelToken::new())
    }

    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn with_options(
        backend: Arc<dyn ExecutionBackend>,
        task_store: Arc<dyn TaskStore>,
        tools: ToolKinds,
        outer: CancelToken,
    ) -> Self {
        Self::with_runtime(backend, task_store, tools, outer, Handle::current())
    }

    /// Registry whose backend jobs run on `runtime`. Lifecycle operations
    /// may then be called from any thread.
    pub fn with_runtime(
        backend: Arc<dyn ExecutionBackend>,
        task_store: Arc<dyn TaskStore>,
        tools: ToolKinds,
        outer: CancelToken,
        runtime: Handle,
    ) -> Self {
        let (views, _) = watch::channel(RegistryViews::default());
        Self {
            inner: Arc::new(RegistryInner {
                context: Arc::new(EngineContext {
                    backend,
                    task_store,
                    tools,
                    outer,
                    runtime,
                }),
                lifecycles: Mutex::new(Lifecycles::default()),
                views,
            }),
        }
    }

    /// The lifecycle for `identity.tool_call_id`, created on first use.
    pub fn get_or_create(&self, identity: ToolCallIdentity) -> ToolCallLifecycle {
        let lifecycle = {
            let mut lifecycles = self.inner.lock();
            if let Some(&index) = lifecycles.by_id.get(&identity.tool_call_id) {
                let existing = &lifecycles.ordered[index];
                if existing.tool_name() != identity.tool_name {
                    tracing::debug!(
                        "{} requested as {}, keeping the existing lifecycle",
                        existing.identity(),
                        identity.tool_name
                    );
                }
                return existing.clone();
            }

            let lifecycle = ToolCallLifecycle::new(identity, Arc::clone(&self.inner.context));
            let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
            lifecycle.subscribe(move |event| {
                let Some(registry) = registry.upgrade() else {
                    return ControlFlow::Break(());
                };
                registry.recompute();
                if event.status == LifecycleStatus::Dispose {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            });

            let index = lifecycles.ordered.len();
            lifecycles
                .by_id
                .insert(lifecycle.tool_call_id().to_string(), index);
            lifecycles.ordered.push(lifecycle.clone());
            lifecycle
        };
        self.inner.recompute();
        lifecycle
    }

    #[must_use]
    pub fn get(&self, tool_call_id: &str) -> Option<ToolCallLifecycle> {
        let lifecycles = self.inner.lock();
        lifecycles
            .by_id
            .get(tool_call_id)
            .map(|&index| lifecycles.ordered[index].clone())
    }

    /// Every lifecycle in creation order, disposed ones included.
    #[must_use]
    pub fn lifecycles(&self) -> Vec<ToolCallLifecycle> {
        self.inner.lock().ordered.clone()
    }

    #[must_use]
    pub fn executing(&self) -> Vec<ToolCallLifecycle> {
        self.inner.views.borrow().executing.clone()
    }

    #[must_use]
    pub fn previewing(&self) -> Vec<ToolCallLifecycle> {
        self.inner.views.borrow().previewing.clone()
    }

    #[must_use]
    pub fn completed(&self) -> Vec<ToolCallLifecycle> {
        self.inner.views.borrow().complete.clone()
    }

    /// Receiver of view snapshots, updated on every transition.
    #[must_use]
    pub fn watch_views(&self) -> watch::Receiver<RegistryViews> {
        self.inner.views.subscribe()
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.views.borrow().is_busy()
    }

    /// Abort every lifecycle still in preview.
    pub fn abort_previewing(&self) {
        for lifecycle in self.previewing() {
            if let Err(err) = lifecycle.abort() {
                tracing::debug!("{err}");
            }
        }
    }

    /// Signal every executing lifecycle to stop.
    pub fn abort_executing(&self) {
        for lifecycle in self.executing() {
            if let Err(err) = lifecycle.abort() {
                tracing::debug!("{err}");
            }
        }
    }

    /// Cancel the outer token, and with it every preview and execute token.
    pub fn abort_all(&self, reason: impl Into<String>) {
        self.inner.context.outer.cancel(reason);
    }

    #[must_use]
    pub fn outer_token(&self) -> CancelToken {
        self.inner.context.outer.clone()
    }

    #[must_use]
    pub fn tools(&self) -> &ToolKinds {
        &self.inner.context.tools
    }
}
