//! Which cluster and namespace a pod uses when its spec does not say
//!
//! Resolution runs through three tiers, each consulted only when the one
//! before it has nothing configured:
//!
//! 1. the calling thread's [`DefaultsContext`]
//! 2. the process-wide context
//! 3. built-ins: [`Cluster::discover`] and a generated namespace name
//!
//! Thread contexts are never shared. [`spawn`] hands a child thread a
//! snapshot taken at spawn time, so later changes on either side stay
//! local. Test harnesses open a [`TestScope`] per test; dropping it clears
//! the thread's context so pooled threads do not inherit stale settings.
//! Guards and scopes are `!Send`: they restore the thread they were
//! created on, so they can never be dropped on another one.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, RwLock};

use crate::cluster::Cluster;
use crate::namespace::TestNamespace;
use crate::naming;
use podlab_common::config::PodlabConfig;

/// Produces the cluster for a new pod
pub type ClusterSupplier = Arc<dyn Fn() -> Cluster + Send + Sync>;

/// Produces the namespace name for a new pod
pub type NamespaceNameSupplier = Arc<dyn Fn() -> String + Send + Sync>;

/// One tier of default settings
#[derive(Clone, Default)]
pub struct DefaultsContext {
    cluster: Option<ClusterSupplier>,
    namespace_name: Option<NamespaceNameSupplier>,
    shared_namespace: Option<Arc<TestNamespace>>,
}

impl DefaultsContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed cluster
    pub fn with_cluster(self, cluster: Cluster) -> Self {
        self.with_cluster_supplier(move || cluster.clone())
    }

    /// Produce the cluster on demand
    pub fn with_cluster_supplier<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> Cluster + Send + Sync + 'static,
    {
        self.cluster = Some(Arc::new(supplier));
        self
    }

    /// Use a fixed namespace name
    pub fn with_namespace_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.with_namespace_name_supplier(move || name.clone())
    }

    /// Produce the namespace name on demand
    pub fn with_namespace_name_supplier<F>(mut self, supplier: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.namespace_name = Some(Arc::new(supplier));
        self
    }

    /// Run every pod in one namespace instead of one per pod
    pub fn with_shared_namespace(mut self, namespace: Arc<TestNamespace>) -> Self {
        self.shared_namespace = Some(namespace);
        self
    }

    /// Whether nothing is configured
    pub fn is_empty(&self) -> bool {
        self.cluster.is_none() && self.namespace_name.is_none() && self.shared_namespace.is_none()
    }

    /// Cluster from this tier, then the global tier, then discovery
    pub fn resolve_cluster(&self) -> Cluster {
        if let Some(supplier) = &self.cluster {
            return supplier();
        }
        if let Some(supplier) = read_global(|g| g.cluster.clone()) {
            return supplier();
        }
        Cluster::discover()
    }

    /// Namespace name from this tier, then the global tier, then a
    /// generated unique name
    pub fn resolve_namespace_name(&self) -> String {
        if let Some(supplier) = &self.namespace_name {
            return supplier();
        }
        if let Some(supplier) = read_global(|g| g.namespace_name.clone()) {
            return supplier();
        }
        let prefix = PodlabConfig::from_env()
            .map(|c| c.namespace_prefix)
            .unwrap_or_default();
        naming::unique_name(&prefix, None)
    }

    /// Shared namespace from this tier, then the global tier
    pub fn shared_namespace(&self) -> Option<Arc<TestNamespace>> {
        self.shared_namespace
            .clone()
            .or_else(|| read_global(|g| g.shared_namespace.clone()))
    }

    /// Whether a cluster is configured on this tier or globally
    pub fn has_cluster_configured(&self) -> bool {
        self.cluster.is_some() || read_global(|g| g.cluster.is_some())
    }

    /// Make this the calling thread's context until the guard drops,
    /// restoring whatever was there before
    pub fn enter(self) -> ContextGuard {
        let previous = CONTEXT.with(|c| c.replace(Some(self)));
        ContextGuard {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl fmt::Debug for DefaultsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultsContext")
            .field("cluster", &self.cluster.is_some())
            .field("namespace_name", &self.namespace_name.is_some())
            .field("shared_namespace", &self.shared_namespace.as_ref().map(|n| n.name()))
            .finish()
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<DefaultsContext>> = const { RefCell::new(None) };
}

static GLOBAL: LazyLock<RwLock<DefaultsContext>> =
    LazyLock::new(|| RwLock::new(DefaultsContext::default()));

fn read_global<T>(f: impl FnOnce(&DefaultsContext) -> T) -> T {
    match GLOBAL.read() {
        Ok(global) => f(&global),
        Err(poisoned) => f(&poisoned.into_inner()),
    }
}

fn write_global(f: impl FnOnce(&mut DefaultsContext)) {
    match GLOBAL.write() {
        Ok(mut global) => f(&mut global),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

fn update_current(f: impl FnOnce(&mut DefaultsContext)) {
    CONTEXT.with(|c| f(c.borrow_mut().get_or_insert_with(DefaultsContext::default)));
}

/// Restores the previous thread context on drop
#[must_use = "the context is removed again when the guard drops"]
pub struct ContextGuard {
    previous: Option<DefaultsContext>,
    // Pins the guard to the thread whose context it restores
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CONTEXT.with(|c| *c.borrow_mut() = previous);
    }
}

/// Copy of the calling thread's context (empty when none is set)
pub fn snapshot() -> DefaultsContext {
    CONTEXT.with(|c| c.borrow().clone().unwrap_or_default())
}

/// Set the cluster supplier for this thread
pub fn set_cluster_supplier<F>(supplier: F)
where
    F: Fn() -> Cluster + Send + Sync + 'static,
{
    update_current(|c| c.cluster = Some(Arc::new(supplier)));
}

/// Use a fixed cluster on this thread
pub fn set_cluster(cluster: Cluster) {
    set_cluster_supplier(move || cluster.clone());
}

/// Set the namespace-name supplier for this thread
pub fn set_namespace_name_supplier<F>(supplier: F)
where
    F: Fn() -> String + Send + Sync + 'static,
{
    update_current(|c| c.namespace_name = Some(Arc::new(supplier)));
}

/// Set the shared namespace for this thread
pub fn set_shared_namespace(namespace: Arc<TestNamespace>) {
    update_current(|c| c.shared_namespace = Some(namespace));
}

/// Remove this thread's configuration
pub fn clear() {
    CONTEXT.with(|c| *c.borrow_mut() = None);
}

/// Set the process-wide cluster supplier
pub fn set_global_cluster_supplier<F>(supplier: F)
where
    F: Fn() -> Cluster + Send + Sync + 'static,
{
    let supplier: ClusterSupplier = Arc::new(supplier);
    write_global(|g| g.cluster = Some(supplier));
}

/// Set the process-wide namespace-name supplier
pub fn set_global_namespace_name_supplier<F>(supplier: F)
where
    F: Fn() -> String + Send + Sync + 'static,
{
    let supplier: NamespaceNameSupplier = Arc::new(supplier);
    write_global(|g| g.namespace_name = Some(supplier));
}

/// Set the process-wide shared namespace
pub fn set_global_shared_namespace(namespace: Arc<TestNamespace>) {
    write_global(|g| g.shared_namespace = Some(namespace));
}

/// Remove the process-wide configuration
pub fn clear_global() {
    write_global(|g| *g = DefaultsContext::default());
}

/// Resolve the cluster for the calling thread
pub fn resolve_cluster() -> Cluster {
    snapshot().resolve_cluster()
}

/// Resolve the namespace name for the calling thread
pub fn resolve_namespace_name() -> String {
    snapshot().resolve_namespace_name()
}

/// Shared namespace visible to the calling thread
pub fn shared_namespace() -> Option<Arc<TestNamespace>> {
    snapshot().shared_namespace()
}

/// Whether the calling thread sees a configured cluster
pub fn has_cluster_configured() -> bool {
    snapshot().has_cluster_configured()
}

/// Spawn a thread that starts with a snapshot of the caller's context
pub fn spawn<F, T>(f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let context = snapshot();
    std::thread::spawn(move || {
        let _guard = context.enter();
        f()
    })
}

/// Per-test defaults, cleared when dropped
///
/// The scope belongs to the thread that opened it. Hold it in the test
/// body (which `#[tokio::test]` runs on the test thread for either
/// runtime flavor), not inside a spawned task.
///
/// ```ignore
/// let scope = TestScope::new("orders_are_persisted").with_cluster(cluster);
/// let mut db = TestPod::deployment(WorkloadSpec::new("postgres:16"));
/// db.start().await?;
/// // ...
/// db.stop().await;
/// scope.close().await;
/// ```
#[must_use = "defaults are cleared when the scope drops"]
pub struct TestScope {
    shared: Option<Arc<TestNamespace>>,
    _guard: ContextGuard,
}

impl TestScope {
    /// Install per-test namespace naming derived from `test_name`
    pub fn new(test_name: &str) -> Self {
        let context_name = test_name.to_string();
        let prefix = PodlabConfig::from_env()
            .map(|c| c.namespace_prefix)
            .unwrap_or_default();
        let context = DefaultsContext::new().with_namespace_name_supplier(move || {
            naming::unique_name(&prefix, Some(&context_name))
        });
        Self {
            shared: None,
            _guard: context.enter(),
        }
    }

    /// Pin the cluster for this test
    pub fn with_cluster(self, cluster: Cluster) -> Self {
        set_cluster(cluster);
        self
    }

    /// Run every pod of this test in one namespace; the scope closes it
    pub fn with_shared_namespace(mut self, namespace: Arc<TestNamespace>) -> Self {
        set_shared_namespace(namespace.clone());
        self.shared = Some(namespace);
        self
    }

    /// Close the shared namespace (if any) and clear the defaults
    pub async fn close(mut self) {
        if let Some(ns) = self.shared.take() {
            if let Err(e) = ns.close().await {
                tracing::warn!(namespace = %ns.name(), error = %e, "failed to delete shared namespace");
            }
        }
    }
}

impl Drop for TestScope {
    fn drop(&mut self) {
        clear();
    }
}
