//! # Module Loading
//!
//! The decoder never interprets a module locator. It hands the locator to a
//! [`ModuleLoader`] through a [`ModuleRegistry`], which may be shared by every
//! response in the process.
//!
//! ## Design
//!
//! ```text
//! locator ──> Arc<OnceCell<Result<Module, _>>> ──> one load, many waiters
//! ```
//!
//! Concurrent `require` calls for the same locator collapse into one load,
//! and the outcome (success or failure) is remembered.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;

use crate::error::ModuleLoadError;

/// Future returned by [`ModuleLoader::load`].
pub type LoadFuture = Pin<Box<dyn Future<Output = Result<Module, ModuleLoadError>> + Send>>;

/// A loaded unit of code, opaque to the decoder.
#[derive(Clone)]
pub struct Module(Arc<dyn Any + Send + Sync>);

impl Module {
    /// Wraps any value as a module.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrows the module as `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Returns true when both handles point at the same loaded module.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Module(..)")
    }
}

/// Turns a module locator into a module. Must be safe to call concurrently.
pub trait ModuleLoader: Send + Sync + 'static {
    /// Starts loading `locator`.
    fn load(&self, locator: &str) -> LoadFuture;
}

type LoadCell = Arc<OnceCell<Result<Module, ModuleLoadError>>>;

struct RegistryInner {
    loader: Box<dyn ModuleLoader>,
    cells: Mutex<HashMap<String, LoadCell>>,
    loads_started: AtomicU64,
}

/// Shared, idempotent front of a [`ModuleLoader`].
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RegistryInner>,
}

impl ModuleRegistry {
    /// Wraps a loader.
    #[must_use]
    pub fn new(loader: impl ModuleLoader) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                loader: Box::new(loader),
                cells: Mutex::new(HashMap::new()),
                loads_started: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the module, loading it on first use.
    ///
    /// # Errors
    ///
    /// Whatever the loader reported for this locator.
    pub async fn require(&self, locator: &str) -> Result<Module, ModuleLoadError> {
        let cell = self.cell(locator);
        cell.get_or_init(|| {
            self.inner.loads_started.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(locator, "loading module");
            self.inner.loader.load(locator)
        })
        .await
        .clone()
    }

    /// Returns the outcome if the locator already finished loading.
    #[must_use]
    pub fn try_require(&self, locator: &str) -> Option<Result<Module, ModuleLoadError>> {
        let cell = self.inner.cells.lock().get(locator).cloned()?;
        cell.get().cloned()
    }

    /// Starts loading `locator` in the background.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn preload(&self, locator: &str) -> PreloadTask {
        let registry = self.clone();
        let owned = locator.to_owned();
        let handle = tokio::spawn(async move { registry.require(&owned).await });
        PreloadTask {
            locator: locator.to_owned(),
            handle,
        }
    }

    /// Number of loads handed to the loader so far.
    #[must_use]
    pub fn loads_started(&self) -> u64 {
        self.inner.loads_started.load(Ordering::Relaxed)
    }

    fn cell(&self, locator: &str) -> LoadCell {
        let mut cells = self.inner.cells.lock();
        Arc::clone(cells.entry(locator.to_owned()).or_default())
    }
}

/// Background load started by [`ModuleRegistry::preload`].
pub struct PreloadTask {
    locator: String,
    handle: JoinHandle<Result<Module, ModuleLoadError>>,
}

impl PreloadTask {
    /// Locator being loaded.
    #[must_use]
    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// Cancels the load. Waiters of the same locator elsewhere retry it.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Returns true once the load settled or was cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the load.
    ///
    /// # Errors
    ///
    /// The loader's error, or [`ModuleLoadError::Cancelled`].
    pub async fn wait(self) -> Result<Module, ModuleLoadError> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(ModuleLoadError::Cancelled(self.locator)),
        }
    }
}

/// Loader backed by a fixed map, with an optional artificial latency.
#[derive(Clone, Default)]
pub struct StaticModuleLoader {
    modules: Arc<HashMap<String, Module>>,
    latency: Option<Duration>,
}

impl StaticModuleLoader {
    /// Empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module under `locator`.
    #[must_use]
    pub fn with_module(mut self, locator: impl Into<String>, module: Module) -> Self {
        Arc::make_mut(&mut self.modules).insert(locator.into(), module);
        self
    }

    /// Delays every load by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl ModuleLoader for StaticModuleLoader {
    fn load(&self, locator: &str) -> LoadFuture {
        let found = self.modules.get(locator).cloned();
        let locator = locator.to_owned();
        let latency = self.latency;
        Box::pin(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            found.ok_or(ModuleLoadError::NotFound(locator))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new(
            StaticModuleLoader::new()
                .with_module("mod#Button", Module::new("button"))
                .with_latency(Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn test_concurrent_requires_collapse() {
        let registry = registry();
        let (a, b) = tokio::join!(registry.require("mod#Button"), registry.require("mod#Button"));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a.same_as(&b));
        assert_eq!(a.downcast_ref::<&str>(), Some(&"button"));
        assert_eq!(registry.loads_started(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_remembered() {
        let registry = registry();
        assert_eq!(
            registry.require("missing").await.unwrap_err(),
            ModuleLoadError::NotFound("missing".into())
        );
        assert!(matches!(registry.try_require("missing"), Some(Err(_))));
        registry.require("missing").await.unwrap_err();
        assert_eq!(registry.loads_started(), 1);
    }

    #[tokio::test]
    async fn test_preload_then_require() {
        let registry = registry();
        assert!(registry.try_require("mod#Button").is_none());

        let task = registry.preload("mod#Button");
        assert_eq!(task.locator(), "mod#Button");
        task.wait().await.unwrap();

        assert!(matches!(registry.try_require("mod#Button"), Some(Ok(_))));
        registry.require("mod#Button").await.unwrap();
        assert_eq!(registry.loads_started(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_preload() {
        let registry = registry();
        let task = registry.preload("mod#Button");
        task.cancel();
        assert_eq!(
            task.wait().await.unwrap_err(),
            ModuleLoadError::Cancelled("mod#Button".into())
        );
    }
}
