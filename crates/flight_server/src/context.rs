//! # Render Context
//!
//! The per-step context handed to component callables. The current owner is
//! an explicit field: the encoder sets it before calling a component and puts
//! the previous owner back afterwards, success or failure.
//!
//! Owners form a chain (`Page > List > Item`) so a component can see which
//! component rendered it.

use std::fmt;
use std::sync::Arc;

use crate::cache::RequestCache;

/// The component whose evaluation is in progress.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    name: Arc<str>,
    parent: Option<Arc<Owner>>,
}

impl Owner {
    /// Top-level owner.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    /// Owner rendered by `self`.
    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        Self {
            name: name.into(),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owner that rendered this one.
    #[must_use]
    pub fn parent(&self) -> Option<&Owner> {
        self.parent.as_deref()
    }

    /// Names from the outermost owner down to this one, joined by `" > "`.
    #[must_use]
    pub fn path(&self) -> String {
        let mut names = vec![self.name()];
        let mut current = self.parent();
        while let Some(owner) = current {
            names.push(owner.name());
            current = owner.parent();
        }
        names.reverse();
        names.join(" > ")
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Context passed to every component evaluation.
pub struct RenderContext {
    owner: Option<Owner>,
    cache: Arc<RequestCache>,
}

impl RenderContext {
    /// Context with no owner.
    #[must_use]
    pub fn new(cache: Arc<RequestCache>) -> Self {
        Self { owner: None, cache }
    }

    /// Context resuming under a previously captured owner.
    #[must_use]
    pub fn with_owner(cache: Arc<RequestCache>, owner: Option<Owner>) -> Self {
        Self { owner, cache }
    }

    /// Current owner, if a component is being evaluated.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> Option<&Owner> {
        self.owner.as_ref()
    }

    /// The request cache.
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    /// Makes the component `name` current, returning the owner it replaces.
    #[must_use = "the previous owner must be restored"]
    pub fn enter(&mut self, name: &str) -> Option<Owner> {
        let next = match &self.owner {
            Some(current) => current.child(name),
            None => Owner::new(name),
        };
        self.owner.replace(next)
    }

    /// Puts back the owner returned by [`RenderContext::enter`].
    pub fn restore(&mut self, previous: Option<Owner>) {
        self.owner = previous;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_and_restore() {
        let mut ctx = RenderContext::new(Arc::new(RequestCache::new()));
        assert!(ctx.owner().is_none());

        let outer = ctx.enter("Page");
        let inner = ctx.enter("Header");
        assert_eq!(ctx.owner().map(Owner::path).as_deref(), Some("Page > Header"));

        ctx.restore(inner);
        assert_eq!(ctx.owner().map(Owner::name), Some("Page"));
        ctx.restore(outer);
        assert!(ctx.owner().is_none());
    }

    #[test]
    fn test_owner_chain() {
        let item = Owner::new("Page").child("List").child("Item");
        assert_eq!(item.path(), "Page > List > Item");
        assert_eq!(item.parent().map(Owner::name), Some("List"));
        assert_eq!(item.to_string(), "Item");
    }

    #[test]
    fn test_cache_is_shared() {
        let cache = Arc::new(RequestCache::new());
        let a = RenderContext::new(Arc::clone(&cache));
        let b = RenderContext::with_owner(Arc::clone(&cache), Some(Owner::new("List")));
        a.cache().get_or_compute("k", || 1_u8);
        assert_eq!(b.cache().get_or_compute("k", || 2_u8), 1);
        assert_eq!(b.owner().map(ToString::to_string), Some("List".into()));
    }
}
