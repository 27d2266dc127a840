//! Resource creators: named factories with declared dependencies.

use crate::map::ResourceContext;
use indexmap::{IndexMap, IndexSet};
use std::any::Any;
use std::sync::Arc;

/// A shared resource instance
pub type ResourceRef = Arc<dyn Any + Send + Sync>;

/// Error type construction closures may return
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Factory = Arc<dyn Fn(&ResourceContext<'_>) -> Result<ResourceRef, BoxError> + Send + Sync>;

/// Lifetime of a resource instance.
///
/// Ordered from the outermost scope to the innermost: a resource may only
/// depend on resources of its own scope or an outer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceScope {
    /// Built once per process, shared by every snapshot
    Process,
    /// Built once per configuration snapshot
    Snapshot,
    /// Built fresh for every graph execution
    Graph,
}

/// A named resource factory
#[derive(Clone)]
pub struct ResourceCreator {
    name: String,
    scope: ResourceScope,
    depends: IndexMap<String, bool>,
    replaces: IndexSet<String>,
    enable_replace: bool,
    config: Option<String>,
    factory: Factory,
    pub(crate) init_depend_resources: IndexSet<String>,
    pub(crate) depend_by: IndexSet<String>,
    pub(crate) replace_by: IndexSet<String>,
}

impl ResourceCreator {
    /// Create a creator whose closure builds a `T`
    #[must_use]
    pub fn new<T, F>(name: impl Into<String>, scope: ResourceScope, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&ResourceContext<'_>) -> Result<T, BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            scope,
            depends: IndexMap::new(),
            replaces: IndexSet::new(),
            enable_replace: false,
            config: None,
            factory: Arc::new(move |ctx| factory(ctx).map(|value| Arc::new(value) as ResourceRef)),
            init_depend_resources: IndexSet::new(),
            depend_by: IndexSet::new(),
            replace_by: IndexSet::new(),
        }
    }

    /// Declare a dependency
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>, required: bool) -> Self {
        self.depends.insert(name.into(), required);
        self
    }

    /// Declare this creator as an alternate implementation of `target`
    #[must_use]
    pub fn replaces(mut self, target: impl Into<String>) -> Self {
        self.replaces.insert(target.into());
        self
    }

    /// Allow registered replacements to substitute for this resource
    #[must_use]
    pub fn enable_replace(mut self) -> Self {
        self.enable_replace = true;
        self
    }

    /// Attach a JSON config block, readable from the construction closure
    #[must_use]
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Resource name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared scope
    #[must_use]
    pub const fn scope(&self) -> ResourceScope {
        self.scope
    }

    /// Direct dependencies and whether each is required
    #[must_use]
    pub fn depends(&self) -> &IndexMap<String, bool> {
        &self.depends
    }

    /// Targets this creator can stand in for
    #[must_use]
    pub fn replace_targets(&self) -> &IndexSet<String> {
        &self.replaces
    }

    /// Whether replacements may substitute for this resource
    #[must_use]
    pub const fn replace_enabled(&self) -> bool {
        self.enable_replace
    }

    /// Config block
    #[must_use]
    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    /// Every resource that must exist before this one, filled by `post_init`
    #[must_use]
    pub fn init_depend_resources(&self) -> &IndexSet<String> {
        &self.init_depend_resources
    }

    /// Resources that directly depend on this one, filled by `post_init`
    #[must_use]
    pub fn depend_by(&self) -> &IndexSet<String> {
        &self.depend_by
    }

    /// Registered replacements, filled by `post_init`
    #[must_use]
    pub fn replace_by(&self) -> &IndexSet<String> {
        &self.replace_by
    }

    pub(crate) fn create(&self, ctx: &ResourceContext<'_>) -> Result<ResourceRef, BoxError> {
        (self.factory)(ctx)
    }
}

impl std::fmt::Debug for ResourceCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceCreator")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("depends", &self.depends)
            .field("replaces", &self.replaces)
            .field("enable_replace", &self.enable_replace)
            .finish_non_exhaustive()
    }
}
