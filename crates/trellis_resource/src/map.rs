//! Scoped resource instances.
//!
//! Maps form a chain from the innermost scope outwards (graph, snapshot,
//! process). A lookup resolves against the creator registry of the map it
//! started from; a creator of an outer scope is built and cached by the
//! ancestor map of that scope, so a process resource outlives every
//! snapshot that asked for it.

use crate::creator::{ResourceCreator, ResourceRef, ResourceScope};
use crate::error::{ResourceError, ResourceResult};
use crate::registry::CreatorRegistry;
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::sync::Arc;
use trellis_core::{ConfigContext, CoreResult};

fn downcast<T: Any + Send + Sync>(name: &str, value: ResourceRef) -> ResourceResult<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| ResourceError::TypeMismatch {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
        })
}

/// What a construction closure can see: its declared dependencies, already built
pub struct ResourceContext<'a> {
    resource: &'a str,
    config: Option<&'a str>,
    resolved: IndexMap<String, Option<ResourceRef>>,
}

impl<'a> ResourceContext<'a> {
    /// Name of the resource being built
    #[must_use]
    pub fn name(&self) -> &str {
        self.resource
    }

    /// Fetch a declared dependency
    ///
    /// # Errors
    ///
    /// Returns error if `dep` was not declared, is absent, or is not a `T`
    pub fn get<T: Any + Send + Sync>(&self, dep: &str) -> ResourceResult<Arc<T>> {
        self.get_optional(dep)?
            .ok_or_else(|| ResourceError::NotFound {
                name: dep.to_string(),
            })
    }

    /// Fetch a declared optional dependency
    ///
    /// # Errors
    ///
    /// Returns error if `dep` was not declared or is not a `T`
    pub fn get_optional<T: Any + Send + Sync>(&self, dep: &str) -> ResourceResult<Option<Arc<T>>> {
        match self.resolved.get(dep) {
            None => Err(ResourceError::UndeclaredDependency {
                resource: self.resource.to_string(),
                dependency: dep.to_string(),
            }),
            Some(None) => Ok(None),
            Some(Some(value)) => downcast(dep, value.clone()).map(Some),
        }
    }

    /// Config view over the creator's config block
    ///
    /// # Errors
    ///
    /// Returns error if the block is not a JSON object
    pub fn config(&self) -> CoreResult<ConfigContext<'static>> {
        ConfigContext::detached(self.config)
    }
}

/// Cache of built resources for one scope
pub struct ResourceMap {
    scope: ResourceScope,
    registry: Arc<CreatorRegistry>,
    parent: Option<Arc<ResourceMap>>,
    instances: Mutex<IndexMap<String, ResourceRef>>,
    substitutes: Mutex<IndexMap<String, String>>,
    // Held across a whole build so each name is constructed once; reentrant
    // because building one resource builds its dependencies in the same map.
    build_lock: ReentrantMutex<()>,
}

impl ResourceMap {
    /// Create a root map
    #[must_use]
    pub fn new(registry: Arc<CreatorRegistry>, scope: ResourceScope) -> Arc<Self> {
        Arc::new(Self {
            scope,
            registry,
            parent: None,
            instances: Mutex::new(IndexMap::new()),
            substitutes: Mutex::new(IndexMap::new()),
            build_lock: ReentrantMutex::new(()),
        })
    }

    /// Create a map nested inside `parent`
    ///
    /// # Errors
    ///
    /// Returns error if `scope` is not strictly inside the parent's scope
    pub fn child(
        parent: &Arc<Self>,
        registry: Arc<CreatorRegistry>,
        scope: ResourceScope,
    ) -> ResourceResult<Arc<Self>> {
        if scope <= parent.scope {
            return Err(ResourceError::ScopeMismatch {
                name: "<map>".to_string(),
                scope,
                from: parent.scope,
            });
        }
        Ok(Arc::new(Self {
            scope,
            registry,
            parent: Some(Arc::clone(parent)),
            instances: Mutex::new(IndexMap::new()),
            substitutes: Mutex::new(IndexMap::new()),
            build_lock: ReentrantMutex::new(()),
        }))
    }

    /// Scope of this map
    #[must_use]
    pub const fn scope(&self) -> ResourceScope {
        self.scope
    }

    /// Registry this map resolves against
    #[must_use]
    pub fn registry(&self) -> &Arc<CreatorRegistry> {
        &self.registry
    }

    /// Store an externally built instance under `name`
    pub fn insert<T: Any + Send + Sync>(&self, name: impl Into<String>, value: T) {
        self.instances.lock().insert(name.into(), Arc::new(value));
    }

    /// Store an already shared instance under `name`
    pub fn insert_ref(&self, name: impl Into<String>, value: ResourceRef) {
        self.instances.lock().insert(name.into(), value);
    }

    /// Whether `name` is cached in this map
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.instances.lock().contains_key(name)
    }

    /// Names cached in this map or any enclosing map
    #[must_use]
    pub fn visible_names(&self) -> IndexSet<String> {
        let mut names: IndexSet<String> = self.instances.lock().keys().cloned().collect();
        if let Some(parent) = &self.parent {
            names.extend(parent.visible_names());
        }
        names
    }

    /// Number of cached instances in this map
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    /// Whether nothing is cached in this map
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }

    /// Get or build a resource as an untyped reference
    ///
    /// # Errors
    ///
    /// Returns error if the resource is unknown or its build fails
    pub fn get_ref(&self, name: &str) -> ResourceResult<ResourceRef> {
        let mut chain = Vec::new();
        self.resolve(name, &self.registry, &mut chain)
    }

    /// Get or build a resource of type `T`
    ///
    /// # Errors
    ///
    /// Returns error if the resource is unknown, its build fails, or it is
    /// not a `T`
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> ResourceResult<Arc<T>> {
        downcast(name, self.get_ref(name)?)
    }

    /// Like `get`, but an unknown resource is `None`
    ///
    /// # Errors
    ///
    /// Returns error if the build fails or the resource is not a `T`
    pub fn get_optional<T: Any + Send + Sync>(&self, name: &str) -> ResourceResult<Option<Arc<T>>> {
        match self.get(name) {
            Ok(value) => Ok(Some(value)),
            Err(ResourceError::NotFound { name: missing }) if missing == name => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Build every creator of this map's scope, in dependency order
    ///
    /// # Errors
    ///
    /// Returns the first build failure
    pub fn build_scope(&self) -> ResourceResult<usize> {
        let names: Vec<String> = self
            .registry
            .names_in_scope(self.scope)
            .map(str::to_string)
            .collect();
        for name in &names {
            self.get_ref(name)?;
        }
        Ok(names.len())
    }

    /// Route future lookups of `target` to `replacement`.
    ///
    /// The cached target and everything that transitively depends on it are
    /// evicted; the evicted dependents are returned so their owners can be
    /// told to rebuild.
    ///
    /// # Errors
    ///
    /// Returns error if `replacement` is not a registered replacement of a
    /// target that enabled replacing
    pub fn substitute(&self, target: &str, replacement: &str) -> ResourceResult<Vec<String>> {
        let creator = self
            .registry
            .get(target)
            .ok_or_else(|| ResourceError::NotFound {
                name: target.to_string(),
            })?;
        if !creator.replace_enabled() || !creator.replace_by().contains(replacement) {
            return Err(ResourceError::ReplaceNotAllowed {
                target: target.to_string(),
                replacement: replacement.to_string(),
            });
        }

        let _guard = self.build_lock.lock();
        self.substitutes
            .lock()
            .insert(target.to_string(), replacement.to_string());

        let dependents = self.registry.transitive_dependents(target);
        let mut instances = self.instances.lock();
        instances.shift_remove(target);
        let mut evicted = Vec::new();
        for name in dependents {
            if instances.shift_remove(&name).is_some() {
                evicted.push(name);
            }
        }
        tracing::info!(
            target = target,
            replacement = replacement,
            evicted = evicted.len(),
            "Resource substituted"
        );
        Ok(evicted)
    }

    /// Drop every cached instance of this map
    pub fn clear(&self) {
        let _guard = self.build_lock.lock();
        let dropped = {
            let mut instances = self.instances.lock();
            let count = instances.len();
            instances.clear();
            count
        };
        tracing::debug!(scope = ?self.scope, dropped, "Resource map cleared");
    }

    fn resolve(
        &self,
        name: &str,
        registry: &CreatorRegistry,
        chain: &mut Vec<String>,
    ) -> ResourceResult<ResourceRef> {
        if let Some(found) = self.instances.lock().get(name) {
            return Ok(found.clone());
        }
        if !registry.is_initialized() {
            return Err(ResourceError::NotInitialized);
        }

        let creator_name = self
            .substitutes
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string());

        match registry.get(&creator_name) {
            None => match &self.parent {
                Some(parent) => parent.resolve(name, registry, chain),
                None => Err(ResourceError::NotFound {
                    name: name.to_string(),
                }),
            },
            Some(creator) if creator.scope() < self.scope => match &self.parent {
                Some(parent) => parent.resolve(name, registry, chain),
                None => Err(ResourceError::ScopeMismatch {
                    name: name.to_string(),
                    scope: creator.scope(),
                    from: self.scope,
                }),
            },
            Some(creator) if creator.scope() > self.scope => Err(ResourceError::ScopeMismatch {
                name: name.to_string(),
                scope: creator.scope(),
                from: self.scope,
            }),
            Some(creator) => self.build(name, creator, registry, chain),
        }
    }

    fn build(
        &self,
        name: &str,
        creator: &ResourceCreator,
        registry: &CreatorRegistry,
        chain: &mut Vec<String>,
    ) -> ResourceResult<ResourceRef> {
        let _guard = self.build_lock.lock();
        if let Some(found) = self.instances.lock().get(name) {
            return Ok(found.clone());
        }
        if let Some(start) = chain.iter().position(|n| n == name) {
            let mut cycle = chain[start..].to_vec();
            cycle.push(name.to_string());
            return Err(ResourceError::Cycle { chain: cycle });
        }

        chain.push(name.to_string());
        let mut resolved = IndexMap::new();
        for (dep, required) in creator.depends() {
            match self.resolve(dep, registry, chain) {
                Ok(value) => {
                    resolved.insert(dep.clone(), Some(value));
                }
                Err(ResourceError::NotFound { name: missing }) if missing == *dep => {
                    if *required {
                        let mut full = chain.clone();
                        full.push(dep.clone());
                        return Err(ResourceError::MissingDependency {
                            missing: dep.clone(),
                            chain: full,
                        });
                    }
                    resolved.insert(dep.clone(), None);
                }
                Err(e) => return Err(e),
            }
        }

        let ctx = ResourceContext {
            resource: name,
            config: creator.config(),
            resolved,
        };
        let value = creator
            .create(&ctx)
            .map_err(|e| ResourceError::ConstructionFailed {
                resource: name.to_string(),
                reason: e.to_string(),
                chain: chain.clone(),
            })?;
        chain.pop();

        tracing::debug!(resource = name, scope = ?self.scope, "Resource built");
        self.instances.lock().insert(name.to_string(), value.clone());
        Ok(value)
    }
}

impl std::fmt::Debug for ResourceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMap")
            .field("scope", &self.scope)
            .field("cached", &self.len())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(creators: Vec<ResourceCreator>) -> Arc<CreatorRegistry> {
        let mut registry = CreatorRegistry::new();
        for creator in creators {
            registry.register(creator).unwrap();
        }
        registry.post_init().unwrap();
        Arc::new(registry)
    }

    #[test]
    fn test_dependency_injection() {
        let registry = registry(vec![
            ResourceCreator::new("conn", ResourceScope::Snapshot, |_| Ok(String::from("db://x"))),
            ResourceCreator::new("pool", ResourceScope::Snapshot, |ctx| {
                let conn = ctx.get::<String>("conn")?;
                Ok(format!("pool({})", conn))
            })
            .depends_on("conn", true),
        ]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        let pool = map.get::<String>("pool").unwrap();
        assert_eq!(pool.as_str(), "pool(db://x)");
        assert!(map.contains("conn"));
    }

    #[test]
    fn test_singleton_under_contention() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = registry(vec![ResourceCreator::new(
            "heavy",
            ResourceScope::Snapshot,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                Ok(42u64)
            },
        )]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || *map.get::<u64>("heavy").unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_construction_failure_chain() {
        let registry = registry(vec![
            ResourceCreator::new("conn", ResourceScope::Snapshot, |_| {
                Err::<(), _>("refused".into())
            }),
            ResourceCreator::new("pool", ResourceScope::Snapshot, |_| Ok(()))
                .depends_on("conn", true),
            ResourceCreator::new("searcher", ResourceScope::Snapshot, |_| Ok(()))
                .depends_on("pool", true),
        ]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        assert_eq!(
            map.get_ref("searcher").err(),
            Some(ResourceError::ConstructionFailed {
                resource: "conn".to_string(),
                reason: "refused".to_string(),
                chain: vec![
                    "searcher".to_string(),
                    "pool".to_string(),
                    "conn".to_string()
                ],
            })
        );
        assert!(map.is_empty());
    }

    #[test]
    fn test_process_scope_shared_across_snapshots() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let process = ResourceCreator::new("cache", ResourceScope::Process, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        });
        let snapshot_registry = registry(vec![
            process.clone(),
            ResourceCreator::new("reader", ResourceScope::Snapshot, |ctx| {
                Ok(*ctx.get::<u32>("cache")? + 1)
            })
            .depends_on("cache", true),
        ]);

        let root = ResourceMap::new(registry(vec![process]), ResourceScope::Process);
        let first =
            ResourceMap::child(&root, Arc::clone(&snapshot_registry), ResourceScope::Snapshot).unwrap();
        let second = ResourceMap::child(&root, snapshot_registry, ResourceScope::Snapshot).unwrap();

        assert_eq!(*first.get::<u32>("reader").unwrap(), 8);
        assert_eq!(*second.get::<u32>("reader").unwrap(), 8);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(root.contains("cache"));
        assert!(!first.contains("cache"));
    }

    #[test]
    fn test_child_scope_must_be_inner() {
        let root = ResourceMap::new(registry(vec![]), ResourceScope::Snapshot);
        assert!(ResourceMap::child(&root, registry(vec![]), ResourceScope::Process).is_err());
        assert!(ResourceMap::child(&root, registry(vec![]), ResourceScope::Graph).is_ok());
    }

    #[test]
    fn test_inner_scope_not_built_in_outer_map() {
        let registry = registry(vec![ResourceCreator::new(
            "per_graph",
            ResourceScope::Graph,
            |_| Ok(()),
        )]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        assert!(matches!(
            map.get_ref("per_graph"),
            Err(ResourceError::ScopeMismatch { .. })
        ));
    }

    #[test]
    fn test_optional_and_type_mismatch() {
        let registry = registry(vec![
            ResourceCreator::new("n", ResourceScope::Snapshot, |_| Ok(1i32)),
            ResourceCreator::new("uses_metrics", ResourceScope::Snapshot, |ctx| {
                Ok(ctx.get_optional::<u8>("metrics")?.is_none())
            })
            .depends_on("metrics", false),
        ]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        assert!(map.get_optional::<i32>("absent").unwrap().is_none());
        assert!(*map.get::<bool>("uses_metrics").unwrap());
        assert!(matches!(
            map.get::<String>("n"),
            Err(ResourceError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_undeclared_dependency_rejected() {
        let registry = registry(vec![
            ResourceCreator::new("a", ResourceScope::Snapshot, |_| Ok(1u8)),
            ResourceCreator::new("b", ResourceScope::Snapshot, |ctx| Ok(*ctx.get::<u8>("a")?)),
        ]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        assert!(matches!(
            map.get_ref("b"),
            Err(ResourceError::ConstructionFailed { .. })
        ));
    }

    #[test]
    fn test_substitute_evicts_dependents() {
        let registry = registry(vec![
            ResourceCreator::new("store", ResourceScope::Snapshot, |_| Ok("real")).enable_replace(),
            ResourceCreator::new("mock_store", ResourceScope::Snapshot, |_| Ok("mock"))
                .replaces("store"),
            ResourceCreator::new("index", ResourceScope::Snapshot, |ctx| {
                Ok(format!("index over {}", ctx.get::<&'static str>("store")?))
            })
            .depends_on("store", true),
        ]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        assert_eq!(map.get::<String>("index").unwrap().as_str(), "index over real");

        let evicted = map.substitute("store", "mock_store").unwrap();
        assert_eq!(evicted, vec!["index".to_string()]);
        assert_eq!(map.get::<String>("index").unwrap().as_str(), "index over mock");

        assert!(matches!(
            map.substitute("index", "mock_store"),
            Err(ResourceError::ReplaceNotAllowed { .. })
        ));
    }

    #[test]
    fn test_creator_config_visible() {
        let registry = registry(vec![ResourceCreator::new(
            "sized",
            ResourceScope::Snapshot,
            |ctx| Ok(ctx.config()?.get_or("size", 1u32)?),
        )
        .with_config(r#"{"size": 16}"#)]);
        let map = ResourceMap::new(registry, ResourceScope::Snapshot);
        assert_eq!(*map.get::<u32>("sized").unwrap(), 16);
    }

    #[test]
    fn test_uninitialized_registry() {
        let mut raw = CreatorRegistry::new();
        raw.register(ResourceCreator::new("a", ResourceScope::Snapshot, |_| Ok(())))
            .unwrap();
        let map = ResourceMap::new(Arc::new(raw), ResourceScope::Snapshot);
        assert_eq!(map.get_ref("a").err(), Some(ResourceError::NotInitialized));
    }
}
