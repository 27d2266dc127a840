//! Creator registry and dependency analysis.

use crate::creator::{ResourceCreator, ResourceScope};
use crate::error::{ResourceError, ResourceResult};
use indexmap::{IndexMap, IndexSet};

/// Registered creators of one snapshot (or of the process)
#[derive(Debug, Default, Clone)]
pub struct CreatorRegistry {
    creators: IndexMap<String, ResourceCreator>,
    provided: IndexSet<String>,
    build_order: Vec<String>,
    initialized: bool,
}

impl CreatorRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a creator
    ///
    /// # Errors
    ///
    /// Returns error if a creator with the same name exists
    pub fn register(&mut self, creator: ResourceCreator) -> ResourceResult<()> {
        if self.creators.contains_key(creator.name()) {
            return Err(ResourceError::AlreadyRegistered {
                name: creator.name().to_string(),
            });
        }
        self.creators.insert(creator.name().to_string(), creator);
        self.initialized = false;
        Ok(())
    }

    /// Builder-style register
    ///
    /// # Errors
    ///
    /// Returns error if a creator with the same name exists
    pub fn with(mut self, creator: ResourceCreator) -> ResourceResult<Self> {
        self.register(creator)?;
        Ok(self)
    }

    /// Compute transitive dependencies, reverse edges and the build order.
    ///
    /// Missing optional dependencies are skipped. Must run once after the
    /// last `register` and before any resource is built.
    ///
    /// # Errors
    ///
    /// Returns error on a missing required dependency, a dependency cycle,
    /// a scope violation, or a replacement the target does not allow
    pub fn post_init(&mut self) -> ResourceResult<()> {
        self.post_init_with(std::iter::empty::<String>())
    }

    /// Like [`CreatorRegistry::post_init`], with `provided` naming resources
    /// an enclosing scope supplies. A required dependency on one of them is
    /// satisfied without a creator here; the map chain resolves it at build
    /// time.
    ///
    /// # Errors
    ///
    /// Same as [`CreatorRegistry::post_init`]
    pub fn post_init_with<I, S>(&mut self, provided: I) -> ResourceResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provided = provided.into_iter().map(Into::into).collect();
        for creator in self.creators.values_mut() {
            creator.init_depend_resources.clear();
            creator.depend_by.clear();
            creator.replace_by.clear();
        }

        self.link_replacements()?;

        let mut done: IndexMap<String, IndexSet<String>> = IndexMap::new();
        let mut order = Vec::with_capacity(self.creators.len());
        let names: Vec<String> = self.creators.keys().cloned().collect();
        for name in &names {
            let mut path = Vec::new();
            self.collect(name, &mut path, &mut done, &mut order)?;
        }

        for (name, deps) in done {
            if let Some(creator) = self.creators.get_mut(&name) {
                creator.init_depend_resources = deps;
            }
        }

        let mut reverse: Vec<(String, String)> = Vec::new();
        for creator in self.creators.values() {
            for dep in creator.depends().keys() {
                if self.creators.contains_key(dep) {
                    reverse.push((dep.clone(), creator.name().to_string()));
                }
            }
        }
        for (dep, dependent) in reverse {
            if let Some(creator) = self.creators.get_mut(&dep) {
                creator.depend_by.insert(dependent);
            }
        }

        tracing::debug!(creators = self.creators.len(), "Creator registry initialized");
        self.build_order = order;
        self.initialized = true;
        Ok(())
    }

    fn link_replacements(&mut self) -> ResourceResult<()> {
        let mut links: Vec<(String, String)> = Vec::new();
        for creator in self.creators.values() {
            for target in creator.replace_targets() {
                let target_creator =
                    self.creators
                        .get(target)
                        .ok_or_else(|| ResourceError::NotFound {
                            name: target.clone(),
                        })?;
                if !target_creator.replace_enabled() {
                    return Err(ResourceError::ReplaceNotAllowed {
                        target: target.clone(),
                        replacement: creator.name().to_string(),
                    });
                }
                if target_creator.scope() != creator.scope() {
                    return Err(ResourceError::ScopeMismatch {
                        name: creator.name().to_string(),
                        scope: creator.scope(),
                        from: target_creator.scope(),
                    });
                }
                links.push((target.clone(), creator.name().to_string()));
            }
        }
        for (target, replacement) in links {
            if let Some(creator) = self.creators.get_mut(&target) {
                creator.replace_by.insert(replacement);
            }
        }
        Ok(())
    }

    /// Depth-first walk; `path` is the chain from the root of this walk
    fn collect(
        &self,
        name: &str,
        path: &mut Vec<String>,
        done: &mut IndexMap<String, IndexSet<String>>,
        order: &mut Vec<String>,
    ) -> ResourceResult<IndexSet<String>> {
        if let Some(deps) = done.get(name) {
            return Ok(deps.clone());
        }
        if let Some(start) = path.iter().position(|n| n == name) {
            let mut chain = path[start..].to_vec();
            chain.push(name.to_string());
            return Err(ResourceError::Cycle { chain });
        }

        let creator = self
            .creators
            .get(name)
            .ok_or_else(|| ResourceError::NotFound {
                name: name.to_string(),
            })?;

        path.push(name.to_string());
        let mut deps = IndexSet::new();
        for (dep, required) in creator.depends() {
            match self.creators.get(dep) {
                Some(dep_creator) => {
                    if dep_creator.scope() > creator.scope() {
                        return Err(ResourceError::ScopeMismatch {
                            name: dep.clone(),
                            scope: dep_creator.scope(),
                            from: creator.scope(),
                        });
                    }
                    let nested = self.collect(dep, path, done, order)?;
                    deps.extend(nested);
                    deps.insert(dep.clone());
                }
                None if *required && !self.provided.contains(dep) => {
                    let mut chain = path.clone();
                    chain.push(dep.clone());
                    return Err(ResourceError::MissingDependency {
                        missing: dep.clone(),
                        chain,
                    });
                }
                None => {}
            }
        }
        path.pop();

        order.push(name.to_string());
        done.insert(name.to_string(), deps.clone());
        Ok(deps)
    }

    /// Whether `post_init` ran after the last registration
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Look up a creator
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceCreator> {
        self.creators.get(name)
    }

    /// Whether a creator exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.creators.contains_key(name)
    }

    /// Number of creators
    #[must_use]
    pub fn len(&self) -> usize {
        self.creators.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creators.is_empty()
    }

    /// Names in dependency order: every resource after all its dependencies
    #[must_use]
    pub fn build_order(&self) -> &[String] {
        &self.build_order
    }

    /// Build-ordered names of creators with the given scope
    pub fn names_in_scope(&self, scope: ResourceScope) -> impl Iterator<Item = &str> + '_ {
        self.build_order
            .iter()
            .filter(move |name| self.creators.get(*name).is_some_and(|c| c.scope() == scope))
            .map(String::as_str)
    }

    /// Every resource that depends on `name`, directly or transitively
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> IndexSet<String> {
        let mut out = IndexSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(creator) = self.creators.get(&current) {
                for dependent in creator.depend_by() {
                    if out.insert(dependent.clone()) {
                        pending.push(dependent.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn creator(name: &str) -> ResourceCreator {
        ResourceCreator::new(name, ResourceScope::Snapshot, |_| Ok(()))
    }

    #[test]
    fn test_register_duplicate() {
        let mut registry = CreatorRegistry::new();
        registry.register(creator("a")).unwrap();
        assert_eq!(
            registry.register(creator("a")),
            Err(ResourceError::AlreadyRegistered {
                name: "a".to_string()
            })
        );
    }

    #[test]
    fn test_post_init_transitive() {
        let mut registry = CreatorRegistry::new()
            .with(creator("searcher").depends_on("pool", true))
            .unwrap()
            .with(creator("pool").depends_on("conn", true))
            .unwrap()
            .with(creator("conn"))
            .unwrap();
        registry.post_init().unwrap();

        let searcher = registry.get("searcher").unwrap();
        assert!(searcher.init_depend_resources().contains("pool"));
        assert!(searcher.init_depend_resources().contains("conn"));
        assert!(registry.get("conn").unwrap().depend_by().contains("pool"));
        assert_eq!(registry.build_order(), ["conn", "pool", "searcher"]);

        let dependents = registry.transitive_dependents("conn");
        assert!(dependents.contains("pool"));
        assert!(dependents.contains("searcher"));
    }

    #[test]
    fn test_missing_required_reports_chain() {
        let mut registry = CreatorRegistry::new()
            .with(creator("searcher").depends_on("pool", true))
            .unwrap()
            .with(creator("pool").depends_on("conn", true))
            .unwrap();
        assert_eq!(
            registry.post_init(),
            Err(ResourceError::MissingDependency {
                missing: "conn".to_string(),
                chain: vec![
                    "searcher".to_string(),
                    "pool".to_string(),
                    "conn".to_string()
                ],
            })
        );
        assert!(!registry.is_initialized());
    }

    #[test]
    fn test_missing_optional_skipped() {
        let mut registry = CreatorRegistry::new()
            .with(creator("a").depends_on("metrics", false))
            .unwrap();
        registry.post_init().unwrap();
        assert!(registry.get("a").unwrap().init_depend_resources().is_empty());
    }

    #[test]
    fn test_cycle_detected() {
        let mut registry = CreatorRegistry::new()
            .with(creator("a").depends_on("b", true))
            .unwrap()
            .with(creator("b").depends_on("c", true))
            .unwrap()
            .with(creator("c").depends_on("a", true))
            .unwrap();
        match registry.post_init() {
            Err(ResourceError::Cycle { chain }) => {
                assert_eq!(chain, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_outer_scope_cannot_depend_on_inner() {
        let mut registry = CreatorRegistry::new()
            .with(ResourceCreator::new("proc", ResourceScope::Process, |_| Ok(())).depends_on("g", true))
            .unwrap()
            .with(ResourceCreator::new("g", ResourceScope::Graph, |_| Ok(())))
            .unwrap();
        assert!(matches!(
            registry.post_init(),
            Err(ResourceError::ScopeMismatch { .. })
        ));
    }

    #[test]
    fn test_replacement_requires_enable() {
        let mut registry = CreatorRegistry::new()
            .with(creator("store"))
            .unwrap()
            .with(creator("mock_store").replaces("store"))
            .unwrap();
        assert_eq!(
            registry.post_init(),
            Err(ResourceError::ReplaceNotAllowed {
                target: "store".to_string(),
                replacement: "mock_store".to_string(),
            })
        );

        let mut registry = CreatorRegistry::new()
            .with(creator("store").enable_replace())
            .unwrap()
            .with(creator("mock_store").replaces("store"))
            .unwrap();
        registry.post_init().unwrap();
        assert!(registry.get("store").unwrap().replace_by().contains("mock_store"));
    }

    #[test]
    fn test_names_in_scope() {
        let mut registry = CreatorRegistry::new()
            .with(ResourceCreator::new("p", ResourceScope::Process, |_| Ok(())))
            .unwrap()
            .with(creator("s").depends_on("p", true))
            .unwrap();
        registry.post_init().unwrap();
        let snapshot: Vec<&str> = registry.names_in_scope(ResourceScope::Snapshot).collect();
        assert_eq!(snapshot, vec!["s"]);
    }

    #[test]
    fn test_required_dependency_provided_by_outer_scope() {
        let mut registry = CreatorRegistry::new()
            .with(creator("cache").depends_on("pool_resource", true))
            .unwrap();
        assert!(matches!(
            registry.post_init(),
            Err(ResourceError::MissingDependency { .. })
        ));

        registry.post_init_with(["pool_resource"]).unwrap();
        assert!(registry.is_initialized());
        assert_eq!(registry.build_order(), &["cache".to_string()]);
        assert!(registry.transitive_dependents("pool_resource").is_empty());
    }

    proptest! {
        #[test]
        fn prop_build_order_respects_dependencies(
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            // Only edges from higher to lower index, so the graph is acyclic.
            let mut creators: Vec<ResourceCreator> =
                (0..12).map(|i| creator(&format!("r{}", i))).collect();
            for (a, b) in edges {
                if a > b {
                    let taken = std::mem::replace(&mut creators[a], creator("tmp"));
                    creators[a] = taken.depends_on(format!("r{}", b), true);
                }
            }
            let mut registry = CreatorRegistry::new();
            for c in creators {
                registry.register(c).unwrap();
            }
            registry.post_init().unwrap();

            let order = registry.build_order();
            prop_assert_eq!(order.len(), 12);
            for (pos, name) in order.iter().enumerate() {
                for dep in registry.get(name).unwrap().depends().keys() {
                    let dep_pos = order.iter().position(|n| n == dep).unwrap();
                    prop_assert!(dep_pos < pos);
                }
            }
        }
    }
}
