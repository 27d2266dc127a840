//! Resource errors.

use crate::creator::ResourceScope;

/// Error from registry and resource map operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// Creator registered twice
    #[error("Resource already registered: {name}")]
    AlreadyRegistered {
        /// Resource name
        name: String,
    },

    /// No creator or instance under this name
    #[error("Resource not found: {name}")]
    NotFound {
        /// Resource name
        name: String,
    },

    /// Registry used before `post_init`
    #[error("Creator registry used before post_init")]
    NotInitialized,

    /// A required dependency has no creator
    #[error("Missing required dependency {missing} (via {})", chain.join(" -> "))]
    MissingDependency {
        /// The dependency that is missing
        missing: String,
        /// Dependency chain from the requested resource
        chain: Vec<String>,
    },

    /// Dependencies form a cycle
    #[error("Dependency cycle: {}", chain.join(" -> "))]
    Cycle {
        /// Names along the cycle, first and last equal
        chain: Vec<String>,
    },

    /// A construction closure failed
    #[error("Construction of {resource} failed: {reason} (via {})", chain.join(" -> "))]
    ConstructionFailed {
        /// Resource whose closure failed
        resource: String,
        /// Closure error
        reason: String,
        /// Dependency chain from the requested resource
        chain: Vec<String>,
    },

    /// Replacement not permitted by the target
    #[error("{replacement} cannot replace {target}")]
    ReplaceNotAllowed {
        /// Resource being replaced
        target: String,
        /// Would-be replacement
        replacement: String,
    },

    /// Stored instance has a different type
    #[error("Resource {name} is not a {expected}")]
    TypeMismatch {
        /// Resource name
        name: String,
        /// Requested type
        expected: &'static str,
    },

    /// Scope rules violated
    #[error("Resource {name} with scope {scope:?} is not reachable from scope {from:?}")]
    ScopeMismatch {
        /// Resource name
        name: String,
        /// Scope the creator declares
        scope: ResourceScope,
        /// Scope of the lookup or dependent
        from: ResourceScope,
    },

    /// A construction closure asked for something it never declared
    #[error("{resource} did not declare a dependency on {dependency}")]
    UndeclaredDependency {
        /// Resource being built
        resource: String,
        /// Undeclared dependency
        dependency: String,
    },
}

/// Result alias for resource operations
pub type ResourceResult<T> = Result<T, ResourceError>;
