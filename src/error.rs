//! Error types for the container.

use thiserror::Error;

/// Errors raised during registration, resolution, or scope operations.
///
/// Every failure in the container surfaces as one of these variants; the
/// message embeds the involved service types and, where useful, the
/// resolution chain that led to the failure.
#[derive(Error, Debug, Clone)]
pub enum DiError {
    /// No factory matched the request and the caller asked to throw
    #[error("unable to resolve {request}")]
    UnableToResolve { request: String },

    /// More than one default registration and no selector rule installed
    #[error("expected a single default factory for {service}, found {count}")]
    ExpectedSingleDefaultFactory { service: String, count: usize },

    /// Named registration collides with an existing name
    #[error("service name {name:?} is already registered for {service}")]
    DuplicateServiceName { service: String, name: String },

    /// Implementation type cannot be assigned to the service type
    #[error("implementation {impl_type} is not assignable to service {service}")]
    ExpectedImplAssignableToService { impl_type: String, service: String },

    /// Open-generic implementation registered against a non-generic service
    #[error("unable to register open-generic implementation {impl_type} with non-generic service {service}")]
    UnableToRegisterOpenGenericImplWithNonGenericService { impl_type: String, service: String },

    /// Service does not bind all of the implementation's type parameters
    #[error("service {service} does not specify all type args of open-generic implementation {impl_type}")]
    OpenGenericServiceDoesNotSpecifyAllTypeArgs { impl_type: String, service: String },

    /// Specialization could not derive an implementation type argument
    #[error("unable to find type argument of open-generic implementation {impl_type} when closing over {service}")]
    UnableToFindOpenGenericImplTypeArg { impl_type: String, service: String },

    /// Resolution requested with an open-generic service type
    #[error("expected a closed generic service type, got {service}")]
    ExpectedClosedGenericServiceType { service: String },

    /// Reflection factory registered against an abstract implementation
    #[error("expected a non-abstract implementation type, got {impl_type}")]
    ExpectedNonAbstractImplType { impl_type: String },

    /// Implementation declares no public constructor
    #[error("no public constructor defined for {impl_type}")]
    NoPublicConstructorDefined { impl_type: String },

    /// Multiple constructors and no selector to pick one
    #[error("unable to select from {count} constructors of {impl_type} without a constructor selector")]
    UnableToSelectConstructor { impl_type: String, count: usize },

    /// Function-wrapper argument matching left constructor parameters unfilled
    #[error("constructor of {impl_type} misses some parameters required by {func}")]
    ConstructorMissesSomeParameters { impl_type: String, func: String },

    /// Function wrapper type carries no argument to bind the result to
    #[error("expected function type with at least one type argument, got {func}")]
    ExpectedFuncWithMultipleArgs { func: String },

    /// Factory kind cannot consume function-wrapper arguments
    #[error("{func} with arguments is not supported by the factory resolved for {request}")]
    UnsupportedFuncWithArgs { func: String, request: String },

    /// Function wrapper declared arguments nothing consumed
    #[error("some arguments of {func} are unused when resolving {request}")]
    SomeFuncParamsAreUnused { func: String, request: String },

    /// Cycle in the request chain
    #[error("recursive dependency detected in {request}")]
    RecursiveDependencyDetected { request: String },

    /// Operation on a scope after teardown
    #[error("scope {scope} is disposed")]
    ScopeIsDisposed { scope: String },

    /// Weak container handle targets a torn-down container
    #[error("container is gone; cannot resolve {service} from a dead reference")]
    ContainerIsGarbageCollected { service: String },

    /// Collection resolution found no registered items
    #[error("unable to find registered items for collection of {item}")]
    UnableToFindRegisteredEnumerableItems { item: String },

    /// Collection resolution found items but none could be resolved
    #[error("unable to resolve any item for collection of {item}")]
    UnableToResolveEnumerableItems { item: String },

    /// User delegate produced no expression
    #[error("delegate factory returned no expression for {request}")]
    DelegateFactoryExpressionReturnedNull { request: String },

    /// Decorator cannot be materialized as a unary function over the service
    #[error("decorator {impl_type} should support resolution as a function of the decorated {service}")]
    DecoratorFactoryShouldSupportFuncResolution { impl_type: String, service: String },

    /// Wrapper with several type args and no explicit wrapped-arg selector
    #[error("generic wrapper {service} expects a single type argument by default")]
    GenericWrapperExpectsSingleTypeArgByDefault { service: String },

    /// Atomic cache swap exceeded its retry bound
    #[error("state swap retries exhausted after {attempts} attempts")]
    RetryExhausted { attempts: usize },

    /// Resolved object does not downcast to the requested type
    #[error("type mismatch: resolved object for {service} is not of the requested type")]
    TypeMismatch { service: String },

    /// Invariant violation inside the container
    #[error("internal container error: {0}")]
    Internal(String),
}

impl DiError {
    #[inline]
    pub(crate) fn unable_to_resolve(request: impl ToString) -> Self {
        Self::UnableToResolve { request: request.to_string() }
    }

    #[inline]
    pub(crate) fn recursive(request: impl ToString) -> Self {
        Self::RecursiveDependencyDetected { request: request.to_string() }
    }

    #[inline]
    pub(crate) fn type_mismatch(service: impl ToString) -> Self {
        Self::TypeMismatch { service: service.to_string() }
    }
}

/// Result type alias for container operations
pub type DiResult<T> = std::result::Result<T, DiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_service() {
        let err = DiError::unable_to_resolve("IService");
        assert!(err.to_string().contains("IService"));

        let err = DiError::ExpectedSingleDefaultFactory { service: "IService".into(), count: 2 };
        assert!(err.to_string().contains("found 2"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = DiError::ScopeIsDisposed { scope: "scope-3".into() };
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
