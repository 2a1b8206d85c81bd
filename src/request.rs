//! Resolution request chains.
//!
//! A request is an immutable frame linked to its parent; pushing a
//! dependency allocates a new frame and `resolve_to` pins the selected
//! factory onto a copy. The chain drives recursion detection and is
//! embedded into error messages.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DiError, DiResult};
use crate::expr::{LambdaParam, ParamId};
use crate::factory::{Factory, FactoryId, FactoryType};
use crate::types::{ServiceKey, ServiceType};
use crate::Object;

/// What a child request is being resolved for.
#[derive(Clone, Copy, Debug)]
pub enum DependencyInfo {
    CtorParam { name: &'static str },
    Member { name: &'static str },
}

/// Function-wrapper arguments offered to constructor matching.
///
/// Shared down the subtree of the wrapper request; `try_match` consumes
/// parameters greedily, first unused match by type.
pub struct FuncArgs {
    func_type: ServiceType,
    params: Vec<LambdaParam>,
    used: Vec<AtomicBool>,
}

impl FuncArgs {
    pub fn new(func_type: ServiceType, params: Vec<LambdaParam>) -> Self {
        let used = params.iter().map(|_| AtomicBool::new(false)).collect();
        Self { func_type, params, used }
    }

    pub fn func_type(&self) -> &ServiceType {
        &self.func_type
    }

    /// Claim the first unused parameter of the given type.
    pub fn try_match(&self, ty: &ServiceType) -> Option<ParamId> {
        for (param, used) in self.params.iter().zip(&self.used) {
            if param.ty == *ty
                && used
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return Some(param.id);
            }
        }
        None
    }

    pub fn unused_count(&self) -> usize {
        self.used.iter().filter(|u| !u.load(Ordering::Acquire)).count()
    }
}

struct Frame {
    parent: Option<Request>,
    service_type: ServiceType,
    service_key: ServiceKey,
    dependency: Option<DependencyInfo>,
    factory_id: FactoryId,
    factory_type: FactoryType,
    impl_type: Option<ServiceType>,
    metadata: Option<Object>,
    decorated_factory_id: FactoryId,
    func_args: Option<Arc<FuncArgs>>,
}

/// A frame in the in-flight resolution chain.
#[derive(Clone)]
pub struct Request(Arc<Frame>);

impl Request {
    /// Start a chain for a top-level resolution.
    pub fn root(service_type: ServiceType, service_key: ServiceKey) -> Self {
        Self(Arc::new(Frame {
            parent: None,
            service_type,
            service_key,
            dependency: None,
            factory_id: 0,
            factory_type: FactoryType::Service,
            impl_type: None,
            metadata: None,
            decorated_factory_id: 0,
            func_args: None,
        }))
    }

    /// Push a dependency frame with its own key.
    pub fn push(
        &self,
        service_type: ServiceType,
        service_key: ServiceKey,
        dependency: Option<DependencyInfo>,
    ) -> Self {
        Self(Arc::new(Frame {
            parent: Some(self.clone()),
            service_type,
            service_key,
            dependency,
            factory_id: 0,
            factory_type: FactoryType::Service,
            impl_type: None,
            metadata: None,
            decorated_factory_id: self.0.decorated_factory_id,
            func_args: None,
        }))
    }

    /// Push a dependency frame inheriting this frame's key.
    ///
    /// Wrappers resolve their wrapped service under the key the wrapper
    /// itself was requested with.
    pub fn push_preserving_parent_key(
        &self,
        service_type: ServiceType,
        dependency: Option<DependencyInfo>,
    ) -> Self {
        self.push(service_type, self.0.service_key.clone(), dependency)
    }

    /// Attach function-wrapper arguments to this frame.
    pub fn with_func_args(&self, func_args: Arc<FuncArgs>) -> Self {
        Self(Arc::new(Frame {
            parent: self.0.parent.clone(),
            service_type: self.0.service_type.clone(),
            service_key: self.0.service_key.clone(),
            dependency: self.0.dependency,
            factory_id: self.0.factory_id,
            factory_type: self.0.factory_type,
            impl_type: self.0.impl_type.clone(),
            metadata: self.0.metadata.clone(),
            decorated_factory_id: self.0.decorated_factory_id,
            func_args: Some(func_args),
        }))
    }

    /// Pin the selected factory onto this frame.
    ///
    /// Walks the ancestor chain first: a service factory appearing twice
    /// means the dependency graph loops back into itself.
    pub fn resolve_to(&self, factory: &Factory) -> DiResult<Request> {
        if factory.factory_type() == FactoryType::Service {
            let mut current = self.0.parent.as_ref();
            while let Some(request) = current {
                if request.0.factory_id == factory.id()
                    && request.0.factory_type == FactoryType::Service
                {
                    return Err(DiError::recursive(self));
                }
                current = request.0.parent.as_ref();
            }
        }
        Ok(Self(Arc::new(Frame {
            parent: self.0.parent.clone(),
            service_type: self.0.service_type.clone(),
            service_key: self.0.service_key.clone(),
            dependency: self.0.dependency,
            factory_id: factory.id(),
            factory_type: factory.factory_type(),
            impl_type: factory.impl_service_type(),
            metadata: factory.setup().metadata(),
            decorated_factory_id: self.0.decorated_factory_id,
            func_args: self.0.func_args.clone(),
        })))
    }

    /// Stamp the resolved factory as decorated, so a decorator body that
    /// resolves the same service does not re-enter its own decoration.
    pub fn make_decorated(&self) -> Request {
        Self(Arc::new(Frame {
            parent: self.0.parent.clone(),
            service_type: self.0.service_type.clone(),
            service_key: self.0.service_key.clone(),
            dependency: self.0.dependency,
            factory_id: self.0.factory_id,
            factory_type: self.0.factory_type,
            impl_type: self.0.impl_type.clone(),
            metadata: self.0.metadata.clone(),
            decorated_factory_id: self.0.factory_id,
            func_args: self.0.func_args.clone(),
        }))
    }

    /// Nearest ancestor that is not a generic-wrapper frame.
    pub fn non_wrapper_parent(&self) -> Option<Request> {
        let mut current = self.0.parent.clone();
        while let Some(request) = current {
            if request.0.factory_type != FactoryType::Wrapper {
                return Some(request);
            }
            current = request.0.parent.clone();
        }
        None
    }

    /// Nearest function-wrapper arguments on this frame or an ancestor.
    pub fn func_args(&self) -> Option<Arc<FuncArgs>> {
        let mut current = Some(self.clone());
        while let Some(request) = current {
            if let Some(args) = request.0.func_args.as_ref() {
                return Some(args.clone());
            }
            current = request.0.parent.clone();
        }
        None
    }

    /// True when any ancestor frame resolves a function-type wrapper,
    /// which forces deferred (scoped) singleton capture.
    pub fn has_func_ancestor(&self) -> bool {
        let mut current = self.0.parent.clone();
        while let Some(request) = current {
            if request.0.factory_type == FactoryType::Wrapper
                && crate::wrappers::is_func_type(&request.0.service_type)
            {
                return true;
            }
            current = request.0.parent.clone();
        }
        false
    }

    #[inline]
    pub fn parent(&self) -> Option<Request> {
        self.0.parent.clone()
    }

    #[inline]
    pub fn service_type(&self) -> &ServiceType {
        &self.0.service_type
    }

    #[inline]
    pub fn service_key(&self) -> &ServiceKey {
        &self.0.service_key
    }

    #[inline]
    pub fn dependency(&self) -> Option<DependencyInfo> {
        self.0.dependency
    }

    #[inline]
    pub fn factory_id(&self) -> FactoryId {
        self.0.factory_id
    }

    #[inline]
    pub fn factory_type(&self) -> FactoryType {
        self.0.factory_type
    }

    #[inline]
    pub fn impl_type(&self) -> Option<&ServiceType> {
        self.0.impl_type.as_ref()
    }

    #[inline]
    pub fn metadata(&self) -> Option<&Object> {
        self.0.metadata.as_ref()
    }

    #[inline]
    pub fn decorated_factory_id(&self) -> FactoryId {
        self.0.decorated_factory_id
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current = Some(self.clone());
        let mut first = true;
        while let Some(request) = current {
            if !first {
                f.write_str(" <- ")?;
            }
            first = false;
            write!(f, "{}", request.0.service_type)?;
            if !request.0.service_key.is_default() {
                write!(f, " ({})", request.0.service_key)?;
            }
            match request.0.dependency {
                Some(DependencyInfo::CtorParam { name }) => write!(f, " as ctor-param {name:?}")?,
                Some(DependencyInfo::Member { name }) => write!(f, " as member {name:?}")?,
                None => {}
            }
            current = request.0.parent.clone();
        }
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({self})")
    }
}
