//! Built-in generic wrappers: function, lazy, many, metadata,
//! debug-expression, and the collection rule.
//!
//! A wrapper is a factory registered under the open definition form of its
//! token; its closed type encodes "give me T indirectly". Wrapper values
//! are type-erased ([`ServiceFn`], [`LazyService`], ...) with typed
//! accessors at the edges.

use once_cell::sync::OnceCell;
use std::sync::Arc;

use crate::container::{Container, IfUnresolved, WeakContainer};
use crate::error::{DiError, DiResult};
use crate::expr::{CompiledExpr, ConstantsView, Env, Expr, LambdaParam};
use crate::factory::{ctor_arg, Ctor, Factory, FactoryId, ImplType, ParamInfo, Setup, WrappedArg};
use crate::request::Request;
use crate::rules::UnregisteredServiceRule;
use crate::scope::Scope;
use crate::types::{GenericDef, ServiceKey, ServiceType};
use crate::Object;

// Marker types carrying the wrapper definition identities.
struct FuncMark;
struct LazyMark;
struct ManyMark;
struct MetaMark;
struct DebugExprMark;
struct SliceMark;
struct EnumerableMark;

/// `Func<A1, ..., An, T>`: a function producing `T` from the given inputs.
pub fn func_of(mut inputs: Vec<ServiceType>, result: ServiceType) -> ServiceType {
    inputs.push(result);
    ServiceType::generic::<FuncMark>(inputs)
}

/// `Lazy<T>`: deferred, memoized construction of `T`.
pub fn lazy_of(item: ServiceType) -> ServiceType {
    ServiceType::generic::<LazyMark>(vec![item])
}

/// `Many<T>`: a live view over all registrations of `T`.
pub fn many_of(item: ServiceType) -> ServiceType {
    ServiceType::generic::<ManyMark>(vec![item])
}

/// `Meta<T, M>`: `T` together with its registration metadata of type `M`.
pub fn meta_of(item: ServiceType, metadata: ServiceType) -> ServiceType {
    ServiceType::generic::<MetaMark>(vec![item, metadata])
}

/// `DebugExpr<T>`: the construction IR built for `T`.
pub fn debug_expr_of(item: ServiceType) -> ServiceType {
    ServiceType::generic::<DebugExprMark>(vec![item])
}

/// `[T]`: snapshot array of all current registrations of `T`.
pub fn slice_of(item: ServiceType) -> ServiceType {
    ServiceType::generic::<SliceMark>(vec![item])
}

/// `Enumerable<T>`: alias collection token with slice semantics.
pub fn enumerable_of(item: ServiceType) -> ServiceType {
    ServiceType::generic::<EnumerableMark>(vec![item])
}

pub(crate) fn is_func_type(ty: &ServiceType) -> bool {
    ty.def() == Some(GenericDef::of::<FuncMark>())
}

pub(crate) fn is_collection_type(ty: &ServiceType) -> bool {
    let def = ty.def();
    def == Some(GenericDef::of::<SliceMark>()) || def == Some(GenericDef::of::<EnumerableMark>())
}

enum FnImpl {
    /// A compiled lambda body closing over its creation environment and a
    /// weak handle to the owning container.
    Compiled {
        params: Arc<[LambdaParam]>,
        body: CompiledExpr,
        env: Env,
        registry: WeakContainer,
    },
    /// A user-supplied callable (function decorators).
    Native(Arc<dyn Fn(Vec<Object>) -> DiResult<Object> + Send + Sync>),
}

/// A first-class service function, produced by `Func<..., T>` resolution
/// and by lambda expressions.
pub struct ServiceFn {
    inner: FnImpl,
}

impl ServiceFn {
    pub(crate) fn new(
        params: Arc<[LambdaParam]>,
        body: CompiledExpr,
        env: Env,
        registry: WeakContainer,
    ) -> Self {
        Self { inner: FnImpl::Compiled { params, body, env, registry } }
    }

    /// Wrap a plain callable.
    pub fn native(f: impl Fn(Vec<Object>) -> DiResult<Object> + Send + Sync + 'static) -> Self {
        Self { inner: FnImpl::Native(Arc::new(f)) }
    }

    /// Invoke as a fresh top-level call: the owning container is revived
    /// from the weak handle and a new resolution scope is opened.
    pub fn call(&self, args: Vec<Object>) -> DiResult<Object> {
        match &self.inner {
            FnImpl::Native(f) => f(args),
            FnImpl::Compiled { registry, .. } => {
                let container = registry.upgrade_or("function wrapper target")?;
                let view = container.constants_view();
                let mut resolution_scope = None;
                self.call_in(&view, &mut resolution_scope, args)
            }
        }
    }

    /// Invoke within an in-flight resolution, sharing its constants view
    /// and resolution scope.
    pub(crate) fn call_in(
        &self,
        view: &ConstantsView,
        resolution_scope: &mut Option<Arc<Scope>>,
        args: Vec<Object>,
    ) -> DiResult<Object> {
        match &self.inner {
            FnImpl::Native(f) => f(args),
            FnImpl::Compiled { params, body, env, .. } => {
                if args.len() != params.len() {
                    return Err(DiError::Internal(format!(
                        "function expects {} arguments, got {}",
                        params.len(),
                        args.len()
                    )));
                }
                let mut env = env.clone();
                for (param, value) in params.iter().zip(args) {
                    env = env.bind(param.id, value);
                }
                body(view, resolution_scope, &env)
            }
        }
    }

    /// Invoke and downcast the result.
    pub fn call_as<T: Send + Sync + 'static>(&self, args: Vec<Object>) -> DiResult<Arc<T>> {
        self.call(args)?
            .downcast::<T>()
            .map_err(|_| DiError::type_mismatch(std::any::type_name::<T>()))
    }
}

/// Deferred, memoized construction of a service, resolved through the
/// function wrapper on first access.
pub struct LazyService {
    fun: Arc<ServiceFn>,
    cell: OnceCell<Object>,
}

impl LazyService {
    pub fn new(fun: Arc<ServiceFn>) -> Self {
        Self { fun, cell: OnceCell::new() }
    }

    pub fn is_created(&self) -> bool {
        self.cell.get().is_some()
    }

    pub fn get(&self) -> DiResult<Object> {
        self.cell.get_or_try_init(|| self.fun.call(Vec::new())).cloned()
    }

    pub fn get_as<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.get()?
            .downcast::<T>()
            .map_err(|_| DiError::type_mismatch(std::any::type_name::<T>()))
    }
}

/// A live enumeration over the registrations of an item type.
///
/// Each call re-reads the registry through the weak handle, so items
/// registered after the `Many` was resolved are included.
pub struct ManyServices {
    registry: WeakContainer,
    item_type: ServiceType,
    /// Composite-pattern guard: the enclosing factory resolved for the
    /// same item type is excluded from enumeration.
    parent_factory: Option<FactoryId>,
}

impl ManyServices {
    pub fn item_type(&self) -> &ServiceType {
        &self.item_type
    }

    /// Resolve every currently registered item, skipping unresolvable ones.
    pub fn resolve_each(&self) -> DiResult<Vec<Object>> {
        let container = self.registry.upgrade_or(format!("Many<{}>", self.item_type))?;
        let parent_factory = self.parent_factory;
        let exclude = |factory: &Arc<Factory>| Some(factory.id()) != parent_factory;
        let keys = container.get_keys(&self.item_type, Some(&exclude));
        let mut items = Vec::with_capacity(keys.len());
        for (key, _) in keys {
            if let Some(item) =
                container.resolve_keyed(&self.item_type, key, IfUnresolved::ReturnNull)?
            {
                items.push(item);
            }
        }
        Ok(items)
    }
}

/// A service paired with the metadata object it was registered with.
pub struct MetaService {
    service: Object,
    metadata: Object,
}

impl MetaService {
    pub fn service(&self) -> &Object {
        &self.service
    }

    pub fn metadata(&self) -> &Object {
        &self.metadata
    }

    pub fn service_as<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        self.service
            .clone()
            .downcast::<T>()
            .map_err(|_| DiError::type_mismatch(std::any::type_name::<T>()))
    }

    pub fn metadata_as<M: Send + Sync + 'static>(&self) -> DiResult<Arc<M>> {
        self.metadata
            .clone()
            .downcast::<M>()
            .map_err(|_| DiError::type_mismatch(std::any::type_name::<M>()))
    }
}

/// The construction IR built for a service, exposed for inspection.
pub struct DebugExpr(Arc<Expr>);

impl DebugExpr {
    pub(crate) fn new(expr: Expr) -> Self {
        Self(Arc::new(expr))
    }

    pub fn expression(&self) -> &Expr {
        &self.0
    }
}

impl std::fmt::Debug for DebugExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Register the built-in wrappers and the collection rule.
pub(crate) fn install(container: &Container) -> DiResult<()> {
    container.register_factory(
        Factory::delegate(func_expression, None, Setup::wrapper_at(WrappedArg::Last)),
        ServiceType::generic::<FuncMark>(vec![]),
        ServiceKey::Default,
    )?;
    container.register_factory(
        Factory::reflection(lazy_impl(), None, Setup::wrapper()),
        ServiceType::generic::<LazyMark>(vec![ServiceType::param("T")]),
        ServiceKey::Default,
    )?;
    container.register_factory(
        Factory::delegate(many_expression, None, Setup::wrapper()),
        ServiceType::generic::<ManyMark>(vec![]),
        ServiceKey::Default,
    )?;
    container.register_factory(
        Factory::provider(meta_provider, Setup::wrapper_at(WrappedArg::Index(0))),
        ServiceType::generic::<MetaMark>(vec![]),
        ServiceKey::Default,
    )?;
    container.register_factory(
        Factory::delegate(debug_expression, None, Setup::wrapper()),
        ServiceType::generic::<DebugExprMark>(vec![]),
        ServiceKey::Default,
    )?;
    container.update_rules(|rules| {
        rules.add_unregistered_service(collection_rule());
    });
    Ok(())
}

/// `Func<A1, ..., An, T>`: a lambda binding the last type argument as the
/// result; leading arguments become lambda parameters offered to the
/// resolved constructor.
fn func_expression(request: &Request, container: &Container) -> DiResult<Option<Expr>> {
    let func_type = request.service_type().clone();
    let args = func_type.type_args();
    let Some((result, inputs)) = args.split_last() else {
        return Err(DiError::ExpectedFuncWithMultipleArgs { func: func_type.to_string() });
    };

    let params: Vec<LambdaParam> =
        inputs.iter().map(|input| LambdaParam::new(input.clone())).collect();
    let func_args = (!params.is_empty()).then(|| {
        Arc::new(crate::request::FuncArgs::new(func_type.clone(), params.clone()))
    });

    let mut child = request.push_preserving_parent_key(result.clone(), None);
    if let Some(func_args) = &func_args {
        child = child.with_func_args(func_args.clone());
    }

    let factory = container
        .get_or_add_factory(&child, IfUnresolved::Throw)?
        .ok_or_else(|| DiError::unable_to_resolve(&child))?;
    let body = factory.expression(&child, container)?;

    if let Some(func_args) = &func_args {
        if func_args.unused_count() > 0 {
            return Err(if factory.is_reflection() {
                DiError::SomeFuncParamsAreUnused {
                    func: func_type.to_string(),
                    request: child.to_string(),
                }
            } else {
                DiError::UnsupportedFuncWithArgs {
                    func: func_type.to_string(),
                    request: child.to_string(),
                }
            });
        }
    }

    Ok(Some(Expr::Lambda { params: params.into(), body: Arc::new(body) }))
}

/// `Lazy<T>` is an ordinary open-generic implementation whose constructor
/// takes `Func<T>`; resolution recurses through the function wrapper.
fn lazy_impl() -> ImplType {
    let item = ServiceType::param("T");
    ImplType::open(ServiceType::generic::<LazyMark>(vec![item.clone()])).with_ctor(Ctor::new(
        vec![ParamInfo::new("factory", func_of(Vec::new(), item))],
        |args| {
            let fun = ctor_arg::<ServiceFn>(&args, 0)?;
            Ok(Arc::new(LazyService::new(fun)) as Object)
        },
    ))
}

fn many_expression(request: &Request, container: &Container) -> DiResult<Option<Expr>> {
    let ty = request.service_type();
    let Some(item) = ty.type_args().first().cloned() else {
        return Err(DiError::GenericWrapperExpectsSingleTypeArgByDefault {
            service: ty.to_string(),
        });
    };
    let parent_factory = request
        .non_wrapper_parent()
        .filter(|parent| parent.service_type() == &item)
        .map(|parent| parent.factory_id());
    let many = ManyServices { registry: container.downgrade(), item_type: item, parent_factory };
    container.constant_expression(Arc::new(many)).map(Some)
}

/// `Meta<T, M>`: find the first (or keyed) registration of `T` whose setup
/// metadata is of type `M`. A metadata miss returns no factory, so the
/// wrapper simply does not apply and lookup falls through to the
/// unregistered-service rules.
fn meta_provider(request: &Request, container: &Container) -> DiResult<Option<Factory>> {
    let ty = request.service_type().clone();
    let args = ty.type_args();
    if args.len() != 2 {
        return Err(DiError::GenericWrapperExpectsSingleTypeArgByDefault {
            service: ty.to_string(),
        });
    }
    let item = args[0].clone();
    let metadata_type = args[1].clone();
    let Some(metadata_id) = metadata_type.concrete_id() else {
        return Ok(None);
    };

    let requested_key = request.service_key().clone();
    let found = container.get_keys(&item, None).into_iter().find(|(key, factory)| {
        (requested_key.is_default() || *key == requested_key)
            && factory
                .setup()
                .metadata()
                .is_some_and(|metadata| (*metadata).type_id() == metadata_id)
    });
    let Some((key, factory)) = found else {
        return Ok(None);
    };
    let Some(metadata) = factory.setup().metadata() else {
        return Ok(None);
    };

    Ok(Some(Factory::delegate(
        move |req, cont| {
            let child = req.push(item.clone(), key.clone(), None);
            let service_expr = factory.expression(&child, cont)?;
            let metadata_expr = cont.constant_expression(metadata.clone())?;
            Ok(Some(Expr::New {
                ctor: Arc::new(meta_ctor()),
                args: vec![service_expr, metadata_expr],
            }))
        },
        None,
        Setup::wrapper_at(WrappedArg::Index(0)),
    )))
}

fn meta_ctor() -> Ctor {
    Ctor::new(
        vec![
            ParamInfo::new("service", ServiceType::param("T")),
            ParamInfo::new("metadata", ServiceType::param("M")),
        ],
        |mut args| {
            let metadata = args
                .pop()
                .ok_or_else(|| DiError::Internal("meta constructor misses metadata".into()))?;
            let service = args
                .pop()
                .ok_or_else(|| DiError::Internal("meta constructor misses service".into()))?;
            Ok(Arc::new(MetaService { service, metadata }) as Object)
        },
    )
    .named("Meta")
}

/// `DebugExpr<T>`: a constant wrapping the IR built for `T`.
fn debug_expression(request: &Request, container: &Container) -> DiResult<Option<Expr>> {
    let ty = request.service_type();
    let args = ty.type_args();
    let [item] = args else {
        return Err(DiError::GenericWrapperExpectsSingleTypeArgByDefault {
            service: ty.to_string(),
        });
    };
    let child = request.push_preserving_parent_key(item.clone(), None);
    let factory = container
        .get_or_add_factory(&child, IfUnresolved::Throw)?
        .ok_or_else(|| DiError::unable_to_resolve(&child))?;
    let expr = factory.expression(&child, container)?;
    container.constant_expression(Arc::new(DebugExpr::new(expr))).map(Some)
}

/// Unregistered-service rule for `[T]` / `Enumerable<T>`.
///
/// Snapshots the registered keys at expression-build time: registrations
/// made after the collection was first resolved do not appear, unlike
/// `Many<T>`.
pub(crate) fn collection_rule() -> UnregisteredServiceRule {
    Arc::new(|request, _container| {
        let ty = request.service_type();
        if !is_collection_type(ty) {
            return Ok(None);
        }
        let Some(item) = ty.type_args().first().cloned() else {
            return Ok(None);
        };
        Ok(Some(Arc::new(Factory::delegate(
            move |req, cont| {
                let parent_factory = req
                    .non_wrapper_parent()
                    .filter(|parent| parent.service_type() == &item)
                    .map(|parent| parent.factory_id());
                let keys: Vec<(ServiceKey, Arc<Factory>)> = cont
                    .get_keys(&item, None)
                    .into_iter()
                    .filter(|(_, factory)| Some(factory.id()) != parent_factory)
                    .collect();
                if keys.is_empty() {
                    return Err(DiError::UnableToFindRegisteredEnumerableItems {
                        item: item.to_string(),
                    });
                }
                let mut items = Vec::with_capacity(keys.len());
                for (key, _) in keys {
                    let child = req.push(item.clone(), key, None);
                    let Some(dep) = cont.get_or_add_factory(&child, IfUnresolved::ReturnNull)?
                    else {
                        continue;
                    };
                    match dep.expression(&child, cont) {
                        Ok(expr) => items.push(expr),
                        Err(DiError::UnableToResolve { .. }) => continue,
                        Err(other) => return Err(other),
                    }
                }
                if items.is_empty() {
                    return Err(DiError::UnableToResolveEnumerableItems {
                        item: item.to_string(),
                    });
                }
                Ok(Some(Expr::NewArray { items }))
            },
            None,
            Setup::wrapper(),
        ))))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item;

    #[test]
    fn func_token_shape() {
        let ty = func_of(vec![ServiceType::of::<u32>()], ServiceType::of::<Item>());
        assert!(is_func_type(&ty));
        assert_eq!(ty.type_args().len(), 2);
        assert!(!is_func_type(&lazy_of(ServiceType::of::<Item>())));
    }

    #[test]
    fn collection_tokens_are_recognized() {
        assert!(is_collection_type(&slice_of(ServiceType::of::<Item>())));
        assert!(is_collection_type(&enumerable_of(ServiceType::of::<Item>())));
        assert!(!is_collection_type(&many_of(ServiceType::of::<Item>())));
    }

    #[test]
    fn native_service_fn_invokes() {
        let double = ServiceFn::native(|args| {
            let value = ctor_arg::<u32>(&args, 0)?;
            Ok(Arc::new(*value * 2) as Object)
        });
        let result = double.call_as::<u32>(vec![Arc::new(21u32)]).unwrap();
        assert_eq!(*result, 42);
    }

    #[test]
    fn meta_service_accessors_downcast() {
        let meta = MetaService {
            service: Arc::new(7u32),
            metadata: Arc::new("tagged".to_string()),
        };
        assert_eq!(*meta.service_as::<u32>().unwrap(), 7);
        assert_eq!(*meta.metadata_as::<String>().unwrap(), "tagged");
        assert!(meta.metadata_as::<u32>().is_err());
    }
}
