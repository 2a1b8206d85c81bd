//! Construction recipes: reflection, delegate, and provider factories.
//!
//! A [`Factory`] is a shared header (id, reuse, setup) over one of three
//! kinds. Reflection factories build from an [`ImplType`] descriptor — the
//! runtime stand-in for constructor metadata — and handle open-generic
//! specialization. Delegate factories defer to a user expression function.
//! Provider factories return a request-specific factory instead of an
//! expression.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::container::{Container, IfUnresolved};
use crate::error::{DiError, DiResult};
use crate::expr::Expr;
use crate::request::{DependencyInfo, Request};
use crate::reuse::Reuse;
use crate::scope::DisposerFn;
use crate::types::{ServiceKey, ServiceType, TypeArgBindings};
use crate::Object;

/// Process-wide monotonic factory identifier.
pub type FactoryId = u32;

pub(crate) fn next_factory_id() -> FactoryId {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Which role a factory plays in the pipeline, derived from its setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactoryType {
    Service,
    Wrapper,
    Decorator,
}

/// Which type argument a generic wrapper wraps.
#[derive(Clone, Copy, Debug)]
pub enum WrappedArg {
    /// The single type argument; more than one is an error
    Single,
    /// A fixed argument position
    Index(usize),
    /// The last argument (function wrappers bind the result there)
    Last,
}

type AppliesFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Metadata flags attached to a factory.
#[derive(Clone)]
pub enum Setup {
    Service {
        metadata: Option<Object>,
        cache_expression: bool,
    },
    Wrapper {
        wrapped_arg: WrappedArg,
    },
    Decorator {
        applies: Option<AppliesFn>,
    },
}

impl Setup {
    #[inline]
    pub fn service() -> Self {
        Self::Service { metadata: None, cache_expression: true }
    }

    #[inline]
    pub fn with_metadata(metadata: Object) -> Self {
        Self::Service { metadata: Some(metadata), cache_expression: true }
    }

    /// Service setup that opts out of the factored-expression cache.
    #[inline]
    pub fn non_caching() -> Self {
        Self::Service { metadata: None, cache_expression: false }
    }

    #[inline]
    pub fn wrapper() -> Self {
        Self::Wrapper { wrapped_arg: WrappedArg::Single }
    }

    #[inline]
    pub fn wrapper_at(wrapped_arg: WrappedArg) -> Self {
        Self::Wrapper { wrapped_arg }
    }

    #[inline]
    pub fn decorator() -> Self {
        Self::Decorator { applies: None }
    }

    /// Decorator applied only where the predicate holds.
    #[inline]
    pub fn decorator_when(applies: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Self::Decorator { applies: Some(Arc::new(applies)) }
    }

    #[inline]
    pub fn factory_type(&self) -> FactoryType {
        match self {
            Self::Service { .. } => FactoryType::Service,
            Self::Wrapper { .. } => FactoryType::Wrapper,
            Self::Decorator { .. } => FactoryType::Decorator,
        }
    }

    pub fn metadata(&self) -> Option<Object> {
        match self {
            Self::Service { metadata, .. } => metadata.clone(),
            _ => None,
        }
    }

    /// Wrapper and decorator expressions are request-shaped and must never
    /// enter the per-factory-id expression cache.
    pub fn cache_expression(&self) -> bool {
        match self {
            Self::Service { cache_expression, .. } => *cache_expression,
            Self::Wrapper { .. } | Self::Decorator { .. } => false,
        }
    }

    pub(crate) fn wrapped_arg(&self) -> Option<WrappedArg> {
        match self {
            Self::Wrapper { wrapped_arg } => Some(*wrapped_arg),
            _ => None,
        }
    }

    pub(crate) fn applies_to(&self, request: &Request) -> bool {
        match self {
            Self::Decorator { applies: Some(predicate) } => predicate(request),
            _ => true,
        }
    }
}

/// A named, typed constructor parameter.
#[derive(Clone)]
pub struct ParamInfo {
    pub name: &'static str,
    pub ty: ServiceType,
}

impl ParamInfo {
    #[inline]
    pub fn new(name: &'static str, ty: ServiceType) -> Self {
        Self { name, ty }
    }
}

type BuildFn = Arc<dyn Fn(Vec<Object>) -> DiResult<Object> + Send + Sync>;

/// A constructor descriptor: parameter list plus a build closure receiving
/// the resolved arguments in declaration order.
pub struct Ctor {
    params: Vec<ParamInfo>,
    build: BuildFn,
    owner: String,
}

impl Ctor {
    pub fn new(
        params: Vec<ParamInfo>,
        build: impl Fn(Vec<Object>) -> DiResult<Object> + Send + Sync + 'static,
    ) -> Self {
        Self { params, build: Arc::new(build), owner: String::new() }
    }

    /// Stamp the owning type name used in diagnostics.
    pub fn named(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    #[inline]
    pub fn params(&self) -> &[ParamInfo] {
        &self.params
    }

    #[inline]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn build(&self, args: Vec<Object>) -> DiResult<Object> {
        (self.build)(args)
    }

    fn with_params(&self, params: Vec<ParamInfo>) -> Self {
        Self { params, build: self.build.clone(), owner: self.owner.clone() }
    }
}

/// Downcast a constructor argument to its concrete type.
pub fn ctor_arg<T: Send + Sync + 'static>(args: &[Object], index: usize) -> DiResult<Arc<T>> {
    args.get(index)
        .cloned()
        .ok_or_else(|| DiError::Internal(format!("missing constructor argument {index}")))?
        .downcast::<T>()
        .map_err(|_| DiError::type_mismatch(std::any::type_name::<T>()))
}

type SetFn = Arc<dyn Fn(&Object, Object) -> DiResult<()> + Send + Sync>;

/// A writable member eligible for injection.
pub struct Member {
    pub name: &'static str,
    pub ty: ServiceType,
    set: SetFn,
}

impl Member {
    pub fn new(
        name: &'static str,
        ty: ServiceType,
        set: impl Fn(&Object, Object) -> DiResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self { name, ty, set: Arc::new(set) }
    }

    /// Typed member descriptor: `assign` downcasts the instance to `T` and
    /// the value to `V` before calling the setter.
    pub fn of<T, V>(name: &'static str, set: impl Fn(&T, Arc<V>) + Send + Sync + 'static) -> Self
    where
        T: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        Self::new(name, ServiceType::of::<V>(), move |instance, value| {
            let target = instance
                .downcast_ref::<T>()
                .ok_or_else(|| DiError::type_mismatch(std::any::type_name::<T>()))?;
            let value = value
                .downcast::<V>()
                .map_err(|_| DiError::type_mismatch(std::any::type_name::<V>()))?;
            set(target, value);
            Ok(())
        })
    }

    pub fn assign(&self, instance: &Object, value: Object) -> DiResult<()> {
        (self.set)(instance, value)
    }

    fn with_type(&self, ty: ServiceType) -> Self {
        Self { name: self.name, ty, set: self.set.clone() }
    }
}

type CloseFn = Arc<dyn Fn(&TypeArgBindings) -> DiResult<ImplType> + Send + Sync>;

/// Runtime descriptor of an implementation type: its service-type token,
/// the service types it implements, its public constructors and writable
/// members, and an optional disposer hook.
///
/// Open descriptors (token containing parameters) additionally close over
/// argument bindings: either through the default token substitution, which
/// keeps the build closures, or through a custom `close` function when
/// construction differs per type argument.
pub struct ImplType {
    ty: ServiceType,
    implements: Vec<ServiceType>,
    ctors: Vec<Arc<Ctor>>,
    members: Vec<Arc<Member>>,
    is_abstract: bool,
    disposer: Option<DisposerFn>,
    close: Option<CloseFn>,
}

impl ImplType {
    /// Descriptor for the concrete Rust type `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::open(ServiceType::of::<T>())
    }

    /// Descriptor for an arbitrary (possibly open) type token.
    pub fn open(ty: ServiceType) -> Self {
        Self {
            ty,
            implements: Vec::new(),
            ctors: Vec::new(),
            members: Vec::new(),
            is_abstract: false,
            disposer: None,
            close: None,
        }
    }

    /// Mark the descriptor abstract; registration of an abstract
    /// implementation is rejected.
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Declare an implemented service type (trait token or base).
    pub fn implements(mut self, service: ServiceType) -> Self {
        self.implements.push(service);
        self
    }

    pub fn with_ctor(mut self, mut ctor: Ctor) -> Self {
        ctor.owner = self.ty.to_string();
        self.ctors.push(Arc::new(ctor));
        self
    }

    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(Arc::new(member));
        self
    }

    /// Typed disposer hook, run when an owning scope is torn down.
    pub fn with_disposer<T: Send + Sync + 'static>(
        mut self,
        dispose: impl Fn(&T) + Send + Sync + 'static,
    ) -> Self {
        self.disposer = Some(Arc::new(move |object: &Object| {
            if let Some(target) = object.downcast_ref::<T>() {
                dispose(target);
            }
        }));
        self
    }

    /// Custom close function for open descriptors whose construction
    /// depends on the bound type arguments.
    pub fn with_close(
        mut self,
        close: impl Fn(&TypeArgBindings) -> DiResult<ImplType> + Send + Sync + 'static,
    ) -> Self {
        self.close = Some(Arc::new(close));
        self
    }

    #[inline]
    pub fn service_type(&self) -> &ServiceType {
        &self.ty
    }

    #[inline]
    pub fn implemented(&self) -> &[ServiceType] {
        &self.implements
    }

    #[inline]
    pub fn members(&self) -> &[Arc<Member>] {
        &self.members
    }

    #[inline]
    pub(crate) fn disposer(&self) -> Option<DisposerFn> {
        self.disposer.clone()
    }

    /// True when `service` is this type itself or one of its declared
    /// implemented services (open declarations unify against closed ones).
    pub fn is_assignable_to(&self, service: &ServiceType) -> bool {
        if self.ty == *service {
            return true;
        }
        self.implements.iter().any(|declared| {
            declared == service || {
                let mut bindings = TypeArgBindings::new();
                declared.is_open() && declared.unify(service, &mut bindings)
            }
        })
    }

    /// Close an open descriptor over the given bindings.
    pub(crate) fn closed_with(&self, bindings: &TypeArgBindings) -> DiResult<ImplType> {
        match &self.close {
            Some(close) => close(bindings),
            None => Ok(self.substituted(bindings)),
        }
    }

    fn substituted(&self, bindings: &TypeArgBindings) -> ImplType {
        ImplType {
            ty: self.ty.substitute(bindings),
            implements: self.implements.iter().map(|t| t.substitute(bindings)).collect(),
            ctors: self
                .ctors
                .iter()
                .map(|ctor| {
                    let params = ctor
                        .params
                        .iter()
                        .map(|p| ParamInfo::new(p.name, p.ty.substitute(bindings)))
                        .collect();
                    Arc::new(ctor.with_params(params))
                })
                .collect(),
            members: self
                .members
                .iter()
                .map(|m| Arc::new(m.with_type(m.ty.substitute(bindings))))
                .collect(),
            is_abstract: self.is_abstract,
            disposer: self.disposer.clone(),
            close: None,
        }
    }
}

/// Typed registration builder over an implementation descriptor.
///
/// Wires constructors, members, and the disposer with the concrete types
/// in hand, then registers the finished reflection factory in one call:
///
/// ```rust
/// use armature_ioc::{Container, Registration};
/// use std::sync::Arc;
///
/// struct Database { url: String }
/// struct Users { db: Arc<Database> }
///
/// let container = Container::new();
/// Registration::<Database>::of()
///     .with_new(|| Database { url: "postgres://localhost".into() })
///     .singleton()
///     .register(&container)
///     .unwrap();
/// Registration::<Users>::of()
///     .with_new1::<Database>("db", |db| Users { db })
///     .register(&container)
///     .unwrap();
///
/// let users = container.get::<Users>().unwrap();
/// assert_eq!(users.db.url, "postgres://localhost");
/// ```
pub struct Registration<T: ?Sized + 'static> {
    impl_type: ImplType,
    reuse: Option<Reuse>,
    setup: Setup,
    _marker: std::marker::PhantomData<fn(&T)>,
}

impl<T: ?Sized + 'static> Registration<T> {
    /// Start a registration for the implementation type `T`.
    pub fn of() -> Self {
        Self {
            impl_type: ImplType::of::<T>(),
            reuse: None,
            setup: Setup::service(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Declare an implemented service type (trait token or base).
    pub fn implements(mut self, service: ServiceType) -> Self {
        self.impl_type = self.impl_type.implements(service);
        self
    }

    /// Attach a constructor descriptor.
    pub fn with_ctor(mut self, ctor: Ctor) -> Self {
        self.impl_type = self.impl_type.with_ctor(ctor);
        self
    }

    /// Attach a member descriptor.
    pub fn with_member(mut self, member: Member) -> Self {
        self.impl_type = self.impl_type.with_member(member);
        self
    }

    pub fn singleton(mut self) -> Self {
        self.reuse = Some(Reuse::Singleton);
        self
    }

    pub fn in_current_scope(mut self) -> Self {
        self.reuse = Some(Reuse::InCurrentScope);
        self
    }

    pub fn in_resolution_scope(mut self) -> Self {
        self.reuse = Some(Reuse::InResolutionScope);
        self
    }

    /// Attach registration metadata for `Meta` lookups.
    pub fn with_metadata(mut self, metadata: Object) -> Self {
        self.setup = Setup::with_metadata(metadata);
        self
    }

    /// Register under the implementation's own type.
    pub fn register(self, container: &Container) -> DiResult<Arc<Factory>> {
        let service = self.impl_type.service_type().clone();
        self.register_as(container, service)
    }

    /// Register under an explicit service type.
    pub fn register_as(self, container: &Container, service: ServiceType) -> DiResult<Arc<Factory>> {
        container.register_factory(
            Factory::reflection(self.impl_type, self.reuse, self.setup),
            service,
            ServiceKey::Default,
        )
    }

    /// Register under the implementation's own type with a name.
    pub fn register_named(
        self,
        container: &Container,
        name: impl Into<Arc<str>>,
    ) -> DiResult<Arc<Factory>> {
        let service = self.impl_type.service_type().clone();
        container.register_factory(
            Factory::reflection(self.impl_type, self.reuse, self.setup),
            service,
            ServiceKey::name(name),
        )
    }

    /// Register under the implementation's own type and every declared
    /// service, sharing one factory (and so one scoped instance) across
    /// all of them.
    pub fn register_all(self, container: &Container) -> DiResult<Arc<Factory>> {
        let services: Vec<ServiceType> = std::iter::once(self.impl_type.service_type().clone())
            .chain(self.impl_type.implemented().iter().cloned())
            .collect();
        let factory = Arc::new(Factory::reflection(self.impl_type, self.reuse, self.setup));
        for service in services {
            container.register_shared(factory.clone(), service, ServiceKey::Default)?;
        }
        Ok(factory)
    }
}

impl<T: Send + Sync + 'static> Registration<T> {
    /// Constructor with no dependencies.
    pub fn with_new(self, build: impl Fn() -> T + Send + Sync + 'static) -> Self {
        self.with_ctor(Ctor::new(vec![], move |_| Ok(Arc::new(build()))))
    }

    /// Constructor over one resolved dependency.
    pub fn with_new1<A: Send + Sync + 'static>(
        self,
        name: &'static str,
        build: impl Fn(Arc<A>) -> T + Send + Sync + 'static,
    ) -> Self {
        self.with_ctor(Ctor::new(
            vec![ParamInfo::new(name, ServiceType::of::<A>())],
            move |args| {
                let a = ctor_arg::<A>(&args, 0)?;
                Ok(Arc::new(build(a)))
            },
        ))
    }

    /// Constructor over two resolved dependencies.
    pub fn with_new2<A, B>(
        self,
        names: (&'static str, &'static str),
        build: impl Fn(Arc<A>, Arc<B>) -> T + Send + Sync + 'static,
    ) -> Self
    where
        A: Send + Sync + 'static,
        B: Send + Sync + 'static,
    {
        self.with_ctor(Ctor::new(
            vec![
                ParamInfo::new(names.0, ServiceType::of::<A>()),
                ParamInfo::new(names.1, ServiceType::of::<B>()),
            ],
            move |args| {
                let a = ctor_arg::<A>(&args, 0)?;
                let b = ctor_arg::<B>(&args, 1)?;
                Ok(Arc::new(build(a, b)))
            },
        ))
    }

    /// Typed member setter, injected when the member rules yield a key.
    pub fn with_member_of<V: Send + Sync + 'static>(
        self,
        name: &'static str,
        set: impl Fn(&T, Arc<V>) + Send + Sync + 'static,
    ) -> Self {
        self.with_member(Member::of::<T, V>(name, set))
    }

    /// Teardown hook run when the owning scope is disposed.
    pub fn with_disposer(mut self, dispose: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.impl_type = self.impl_type.with_disposer(dispose);
        self
    }
}

type MakeExprFn = Arc<dyn Fn(&Request, &Container) -> DiResult<Option<Expr>> + Send + Sync>;
type ProvideFn = Arc<dyn Fn(&Request, &Container) -> DiResult<Option<Factory>> + Send + Sync>;
type CtorSelectorFn = Arc<dyn Fn(&[Arc<Ctor>], &Request) -> Option<Arc<Ctor>> + Send + Sync>;

/// Builds from an implementation descriptor.
pub struct ReflectionFactory {
    impl_type: Arc<ImplType>,
    ctor_selector: Option<CtorSelectorFn>,
}

/// Defers to a user function producing an expression.
pub struct DelegateFactory {
    make: MakeExprFn,
}

/// Defers to a function producing a request-specific factory.
pub struct ProviderFactory {
    provide: ProvideFn,
}

pub enum FactoryKind {
    Reflection(ReflectionFactory),
    Delegate(DelegateFactory),
    Provider(ProviderFactory),
}

/// A registered construction recipe.
pub struct Factory {
    id: FactoryId,
    reuse: Option<Reuse>,
    setup: Setup,
    kind: FactoryKind,
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("id", &self.id)
            .field("reuse", &self.reuse)
            .finish()
    }
}

impl Factory {
    pub fn reflection(impl_type: ImplType, reuse: Option<Reuse>, setup: Setup) -> Self {
        Self::reflection_with(Arc::new(impl_type), None, reuse, setup)
    }

    pub fn reflection_selected(
        impl_type: ImplType,
        ctor_selector: impl Fn(&[Arc<Ctor>], &Request) -> Option<Arc<Ctor>> + Send + Sync + 'static,
        reuse: Option<Reuse>,
        setup: Setup,
    ) -> Self {
        Self::reflection_with(Arc::new(impl_type), Some(Arc::new(ctor_selector)), reuse, setup)
    }

    fn reflection_with(
        impl_type: Arc<ImplType>,
        ctor_selector: Option<CtorSelectorFn>,
        reuse: Option<Reuse>,
        setup: Setup,
    ) -> Self {
        Self {
            id: next_factory_id(),
            reuse,
            setup,
            kind: FactoryKind::Reflection(ReflectionFactory { impl_type, ctor_selector }),
        }
    }

    pub fn delegate(
        make: impl Fn(&Request, &Container) -> DiResult<Option<Expr>> + Send + Sync + 'static,
        reuse: Option<Reuse>,
        setup: Setup,
    ) -> Self {
        Self {
            id: next_factory_id(),
            reuse,
            setup,
            kind: FactoryKind::Delegate(DelegateFactory { make: Arc::new(make) }),
        }
    }

    pub fn provider(
        provide: impl Fn(&Request, &Container) -> DiResult<Option<Factory>> + Send + Sync + 'static,
        setup: Setup,
    ) -> Self {
        Self {
            id: next_factory_id(),
            reuse: None,
            setup,
            kind: FactoryKind::Provider(ProviderFactory { provide: Arc::new(provide) }),
        }
    }

    #[inline]
    pub fn id(&self) -> FactoryId {
        self.id
    }

    #[inline]
    pub fn reuse(&self) -> Option<Reuse> {
        self.reuse
    }

    #[inline]
    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    #[inline]
    pub fn factory_type(&self) -> FactoryType {
        self.setup.factory_type()
    }

    #[inline]
    pub fn is_reflection(&self) -> bool {
        matches!(self.kind, FactoryKind::Reflection(_))
    }

    /// The implementation type token, when known.
    pub fn impl_service_type(&self) -> Option<ServiceType> {
        match &self.kind {
            FactoryKind::Reflection(r) => Some(r.impl_type.ty.clone()),
            _ => None,
        }
    }

    pub(crate) fn impl_descriptor(&self) -> Option<&Arc<ImplType>> {
        match &self.kind {
            FactoryKind::Reflection(r) => Some(&r.impl_type),
            _ => None,
        }
    }

    pub(crate) fn disposer(&self) -> Option<DisposerFn> {
        self.impl_descriptor().and_then(|d| d.disposer())
    }

    pub(crate) fn applies_to(&self, request: &Request) -> bool {
        self.setup.applies_to(request)
    }

    /// True when resolution must ask for a request-specific factory first.
    pub fn provides_factory_per_request(&self) -> bool {
        match &self.kind {
            FactoryKind::Provider(_) => true,
            FactoryKind::Reflection(r) => r.impl_type.ty.is_open(),
            FactoryKind::Delegate(_) => false,
        }
    }

    /// Registration-time validation of the implementation against the
    /// service type.
    pub(crate) fn validate_registration(&self, service: &ServiceType) -> DiResult<()> {
        let FactoryKind::Reflection(reflection) = &self.kind else {
            return Ok(());
        };
        let impl_type = &reflection.impl_type;
        if impl_type.is_abstract {
            return Err(DiError::ExpectedNonAbstractImplType {
                impl_type: impl_type.ty.to_string(),
            });
        }
        let impl_open = impl_type.ty.is_open();
        let service_open = service.is_open_or_definition();
        match (impl_open, service_open) {
            (true, false) => Err(DiError::UnableToRegisterOpenGenericImplWithNonGenericService {
                impl_type: impl_type.ty.to_string(),
                service: service.to_string(),
            }),
            (true, true) => {
                // Every impl type parameter must be derivable from the
                // open service view it will be unified against.
                let view = std::iter::once(&impl_type.ty)
                    .chain(impl_type.implements.iter())
                    .find(|v| v.def().is_some() && v.def() == service.def());
                let Some(view) = view else {
                    return Err(DiError::ExpectedImplAssignableToService {
                        impl_type: impl_type.ty.to_string(),
                        service: service.to_string(),
                    });
                };
                let mut impl_params = Vec::new();
                impl_type.ty.collect_params(&mut impl_params);
                let mut view_params = Vec::new();
                view.collect_params(&mut view_params);
                if impl_params.iter().any(|p| !view_params.contains(p)) {
                    return Err(DiError::OpenGenericServiceDoesNotSpecifyAllTypeArgs {
                        impl_type: impl_type.ty.to_string(),
                        service: service.to_string(),
                    });
                }
                Ok(())
            }
            (false, true) => Err(DiError::ExpectedImplAssignableToService {
                impl_type: impl_type.ty.to_string(),
                service: service.to_string(),
            }),
            (false, false) => {
                if impl_type.is_assignable_to(service) {
                    Ok(())
                } else {
                    Err(DiError::ExpectedImplAssignableToService {
                        impl_type: impl_type.ty.to_string(),
                        service: service.to_string(),
                    })
                }
            }
        }
    }

    /// Obtain the request-specific factory from a provider or an
    /// open-generic reflection factory.
    pub(crate) fn factory_for_request(
        &self,
        request: &Request,
        container: &Container,
    ) -> DiResult<Option<Factory>> {
        match &self.kind {
            FactoryKind::Provider(provider) => (provider.provide)(request, container),
            FactoryKind::Reflection(reflection) if reflection.impl_type.ty.is_open() => {
                reflection.specialize(self, request).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Build this factory's expression for the request: §`resolve_to` pin,
    /// decorator lookup, factored-expression cache, reuse wrapping, and
    /// finally decorator application.
    pub fn expression(self: &Arc<Self>, request: &Request, container: &Container) -> DiResult<Expr> {
        let request = request.resolve_to(self)?;

        let decorator = if self.factory_type() == FactoryType::Service {
            container.decorator_expr_or_none(&request)?
        } else {
            None
        };
        if let Some(replacement) = &decorator {
            if !matches!(replacement, Expr::Lambda { .. }) {
                return Ok(replacement.clone());
            }
        }

        // Expressions built under function-wrapper arguments reference the
        // enclosing lambda's parameters and are valid for that call site
        // only; they must never enter the shared per-factory-id cache.
        let cacheable = self.setup.cache_expression() && request.func_args().is_none();
        let serviced = match cacheable
            .then(|| container.cached_factory_expression(self.id))
            .flatten()
        {
            Some(cached) => (*cached).clone(),
            None => {
                let core = self.create_core_expression(&request, container)?;
                let reused = match self.reuse {
                    Some(reuse) => reuse.apply(core, self, &request, container)?,
                    None => core,
                };
                if cacheable {
                    container.cache_factory_expression(self.id, reused.clone())?;
                }
                reused
            }
        };

        Ok(match decorator {
            Some(lambda) => crate::expr::apply_lambda(&lambda, &serviced),
            None => serviced,
        })
    }

    fn create_core_expression(&self, request: &Request, container: &Container) -> DiResult<Expr> {
        match &self.kind {
            FactoryKind::Reflection(reflection) => {
                reflection.create_expression(self, request, container)
            }
            FactoryKind::Delegate(delegate) => (delegate.make)(request, container)?.ok_or_else(
                || DiError::DelegateFactoryExpressionReturnedNull { request: request.to_string() },
            ),
            FactoryKind::Provider(_) => Err(DiError::Internal(
                "provider factory asked for an expression without specialization".into(),
            )),
        }
    }
}

impl ReflectionFactory {
    /// Close the open implementation for the request's service type by
    /// structural unification, producing a fresh factory under a new id.
    fn specialize(&self, header: &Factory, request: &Request) -> DiResult<Factory> {
        let closed_service = request.service_type();
        let impl_type = &self.impl_type;

        let mut bindings = TypeArgBindings::new();
        let matched = std::iter::once(&impl_type.ty).chain(impl_type.implements.iter()).any(|view| {
            view.def().is_some() && view.def() == closed_service.def() && {
                bindings.clear();
                view.unify(closed_service, &mut bindings)
            }
        });
        if !matched {
            return Err(DiError::UnableToFindOpenGenericImplTypeArg {
                impl_type: impl_type.ty.to_string(),
                service: closed_service.to_string(),
            });
        }

        let mut impl_params = Vec::new();
        impl_type.ty.collect_params(&mut impl_params);
        if impl_params.iter().any(|p| !bindings.contains_key(p)) {
            return Err(DiError::UnableToFindOpenGenericImplTypeArg {
                impl_type: impl_type.ty.to_string(),
                service: closed_service.to_string(),
            });
        }

        let closed = impl_type.closed_with(&bindings)?;
        Ok(Factory::reflection_with(
            Arc::new(closed),
            self.ctor_selector.clone(),
            header.reuse,
            header.setup.clone(),
        ))
    }

    fn select_ctor(&self, request: &Request) -> DiResult<Arc<Ctor>> {
        let impl_type = &self.impl_type;
        if let Some(selector) = &self.ctor_selector {
            return selector(&impl_type.ctors, request).ok_or_else(|| {
                DiError::UnableToSelectConstructor {
                    impl_type: impl_type.ty.to_string(),
                    count: impl_type.ctors.len(),
                }
            });
        }
        match impl_type.ctors.as_slice() {
            [] => Err(DiError::NoPublicConstructorDefined { impl_type: impl_type.ty.to_string() }),
            [single] => Ok(single.clone()),
            many => Err(DiError::UnableToSelectConstructor {
                impl_type: impl_type.ty.to_string(),
                count: many.len(),
            }),
        }
    }

    /// Synthesize the construction expression: pick the constructor,
    /// resolve each parameter (consuming function-wrapper arguments
    /// first), then append member bindings the rules ask for.
    fn create_expression(
        &self,
        factory: &Factory,
        request: &Request,
        container: &Container,
    ) -> DiResult<Expr> {
        let ctor = self.select_ctor(request)?;
        let func_args = request.func_args();
        let inherit_key =
            matches!(factory.factory_type(), FactoryType::Wrapper | FactoryType::Decorator);

        let mut args = Vec::with_capacity(ctor.params().len());
        for param in ctor.params() {
            if let Some(available) = &func_args {
                if let Some(param_id) = available.try_match(&param.ty) {
                    args.push(Expr::ParamRef { id: param_id });
                    continue;
                }
            }
            let key = container.key_for_ctor_param(param, request).unwrap_or_else(|| {
                if inherit_key { request.service_key().clone() } else { ServiceKey::Default }
            });
            let child =
                request.push(param.ty.clone(), key, Some(DependencyInfo::CtorParam { name: param.name }));
            let dependency = container
                .get_or_add_factory(&child, IfUnresolved::Throw)?
                .ok_or_else(|| DiError::unable_to_resolve(&child))?;
            let expr = dependency.expression(&child, container).map_err(|err| {
                match (&func_args, &err) {
                    (Some(available), DiError::UnableToResolve { .. }) => {
                        DiError::ConstructorMissesSomeParameters {
                            impl_type: self.impl_type.ty.to_string(),
                            func: available.func_type().to_string(),
                        }
                    }
                    _ => err,
                }
            })?;
            args.push(expr);
        }

        let new_expr = Expr::New { ctor, args };

        let mut binds = Vec::new();
        for member in &self.impl_type.members {
            let Some(key) = container.key_for_member(member, request) else {
                continue;
            };
            let child = request.push(
                member.ty.clone(),
                key,
                Some(DependencyInfo::Member { name: member.name }),
            );
            let dependency = container
                .get_or_add_factory(&child, IfUnresolved::Throw)?
                .ok_or_else(|| DiError::unable_to_resolve(&child))?;
            binds.push((member.clone(), dependency.expression(&child, container)?));
        }

        let expr = if binds.is_empty() {
            new_expr
        } else {
            Expr::MemberInit { new: Box::new(new_expr), binds }
        };

        // View the implementation as the requested service type.
        if self.impl_type.ty == *request.service_type() {
            Ok(expr)
        } else {
            Ok(Expr::Convert { inner: Box::new(expr) })
        }
    }
}
