//! The registry: registration tables, resolution entry points, caches.
//!
//! A [`Container`] is a cheap handle over per-container state (current
//! scope, weak self-reference) plus shared registry state. `open_scope`
//! produces a child sharing every registration table, cache, the constants
//! vector, and the singleton scope, while owning a fresh current scope; the
//! same compiled expressions then run against the child's scope through the
//! [`ConstantsView`] overlay.
//!
//! Registration tables are lock-free concurrent maps; the resolution and
//! expression caches are persistent tries swapped by compare-and-swap, so
//! the hot path never blocks.

use dashmap::DashMap;
use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use crate::error::{DiError, DiResult};
use crate::expr::{
    compile_factory, CompiledFactory, ConstantsView, Expr, LambdaParam, REGISTRY_CONSTANT,
};
use crate::factory::{
    ctor_arg, Ctor, Factory, FactoryId, FactoryType, ImplType, Member, ParamInfo, Setup, WrappedArg,
};
use crate::hash_trie::AtomicTrie;
use crate::request::{FuncArgs, Request};
use crate::reuse::Reuse;
use crate::rules::{ResolutionRules, UnregisteredServiceRule};
use crate::scope::Scope;
use crate::types::{ServiceKey, ServiceType};
use crate::wrappers;
use crate::Object;

#[cfg(feature = "logging")]
use tracing::{debug, trace};

/// What to do when no factory matches a resolution request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IfUnresolved {
    Throw,
    ReturnNull,
}

/// Built-in surface installed at container construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ContainerSetup {
    /// Collection rule plus the Func / Lazy / Many / Meta / DebugExpr
    /// wrappers
    #[default]
    Default,
    /// No built-in wrappers
    Minimal,
}

/// Registrations for one service type.
#[derive(Default)]
struct FactoriesEntry {
    last_default: Option<Arc<Factory>>,
    /// Populated once a second default registration arrives; keys are
    /// insertion indices, so ordered traversal is registration order.
    default_factories: Option<BTreeMap<usize, Arc<Factory>>>,
    max_default_index: usize,
    named: Option<HashMap<Arc<str>, Arc<Factory>, ahash::RandomState>>,
}

/// One registered decorator plus its memoized function expression.
pub(crate) struct DecoratorEntry {
    pub(crate) factory: Arc<Factory>,
    /// Id of the open-generic decorator this closed entry was specialized
    /// from, if any.
    origin: Option<FactoryId>,
    cached_expr: Mutex<Option<Expr>>,
}

impl DecoratorEntry {
    fn new(factory: Arc<Factory>, origin: Option<FactoryId>) -> Self {
        Self { factory, origin, cached_expr: Mutex::new(None) }
    }

    fn cached(&self) -> Option<Expr> {
        self.cached_expr.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn store(&self, expr: Expr) {
        *self.cached_expr.lock().unwrap_or_else(PoisonError::into_inner) = Some(expr);
    }
}

struct SharedState {
    factories: DashMap<ServiceType, FactoriesEntry, ahash::RandomState>,
    decorators: DashMap<ServiceType, Vec<Arc<DecoratorEntry>>, ahash::RandomState>,
    /// Concrete impl TypeId -> descriptor, for post-construction injection
    impl_index: DashMap<TypeId, Arc<ImplType>, ahash::RandomState>,
    default_cache: AtomicTrie<ServiceType, CompiledFactory>,
    keyed_cache: AtomicTrie<(ServiceType, ServiceKey), CompiledFactory>,
    expr_cache: AtomicTrie<FactoryId, Arc<Expr>>,
    /// Copy-on-append; resolutions clone the snapshot Arc instead of
    /// holding the lock across factory invocation.
    constants: RwLock<Arc<Vec<Object>>>,
    rules: RwLock<ResolutionRules>,
    singleton_scope: Arc<Scope>,
}

struct ContainerCell {
    shared: Arc<SharedState>,
    current_scope: Arc<Scope>,
    self_ref: Object,
    current_scope_obj: Object,
    is_root: bool,
}

impl Drop for ContainerCell {
    fn drop(&mut self) {
        self.current_scope.dispose();
        if self.is_root {
            self.shared.singleton_scope.dispose();
        }
    }
}

/// Non-owning handle to a container, resolved at expression-execution
/// time. Compiled expressions and deferred wrappers hold these so the
/// constants table can reference callables without keeping the container
/// alive; a dead handle surfaces as `ContainerIsGarbageCollected`.
#[derive(Clone)]
pub struct WeakContainer(Weak<ContainerCell>);

impl WeakContainer {
    pub fn upgrade(&self) -> Option<Container> {
        self.0.upgrade().map(|cell| Container { cell })
    }

    pub(crate) fn upgrade_or(&self, service: impl ToString) -> DiResult<Container> {
        self.upgrade()
            .ok_or_else(|| DiError::ContainerIsGarbageCollected { service: service.to_string() })
    }
}

/// The inversion-of-control container: registry plus resolver.
#[derive(Clone)]
pub struct Container {
    cell: Arc<ContainerCell>,
}

impl Container {
    /// A container with the default built-in wrappers installed.
    pub fn new() -> Self {
        Self::with_setup(ContainerSetup::Default)
    }

    pub fn with_setup(setup: ContainerSetup) -> Self {
        let singleton_scope = Arc::new(Scope::new());
        let current_scope = Arc::new(Scope::new());
        let singleton_obj: Object = singleton_scope.clone();

        let shared = Arc::new(SharedState {
            factories: DashMap::with_hasher(ahash::RandomState::new()),
            decorators: DashMap::with_hasher(ahash::RandomState::new()),
            impl_index: DashMap::with_hasher(ahash::RandomState::new()),
            default_cache: AtomicTrie::new(),
            keyed_cache: AtomicTrie::new(),
            expr_cache: AtomicTrie::new(),
            // Slots 0 and 2 are per-container and overlaid by the view;
            // the array carries placeholders to keep indices stable.
            constants: RwLock::new(Arc::new(vec![
                Arc::new(()) as Object,
                singleton_obj,
                Arc::new(()) as Object,
            ])),
            rules: RwLock::new(ResolutionRules::default()),
            singleton_scope,
        });

        let container = Self::materialize(shared, current_scope, true);

        #[cfg(feature = "logging")]
        debug!(
            target: "armature_ioc",
            setup = ?setup,
            "created root container"
        );

        if setup == ContainerSetup::Default {
            wrappers::install(&container)
                .expect("built-in wrapper registration cannot collide");
        }
        container
    }

    fn materialize(shared: Arc<SharedState>, current_scope: Arc<Scope>, is_root: bool) -> Self {
        let current_scope_obj: Object = current_scope.clone();
        let cell = Arc::new_cyclic(|weak| ContainerCell {
            shared,
            current_scope,
            self_ref: Arc::new(WeakContainer(weak.clone())) as Object,
            current_scope_obj,
            is_root,
        });
        Self { cell }
    }

    /// Open a scoped child container.
    ///
    /// The child shares registrations, decorators, caches, constants, and
    /// the singleton scope; it owns a fresh current scope and its own weak
    /// self-reference.
    pub fn open_scope(&self) -> Container {
        let child = Self::materialize(self.cell.shared.clone(), Arc::new(Scope::new()), false);

        #[cfg(feature = "logging")]
        debug!(
            target: "armature_ioc",
            parent_scope = self.cell.current_scope.id(),
            child_scope = child.cell.current_scope.id(),
            "opened scoped container"
        );

        child
    }

    /// Dispose this container's current scope (and, for the root, the
    /// singleton scope). Also runs on drop of the last handle.
    pub fn dispose(&self) {
        self.cell.current_scope.dispose();
        if self.cell.is_root {
            self.cell.shared.singleton_scope.dispose();
        }
    }

    /// Non-owning handle for use from long-lived callables.
    pub fn downgrade(&self) -> WeakContainer {
        WeakContainer(Arc::downgrade(&self.cell))
    }

    pub fn current_scope(&self) -> &Arc<Scope> {
        &self.cell.current_scope
    }

    pub(crate) fn singleton_scope(&self) -> &Arc<Scope> {
        &self.cell.shared.singleton_scope
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a factory under a service type and key.
    pub fn register_factory(
        &self,
        factory: Factory,
        service_type: ServiceType,
        key: ServiceKey,
    ) -> DiResult<Arc<Factory>> {
        self.register_shared(Arc::new(factory), service_type, key)
    }

    pub(crate) fn register_shared(
        &self,
        factory: Arc<Factory>,
        service_type: ServiceType,
        key: ServiceKey,
    ) -> DiResult<Arc<Factory>> {
        factory.validate_registration(&service_type)?;

        #[cfg(feature = "logging")]
        debug!(
            target: "armature_ioc",
            service = %service_type,
            key = %key,
            factory_id = factory.id(),
            kind = ?factory.factory_type(),
            "registering factory"
        );

        if factory.factory_type() == FactoryType::Decorator {
            let table_key = if service_type.is_open_or_definition() {
                service_type.definition_form()
            } else {
                service_type.clone()
            };
            self.add_decorator_entry(table_key, factory.clone(), None);
            self.invalidate_resolution_caches(&service_type)?;
            // A function decorator under Func<T, T> changes how T itself
            // resolves; its compiled factory is stale too.
            if wrappers::is_func_type(&service_type) {
                if let [input, output] = service_type.type_args() {
                    if input == output {
                        self.invalidate_resolution_caches(output)?;
                    }
                }
            }
            return Ok(factory);
        }

        if let Some(descriptor) = factory.impl_descriptor() {
            if let Some(type_id) = descriptor.service_type().concrete_id() {
                self.cell.shared.impl_index.insert(type_id, descriptor.clone());
            }
        }

        let table_key = if service_type.is_open_or_definition() {
            service_type.definition_form()
        } else {
            service_type.clone()
        };
        {
            let mut entry = self.cell.shared.factories.entry(table_key).or_default();
            match &key {
                ServiceKey::Default => {
                    if entry.last_default.is_none() && entry.default_factories.is_none() {
                        entry.last_default = Some(factory.clone());
                        entry.max_default_index = 1;
                    } else {
                        let next_index = entry.max_default_index;
                        let previous = entry.last_default.clone();
                        let map = entry.default_factories.get_or_insert_with(BTreeMap::new);
                        if map.is_empty() {
                            if let Some(previous) = previous {
                                map.insert(0, previous);
                            }
                        }
                        map.insert(next_index, factory.clone());
                        entry.max_default_index = next_index + 1;
                        entry.last_default = Some(factory.clone());
                    }
                }
                ServiceKey::Index(index) => {
                    let previous = entry.last_default.clone();
                    let had_map = entry.default_factories.is_some();
                    let map = entry.default_factories.get_or_insert_with(BTreeMap::new);
                    if !had_map {
                        // Keep an existing unkeyed default enumerable.
                        if let Some(previous) = previous {
                            map.insert(0, previous);
                        }
                    }
                    map.insert(*index, factory.clone());
                    entry.max_default_index = entry.max_default_index.max(index + 1);
                    entry.last_default = Some(factory.clone());
                }
                ServiceKey::Name(name) => {
                    let named = entry
                        .named
                        .get_or_insert_with(|| HashMap::with_hasher(ahash::RandomState::new()));
                    if named.contains_key(&**name) {
                        return Err(DiError::DuplicateServiceName {
                            service: service_type.to_string(),
                            name: name.to_string(),
                        });
                    }
                    named.insert(name.clone(), factory.clone());
                }
            }
        }

        self.invalidate_resolution_caches(&service_type)?;
        Ok(factory)
    }

    /// Register an implementation descriptor for a service type.
    pub fn register_impl(
        &self,
        service_type: ServiceType,
        impl_type: ImplType,
        reuse: Option<Reuse>,
    ) -> DiResult<Arc<Factory>> {
        self.register_factory(
            Factory::reflection(impl_type, reuse, Setup::service()),
            service_type,
            ServiceKey::Default,
        )
    }

    /// Named variant of [`Container::register_impl`].
    pub fn register_impl_named(
        &self,
        service_type: ServiceType,
        impl_type: ImplType,
        reuse: Option<Reuse>,
        name: impl Into<Arc<str>>,
    ) -> DiResult<Arc<Factory>> {
        self.register_factory(
            Factory::reflection(impl_type, reuse, Setup::service()),
            service_type,
            ServiceKey::name(name),
        )
    }

    /// Register one implementation under its own type and every service
    /// type it declares, sharing a single factory (and so a single scoped
    /// instance) across all of them.
    pub fn register_all(
        &self,
        impl_type: ImplType,
        reuse: Option<Reuse>,
    ) -> DiResult<Arc<Factory>> {
        let services: Vec<ServiceType> = std::iter::once(impl_type.service_type().clone())
            .chain(impl_type.implemented().iter().cloned())
            .collect();
        let factory = Arc::new(Factory::reflection(impl_type, reuse, Setup::service()));
        for service in services {
            self.register_shared(factory.clone(), service, ServiceKey::Default)?;
        }
        Ok(factory)
    }

    /// Register a user delegate invoked against the container at
    /// resolution time.
    pub fn register_delegate<T: Send + Sync + 'static>(
        &self,
        reuse: Option<Reuse>,
        make: impl Fn(&Container) -> DiResult<T> + Send + Sync + 'static,
    ) -> DiResult<Arc<Factory>> {
        self.register_delegate_keyed(ServiceKey::Default, reuse, make)
    }

    pub fn register_delegate_keyed<T: Send + Sync + 'static>(
        &self,
        key: ServiceKey,
        reuse: Option<Reuse>,
        make: impl Fn(&Container) -> DiResult<T> + Send + Sync + 'static,
    ) -> DiResult<Arc<Factory>> {
        let make = Arc::new(make);
        let factory = Factory::delegate(
            move |_request, _container| {
                let make = make.clone();
                // The delegate runs against the weak self-reference in
                // constants slot 0, resolved at execution time.
                let ctor = Ctor::new(
                    vec![ParamInfo::new("resolver", ServiceType::of::<WeakContainer>())],
                    move |args| {
                        let weak = ctor_arg::<WeakContainer>(&args, 0)?;
                        let container = weak.upgrade_or(std::any::type_name::<T>())?;
                        Ok(Arc::new(make(&container)?) as Object)
                    },
                )
                .named(std::any::type_name::<T>());
                Ok(Some(Expr::New {
                    ctor: Arc::new(ctor),
                    args: vec![Expr::Constant { index: REGISTRY_CONSTANT }],
                }))
            },
            reuse,
            Setup::service(),
        );
        self.register_factory(factory, ServiceType::of::<T>(), key)
    }

    /// Register a pre-created instance, captured into the constants table.
    pub fn register_instance<T: Send + Sync + 'static>(&self, value: T) -> DiResult<Arc<Factory>> {
        self.register_instance_keyed(ServiceKey::Default, value)
    }

    pub fn register_instance_keyed<T: Send + Sync + 'static>(
        &self,
        key: ServiceKey,
        value: T,
    ) -> DiResult<Arc<Factory>> {
        let object: Object = Arc::new(value);
        let factory = Factory::delegate(
            move |_request, container| container.constant_expression(object.clone()).map(Some),
            None,
            Setup::service(),
        );
        self.register_factory(factory, ServiceType::of::<T>(), key)
    }

    /// Whether anything is registered for the service type (optionally
    /// under a specific name).
    pub fn is_registered(&self, service_type: &ServiceType, name: Option<&str>) -> bool {
        let lookup = |table_key: &ServiceType| -> bool {
            let Some(entry) = self.cell.shared.factories.get(table_key) else {
                return false;
            };
            match name {
                Some(name) => entry.named.as_ref().is_some_and(|m| m.contains_key(name)),
                None => {
                    entry.last_default.is_some()
                        || entry.default_factories.as_ref().is_some_and(|m| !m.is_empty())
                        || entry.named.as_ref().is_some_and(|m| !m.is_empty())
                }
            }
        };
        lookup(service_type)
            || (service_type.is_generic() && lookup(&service_type.definition_form()))
    }

    /// All registered keys and factories for the exact service type, in
    /// registration order for defaults.
    pub fn get_keys(
        &self,
        service_type: &ServiceType,
        filter: Option<&dyn Fn(&Arc<Factory>) -> bool>,
    ) -> Vec<(ServiceKey, Arc<Factory>)> {
        let mut out = Vec::new();
        if let Some(entry) = self.cell.shared.factories.get(service_type) {
            if let Some(map) = &entry.default_factories {
                for (index, factory) in map.iter() {
                    out.push((ServiceKey::Index(*index), factory.clone()));
                }
            } else if let Some(factory) = &entry.last_default {
                out.push((ServiceKey::Default, factory.clone()));
            }
            if let Some(named) = &entry.named {
                let mut names: Vec<(Arc<str>, Arc<Factory>)> =
                    named.iter().map(|(n, f)| (n.clone(), f.clone())).collect();
                names.sort_by(|a, b| a.0.cmp(&b.0));
                for (name, factory) in names {
                    out.push((ServiceKey::Name(name), factory.clone()));
                }
            }
        }
        match filter {
            Some(predicate) => out.into_iter().filter(|(_, f)| predicate(f)).collect(),
            None => out,
        }
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Resolve the default registration for a closed service type.
    pub fn resolve(
        &self,
        service_type: &ServiceType,
        if_unresolved: IfUnresolved,
    ) -> DiResult<Option<Object>> {
        self.resolve_keyed(service_type, ServiceKey::Default, if_unresolved)
    }

    /// Resolve a keyed registration for a closed service type.
    pub fn resolve_keyed(
        &self,
        service_type: &ServiceType,
        key: ServiceKey,
        if_unresolved: IfUnresolved,
    ) -> DiResult<Option<Object>> {
        if service_type.is_open_or_definition() {
            return Err(DiError::ExpectedClosedGenericServiceType {
                service: service_type.to_string(),
            });
        }

        let cached = if key.is_default() {
            self.cell.shared.default_cache.load().get(service_type).cloned()
        } else {
            self.cell
                .shared
                .keyed_cache
                .load()
                .get(&(service_type.clone(), key.clone()))
                .cloned()
        };
        if let Some(compiled) = cached {
            #[cfg(feature = "logging")]
            trace!(
                target: "armature_ioc",
                service = %service_type,
                location = "cache",
                "service resolved from compiled-factory cache"
            );
            return self.invoke(&compiled).map(Some);
        }

        #[cfg(feature = "logging")]
        trace!(
            target: "armature_ioc",
            service = %service_type,
            key = %key,
            "resolving service (cache miss)"
        );

        let result = self.resolve_slow(service_type, &key, if_unresolved);
        match (&result, if_unresolved) {
            (Err(DiError::UnableToResolve { .. }), IfUnresolved::ReturnNull) => Ok(None),
            _ => result,
        }
    }

    fn resolve_slow(
        &self,
        service_type: &ServiceType,
        key: &ServiceKey,
        if_unresolved: IfUnresolved,
    ) -> DiResult<Option<Object>> {
        let request = Request::root(service_type.clone(), key.clone());
        let Some(factory) = self.get_or_add_factory(&request, if_unresolved)? else {
            return Ok(None);
        };
        let expr = factory.expression(&request, self)?;
        let compiled = compile_factory(&expr);
        if key.is_default() {
            self.cell
                .shared
                .default_cache
                .swap(|trie| trie.insert(service_type.clone(), compiled.clone()))?;
        } else {
            self.cell.shared.keyed_cache.swap(|trie| {
                trie.insert((service_type.clone(), key.clone()), compiled.clone())
            })?;
        }
        self.invoke(&compiled).map(Some)
    }

    fn invoke(&self, compiled: &CompiledFactory) -> DiResult<Object> {
        let view = self.constants_view();
        let mut resolution_scope = None;
        compiled(&view, &mut resolution_scope)
    }

    /// Typed resolution convenience: resolve `T` and downcast.
    pub fn get<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        let ty = ServiceType::of::<T>();
        let object = self
            .resolve(&ty, IfUnresolved::Throw)?
            .ok_or_else(|| DiError::unable_to_resolve(&ty))?;
        object.downcast::<T>().map_err(|_| DiError::type_mismatch(ty))
    }

    /// Typed resolution returning `None` when unregistered.
    pub fn try_get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve(&ServiceType::of::<T>(), IfUnresolved::ReturnNull)
            .ok()
            .flatten()
            .and_then(|object| object.downcast::<T>().ok())
    }

    /// Typed named resolution.
    pub fn get_named<T: Send + Sync + 'static>(&self, name: &str) -> DiResult<Arc<T>> {
        let ty = ServiceType::of::<T>();
        let object = self
            .resolve_keyed(&ty, ServiceKey::name(name), IfUnresolved::Throw)?
            .ok_or_else(|| DiError::unable_to_resolve(&ty))?;
        object.downcast::<T>().map_err(|_| DiError::type_mismatch(ty))
    }

    /// Locate (or derive) the factory for a request.
    ///
    /// Lookup order: exact service type, then the open definition form;
    /// provider factories are asked for a request-specific factory, which
    /// is registered under the closed service type to memoize the
    /// specialization; unregistered-service rules run last.
    pub fn get_or_add_factory(
        &self,
        request: &Request,
        if_unresolved: IfUnresolved,
    ) -> DiResult<Option<Arc<Factory>>> {
        let service_type = request.service_type();
        let mut selected = self.select_factory(service_type, request.service_key())?;
        if selected.is_none() && service_type.is_generic() {
            selected =
                self.select_factory(&service_type.definition_form(), request.service_key())?;
        }

        if let Some(factory) = selected {
            if factory.provides_factory_per_request() {
                if let Some(specialized) = factory.factory_for_request(request, self)? {
                    #[cfg(feature = "logging")]
                    debug!(
                        target: "armature_ioc",
                        service = %service_type,
                        open_factory = factory.id(),
                        "memoizing request-specific factory"
                    );
                    let registered = self.register_factory(
                        specialized,
                        service_type.clone(),
                        ServiceKey::Default,
                    )?;
                    return Ok(Some(registered));
                }
                // Provider declined (e.g. metadata miss): fall through to
                // the unregistered-service rules.
            } else {
                return Ok(Some(factory));
            }
        }

        let rules: Vec<UnregisteredServiceRule> = self
            .cell
            .shared
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .unregistered_services
            .clone();
        for rule in rules {
            if let Some(factory) = rule(request, self)? {
                let registered = self.register_shared(
                    factory,
                    service_type.clone(),
                    request.service_key().clone(),
                )?;
                return Ok(Some(registered));
            }
        }

        match if_unresolved {
            IfUnresolved::Throw => Err(DiError::unable_to_resolve(request)),
            IfUnresolved::ReturnNull => Ok(None),
        }
    }

    /// The factory registered for a service type and key, without invoking
    /// providers or rules.
    pub fn get_factory(
        &self,
        service_type: &ServiceType,
        key: &ServiceKey,
    ) -> DiResult<Option<Arc<Factory>>> {
        let found = self.select_factory(service_type, key)?;
        if found.is_some() || !service_type.is_generic() {
            return Ok(found);
        }
        self.select_factory(&service_type.definition_form(), key)
    }

    fn select_factory(
        &self,
        table_key: &ServiceType,
        key: &ServiceKey,
    ) -> DiResult<Option<Arc<Factory>>> {
        enum Picked {
            One(Arc<Factory>),
            Ambiguous(Vec<(usize, Arc<Factory>)>),
            None,
        }

        let picked = {
            let Some(entry) = self.cell.shared.factories.get(table_key) else {
                return Ok(None);
            };
            match key {
                ServiceKey::Default => match &entry.default_factories {
                    Some(map) if map.len() > 1 => {
                        Picked::Ambiguous(map.iter().map(|(i, f)| (*i, f.clone())).collect())
                    }
                    Some(map) => match map.values().next() {
                        Some(factory) => Picked::One(factory.clone()),
                        None => match &entry.last_default {
                            Some(factory) => Picked::One(factory.clone()),
                            None => Picked::None,
                        },
                    },
                    None => match &entry.last_default {
                        Some(factory) => Picked::One(factory.clone()),
                        None => Picked::None,
                    },
                },
                ServiceKey::Index(index) => {
                    let direct =
                        entry.default_factories.as_ref().and_then(|m| m.get(index)).cloned();
                    let fallback = (*index == 0 && entry.default_factories.is_none())
                        .then(|| entry.last_default.clone())
                        .flatten();
                    match direct.or(fallback) {
                        Some(factory) => Picked::One(factory),
                        None => Picked::None,
                    }
                }
                ServiceKey::Name(name) => {
                    match entry.named.as_ref().and_then(|m| m.get(&**name)).cloned() {
                        Some(factory) => Picked::One(factory),
                        None => Picked::None,
                    }
                }
            }
        };

        match picked {
            Picked::One(factory) => Ok(Some(factory)),
            Picked::None => Ok(None),
            Picked::Ambiguous(candidates) => {
                let selector = self
                    .cell
                    .shared
                    .rules
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .single_default_selector
                    .clone();
                match selector {
                    Some(select) => Ok(select(&candidates)),
                    None => Err(DiError::ExpectedSingleDefaultFactory {
                        service: table_key.to_string(),
                        count: candidates.len(),
                    }),
                }
            }
        }
    }

    /// Chain another container as a fallback for unregistered services.
    pub fn resolve_unregistered_from(&self, other: &Container) {
        let fallback = other.downgrade();
        self.update_rules(|rules| {
            rules.add_unregistered_service(Arc::new(move |request, _| {
                match fallback.upgrade() {
                    Some(other) => other.get_or_add_factory(request, IfUnresolved::ReturnNull),
                    None => Ok(None),
                }
            }));
        });
    }

    /// Inject members into an instance not built by the container.
    ///
    /// The instance's concrete type must have been registered through an
    /// implementation descriptor. `key_of` overrides the member key rules;
    /// without either, members are resolved under the default key. Members
    /// whose service cannot be resolved are skipped.
    pub fn resolve_members(
        &self,
        instance: &Object,
        key_of: Option<&dyn Fn(&Member) -> Option<ServiceKey>>,
    ) -> DiResult<()> {
        let type_id = (**instance).type_id();
        let Some(descriptor) = self.cell.shared.impl_index.get(&type_id).map(|d| d.clone()) else {
            return Ok(());
        };
        let request = Request::root(descriptor.service_type().clone(), ServiceKey::Default);
        for member in descriptor.members() {
            let key = match key_of {
                Some(key_of) => key_of(member),
                None => Some(self.key_for_member(member, &request).unwrap_or(ServiceKey::Default)),
            };
            let Some(key) = key else { continue };
            if let Some(value) = self.resolve_keyed(&member.ty, key, IfUnresolved::ReturnNull)? {
                member.assign(instance, value)?;
            }
        }
        Ok(())
    }

    /// Unwrap chains of generic wrappers down to the ultimate service type.
    pub fn wrapped_service_type_or_self(&self, service_type: &ServiceType) -> DiResult<ServiceType> {
        let mut current = service_type.clone();
        loop {
            if !current.is_generic() {
                return Ok(current);
            }
            if wrappers::is_collection_type(&current) {
                match current.type_args().first() {
                    Some(item) => {
                        current = item.clone();
                        continue;
                    }
                    None => return Ok(current),
                }
            }
            let Some(factory) = self.select_factory(&current.definition_form(), &ServiceKey::Default)?
            else {
                return Ok(current);
            };
            let Some(wrapped_arg) = factory.setup().wrapped_arg() else {
                return Ok(current);
            };
            let args = current.type_args();
            let index = match wrapped_arg {
                WrappedArg::Single => {
                    if args.len() == 1 {
                        0
                    } else {
                        return Err(DiError::GenericWrapperExpectsSingleTypeArgByDefault {
                            service: current.to_string(),
                        });
                    }
                }
                WrappedArg::Index(index) => index,
                WrappedArg::Last => args.len().saturating_sub(1),
            };
            let Some(next) = args.get(index).cloned() else {
                return Err(DiError::GenericWrapperExpectsSingleTypeArgByDefault {
                    service: current.to_string(),
                });
            };
            current = next;
        }
    }

    // =========================================================================
    // Decorators
    // =========================================================================

    pub(crate) fn add_decorator_entry(
        &self,
        table_key: ServiceType,
        factory: Arc<Factory>,
        origin: Option<FactoryId>,
    ) -> Arc<DecoratorEntry> {
        let entry = Arc::new(DecoratorEntry::new(factory, origin));
        self.cell
            .shared
            .decorators
            .entry(table_key)
            .or_default()
            .push(entry.clone());
        entry
    }

    fn decorator_entries(&self, table_key: &ServiceType) -> Vec<Arc<DecoratorEntry>> {
        self.cell
            .shared
            .decorators
            .get(table_key)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Build the composed decorating expression for a request, or `None`
    /// when no decorator applies.
    ///
    /// Function decorators (registered under `Func<T, T>`) fold first into
    /// a single lambda; direct decorators follow, concrete registrations
    /// before open-generic ones. The result is either a lambda to be
    /// applied over the decorated expression, or a full replacement.
    pub(crate) fn decorator_expr_or_none(&self, request: &Request) -> DiResult<Option<Expr>> {
        if request.factory_id() != 0 && request.decorated_factory_id() == request.factory_id() {
            return Ok(None);
        }
        let service_type = request.service_type().clone();
        let decorated = request.make_decorated();
        let mut result: Option<Expr> = None;

        let func_type = wrappers::func_of(vec![service_type.clone()], service_type.clone());
        for entry in self.decorator_entries(&func_type) {
            if !entry.factory.applies_to(&decorated) {
                continue;
            }
            let decorator = entry.factory.expression(&decorated, self)?;
            let param = LambdaParam::new(service_type.clone());
            let inner = match &result {
                None => Expr::ParamRef { id: param.id },
                Some(previous) => {
                    crate::expr::apply_lambda(previous, &Expr::ParamRef { id: param.id })
                }
            };
            let body = Expr::Invoke { target: Box::new(decorator), args: vec![inner] };
            result = Some(Expr::Lambda { params: Arc::from([param]), body: Arc::new(body) });
        }

        let mut entries = self.decorator_entries(&service_type);
        if service_type.is_generic() {
            let specialized: Vec<FactoryId> = entries.iter().filter_map(|e| e.origin).collect();
            for open_entry in self.decorator_entries(&service_type.definition_form()) {
                if !specialized.contains(&open_entry.factory.id()) {
                    entries.push(open_entry);
                }
            }
        }

        for entry in entries {
            if !entry.factory.applies_to(&decorated) {
                continue;
            }
            let memo = if entry.factory.provides_factory_per_request() {
                match entry.factory.factory_for_request(&decorated, self)? {
                    Some(specialized) => self.add_decorator_entry(
                        service_type.clone(),
                        Arc::new(specialized),
                        Some(entry.factory.id()),
                    ),
                    None => continue,
                }
            } else {
                entry.clone()
            };

            let decorator = match memo.cached() {
                Some(expr) => expr,
                None => {
                    let built =
                        self.decorator_func_expr(&memo.factory, &decorated, &service_type)?;
                    memo.store(built.clone());
                    built
                }
            };

            result = Some(match result {
                None => decorator,
                Some(previous) => {
                    if matches!(previous, Expr::Lambda { .. }) {
                        let param = LambdaParam::new(service_type.clone());
                        let inner =
                            crate::expr::apply_lambda(&previous, &Expr::ParamRef { id: param.id });
                        let body = crate::expr::apply_lambda(&decorator, &inner);
                        Expr::Lambda { params: Arc::from([param]), body: Arc::new(body) }
                    } else {
                        crate::expr::apply_lambda(&decorator, &previous)
                    }
                }
            });
        }

        Ok(result)
    }

    /// Materialize a decorator as a unary function expression over the
    /// decorated service.
    fn decorator_func_expr(
        &self,
        factory: &Arc<Factory>,
        decorated: &Request,
        service_type: &ServiceType,
    ) -> DiResult<Expr> {
        if !factory.is_reflection() {
            return factory.expression(decorated, self);
        }
        let param = LambdaParam::new(service_type.clone());
        let func_type = wrappers::func_of(vec![service_type.clone()], service_type.clone());
        let func_args = Arc::new(FuncArgs::new(func_type, vec![param.clone()]));
        let with_args = decorated.with_func_args(func_args.clone());
        let body = factory.expression(&with_args, self)?;
        if func_args.unused_count() > 0 {
            return Err(DiError::DecoratorFactoryShouldSupportFuncResolution {
                impl_type: factory
                    .impl_service_type()
                    .map(|ty| ty.to_string())
                    .unwrap_or_default(),
                service: service_type.to_string(),
            });
        }
        Ok(Expr::Lambda { params: Arc::from([param]), body: Arc::new(body) })
    }

    // =========================================================================
    // Constants, caches, rules
    // =========================================================================

    pub(crate) fn constants_view(&self) -> ConstantsView {
        let items = self
            .cell
            .shared
            .constants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        ConstantsView::new(items, self.cell.self_ref.clone(), self.cell.current_scope_obj.clone())
    }

    /// Expression indexing the constant slot holding `object`, appending a
    /// new slot on first use.
    pub fn constant_expression(&self, object: Object) -> DiResult<Expr> {
        let mut constants =
            self.cell.shared.constants.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = constants.iter().position(|slot| Arc::ptr_eq(slot, &object)) {
            return Ok(Expr::Constant { index });
        }
        let mut next = (**constants).clone();
        next.push(object);
        let index = next.len() - 1;
        *constants = Arc::new(next);
        Ok(Expr::Constant { index })
    }

    pub(crate) fn cached_factory_expression(&self, factory_id: FactoryId) -> Option<Arc<Expr>> {
        self.cell.shared.expr_cache.load().get(&factory_id).cloned()
    }

    pub(crate) fn cache_factory_expression(
        &self,
        factory_id: FactoryId,
        expr: Expr,
    ) -> DiResult<()> {
        self.cell.shared.expr_cache.swap(|trie| trie.insert(factory_id, Arc::new(expr.clone())))
    }

    fn invalidate_resolution_caches(&self, service_type: &ServiceType) -> DiResult<()> {
        let shared = &self.cell.shared;
        if service_type.is_open_or_definition() {
            let def = service_type.def();
            let stale: Vec<ServiceType> = shared
                .default_cache
                .load()
                .entries()
                .into_iter()
                .filter(|(ty, _)| ty.def() == def)
                .map(|(ty, _)| ty)
                .collect();
            if !stale.is_empty() {
                shared.default_cache.swap(|trie| {
                    stale.iter().fold(trie.clone(), |acc, ty| acc.remove(ty))
                })?;
            }
            let stale_keyed: Vec<(ServiceType, ServiceKey)> = shared
                .keyed_cache
                .load()
                .entries()
                .into_iter()
                .filter(|((ty, _), _)| ty.def() == def)
                .map(|(key, _)| key)
                .collect();
            if !stale_keyed.is_empty() {
                shared.keyed_cache.swap(|trie| {
                    stale_keyed.iter().fold(trie.clone(), |acc, key| acc.remove(key))
                })?;
            }
        } else {
            shared.default_cache.swap(|trie| trie.remove(service_type))?;
            let stale_keyed: Vec<(ServiceType, ServiceKey)> = shared
                .keyed_cache
                .load()
                .entries()
                .into_iter()
                .filter(|((ty, _), _)| ty == service_type)
                .map(|(key, _)| key)
                .collect();
            if !stale_keyed.is_empty() {
                shared.keyed_cache.swap(|trie| {
                    stale_keyed.iter().fold(trie.clone(), |acc, key| acc.remove(key))
                })?;
            }
        }
        Ok(())
    }

    /// Mutate the resolution rules shared by this container and its scopes.
    pub fn update_rules(&self, update: impl FnOnce(&mut ResolutionRules)) {
        let mut rules = self.cell.shared.rules.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut rules);
    }

    pub(crate) fn key_for_ctor_param(
        &self,
        param: &ParamInfo,
        request: &Request,
    ) -> Option<ServiceKey> {
        let rules = self
            .cell
            .shared
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .constructor_parameters
            .clone();
        rules.iter().find_map(|rule| rule(param, request))
    }

    pub(crate) fn key_for_member(&self, member: &Member, request: &Request) -> Option<ServiceKey> {
        let rules = self
            .cell
            .shared
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .clone();
        rules.iter().find_map(|rule| rule(member, request))
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("registered_types", &self.cell.shared.factories.len())
            .field("decorated_types", &self.cell.shared.decorators.len())
            .field("current_scope", &self.cell.current_scope.id())
            .field("is_root", &self.cell.is_root)
            .finish()
    }
}
