//! # Armature IoC - Expression-Compiling Dependency Injection for Rust
//!
//! An inversion-of-control container built around an abstract construction
//! IR: every resolved service is lowered to an expression, compiled once
//! into a closed factory closure, and cached in a lock-free persistent
//! trie.
//!
//! ## Features
//!
//! - **Lock-free resolution** - compiled factories live in persistent
//!   hash-tries published by compare-and-swap; readers never block
//! - **Runtime type tokens** - services are keyed by [`ServiceType`]
//!   tokens, including open-generic constructors specialized per request
//! - **Reuse policies** - transient, singleton, current-scope, and
//!   resolution-scope lifetimes
//! - **Decorators** - composed around the underlying expression in
//!   registration order
//! - **Generic wrappers** - `Func`, `Lazy`, `Many`, `Meta`, `DebugExpr`,
//!   and slice/enumerable collections
//! - **Scoped containers** - children share registrations and singletons
//!   while owning their current scope
//! - **Observable** - optional `tracing` integration with JSON or pretty
//!   output
//!
//! ## Quick Start
//!
//! ```rust
//! use armature_ioc::{ctor_arg, Container, Ctor, ImplType, ParamInfo, ServiceType};
//! use std::sync::Arc;
//!
//! struct Database {
//!     url: String,
//! }
//!
//! struct UserService {
//!     db: Arc<Database>,
//! }
//!
//! let container = Container::new();
//! container
//!     .register_instance(Database { url: "postgres://localhost".into() })
//!     .unwrap();
//! container
//!     .register_impl(
//!         ServiceType::of::<UserService>(),
//!         ImplType::of::<UserService>().with_ctor(Ctor::new(
//!             vec![ParamInfo::new("db", ServiceType::of::<Database>())],
//!             |args| {
//!                 let db = ctor_arg::<Database>(&args, 0)?;
//!                 Ok(Arc::new(UserService { db }))
//!             },
//!         )),
//!         None,
//!     )
//!     .unwrap();
//!
//! let users = container.get::<UserService>().unwrap();
//! assert_eq!(users.db.url, "postgres://localhost");
//! ```

mod container;
mod error;
mod expr;
mod factory;
mod hash_trie;
#[cfg(feature = "logging")]
pub mod logging;
mod request;
mod reuse;
mod rules;
mod scope;
mod types;
mod wrappers;

use std::any::Any;
use std::sync::Arc;

/// A type-erased resolved service.
pub type Object = Arc<dyn Any + Send + Sync>;

pub use container::{Container, ContainerSetup, IfUnresolved, WeakContainer};
pub use error::{DiError, DiResult};
pub use expr::{CompiledFactory, ConstantsView, Expr, LambdaParam, ScopeSource};
pub use factory::{
    ctor_arg, Ctor, Factory, FactoryId, FactoryType, ImplType, Member, ParamInfo, Registration,
    Setup, WrappedArg,
};
pub use hash_trie::{AtomicTrie, HashTrie, TrieKey};
pub use request::{DependencyInfo, FuncArgs, Request};
pub use reuse::Reuse;
pub use rules::{
    CtorParamRule, DefaultSelectorRule, MemberRule, ResolutionRules, UnregisteredServiceRule,
};
pub use scope::{DisposerFn, Scope};
pub use types::{GenericDef, ServiceKey, ServiceType, TypeArgBindings};
pub use wrappers::{
    debug_expr_of, enumerable_of, func_of, lazy_of, many_of, meta_of, slice_of, DebugExpr,
    LazyService, ManyServices, MetaService, ServiceFn,
};

// Re-export tracing macros for convenience when logging is enabled
#[cfg(feature = "logging")]
pub use tracing::{debug, error, info, trace, warn};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        ctor_arg, func_of, lazy_of, many_of, meta_of, slice_of, Container, Ctor, DiError,
        DiResult, IfUnresolved, ImplType, Member, Object, ParamInfo, Registration, Reuse,
        ServiceKey, ServiceType, Setup,
    };
    pub use std::sync::Arc;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn next_instance_id() -> u32 {
        static IDS: AtomicU32 = AtomicU32::new(1);
        IDS.fetch_add(1, Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // Transient reflection and recursion
    // ---------------------------------------------------------------------

    trait Greet: Send + Sync {
        fn hello(&self) -> &'static str;
    }

    struct Greeter;

    impl Greet for Greeter {
        fn hello(&self) -> &'static str {
            "hello"
        }
    }

    fn greeter_impl() -> ImplType {
        ImplType::of::<Greeter>()
            .implements(ServiceType::of::<dyn Greet>())
            .with_ctor(Ctor::new(vec![], |_| {
                Ok(Arc::new(Arc::new(Greeter) as Arc<dyn Greet>))
            }))
    }

    #[test]
    fn transient_reflection_yields_distinct_instances() {
        struct Counted {
            id: u32,
        }

        let container = Container::new();
        container
            .register_impl(
                ServiceType::of::<Counted>(),
                ImplType::of::<Counted>()
                    .with_ctor(Ctor::new(vec![], |_| Ok(Arc::new(Counted { id: next_instance_id() })))),
                None,
            )
            .unwrap();

        let a = container.get::<Counted>().unwrap();
        let b = container.get::<Counted>().unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn trait_object_service_resolves() {
        let container = Container::new();
        container.register_impl(ServiceType::of::<dyn Greet>(), greeter_impl(), None).unwrap();

        let object = container
            .resolve(&ServiceType::of::<dyn Greet>(), IfUnresolved::Throw)
            .unwrap()
            .unwrap();
        let service = object.downcast::<Arc<dyn Greet>>().unwrap();
        assert_eq!(service.hello(), "hello");
    }

    #[test]
    fn recursive_dependency_is_detected() {
        #[derive(Debug)]
        struct Loops;

        let container = Container::new();
        container
            .register_impl(
                ServiceType::of::<Loops>(),
                ImplType::of::<Loops>().with_ctor(Ctor::new(
                    vec![ParamInfo::new("inner", ServiceType::of::<Loops>())],
                    |_| Ok(Arc::new(Loops)),
                )),
                None,
            )
            .unwrap();

        let err = container.get::<Loops>().unwrap_err();
        assert!(matches!(err, DiError::RecursiveDependencyDetected { .. }));
    }

    // ---------------------------------------------------------------------
    // Singleton + Func wrapper
    // ---------------------------------------------------------------------

    struct Single {
        id: u32,
    }

    fn single_impl() -> ImplType {
        ImplType::of::<Single>()
            .with_ctor(Ctor::new(vec![], |_| Ok(Arc::new(Single { id: next_instance_id() }))))
    }

    #[test]
    fn singleton_is_shared_and_eager_capture_matches_deferred() {
        let container = Container::new();
        container
            .register_impl(ServiceType::of::<Single>(), single_impl(), Some(Reuse::Singleton))
            .unwrap();

        // Resolve the function wrapper before any direct resolution.
        let func = container
            .resolve(&func_of(vec![], ServiceType::of::<Single>()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<ServiceFn>()
            .unwrap();

        let a = func.call_as::<Single>(vec![]).unwrap();
        let b = func.call_as::<Single>(vec![]).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // The direct resolution observes the same singleton.
        let direct = container.get::<Single>().unwrap();
        assert!(Arc::ptr_eq(&a, &direct));
    }

    #[test]
    fn singleton_is_shared_with_scoped_children() {
        let container = Container::new();
        container
            .register_impl(ServiceType::of::<Single>(), single_impl(), Some(Reuse::Singleton))
            .unwrap();

        let root_instance = container.get::<Single>().unwrap();
        let child = container.open_scope();
        let child_instance = child.get::<Single>().unwrap();
        assert!(Arc::ptr_eq(&root_instance, &child_instance));
    }

    #[test]
    fn func_with_args_binds_call_arguments() {
        struct Tagged {
            tag: Arc<String>,
            base: Arc<Single>,
        }

        let container = Container::new();
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();
        container
            .register_impl(
                ServiceType::of::<Tagged>(),
                ImplType::of::<Tagged>().with_ctor(Ctor::new(
                    vec![
                        ParamInfo::new("tag", ServiceType::of::<String>()),
                        ParamInfo::new("base", ServiceType::of::<Single>()),
                    ],
                    |args| {
                        let tag = ctor_arg::<String>(&args, 0)?;
                        let base = ctor_arg::<Single>(&args, 1)?;
                        Ok(Arc::new(Tagged { tag, base }))
                    },
                )),
                None,
            )
            .unwrap();

        let func = container
            .resolve(
                &func_of(vec![ServiceType::of::<String>()], ServiceType::of::<Tagged>()),
                IfUnresolved::Throw,
            )
            .unwrap()
            .unwrap()
            .downcast::<ServiceFn>()
            .unwrap();

        let tagged =
            func.call_as::<Tagged>(vec![Arc::new("first".to_string())]).unwrap();
        assert_eq!(*tagged.tag, "first");
        let again = func.call_as::<Tagged>(vec![Arc::new("second".to_string())]).unwrap();
        assert_eq!(*again.tag, "second");
        assert!(!Arc::ptr_eq(&tagged.base, &again.base));
    }

    #[test]
    fn func_with_unused_argument_is_rejected() {
        let container = Container::new();
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();

        let err = container
            .resolve(
                &func_of(vec![ServiceType::of::<String>()], ServiceType::of::<Single>()),
                IfUnresolved::Throw,
            )
            .unwrap_err();
        assert!(matches!(err, DiError::SomeFuncParamsAreUnused { .. }));
    }

    #[test]
    fn dead_container_fails_function_calls() {
        let func = {
            let container = Container::new();
            container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();
            container
                .resolve(&func_of(vec![], ServiceType::of::<Single>()), IfUnresolved::Throw)
                .unwrap()
                .unwrap()
                .downcast::<ServiceFn>()
                .unwrap()
        };
        let err = func.call(vec![]).unwrap_err();
        assert!(matches!(err, DiError::ContainerIsGarbageCollected { .. }));
    }

    // ---------------------------------------------------------------------
    // Open generics
    // ---------------------------------------------------------------------

    struct IRepoDef;
    struct RepoDef;

    struct Repo<T: Send + Sync + 'static> {
        id: u32,
        _marker: std::marker::PhantomData<T>,
    }

    fn irepo_of(arg: ServiceType) -> ServiceType {
        ServiceType::generic::<IRepoDef>(vec![arg])
    }

    fn closed_repo_impl<T: Send + Sync + 'static>(arg: ServiceType) -> ImplType {
        ImplType::open(ServiceType::generic::<RepoDef>(vec![arg.clone()]))
            .implements(irepo_of(arg))
            .with_ctor(Ctor::new(vec![], |_| {
                Ok(Arc::new(Repo::<T> { id: next_instance_id(), _marker: std::marker::PhantomData }))
            }))
    }

    fn open_repo_impl() -> ImplType {
        let open_arg = ServiceType::param("T");
        ImplType::open(ServiceType::generic::<RepoDef>(vec![open_arg.clone()]))
            .implements(irepo_of(open_arg))
            .with_close(|bindings| {
                let arg = bindings
                    .get("T")
                    .cloned()
                    .ok_or_else(|| DiError::Internal("missing binding for T".into()))?;
                if arg == ServiceType::of::<u32>() {
                    Ok(closed_repo_impl::<u32>(arg))
                } else if arg == ServiceType::of::<String>() {
                    Ok(closed_repo_impl::<String>(arg))
                } else {
                    Err(DiError::UnableToFindOpenGenericImplTypeArg {
                        impl_type: "Repo<T>".into(),
                        service: arg.to_string(),
                    })
                }
            })
    }

    #[test]
    fn open_generic_specializes_per_closed_type() {
        let container = Container::new();
        container
            .register_impl(
                irepo_of(ServiceType::param("T")),
                open_repo_impl(),
                Some(Reuse::Singleton),
            )
            .unwrap();

        let ints = container
            .resolve(&irepo_of(ServiceType::of::<u32>()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Repo<u32>>()
            .unwrap();
        let strings = container
            .resolve(&irepo_of(ServiceType::of::<String>()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Repo<String>>()
            .unwrap();
        assert_ne!(ints.id, strings.id);

        // Same closed type resolves to the same singleton.
        let ints_again = container
            .resolve(&irepo_of(ServiceType::of::<u32>()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Repo<u32>>()
            .unwrap();
        assert!(Arc::ptr_eq(&ints, &ints_again));
    }

    // ---------------------------------------------------------------------
    // Decorators
    // ---------------------------------------------------------------------

    trait Engine: Send + Sync {
        fn describe(&self) -> String;
    }

    struct CoreEngine;

    impl Engine for CoreEngine {
        fn describe(&self) -> String {
            "core".into()
        }
    }

    struct LoggingEngine(Arc<dyn Engine>);

    impl Engine for LoggingEngine {
        fn describe(&self) -> String {
            format!("logging({})", self.0.describe())
        }
    }

    struct MetricsEngine(Arc<dyn Engine>);

    impl Engine for MetricsEngine {
        fn describe(&self) -> String {
            format!("metrics({})", self.0.describe())
        }
    }

    fn engine_token() -> ServiceType {
        ServiceType::of::<dyn Engine>()
    }

    fn core_engine_impl() -> ImplType {
        ImplType::of::<CoreEngine>()
            .implements(engine_token())
            .with_ctor(Ctor::new(vec![], |_| {
                Ok(Arc::new(Arc::new(CoreEngine) as Arc<dyn Engine>))
            }))
    }

    fn wrapping_decorator<W: Send + Sync + 'static>(
        wrap: impl Fn(Arc<dyn Engine>) -> Arc<dyn Engine> + Send + Sync + 'static,
    ) -> Factory {
        let impl_type = ImplType::of::<W>()
            .implements(engine_token())
            .with_ctor(Ctor::new(
                vec![ParamInfo::new("inner", engine_token())],
                move |args| {
                    let inner = ctor_arg::<Arc<dyn Engine>>(&args, 0)?;
                    Ok(Arc::new(wrap((*inner).clone())))
                },
            ));
        Factory::reflection(impl_type, None, Setup::decorator())
    }

    fn resolve_engine(container: &Container) -> Arc<dyn Engine> {
        let object =
            container.resolve(&engine_token(), IfUnresolved::Throw).unwrap().unwrap();
        (*object.downcast::<Arc<dyn Engine>>().unwrap()).clone()
    }

    #[test]
    fn decorators_compose_in_registration_order() {
        let container = Container::new();
        container.register_impl(engine_token(), core_engine_impl(), None).unwrap();

        container
            .register_factory(
                wrapping_decorator::<LoggingEngine>(|inner| Arc::new(LoggingEngine(inner))),
                engine_token(),
                ServiceKey::Default,
            )
            .unwrap();
        assert_eq!(resolve_engine(&container).describe(), "logging(core)");

        // A decorator registered afterwards applies on subsequent resolves.
        container
            .register_factory(
                wrapping_decorator::<MetricsEngine>(|inner| Arc::new(MetricsEngine(inner))),
                engine_token(),
                ServiceKey::Default,
            )
            .unwrap();
        assert_eq!(resolve_engine(&container).describe(), "metrics(logging(core))");
    }

    #[test]
    fn conditional_decorator_respects_predicate() {
        let container = Container::new();
        container.register_impl(engine_token(), core_engine_impl(), None).unwrap();

        let impl_type = ImplType::of::<LoggingEngine>()
            .implements(engine_token())
            .with_ctor(Ctor::new(
                vec![ParamInfo::new("inner", engine_token())],
                |args| {
                    let inner = ctor_arg::<Arc<dyn Engine>>(&args, 0)?;
                    Ok(Arc::new(Arc::new(LoggingEngine((*inner).clone())) as Arc<dyn Engine>))
                },
            ));
        container
            .register_factory(
                Factory::reflection(
                    impl_type,
                    None,
                    Setup::decorator_when(|request| {
                        !request.service_key().is_default()
                    }),
                ),
                engine_token(),
                ServiceKey::Default,
            )
            .unwrap();

        // Default-key resolution does not match the predicate.
        assert_eq!(resolve_engine(&container).describe(), "core");
    }

    // ---------------------------------------------------------------------
    // Collections and composites
    // ---------------------------------------------------------------------

    trait Plugin: Send + Sync {
        fn name(&self) -> String;
    }

    macro_rules! plugin {
        ($ty:ident, $name:expr) => {
            struct $ty;
            impl Plugin for $ty {
                fn name(&self) -> String {
                    $name.into()
                }
            }
        };
    }

    plugin!(PluginA, "a");
    plugin!(PluginB, "b");
    plugin!(PluginC, "c");

    fn plugin_token() -> ServiceType {
        ServiceType::of::<dyn Plugin>()
    }

    fn plugin_impl<P: Plugin + Default + Send + Sync + 'static>() -> ImplType {
        ImplType::of::<P>()
            .implements(plugin_token())
            .with_ctor(Ctor::new(vec![], |_| {
                Ok(Arc::new(Arc::new(P::default()) as Arc<dyn Plugin>))
            }))
    }

    impl Default for PluginA {
        fn default() -> Self {
            PluginA
        }
    }
    impl Default for PluginB {
        fn default() -> Self {
            PluginB
        }
    }
    impl Default for PluginC {
        fn default() -> Self {
            PluginC
        }
    }

    fn plugin_names(items: &[Object]) -> Vec<String> {
        items
            .iter()
            .map(|item| item.clone().downcast::<Arc<dyn Plugin>>().unwrap().name())
            .collect()
    }

    #[test]
    fn slice_resolves_items_in_registration_order() {
        let container = Container::new();
        container.register_impl(plugin_token(), plugin_impl::<PluginA>(), None).unwrap();
        container.register_impl(plugin_token(), plugin_impl::<PluginB>(), None).unwrap();
        container.register_impl(plugin_token(), plugin_impl::<PluginC>(), None).unwrap();

        let items = container
            .resolve(&slice_of(plugin_token()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Vec<Object>>()
            .unwrap();
        assert_eq!(plugin_names(&items), vec!["a", "b", "c"]);
    }

    #[test]
    fn slice_snapshots_registrations_at_first_resolution() {
        let container = Container::new();
        container.register_impl(plugin_token(), plugin_impl::<PluginA>(), None).unwrap();
        container.register_impl(plugin_token(), plugin_impl::<PluginB>(), None).unwrap();

        let before = container
            .resolve(&slice_of(plugin_token()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Vec<Object>>()
            .unwrap();
        assert_eq!(before.len(), 2);

        container.register_impl(plugin_token(), plugin_impl::<PluginC>(), None).unwrap();
        let after = container
            .resolve(&slice_of(plugin_token()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Vec<Object>>()
            .unwrap();
        assert_eq!(after.len(), 2, "slice keeps its compiled snapshot");
    }

    #[test]
    fn many_reflects_later_registrations() {
        let container = Container::new();
        container.register_impl(plugin_token(), plugin_impl::<PluginA>(), None).unwrap();

        let many = container
            .resolve(&many_of(plugin_token()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<ManyServices>()
            .unwrap();
        assert_eq!(many.resolve_each().unwrap().len(), 1);

        container.register_impl(plugin_token(), plugin_impl::<PluginB>(), None).unwrap();
        assert_eq!(many.resolve_each().unwrap().len(), 2);
    }

    #[test]
    fn empty_collection_is_an_error() {
        let container = Container::new();
        let err = container
            .resolve(&slice_of(plugin_token()), IfUnresolved::Throw)
            .unwrap_err();
        assert!(matches!(err, DiError::UnableToFindRegisteredEnumerableItems { .. }));
    }

    #[test]
    fn composite_excludes_itself_from_its_collection() {
        struct CompositePlugin {
            inner: Vec<Arc<dyn Plugin>>,
        }
        impl Plugin for CompositePlugin {
            fn name(&self) -> String {
                let names: Vec<String> = self.inner.iter().map(|p| p.name()).collect();
                format!("composite[{}]", names.join(","))
            }
        }

        let container = Container::new();
        container.register_impl(plugin_token(), plugin_impl::<PluginA>(), None).unwrap();
        container.register_impl(plugin_token(), plugin_impl::<PluginB>(), None).unwrap();
        container.register_impl(plugin_token(), plugin_impl::<PluginC>(), None).unwrap();

        let composite_impl = ImplType::of::<CompositePlugin>()
            .implements(plugin_token())
            .with_ctor(Ctor::new(
                vec![ParamInfo::new("plugins", slice_of(plugin_token()))],
                |args| {
                    let items = ctor_arg::<Vec<Object>>(&args, 0)?;
                    let inner = items
                        .iter()
                        .map(|item| {
                            item.clone()
                                .downcast::<Arc<dyn Plugin>>()
                                .map(|p| (*p).clone())
                                .map_err(|_| DiError::Internal("plugin downcast".into()))
                        })
                        .collect::<DiResult<Vec<_>>>()?;
                    Ok(Arc::new(Arc::new(CompositePlugin { inner }) as Arc<dyn Plugin>))
                },
            ));
        container.register_impl(plugin_token(), composite_impl, None).unwrap();

        let composite = container
            .resolve_keyed(&plugin_token(), ServiceKey::Index(3), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Arc<dyn Plugin>>()
            .unwrap();
        assert_eq!(composite.name(), "composite[a,b,c]");
    }

    // ---------------------------------------------------------------------
    // Scopes and disposal
    // ---------------------------------------------------------------------

    #[derive(Debug)]
    struct Connection {
        disposals: Arc<AtomicU32>,
    }

    #[test]
    fn scoped_disposable_is_disposed_exactly_once() {
        let disposals = Arc::new(AtomicU32::new(0));
        let captured = disposals.clone();

        let container = Container::new();
        Registration::<Connection>::of()
            .with_new(move || Connection { disposals: captured.clone() })
            .with_disposer(|connection| {
                connection.disposals.fetch_add(1, Ordering::SeqCst);
            })
            .in_current_scope()
            .register(&container)
            .unwrap();

        let scope = container.open_scope();
        let connection = scope.get::<Connection>().unwrap();
        assert_eq!(connection.disposals.load(Ordering::SeqCst), 0);

        scope.dispose();
        scope.dispose();
        assert_eq!(disposals.load(Ordering::SeqCst), 1);

        let err = scope.get::<Connection>().unwrap_err();
        assert!(matches!(err, DiError::ScopeIsDisposed { .. }));
    }

    #[test]
    fn current_scope_instances_differ_between_parent_and_child() {
        struct PerScope {
            id: u32,
        }

        let container = Container::new();
        container
            .register_impl(
                ServiceType::of::<PerScope>(),
                ImplType::of::<PerScope>()
                    .with_ctor(Ctor::new(vec![], |_| Ok(Arc::new(PerScope { id: next_instance_id() })))),
                Some(Reuse::InCurrentScope),
            )
            .unwrap();

        let parent_a = container.get::<PerScope>().unwrap();
        let parent_b = container.get::<PerScope>().unwrap();
        assert!(Arc::ptr_eq(&parent_a, &parent_b));

        let child = container.open_scope();
        let child_a = child.get::<PerScope>().unwrap();
        let child_b = child.get::<PerScope>().unwrap();
        assert!(Arc::ptr_eq(&child_a, &child_b));
        assert_ne!(parent_a.id, child_a.id);
    }

    #[test]
    fn resolution_scope_is_shared_within_one_call_only() {
        struct Leaf {
            id: u32,
        }
        struct Pair {
            first: Arc<Leaf>,
            second: Arc<Leaf>,
        }

        let container = Container::new();
        Registration::<Leaf>::of()
            .with_new(|| Leaf { id: next_instance_id() })
            .in_resolution_scope()
            .register(&container)
            .unwrap();
        Registration::<Pair>::of()
            .with_new2::<Leaf, Leaf>(("first", "second"), |first, second| Pair { first, second })
            .register(&container)
            .unwrap();

        let one = container.get::<Pair>().unwrap();
        assert!(Arc::ptr_eq(&one.first, &one.second));

        let two = container.get::<Pair>().unwrap();
        assert_ne!(one.first.id, two.first.id);
    }

    // ---------------------------------------------------------------------
    // Lazy, Meta, DebugExpr
    // ---------------------------------------------------------------------

    #[test]
    fn lazy_defers_construction_and_memoizes() {
        static CREATED: AtomicU32 = AtomicU32::new(0);
        struct Expensive;

        let container = Container::new();
        container
            .register_impl(
                ServiceType::of::<Expensive>(),
                ImplType::of::<Expensive>().with_ctor(Ctor::new(vec![], |_| {
                    CREATED.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(Expensive))
                })),
                None,
            )
            .unwrap();

        let lazy = container
            .resolve(&lazy_of(ServiceType::of::<Expensive>()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<LazyService>()
            .unwrap();

        assert!(!lazy.is_created());
        assert_eq!(CREATED.load(Ordering::SeqCst), 0);

        let a = lazy.get_as::<Expensive>().unwrap();
        let b = lazy.get_as::<Expensive>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, PartialEq)]
    struct PluginInfo {
        rank: u32,
    }

    #[test]
    fn meta_pairs_service_with_registration_metadata() {
        let container = Container::new();
        Registration::<Single>::of()
            .with_new(|| Single { id: next_instance_id() })
            .with_metadata(Arc::new(PluginInfo { rank: 4 }))
            .register(&container)
            .unwrap();

        let meta = container
            .resolve(
                &meta_of(ServiceType::of::<Single>(), ServiceType::of::<PluginInfo>()),
                IfUnresolved::Throw,
            )
            .unwrap()
            .unwrap()
            .downcast::<MetaService>()
            .unwrap();
        assert_eq!(meta.metadata_as::<PluginInfo>().unwrap().rank, 4);
        assert!(meta.service_as::<Single>().is_ok());
    }

    #[test]
    fn meta_miss_is_not_itself_an_error() {
        struct OtherInfo;

        let container = Container::new();
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();

        // No registration carries OtherInfo metadata: the wrapper is
        // inapplicable and resolution falls through to unresolved.
        let err = container
            .resolve(
                &meta_of(ServiceType::of::<Single>(), ServiceType::of::<OtherInfo>()),
                IfUnresolved::Throw,
            )
            .unwrap_err();
        assert!(matches!(err, DiError::UnableToResolve { .. }));
    }

    #[test]
    fn debug_expr_exposes_the_construction_ir() {
        let container = Container::new();
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();

        let debug = container
            .resolve(&debug_expr_of(ServiceType::of::<Single>()), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<DebugExpr>()
            .unwrap();
        let shown = format!("{:?}", debug.expression());
        assert!(shown.contains("New"), "unexpected IR: {shown}");
    }

    #[test]
    fn wrapper_chains_unwrap_to_the_service_type() {
        let container = Container::new();
        let wrapped = func_of(vec![], lazy_of(ServiceType::of::<Single>()));
        let unwrapped = container.wrapped_service_type_or_self(&wrapped).unwrap();
        assert_eq!(unwrapped, ServiceType::of::<Single>());
    }

    // ---------------------------------------------------------------------
    // Member injection
    // ---------------------------------------------------------------------

    struct WithSlot {
        slot: Mutex<Option<Arc<Single>>>,
    }

    fn register_with_slot(container: &Container) {
        Registration::<WithSlot>::of()
            .with_new(|| WithSlot { slot: Mutex::new(None) })
            .with_member_of::<Single>("slot", |target, value| {
                *target.slot.lock().unwrap() = Some(value);
            })
            .register(container)
            .unwrap();
    }

    #[test]
    fn members_are_injected_when_a_rule_yields_a_key() {
        let container = Container::new();
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();
        register_with_slot(&container);

        container.update_rules(|rules| {
            rules.add_member(Arc::new(|_, _| Some(ServiceKey::Default)));
        });

        let resolved = container.get::<WithSlot>().unwrap();
        assert!(resolved.slot.lock().unwrap().is_some());
    }

    #[test]
    fn resolve_members_injects_into_external_instances() {
        let container = Container::new();
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();
        register_with_slot(&container);

        let instance: Object = Arc::new(WithSlot { slot: Mutex::new(None) });
        container.resolve_members(&instance, None).unwrap();
        let injected = instance.downcast_ref::<WithSlot>().unwrap();
        assert!(injected.slot.lock().unwrap().is_some());
    }

    // ---------------------------------------------------------------------
    // Registration surface
    // ---------------------------------------------------------------------

    #[test]
    fn register_all_shares_one_factory_across_services() {
        let container = Container::new();
        Registration::<Greeter>::of()
            .implements(ServiceType::of::<dyn Greet>())
            .with_new(|| Greeter)
            .singleton()
            .register_all(&container)
            .unwrap();

        assert!(container.is_registered(&ServiceType::of::<Greeter>(), None));
        assert!(container.is_registered(&ServiceType::of::<dyn Greet>(), None));

        // One factory id, one singleton slot: both services observe the
        // same instance.
        let direct = container.get::<Greeter>().unwrap();
        let via_trait = container
            .resolve(&ServiceType::of::<dyn Greet>(), IfUnresolved::Throw)
            .unwrap()
            .unwrap()
            .downcast::<Greeter>()
            .unwrap();
        assert!(Arc::ptr_eq(&direct, &via_trait));
    }

    #[test]
    fn named_registrations_resolve_by_name() {
        let container = Container::new();
        container
            .register_impl_named(ServiceType::of::<Single>(), single_impl(), None, "primary")
            .unwrap();
        container
            .register_impl_named(ServiceType::of::<Single>(), single_impl(), None, "backup")
            .unwrap();

        let primary = container.get_named::<Single>("primary").unwrap();
        let also_primary = container.get_named::<Single>("primary").unwrap();
        let backup = container.get_named::<Single>("backup").unwrap();
        assert_ne!(primary.id, backup.id);
        // Transient: the name picks the factory, not an instance.
        assert_ne!(primary.id, also_primary.id);
    }

    #[test]
    fn registration_builder_wires_typed_constructors() {
        struct Base {
            id: u32,
        }
        struct BaseRepo {
            base: Arc<Base>,
        }

        let container = Container::new();
        Registration::<Base>::of()
            .with_new(|| Base { id: next_instance_id() })
            .singleton()
            .register(&container)
            .unwrap();
        Registration::<BaseRepo>::of()
            .with_new1::<Base>("base", |base| BaseRepo { base })
            .register(&container)
            .unwrap();
        Registration::<Base>::of()
            .with_new(|| Base { id: next_instance_id() })
            .register_named(&container, "fresh")
            .unwrap();

        let repo = container.get::<BaseRepo>().unwrap();
        let base = container.get::<Base>().unwrap();
        assert!(Arc::ptr_eq(&repo.base, &base));

        let named = container.get_named::<Base>("fresh").unwrap();
        assert_ne!(named.id, base.id);
    }

    #[test]
    fn function_decorators_fold_before_direct_ones() {
        let container = Container::new();
        container.register_impl(engine_token(), core_engine_impl(), None).unwrap();

        // A function decorator registered under Func<T, T>.
        let func_decorator = Factory::delegate(
            |_request, container| {
                let callable = ServiceFn::native(|mut args| {
                    let inner = args
                        .pop()
                        .ok_or_else(|| DiError::Internal("decorator input".into()))?
                        .downcast::<Arc<dyn Engine>>()
                        .map_err(|_| DiError::Internal("engine downcast".into()))?;
                    Ok(Arc::new(
                        Arc::new(LoggingEngine((*inner).clone())) as Arc<dyn Engine>
                    ) as Object)
                });
                container.constant_expression(Arc::new(callable)).map(Some)
            },
            None,
            Setup::decorator(),
        );
        container
            .register_factory(
                func_decorator,
                func_of(vec![engine_token()], engine_token()),
                ServiceKey::Default,
            )
            .unwrap();

        assert_eq!(resolve_engine(&container).describe(), "logging(core)");
    }

    // ---------------------------------------------------------------------
    // Concurrency
    // ---------------------------------------------------------------------

    #[test]
    fn concurrent_singleton_resolution_yields_one_instance() {
        static BUILT: AtomicU32 = AtomicU32::new(0);
        struct Shared;

        let container = Container::new();
        container
            .register_impl(
                ServiceType::of::<Shared>(),
                ImplType::of::<Shared>().with_ctor(Ctor::new(vec![], |_| {
                    BUILT.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(Shared))
                })),
                Some(Reuse::Singleton),
            )
            .unwrap();

        let container = Arc::new(container);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let container = Arc::clone(&container);
            handles.push(std::thread::spawn(move || container.get::<Shared>().unwrap()));
        }
        let resolved: Vec<Arc<Shared>> =
            handles.into_iter().map(|handle| handle.join().unwrap()).collect();
        assert_eq!(BUILT.load(Ordering::SeqCst), 1);
        for instance in &resolved {
            assert!(Arc::ptr_eq(instance, &resolved[0]));
        }
    }

    #[test]
    fn concurrent_registration_and_resolution_coexist() {
        let container = Arc::new(Container::new());
        container.register_impl(plugin_token(), plugin_impl::<PluginA>(), None).unwrap();

        let reader = {
            let container = Arc::clone(&container);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let resolved = container
                        .resolve_keyed(&plugin_token(), ServiceKey::Index(0), IfUnresolved::ReturnNull)
                        .unwrap();
                    assert!(resolved.is_some());
                }
            })
        };
        let writer = {
            let container = Arc::clone(&container);
            std::thread::spawn(move || {
                for i in 0..50 {
                    container
                        .register_impl_named(
                            plugin_token(),
                            plugin_impl::<PluginB>(),
                            None,
                            format!("extra-{i}"),
                        )
                        .unwrap();
                }
            })
        };
        reader.join().unwrap();
        writer.join().unwrap();
        assert_eq!(container.get_keys(&plugin_token(), None).len(), 51);
    }

    // ---------------------------------------------------------------------
    // Minimal setup
    // ---------------------------------------------------------------------

    #[test]
    fn minimal_setup_has_no_wrappers() {
        let container = Container::with_setup(ContainerSetup::Minimal);
        container.register_impl(ServiceType::of::<Single>(), single_impl(), None).unwrap();

        assert!(container.get::<Single>().is_ok());
        let err = container
            .resolve(&func_of(vec![], ServiceType::of::<Single>()), IfUnresolved::Throw)
            .unwrap_err();
        assert!(matches!(err, DiError::UnableToResolve { .. }));
    }
}
