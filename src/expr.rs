//! Abstract construction expressions and their compiler.
//!
//! Every resolved service is lowered to an [`Expr`] tree describing how to
//! build it: constant-table reads, constructor calls, member assignments,
//! lambdas, applications, array construction, and scoped memoization.
//! [`compile_factory`] lowers a tree into a [`CompiledFactory`], a closed
//! callable built by bottom-up closure composition; the tree is walked once
//! at compile time, never per invocation.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{DiError, DiResult};
use crate::factory::{Ctor, FactoryId, Member};
use crate::scope::{DisposerFn, Scope};
use crate::types::ServiceType;
use crate::wrappers::ServiceFn;
use crate::Object;

/// Reserved constant slots.
pub const REGISTRY_CONSTANT: usize = 0;
pub const SINGLETON_SCOPE_CONSTANT: usize = 1;
pub const CURRENT_SCOPE_CONSTANT: usize = 2;

/// Identifier of a lambda parameter.
pub type ParamId = u32;

pub(crate) fn next_param_id() -> ParamId {
    static COUNTER: AtomicU32 = AtomicU32::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A typed lambda parameter.
#[derive(Clone)]
pub struct LambdaParam {
    pub id: ParamId,
    pub ty: ServiceType,
}

impl LambdaParam {
    pub fn new(ty: ServiceType) -> Self {
        Self { id: next_param_id(), ty }
    }
}

/// Which scope a [`Expr::ScopedTo`] node memoizes into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeSource {
    Singleton,
    CurrentScope,
    ResolutionScope,
}

/// Construction IR.
#[derive(Clone)]
pub enum Expr {
    /// Read a slot of the container constants
    Constant { index: usize },
    /// Call a constructor with argument expressions
    New { ctor: Arc<Ctor>, args: Vec<Expr> },
    /// Constructor call followed by member assignments
    MemberInit { new: Box<Expr>, binds: Vec<(Arc<Member>, Expr)> },
    /// Function abstraction; evaluates to a first-class [`ServiceFn`]
    Lambda { params: Arc<[LambdaParam]>, body: Arc<Expr> },
    /// Reference to an enclosing lambda parameter
    ParamRef { id: ParamId },
    /// Apply a function-valued expression to arguments
    Invoke { target: Box<Expr>, args: Vec<Expr> },
    /// Construct an array of item expressions
    NewArray { items: Vec<Expr> },
    /// Type-adjusting pass-through
    Convert { inner: Box<Expr> },
    /// Memoize the body per factory id in the selected scope
    ScopedTo {
        source: ScopeSource,
        factory_id: FactoryId,
        body: Arc<Expr>,
        disposer: Option<DisposerFn>,
    },
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { index } => write!(f, "Const[{index}]"),
            Self::New { ctor, args } => {
                write!(f, "New({}, {:?})", ctor.owner(), args)
            }
            Self::MemberInit { new, binds } => {
                write!(f, "MemberInit({new:?}, {} binds)", binds.len())
            }
            Self::Lambda { params, body } => {
                write!(f, "Lambda(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "p{}", p.id)?;
                }
                write!(f, " -> {body:?})")
            }
            Self::ParamRef { id } => write!(f, "p{id}"),
            Self::Invoke { target, args } => write!(f, "Invoke({target:?}, {args:?})"),
            Self::NewArray { items } => write!(f, "Array{items:?}"),
            Self::Convert { inner } => write!(f, "Convert({inner:?})"),
            Self::ScopedTo { source, factory_id, body, .. } => {
                write!(f, "ScopedTo({source:?}, #{factory_id}, {body:?})")
            }
        }
    }
}

/// Read view of the container constants with the per-container cells
/// overlaid.
///
/// Slot 0 (weak self-reference) and slot 2 (current scope) belong to the
/// resolving container; slot 1 (singleton scope) and everything from slot 3
/// up come from the shared constants vector. A scoped child container thus
/// executes the same compiled expressions against its own current scope.
#[derive(Clone)]
pub struct ConstantsView {
    items: Arc<Vec<Object>>,
    self_ref: Object,
    current_scope: Object,
}

impl ConstantsView {
    pub(crate) fn new(items: Arc<Vec<Object>>, self_ref: Object, current_scope: Object) -> Self {
        Self { items, self_ref, current_scope }
    }

    /// Fetch a constant slot.
    pub fn get(&self, index: usize) -> DiResult<Object> {
        match index {
            REGISTRY_CONSTANT => Ok(self.self_ref.clone()),
            CURRENT_SCOPE_CONSTANT => Ok(self.current_scope.clone()),
            _ => self
                .items
                .get(index)
                .cloned()
                .ok_or_else(|| DiError::Internal(format!("missing constant slot {index}"))),
        }
    }

    /// The weak handle to the resolving container.
    pub(crate) fn registry(&self) -> DiResult<crate::container::WeakContainer> {
        self.self_ref
            .clone()
            .downcast::<crate::container::WeakContainer>()
            .map(|weak| (*weak).clone())
            .map_err(|_| DiError::Internal("registry constant holds a foreign object".into()))
    }

    fn scope_at(&self, index: usize) -> DiResult<Arc<Scope>> {
        self.get(index)?
            .downcast::<Scope>()
            .map_err(|_| DiError::Internal(format!("constant slot {index} is not a scope")))
    }
}

/// Bindings of lambda parameters during evaluation; a persistent list so
/// nested lambdas capture their creation environment by reference.
#[derive(Clone, Default)]
pub struct Env(Option<Arc<EnvNode>>);

struct EnvNode {
    id: ParamId,
    value: Object,
    next: Env,
}

impl Env {
    pub fn bind(&self, id: ParamId, value: Object) -> Env {
        Env(Some(Arc::new(EnvNode { id, value, next: self.clone() })))
    }

    pub fn lookup(&self, id: ParamId) -> Option<Object> {
        let mut current = self.0.as_ref();
        while let Some(node) = current {
            if node.id == id {
                return Some(node.value.clone());
            }
            current = node.next.0.as_ref();
        }
        None
    }
}

/// A compiled construction recipe: `(constants, resolution_scope) -> object`.
pub type CompiledFactory =
    Arc<dyn Fn(&ConstantsView, &mut Option<Arc<Scope>>) -> DiResult<Object> + Send + Sync>;

pub(crate) type CompiledExpr =
    Arc<dyn Fn(&ConstantsView, &mut Option<Arc<Scope>>, &Env) -> DiResult<Object> + Send + Sync>;

/// Compile an expression into a closed callable.
pub fn compile_factory(expr: &Expr) -> CompiledFactory {
    let compiled = compile(expr);
    Arc::new(move |view, resolution_scope| compiled(view, resolution_scope, &Env::default()))
}

pub(crate) fn compile(expr: &Expr) -> CompiledExpr {
    match expr {
        Expr::Constant { index } => {
            let index = *index;
            Arc::new(move |view, _, _| view.get(index))
        }
        Expr::New { ctor, args } => {
            let ctor = ctor.clone();
            let args: Vec<CompiledExpr> = args.iter().map(compile).collect();
            Arc::new(move |view, resolution_scope, env| {
                let mut values = Vec::with_capacity(args.len());
                for arg in &args {
                    values.push(arg(view, resolution_scope, env)?);
                }
                ctor.build(values)
            })
        }
        Expr::MemberInit { new, binds } => {
            let new = compile(new);
            let binds: Vec<(Arc<Member>, CompiledExpr)> =
                binds.iter().map(|(member, expr)| (member.clone(), compile(expr))).collect();
            Arc::new(move |view, resolution_scope, env| {
                let instance = new(view, resolution_scope, env)?;
                for (member, expr) in &binds {
                    let value = expr(view, resolution_scope, env)?;
                    member.assign(&instance, value)?;
                }
                Ok(instance)
            })
        }
        Expr::Lambda { params, body } => {
            let params = params.clone();
            let body = compile(body);
            Arc::new(move |view, _, env| {
                let function =
                    ServiceFn::new(params.clone(), body.clone(), env.clone(), view.registry()?);
                Ok(Arc::new(function) as Object)
            })
        }
        Expr::ParamRef { id } => {
            let id = *id;
            Arc::new(move |_, _, env| {
                env.lookup(id)
                    .ok_or_else(|| DiError::Internal(format!("unbound lambda parameter p{id}")))
            })
        }
        Expr::Invoke { target, args } => {
            let target = compile(target);
            let args: Vec<CompiledExpr> = args.iter().map(compile).collect();
            Arc::new(move |view, resolution_scope, env| {
                let function = target(view, resolution_scope, env)?
                    .downcast::<ServiceFn>()
                    .map_err(|_| DiError::Internal("invoke target is not a function".into()))?;
                let mut values = Vec::with_capacity(args.len());
                for arg in &args {
                    values.push(arg(view, resolution_scope, env)?);
                }
                function.call_in(view, resolution_scope, values)
            })
        }
        Expr::NewArray { items } => {
            let items: Vec<CompiledExpr> = items.iter().map(compile).collect();
            Arc::new(move |view, resolution_scope, env| {
                let mut values = Vec::with_capacity(items.len());
                for item in &items {
                    values.push(item(view, resolution_scope, env)?);
                }
                Ok(Arc::new(values) as Object)
            })
        }
        Expr::Convert { inner } => compile(inner),
        Expr::ScopedTo { source, factory_id, body, disposer } => {
            let source = *source;
            let factory_id = *factory_id;
            let body = compile(body);
            let disposer = disposer.clone();
            Arc::new(move |view, resolution_scope, env| {
                let scope = match source {
                    ScopeSource::Singleton => view.scope_at(SINGLETON_SCOPE_CONSTANT)?,
                    ScopeSource::CurrentScope => view.scope_at(CURRENT_SCOPE_CONSTANT)?,
                    ScopeSource::ResolutionScope => {
                        resolution_scope.get_or_insert_with(|| Arc::new(Scope::new())).clone()
                    }
                };
                scope.get_or_add(
                    factory_id,
                    || body(view, resolution_scope, env),
                    disposer.as_ref(),
                )
            })
        }
    }
}

/// Apply a unary lambda to an argument expression by beta reduction.
///
/// Decorator composition substitutes the decorated expression straight into
/// the decorator body, avoiding a function allocation per resolution.
/// Non-unary or non-lambda targets fall back to an `Invoke` node.
pub(crate) fn apply_lambda(lambda: &Expr, arg: &Expr) -> Expr {
    if let Expr::Lambda { params, body } = lambda {
        if params.len() == 1 {
            return substitute(body, params[0].id, arg);
        }
    }
    Expr::Invoke { target: Box::new(lambda.clone()), args: vec![arg.clone()] }
}

fn substitute(expr: &Expr, id: ParamId, replacement: &Expr) -> Expr {
    match expr {
        Expr::ParamRef { id: found } if *found == id => replacement.clone(),
        Expr::ParamRef { .. } | Expr::Constant { .. } => expr.clone(),
        Expr::New { ctor, args } => Expr::New {
            ctor: ctor.clone(),
            args: args.iter().map(|a| substitute(a, id, replacement)).collect(),
        },
        Expr::MemberInit { new, binds } => Expr::MemberInit {
            new: Box::new(substitute(new, id, replacement)),
            binds: binds
                .iter()
                .map(|(m, e)| (m.clone(), substitute(e, id, replacement)))
                .collect(),
        },
        Expr::Lambda { params, body } => {
            // Parameter ids are globally unique, so shadowing cannot occur.
            Expr::Lambda {
                params: params.clone(),
                body: Arc::new(substitute(body, id, replacement)),
            }
        }
        Expr::Invoke { target, args } => Expr::Invoke {
            target: Box::new(substitute(target, id, replacement)),
            args: args.iter().map(|a| substitute(a, id, replacement)).collect(),
        },
        Expr::NewArray { items } => Expr::NewArray {
            items: items.iter().map(|a| substitute(a, id, replacement)).collect(),
        },
        Expr::Convert { inner } => {
            Expr::Convert { inner: Box::new(substitute(inner, id, replacement)) }
        }
        Expr::ScopedTo { source, factory_id, body, disposer } => Expr::ScopedTo {
            source: *source,
            factory_id: *factory_id,
            body: Arc::new(substitute(body, id, replacement)),
            disposer: disposer.clone(),
        },
    }
}
