//! Reuse (lifetime) policies.

use std::sync::Arc;

use crate::container::Container;
use crate::error::DiResult;
use crate::expr::{compile_factory, Expr, ScopeSource};
use crate::factory::Factory;
use crate::request::Request;

/// Instance-sharing policy wrapped around a factory's expression.
/// A factory without a reuse is transient: its expression runs on every
/// resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reuse {
    /// One instance per singleton scope (shared with scoped children)
    Singleton,
    /// One instance per container's current scope
    InCurrentScope,
    /// One instance per top-level resolution call
    InResolutionScope,
}

impl Reuse {
    /// Wrap `expr` with this policy's scoping.
    ///
    /// Singletons reached outside any function wrapper are captured
    /// eagerly: the reuse-free expression is compiled and invoked against
    /// the singleton scope right now, and the expression collapses to a
    /// constant-table reference. Under a function wrapper the construction
    /// must stay deferred, so the expression becomes a per-factory-id
    /// scoped get instead.
    pub(crate) fn apply(
        self,
        expr: Expr,
        factory: &Factory,
        request: &Request,
        container: &Container,
    ) -> DiResult<Expr> {
        let disposer = factory.disposer();
        match self {
            Reuse::Singleton => {
                if request.has_func_ancestor() {
                    return Ok(Expr::ScopedTo {
                        source: ScopeSource::Singleton,
                        factory_id: factory.id(),
                        body: Arc::new(expr),
                        disposer,
                    });
                }
                let compiled = compile_factory(&expr);
                let view = container.constants_view();
                let instance = container.singleton_scope().get_or_add(
                    factory.id(),
                    || {
                        let mut resolution_scope = None;
                        compiled(&view, &mut resolution_scope)
                    },
                    disposer.as_ref(),
                )?;
                container.constant_expression(instance)
            }
            Reuse::InCurrentScope => Ok(Expr::ScopedTo {
                source: ScopeSource::CurrentScope,
                factory_id: factory.id(),
                body: Arc::new(expr),
                disposer,
            }),
            Reuse::InResolutionScope => Ok(Expr::ScopedTo {
                source: ScopeSource::ResolutionScope,
                factory_id: factory.id(),
                body: Arc::new(expr),
                disposer,
            }),
        }
    }
}
