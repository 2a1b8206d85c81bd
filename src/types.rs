//! Service type tokens and service keys.
//!
//! Resolution is keyed on runtime type tokens rather than on Rust generics:
//! a token is either a concrete type (`TypeId`), a named type constructor
//! applied to argument tokens, or an unbound parameter. Open-generic
//! registration and per-request specialization work by structural
//! unification over these tokens.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::hash_trie::{hash_of, TrieKey};

/// Identity of a generic type constructor.
///
/// Definitions are declared with marker types; the marker's `TypeId` is the
/// definition identity and its type name is used for display.
#[derive(Clone, Copy, Debug)]
pub struct GenericDef {
    id: TypeId,
    name: &'static str,
}

impl GenericDef {
    /// Definition token for the marker type `M`.
    #[inline]
    pub fn of<M: ?Sized + 'static>() -> Self {
        Self { id: TypeId::of::<M>(), name: std::any::type_name::<M>() }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// Identity is the marker TypeId; the name is display-only.
impl PartialEq for GenericDef {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GenericDef {}

impl std::hash::Hash for GenericDef {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Substitution produced by unifying an open token against a closed one.
pub type TypeArgBindings = HashMap<&'static str, ServiceType>;

/// A runtime type token.
///
/// A token is *open* if it transitively contains a [`ServiceType::Param`];
/// resolution always takes closed tokens.
#[derive(Clone, Debug)]
pub enum ServiceType {
    /// A concrete Rust type
    Concrete { id: TypeId, name: &'static str },
    /// A type constructor applied to argument tokens
    Generic { def: GenericDef, args: Arc<[ServiceType]> },
    /// An unbound type parameter of an open-generic form
    Param(&'static str),
}

impl ServiceType {
    /// Token for the concrete Rust type `T`.
    ///
    /// `T` may be a trait object (`ServiceType::of::<dyn Logger>()`).
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::Concrete { id: TypeId::of::<T>(), name: std::any::type_name::<T>() }
    }

    /// Token for the constructor `M` applied to `args`.
    #[inline]
    pub fn generic<M: ?Sized + 'static>(args: Vec<ServiceType>) -> Self {
        Self::apply(GenericDef::of::<M>(), args)
    }

    /// Token for `def` applied to `args`.
    #[inline]
    pub fn apply(def: GenericDef, args: Vec<ServiceType>) -> Self {
        Self::Generic { def, args: args.into() }
    }

    /// An unbound type parameter.
    #[inline]
    pub fn param(name: &'static str) -> Self {
        Self::Param(name)
    }

    /// True if this token contains an unbound parameter.
    pub fn is_open(&self) -> bool {
        match self {
            Self::Concrete { .. } => false,
            Self::Param(_) => true,
            Self::Generic { args, .. } => args.iter().any(ServiceType::is_open),
        }
    }

    #[inline]
    pub fn is_generic(&self) -> bool {
        matches!(self, Self::Generic { .. })
    }

    /// True for tokens that cannot be resolved directly: open tokens and
    /// bare definition forms (a constructor applied to no arguments).
    pub fn is_open_or_definition(&self) -> bool {
        match self {
            Self::Generic { args, .. } if args.is_empty() => true,
            other => other.is_open(),
        }
    }

    /// The `TypeId` of a concrete token.
    pub fn concrete_id(&self) -> Option<TypeId> {
        match self {
            Self::Concrete { id, .. } => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn def(&self) -> Option<GenericDef> {
        match self {
            Self::Generic { def, .. } => Some(*def),
            _ => None,
        }
    }

    #[inline]
    pub fn type_args(&self) -> &[ServiceType] {
        match self {
            Self::Generic { args, .. } => args,
            _ => &[],
        }
    }

    /// The bare definition form of a generic token (constructor with no
    /// args). Open-generic registrations are tabled under this form.
    pub fn definition_form(&self) -> ServiceType {
        match self {
            Self::Generic { def, .. } => Self::Generic { def: *def, args: Arc::from([]) },
            other => other.clone(),
        }
    }

    /// Unify this (possibly open) token against a closed one, extending
    /// `bindings` with parameter substitutions. Returns false on mismatch
    /// or on a parameter bound to two different closed tokens.
    pub fn unify(&self, closed: &ServiceType, bindings: &mut TypeArgBindings) -> bool {
        match (self, closed) {
            (Self::Param(name), _) => match bindings.get(*name) {
                Some(bound) => bound == closed,
                None => {
                    bindings.insert(*name, closed.clone());
                    true
                }
            },
            (Self::Concrete { id: a, .. }, Self::Concrete { id: b, .. }) => a == b,
            (Self::Generic { def: da, args: aa }, Self::Generic { def: db, args: ab }) => {
                da == db
                    && aa.len() == ab.len()
                    && aa.iter().zip(ab.iter()).all(|(a, b)| a.unify(b, bindings))
            }
            _ => false,
        }
    }

    /// Replace bound parameters with their substitutions; unbound
    /// parameters are kept (the result stays open).
    pub fn substitute(&self, bindings: &TypeArgBindings) -> ServiceType {
        match self {
            Self::Param(name) => bindings.get(*name).cloned().unwrap_or_else(|| self.clone()),
            Self::Generic { def, args } => Self::Generic {
                def: *def,
                args: args.iter().map(|a| a.substitute(bindings)).collect(),
            },
            other => other.clone(),
        }
    }

    /// Collect the names of all unbound parameters, outermost first.
    pub fn collect_params(&self, out: &mut Vec<&'static str>) {
        match self {
            Self::Param(name) => {
                if !out.contains(name) {
                    out.push(*name);
                }
            }
            Self::Generic { args, .. } => {
                for arg in args.iter() {
                    arg.collect_params(out);
                }
            }
            Self::Concrete { .. } => {}
        }
    }
}

// Concrete tokens compare and hash by TypeId only; the name is display-only.
impl PartialEq for ServiceType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Concrete { id: a, .. }, Self::Concrete { id: b, .. }) => a == b,
            (Self::Generic { def: da, args: aa }, Self::Generic { def: db, args: ab }) => {
                da == db && aa == ab
            }
            (Self::Param(a), Self::Param(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ServiceType {}

impl std::hash::Hash for ServiceType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::Concrete { id, .. } => {
                0u8.hash(state);
                id.hash(state);
            }
            Self::Generic { def, args } => {
                1u8.hash(state);
                def.hash(state);
                args.len().hash(state);
                for arg in args.iter() {
                    arg.hash(state);
                }
            }
            Self::Param(name) => {
                2u8.hash(state);
                name.hash(state);
            }
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete { name, .. } => f.write_str(name),
            Self::Param(name) => f.write_str(name),
            Self::Generic { def, args } => {
                f.write_str(def.name())?;
                if !args.is_empty() {
                    f.write_str("<")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    f.write_str(">")?;
                }
                Ok(())
            }
        }
    }
}

impl TrieKey for ServiceType {
    #[inline]
    fn trie_hash(&self) -> u64 {
        hash_of(self)
    }
}

/// Disambiguator within one service type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    /// Unkeyed registration (or the single default)
    Default,
    /// One of several default registrations, by insertion index
    Index(usize),
    /// Named registration; names are unique per service type
    Name(Arc<str>),
}

impl ServiceKey {
    #[inline]
    pub fn name(name: impl Into<Arc<str>>) -> Self {
        Self::Name(name.into())
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Index(i) => write!(f, "#{i}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

impl TrieKey for (ServiceType, ServiceKey) {
    #[inline]
    fn trie_hash(&self) -> u64 {
        hash_of(self)
    }
}
