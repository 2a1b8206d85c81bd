//! Pluggable resolution rules.
//!
//! Rules extend the pipeline at three points: producing factories for
//! unregistered services, deriving service keys for constructor parameters,
//! and deriving keys for injected members. A rule returning `None` passes
//! the decision to the next rule.

use std::sync::Arc;

use crate::container::Container;
use crate::error::DiResult;
use crate::factory::{Factory, Member, ParamInfo};
use crate::request::Request;
use crate::types::ServiceKey;

/// Produce a factory for a service nothing was registered for.
pub type UnregisteredServiceRule =
    Arc<dyn Fn(&Request, &Container) -> DiResult<Option<Arc<Factory>>> + Send + Sync>;

/// Derive the service key for a constructor parameter.
pub type CtorParamRule = Arc<dyn Fn(&ParamInfo, &Request) -> Option<ServiceKey> + Send + Sync>;

/// Derive the service key for an injected member; `None` skips the member.
pub type MemberRule = Arc<dyn Fn(&Member, &Request) -> Option<ServiceKey> + Send + Sync>;

/// Disambiguate between multiple default registrations.
pub type DefaultSelectorRule =
    Arc<dyn Fn(&[(usize, Arc<Factory>)]) -> Option<Arc<Factory>> + Send + Sync>;

/// The rule set of a container, shared by all its scopes.
#[derive(Clone, Default)]
pub struct ResolutionRules {
    pub(crate) unregistered_services: Vec<UnregisteredServiceRule>,
    pub(crate) constructor_parameters: Vec<CtorParamRule>,
    pub(crate) members: Vec<MemberRule>,
    pub(crate) single_default_selector: Option<DefaultSelectorRule>,
}

impl ResolutionRules {
    /// Append a fallback factory source for unregistered services.
    pub fn add_unregistered_service(&mut self, rule: UnregisteredServiceRule) -> &mut Self {
        self.unregistered_services.push(rule);
        self
    }

    /// Append a constructor-parameter key rule.
    pub fn add_constructor_parameter(&mut self, rule: CtorParamRule) -> &mut Self {
        self.constructor_parameters.push(rule);
        self
    }

    /// Append a member key rule; members are injected only when some rule
    /// yields a key for them.
    pub fn add_member(&mut self, rule: MemberRule) -> &mut Self {
        self.members.push(rule);
        self
    }

    /// Install the disambiguator used when several default registrations
    /// exist for one service type.
    pub fn select_single_default(&mut self, rule: DefaultSelectorRule) -> &mut Self {
        self.single_default_selector = Some(rule);
        self
    }

    pub(crate) fn key_for_ctor_param(
        &self,
        param: &ParamInfo,
        request: &Request,
    ) -> Option<ServiceKey> {
        self.constructor_parameters.iter().find_map(|rule| rule(param, request))
    }

    pub(crate) fn key_for_member(&self, member: &Member, request: &Request) -> Option<ServiceKey> {
        self.members.iter().find_map(|rule| rule(member, request))
    }
}
