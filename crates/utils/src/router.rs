//! Rule matching over the configured routes.
//!
//! Every route is evaluated against the `To` headers and the sender of a
//! message. Matching routes are folded into a single [`RouteOutcome`]
//! before anything is sent or published.

use std::fmt::Display;

use regex::Regex;
use tracing::debug;

use crate::{parse_address, VerdictSet};

/// Placeholder resolved to the private address when routes are loaded.
pub const PRIVATE_ADDRESS_PLACEHOLDER: &str = "__PRIVATE_ADDRESS__";

/// How a route field is compared against an address.
#[derive(Debug, Clone)]
pub enum AddressMatcher {
    /// Exact, case-sensitive equality.
    Literal(String),
    /// Unanchored regular expression search.
    Pattern(Regex),
}

impl AddressMatcher {
    /// Parses a configured route field.
    ///
    /// A value wrapped in slashes (`/.*@example\.com/`) is a pattern, the
    /// placeholder becomes `private_address`, anything else is a literal.
    pub fn parse(value: &str, private_address: &str) -> Result<Self, regex::Error> {
        if value == PRIVATE_ADDRESS_PLACEHOLDER {
            return Ok(AddressMatcher::Literal(private_address.to_string()));
        }
        match value
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            Some(pattern) => Ok(AddressMatcher::Pattern(Regex::new(pattern)?)),
            None => Ok(AddressMatcher::Literal(value.to_string())),
        }
    }

    pub fn is_match(&self, address: &str) -> bool {
        match self {
            AddressMatcher::Literal(literal) => literal == address,
            AddressMatcher::Pattern(regex) => regex.is_match(address),
        }
    }
}

impl Display for AddressMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressMatcher::Literal(literal) => write!(f, "{literal}"),
            AddressMatcher::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
        }
    }
}

/// A single configured route.
#[derive(Debug, Clone)]
pub struct Route {
    pub src: AddressMatcher,
    pub dst: AddressMatcher,

    /// Topic notified when the route matches.
    pub notify: Option<String>,

    /// Whether the message still gets its disposition after matching.
    pub forward: bool,

    /// Whether a match silently discards the message.
    pub drop: bool,

    /// Whether a match accepts messages that failed DKIM or SPF.
    pub allow_suspect: bool,
}

impl Route {
    /// Tests the route against the raw `To` header entries and the
    /// address-only sender. Malformed `To` entries are skipped.
    pub fn matches(&self, to_headers: &[String], from_address: &str) -> bool {
        if !self.src.is_match(from_address) {
            return false;
        }
        to_headers
            .iter()
            .filter_map(|to| parse_address(to).ok())
            .any(|to| self.dst.is_match(&to.address))
    }
}

/// Result of evaluating every route against one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// A matched route drops the message.
    Drop,
    /// A matched route refuses a suspect message.
    Reject(String),
    /// Topics to notify, in route order, and whether a matched route
    /// disabled forwarding.
    Matched {
        notify: Vec<String>,
        suppress_forward: bool,
    },
}

/// Evaluates the configured routes, keeping their order.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    routes: Vec<Route>,
}

impl MessageRouter {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Folds every matching route into a [`RouteOutcome`].
    ///
    /// A drop wins over everything, then a suspect message on a route that
    /// does not allow it. Routes that do not match have no effect.
    pub fn evaluate(
        &self,
        to_headers: &[String],
        from_address: &str,
        verdicts: &VerdictSet,
    ) -> RouteOutcome {
        let matched: Vec<&Route> = self
            .routes
            .iter()
            .filter(|route| route.matches(to_headers, from_address))
            .collect();

        debug!(
            from = %from_address,
            routes = self.routes.len(),
            matched = matched.len(),
            "Evaluated routes"
        );

        if matched.iter().any(|route| route.drop) {
            return RouteOutcome::Drop;
        }

        if verdicts.suspect() {
            if let Some(route) = matched.iter().find(|route| !route.allow_suspect) {
                return RouteOutcome::Reject(format!(
                    "suspect message from {from_address} matched route {} -> {}",
                    route.src, route.dst
                ));
            }
        }

        RouteOutcome::Matched {
            notify: matched
                .iter()
                .filter_map(|route| route.notify.clone())
                .collect(),
            suppress_forward: matched.iter().any(|route| !route.forward),
        }
    }
}
