//! OpenSandbox egress policy
//!
//! A policy is an ordered list of domain rules plus a default action. Sandboxes resolve names
//! through the egress DNS proxy, which evaluates every queried name against the policy that is
//! current at the time of the query. Policies are replaced wholesale by the control plane and
//! are never modified in place.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod policy;
mod store;

pub use self::{
    policy::{normalize, Action, ParseError, Policy, Rule, Target},
    store::PolicyStore,
};
