//! OpenSandbox ingress backend index
//!
//! Sandbox pods are labeled with the ingress key of the session they serve. The index consumes
//! pod watch events for a single namespace and groups pods by that label so that the ingress
//! proxy can find a session's backend on every request:
//!
//! ```text
//! [ Pod ] --(ingress key label)--> [ ingress key ] -> { pod name -> PodRecord }
//! ```
//!
//! The index is not responsible for choosing between pods. A key may legitimately be claimed by
//! several pods while one is terminating and its successor is starting; the `Router` decides at
//! request time whether exactly one of them is eligible.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
pub mod pod;
mod router;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Index, SharedIndex},
    pod::{PodPhase, PodRecord},
    router::Router,
};
