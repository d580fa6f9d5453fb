#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use opensandbox_egress_core as core;

mod args;
pub mod control;
pub mod dns;

pub use self::{
    args::Args,
    control::{AuthError, ControlPlane},
    dns::{DnsProxy, Transport, UpstreamError},
};
