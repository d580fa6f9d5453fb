#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use opensandbox_ingress_core as core;
pub use opensandbox_ingress_k8s_index as index;

mod args;
mod proxy;
mod server;
mod tunnel;

pub use self::{
    args::Args,
    proxy::{is_websocket_upgrade, Body, Dispatcher, UpstreamError},
    server::serve,
};
