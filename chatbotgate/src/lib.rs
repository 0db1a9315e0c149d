#![doc = include_str!("../README.md")]
//!

#![deny(rustdoc::broken_intra_doc_links)]

mod authz;
mod config;
mod constants;
mod email;
mod forward;
mod gate;
mod i18n;
mod kv;
mod oauth;
mod pages;
mod proxy;
mod ratelimit;
mod rules;
mod server;
mod session;
mod supervisor;
mod watcher;

pub use config::{Config, ConfigError};
pub use gate::AuthGate;
pub use proxy::ProxySupervisor;
pub use server::Server;
pub use supervisor::GateSupervisor;
