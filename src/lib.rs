//! edge-bridge: an always-on daemon bridging a local chat datastore with a
//! remote orchestrator over the network.
//!
//! See `SPEC_FULL.md` for the full module breakdown. Each submodule here
//! corresponds to one of the components named there (C1-C9).

pub mod backend_client;
pub mod command_channel;
pub mod command_handler;
pub mod config;
pub mod ingress;
pub mod reflex;
pub mod sanitize;
pub mod scheduler;
pub mod sendqueue;
pub mod state;
pub mod status_http;
pub mod supervisor;
pub mod sync_fallback;
pub mod transport;
