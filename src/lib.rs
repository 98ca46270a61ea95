pub mod logger;
pub mod settings;

pub mod runtime;
pub mod sync;

pub mod domain_model;
pub mod domain_port;
pub mod infra_http;
pub mod infra_memory;
pub mod infra_ws;
