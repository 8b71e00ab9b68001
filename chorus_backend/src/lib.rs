pub mod config;
pub mod database;
pub mod dispatch;
pub mod fleet;
pub mod http_client;
pub mod llm_client;
pub mod messaging;
pub mod persona;
pub mod runtime;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod testkit;
