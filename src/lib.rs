pub mod buffer;
pub mod changestream;
pub mod commands;
pub mod conduit;
pub mod config;
pub mod diagnostic;
pub mod error;
pub mod exchange;
pub mod gateway;
pub mod interceptor;
pub mod metrics;
pub mod pipeline;
pub mod plugin;
pub mod proxy;
pub mod routing;
pub mod script;
pub mod service;
pub mod web;

#[cfg(test)]
pub(crate) mod test_utils;
