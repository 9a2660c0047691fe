//! Graph-described SSH tunnels: validate a profile, reduce it to a hop chain,
//! connect through every hop and keep its forwards running.

pub mod config;
pub mod connector;
pub mod forward;
pub mod graph;
pub mod health;
pub mod hosts;
pub mod jump;
pub mod keys;
pub mod profiles;
pub mod registry;
pub mod render;
pub mod resolve;
pub mod service;
pub mod ssh_config;
pub mod transport;
pub mod tunnel;
pub mod validate;

#[cfg(test)]
mod testing;
