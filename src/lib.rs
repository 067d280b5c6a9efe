//! Configuration sync, traffic accounting and limit enforcement for a fleet
//! of proxy nodes.
pub mod api;
pub mod cli;
pub mod collector;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod model;
pub mod node_client;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod sync;
