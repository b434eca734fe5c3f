pub mod config;
pub mod document;
pub mod extract;
pub mod matcher;
pub mod reconcile;
pub mod resolve;
pub mod roster;
pub mod runtime;
pub mod source;
pub mod store;
