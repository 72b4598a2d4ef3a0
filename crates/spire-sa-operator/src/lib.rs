//! spire-sa-operator: registers annotated Kubernetes ServiceAccounts with a
//! SPIRE registration API and revokes their entries before deletion

pub mod client;
pub mod config;
pub mod controllers;
pub mod credentials;
pub mod health;
pub mod metadata;
pub mod registration;
pub mod state;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use config::OperatorConfig;
pub use registration::{ClusterContext, EntryId, RegistrationRequest};
