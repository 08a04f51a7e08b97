pub mod bundle;
pub mod config;
pub mod context;
pub mod error;
pub mod files;
pub mod juju;
pub mod keystone;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod poll;
pub mod probe;
pub mod release;
pub mod report;
pub mod runner;
pub mod status;
pub mod target;
