pub mod aggregate;
pub mod config;
pub mod controller;
pub mod dataplane;
pub mod decay;
pub mod engine;
pub mod error;
pub mod http;
pub mod model;
pub mod query;
pub mod registry;
pub mod store;
