//! Data model shared by the admission gate, the reconciler and the API.

pub mod admission;
pub mod config;
pub mod namespace;
pub mod pod;
pub mod quota;
pub mod resource;
pub mod service;
pub mod validate;
pub mod volume;
