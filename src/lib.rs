//! Keeps NGINX Plus upstreams in sync with the members of AWS Auto Scaling groups
//! and Azure Virtual Machine Scale Sets.

pub mod catalog;
pub mod cloud;
pub mod config;
pub mod core;
pub mod gateway;
pub mod logging;
pub mod service;
pub mod sync;
pub(crate) mod utils;
