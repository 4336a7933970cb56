pub mod bootstrap;
pub mod cloud;
pub mod config;
pub mod error;
pub mod k8s;
pub mod loadbalancer;
pub mod metrics;
pub mod upstream;
