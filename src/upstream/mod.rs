pub mod definition;
pub mod set;

pub use definition::{
    sorted_endpoint_ips, Change, Server, ServerMeta, UpstreamDefinition, MAX_RETRIES, RETRY_DELAY,
};
pub use set::Set;
