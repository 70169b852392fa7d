//! Core utilities shared by the executor, the detector, and the mitigation pipeline.

pub mod analysis;
pub mod executor;
pub mod reqwest_client;
pub mod timing;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{host_key, mask_proxy, parse_retry_after};
pub use executor::{
    DEFAULT_USER_AGENT, ExecutionError, HttpTransport, RequestExecutor, RequestProfile,
    TransportError, until_cancelled,
};
pub use reqwest_client::ReqwestTransport;
pub use timing::RetryPolicy;
pub use types::{
    ResponseView, TransportRequest, TransportResponse, flatten_headers, is_success_status,
};
