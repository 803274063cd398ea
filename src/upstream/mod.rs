//! Upstream proxy gateway credentials
//!
//! Every entry point reaches the internet through the same HTTP proxy
//! gateway; what differs per entry point is the credential string, which
//! encodes the exit country and sticky-session parameters.

mod countries;
mod spec;

pub use countries::{is_supported_country, SUPPORTED_COUNTRIES};
pub use spec::{DurationUnit, SessionDuration, UpstreamParams, UpstreamProxySpec, SESSION_LEN};
