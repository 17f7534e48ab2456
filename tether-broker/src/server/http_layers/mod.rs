mod rate_limit;
mod requests_logging;

pub use rate_limit::{IpKeyExtractor, CALLBACK_PER_MINUTE, GLOBAL_PER_MINUTE};
pub use requests_logging::{log_requests, RequestsLoggingLevel};
