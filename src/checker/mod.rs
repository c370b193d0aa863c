mod http;

pub use http::HttpChecker;

use crate::config::Config;
use crate::error::DaemonError;
use async_trait::async_trait;
use std::sync::Arc;

/// A local health probe. A peer only competes for addresses while its
/// probe reports healthy.
#[async_trait]
pub trait Checker: Send + Sync {
    async fn is_healthy(&self) -> Result<bool, DaemonError>;
}

/// Select the probe backend from `checker-type`.
pub fn new_checker(conf: &Config) -> Result<Arc<dyn Checker>, DaemonError> {
    match conf.checker_type.as_str() {
        "http" => Ok(Arc::new(HttpChecker::new(conf)?)),
        other => Err(DaemonError::Config(format!(
            "unsupported checker-type {:?}",
            other
        ))),
    }
}
