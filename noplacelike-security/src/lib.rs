pub mod crypto;
pub mod error;
pub mod token;

pub use crypto::ChannelCrypto;
pub use error::SecurityError;
pub use token::{SecurityManager, TokenInfo};

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use noplacelike_core::service::BoxFuture;
use noplacelike_core::{HealthState, PlatformError, Service};

impl Service for SecurityManager {
    fn name(&self) -> &str {
        "security"
    }

    fn start(&self, _shutdown: CancellationToken) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self, _deadline: Duration) -> BoxFuture<'_, Result<(), PlatformError>> {
        Box::pin(async { Ok(()) })
    }

    fn health(&self) -> BoxFuture<'_, HealthState> {
        Box::pin(async { HealthState::Healthy })
    }
}
