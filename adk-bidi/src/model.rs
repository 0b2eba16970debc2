//! Backend model trait.

use async_trait::async_trait;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::session::BoxedSession;

/// A factory for backend sessions.
///
/// # Example
///
/// ```rust,ignore
/// use adk_bidi::{BidiModel, SessionConfig, LoopbackModel};
///
/// let model = LoopbackModel::default();
/// let session = model.connect(SessionConfig::from_env()).await?;
/// while let Some(event) = session.next_event().await {
///     println!("{:?}", event?);
/// }
/// ```
#[async_trait]
pub trait BidiModel: Send + Sync {
    /// Get the provider name (e.g., "loopback", "websocket").
    fn provider(&self) -> &str;

    /// Get the model identifier.
    fn model_id(&self) -> &str;

    /// Connect and create a new session configured with `config`.
    async fn connect(&self, config: SessionConfig) -> Result<BoxedSession>;
}

/// A shared model type for thread-safe access.
pub type BoxedModel = std::sync::Arc<dyn BidiModel>;
