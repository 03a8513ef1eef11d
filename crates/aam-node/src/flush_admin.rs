//! Adapts C4's [`FlushStrategy`] to the [`WriteSideAdministrator`] hook
//! the splitter/merger (C7/C8) use to force a write buffer out before their
//! final drain pass.

use std::sync::Arc;

use async_trait::async_trait;

use aam_flush::FlushStrategy;
use aam_redistribution::WriteSideAdministrator;

/// Forces an out-of-band flush on the wrapped strategy.
pub struct FlushStrategyAdministrator {
    strategy: Arc<FlushStrategy>,
}

impl FlushStrategyAdministrator {
    /// Wraps a running flush strategy.
    pub fn new(strategy: Arc<FlushStrategy>) -> Self {
        Self { strategy }
    }
}

#[async_trait]
impl WriteSideAdministrator for FlushStrategyAdministrator {
    async fn flush_now(&self) {
        self.strategy.flush_now().await;
    }
}
