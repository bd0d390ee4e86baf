//! Cooperative cancellation shared between the Ctrl-C handler and the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

use crate::error::Interrupted;

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Interrupted`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Interrupted.into());
        }
        Ok(())
    }
}

/// Route Ctrl-C to `flag`. The in-flight external call finishes first.
pub fn install_ctrlc(flag: &CancelFlag) -> Result<()> {
    let flag = flag.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, stopping at the next boundary");
        flag.cancel();
    })
    .context("install Ctrl-C handler")
}
