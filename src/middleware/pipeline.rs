use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::middleware::{
    IncomingHandler, IncomingMessage, MessageContext, Middleware, OutgoingHandler,
    OutgoingMessage,
};
use crate::utils::{BusError, Result};

/// Ordered incoming and outgoing handler lists.
#[derive(Default)]
pub struct Pipeline {
    incoming: RwLock<Vec<Arc<dyn IncomingHandler>>>,
    outgoing: RwLock<Vec<Arc<dyn OutgoingHandler>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the unit's handlers to their lists.
    pub fn register(&self, middleware: Middleware) -> Result<()> {
        if let Some(incoming) = middleware.incoming {
            self.incoming
                .write()
                .map_err(|_| BusError::LockPoisoned("incoming middleware"))?
                .push(incoming);
        }
        if let Some(outgoing) = middleware.outgoing {
            self.outgoing
                .write()
                .map_err(|_| BusError::LockPoisoned("outgoing middleware"))?
                .push(outgoing);
        }
        Ok(())
    }

    pub fn counts(&self) -> (usize, usize) {
        let incoming = self.incoming.read().map(|h| h.len()).unwrap_or(0);
        let outgoing = self.outgoing.read().map(|h| h.len()).unwrap_or(0);
        (incoming, outgoing)
    }

    /// Runs outgoing handlers first-registered first. The first error
    /// stops the chain.
    pub async fn handle_outgoing(
        &self,
        ctx: &mut MessageContext,
        mut outgoing: OutgoingMessage,
    ) -> Result<OutgoingMessage> {
        let handlers = self
            .outgoing
            .read()
            .map_err(|_| BusError::LockPoisoned("outgoing middleware"))?
            .clone();
        for handler in handlers {
            outgoing = handler.handle_outgoing(ctx, outgoing).await?;
        }
        debug!(target_queue = %outgoing.target, "Outgoing pipeline complete");
        Ok(outgoing)
    }

    /// Runs incoming handlers last-registered first. The first error
    /// stops the chain.
    pub async fn handle_incoming(
        &self,
        ctx: &mut MessageContext,
        mut incoming: IncomingMessage,
    ) -> Result<IncomingMessage> {
        let handlers = self
            .incoming
            .read()
            .map_err(|_| BusError::LockPoisoned("incoming middleware"))?
            .clone();
        for handler in handlers.iter().rev() {
            incoming = handler.handle_incoming(ctx, incoming).await?;
        }
        Ok(incoming)
    }
}
