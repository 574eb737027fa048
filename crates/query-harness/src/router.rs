//! Reply Router: decodes incoming broker messages and dispatches them to
//! the Orchestrator's pending-search map by `search_id`. Holds no state of
//! its own beyond the shared pending-entry map.

use std::sync::Arc;

use anyhow::Result;
use query_harness_core::models::SearchReply;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::pending::PendingMap;

pub struct ReplyRouter {
    broker: Arc<dyn Broker>,
    pending: Arc<PendingMap>,
    prefetch: u16,
}

impl ReplyRouter {
    pub fn new(broker: Arc<dyn Broker>, pending: Arc<PendingMap>, prefetch: u16) -> Self {
        Self {
            broker,
            pending,
            prefetch,
        }
    }

    /// Consume `queue` until the shutdown signal fires, decoding each
    /// message and delivering it to the matching pending entry.
    pub async fn run(&self, queue: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut consumer = self.broker.consume(queue, self.prefetch).await?;
        loop {
            tokio::select! {
                delivery = consumer.recv() => {
                    let delivery = match delivery {
                        Some(d) => d,
                        None => break,
                    };

                    match serde_json::from_slice::<SearchReply>(&delivery.payload) {
                        Ok(reply) => {
                            let search_id = reply.search_id();
                            if self.pending.deliver(search_id, reply) {
                                debug!(%search_id, "reply delivered to pending entry");
                            } else {
                                debug!(%search_id, "unknown or late reply, discarding");
                            }
                            let _ = delivery.ack().await;
                        }
                        Err(e) => {
                            warn!(error = %e, "malformed search reply, nack-drop");
                            let _ = delivery.nack(false).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(queue, "shutdown signal received, stopping reply router");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
