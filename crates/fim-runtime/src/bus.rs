//! In-process request/reply bus.
//!
//! Every request runs its handler on a fresh tokio task, so a handler that hangs or panics
//! costs the caller at most its timeout.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fim_kernel::bus::{BusError, BusResult, MessageEnvelope, RequestHandler, RequestReplyBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
pub struct InProcessBus {
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_served(&self, subject: &str) -> bool {
        self.handlers.contains_key(subject)
    }

    pub fn subjects(&self) -> Vec<String> {
        let mut subjects: Vec<_> = self.handlers.iter().map(|e| e.key().clone()).collect();
        subjects.sort();
        subjects
    }
}

#[async_trait]
impl RequestReplyBus for InProcessBus {
    async fn request(
        &self,
        subject: &str,
        request: MessageEnvelope,
        timeout: Duration,
    ) -> BusResult<MessageEnvelope> {
        let handler = self
            .handlers
            .get(subject)
            .map(|h| h.value().clone())
            .ok_or_else(|| BusError::NoResponders(subject.to_string()))?;

        let request = match request.subject {
            Some(_) => request,
            None => request.with_subject(subject),
        };
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let reply = handler.handle(request).await;
            let _ = tx.send(reply);
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::ReplyDropped(subject.to_string())),
            Err(_) => {
                debug!(subject, ?timeout, "request timed out");
                Err(BusError::Timeout {
                    subject: subject.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn serve(&self, subject: &str, handler: Arc<dyn RequestHandler>) -> BusResult<()> {
        match self.handlers.entry(subject.to_string()) {
            Entry::Occupied(_) => Err(BusError::AlreadyServed(subject.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    async fn unserve(&self, subject: &str) -> BusResult<()> {
        self.handlers.remove(subject);
        Ok(())
    }
}
