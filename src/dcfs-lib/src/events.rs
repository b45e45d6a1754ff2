use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{DcfsResult, Reference, ResourceId, UserId};

/// Outcome of the out-of-band post-processing of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostprocessingOutcome {
    /// Promote the upload into the tree.
    Continue,
    /// Keep the upload data for a retry, do not promote.
    Abort,
    /// Drop blob and placeholder node.
    Delete,
    /// Anything a newer pipeline emits that this core does not know;
    /// handled like Abort.
    #[serde(other)]
    Unknown,
}

/// Lifecycle events published by the storage core and consumed by the
/// post-processing workers. Transport is behind [`EventStream`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ItemCreated {
        resource_id: ResourceId,
        executing_user: UserId,
        timestamp: u64,
    },
    ItemTrashed {
        resource_id: ResourceId,
        recycle_key: String,
        executing_user: UserId,
        timestamp: u64,
    },
    ItemMoved {
        resource_id: ResourceId,
        executing_user: UserId,
        timestamp: u64,
    },
    ItemPurged {
        resource_id: ResourceId,
        executing_user: UserId,
        timestamp: u64,
    },
    FileLocked {
        resource_id: ResourceId,
        lock_id: String,
        executing_user: UserId,
        timestamp: u64,
    },
    FileUnlocked {
        resource_id: ResourceId,
        executing_user: UserId,
        timestamp: u64,
    },
    SpaceCreated {
        space_id: String,
        space_type: String,
        owner: UserId,
        timestamp: u64,
    },
    SpaceUpdated {
        space_id: String,
        executing_user: UserId,
        timestamp: u64,
    },
    SpaceDisabled {
        space_id: String,
        executing_user: UserId,
        timestamp: u64,
    },
    /// Emitted by the external post-processing pipeline once it has decided
    /// about an upload.
    PostprocessingFinished {
        upload_id: String,
        outcome: PostprocessingOutcome,
        executing_user: UserId,
    },
    /// Terminal notification for an upload, published exactly once per
    /// processed `PostprocessingFinished`.
    UploadReady {
        upload_id: String,
        failed: bool,
        executing_user: UserId,
        file_ref: Reference,
        space_owner: Option<UserId>,
        timestamp: u64,
    },
}

/// Publish/subscribe channel for lifecycle events. The in-process
/// implementation below is enough for a single node; a durable broker sits
/// behind the same trait.
#[async_trait]
pub trait EventStream: Send + Sync {
    async fn publish(&self, event: Event) -> DcfsResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// Broadcast-backed in-process event stream.
pub struct InProcEventStream {
    tx: broadcast::Sender<Event>,
}

impl InProcEventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for InProcEventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventStream for InProcEventStream {
    async fn publish(&self, event: Event) -> DcfsResult<()> {
        // a send error only means nobody is subscribed right now
        if self.tx.send(event).is_err() {
            debug!("event published without subscribers");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let stream = InProcEventStream::default();
        let mut rx = stream.subscribe();
        stream
            .publish(Event::SpaceCreated {
                space_id: "s1".to_string(),
                space_type: "personal".to_string(),
                owner: UserId::new("idp", "u1"),
                timestamp: 1,
            })
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Event::SpaceCreated { space_id, .. } => assert_eq!(space_id, "s1"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let stream = InProcEventStream::default();
        let ok = stream
            .publish(Event::FileUnlocked {
                resource_id: ResourceId::new("s", "n"),
                executing_user: UserId::default(),
                timestamp: 0,
            })
            .await;
        assert!(ok.is_ok());
    }
}
