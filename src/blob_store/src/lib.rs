mod local_store;

pub use local_store::LocalBlobStore;

use async_trait::async_trait;
use dcfs_lib::DcfsResult;
use tokio::io::AsyncRead;

/// Readable blob payload.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Content side of the decomposed backend: opaque byte payloads keyed by
/// blob id. Metadata never lives here.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores the reader's bytes under `blob_id`, returns the byte count.
    /// Overwrites an existing blob of the same id.
    async fn put(&self, blob_id: &str, reader: &mut (dyn AsyncRead + Send + Unpin))
        -> DcfsResult<u64>;

    async fn get(&self, blob_id: &str) -> DcfsResult<BlobReader>;

    /// Removes the blob. Deleting a missing blob is not an error.
    async fn delete(&self, blob_id: &str) -> DcfsResult<()>;

    async fn size(&self, blob_id: &str) -> DcfsResult<u64>;
}
