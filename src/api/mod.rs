//! Purpose: Define the stable public Rust API boundary for ringfile.
//! Exports: Ring types, codecs, queues and the polling executor used by
//! the CLI and by library consumers.
//! Role: Public, additive-only surface; the supported path into the engine.
//! Invariants: Consumers use these re-exports; `core` paths are unstable.
//! Invariants: The codec, queue and executor modules stay private here.

mod codec;
mod executor;
mod queue;
mod queues;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::file::{FileHeader, FileRing, FileRingOptions, FileStorage, SyncMode};
pub use crate::core::notify::Wait;
pub use crate::core::reader::Reader;
pub use crate::core::ring::{Ring, RingInfo, RingOptions};
pub use crate::core::storage::{MemoryStorage, Storage};
pub use crate::core::writer::Writer;
pub use codec::{BytesCodec, Codec, JsonCodec, StrCodec};
pub use executor::{ExecutorStats, ExecutorStatus, PollingExecutor};
pub use queue::{ElementQueue, QueueCursor};
pub use queues::{PartitionedQueues, PartitionsCursor};
