// ABOUTME: Change relay pipeline: extract, encode, send on one side; receive, decode, merge on the other
// ABOUTME: Watermarks per table record the highest version handed to the transport

pub mod batch;
pub mod codec;
pub mod consumer;
pub mod daemon;
pub mod reader;
pub mod state;
pub mod writer;

pub use batch::{Batch, Envelope, MessageMetadata, RowValues};
pub use codec::CodecError;
pub use consumer::{ConsumerConfig, DeliveryLoop, DeliveryOutcome, DeliverySnapshot, DeliveryStats};
pub use daemon::{DaemonConfig, SyncDaemon, SyncStats};
pub use reader::{ChangeReader, Extraction};
pub use state::{JsonFileWatermarks, MemoryWatermarks, WatermarkError, WatermarkPersistence, WatermarkStore, Watermarks};
pub use writer::{BindError, ChangeWriter, MergePlan, MergeReport, UpsertStatement};
