// Routing engine for the stampede broker.
//
// Everything here is owned and mutated by exactly one task: the dispatcher.
// Connections talk to it through typed `Request` messages and receive frames
// back on their per-connection `Delivery` channel; there is no other shared
// state across that boundary.
use stampede_storage::StorageError;

pub mod dispatcher;
pub mod manager;
pub mod queue;
pub mod request;
pub mod status;
pub mod sublist;
pub mod subscription;
pub mod topic;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use manager::{QueueManager, TopicManager};
pub use queue::Queue;
pub use request::Request;
pub use status::{
    ClientStatus, QueueStatus, ServerStatus, StatusSource, SubscriptionStatus, TopicStatus,
};
pub use sublist::SubscriptionList;
pub use subscription::{AckMode, ConnectionHandle, ConnectionInfo, Delivery, SubscriptionRef};
pub use topic::Topic;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("storage failure for {destination}: {source}")]
    Storage {
        destination: String,
        #[source]
        source: StorageError,
    },
}

impl CoreError {
    pub(crate) fn storage(destination: &str, source: StorageError) -> Self {
        CoreError::Storage {
            destination: destination.to_string(),
            source,
        }
    }
}
