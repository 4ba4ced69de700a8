mod error;
mod gate;
mod names;
mod shm_layout;
mod topic;

pub use error::{ErrorKind, Result, TopicError};
pub use gate::{ReaderGate, SemaphoreSet, SlotState, WriterRotation};
pub use names::{MAX_TOPIC_NAME_LEN, TopicNames};
pub use shm_layout::{COUNT_SIZE, DATA_START, Region, SlotView, TopicHeader, TopicLayout};
pub use topic::{MismatchPolicy, Topic};
