pub mod batch;
pub mod delivery;
pub mod detector;
pub mod error;
pub mod feed;
pub mod policy;
pub mod state;
pub mod types;

pub use batch::Batch;
pub use delivery::{DeliveryState, RetryPolicy};
pub use detector::{transition, ChangeDetector, Detection};
pub use error::{Error, Result};
pub use feed::{parse_observed_at, parse_snapshot, MalformedRecord, ParsedSnapshot};
pub use policy::ChangePolicy;
pub use state::{MemoryStateStore, StateStore};
pub use types::{ChangeEvent, Record, StateEntry};
