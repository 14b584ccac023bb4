pub mod ids;
pub mod request;
pub mod record;
pub mod priority;
pub mod events;

pub use ids::{JobId, LeaseToken};
pub use request::SubmitRequest;
pub use record::{JobRecord, JobSnapshot, JobState, LeasedJob};
pub use priority::PriorityTier;
pub use events::JobEvent;
