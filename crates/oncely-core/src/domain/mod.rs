//! Domain model (keys, ids, records, outcomes, decisions, errors).

pub mod counts;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod key;
pub mod outcome;
pub mod record;
pub mod retry;
pub mod state;
pub mod work_item;

pub use counts::{QueueCounts, RecordCounts};
pub use decision::{Arbiter, Decider, Decision, DecisionContext, DefaultDecider};
pub use errors::{CoordinatorError, ErrorKind};
pub use ids::{LeaseReceipt, MessageId, OwnerToken};
pub use key::{IdempotencyKey, KeyError, MAX_KEY_LEN};
pub use outcome::{Completion, Outcome, PollResult, SubmitReceipt};
pub use record::{IdempotencyRecord, Ownership};
pub use retry::RetryPolicy;
pub use state::RecordState;
pub use work_item::{DeadLetter, Lease, WorkItem};
