pub mod coordinator;
pub mod messenger;
pub mod telegram;
pub mod types;

pub use coordinator::ApprovalCoordinator;
pub use messenger::Messenger;
pub use types::{ApprovalChoice, ApprovalResult, ApprovalRequest};
