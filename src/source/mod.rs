//! Remote mailbox access: wire types, the retrying Gmail client, and the
//! [`MessageSource`] seam the orchestrator depends on.

pub mod client;
pub mod retry;
pub mod types;

pub use client::{GmailClient, MAX_PAGE_SIZE, MessageSource};
pub use retry::RetryPolicy;
pub use types::{MessageDetail, MessagePart, MessageRef, PartBody, SearchPage};
