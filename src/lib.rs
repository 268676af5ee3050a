pub mod api;
pub mod applier;
pub mod audit;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod governance;
pub mod logging;
pub mod notify;
pub mod risk;
pub mod sod;
pub mod store;
pub mod types;
pub mod utils;
pub mod workflow;

pub use context::{ApprovalContext, ApprovalRequest, RequestDraft};
pub use engine::ApprovalEngine;
pub use error::{GovernanceError, Result};
pub use types::Actor;
