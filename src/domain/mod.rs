//! Domain types for the routing layer
//!
//! Core abstractions shared by the registry, router, aggregator and session
//! tracker, plus the port through which remote agents are reached.

mod descriptor;
mod ids;
pub mod protocol;
pub mod response;
mod session;
mod task;

pub use descriptor::*;
pub use ids::*;
pub use protocol::{RemoteTaskState, RemoteUpdate};
pub use response::*;
pub use session::*;
pub use task::*;

use async_trait::async_trait;
use futures::Stream;
use secrecy::SecretString;
use serde_json::Value;
use std::pin::Pin;

use crate::error::{DiscoveryResult, DispatchError, DispatchResult};

/// Forward-only sequence of updates produced by one remote call
pub type RemoteStream = Pin<Box<dyn Stream<Item = Result<RemoteUpdate, DispatchError>> + Send>>;

/// Port for the remote agent protocol.
///
/// Implementations perform network I/O only; they keep no routing state.
#[async_trait]
pub trait RemoteAgentTransport: Send + Sync {
    /// Fetch the public descriptor served at `address`
    async fn fetch_card(&self, address: &str) -> DiscoveryResult<Value>;

    /// Fetch the authenticated extended descriptor served at `address`
    async fn fetch_extended_card(
        &self,
        address: &str,
        credential: &SecretString,
    ) -> DiscoveryResult<Value>;

    /// Submit a task; single-shot answers come back as a one-item stream
    async fn send(&self, address: &str, request: &RemoteRequest) -> DispatchResult<RemoteStream>;

    /// Ask the remote agent to cancel `remote_task_id`
    async fn cancel(&self, address: &str, remote_task_id: &str) -> DispatchResult<()>;
}
