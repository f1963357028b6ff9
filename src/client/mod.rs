//! RPC caller side: correlation table and client.

mod pending;
mod rpc_client;

pub use pending::{AbandonReason, CorrelationTable, PendingCompletion};
pub use rpc_client::RpcClient;
