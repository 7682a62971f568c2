//! Message dispatchers: RPC calls and event publication.

mod event;
mod rpc;

pub use event::EventDispatcher;
pub use rpc::RpcDispatcher;
