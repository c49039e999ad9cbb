/// Node communication: JSON-RPC client and block template polling

pub mod rpc_client;
pub mod template_manager;

pub use rpc_client::{RpcCall, RpcClient};
pub use template_manager::{BlockTemplate, TemplateManager};
