pub mod protocol;
pub mod transport;

pub mod registry;
pub mod server;
pub mod session;

// Re-exports
pub use protocol::{Method, Notify, Request, Response, StratumError};
pub use registry::{SessionHandle, SessionRegistry};
pub use server::ProxyServer;
pub use session::{ClientSession, SessionContext, SessionPolicy};
pub use transport::{LineReader, LineWriter};
