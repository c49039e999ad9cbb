/// Mining shares module
///
/// Proof-of-work validation of submissions and publishing of accepted shares

pub mod publisher;
pub mod validator;

pub use publisher::{LogPublisher, RedisPublisher, Share, SharePublisher};
pub use validator::{ShareCheck, ShareStatus, ShareValidator, SolutionVerifier, StructuralVerifier};
