//! Authentication Module
//! Mission: Webhook signatures, device-bound approval tokens, consumer API keys

pub mod device;
pub mod jwt;
pub mod middleware;
pub mod signature;

pub use device::DeviceBinding;
pub use jwt::{ApprovalClaims, TokenIssuer};
pub use middleware::{consumer_auth_middleware, ConsumerAuth};
pub use signature::{SignatureVerifier, VerifiedDelivery};
