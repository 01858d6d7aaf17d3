//! Voter-registry verification behind a process-wide rate limiter.

pub mod client;
pub mod rate_limit;
pub mod registry;

pub use client::{Verification, VerificationClient, VerificationStatus};
pub use rate_limit::{AcquireMode, RateLimitStatus, RateLimiter};
pub use registry::{HttpRegistry, LookupError, RegistryLookup, RegistryRecord, VerifyError};
