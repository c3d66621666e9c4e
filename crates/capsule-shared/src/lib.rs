//! # capsule-shared
//!
//! Types and primitives shared by every Time Capsule crate: the payload
//! codec, identifier newtypes, upload rules and constants.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{CryptoError, ValidationError};
pub use types::{CapsuleId, ContentKind, PayloadRef, Recipient, UserId};
