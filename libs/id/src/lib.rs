//! # quark-id
//!
//! Typed identifiers for the quark deployment core.
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! - `app_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (application)
//! - `dep_01HV4Z4NYPLTRS0JTUA8XDME5F` (deployment attempt)
//! - `rsv_01HV4Z2WQXKJNM8GPQY6VBKC3D` (resource reservation)
//!
//! The prefix keeps an application id from being passed where a deployment
//! id is expected, and the ULID keeps ids sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
