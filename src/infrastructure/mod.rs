//! Infrastructure layer modules
//!
//! - `backoff`: Delays between connection acquisition attempts
//! - `identity`: Access tokens used in place of a database password
//! - `postgres`: PostgreSQL connection pool and its manager

pub mod backoff;
pub mod identity;
pub mod postgres;
