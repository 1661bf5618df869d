//! Engine contract: the function-definition format and the backend trait that executes it.
pub mod hashing;
pub mod spec;
