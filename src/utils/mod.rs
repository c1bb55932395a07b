//! Shared utilities.

pub mod ip_utils;

pub use ip_utils::{format_with_prefix, in_subnet, subnet_of};
