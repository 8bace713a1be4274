//! Third-party custom resources the reconcilers read or write.

pub mod cnpg;
pub mod keda;
