//! Pool module - probe issuance.

mod requester;

pub use requester::*;
