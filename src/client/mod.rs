//! AWS client module.

mod aws_client;
mod cloudtrail;
mod ports;
mod rate_limiter;
mod registry;
mod s3;
mod sigv4;
mod sts;

pub use aws_client::*;
pub use cloudtrail::*;
pub use ports::*;
pub use rate_limiter::*;
pub use registry::*;
pub use s3::*;
pub use sigv4::*;
pub use sts::*;
