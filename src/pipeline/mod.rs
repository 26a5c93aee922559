//! Pipeline module - audit log correlation and the recovery run.

mod correlator;
mod recovery;

pub use correlator::*;
pub use recovery::*;
