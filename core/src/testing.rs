pub mod pairing;
pub mod readiness;
pub mod result;
pub mod runner;
pub mod testcase;

pub use pairing::*;
pub use readiness::*;
pub use result::*;
pub use runner::*;
pub use testcase::*;
