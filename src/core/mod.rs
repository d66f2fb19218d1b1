pub mod error;
pub mod testcase;
pub mod utils;
pub mod verdict;

pub use error::{Error, Result};
pub use testcase::{Testcase, TestcaseId};
pub use verdict::{classify, Verdict};
