//! Concrete workers.

pub mod execute;
pub mod upload;

pub use execute::{ExecuteCommandWorker, ExecuteOptions};
pub use upload::UploadWorker;
