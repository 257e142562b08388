pub mod error;
pub mod process;
pub mod scripts;

pub use error::{SupervisorError, SupervisorResult};
