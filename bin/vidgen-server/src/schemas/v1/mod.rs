pub mod generation;
pub mod recovery;
pub mod session;
pub mod task;
