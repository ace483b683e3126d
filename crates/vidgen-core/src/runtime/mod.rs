pub mod admission;
pub mod orchestrator;
pub mod recovery;
pub mod types;

#[cfg(test)]
mod tests;
