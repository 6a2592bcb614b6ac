pub mod analyze;
pub mod orchestrate;
pub mod retrieve;
pub mod title;
