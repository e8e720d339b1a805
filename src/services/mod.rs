pub mod analytics;
pub mod grading;
pub mod notices;
pub mod prerequisites;
