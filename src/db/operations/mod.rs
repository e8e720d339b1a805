pub mod assessments;
pub mod departments;
pub mod groups;
pub mod metrics;
pub mod modules;
pub mod notices;
pub mod questions;
pub mod users;
