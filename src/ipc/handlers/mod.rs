pub mod attendance;
pub mod core;
pub mod evaluation;
pub mod grades;
pub mod periods;
pub mod scores;
pub mod settings;
pub mod setup;
pub mod students;
