pub mod models;
pub mod sensors;
pub mod settings;
