pub mod demo;
pub mod error;
pub mod models;
pub mod motion;
pub mod settings;
