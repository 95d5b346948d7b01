pub mod args;
pub mod peer;
pub mod settings;
pub mod tracker;
