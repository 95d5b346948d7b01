pub mod config;
pub mod connection;
pub mod discovery;
pub mod download;
pub mod engine;
pub mod error;
pub mod node;
pub mod persistence;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod security;
pub mod tracker;
pub mod transaction;

#[cfg(test)]
pub mod testutil;
