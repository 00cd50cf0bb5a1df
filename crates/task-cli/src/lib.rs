//! task-cli: command-line front end for the task-store sync core.
//!
//! Uses a JSON file as the remote document store, which makes the tool
//! self-contained while exercising the same repository/engine path a
//! hosted backend would.

pub mod json_store;

pub use json_store::JsonFileStore;
