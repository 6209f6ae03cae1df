//! Resumable batch pipeline that walks a remote photo store, asks a vision
//! model to describe each image and keeps the validated results in SQLite.

pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod model;
pub mod retry;
pub mod scanner;
pub mod source;
pub mod tasks;
pub mod validation;
