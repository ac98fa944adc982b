//! Link-based mod deployment: reference matching, load ordering, incremental
//! linking into a game folder and content merging of shared archives.

pub mod archive;
pub mod backup;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod game;
pub mod library;
pub mod linking;
pub mod logging;
pub mod manifest;
pub mod merge;
pub mod order;
pub mod reference;

pub use error::{DeployError, Result};
