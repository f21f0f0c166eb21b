//! doxygen-service: accepts a gzip'd tarball of source code over HTTP, runs
//! doxygen on it inside a throwaway workspace and answers with a gzip'd
//! tarball of the generated HTML.

pub mod cli;
pub mod config;
pub mod contract;
pub mod error;
pub mod generator;
pub mod load_config;
pub mod materialize;
pub mod pack;
pub mod pipeline;
pub mod server;
pub mod unpack;
pub mod workspace;

pub use cli::{run, Cli, Commands};
pub use config::ServiceConfig;
pub use pipeline::Pipeline;
