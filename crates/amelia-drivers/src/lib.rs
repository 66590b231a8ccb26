pub mod api;
pub mod cli;
pub mod container;
pub mod driver;
pub mod sandbox;

pub use driver::{validate_against_schema, AgenticStream, Driver, DriverFactory, GeneratedContent};
pub use sandbox::{generate_network_allowlist_script, LineStream, SandboxProvider};
