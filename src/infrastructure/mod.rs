pub mod availability;
pub mod certificates;
pub mod connection;
pub mod directory;
pub mod gp_link;
pub mod permissions;
pub mod policy_store;
pub mod script_log;
pub mod script_registry;
pub mod tool_runner;

pub use availability::*;
pub use certificates::*;
pub use connection::*;
pub use directory::*;
pub use gp_link::*;
pub use permissions::*;
pub use policy_store::*;
pub use script_log::*;
pub use script_registry::*;
pub use tool_runner::*;
