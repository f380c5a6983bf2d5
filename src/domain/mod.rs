pub mod guid;
pub mod keys;
pub mod policy;
pub mod script;

pub use guid::*;
pub use keys::*;
pub use policy::*;
pub use script::*;
