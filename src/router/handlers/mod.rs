pub mod admin;
pub mod containers;
pub mod execs;
pub mod files;

pub use admin::*;
pub use containers::*;
pub use execs::*;
pub use files::*;
