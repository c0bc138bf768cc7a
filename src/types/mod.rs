//! Type definitions

pub mod call;
pub mod route;
pub mod stop;

pub use call::*;
pub use route::*;
pub use stop::*;
