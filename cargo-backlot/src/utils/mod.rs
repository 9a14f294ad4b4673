pub mod display;
pub mod store;
pub mod validation;

pub use display::*;
pub use store::*;
pub use validation::*;
