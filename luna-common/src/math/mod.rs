pub mod decimal;

pub use decimal::*;
