pub mod math;
pub mod types;

pub mod prelude {
    pub use crate::math::decimal::{Decimal, ParseDecimalError};
    pub use crate::types::address::{ContractAddress, ParseAddressError};
}
