pub mod account;
pub mod balance;
pub mod feature;
pub mod transaction;

pub use account::*;
pub use balance::*;
pub use feature::*;
pub use transaction::*;
