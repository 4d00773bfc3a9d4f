#![forbid(unsafe_code)]

pub mod addr;
pub mod config;
pub mod error;

pub use addr::TeredoAddr;
pub use config::{RelayType, TeredoConfig};
pub use error::{TeredoError, TeredoResult};
