pub mod entities;
pub mod repositories;
pub mod sqlx_impls;

pub use entities::*;
pub use repositories::*;

pub use broker_errors::{BrokerError, BrokerResult};
