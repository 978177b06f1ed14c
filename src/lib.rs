pub mod amount;
pub mod config;
pub mod csv;
pub mod ledger;
pub mod model;

pub use amount::{Amount, Percentage};
pub use config::LedgerConfig;
pub use ledger::{Ledger, LedgerError};
pub use model::{BrandId, Command, TransactionStatus, TransactionType, TxId, UserId};
