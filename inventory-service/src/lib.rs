pub mod clock;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod reservation;
pub mod retry;
pub mod schema;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Args, EngineConfig, SweeperConfig};
pub use engine::InventoryEngine;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use retry::RetryPolicy;
pub use store::InventoryStore;
pub use sweeper::{ExpirationSweeper, SweepReport};
