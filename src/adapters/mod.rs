pub mod cache;
pub mod crash_sink;
pub mod edge_client;
pub mod postgres;
pub mod store;
pub mod wallet_client;

pub use cache::{CacheInvalidator, HttpCacheInvalidator, NullCacheInvalidator};
pub use crash_sink::{CrashSink, LoggingCrashSink, RollbarSink, Severity};
pub use edge_client::EdgeClient;
pub use postgres::PostgresStore;
pub use store::{PendingTaskContext, Store};
pub use wallet_client::{CoinbaseWallet, PaymentMethod, UnconfiguredWallet, WalletClient};
