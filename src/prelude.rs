pub use crate::builder::CacheBuilder;
pub use crate::cache::{Cache, LoadingCache};
pub use crate::error::{ConfigError, DynError, LoadError};
pub use crate::notify::{RemovalCause, RemovalListener, RemovalNotification};
pub use crate::stats::CacheStats;
pub use crate::time::{ManualTicker, SystemTicker, Ticker};
pub use crate::traits::{CacheLoader, FnLoader, Reload};
