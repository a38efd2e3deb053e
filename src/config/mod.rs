//! Layered configuration via the `config` crate: built-in defaults,
//! optional `config/{default,RUN_MODE,local}` files, then `NOTIFY_`
//! environment variables.

mod settings;

pub use settings::{
    BatchSettings, BreakerSettings, DedupSettings, DispatchSettings, LogSettings, OtelSettings,
    PreferenceSettings, QueueSettings, RateLimitSettings, SchedulerSettings, ServerSettings,
    Settings, StoreSettings,
};
