pub mod archive;
pub mod attributes;
pub mod cli;
pub mod config;
pub mod db;
pub mod errors;
pub mod geo_index;
pub mod ledger;
pub mod normalize;
pub mod pipeline;
pub mod seed;
pub mod sources;
pub mod store;
pub mod throttle;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::attributes::{CityAttributeName, JobKind};
pub use crate::config::{AdapterSettings, AppConfig, LedgerBackend};
pub use crate::errors::{AppError, AppResult};
pub use crate::normalize::NormalizationOutcome;
pub use crate::pipeline::{run_job, run_normalize, run_with_adapter, JobContext, JobReport};
pub use crate::store::{AttributeStore, City};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,cityrank_lib=debug,cityrank=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
