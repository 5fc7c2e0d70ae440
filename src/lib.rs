pub mod app;

pub use app::commands;
pub use app::config::{load_config, AppConfig};
pub use app::error::AppError;
pub use app::logging::init_logging;
pub use app::state::AppState;
