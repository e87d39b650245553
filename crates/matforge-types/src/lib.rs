pub mod config;
pub mod events;
pub mod plan;
pub mod state;

pub use config::*;
pub use events::*;
pub use plan::*;
pub use state::*;
