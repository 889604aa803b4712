mod agent;
mod app;
mod bus;
mod persist;
mod plan;

pub use agent::AgentError;
pub use app::{AppError, AppResult};
pub use bus::{BusError, BusResult};
pub use persist::{PersistError, PersistResult};
pub use plan::PlanError;
