mod error;
mod estimate;
mod order;
mod step;

pub use error::PlanError;
pub use estimate::{estimate, PlanEstimate};
pub use order::plan;
pub use step::{MigrationPlan, MigrationStep};

#[cfg(test)]
mod tests;
