pub mod app_project;
pub mod app_set;
pub mod application;

pub use app_project::AppProject;
pub use app_set::{
    ApplicationSet, ApplicationSetApplicationStatus, ApplicationSetCondition,
    ApplicationSetConditionType, ApplicationSetStatus, ConditionStatus,
    GeneratorSpec, MatchExpression, ResourceStatus, RolloutPhase,
    RolloutStep, RolloutStrategy,
};
pub use application::{
    Application, ApplicationDestination, ApplicationSpec, HealthStatusCode,
    Operation, OperationPhase, SyncStatusCode,
};
