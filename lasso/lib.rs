#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

pub mod config;
pub mod constraint;
pub mod cv;
pub mod estimate;
pub mod export;
pub mod formulation;
pub mod lambda;
pub mod path;
pub mod problem;
pub mod solution;
pub mod solver;
pub mod stability;

pub use config::{
    CvParameters, LambdaChoice, LambdaFixedParameters, ModelSelectionConfig, PathParameters,
    StabilityMethod, StabilityParameters,
};
pub use constraint::ConstraintProjector;
pub use estimate::{ClassoProblem, EstimationError, solve};
pub use export::{ExportError, ExportSink, export};
pub use formulation::{Formulation, FormulationConfig, HuberThreshold};
pub use problem::Problem;
pub use solution::Solution;
pub use solver::SolverSettings;
