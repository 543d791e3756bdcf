pub mod label_remap;
pub mod recipe;
pub mod roast;
pub mod segmentation;
pub mod simnibs;
pub mod simulation;

pub use label_remap::remap_label;
pub use recipe::{validate_recipe, ElectrodeSize, MeshOptions, Recipe, RecipeValue, RoastConfig};
pub use roast::RoastRunner;
pub use segmentation::{Job, PredictorFactory, SegmentationScheduler, Step};
pub use simnibs::SimNibsRunner;
pub use simulation::{SimulationJob, SimulationRunner, SimulationScheduler};
