// Detection and tracking pipeline stages

pub mod detection;
pub mod detection_worker;
pub mod edges;
pub mod feature;
pub mod measure;
pub mod normalize;
pub mod orchestrator;
pub mod rescale;
pub mod runner;
pub mod tracking;
pub mod types;
pub mod windows;
