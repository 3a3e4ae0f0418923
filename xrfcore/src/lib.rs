// data module
pub mod data {
    pub mod spectrum;
    pub mod element;
}

// fitting module
pub mod fitting {
    pub mod parameters;
    pub mod routine;
    pub mod roi;
}

// stream module
pub mod stream {
    pub mod block;
    pub mod accumulator;
}

// simulation module
pub mod simulation {
    pub mod spectrum;
}

// Re-export commonly used types
pub use data::element::{ElementEntry, ElementSpecification};
pub use data::spectrum::Spectrum;
pub use fitting::parameters::{CalibratedModel, Calibration, FitModel, FitParameters};
pub use fitting::roi::{RoiBounds, RoiFitRoutine};
pub use fitting::routine::FitRoutine;
pub use stream::accumulator::StreamAccumulator;
pub use stream::block::{is_final_tile, FitContext, StreamBlock};
