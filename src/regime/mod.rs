// =============================================================================
// Regime Detection Module
// =============================================================================
//
// Classifies the macro regime from buffered events and market readings:
// - pluggable detection methods proposing scored candidates
// - highest confidence wins, ties to the method registered first
// - confirmed transitions become shared RegimeChangeEvent records

pub mod detector;
pub mod strategies;
pub mod types;

pub use detector::{ChangeHandler, DetectionContext, DetectionFn, RegimeDetector, RegimeDetectorStats};
pub use strategies::install_default_methods;
pub use types::{Regime, RegimeCandidate, RegimeChangeEvent};
