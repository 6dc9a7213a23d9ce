pub mod candidate;
pub mod presets;
pub mod router;

pub use candidate::{RouteHints, RoutedChoice, RoutingCandidate};
pub use presets::{base_model, parse_priority, ParsedModel, PresetTable, Priority, RoutingPreset};
pub use router::{rank_pool, Router};
