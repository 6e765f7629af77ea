//! Path routing and routing hints

pub mod hint;
pub mod path;

pub use hint::{HintSource, RoutingHint, strip_hint_markup};
pub use path::{PathMapping, PathRouter, RouteMatch, RouteTableConfig, RoutingTable, normalize_path};
