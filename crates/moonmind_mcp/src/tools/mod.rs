//! The fixed MCP tool surface: discovery (schema catalog) lives here, dispatch lives
//! in `crate::dispatch`.

mod registry;

pub use registry::list_tools;
