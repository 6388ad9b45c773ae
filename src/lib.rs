//! Render graph compiler and scheduler.
//!
//! A program body declares GPU work as nodes that consume and produce
//! resources; this crate turns one frame of declarations into an
//! executable command stream:
//! * transient resources get concrete memory ranges carved out of heaps,
//!   aliased where lifetimes permit,
//! * synchronization barriers are synthesized between dependent accesses
//!   per subresource,
//! * nodes are ordered to satisfy program-order and data-flow constraints
//!   while optimizing for memory footprint or pipeline throughput.
//!
//! The backend is abstracted behind [`runtime::RuntimeDevice`]; command
//! recording happens through per-node callbacks, so the compiler itself
//! never touches a graphics API.

pub mod access;
pub mod analysis;
pub mod arena;
pub mod builder;
pub mod callback;
pub mod error;
pub mod graph;
pub mod memory;
pub mod program;
pub mod render_graph;
pub mod resource;
pub mod runtime;
pub mod schedule;
pub mod signature;

pub use self::access::{AccessAttr, AccessFlags, ShaderStageFlags, SubresourceRange};
pub use self::builder::{GraphBuilder, NodeArg, NodeCallFlags};
pub use self::callback::{CallbackContext, CommandBuffer, NodeCallback};
pub use self::error::{Error, Result};
pub use self::graph::{NodeId, SubgraphFlags};
pub use self::program::Subprogram;
pub use self::render_graph::{
    RenderGraph, RenderGraphCreateInfo, RenderGraphFlags, RecordInfo, UpdateInfo,
};
pub use self::resource::{
    Format, ResourceDesc, ResourceFlags, ResourceId, ResourceType, ResourceView,
};
pub use self::runtime::{NullDevice, RuntimeDevice};
pub use self::schedule::ScheduleFlags;
pub use self::signature::{
    NodeDesc, NodeDeclFlags, ParamAttr, ParamDesc, ParamFlags, Semantic, Signature, SignatureDesc,
};
