//! Node callbacks and the per-node recording context.
//!
//! A node callback runs during `record_commands` and receives a context
//! exposing the node's arguments, resolved resources, and render-target
//! information. Contexts can be cloned for multi-threaded recording of
//! disjoint command ranges; clones carry their own command buffer and
//! error slot.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::access::AccessAttr;
use crate::analysis::SubresourceAccess;
use crate::arena::Arena;
use crate::builder::CmdInfo;
use crate::error::{Error, Result};
use crate::resource::{ResourceInstance, ResourceView};
use crate::signature::{NodeDeclInfo, RenderPassInfo};

bitflags! {
    pub struct CallbackFlags: u32 {
        /// The callback opens and closes its own render pass.
        const CUSTOM_RENDER_PASS = 1 << 0;
        /// The callback sets viewports and scissors itself.
        const CUSTOM_VIEWPORT_SCISSOR = 1 << 1;
    }
}

/// Opaque runtime command buffer handle threaded through to callbacks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandBuffer(pub u64);

pub type CmdCallbackFn = Arc<dyn Fn(&mut CallbackContext) -> Result<()> + Send + Sync>;

/// The resolved callback of a command node.
#[derive(Clone)]
pub struct NodeCallback {
    pub func: CmdCallbackFn,
    pub flags: CallbackFlags,
}

impl NodeCallback {
    pub fn new<F>(func: F) -> NodeCallback
    where
        F: Fn(&mut CallbackContext) -> Result<()> + Send + Sync + 'static,
    {
        NodeCallback {
            func: Arc::new(func),
            flags: CallbackFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: CallbackFlags) -> NodeCallback {
        self.flags = flags;
        self
    }
}

impl fmt::Debug for NodeCallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NodeCallback")
            .field("flags", &self.flags)
            .finish()
    }
}

/// Viewport state passed through dynamic-state parameters.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Everything a node callback may ask about its invocation.
pub struct CallbackContext<'a> {
    pub command_buffer: CommandBuffer,
    pub user_tag: u32,
    pub(crate) cmd: &'a CmdInfo,
    pub(crate) node_decl: &'a NodeDeclInfo,
    pub(crate) arena: &'a Arena,
    pub(crate) resources: &'a [ResourceInstance],
    pub(crate) accesses: &'a [SubresourceAccess],
    pub(crate) error: Option<Error>,
}

impl<'a> CallbackContext<'a> {
    pub(crate) fn new(
        command_buffer: CommandBuffer,
        cmd: &'a CmdInfo,
        node_decl: &'a NodeDeclInfo,
        arena: &'a Arena,
        resources: &'a [ResourceInstance],
        accesses: &'a [SubresourceAccess],
    ) -> CallbackContext<'a> {
        CallbackContext {
            command_buffer,
            user_tag: cmd.user_tag,
            cmd,
            node_decl,
            arena,
            resources,
            accesses,
            error: None,
        }
    }

    pub fn num_args(&self) -> usize {
        self.cmd.args.len()
    }

    pub fn node_name(&self) -> &str {
        self.node_decl.name.as_str()
    }

    /// Raw bytes of argument `index`.
    pub fn arg_bytes(&self, index: usize) -> Result<&'a [u8]> {
        let arg = self
            .cmd
            .args
            .get(index)
            .ok_or(Error::IndexOutOfBounds)?;
        Ok(self.arena.bytes(*arg))
    }

    /// Typed read of a scalar argument.
    pub fn arg<T: Copy>(&self, index: usize) -> Result<T> {
        let arg = self
            .cmd
            .args
            .get(index)
            .ok_or(Error::IndexOutOfBounds)?;
        self.arena.read::<T>(*arg)
    }

    /// Typed read of one element of an array argument.
    pub fn arg_elem<T: Copy>(&self, index: usize, element: usize) -> Result<T> {
        let bytes = self.arg_bytes(index)?;
        let size = ::std::mem::size_of::<T>();
        let decl = self
            .node_decl
            .params
            .get(index)
            .ok_or(Error::IndexOutOfBounds)?;
        if decl.type_size as usize != size {
            return Err(Error::TypeMismatch);
        }
        let offset = element * size;
        if offset + size > bytes.len() {
            return Err(Error::IndexOutOfBounds);
        }
        let elem_bytes = &bytes[offset..offset + size];
        Ok(unsafe { (elem_bytes.as_ptr() as *const T).read_unaligned() })
    }

    /// The view bound to a resource argument.
    pub fn arg_resource_view(&self, index: usize) -> Result<ResourceView> {
        self.arg::<ResourceView>(index)
    }

    /// The resolved resource instance behind `element` of resource
    /// argument `index`.
    pub fn arg_resource(&self, index: usize, element: u32) -> Result<&'a ResourceInstance> {
        let access = self
            .accesses
            .iter()
            .find(|a| a.param == index as u32 && a.array_offset == element)
            .ok_or(Error::IndexOutOfBounds)?;
        self.resources
            .get(access.resource_instance as usize)
            .ok_or(Error::InternalError)
    }

    /// The access attribute under which `element` of argument `index` is
    /// used by this node.
    pub fn arg_access(&self, index: usize, element: u32) -> Result<AccessAttr> {
        self.accesses
            .iter()
            .find(|a| a.param == index as u32 && a.array_offset == element)
            .map(|a| a.access)
            .ok_or(Error::IndexOutOfBounds)
    }

    /// Render-pass layout of the node declaration, if it has one.
    pub fn render_targets_info(&self) -> Option<&'a RenderPassInfo> {
        self.node_decl.render_pass_info.as_ref()
    }

    /// Viewports bound through dynamic-state parameters.
    pub fn viewports(&self) -> Result<Vec<Viewport>> {
        let mut out = Vec::new();
        if let Some(info) = self.render_targets_info() {
            for r in info.viewport_refs() {
                out.push(self.arg_elem::<Viewport>(r.param as usize, r.array_offset as usize)?);
            }
        }
        Ok(out)
    }

    pub fn scissor_rects(&self) -> Result<Vec<ScissorRect>> {
        let mut out = Vec::new();
        if let Some(info) = self.render_targets_info() {
            for r in info.scissor_refs() {
                out.push(self.arg_elem::<ScissorRect>(r.param as usize, r.array_offset as usize)?);
            }
        }
        Ok(out)
    }

    pub fn set_command_buffer(&mut self, command_buffer: CommandBuffer) {
        self.command_buffer = command_buffer;
    }

    /// Records a callback error; recording of the current range finishes
    /// and the error surfaces from `record_commands`.
    pub fn report_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Creates a secondary context for recording on another thread.
    /// The clone starts with the same command buffer and a clear error
    /// slot; siblings are independent.
    pub fn clone_context(&self) -> CallbackContext<'a> {
        CallbackContext {
            command_buffer: self.command_buffer,
            user_tag: self.user_tag,
            cmd: self.cmd,
            node_decl: self.node_decl,
            arena: self.arena,
            resources: self.resources,
            accesses: self.accesses,
            error: None,
        }
    }
}
