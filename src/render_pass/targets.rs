//! Descriptions of the resources render passes and transitions operate on.
//!
//! Deimos does not own images or buffers. A [`Texture`] or [`Buffer`] is a description of a resource the application
//! created, carrying what deimos needs to know to build render passes, framebuffers and barriers for it.

use ash::vk;

use crate::SubresourceRange;

/// Value an attachment is cleared to.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil {
        depth: f32,
        stencil: u32,
    },
}

impl ClearValue {
    pub const BLACK: ClearValue = ClearValue::Color([0.0, 0.0, 0.0, 1.0]);
    pub const DEPTH_ONE: ClearValue = ClearValue::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };

    pub fn to_vk(&self) -> vk::ClearValue {
        match *self {
            ClearValue::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue {
                    float32,
                },
            },
            ClearValue::DepthStencil {
                depth,
                stencil,
            } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth,
                    stencil,
                },
            },
        }
    }
}

fn has_stencil(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D32_SFLOAT_S8_UINT | vk::Format::S8_UINT
    )
}

/// Description of an image owned by the application.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Texture {
    pub image: vk::Image,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub num_mips: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    /// Every aspect of the image.
    pub aspect: vk::ImageAspectFlags,
    pub usage: vk::ImageUsageFlags,
    /// The texture is read back by the CPU. Resolves into it leave it in `GENERAL` layout.
    pub cpu_readback: bool,
    /// Used when a render pass clears this texture without an explicit clear value.
    pub clear_value: ClearValue,
    pub view_type: vk::ImageViewType,
}

impl Texture {
    /// A single-sampled 2D colour render target with one mip and one layer.
    pub fn color_2d(image: vk::Image, format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            image,
            format,
            width,
            height,
            depth: 1,
            num_mips: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC,
            cpu_readback: false,
            clear_value: ClearValue::BLACK,
            view_type: vk::ImageViewType::TYPE_2D,
        }
    }

    /// A single-sampled 2D depth (and stencil, if the format has one) target.
    pub fn depth_stencil_2d(image: vk::Image, format: vk::Format, width: u32, height: u32) -> Self {
        let aspect = match format {
            vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
            format if has_stencil(format) => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            _ => vk::ImageAspectFlags::DEPTH,
        };
        Self {
            aspect,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            clear_value: ClearValue::DEPTH_ONE,
            ..Self::color_2d(image, format, width, height)
        }
    }

    pub fn with_mips(mut self, num_mips: u32) -> Self {
        self.num_mips = num_mips.max(1);
        self
    }

    pub fn with_array_layers(mut self, layers: u32) -> Self {
        self.array_layers = layers.max(1);
        if layers > 1 {
            self.view_type = vk::ImageViewType::TYPE_2D_ARRAY;
        }
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_clear_value(mut self, value: ClearValue) -> Self {
        self.clear_value = value;
        self
    }

    pub fn with_cpu_readback(mut self, readback: bool) -> Self {
        self.cpu_readback = readback;
        self
    }

    pub fn full_aspect_mask(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn is_depth_or_stencil_aspect(&self) -> bool {
        self.aspect
            .intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL)
    }

    pub fn has_stencil(&self) -> bool {
        self.aspect.contains(vk::ImageAspectFlags::STENCIL)
    }

    /// Whether the texture can be bound as a colour or depth attachment.
    pub fn is_render_targetable(&self) -> bool {
        self.usage
            .intersects(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
    }

    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }

    /// Every mip and layer of the texture.
    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange {
            aspect: self.aspect,
            base_mip: 0,
            mip_count: self.num_mips,
            base_layer: 0,
            layer_count: self.array_layers,
        }
    }
}

/// Description of a buffer owned by the application.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
}

impl Buffer {
    pub fn new(buffer: vk::Buffer, size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        Self {
            buffer,
            size,
            usage,
        }
    }

    /// Whether draw and dispatch arguments are read from this buffer.
    pub fn is_draw_indirect(&self) -> bool {
        self.usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER)
    }
}

/// A resource bound for unordered (storage) access.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum UnorderedAccessView {
    VertexBuffer(Buffer),
    IndexBuffer(Buffer),
    StructuredBuffer(Buffer),
    Texture(Texture),
}

/// What happens to an attachment when a render pass begins.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LoadAction {
    NoAction,
    Load,
    Clear,
}

impl LoadAction {
    pub fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadAction::NoAction => vk::AttachmentLoadOp::DONT_CARE,
            LoadAction::Load => vk::AttachmentLoadOp::LOAD,
            LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
        }
    }
}

/// What happens to an attachment when a render pass ends.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StoreAction {
    NoAction,
    Store,
    /// Only the resolved result is kept, the multisampled contents are discarded.
    MultisampleResolve,
}

impl StoreAction {
    pub fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            StoreAction::Store => vk::AttachmentStoreOp::STORE,
            StoreAction::NoAction | StoreAction::MultisampleResolve => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

/// Load and store action of one attachment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RenderTargetActions {
    pub load: LoadAction,
    pub store: StoreAction,
}

impl RenderTargetActions {
    pub const LOAD_STORE: Self = Self::new(LoadAction::Load, StoreAction::Store);
    pub const CLEAR_STORE: Self = Self::new(LoadAction::Clear, StoreAction::Store);
    pub const DONT_LOAD_STORE: Self = Self::new(LoadAction::NoAction, StoreAction::Store);
    pub const LOAD_DONT_STORE: Self = Self::new(LoadAction::Load, StoreAction::NoAction);
    pub const CLEAR_DONT_STORE: Self = Self::new(LoadAction::Clear, StoreAction::NoAction);
    pub const DONT_LOAD_DONT_STORE: Self = Self::new(LoadAction::NoAction, StoreAction::NoAction);
    pub const CLEAR_RESOLVE: Self = Self::new(LoadAction::Clear, StoreAction::MultisampleResolve);

    pub const fn new(load: LoadAction, store: StoreAction) -> Self {
        Self {
            load,
            store,
        }
    }
}

/// Actions for the depth and the stencil aspect of a depth target.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DepthStencilTargetActions {
    pub depth: RenderTargetActions,
    pub stencil: RenderTargetActions,
}

impl DepthStencilTargetActions {
    pub const LOAD_DEPTH_STENCIL_STORE: Self = Self::new(RenderTargetActions::LOAD_STORE, RenderTargetActions::LOAD_STORE);
    pub const CLEAR_DEPTH_STENCIL_STORE: Self = Self::new(RenderTargetActions::CLEAR_STORE, RenderTargetActions::CLEAR_STORE);
    pub const CLEAR_DEPTH_STENCIL_DONT_STORE: Self =
        Self::new(RenderTargetActions::CLEAR_DONT_STORE, RenderTargetActions::CLEAR_DONT_STORE);
    pub const LOAD_DEPTH_CLEAR_STENCIL_STORE: Self = Self::new(RenderTargetActions::LOAD_STORE, RenderTargetActions::CLEAR_STORE);

    pub const fn new(depth: RenderTargetActions, stencil: RenderTargetActions) -> Self {
        Self {
            depth,
            stencil,
        }
    }
}

/// How one aspect of a depth target is accessed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DepthStencilAccess {
    NoAccess,
    Read,
    Write,
}

/// How the depth and stencil aspects of a depth target are accessed while it is bound.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExclusiveDepthStencil {
    pub depth: DepthStencilAccess,
    pub stencil: DepthStencilAccess,
}

impl ExclusiveDepthStencil {
    pub const DEPTH_NOP_STENCIL_NOP: Self = Self::new(DepthStencilAccess::NoAccess, DepthStencilAccess::NoAccess);
    pub const DEPTH_READ_STENCIL_READ: Self = Self::new(DepthStencilAccess::Read, DepthStencilAccess::Read);
    pub const DEPTH_READ_STENCIL_NOP: Self = Self::new(DepthStencilAccess::Read, DepthStencilAccess::NoAccess);
    pub const DEPTH_WRITE_STENCIL_NOP: Self = Self::new(DepthStencilAccess::Write, DepthStencilAccess::NoAccess);
    pub const DEPTH_WRITE_STENCIL_WRITE: Self = Self::new(DepthStencilAccess::Write, DepthStencilAccess::Write);
    pub const DEPTH_READ_STENCIL_WRITE: Self = Self::new(DepthStencilAccess::Read, DepthStencilAccess::Write);
    pub const DEPTH_WRITE_STENCIL_READ: Self = Self::new(DepthStencilAccess::Write, DepthStencilAccess::Read);

    pub const fn new(depth: DepthStencilAccess, stencil: DepthStencilAccess) -> Self {
        Self {
            depth,
            stencil,
        }
    }

    pub fn is_depth_write(&self) -> bool {
        self.depth == DepthStencilAccess::Write
    }

    pub fn is_stencil_write(&self) -> bool {
        self.stencil == DepthStencilAccess::Write
    }

    pub fn is_any_write(&self) -> bool {
        self.is_depth_write() || self.is_stencil_write()
    }

    /// Image layout a depth target must be in for this access. Without `mixed_layouts` (separate depth and stencil
    /// read-only layouts), mixed read/write access falls back to the fully writable layout.
    pub fn layout(&self, mixed_layouts: bool) -> vk::ImageLayout {
        use DepthStencilAccess::*;
        match (self.depth, self.stencil) {
            (Read, Write) if mixed_layouts => vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
            (Write, Read) if mixed_layouts => vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
            _ if self.is_any_write() => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            _ => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        }
    }
}

/// One colour target bound through [`RenderTargetsInfo`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RenderTargetView {
    pub texture: Texture,
    pub mip_index: u32,
    /// `None` binds every layer.
    pub array_slice: Option<u32>,
    pub load: LoadAction,
    pub store: StoreAction,
    /// Single-sampled target a multisampled colour target is resolved into.
    pub resolve: Option<Texture>,
}

impl RenderTargetView {
    pub fn new(texture: Texture, load: LoadAction, store: StoreAction) -> Self {
        Self {
            texture,
            mip_index: 0,
            array_slice: None,
            load,
            store,
            resolve: None,
        }
    }
}

/// The depth target bound through [`RenderTargetsInfo`].
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DepthRenderTargetView {
    pub texture: Texture,
    pub actions: DepthStencilTargetActions,
    pub access: ExclusiveDepthStencil,
    pub resolve: Option<Texture>,
}

impl DepthRenderTargetView {
    pub fn new(texture: Texture, actions: DepthStencilTargetActions, access: ExclusiveDepthStencil) -> Self {
        Self {
            texture,
            actions,
            access,
            resolve: None,
        }
    }
}

/// Set of render targets for [`CommandListContext::set_render_targets`](crate::CommandListContext::set_render_targets),
/// and the key framebuffers are matched against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderTargetsInfo {
    pub color: Vec<RenderTargetView>,
    pub depth_stencil: Option<DepthRenderTargetView>,
    pub multiview: bool,
}

/// Colour attachment of an explicit render pass.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ColorRenderTarget {
    pub texture: Texture,
    pub resolve: Option<Texture>,
    pub mip_index: u32,
    pub array_slice: Option<u32>,
    pub actions: RenderTargetActions,
}

impl ColorRenderTarget {
    pub fn new(texture: Texture, actions: RenderTargetActions) -> Self {
        Self {
            texture,
            resolve: None,
            mip_index: 0,
            array_slice: None,
            actions,
        }
    }

    pub fn with_resolve_target(mut self, resolve: Texture) -> Self {
        self.resolve = Some(resolve);
        self
    }

    pub fn with_mip(mut self, mip_index: u32) -> Self {
        self.mip_index = mip_index;
        self
    }

    pub fn with_array_slice(mut self, slice: u32) -> Self {
        self.array_slice = Some(slice);
        self
    }
}

/// Depth attachment of an explicit render pass.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DepthStencilRenderTarget {
    pub texture: Texture,
    pub resolve: Option<Texture>,
    pub actions: DepthStencilTargetActions,
    pub access: ExclusiveDepthStencil,
}

impl DepthStencilRenderTarget {
    pub fn new(texture: Texture, actions: DepthStencilTargetActions, access: ExclusiveDepthStencil) -> Self {
        Self {
            texture,
            resolve: None,
            actions,
            access,
        }
    }

    pub fn with_resolve_target(mut self, resolve: Texture) -> Self {
        self.resolve = Some(resolve);
        self
    }
}

/// Extra subpasses an explicit render pass is created with.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum SubpassHint {
    #[default]
    None,
    /// A second subpass reading the depth target as an input attachment.
    DepthReadSubpass,
}

/// Which subresources are copied when resolving into a resolve target.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ResolveParams {
    pub mip_index: u32,
    pub source_array_index: u32,
    pub dest_array_index: u32,
}

/// Description of an explicit render pass, passed to
/// [`CommandListContext::begin_render_pass`](crate::CommandListContext::begin_render_pass).
/// # Example
/// ```
/// use deimos::prelude::*;
/// let color = Texture::color_2d(vk::Image::null(), vk::Format::R8G8B8A8_UNORM, 64, 64);
/// let info = RenderPassInfo::new()
///     .color(ColorRenderTarget::new(color, RenderTargetActions::CLEAR_STORE))
///     .multiview(false);
/// assert!(!info.is_msaa());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPassInfo {
    pub color: Vec<ColorRenderTarget>,
    pub depth_stencil: Option<DepthStencilRenderTarget>,
    /// The pass writes mip `n` of its only colour target while reading mip `n - 1`.
    pub generating_mips: bool,
    pub multiview: bool,
    pub subpass_hint: SubpassHint,
    pub resolve_params: ResolveParams,
}

impl RenderPassInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a colour attachment.
    pub fn color(mut self, target: ColorRenderTarget) -> Self {
        self.color.push(target);
        self
    }

    pub fn depth_stencil(mut self, target: DepthStencilRenderTarget) -> Self {
        self.depth_stencil = Some(target);
        self
    }

    pub fn generating_mips(mut self, generating: bool) -> Self {
        self.generating_mips = generating;
        self
    }

    pub fn multiview(mut self, multiview: bool) -> Self {
        self.multiview = multiview;
        self
    }

    pub fn subpass_hint(mut self, hint: SubpassHint) -> Self {
        self.subpass_hint = hint;
        self
    }

    pub fn resolve_params(mut self, params: ResolveParams) -> Self {
        self.resolve_params = params;
        self
    }

    /// Whether any attachment is multisampled.
    pub fn is_msaa(&self) -> bool {
        self.color
            .iter()
            .map(|target| &target.texture)
            .chain(self.depth_stencil.iter().map(|target| &target.texture))
            .any(Texture::is_multisampled)
    }

    pub fn to_render_targets_info(&self) -> RenderTargetsInfo {
        RenderTargetsInfo {
            color: self
                .color
                .iter()
                .map(|target| RenderTargetView {
                    texture: target.texture,
                    mip_index: target.mip_index,
                    array_slice: target.array_slice,
                    load: target.actions.load,
                    store: target.actions.store,
                    resolve: target.resolve,
                })
                .collect(),
            depth_stencil: self.depth_stencil.map(|target| DepthRenderTargetView {
                texture: target.texture,
                actions: target.actions,
                access: target.access,
                resolve: target.resolve,
            }),
            multiview: self.multiview,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_layouts() {
        let access = ExclusiveDepthStencil::DEPTH_READ_STENCIL_WRITE;
        assert_eq!(access.layout(true), vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(access.layout(false), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(
            ExclusiveDepthStencil::DEPTH_READ_STENCIL_READ.layout(true),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            ExclusiveDepthStencil::DEPTH_WRITE_STENCIL_NOP.layout(true),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn depth_formats_detect_stencil() {
        let depth = Texture::depth_stencil_2d(vk::Image::null(), vk::Format::D32_SFLOAT, 4, 4);
        assert_eq!(depth.aspect, vk::ImageAspectFlags::DEPTH);
        let depth_stencil = Texture::depth_stencil_2d(vk::Image::null(), vk::Format::D24_UNORM_S8_UINT, 4, 4);
        assert!(depth_stencil.has_stencil());
        assert!(depth_stencil.is_depth_or_stencil_aspect());
        assert!(depth_stencil.is_render_targetable());
    }
}
