//! Graphics pipeline description, dynamic pipeline state and pipeline creation.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::CString;
use std::hash::{Hash, Hasher};

/// Viewport rectangle and depth range.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// A viewport covering `width` x `height` with the full depth range.
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            max_depth: 1.0,
            ..Self::default()
        }
    }

    pub fn to_vk(&self) -> vk::Viewport {
        vk::Viewport {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
        }
    }

    /// Bit patterns of every field, for cache keys.
    fn bits(&self) -> [u32; 6] {
        float_bits([
            self.x,
            self.y,
            self.width,
            self.height,
            self.min_depth,
            self.max_depth,
        ])
    }
}

/// Floats are compared and hashed by bit pattern, so NaN matches itself and `-0.0` differs
/// from `0.0`.
fn float_bits<const N: usize>(values: [f32; N]) -> [u32; N] {
    values.map(f32::to_bits)
}

fn viewport_bits(viewports: &[Viewport]) -> impl Iterator<Item = [u32; 6]> + '_ {
    viewports.iter().map(Viewport::bits)
}

/// Integer rectangle, used for scissors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn to_vk(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D {
                x: self.x,
                y: self.y,
            },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub clamp: f32,
    pub slope_factor: f32,
}

impl DepthBias {
    fn bits(&self) -> [u32; 3] {
        float_bits([self.constant_factor, self.clamp, self.slope_factor])
    }
}

/// Stencil configuration for one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceState {
    pub fail_op: vk::StencilOp,
    pub pass_op: vk::StencilOp,
    pub depth_fail_op: vk::StencilOp,
    pub compare_op: vk::CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            fail_op: vk::StencilOp::KEEP,
            pass_op: vk::StencilOp::KEEP,
            depth_fail_op: vk::StencilOp::KEEP,
            compare_op: vk::CompareOp::ALWAYS,
            compare_mask: 0xff,
            write_mask: 0xff,
            reference: 0,
        }
    }
}

impl StencilFaceState {
    fn to_vk(self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op,
            pass_op: self.pass_op,
            depth_fail_op: self.depth_fail_op,
            compare_op: self.compare_op,
            compare_mask: self.compare_mask,
            write_mask: self.write_mask,
            reference: self.reference,
        }
    }

    fn ops(&self) -> (vk::StencilOp, vk::StencilOp, vk::StencilOp, vk::CompareOp) {
        (self.fail_op, self.pass_op, self.depth_fail_op, self.compare_op)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Vertex buffer layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexFormat {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

/// The pipeline fields that may vary between variants of one pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicInfo {
    pub viewports: Vec<Viewport>,
    pub scissors: Vec<Rect2D>,
    pub line_width: f32,
    pub depth_bias: DepthBias,
    pub blend_constants: [f32; 4],
    pub min_depth_bounds: f32,
    pub max_depth_bounds: f32,
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub topology: vk::PrimitiveTopology,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub depth_bounds_test_enable: bool,
    pub stencil_test_enable: bool,
    pub rasterizer_discard_enable: bool,
    pub depth_bias_enable: bool,
    pub primitive_restart_enable: bool,
    pub logic_op: vk::LogicOp,
    pub patch_control_points: u32,
    pub vertex_format: VertexFormat,
    /// Write mask per color attachment. Attachments past the end write all channels.
    pub color_write_mask: Vec<vk::ColorComponentFlags>,
}

impl Default for DynamicInfo {
    fn default() -> Self {
        Self {
            viewports: Vec::new(),
            scissors: Vec::new(),
            line_width: 1.0,
            depth_bias: DepthBias::default(),
            blend_constants: [0.0; 4],
            min_depth_bounds: 0.0,
            max_depth_bounds: 1.0,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: vk::CompareOp::LESS,
            depth_bounds_test_enable: false,
            stencil_test_enable: false,
            rasterizer_discard_enable: false,
            depth_bias_enable: false,
            primitive_restart_enable: false,
            logic_op: vk::LogicOp::COPY,
            patch_control_points: 0,
            vertex_format: VertexFormat::default(),
            color_write_mask: Vec::new(),
        }
    }
}

/// One independently variable piece of [`DynamicInfo`].
///
/// Every kind knows how to compare, copy and hash exactly its own fields, so a set of kinds
/// describes which parts of two infos must agree for them to share a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DynamicState {
    Viewport,
    Scissor,
    LineWidth,
    DepthBias,
    BlendConstants,
    DepthBounds,
    StencilCompareMask,
    StencilWriteMask,
    StencilReference,
    CullMode,
    FrontFace,
    PrimitiveTopology,
    ViewportCount,
    ScissorCount,
    DepthTestEnable,
    DepthWriteEnable,
    DepthCompareOp,
    DepthBoundsTestEnable,
    StencilTestEnable,
    StencilOp,
    RasterizerDiscardEnable,
    DepthBiasEnable,
    PrimitiveRestartEnable,
    PatchControlPoints,
    LogicOp,
    VertexInput,
    ColorWriteMask,
}

impl DynamicState {
    pub const ALL: [DynamicState; 27] = [
        Self::Viewport,
        Self::Scissor,
        Self::LineWidth,
        Self::DepthBias,
        Self::BlendConstants,
        Self::DepthBounds,
        Self::StencilCompareMask,
        Self::StencilWriteMask,
        Self::StencilReference,
        Self::CullMode,
        Self::FrontFace,
        Self::PrimitiveTopology,
        Self::ViewportCount,
        Self::ScissorCount,
        Self::DepthTestEnable,
        Self::DepthWriteEnable,
        Self::DepthCompareOp,
        Self::DepthBoundsTestEnable,
        Self::StencilTestEnable,
        Self::StencilOp,
        Self::RasterizerDiscardEnable,
        Self::DepthBiasEnable,
        Self::PrimitiveRestartEnable,
        Self::PatchControlPoints,
        Self::LogicOp,
        Self::VertexInput,
        Self::ColorWriteMask,
    ];

    /// Whether `a` and `b` agree on this state's fields.
    pub fn matches(self, a: &DynamicInfo, b: &DynamicInfo) -> bool {
        match self {
            Self::Viewport => viewport_bits(&a.viewports).eq(viewport_bits(&b.viewports)),
            Self::Scissor => a.scissors == b.scissors,
            Self::LineWidth => a.line_width.to_bits() == b.line_width.to_bits(),
            Self::DepthBias => a.depth_bias.bits() == b.depth_bias.bits(),
            Self::BlendConstants => float_bits(a.blend_constants) == float_bits(b.blend_constants),
            Self::DepthBounds => {
                float_bits([a.min_depth_bounds, a.max_depth_bounds])
                    == float_bits([b.min_depth_bounds, b.max_depth_bounds])
            }
            Self::StencilCompareMask => {
                a.stencil_front.compare_mask == b.stencil_front.compare_mask
                    && a.stencil_back.compare_mask == b.stencil_back.compare_mask
            }
            Self::StencilWriteMask => {
                a.stencil_front.write_mask == b.stencil_front.write_mask
                    && a.stencil_back.write_mask == b.stencil_back.write_mask
            }
            Self::StencilReference => {
                a.stencil_front.reference == b.stencil_front.reference
                    && a.stencil_back.reference == b.stencil_back.reference
            }
            Self::CullMode => a.cull_mode == b.cull_mode,
            Self::FrontFace => a.front_face == b.front_face,
            Self::PrimitiveTopology => a.topology == b.topology,
            Self::ViewportCount => a.viewports.len() == b.viewports.len(),
            Self::ScissorCount => a.scissors.len() == b.scissors.len(),
            Self::DepthTestEnable => a.depth_test_enable == b.depth_test_enable,
            Self::DepthWriteEnable => a.depth_write_enable == b.depth_write_enable,
            Self::DepthCompareOp => a.depth_compare_op == b.depth_compare_op,
            Self::DepthBoundsTestEnable => {
                a.depth_bounds_test_enable == b.depth_bounds_test_enable
            }
            Self::StencilTestEnable => a.stencil_test_enable == b.stencil_test_enable,
            Self::StencilOp => {
                a.stencil_front.ops() == b.stencil_front.ops()
                    && a.stencil_back.ops() == b.stencil_back.ops()
            }
            Self::RasterizerDiscardEnable => {
                a.rasterizer_discard_enable == b.rasterizer_discard_enable
            }
            Self::DepthBiasEnable => a.depth_bias_enable == b.depth_bias_enable,
            Self::PrimitiveRestartEnable => {
                a.primitive_restart_enable == b.primitive_restart_enable
            }
            Self::PatchControlPoints => a.patch_control_points == b.patch_control_points,
            Self::LogicOp => a.logic_op == b.logic_op,
            Self::VertexInput => a.vertex_format == b.vertex_format,
            Self::ColorWriteMask => a.color_write_mask == b.color_write_mask,
        }
    }

    /// Copy this state's fields from `new` into `base`, leaving every other field alone.
    pub fn apply(self, base: &mut DynamicInfo, new: &DynamicInfo) {
        match self {
            Self::Viewport => base.viewports.clone_from(&new.viewports),
            Self::Scissor => base.scissors.clone_from(&new.scissors),
            Self::LineWidth => base.line_width = new.line_width,
            Self::DepthBias => base.depth_bias = new.depth_bias,
            Self::BlendConstants => base.blend_constants = new.blend_constants,
            Self::DepthBounds => {
                base.min_depth_bounds = new.min_depth_bounds;
                base.max_depth_bounds = new.max_depth_bounds;
            }
            Self::StencilCompareMask => {
                base.stencil_front.compare_mask = new.stencil_front.compare_mask;
                base.stencil_back.compare_mask = new.stencil_back.compare_mask;
            }
            Self::StencilWriteMask => {
                base.stencil_front.write_mask = new.stencil_front.write_mask;
                base.stencil_back.write_mask = new.stencil_back.write_mask;
            }
            Self::StencilReference => {
                base.stencil_front.reference = new.stencil_front.reference;
                base.stencil_back.reference = new.stencil_back.reference;
            }
            Self::CullMode => base.cull_mode = new.cull_mode,
            Self::FrontFace => base.front_face = new.front_face,
            Self::PrimitiveTopology => base.topology = new.topology,
            // Counts keep the base's leading entries and take the remainder from `new`.
            Self::ViewportCount => {
                base.viewports.truncate(new.viewports.len());
                let kept = base.viewports.len();
                base.viewports.extend_from_slice(&new.viewports[kept..]);
            }
            Self::ScissorCount => {
                base.scissors.truncate(new.scissors.len());
                let kept = base.scissors.len();
                base.scissors.extend_from_slice(&new.scissors[kept..]);
            }
            Self::DepthTestEnable => base.depth_test_enable = new.depth_test_enable,
            Self::DepthWriteEnable => base.depth_write_enable = new.depth_write_enable,
            Self::DepthCompareOp => base.depth_compare_op = new.depth_compare_op,
            Self::DepthBoundsTestEnable => {
                base.depth_bounds_test_enable = new.depth_bounds_test_enable;
            }
            Self::StencilTestEnable => base.stencil_test_enable = new.stencil_test_enable,
            Self::StencilOp => {
                for (b, n) in [
                    (&mut base.stencil_front, &new.stencil_front),
                    (&mut base.stencil_back, &new.stencil_back),
                ] {
                    b.fail_op = n.fail_op;
                    b.pass_op = n.pass_op;
                    b.depth_fail_op = n.depth_fail_op;
                    b.compare_op = n.compare_op;
                }
            }
            Self::RasterizerDiscardEnable => {
                base.rasterizer_discard_enable = new.rasterizer_discard_enable;
            }
            Self::DepthBiasEnable => base.depth_bias_enable = new.depth_bias_enable,
            Self::PrimitiveRestartEnable => {
                base.primitive_restart_enable = new.primitive_restart_enable;
            }
            Self::PatchControlPoints => base.patch_control_points = new.patch_control_points,
            Self::LogicOp => base.logic_op = new.logic_op,
            Self::VertexInput => base.vertex_format.clone_from(&new.vertex_format),
            Self::ColorWriteMask => base.color_write_mask.clone_from(&new.color_write_mask),
        }
    }

    /// Feed this state's fields into `state`.
    ///
    /// Infos that [`matches`](Self::matches) for a kind hash identically for it.
    pub fn hash_into<H: Hasher>(self, info: &DynamicInfo, state: &mut H) {
        self.hash(state);
        match self {
            Self::Viewport => {
                info.viewports.len().hash(state);
                for bits in viewport_bits(&info.viewports) {
                    bits.hash(state);
                }
            }
            Self::Scissor => info.scissors.hash(state),
            Self::LineWidth => info.line_width.to_bits().hash(state),
            Self::DepthBias => info.depth_bias.bits().hash(state),
            Self::BlendConstants => float_bits(info.blend_constants).hash(state),
            Self::DepthBounds => {
                float_bits([info.min_depth_bounds, info.max_depth_bounds]).hash(state);
            }
            Self::StencilCompareMask => {
                info.stencil_front.compare_mask.hash(state);
                info.stencil_back.compare_mask.hash(state);
            }
            Self::StencilWriteMask => {
                info.stencil_front.write_mask.hash(state);
                info.stencil_back.write_mask.hash(state);
            }
            Self::StencilReference => {
                info.stencil_front.reference.hash(state);
                info.stencil_back.reference.hash(state);
            }
            Self::CullMode => info.cull_mode.hash(state),
            Self::FrontFace => info.front_face.hash(state),
            Self::PrimitiveTopology => info.topology.hash(state),
            Self::ViewportCount => info.viewports.len().hash(state),
            Self::ScissorCount => info.scissors.len().hash(state),
            Self::DepthTestEnable => info.depth_test_enable.hash(state),
            Self::DepthWriteEnable => info.depth_write_enable.hash(state),
            Self::DepthCompareOp => info.depth_compare_op.hash(state),
            Self::DepthBoundsTestEnable => info.depth_bounds_test_enable.hash(state),
            Self::StencilTestEnable => info.stencil_test_enable.hash(state),
            Self::StencilOp => {
                info.stencil_front.ops().hash(state);
                info.stencil_back.ops().hash(state);
            }
            Self::RasterizerDiscardEnable => info.rasterizer_discard_enable.hash(state),
            Self::DepthBiasEnable => info.depth_bias_enable.hash(state),
            Self::PrimitiveRestartEnable => info.primitive_restart_enable.hash(state),
            Self::PatchControlPoints => info.patch_control_points.hash(state),
            Self::LogicOp => info.logic_op.hash(state),
            Self::VertexInput => info.vertex_format.hash(state),
            Self::ColorWriteMask => info.color_write_mask.hash(state),
        }
    }

    /// The Vulkan dynamic state that makes this kind settable at record time.
    pub fn to_vk(self) -> vk::DynamicState {
        match self {
            Self::Viewport => vk::DynamicState::VIEWPORT,
            Self::Scissor => vk::DynamicState::SCISSOR,
            Self::LineWidth => vk::DynamicState::LINE_WIDTH,
            Self::DepthBias => vk::DynamicState::DEPTH_BIAS,
            Self::BlendConstants => vk::DynamicState::BLEND_CONSTANTS,
            Self::DepthBounds => vk::DynamicState::DEPTH_BOUNDS,
            Self::StencilCompareMask => vk::DynamicState::STENCIL_COMPARE_MASK,
            Self::StencilWriteMask => vk::DynamicState::STENCIL_WRITE_MASK,
            Self::StencilReference => vk::DynamicState::STENCIL_REFERENCE,
            Self::CullMode => vk::DynamicState::CULL_MODE,
            Self::FrontFace => vk::DynamicState::FRONT_FACE,
            Self::PrimitiveTopology => vk::DynamicState::PRIMITIVE_TOPOLOGY,
            Self::ViewportCount => vk::DynamicState::VIEWPORT_WITH_COUNT,
            Self::ScissorCount => vk::DynamicState::SCISSOR_WITH_COUNT,
            Self::DepthTestEnable => vk::DynamicState::DEPTH_TEST_ENABLE,
            Self::DepthWriteEnable => vk::DynamicState::DEPTH_WRITE_ENABLE,
            Self::DepthCompareOp => vk::DynamicState::DEPTH_COMPARE_OP,
            Self::DepthBoundsTestEnable => vk::DynamicState::DEPTH_BOUNDS_TEST_ENABLE,
            Self::StencilTestEnable => vk::DynamicState::STENCIL_TEST_ENABLE,
            Self::StencilOp => vk::DynamicState::STENCIL_OP,
            Self::RasterizerDiscardEnable => vk::DynamicState::RASTERIZER_DISCARD_ENABLE,
            Self::DepthBiasEnable => vk::DynamicState::DEPTH_BIAS_ENABLE,
            Self::PrimitiveRestartEnable => vk::DynamicState::PRIMITIVE_RESTART_ENABLE,
            Self::PatchControlPoints => vk::DynamicState::PATCH_CONTROL_POINTS_EXT,
            Self::LogicOp => vk::DynamicState::LOGIC_OP_EXT,
            Self::VertexInput => vk::DynamicState::VERTEX_INPUT_EXT,
            Self::ColorWriteMask => vk::DynamicState::COLOR_WRITE_MASK_EXT,
        }
    }

    /// Emit the `vkCmdSet*` call for this state from `info`.
    ///
    /// Covers the core Vulkan 1.0 dynamic states; the extended states are left to the caller.
    ///
    /// # Safety
    /// `cmd` must be in the recording state and its pool must be locked by the caller.
    pub unsafe fn record(self, device: &dyn RawDevice, cmd: vk::CommandBuffer, info: &DynamicInfo) {
        // SAFETY: forwarded from the caller.
        unsafe {
            match self {
                Self::Viewport => {
                    let viewports: Vec<vk::Viewport> =
                        info.viewports.iter().map(Viewport::to_vk).collect();
                    if !viewports.is_empty() {
                        device.cmd_set_viewports(cmd, &viewports);
                    }
                }
                Self::Scissor => {
                    let scissors: Vec<vk::Rect2D> =
                        info.scissors.iter().map(Rect2D::to_vk).collect();
                    if !scissors.is_empty() {
                        device.cmd_set_scissors(cmd, &scissors);
                    }
                }
                Self::LineWidth => device.cmd_set_line_width(cmd, info.line_width),
                Self::DepthBias => device.cmd_set_depth_bias(
                    cmd,
                    info.depth_bias.constant_factor,
                    info.depth_bias.clamp,
                    info.depth_bias.slope_factor,
                ),
                Self::BlendConstants => device.cmd_set_blend_constants(cmd, &info.blend_constants),
                Self::DepthBounds => {
                    device.cmd_set_depth_bounds(cmd, info.min_depth_bounds, info.max_depth_bounds);
                }
                Self::StencilCompareMask => {
                    device.cmd_set_stencil_compare_mask(
                        cmd,
                        vk::StencilFaceFlags::FRONT,
                        info.stencil_front.compare_mask,
                    );
                    device.cmd_set_stencil_compare_mask(
                        cmd,
                        vk::StencilFaceFlags::BACK,
                        info.stencil_back.compare_mask,
                    );
                }
                Self::StencilWriteMask => {
                    device.cmd_set_stencil_write_mask(
                        cmd,
                        vk::StencilFaceFlags::FRONT,
                        info.stencil_front.write_mask,
                    );
                    device.cmd_set_stencil_write_mask(
                        cmd,
                        vk::StencilFaceFlags::BACK,
                        info.stencil_back.write_mask,
                    );
                }
                Self::StencilReference => {
                    device.cmd_set_stencil_reference(
                        cmd,
                        vk::StencilFaceFlags::FRONT,
                        info.stencil_front.reference,
                    );
                    device.cmd_set_stencil_reference(
                        cmd,
                        vk::StencilFaceFlags::BACK,
                        info.stencil_back.reference,
                    );
                }
                _ => {}
            }
        }
    }
}

/// A shader stage of a pipeline. The module is owned by the caller.
#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    pub entry: CString,
}

impl ShaderStage {
    /// A stage with the `main` entry point.
    pub fn new(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self {
            stage,
            module,
            entry: c"main".to_owned(),
        }
    }
}

/// Blending for one color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_factor: vk::BlendFactor,
    pub dst_color_factor: vk::BlendFactor,
    pub color_op: vk::BlendOp,
    pub src_alpha_factor: vk::BlendFactor,
    pub dst_alpha_factor: vk::BlendFactor,
    pub alpha_op: vk::BlendOp,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_factor: vk::BlendFactor::ONE,
            dst_color_factor: vk::BlendFactor::ZERO,
            color_op: vk::BlendOp::ADD,
            src_alpha_factor: vk::BlendFactor::ONE,
            dst_alpha_factor: vk::BlendFactor::ZERO,
            alpha_op: vk::BlendOp::ADD,
        }
    }
}

impl ColorBlendAttachment {
    /// Standard premultiplied-style alpha blending.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            src_alpha_factor: vk::BlendFactor::ONE,
            dst_alpha_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ..Self::default()
        }
    }
}

/// Full description of a graphics pipeline rendered with dynamic rendering.
#[derive(Debug, Clone)]
pub struct PipelineCreateInfo {
    pub stages: Vec<ShaderStage>,
    pub layout: vk::PipelineLayout,
    pub polygon_mode: vk::PolygonMode,
    pub depth_clamp_enable: bool,
    pub samples: vk::SampleCountFlags,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub stencil_format: Option<vk::Format>,
    /// Blend state per color attachment. Missing entries disable blending.
    pub blend_attachments: Vec<ColorBlendAttachment>,
    pub logic_op_enable: bool,
    /// Values of the fields that may be dynamic or vary between variants.
    pub dynamic: DynamicInfo,
    /// States set at record time instead of being baked into the pipeline.
    pub dynamic_states: Vec<DynamicState>,
}

impl Default for PipelineCreateInfo {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            layout: vk::PipelineLayout::null(),
            polygon_mode: vk::PolygonMode::FILL,
            depth_clamp_enable: false,
            samples: vk::SampleCountFlags::TYPE_1,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: None,
            stencil_format: None,
            blend_attachments: Vec::new(),
            logic_op_enable: false,
            dynamic: DynamicInfo::default(),
            dynamic_states: vec![DynamicState::Viewport, DynamicState::Scissor],
        }
    }
}

/// Creates and destroys native graphics pipelines.
///
/// # Safety
/// Implementations forward to the driver; see each method.
#[allow(clippy::missing_safety_doc)]
pub trait PipelineFactory: Send + Sync {
    /// Create a pipeline. With `base` set the pipeline is created as a derivative of it.
    ///
    /// Shader modules and the layout in `info` must be valid for the device.
    unsafe fn create_graphics_pipeline(
        &self,
        info: &PipelineCreateInfo,
        base: Option<vk::Pipeline>,
    ) -> Result<vk::Pipeline>;

    /// Destroy a pipeline no pending command buffer references.
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}

/// [`PipelineFactory`] backed by an `ash` device.
#[derive(Clone)]
pub struct AshPipelineFactory {
    device: ash::Device,
}

impl AshPipelineFactory {
    pub fn new(device: ash::Device) -> Self {
        Self { device }
    }

    /// Create a shader module from SPIR-V.
    ///
    /// # Safety
    /// The code must be valid SPIR-V.
    pub unsafe fn create_shader_module(&self, code: &[u32]) -> Result<vk::ShaderModule> {
        let info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&info, None) }
            .map_err(|e| GpuError::PipelineCreation(format!("Shader module: {e}")))
    }

    /// # Safety
    /// No pipeline creation may be using the module.
    pub unsafe fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    /// Create a pipeline layout.
    ///
    /// # Safety
    /// The set layouts must be valid.
    pub unsafe fn create_pipeline_layout(
        &self,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| GpuError::PipelineCreation(e.to_string()))
    }

    /// # Safety
    /// No live pipeline may use the layout.
    pub unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }
}

impl PipelineFactory for AshPipelineFactory {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    unsafe fn create_graphics_pipeline(
        &self,
        info: &PipelineCreateInfo,
        base: Option<vk::Pipeline>,
    ) -> Result<vk::Pipeline> {
        let d = &info.dynamic;
        let is_dynamic = |state: DynamicState| info.dynamic_states.contains(&state);

        // Shader stages
        let shader_stages: Vec<_> = info
            .stages
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage)
                    .module(s.module)
                    .name(&s.entry)
            })
            .collect();

        // Vertex input
        let bindings: Vec<_> = d
            .vertex_format
            .bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: b.input_rate,
            })
            .collect();
        let attributes: Vec<_> = d
            .vertex_format
            .attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        // Input assembly
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(d.topology)
            .primitive_restart_enable(d.primitive_restart_enable);

        let tessellation = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(d.patch_control_points);

        // Viewports: fully dynamic, count-only or baked
        let viewports: Vec<vk::Viewport> = d.viewports.iter().map(Viewport::to_vk).collect();
        let scissors: Vec<vk::Rect2D> = d.scissors.iter().map(Rect2D::to_vk).collect();
        let mut viewport_state = vk::PipelineViewportStateCreateInfo::default();
        if !is_dynamic(DynamicState::ViewportCount) {
            viewport_state = if is_dynamic(DynamicState::Viewport) {
                viewport_state.viewport_count(viewports.len().max(1) as u32)
            } else {
                viewport_state.viewports(&viewports)
            };
        }
        if !is_dynamic(DynamicState::ScissorCount) {
            viewport_state = if is_dynamic(DynamicState::Scissor) {
                viewport_state.scissor_count(scissors.len().max(1) as u32)
            } else {
                viewport_state.scissors(&scissors)
            };
        }

        // Rasterization
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(info.depth_clamp_enable)
            .rasterizer_discard_enable(d.rasterizer_discard_enable)
            .polygon_mode(info.polygon_mode)
            .cull_mode(d.cull_mode)
            .front_face(d.front_face)
            .depth_bias_enable(d.depth_bias_enable)
            .depth_bias_constant_factor(d.depth_bias.constant_factor)
            .depth_bias_clamp(d.depth_bias.clamp)
            .depth_bias_slope_factor(d.depth_bias.slope_factor)
            .line_width(d.line_width);

        // Multisampling
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(info.samples)
            .sample_shading_enable(false);

        // Depth stencil
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(d.depth_test_enable)
            .depth_write_enable(d.depth_write_enable)
            .depth_compare_op(d.depth_compare_op)
            .depth_bounds_test_enable(d.depth_bounds_test_enable)
            .stencil_test_enable(d.stencil_test_enable)
            .front(d.stencil_front.to_vk())
            .back(d.stencil_back.to_vk())
            .min_depth_bounds(d.min_depth_bounds)
            .max_depth_bounds(d.max_depth_bounds);

        // Color blending
        let color_blend_attachments: Vec<_> = (0..info.color_formats.len())
            .map(|i| {
                let blend = info.blend_attachments.get(i).copied().unwrap_or_default();
                let mask = d
                    .color_write_mask
                    .get(i)
                    .copied()
                    .unwrap_or(vk::ColorComponentFlags::RGBA);
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(blend.blend_enable)
                    .src_color_blend_factor(blend.src_color_factor)
                    .dst_color_blend_factor(blend.dst_color_factor)
                    .color_blend_op(blend.color_op)
                    .src_alpha_blend_factor(blend.src_alpha_factor)
                    .dst_alpha_blend_factor(blend.dst_alpha_factor)
                    .alpha_blend_op(blend.alpha_op)
                    .color_write_mask(mask)
            })
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(info.logic_op_enable)
            .logic_op(d.logic_op)
            .attachments(&color_blend_attachments)
            .blend_constants(d.blend_constants);

        // Dynamic state
        let dynamic_states: Vec<_> = info.dynamic_states.iter().map(|s| s.to_vk()).collect();
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        // Dynamic rendering info (Vulkan 1.3)
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&info.color_formats);
        if let Some(depth_format) = info.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }
        if let Some(stencil_format) = info.stencil_format {
            rendering_info = rendering_info.stencil_attachment_format(stencil_format);
        }

        let flags = match base {
            Some(_) => vk::PipelineCreateFlags::DERIVATIVE,
            None => vk::PipelineCreateFlags::ALLOW_DERIVATIVES,
        };

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .flags(flags)
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(info.layout)
            .base_pipeline_handle(base.unwrap_or_default())
            .base_pipeline_index(-1)
            .push_next(&mut rendering_info);

        let tessellated = info
            .stages
            .iter()
            .any(|s| s.stage.contains(vk::ShaderStageFlags::TESSELLATION_CONTROL));
        if tessellated {
            pipeline_info = pipeline_info.tessellation_state(&tessellation);
        }

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

        Ok(pipelines[0])
    }

    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }
}
