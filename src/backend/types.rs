//! Common types shared between the engine and native backends

use bitflags::bitflags;

/// Integer rectangle in framebuffer pixels, origin at the bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A rectangle covering `width` x `height` starting at the origin.
    pub const fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Empty rectangles make clears and draws a no-op.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Kind of native resource, one free list exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Mesh,
    Shader,
    Texture,
    Framebuffer,
    Renderbuffer,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Mesh,
        ResourceKind::Shader,
        ResourceKind::Texture,
        ResourceKind::Framebuffer,
        ResourceKind::Renderbuffer,
    ];
}

/// Pipeline features toggled with enable/disable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Blend,
    DepthTest,
    StencilTest,
    CullFace,
    ScissorTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend factors for the RGB and alpha channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendFunc {
    pub src_rgb: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
}

impl BlendFunc {
    /// Same factors for color and alpha.
    pub const fn uniform(src: BlendFactor, dst: BlendFactor) -> Self {
        Self {
            src_rgb: src,
            dst_rgb: dst,
            src_alpha: src,
            dst_alpha: dst,
        }
    }

    pub fn is_uniform(&self) -> bool {
        self.src_rgb == self.src_alpha && self.dst_rgb == self.dst_alpha
    }
}

impl Default for BlendFunc {
    fn default() -> Self {
        Self::uniform(BlendFactor::One, BlendFactor::Zero)
    }
}

/// Blend equations for the RGB and alpha channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendEquations {
    pub rgb: BlendEquation,
    pub alpha: BlendEquation,
}

impl BlendEquations {
    pub const fn uniform(equation: BlendEquation) -> Self {
        Self {
            rgb: equation,
            alpha: equation,
        }
    }

    pub fn is_uniform(&self) -> bool {
        self.rgb == self.alpha
    }
}

impl Default for BlendEquations {
    fn default() -> Self {
        Self::uniform(BlendEquation::Add)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    Increment,
    IncrementWrap,
    Decrement,
    DecrementWrap,
    Invert,
}

/// Polygon face addressed by a stencil call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    Front,
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
    FrontAndBack,
}

/// Stencil comparison: function, reference value and read mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilTest {
    pub func: CompareFunction,
    pub reference: i32,
    pub read_mask: u32,
}

impl Default for StencilTest {
    fn default() -> Self {
        Self {
            func: CompareFunction::Always,
            reference: 0,
            read_mask: u32::MAX,
        }
    }
}

/// Stencil operations for fail, depth-fail and depth-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilOps {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub depth_pass: StencilOp,
}

/// Complete stencil configuration for one polygon face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFace {
    pub test: StencilTest,
    pub ops: StencilOps,
    pub write_mask: u32,
}

impl Default for StencilFace {
    fn default() -> Self {
        Self {
            test: StencilTest::default(),
            ops: StencilOps::default(),
            write_mask: u32::MAX,
        }
    }
}

bitflags! {
    /// Color channels enabled for writing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWrites: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

impl Default for ColorWrites {
    fn default() -> Self {
        Self::ALL
    }
}

bitflags! {
    /// Buffers cleared by a clear call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearBuffers: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Storage format of textures and renderbuffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Rgb8,
    Rgba16Float,
    Rgba32Float,
    Depth16,
    Depth24,
    Depth32,
    Depth24Stencil8,
    Stencil8,
    Stencil16,
}

impl TextureFormat {
    pub fn is_color(&self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8
                | TextureFormat::Rgb8
                | TextureFormat::Rgba16Float
                | TextureFormat::Rgba32Float
        )
    }

    pub fn has_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth16
                | TextureFormat::Depth24
                | TextureFormat::Depth32
                | TextureFormat::Depth24Stencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth24Stencil8 | TextureFormat::Stencil8 | TextureFormat::Stencil16
        )
    }

    /// Formats that carry both depth and stencil in one attachment.
    pub fn is_combined_depth_stencil(&self) -> bool {
        self.has_depth() && self.has_stencil()
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Stencil8 => 1,
            TextureFormat::Depth16 | TextureFormat::Stencil16 => 2,
            TextureFormat::Rgb8 => 3,
            TextureFormat::Rgba8
            | TextureFormat::Depth24
            | TextureFormat::Depth32
            | TextureFormat::Depth24Stencil8 => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Framebuffer attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    Color0,
    Depth,
    Stencil,
    DepthStencil,
}

/// Result of a framebuffer completeness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    /// The combination of attachment formats is not supported by the driver.
    Unsupported,
    /// Any other incompleteness, carrying the native status code.
    Incomplete(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    Vertex,
    Index,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    Nearest,
    #[default]
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    NearestMipmapLinear,
    LinearMipmapLinear,
}

impl TextureFilter {
    pub fn is_mipmapped(&self) -> bool {
        !matches!(self, TextureFilter::Nearest | TextureFilter::Linear)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    MirroredRepeat,
}

/// Sampling parameters applied to a texture object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SamplerParams {
    pub min_filter: TextureFilter,
    pub mag_filter: TextureFilter,
    pub wrap_u: WrapMode,
    pub wrap_v: WrapMode,
}

/// Storage description for a texture upload or allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureStorage {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub samples: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Value bound to a named shader uniform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Vec2(glam::Vec2),
    Vec3(glam::Vec3),
    Vec4(glam::Vec4),
    Mat4(glam::Mat4),
    /// Texture unit index for a sampler uniform.
    Sampler(u32),
}

/// An error code reported by the native API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub code: u32,
    pub message: String,
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "native error 0x{:04x}: {}", self.code, self.message)
    }
}

/// Capabilities advertised by a native backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub vendor: String,
    pub renderer: String,
    /// Major and minor version of the native API.
    pub version: (u32, u32),
    /// Major and minor version of the shading language.
    pub shading_language_version: (u32, u32),
    pub occlusion_query: bool,
    pub npot_textures: bool,
    pub framebuffer_objects: bool,
    pub max_texture_size: u32,
    pub max_samples: u32,
    pub color_formats: Vec<TextureFormat>,
    pub depth_formats: Vec<TextureFormat>,
    pub stencil_formats: Vec<TextureFormat>,
}

impl DeviceCapabilities {
    /// Version of the native API as `major.minor`.
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.version.0, self.version.1)
    }

    /// Version of the shading language as `major.minor`.
    pub fn shading_language_version_string(&self) -> String {
        format!(
            "{}.{}",
            self.shading_language_version.0, self.shading_language_version.1
        )
    }

    pub fn supports_color_format(&self, format: TextureFormat) -> bool {
        self.color_formats.contains(&format)
    }

    pub fn supports_depth_format(&self, format: TextureFormat) -> bool {
        self.depth_formats.contains(&format)
    }

    pub fn supports_stencil_format(&self, format: TextureFormat) -> bool {
        self.stencil_formats.contains(&format)
    }
}

impl Default for DeviceCapabilities {
    fn default() -> Self {
        Self {
            vendor: String::from("unknown"),
            renderer: String::from("unknown"),
            version: (2, 0),
            shading_language_version: (1, 10),
            occlusion_query: true,
            npot_textures: false,
            framebuffer_objects: true,
            max_texture_size: 4096,
            max_samples: 4,
            color_formats: vec![TextureFormat::Rgba8, TextureFormat::Rgb8],
            depth_formats: vec![
                TextureFormat::Depth16,
                TextureFormat::Depth24,
                TextureFormat::Depth24Stencil8,
            ],
            stencil_formats: vec![TextureFormat::Stencil8, TextureFormat::Depth24Stencil8],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_empty() {
        assert!(Rect::new(0, 0, 0, 10).is_empty());
        assert!(Rect::new(5, 5, 10, 0).is_empty());
        assert!(!Rect::from_size(1, 1).is_empty());
    }

    #[test]
    fn test_combined_depth_stencil() {
        assert!(TextureFormat::Depth24Stencil8.is_combined_depth_stencil());
        assert!(!TextureFormat::Depth16.is_combined_depth_stencil());
        assert!(!TextureFormat::Stencil8.is_combined_depth_stencil());
        assert!(TextureFormat::Rgba8.is_color());
    }

    #[test]
    fn test_version_strings() {
        let caps = DeviceCapabilities {
            version: (3, 3),
            shading_language_version: (3, 30),
            ..Default::default()
        };
        assert_eq!(caps.version_string(), "3.3");
        assert_eq!(caps.shading_language_version_string(), "3.30");
    }

    #[test]
    fn test_blend_func_uniform() {
        let func = BlendFunc::uniform(BlendFactor::SrcAlpha, BlendFactor::OneMinusSrcAlpha);
        assert!(func.is_uniform());
        let split = BlendFunc {
            src_alpha: BlendFactor::One,
            ..func
        };
        assert!(!split.is_uniform());
    }
}
