//! Pipeline state cache
//!
//! [`GraphicsStateCache`] mirrors the state last submitted to the native
//! backend and elides calls that would not change it. Every state-changing
//! call made by the render thread goes through the cache, so the mirror is
//! always the last *submitted* state, never a requested-but-unsubmitted one.
//!
//! With elision disabled the cache issues every call unconditionally, which
//! must produce the same bound state.

use crate::backend::{
    BlendEquations, BlendFunc, ColorWrites, CompareFunction, CullMode, Face, Feature,
    FramebufferHandle, NativeBackend, ProgramHandle, Rect, StencilFace, StencilOps, StencilTest,
};

/// Snapshot of the bound pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineState {
    pub framebuffer: Option<FramebufferHandle>,
    pub program: Option<ProgramHandle>,
    pub viewport: Rect,
    pub scissor_test: bool,
    pub scissor: Rect,
    pub blend: bool,
    pub blend_color: [f32; 4],
    pub blend_func: BlendFunc,
    pub blend_equations: BlendEquations,
    pub depth_test: bool,
    pub depth_func: CompareFunction,
    pub depth_write: bool,
    pub stencil_test: bool,
    pub stencil_front: StencilFace,
    pub stencil_back: StencilFace,
    pub cull: bool,
    pub cull_face: Face,
    pub color_writes: ColorWrites,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: i32,
}

impl Default for PipelineState {
    /// The state of a freshly created context.
    fn default() -> Self {
        Self {
            framebuffer: None,
            program: None,
            viewport: Rect::default(),
            scissor_test: false,
            scissor: Rect::default(),
            blend: false,
            blend_color: [0.0; 4],
            blend_func: BlendFunc::default(),
            blend_equations: BlendEquations::default(),
            depth_test: false,
            depth_func: CompareFunction::Less,
            depth_write: true,
            stencil_test: false,
            stencil_front: StencilFace::default(),
            stencil_back: StencilFace::default(),
            cull: false,
            cull_face: Face::Back,
            color_writes: ColorWrites::ALL,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }
}

impl PipelineState {
    /// The cull mode described by the cull flag and face.
    pub fn cull_mode(&self) -> CullMode {
        if !self.cull {
            return CullMode::None;
        }
        match self.cull_face {
            Face::Front => CullMode::Front,
            Face::Back => CullMode::Back,
            Face::FrontAndBack => CullMode::FrontAndBack,
        }
    }
}

/// Counters of issued and elided native state calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub issued: u64,
    pub elided: u64,
}

/// Returns `true` when the native call must be issued, updating the slot.
fn diff<T: PartialEq>(elide: bool, stats: &mut CacheStats, slot: &mut T, value: T) -> bool {
    if elide && *slot == value {
        stats.elided += 1;
        return false;
    }
    *slot = value;
    stats.issued += 1;
    true
}

/// Diff a front/back pair, collapsing to one call when both faces agree.
#[allow(clippy::too_many_arguments)]
fn diff_faces<T: PartialEq + Copy>(
    elide: bool,
    stats: &mut CacheStats,
    backend: &mut dyn NativeBackend,
    front_slot: &mut T,
    back_slot: &mut T,
    front: T,
    back: T,
    issue: fn(&mut dyn NativeBackend, Face, T),
) {
    let front_dirty = !elide || *front_slot != front;
    let back_dirty = !elide || *back_slot != back;
    if !front_dirty && !back_dirty {
        stats.elided += 1;
        return;
    }

    *front_slot = front;
    *back_slot = back;
    if front == back {
        issue(backend, Face::FrontAndBack, front);
        stats.issued += 1;
        return;
    }
    if front_dirty {
        issue(backend, Face::Front, front);
        stats.issued += 1;
    }
    if back_dirty {
        issue(backend, Face::Back, back);
        stats.issued += 1;
    }
}

/// Mirror of the bound pipeline state with redundant-call elision.
#[derive(Debug, Clone)]
pub struct GraphicsStateCache {
    bound: PipelineState,
    elide: bool,
    stats: CacheStats,
}

impl GraphicsStateCache {
    /// Create a cache assuming a freshly created context.
    pub fn new(elide: bool) -> Self {
        Self {
            bound: PipelineState::default(),
            elide,
            stats: CacheStats::default(),
        }
    }

    /// The last state submitted to the backend.
    pub fn bound(&self) -> &PipelineState {
        &self.bound
    }

    pub fn elides(&self) -> bool {
        self.elide
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Return and reset the call counters.
    pub fn take_stats(&mut self) -> CacheStats {
        std::mem::take(&mut self.stats)
    }

    /// Replace the mirror without issuing native calls.
    ///
    /// Used when something outside the engine changed the context state
    /// and the real state has been read back.
    pub fn assume(&mut self, state: PipelineState) {
        self.bound = state;
    }

    pub fn bind_framebuffer(
        &mut self,
        backend: &mut dyn NativeBackend,
        framebuffer: Option<FramebufferHandle>,
    ) {
        if diff(self.elide, &mut self.stats, &mut self.bound.framebuffer, framebuffer) {
            backend.bind_framebuffer(framebuffer);
        }
    }

    pub fn use_program(&mut self, backend: &mut dyn NativeBackend, program: Option<ProgramHandle>) {
        if diff(self.elide, &mut self.stats, &mut self.bound.program, program) {
            backend.use_program(program);
        }
    }

    pub fn set_viewport(&mut self, backend: &mut dyn NativeBackend, rect: Rect) {
        if diff(self.elide, &mut self.stats, &mut self.bound.viewport, rect) {
            backend.viewport(rect);
        }
    }

    /// Enable scissoring to `rect`, or disable it with `None`.
    pub fn set_scissor(&mut self, backend: &mut dyn NativeBackend, rect: Option<Rect>) {
        self.set_feature(backend, Feature::ScissorTest, rect.is_some());
        if let Some(rect) = rect {
            if diff(self.elide, &mut self.stats, &mut self.bound.scissor, rect) {
                backend.scissor(rect);
            }
        }
    }

    pub fn set_feature(&mut self, backend: &mut dyn NativeBackend, feature: Feature, enabled: bool) {
        let slot = match feature {
            Feature::Blend => &mut self.bound.blend,
            Feature::DepthTest => &mut self.bound.depth_test,
            Feature::StencilTest => &mut self.bound.stencil_test,
            Feature::CullFace => &mut self.bound.cull,
            Feature::ScissorTest => &mut self.bound.scissor_test,
        };
        if diff(self.elide, &mut self.stats, slot, enabled) {
            backend.set_feature(feature, enabled);
        }
    }

    pub fn set_blend_color(&mut self, backend: &mut dyn NativeBackend, color: [f32; 4]) {
        if diff(self.elide, &mut self.stats, &mut self.bound.blend_color, color) {
            backend.blend_color(color);
        }
    }

    /// Set blend factors, using the single-call form when RGB and alpha agree.
    pub fn set_blend_func(&mut self, backend: &mut dyn NativeBackend, func: BlendFunc) {
        if diff(self.elide, &mut self.stats, &mut self.bound.blend_func, func) {
            if func.is_uniform() {
                backend.blend_func(func.src_rgb, func.dst_rgb);
            } else {
                backend.blend_func_separate(func);
            }
        }
    }

    /// Set blend equations, using the single-call form when RGB and alpha agree.
    pub fn set_blend_equations(&mut self, backend: &mut dyn NativeBackend, equations: BlendEquations) {
        if diff(self.elide, &mut self.stats, &mut self.bound.blend_equations, equations) {
            if equations.is_uniform() {
                backend.blend_equation(equations.rgb);
            } else {
                backend.blend_equation_separate(equations);
            }
        }
    }

    pub fn set_depth_func(&mut self, backend: &mut dyn NativeBackend, func: CompareFunction) {
        if diff(self.elide, &mut self.stats, &mut self.bound.depth_func, func) {
            backend.depth_func(func);
        }
    }

    pub fn set_depth_write(&mut self, backend: &mut dyn NativeBackend, write: bool) {
        if diff(self.elide, &mut self.stats, &mut self.bound.depth_write, write) {
            backend.depth_mask(write);
        }
    }

    pub fn set_color_writes(&mut self, backend: &mut dyn NativeBackend, mask: ColorWrites) {
        if diff(self.elide, &mut self.stats, &mut self.bound.color_writes, mask) {
            backend.color_mask(mask);
        }
    }

    /// Set the stencil configuration of both faces.
    ///
    /// Function, operations and write mask are diffed independently; each
    /// collapses to one native call when front and back agree.
    pub fn set_stencil(
        &mut self,
        backend: &mut dyn NativeBackend,
        front: StencilFace,
        back: StencilFace,
    ) {
        diff_faces(
            self.elide,
            &mut self.stats,
            backend,
            &mut self.bound.stencil_front.test,
            &mut self.bound.stencil_back.test,
            front.test,
            back.test,
            |b: &mut dyn NativeBackend, face: Face, test: StencilTest| b.stencil_func(face, test),
        );
        diff_faces(
            self.elide,
            &mut self.stats,
            backend,
            &mut self.bound.stencil_front.ops,
            &mut self.bound.stencil_back.ops,
            front.ops,
            back.ops,
            |b: &mut dyn NativeBackend, face: Face, ops: StencilOps| b.stencil_op(face, ops),
        );
        diff_faces(
            self.elide,
            &mut self.stats,
            backend,
            &mut self.bound.stencil_front.write_mask,
            &mut self.bound.stencil_back.write_mask,
            front.write_mask,
            back.write_mask,
            |b: &mut dyn NativeBackend, face: Face, mask: u32| b.stencil_mask(face, mask),
        );
    }

    pub fn set_cull_mode(&mut self, backend: &mut dyn NativeBackend, mode: CullMode) {
        let face = match mode {
            CullMode::None => {
                self.set_feature(backend, Feature::CullFace, false);
                return;
            }
            CullMode::Front => Face::Front,
            CullMode::Back => Face::Back,
            CullMode::FrontAndBack => Face::FrontAndBack,
        };
        self.set_feature(backend, Feature::CullFace, true);
        if diff(self.elide, &mut self.stats, &mut self.bound.cull_face, face) {
            backend.cull_face(face);
        }
    }

    pub fn set_clear_color(&mut self, backend: &mut dyn NativeBackend, color: [f32; 4]) {
        if diff(self.elide, &mut self.stats, &mut self.bound.clear_color, color) {
            backend.clear_color(color);
        }
    }

    pub fn set_clear_depth(&mut self, backend: &mut dyn NativeBackend, depth: f32) {
        if diff(self.elide, &mut self.stats, &mut self.bound.clear_depth, depth) {
            backend.clear_depth(depth);
        }
    }

    pub fn set_clear_stencil(&mut self, backend: &mut dyn NativeBackend, stencil: i32) {
        if diff(self.elide, &mut self.stats, &mut self.bound.clear_stencil, stencil) {
            backend.clear_stencil(stencil);
        }
    }

    /// Bring the backend to `state`, issuing only the calls that differ.
    pub fn apply(&mut self, backend: &mut dyn NativeBackend, state: &PipelineState) {
        self.bind_framebuffer(backend, state.framebuffer);
        self.use_program(backend, state.program);
        self.set_viewport(backend, state.viewport);
        if state.scissor_test {
            self.set_scissor(backend, Some(state.scissor));
        } else {
            self.set_scissor(backend, None);
            if diff(self.elide, &mut self.stats, &mut self.bound.scissor, state.scissor) {
                backend.scissor(state.scissor);
            }
        }
        self.set_feature(backend, Feature::Blend, state.blend);
        self.set_blend_color(backend, state.blend_color);
        self.set_blend_func(backend, state.blend_func);
        self.set_blend_equations(backend, state.blend_equations);
        self.set_feature(backend, Feature::DepthTest, state.depth_test);
        self.set_depth_func(backend, state.depth_func);
        self.set_depth_write(backend, state.depth_write);
        self.set_feature(backend, Feature::StencilTest, state.stencil_test);
        self.set_stencil(backend, state.stencil_front, state.stencil_back);
        if diff(self.elide, &mut self.stats, &mut self.bound.cull_face, state.cull_face) {
            backend.cull_face(state.cull_face);
        }
        self.set_feature(backend, Feature::CullFace, state.cull);
        self.set_color_writes(backend, state.color_writes);
        self.set_clear_color(backend, state.clear_color);
        self.set_clear_depth(backend, state.clear_depth);
        self.set_clear_stencil(backend, state.clear_stencil);
    }
}

impl Default for GraphicsStateCache {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use crate::backend::{BlendEquation, BlendFactor, DummyBackend, StencilOp};

    #[test]
    fn test_redundant_call_is_elided() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(true);

        cache.set_depth_func(&mut backend, CompareFunction::LessEqual);
        cache.set_depth_func(&mut backend, CompareFunction::LessEqual);

        assert_eq!(backend.recorder().count_calls("depth_func"), 1);
        assert_eq!(cache.stats().issued, 1);
        assert_eq!(cache.stats().elided, 1);
    }

    #[test]
    fn test_no_elision_mode_always_issues() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(false);

        cache.set_depth_write(&mut backend, true);
        cache.set_depth_write(&mut backend, true);

        assert_eq!(backend.recorder().count_calls("depth_mask"), 2);
    }

    #[test]
    fn test_symmetric_stencil_collapses_to_one_call() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(true);
        let face = StencilFace {
            ops: StencilOps {
                fail: StencilOp::Keep,
                depth_fail: StencilOp::Keep,
                depth_pass: StencilOp::Replace,
            },
            ..Default::default()
        };

        cache.set_stencil(&mut backend, face, face);

        let recorder = backend.recorder();
        assert_eq!(recorder.count_calls("stencil_op"), 1);
        assert_eq!(recorder.bound().stencil_front, face);
        assert_eq!(recorder.bound().stencil_back, face);
    }

    #[test]
    fn test_asymmetric_stencil_uses_two_calls() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(true);
        let front = StencilFace {
            write_mask: 0x0f,
            ..Default::default()
        };
        let back = StencilFace {
            write_mask: 0xf0,
            ..Default::default()
        };

        cache.set_stencil(&mut backend, front, back);

        let recorder = backend.recorder();
        assert_eq!(recorder.count_calls("stencil_mask"), 2);
        assert_eq!(recorder.bound().stencil_front.write_mask, 0x0f);
        assert_eq!(recorder.bound().stencil_back.write_mask, 0xf0);
    }

    #[test]
    fn test_blend_func_separate_keeps_alpha_factors() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(true);
        let func = BlendFunc {
            src_rgb: BlendFactor::SrcAlpha,
            dst_rgb: BlendFactor::OneMinusSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::OneMinusSrcAlpha,
        };

        cache.set_blend_func(&mut backend, func);
        cache.set_blend_equations(&mut backend, BlendEquations::uniform(BlendEquation::Max));

        let recorder = backend.recorder();
        assert_eq!(recorder.count_calls("blend_func_separate"), 1);
        assert_eq!(recorder.bound().blend_func, func);
        assert_eq!(recorder.count_calls("blend_equation"), 1);
    }

    #[test]
    fn test_cull_none_only_disables() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(true);

        cache.set_cull_mode(&mut backend, CullMode::Front);
        cache.set_cull_mode(&mut backend, CullMode::None);

        assert_eq!(cache.bound().cull_mode(), CullMode::None);
        assert_eq!(cache.bound().cull_face, Face::Front);
        assert_eq!(backend.recorder().bound().cull_mode(), CullMode::None);
    }

    #[test]
    fn test_apply_restores_snapshot() {
        let mut backend = DummyBackend::new();
        let mut cache = GraphicsStateCache::new(true);
        let snapshot = *cache.bound();

        cache.set_feature(&mut backend, Feature::Blend, true);
        cache.set_scissor(&mut backend, Some(Rect::new(1, 2, 3, 4)));
        cache.set_clear_color(&mut backend, [1.0, 0.0, 0.0, 1.0]);
        cache.apply(&mut backend, &snapshot);

        assert_eq!(*cache.bound(), snapshot);
        assert!(!backend.recorder().bound().blend);
        assert_eq!(backend.recorder().bound().clear_color, [0.0; 4]);
    }
}
