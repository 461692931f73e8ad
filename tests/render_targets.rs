//! Render-to-texture creation, use and teardown.

mod common;

use rstest::rstest;

use common::{camera, flat_shader, triangle_object, TestContext};
use lilium_render::backend::{
    DummyBackend, FramebufferStatus, Rect, ResourceKind, TextureFilter, TextureFormat,
};
use lilium_render::{
    DrawOutcome, Object, RenderError, RenderTargetConfig, RendererConfig, SkipReason, Texture,
};

const VIEW: Rect = Rect::from_size(64, 64);

fn live(ctx: &TestContext, kind: ResourceKind) -> usize {
    ctx.recorder.lock().live_count(kind)
}

#[rstest]
#[case::color(|t: Texture| RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, Some(t)))]
#[case::depth(|t: Texture| RenderTargetConfig::new(64, 64).with_depth(TextureFormat::Depth24, Some(t)))]
#[case::stencil(|t: Texture| {
    RenderTargetConfig::new(64, 64)
        .with_depth(TextureFormat::Depth24, None)
        .with_stencil(TextureFormat::Stencil8, Some(t))
})]
#[case::depth_stencil(|t: Texture| RenderTargetConfig::new(64, 64).with_depth_stencil(Some(t)))]
fn test_feedback_loop_rejected(#[case] config: fn(Texture) -> RenderTargetConfig) {
    let ctx = TestContext::new();
    let destination = Texture::empty();
    let target = ctx
        .renderer
        .render_to_texture(config(destination.clone()))
        .unwrap();
    let object = triangle_object().with_texture(destination.clone());

    let err = target.draw(VIEW, &object, &camera()).unwrap_err();
    assert_eq!(err, RenderError::FeedbackLoop(destination.id().raw()));
    assert!(err.is_fatal());

    // The main canvas may sample it.
    let outcome = ctx.renderer.draw(VIEW, &object, &camera()).unwrap();
    assert_eq!(outcome, DrawOutcome::Submitted);
}

#[test]
fn test_feedback_loop_reported_before_skips() {
    let ctx = TestContext::new();
    let color = Texture::empty();
    let target = ctx
        .renderer
        .render_to_texture(
            RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, Some(color.clone())),
        )
        .unwrap();
    let meshless = Object::new(flat_shader("flat")).with_texture(color.clone());

    let err = target.draw(Rect::from_size(0, 0), &meshless, &camera()).unwrap_err();
    assert_eq!(err, RenderError::FeedbackLoop(color.id().raw()));
}

#[test]
fn test_depth_only_target() {
    let ctx = TestContext::new();
    let target = ctx
        .renderer
        .render_to_texture(RenderTargetConfig::new(32, 32).with_depth(TextureFormat::Depth16, None))
        .unwrap();
    assert_eq!(target.target_size(), Some((32, 32)));

    let rec = ctx.recorder.lock();
    let renderbuffers: Vec<_> = rec
        .calls()
        .iter()
        .filter(|c| c.name == "create_renderbuffer")
        .map(|c| c.args.clone())
        .collect();
    assert_eq!(renderbuffers.len(), 1);
    assert!(renderbuffers[0].contains("Depth16"));
    assert_eq!(rec.count_calls("create_texture"), 0);

    let draw_buffers = rec
        .calls()
        .iter()
        .find(|c| c.name == "set_draw_buffers")
        .map(|c| c.args.clone())
        .unwrap();
    assert!(draw_buffers.ends_with("color=false"));
}

#[rstest]
#[case::canvas_first(true)]
#[case::texture_first(false)]
fn test_teardown_order(#[case] canvas_first: bool) {
    let ctx = TestContext::new();
    let color = Texture::empty();
    let target = ctx
        .renderer
        .render_to_texture(
            RenderTargetConfig::new(64, 64)
                .with_color(TextureFormat::Rgba8, Some(color.clone()))
                .with_depth(TextureFormat::Depth24, None),
        )
        .unwrap();
    ctx.frame();
    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 1);
    assert_eq!(live(&ctx, ResourceKind::Renderbuffer), 1);
    assert_eq!(live(&ctx, ResourceKind::Texture), 1);

    if canvas_first {
        drop(target);
        ctx.frame();
        // The destination texture keeps the framebuffer.
        assert_eq!(live(&ctx, ResourceKind::Framebuffer), 1);
        drop(color);
    } else {
        drop(color);
        ctx.frame();
        assert!(!target.is_alive());
        let outcome = target.draw(VIEW, &triangle_object(), &camera()).unwrap();
        assert_eq!(outcome, DrawOutcome::Skipped(SkipReason::TargetReleased));
        target.clear(VIEW, [1.0; 4]).unwrap();
        drop(target);
    }
    ctx.frame();

    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 0);
    assert_eq!(live(&ctx, ResourceKind::Renderbuffer), 0);
    assert_eq!(live(&ctx, ResourceKind::Texture), 0);
    assert_eq!(ctx.count_calls("clear"), 0);
}

#[test]
fn test_any_destination_keeps_target_alive() {
    let ctx = TestContext::new();
    let color = Texture::empty();
    let depth = Texture::empty();
    let target = ctx
        .renderer
        .render_to_texture(
            RenderTargetConfig::new(16, 16)
                .with_color(TextureFormat::Rgba8, Some(color.clone()))
                .with_depth(TextureFormat::Depth24, Some(depth.clone())),
        )
        .unwrap();
    ctx.frame();

    drop(color);
    ctx.frame();
    assert!(target.is_alive());
    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 1);

    drop(depth);
    ctx.frame();
    assert!(!target.is_alive());
    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 0);
}

#[test]
fn test_renderbuffer_target_owned_by_canvas() {
    let ctx = TestContext::new();
    let target = ctx
        .renderer
        .render_to_texture(
            RenderTargetConfig::new(16, 16)
                .with_color(TextureFormat::Rgba8, None)
                .with_depth_stencil(None),
        )
        .unwrap();
    let clone = target.clone();
    ctx.frame();
    assert_eq!(live(&ctx, ResourceKind::Renderbuffer), 2);

    drop(target);
    ctx.frame();
    assert!(clone.is_alive());
    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 1);

    drop(clone);
    ctx.frame();
    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 0);
    assert_eq!(live(&ctx, ResourceKind::Renderbuffer), 0);
}

#[test]
fn test_incomplete_framebuffer_is_fatal() {
    let ctx = TestContext::with_backend(
        DummyBackend::new().with_framebuffer_status(FramebufferStatus::Incomplete(0x8cd6)),
        RendererConfig::default(),
    );
    let color = Texture::empty();
    let err = ctx
        .renderer
        .render_to_texture(
            RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, Some(color.clone())),
        )
        .unwrap_err();
    assert_eq!(err, RenderError::IncompleteFramebuffer(0x8cd6));
    assert!(err.is_fatal());

    ctx.frame();
    assert_eq!(live(&ctx, ResourceKind::Framebuffer), 0);
    assert!(!color.read().is_loaded());
    assert_eq!(color.read().render_target(), None);
}

#[test]
fn test_driver_rejected_formats_are_soft() {
    let ctx = TestContext::with_backend(
        DummyBackend::new().with_framebuffer_status(FramebufferStatus::Unsupported),
        RendererConfig::default(),
    );
    let err = ctx
        .renderer
        .render_to_texture(RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, None))
        .unwrap_err();
    assert!(matches!(err, RenderError::UnsupportedTarget(_)));
    assert!(!err.is_fatal());
}

#[rstest]
#[case::no_outputs(RenderTargetConfig::new(64, 64), true)]
#[case::empty_bounds(RenderTargetConfig::new(0, 64).with_color(TextureFormat::Rgba8, None), true)]
#[case::unsupported_color(RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba32Float, None), false)]
#[case::too_many_samples(RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, None).with_samples(16), false)]
fn test_invalid_configurations(#[case] config: RenderTargetConfig, #[case] fatal: bool) {
    let ctx = TestContext::new();
    let err = ctx.renderer.render_to_texture(config).unwrap_err();
    assert_eq!(err.is_fatal(), fatal);
    assert_eq!(ctx.count_calls("create_framebuffer"), 0);
}

#[test]
fn test_texture_joins_one_target_only() {
    let ctx = TestContext::new();
    let color = Texture::empty();
    let config = RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, Some(color));
    let _first = ctx.renderer.render_to_texture(config.clone()).unwrap();

    let err = ctx.renderer.render_to_texture(config).unwrap_err();
    assert!(matches!(err, RenderError::InvalidTargetConfig(_)));
}

#[test]
fn test_render_to_texture_then_sample() {
    let ctx = TestContext::new();
    let color = Texture::empty();
    color
        .write()
        .set_filters(TextureFilter::LinearMipmapLinear, TextureFilter::Linear);
    let target = ctx
        .renderer
        .render_to_texture(
            RenderTargetConfig::new(64, 64).with_color(TextureFormat::Rgba8, Some(color.clone())),
        )
        .unwrap();
    assert_eq!(color.read().render_target(), target.target_id());
    assert_eq!(color.read().native_size(), Some((64, 64)));

    target.clear(VIEW, [0.0, 1.0, 0.0, 1.0]).unwrap();
    assert_eq!(
        target.draw(VIEW, &triangle_object(), &camera()).unwrap(),
        DrawOutcome::Submitted
    );
    assert_eq!(target.render().unwrap(), None);

    let sampled = triangle_object().with_texture(color.clone());
    ctx.renderer.draw(VIEW, &sampled, &camera()).unwrap();
    let stats = ctx.frame();
    assert_eq!(stats.draws, 2);

    let rec = ctx.recorder.lock();
    assert_eq!(rec.count_calls("generate_mipmaps"), 1);
    assert_eq!(rec.bound().framebuffer, None);
    assert!(rec
        .calls()
        .iter()
        .any(|c| c.name == "set_uniform" && c.args.contains(" Texture0 ")));
}
