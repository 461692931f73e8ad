//! Resource loading through the upload lane.

mod common;

use std::thread;

use glam::{Vec2, Vec3};
use image::DynamicImage;
use rstest::rstest;

use common::{camera, flat_shader, triangle_mesh, TestContext, FRAGMENT_SOURCE, VERTEX_SOURCE};
use lilium_render::backend::{DummyBackend, Rect, ResourceKind};
use lilium_render::resources::AttribData;
use lilium_render::{
    DrawOutcome, Mesh, MeshData, Object, RendererConfig, Shader, ShaderData, SkipReason, Texture,
    TextureData,
};

const VIEW: Rect = Rect::from_size(64, 64);

fn wait_mesh(ctx: &TestContext, mesh: &Mesh) {
    let (done, loaded) = crossbeam_channel::bounded(1);
    ctx.renderer.load_mesh(mesh, Some(done)).unwrap();
    loaded.recv().unwrap();
}

#[test]
fn test_concurrent_loads_upload_once() {
    let ctx = TestContext::new();
    let mut data = MeshData::new();
    data.set_vertices(vec![Vec3::ZERO, Vec3::X, Vec3::Y]);
    let mesh = Mesh::new(data);

    thread::scope(|scope| {
        for _ in 0..8 {
            let renderer = ctx.renderer.clone();
            let mesh = mesh.clone();
            scope.spawn(move || {
                let (done, loaded) = crossbeam_channel::bounded(1);
                renderer.load_mesh(&mesh, Some(done)).unwrap();
                loaded.recv().unwrap();
            });
        }
    });

    let rec = ctx.recorder.lock();
    assert_eq!(rec.count_calls("create_buffer"), 1);
    assert_eq!(rec.buffer_uploads().len(), 1);
    assert!(mesh.read().is_loaded());
}

#[test]
fn test_loaded_mesh_releases_source_data() {
    let ctx = TestContext::new();
    let mesh = triangle_mesh();
    wait_mesh(&ctx, &mesh);

    let data = mesh.read();
    assert!(data.is_loaded());
    assert!(!data.is_changed());
    assert!(data.vertices.is_empty());
    assert_eq!(data.vertex_count(), 3);
}

#[test]
fn test_keep_data_on_load() {
    let ctx = TestContext::new();
    let mesh = triangle_mesh();
    mesh.write().keep_data_on_load = true;
    wait_mesh(&ctx, &mesh);

    assert_eq!(mesh.read().vertices.len(), 3);
}

#[test]
fn test_reload_uploads_only_changed_slices() {
    let ctx = TestContext::new();
    let mesh = triangle_mesh();
    wait_mesh(&ctx, &mesh);
    assert_eq!(ctx.recorder.lock().buffer_uploads().len(), 2);

    mesh.write()
        .set_vertices(vec![Vec3::ZERO, Vec3::Y, Vec3::Z, Vec3::X]);
    wait_mesh(&ctx, &mesh);

    let rec = ctx.recorder.lock();
    assert_eq!(rec.buffer_uploads().len(), 3);
    assert_eq!(rec.count_calls("create_buffer"), 2);
    assert_eq!(mesh.read().vertex_count(), 4);
}

#[test]
fn test_removed_slices_release_their_buffers() {
    let ctx = TestContext::new();
    let mesh = triangle_mesh();
    {
        let mut data = mesh.write();
        data.add_texcoords(vec![Vec2::ZERO; 3]);
        data.add_texcoords(vec![Vec2::ONE; 3]);
        data.set_attribute("Weight", AttribData::Float(vec![1.0; 3]));
    }
    wait_mesh(&ctx, &mesh);
    assert_eq!(ctx.recorder.lock().live_count(ResourceKind::Mesh), 5);

    {
        let mut data = mesh.write();
        data.remove_attribute("Weight");
        data.texcoords.truncate(1);
    }
    wait_mesh(&ctx, &mesh);
    assert_eq!(ctx.renderer.pending_frees(), 2);

    let object = Object::new(flat_shader("flat")).with_mesh(mesh.clone());
    ctx.renderer.draw(VIEW, &object, &camera()).unwrap();
    ctx.frame();

    let rec = ctx.recorder.lock();
    assert_eq!(rec.live_count(ResourceKind::Mesh), 3);
    let bound: Vec<_> = rec
        .calls()
        .iter()
        .filter(|c| c.name == "bind_attribute")
        .map(|c| c.args.clone())
        .collect();
    assert!(bound.iter().any(|args| args.contains(" TexCoord0 ")));
    assert!(!bound.iter().any(|args| args.contains(" TexCoord1 ")));
    assert!(!bound.iter().any(|args| args.contains(" Weight ")));
}

#[test]
fn test_zero_vertex_mesh_is_skipped() {
    let ctx = TestContext::new();
    let object = Object::new(flat_shader("flat")).with_mesh(Mesh::new(MeshData::new()));

    let outcome = ctx.renderer.draw(VIEW, &object, &camera()).unwrap();
    assert_eq!(outcome, DrawOutcome::Skipped(SkipReason::EmptyMesh));

    ctx.frame();
    assert_eq!(ctx.count_calls("create_buffer"), 0);
    assert_eq!(ctx.count_calls("draw"), 0);
}

#[rstest]
#[case::vertex("BROKEN void main() {}", FRAGMENT_SOURCE, "flat | Vertex shader errors:")]
#[case::fragment(VERTEX_SOURCE, "BROKEN void main() {}", "flat | Fragment shader errors:")]
fn test_shader_compile_error(
    #[case] vertex: &str,
    #[case] fragment: &str,
    #[case] expected: &str,
) {
    let ctx = TestContext::with_backend(
        DummyBackend::new().with_compile_error_marker("BROKEN"),
        RendererConfig::default(),
    );
    let shader = Shader::new(ShaderData::new("flat", vertex, fragment));
    let object = Object::new(shader.clone()).with_mesh(triangle_mesh());

    let outcome = ctx.renderer.draw(VIEW, &object, &camera()).unwrap();
    assert_eq!(outcome, DrawOutcome::Skipped(SkipReason::ShaderError));
    assert!(shader.read().error().starts_with(expected));
    assert_eq!(ctx.count_calls("link_program"), 0);
    assert_eq!(ctx.count_calls("compile_shader"), 2);

    // A failed shader is never rebuilt.
    let outcome = ctx.renderer.draw(VIEW, &object, &camera()).unwrap();
    assert_eq!(outcome, DrawOutcome::Skipped(SkipReason::ShaderError));
    assert_eq!(ctx.count_calls("compile_shader"), 2);
}

#[test]
fn test_shader_link_error() {
    let ctx = TestContext::with_backend(
        DummyBackend::new().with_link_failure(),
        RendererConfig::default(),
    );
    let shader = flat_shader("lit");
    let (done, built) = crossbeam_channel::bounded(1);
    ctx.renderer.load_shader(&shader, Some(done)).unwrap();
    built.recv().unwrap();

    let data = shader.read();
    assert!(data.has_error());
    assert!(!data.is_loaded());
    assert!(data.error().starts_with("lit | Linking shader:\n"));
    assert_eq!(ctx.count_calls("delete_shader"), 2);
    assert_eq!(ctx.recorder.lock().live_count(ResourceKind::Shader), 0);
}

#[test]
fn test_linked_shader_draws() {
    let ctx = TestContext::new();
    let object = Object::new(flat_shader("flat")).with_mesh(triangle_mesh());

    let outcome = ctx.renderer.draw(VIEW, &object, &camera()).unwrap();
    assert_eq!(outcome, DrawOutcome::Submitted);
    let stats = ctx.frame();
    assert_eq!(stats.draws, 1);

    let rec = ctx.recorder.lock();
    assert_eq!(rec.count_calls("draw"), 1);
    assert!(rec
        .calls()
        .iter()
        .any(|c| c.name == "bind_attribute" && c.args.contains(" Vertex ")));
    assert!(rec
        .calls()
        .iter()
        .any(|c| c.name == "set_uniform" && c.args.contains(" MVP ")));
}

#[rstest]
#[case::npot_resampled(false, (100, 30), (128, 32))]
#[case::npot_supported(true, (100, 30), (100, 30))]
#[case::already_pot(false, (64, 16), (64, 16))]
fn test_texture_upload_size(
    #[case] npot: bool,
    #[case] source: (u32, u32),
    #[case] expected: (u32, u32),
) {
    let caps = lilium_render::DeviceCapabilities {
        npot_textures: npot,
        ..Default::default()
    };
    let ctx = TestContext::with_backend(DummyBackend::with_capabilities(caps), RendererConfig::default());
    let texture = Texture::new(TextureData::from_image(DynamicImage::new_rgb8(
        source.0, source.1,
    )));

    let (done, loaded) = crossbeam_channel::bounded(1);
    ctx.renderer.load_texture(&texture, Some(done)).unwrap();
    loaded.recv().unwrap();

    assert_eq!(texture.read().native_size(), Some(expected));
    let rec = ctx.recorder.lock();
    let (_, storage, had_pixels) = rec.texture_uploads()[0];
    assert_eq!((storage.width, storage.height), expected);
    assert!(had_pixels);
}

#[test]
fn test_dropped_resources_freed_next_frame() {
    let mut ctx = TestContext::new();
    let mesh = triangle_mesh();
    wait_mesh(&ctx, &mesh);
    assert_eq!(ctx.recorder.lock().live_count(ResourceKind::Mesh), 2);
    // Lets the render thread release its handle on the mesh.
    ctx.frame();

    drop(mesh);
    assert_eq!(ctx.renderer.pending_frees(), 2);
    let stats = ctx.frame();
    assert_eq!(stats.freed_handles, 2);
    assert_eq!(ctx.recorder.lock().live_count(ResourceKind::Mesh), 0);
    assert_eq!(ctx.renderer.pending_frees(), 0);
    ctx.shutdown();
}

#[test]
fn test_drops_after_shutdown_are_not_queued() {
    let mut ctx = TestContext::new();
    let mesh = triangle_mesh();
    wait_mesh(&ctx, &mesh);
    ctx.frame();
    ctx.shutdown();

    drop(mesh);
    assert_eq!(ctx.renderer.pending_frees(), 0);
    // Still allocated: the handles leak with the stopped context.
    assert_eq!(ctx.recorder.lock().live_count(ResourceKind::Mesh), 2);
}

#[test]
fn test_recycled_mesh_reuses_capacity() {
    let ctx = TestContext::new();
    let pools = ctx.renderer.pools();
    let mut data = pools.meshes.acquire();
    data.set_vertices(vec![Vec3::ONE; 16]);
    data.keep_data_on_load = true;
    let mesh = Mesh::new(data);
    wait_mesh(&ctx, &mesh);
    ctx.frame();

    mesh.recycle(&pools.meshes);
    let data = pools.meshes.acquire();
    assert!(data.vertices.is_empty());
    assert!(!data.is_loaded());
    assert!(data.vertices.capacity() >= 16);

    // The buffer of the recycled mesh is queued for deletion.
    assert_eq!(ctx.renderer.pending_frees(), 1);
}
