//! Resource loading.
//!
//! Loading is split in two halves. The caller half runs on any thread: it
//! decides under the resource's write lock whether an upload is needed,
//! registers the completion signal and submits at most one upload command
//! per resource at a time. The render-thread half performs the upload,
//! clears the change flags, optionally releases the source data and
//! signals every registered waiter.
//!
//! Completion signals are single-slot channels. Signalling never blocks:
//! when the slot is already full the signal is dropped.

use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use image::imageops::{self, FilterType};

use crate::backend::{
    BackendResult, BufferHandle, BufferTarget, DeviceCapabilities, NativeBackend, ShaderStage,
    TextureFormat, TextureStorage,
};
use crate::command::{CommandQueue, RenderCommand, RenderContext};
use crate::error::RenderResult;
use crate::finalizer::DeferredFinalizer;
use crate::resources::{
    Mesh, MeshChanges, MeshData, NativeMesh, NativeProgram, NativeTexture, PendingLoad, Shader,
    Texture, TextureChanges, TextureData,
};

/// Signal a completion slot without blocking.
pub(crate) fn signal(done: &Sender<()>) {
    match done.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
    }
}

fn signal_all(waiters: Vec<Sender<()>>) {
    for done in &waiters {
        signal(done);
    }
}

/// Outcome of the caller-side check.
enum Schedule {
    /// Nothing to upload; the signal has been sent.
    Ready,
    /// An upload is already queued; the signal was registered with it.
    Joined,
    /// A new upload command must be submitted.
    Submit,
}

fn schedule(pending: &mut PendingLoad, up_to_date: bool, done: Option<Sender<()>>) -> Schedule {
    if up_to_date {
        if let Some(done) = done {
            signal(&done);
        }
        return Schedule::Ready;
    }
    if let Some(done) = done {
        pending.waiters.push(done);
    }
    if pending.queued {
        return Schedule::Joined;
    }
    pending.queued = true;
    Schedule::Submit
}

/// Submit the upload command, undoing the bookkeeping if the render thread is gone.
fn submit(
    queue: &CommandQueue,
    command: RenderCommand,
    rollback: impl FnOnce() -> Vec<Sender<()>>,
) -> RenderResult<()> {
    if let Err(err) = queue.submit(command) {
        signal_all(rollback());
        return Err(err);
    }
    Ok(())
}

/// Ensure a mesh's current data is uploaded.
///
/// An unloaded mesh without vertices has nothing to upload; it stays
/// unloaded and completion is signalled right away.
pub fn load_mesh(queue: &CommandQueue, mesh: &Mesh, done: Option<Sender<()>>) -> RenderResult<()> {
    let mut data = mesh.write();
    let up_to_date =
        (data.loaded && !data.is_changed()) || (!data.loaded && data.vertices.is_empty());
    match schedule(&mut data.pending, up_to_date, done) {
        Schedule::Ready | Schedule::Joined => return Ok(()),
        Schedule::Submit => {}
    }
    drop(data);

    let target = mesh.clone();
    let command = RenderCommand::new("load_mesh", move |ctx| upload_mesh(ctx, &target));
    submit(queue, command, || mesh.write().pending.complete())
}

/// Ensure a texture's current data is uploaded.
pub fn load_texture(
    queue: &CommandQueue,
    texture: &Texture,
    done: Option<Sender<()>>,
) -> RenderResult<()> {
    let mut data = texture.write();
    let up_to_date = (data.loaded && !data.is_changed()) || (!data.loaded && data.source.is_none());
    match schedule(&mut data.pending, up_to_date, done) {
        Schedule::Ready | Schedule::Joined => return Ok(()),
        Schedule::Submit => {}
    }
    drop(data);

    let target = texture.clone();
    let command = RenderCommand::new("load_texture", move |ctx| upload_texture(ctx, &target));
    submit(queue, command, || texture.write().pending.complete())
}

/// Ensure a shader is compiled and linked.
///
/// A shader that failed before is never retried; completion is signalled
/// immediately and the error stays on the shader.
pub fn load_shader(
    queue: &CommandQueue,
    shader: &Shader,
    done: Option<Sender<()>>,
) -> RenderResult<()> {
    let mut data = shader.write();
    let up_to_date = data.has_error() || (data.loaded && !data.changed);
    match schedule(&mut data.pending, up_to_date, done) {
        Schedule::Ready | Schedule::Joined => return Ok(()),
        Schedule::Submit => {}
    }
    drop(data);

    let target = shader.clone();
    let command = RenderCommand::new("load_shader", move |ctx| upload_shader(ctx, &target));
    submit(queue, command, || shader.write().pending.complete())
}

// Render thread

fn upload_mesh(ctx: &mut RenderContext, mesh: &Mesh) {
    let mut guard = mesh.write();
    let data: &mut MeshData = &mut guard;
    let waiters = data.pending.complete();

    if data.loaded && !data.is_changed() {
        drop(guard);
        signal_all(waiters);
        return;
    }

    match upload_mesh_data(ctx, data) {
        Ok(bytes) => {
            data.clear_changes();
            data.loaded = true;
            if !data.keep_data_on_load {
                data.release_data();
            }
            log::debug!("Uploaded mesh {} ({} bytes)", mesh.id().raw(), bytes);
        }
        Err(err) => log::error!("Mesh {} upload failed: {}", mesh.id().raw(), err),
    }
    drop(guard);
    signal_all(waiters);
}

/// Upload one changed slice, creating, reusing or dropping its buffer.
fn upload_slice(
    backend: &mut dyn NativeBackend,
    finalizer: &DeferredFinalizer,
    slot: &mut Option<BufferHandle>,
    target: BufferTarget,
    bytes: &[u8],
) -> BackendResult<usize> {
    if bytes.is_empty() {
        if let Some(buffer) = slot.take() {
            finalizer.queue_free(buffer);
        }
        return Ok(0);
    }
    let buffer = match *slot {
        Some(buffer) => buffer,
        None => {
            let buffer = backend.create_buffer()?;
            *slot = Some(buffer);
            buffer
        }
    };
    backend.upload_buffer(buffer, target, bytes);
    Ok(bytes.len())
}

fn upload_mesh_data(ctx: &mut RenderContext, data: &mut MeshData) -> BackendResult<usize> {
    let backend = ctx.backend.as_mut();
    let finalizer = ctx.finalizer.as_ref();
    let MeshData {
        indices,
        vertices,
        colors,
        normals,
        barycentric,
        texcoords,
        attributes,
        changes,
        native,
        ..
    } = data;
    let native = native.get_or_insert_with(|| NativeMesh::new(Arc::clone(&ctx.finalizer)));
    let mut total = 0;

    let fixed: [(MeshChanges, BufferTarget, &[u8], &mut Option<BufferHandle>); 5] = [
        (
            MeshChanges::INDICES,
            BufferTarget::Index,
            bytemuck::cast_slice(indices.as_slice()),
            &mut native.indices,
        ),
        (
            MeshChanges::VERTICES,
            BufferTarget::Vertex,
            bytemuck::cast_slice(vertices.as_slice()),
            &mut native.vertices,
        ),
        (
            MeshChanges::COLORS,
            BufferTarget::Vertex,
            bytemuck::cast_slice(colors.as_slice()),
            &mut native.colors,
        ),
        (
            MeshChanges::NORMALS,
            BufferTarget::Vertex,
            bytemuck::cast_slice(normals.as_slice()),
            &mut native.normals,
        ),
        (
            MeshChanges::BARYCENTRIC,
            BufferTarget::Vertex,
            bytemuck::cast_slice(barycentric.as_slice()),
            &mut native.barycentric,
        ),
    ];
    for (flag, target, bytes, slot) in fixed {
        if changes.contains(flag) {
            total += upload_slice(backend, finalizer, slot, target, bytes)?;
        }
    }
    if changes.contains(MeshChanges::VERTICES) {
        native.vertex_count = vertices.len() as u32;
    }
    if changes.contains(MeshChanges::INDICES) {
        native.index_count = indices.len() as u32;
    }

    let kept_sets = texcoords.len().min(native.texcoords.len());
    for buffer in native.texcoords.drain(kept_sets..).flatten() {
        finalizer.queue_free(buffer);
    }
    native.texcoords.resize(texcoords.len(), None);
    for (set, slot) in texcoords.iter().zip(native.texcoords.iter_mut()) {
        if set.changed {
            total += upload_slice(
                backend,
                finalizer,
                slot,
                BufferTarget::Vertex,
                bytemuck::cast_slice(set.slice.as_slice()),
            )?;
        }
    }

    native.attributes.retain(|name, (buffer, _)| {
        let kept = attributes.contains_key(name);
        if !kept {
            finalizer.queue_free(*buffer);
        }
        kept
    });
    for (name, attr) in attributes.iter() {
        if !attr.changed {
            continue;
        }
        let mut slot = native.attributes.get(name).map(|(buffer, _)| *buffer);
        total += upload_slice(
            backend,
            finalizer,
            &mut slot,
            BufferTarget::Vertex,
            attr.data.as_bytes(),
        )?;
        match slot {
            Some(buffer) => {
                native
                    .attributes
                    .insert(name.clone(), (buffer, attr.data.components()));
            }
            None => {
                native.attributes.remove(name);
            }
        }
    }

    Ok(total)
}

fn upload_texture(ctx: &mut RenderContext, texture: &Texture) {
    let mut guard = texture.write();
    let data: &mut TextureData = &mut guard;
    let waiters = data.pending.complete();

    if data.loaded && !data.is_changed() {
        drop(guard);
        signal_all(waiters);
        return;
    }

    match upload_texture_data(ctx, data) {
        Ok(()) => {
            data.changes = TextureChanges::empty();
            data.loaded = true;
            if !data.keep_data_on_load {
                data.source = None;
            }
            log::debug!(
                "Uploaded texture {} ({:?})",
                texture.id().raw(),
                data.native_size()
            );
        }
        Err(err) => log::error!("Texture {} upload failed: {}", texture.id().raw(), err),
    }
    drop(guard);
    signal_all(waiters);
}

fn upload_texture_data(ctx: &mut RenderContext, data: &mut TextureData) -> BackendResult<()> {
    let backend = ctx.backend.as_mut();
    let first_upload = data.native.is_none();
    let handle = match &data.native {
        Some(native) => native.handle,
        None => backend.create_texture()?,
    };
    let mut size = data.native.as_ref().map_or((0, 0), |n| (n.width, n.height));

    if first_upload || data.changes.contains(TextureChanges::PIXELS) {
        if let Some(source) = &data.source {
            let (width, height, pixels) = normalize_image(source, &ctx.capabilities);
            let storage = TextureStorage {
                width,
                height,
                format: TextureFormat::Rgba8,
                samples: 1,
            };
            backend.upload_texture(handle, &storage, Some(&pixels));
            size = (width, height);
        }
    }
    if first_upload || data.changes.contains(TextureChanges::SAMPLER) {
        backend.set_sampler_params(handle, &data.sampler);
    }
    if data.sampler.min_filter.is_mipmapped() {
        backend.generate_mipmaps(handle);
    }

    match data.native.as_mut() {
        Some(native) => {
            native.width = size.0;
            native.height = size.1;
        }
        None => {
            data.native = Some(NativeTexture::new(
                handle,
                size.0,
                size.1,
                Arc::clone(&ctx.finalizer),
            ));
        }
    }
    Ok(())
}

/// Convert a source image to tightly packed RGBA8, resampling to power-of-two
/// dimensions when the device requires them.
pub(crate) fn normalize_image(
    source: &image::DynamicImage,
    caps: &DeviceCapabilities,
) -> (u32, u32, Vec<u8>) {
    let mut rgba = source.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut target = (width, height);
    if !caps.npot_textures {
        target = (nearest_power_of_two(width), nearest_power_of_two(height));
    }
    if caps.max_texture_size > 0 {
        let limit = if caps.npot_textures {
            caps.max_texture_size
        } else {
            prev_power_of_two(caps.max_texture_size)
        };
        target = (target.0.min(limit), target.1.min(limit));
    }
    if target != (width, height) {
        log::debug!(
            "Resampling texture {}x{} to {}x{}",
            width,
            height,
            target.0,
            target.1
        );
        rgba = imageops::resize(&rgba, target.0, target.1, FilterType::Triangle);
    }
    (target.0, target.1, rgba.into_raw())
}

/// Closest power of two, rounding ties up.
pub(crate) fn nearest_power_of_two(n: u32) -> u32 {
    if n <= 1 {
        return 1;
    }
    if n.is_power_of_two() {
        return n;
    }
    let below = prev_power_of_two(n);
    let above = below.saturating_mul(2);
    if n - below < above - n {
        below
    } else {
        above
    }
}

fn prev_power_of_two(n: u32) -> u32 {
    if n == 0 {
        return 0;
    }
    1 << (31 - n.leading_zeros())
}

fn upload_shader(ctx: &mut RenderContext, shader: &Shader) {
    let mut data = shader.write();
    let waiters = data.pending.complete();

    if data.has_error() || (data.loaded && !data.changed) {
        drop(data);
        signal_all(waiters);
        return;
    }

    let backend = ctx.backend.as_mut();
    let vertex = backend.compile_shader(ShaderStage::Vertex, &data.vertex);
    let fragment = backend.compile_shader(ShaderStage::Fragment, &data.fragment);

    let mut log = String::new();
    let program = match (vertex, fragment) {
        (Ok(vertex), Ok(fragment)) => {
            let linked = backend.link_program(vertex, fragment);
            backend.delete_shader(vertex);
            backend.delete_shader(fragment);
            match linked {
                Ok(program) => Some(program),
                Err(link_log) => {
                    log.push_str(&format!("{} | Linking shader:\n{}\n", data.name, link_log));
                    None
                }
            }
        }
        (vertex, fragment) => {
            for (stage, result) in [(ShaderStage::Vertex, vertex), (ShaderStage::Fragment, fragment)] {
                match result {
                    Ok(handle) => backend.delete_shader(handle),
                    Err(compile_log) => log.push_str(&format!(
                        "{} | {:?} shader errors:\n{}\n",
                        data.name, stage, compile_log
                    )),
                }
            }
            None
        }
    };

    match program {
        Some(program) => {
            data.native = Some(NativeProgram::new(program, Arc::clone(&ctx.finalizer)));
            data.loaded = true;
            data.changed = false;
            if !data.keep_data_on_load {
                data.vertex = Vec::new();
                data.fragment = Vec::new();
            }
            log::debug!("Linked shader '{}'", data.name);
        }
        None => {
            log::warn!("Shader '{}' failed to build:\n{}", data.name, log);
            data.error.push_str(&log);
        }
    }
    drop(data);
    signal_all(waiters);
}
