//! Render pass and draw commands.
//!
//! # Usage
//!
//! ```ignore
//! let mut pass = encoder.begin_render_pass(&RenderPassBegin {
//!     render_pass,
//!     framebuffer,
//!     render_area,
//!     clear_values: &[clear],
//! });
//! pass.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
//! pass.draw_mesh(&mesh);
//! pass.end();
//! ```

use std::ops::{Deref, DerefMut, Range};

use ash::vk;

use crate::{backend::RenderPassBegin, buffer::Buffer, resource::Mesh, utils::AsVkHandle};

use super::{CommandEncoder, RenderPassState};

impl<'a> CommandEncoder<'a> {
    /// Begins a render pass. Pending barriers are emitted first.
    ///
    /// Returns a [`RenderPass`] for recording draws. Call [`RenderPass::end`] before the
    /// recording closure returns.
    pub fn begin_render_pass<'this>(
        &'this mut self,
        begin: &RenderPassBegin,
    ) -> RenderPass<'this, 'a> {
        assert!(
            !self.inside_renderpass(),
            "Render passes cannot be nested"
        );
        self.emit_barriers();
        self.buffer
            .pool
            .device
            .cmd_begin_render_pass(self.buffer.buffer, begin);
        self.render_pass_state = RenderPassState::InsideRenderPass {
            render_area: begin.render_area,
            pipeline: None,
        };
        RenderPass { encoder: self }
    }

    /// Resumes the render pass that is already active on this encoder, if any.
    pub fn continue_render_pass<'this>(&'this mut self) -> Option<RenderPass<'this, 'a>> {
        if self.inside_renderpass() {
            Some(RenderPass { encoder: self })
        } else {
            None
        }
    }
}

/// An active render pass.
///
/// `RenderPass` implements `Deref<Target = CommandEncoder>`.
pub struct RenderPass<'a, 'b> {
    encoder: &'a mut CommandEncoder<'b>,
}
impl<'a, 'b> Deref for RenderPass<'a, 'b> {
    type Target = CommandEncoder<'b>;

    fn deref(&self) -> &Self::Target {
        self.encoder
    }
}
impl<'a, 'b> DerefMut for RenderPass<'a, 'b> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.encoder
    }
}

impl RenderPass<'_, '_> {
    /// Binds a pipeline for subsequent draw commands. Binding the pipeline that is already
    /// bound records nothing.
    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        let RenderPassState::InsideRenderPass {
            pipeline: bound, ..
        } = &mut self.encoder.render_pass_state
        else {
            unreachable!()
        };
        if *bound == Some(pipeline) {
            return;
        }
        *bound = Some(pipeline);
        self.encoder.buffer.pool.device.cmd_bind_pipeline(
            self.encoder.buffer.buffer,
            bind_point,
            pipeline,
        );
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Buffer) {
        self.encoder.buffer.pool.device.cmd_bind_vertex_buffer(
            self.encoder.buffer.buffer,
            binding,
            buffer.vk_handle(),
            0,
        );
    }

    /// Binds an index buffer for indexed drawing.
    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) {
        self.encoder.buffer.pool.device.cmd_bind_index_buffer(
            self.encoder.buffer.buffer,
            buffer.vk_handle(),
            0,
            index_type,
        );
    }

    /// Draws indexed primitives using the bound index buffer.
    pub fn draw_indexed(
        &mut self,
        index_range: Range<u32>,
        instance_range: Range<u32>,
        vertex_offset: i32,
    ) {
        self.encoder.buffer.pool.device.cmd_draw_indexed(
            self.encoder.buffer.buffer,
            index_range.end - index_range.start,
            instance_range.end - instance_range.start,
            index_range.start,
            vertex_offset,
            instance_range.start,
        );
    }

    /// Binds the buffers of `mesh` at binding 0 and draws all of its indices once.
    pub fn draw_mesh(&mut self, mesh: &Mesh) {
        self.bind_vertex_buffer(0, mesh.vertex_buffer());
        self.bind_index_buffer(mesh.index_buffer(), vk::IndexType::UINT32);
        self.draw_indexed(0..mesh.index_count(), 0..1, 0);
    }

    /// Ends the current render pass.
    pub fn end(self) {
        self.encoder
            .buffer
            .pool
            .device
            .cmd_end_render_pass(self.encoder.buffer.buffer);
        self.encoder.render_pass_state = RenderPassState::OutsideRenderPass;
    }

    pub fn render_area(&self) -> vk::Rect2D {
        match self.encoder.render_pass_state {
            RenderPassState::InsideRenderPass { render_area, .. } => render_area,
            RenderPassState::OutsideRenderPass => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk::Handle;

    use super::*;
    use crate::{
        Device,
        backend::{
            Backend, Submission,
            mock::{MockBackend, MockCommand},
        },
        command::CommandPool,
    };

    #[test]
    fn test_redundant_pipeline_bind_skipped() {
        let mock = Arc::new(MockBackend::new());
        let device = Device::new(mock.clone());
        let mut pool = CommandPool::new(device, 0).unwrap();
        let mut cb = pool.alloc().unwrap();
        pool.begin(&mut cb).unwrap();
        let pipeline = vk::Pipeline::from_raw(77);
        let render_area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
        };
        pool.record(&mut cb, |encoder| {
            let mut pass = encoder.begin_render_pass(&RenderPassBegin {
                render_pass: vk::RenderPass::from_raw(5),
                framebuffer: vk::Framebuffer::from_raw(6),
                render_area,
                clear_values: &[],
            });
            assert_eq!(pass.render_area(), render_area);
            pass.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
            pass.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline);
            pass.end();
            assert!(!encoder.inside_renderpass());
        });
        pool.finish(&mut cb).unwrap();

        let queue = mock.get_queue(0, 0);
        mock.queue_submit(
            queue,
            &Submission {
                command_buffer: cb.vk_handle(),
                wait: None,
                signal: None,
                fence: None,
            },
        )
        .unwrap();
        mock.queue_wait_idle(queue).unwrap();
        let binds = mock.submissions()[0]
            .commands
            .iter()
            .filter(|c| matches!(c, MockCommand::BindPipeline { .. }))
            .count();
        assert_eq!(binds, 1);
        pool.free(cb);
    }
}
