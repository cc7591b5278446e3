use ash::vk;

fn same_viewport(a: &vk::Viewport, b: &vk::Viewport) -> bool {
    a.x == b.x
        && a.y == b.y
        && a.width == b.width
        && a.height == b.height
        && a.min_depth == b.min_depth
        && a.max_depth == b.max_depth
}

fn same_rect(a: &vk::Rect2D, b: &vk::Rect2D) -> bool {
    a.offset.x == b.offset.x && a.offset.y == b.offset.y && a.extent.width == b.extent.width && a.extent.height == b.extent.height
}

/// Dynamic state last recorded into a command buffer. Each setter returns whether the value changed and the command
/// must be recorded.
#[derive(Debug, Default, Clone)]
pub(crate) struct DynamicStateCache {
    viewport: Option<vk::Viewport>,
    scissor: Option<vk::Rect2D>,
    stencil_reference: Option<u32>,
    graphics_pipeline: Option<vk::Pipeline>,
    compute_pipeline: Option<vk::Pipeline>,
}

impl DynamicStateCache {
    pub fn set_viewport(&mut self, viewport: &vk::Viewport) -> bool {
        if self.viewport.as_ref().map_or(false, |old| same_viewport(old, viewport)) {
            return false;
        }
        self.viewport = Some(*viewport);
        true
    }

    pub fn set_scissor(&mut self, scissor: &vk::Rect2D) -> bool {
        if self.scissor.as_ref().map_or(false, |old| same_rect(old, scissor)) {
            return false;
        }
        self.scissor = Some(*scissor);
        true
    }

    pub fn set_stencil_reference(&mut self, reference: u32) -> bool {
        if self.stencil_reference == Some(reference) {
            return false;
        }
        self.stencil_reference = Some(reference);
        true
    }

    pub fn bind_pipeline(&mut self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) -> bool {
        let slot = if bind_point == vk::PipelineBindPoint::COMPUTE {
            &mut self.compute_pipeline
        } else {
            &mut self.graphics_pipeline
        };
        if *slot == Some(pipeline) {
            return false;
        }
        *slot = Some(pipeline);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_state_is_filtered() {
        let mut cache = DynamicStateCache::default();
        let viewport = vk::Viewport {
            width: 64.0,
            height: 64.0,
            max_depth: 1.0,
            ..Default::default()
        };
        assert!(cache.set_viewport(&viewport));
        assert!(!cache.set_viewport(&viewport));
        assert!(cache.set_stencil_reference(3));
        assert!(!cache.set_stencil_reference(3));
        assert!(cache.set_stencil_reference(4));
        let pipeline = vk::Pipeline::null();
        assert!(cache.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline));
        // Compute and graphics pipelines are tracked separately.
        assert!(cache.bind_pipeline(vk::PipelineBindPoint::COMPUTE, pipeline));
        assert!(!cache.bind_pipeline(vk::PipelineBindPoint::GRAPHICS, pipeline));
    }
}
