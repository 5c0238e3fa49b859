use std::sync::Arc;

use anyhow::Result;
use ash::vk;

use crate::{device::Device, resource::Texture};

/// What happens to an attachment's previous contents when a render pass
/// begins. `Preserve` turns the attachment into a graph read in addition to
/// its write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentInitialization {
    Clear,
    Preserve,
    Discard,
}

impl AttachmentInitialization {
    fn load_op(self) -> vk::AttachmentLoadOp {
        match self {
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
            Self::Preserve => vk::AttachmentLoadOp::LOAD,
            Self::Discard => vk::AttachmentLoadOp::DONT_CARE,
        }
    }

    fn initial_layout(self, layout: vk::ImageLayout) -> vk::ImageLayout {
        match self {
            Self::Preserve => layout,
            _ => vk::ImageLayout::UNDEFINED,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ColorAttachmentDescriptor {
    pub format: vk::Format,
    pub initialization: AttachmentInitialization,
    /// Layout the image is left in after the pass; presentable targets use
    /// `PRESENT_SRC_KHR`, sampled targets `SHADER_READ_ONLY_OPTIMAL`.
    pub final_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthAttachmentDescriptor {
    pub format: vk::Format,
    pub initialization: AttachmentInitialization,
}

pub struct RenderPassDescriptor {
    pub color_attachments: Vec<ColorAttachmentDescriptor>,
    pub depth_attachment: Option<DepthAttachmentDescriptor>,
}

pub struct RenderPass {
    pub(crate) raw: vk::RenderPass,
    pub(crate) color_attachments: Vec<ColorAttachmentDescriptor>,
    pub(crate) depth_attachment: Option<DepthAttachmentDescriptor>,
    device: Arc<Device>,
}

impl RenderPass {
    pub fn color_attachment_count(&self) -> usize {
        self.color_attachments.len()
    }

    pub fn has_depth_attachment(&self) -> bool {
        self.depth_attachment.is_some()
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        let raw = self.raw;
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                shared.raw.destroy_render_pass(raw, None);
            },
            "RenderPass free",
        );
    }
}

impl Device {
    pub fn create_render_pass(self: &Arc<Self>, desc: RenderPassDescriptor) -> Result<RenderPass> {
        let mut attachments = Vec::new();
        let mut color_refs = Vec::new();

        for color in &desc.color_attachments {
            color_refs.push(
                vk::AttachmentReference::default()
                    .attachment(attachments.len() as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            );
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(color.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(color.initialization.load_op())
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(
                        color
                            .initialization
                            .initial_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
                    )
                    .final_layout(color.final_layout),
            );
        }

        let depth_ref = desc.depth_attachment.map(|depth| {
            let reference = vk::AttachmentReference::default()
                .attachment(attachments.len() as u32)
                .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth.format)
                    .samples(vk::SampleCountFlags::TYPE_1)
                    .load_op(depth.initialization.load_op())
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(
                        depth
                            .initialization
                            .initial_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
                    )
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
            reference
        });

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if let Some(depth_ref) = &depth_ref {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass));

        let raw = unsafe { self.shared.raw.create_render_pass(&create_info, None)? };

        Ok(RenderPass {
            raw,
            color_attachments: desc.color_attachments,
            depth_attachment: desc.depth_attachment,
            device: self.clone(),
        })
    }
}

/// One framebuffer attachment: the view rendered into plus the resource
/// identity the graph tracks for it. Swapchain attachments carry raw views
/// with the swapchain's id; texture attachments keep their texture alive.
pub struct FramebufferAttachment {
    pub(crate) view: vk::ImageView,
    pub(crate) resource_id: Option<u64>,
    pub(crate) clear_value: vk::ClearValue,
    _keep_alive: Option<Arc<Texture>>,
}

impl FramebufferAttachment {
    pub fn from_texture(texture: &Arc<Texture>, clear_value: vk::ClearValue) -> Self {
        Self {
            view: texture.raw_view,
            resource_id: Some(texture.id()),
            clear_value,
            _keep_alive: Some(texture.clone()),
        }
    }

    pub(crate) fn from_raw_view(
        view: vk::ImageView,
        resource_id: u64,
        clear_value: vk::ClearValue,
    ) -> Self {
        Self {
            view,
            resource_id: Some(resource_id),
            clear_value,
            _keep_alive: None,
        }
    }
}

pub struct FramebufferDescriptor {
    pub render_pass: Arc<RenderPass>,
    /// Color attachments in pass order, depth last when the pass has one.
    pub attachments: Vec<FramebufferAttachment>,
    pub width: u32,
    pub height: u32,
}

pub struct Framebuffer {
    pub(crate) raw: vk::Framebuffer,
    pub(crate) render_pass: Arc<RenderPass>,
    attachments: Vec<FramebufferAttachment>,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) clear_values: Vec<vk::ClearValue>,
    device: Arc<Device>,
}

impl Framebuffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn attachment_view(&self, index: usize) -> Option<vk::ImageView> {
        self.attachments.get(index).map(|attachment| attachment.view)
    }

    /// Resource reads and writes this framebuffer contributes to a graph
    /// node: every attachment is written, preserved attachments are also
    /// read.
    pub(crate) fn attachment_usages(&self) -> (Vec<u64>, Vec<u64>) {
        let mut reads = Vec::new();
        let mut writes = Vec::new();

        let color_count = self.render_pass.color_attachments.len();
        for (index, attachment) in self.attachments.iter().enumerate() {
            let Some(id) = attachment.resource_id else {
                continue;
            };

            let initialization = if index < color_count {
                self.render_pass.color_attachments[index].initialization
            } else if let Some(depth) = &self.render_pass.depth_attachment {
                depth.initialization
            } else {
                continue;
            };

            if initialization == AttachmentInitialization::Preserve {
                reads.push(id);
            }
            writes.push(id);
        }

        (reads, writes)
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        let raw = self.raw;
        let shared = self.device.shared.clone();
        self.device.finalizer.push(
            move || unsafe {
                shared.raw.destroy_framebuffer(raw, None);
            },
            "Framebuffer free",
        );
    }
}

impl Device {
    pub fn create_framebuffer(self: &Arc<Self>, desc: FramebufferDescriptor) -> Result<Framebuffer> {
        let views = desc
            .attachments
            .iter()
            .map(|attachment| attachment.view)
            .collect::<Vec<_>>();

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass.raw)
            .attachments(&views)
            .width(desc.width)
            .height(desc.height)
            .layers(1);

        let raw = unsafe { self.shared.raw.create_framebuffer(&create_info, None)? };

        let clear_values = desc
            .attachments
            .iter()
            .map(|attachment| attachment.clear_value)
            .collect();

        Ok(Framebuffer {
            raw,
            render_pass: desc.render_pass,
            attachments: desc.attachments,
            width: desc.width,
            height: desc.height,
            clear_values,
            device: self.clone(),
        })
    }
}
