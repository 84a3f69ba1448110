// Static quad geometry and its vertex layout
//
// The byte layout here must match the pipeline's vertex input description:
// 20-byte vertices (vec2 position, vec3 color) and u16 indices.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::mem::{offset_of, size_of};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(x: f32, y: f32, r: f32, g: f32, b: f32) -> Self {
        Self {
            position: Vec2::new(x, y),
            color: Vec3::new(r, g, b),
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // Position (location 0)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, position) as u32)
                .build(),
            // Color (location 1)
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
        ]
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new(-0.5, -0.5, 1.0, 0.0, 0.0),
    Vertex::new(0.5, -0.5, 0.0, 1.0, 0.0),
    Vertex::new(0.5, 0.5, 0.0, 0.0, 1.0),
    Vertex::new(-0.5, 0.5, 1.0, 1.0, 1.0),
];

/// Two clockwise triangles over the four corners.
pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_is_twenty_tightly_packed_bytes() {
        assert_eq!(size_of::<Vertex>(), 20);
        assert_eq!(Vertex::binding_description().stride, 20);

        let [position, color] = Vertex::attribute_descriptions();
        assert_eq!((position.location, position.offset), (0, 0));
        assert_eq!((color.location, color.offset), (1, 8));
    }

    #[test]
    fn vertex_bytes_are_position_then_color() {
        let bytes: &[u8] = bytemuck::bytes_of(&QUAD_VERTICES[1]);
        let floats: &[f32] = bytemuck::cast_slice(bytes);

        assert_eq!(floats, &[0.5, -0.5, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn quad_uses_every_vertex_in_two_triangles() {
        assert_eq!(QUAD_INDICES.len(), 6);
        assert_eq!(bytemuck::cast_slice::<u16, u8>(&QUAD_INDICES).len(), 12);
        for index in 0..QUAD_VERTICES.len() as u16 {
            assert!(QUAD_INDICES.contains(&index));
        }
    }
}
