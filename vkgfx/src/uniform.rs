//! std140 uniform block packing (§4.1).

use crate::types::UniformFormat;

/// A single member of a [`UniformBlockDefinition`]: a type, a name used for
/// name-based lookup, and an array length (`1` for a non-array member).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberDefinition {
    pub ty: UniformFormat,
    pub name: String,
    pub count: u32,
}

impl MemberDefinition {
    pub fn new(ty: UniformFormat, name: impl Into<String>, count: u32) -> Self {
        Self {
            ty,
            name: name.into(),
            count,
        }
    }
}

/// Ordered list of uniform block members; the matching key between a
/// synthesized/declared uniform block and the buffer built for it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UniformBlockDefinition {
    pub members: Vec<MemberDefinition>,
}

impl UniformBlockDefinition {
    pub fn new(members: Vec<MemberDefinition>) -> Self {
        Self { members }
    }

    /// Total byte size of a block matching this definition under std140.
    pub fn size(&self) -> u32 {
        let mut end = 0u32;
        for member in &self.members {
            let layout = member.ty.std140_layout(member.count);
            end = next_multiple_of(layout.alignment, end);
            end += layout.size;
        }
        end
    }
}

fn next_multiple_of(n: u32, v: u32) -> u32 {
    ((v + n - 1) / n) * n
}

/// Packs typed CPU values into a byte buffer laid out per std140, matching
/// `UniformBlockDefinition`'s member order, alignment and stride.
#[derive(Clone, Debug)]
pub struct UniformBlockBuilder {
    definition: UniformBlockDefinition,
    byte_offsets: Vec<u32>,
    data: Vec<u8>,
}

impl UniformBlockBuilder {
    pub fn new(definition: UniformBlockDefinition) -> Self {
        let mut byte_offsets = Vec::with_capacity(definition.members.len());
        let mut buffer_size = 0u32;

        for member in &definition.members {
            let layout = member.ty.std140_layout(member.count);
            buffer_size = next_multiple_of(layout.alignment, buffer_size);
            byte_offsets.push(buffer_size);
            buffer_size += layout.size;
        }

        Self {
            definition,
            byte_offsets,
            data: vec![0u8; buffer_size as usize],
        }
    }

    pub fn definition(&self) -> &UniformBlockDefinition {
        &self.definition
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_scalar_bool(&mut self, index: usize, value: bool, element: u32) -> bool {
        let v = value as i32;
        self.set_value(index, UniformFormat::Bool, bytemuck::bytes_of(&v), element)
    }

    pub fn set_scalar_int(&mut self, index: usize, value: i32, element: u32) -> bool {
        self.set_value(
            index,
            UniformFormat::Int32,
            bytemuck::bytes_of(&value),
            element,
        )
    }

    pub fn set_scalar_float(&mut self, index: usize, value: f32, element: u32) -> bool {
        self.set_value(
            index,
            UniformFormat::Float,
            bytemuck::bytes_of(&value),
            element,
        )
    }

    pub fn set_vec2f(&mut self, index: usize, value: glam::Vec2, element: u32) -> bool {
        self.set_value(
            index,
            UniformFormat::Vec2F,
            bytemuck::bytes_of(&value),
            element,
        )
    }

    pub fn set_vec3f(&mut self, index: usize, value: glam::Vec3, element: u32) -> bool {
        self.set_value(
            index,
            UniformFormat::Vec3F,
            bytemuck::bytes_of(&value),
            element,
        )
    }

    pub fn set_vec4f(&mut self, index: usize, value: glam::Vec4, element: u32) -> bool {
        self.set_value(
            index,
            UniformFormat::Vec4F,
            bytemuck::bytes_of(&value),
            element,
        )
    }

    /// Expands the 9 input floats (row-major contiguous columns) into the
    /// std140-padded 3x(vec4) layout: 12 floats with a zeroed fourth lane
    /// after each column.
    pub fn set_mat33f(&mut self, index: usize, value: glam::Mat3, element: u32) -> bool {
        let m = value.to_cols_array();
        let padded: [f32; 12] = [
            m[0], m[1], m[2], 0.0, m[3], m[4], m[5], 0.0, m[6], m[7], m[8], 0.0,
        ];
        self.set_value(
            index,
            UniformFormat::Mat33F,
            bytemuck::bytes_of(&padded),
            element,
        )
    }

    pub fn set_mat44f(&mut self, index: usize, value: glam::Mat4, element: u32) -> bool {
        self.set_value(
            index,
            UniformFormat::Mat44F,
            bytemuck::bytes_of(&value.to_cols_array()),
            element,
        )
    }

    pub fn set_value(
        &mut self,
        index: usize,
        format: UniformFormat,
        value: &[u8],
        element: u32,
    ) -> bool {
        let Some(member) = self.definition.members.get(index) else {
            return false;
        };
        if format != member.ty || element >= member.count {
            return false;
        }
        self.set_value_unchecked(index, format, value, element)
    }

    pub fn set_value_by_name(
        &mut self,
        name: &str,
        format: UniformFormat,
        value: &[u8],
        element: u32,
    ) -> bool {
        let Some(index) = self
            .definition
            .members
            .iter()
            .position(|member| member.name == name && element < member.count)
        else {
            return false;
        };
        self.set_value_unchecked(index, format, value, element)
    }

    fn set_value_unchecked(
        &mut self,
        index: usize,
        format: UniformFormat,
        value: &[u8],
        element: u32,
    ) -> bool {
        let member = &self.definition.members[index];
        let layout = member.ty.std140_layout(member.count);
        // The value written per element is the type's own natural size, not
        // the (possibly vec4-padded) array stride computed for `count`.
        let per_element_size = member.ty.std140_layout(1).size;
        let dst_offset = (self.byte_offsets[index] + element * layout.stride) as usize;

        debug_assert!(dst_offset + per_element_size as usize <= self.data.len());

        if format == UniformFormat::Mat33F {
            // Caller already passed the 12-float padded layout (see
            // `set_mat33f`); raw 9-float input is rejected since the public
            // entry points always go through the padding helper.
            debug_assert_eq!(value.len(), 48);
            self.data[dst_offset..dst_offset + 48].copy_from_slice(value);
            return true;
        }

        let size = per_element_size as usize;
        self.data[dst_offset..dst_offset + size].copy_from_slice(&value[..size]);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> UniformBlockDefinition {
        UniformBlockDefinition::new(vec![
            MemberDefinition::new(UniformFormat::Float, "a", 1),
            MemberDefinition::new(UniformFormat::Vec3F, "b", 1),
            MemberDefinition::new(UniformFormat::Mat33F, "c", 1),
            MemberDefinition::new(UniformFormat::Float, "d", 3),
        ])
    }

    #[test]
    fn size_matches_std140_layout() {
        let def = definition();
        let builder = UniformBlockBuilder::new(def.clone());
        // a: offset 0, size 4. b: aligned to 16 -> offset 16, size 12.
        // c (mat3): aligned to 16 -> offset 32, size 48 -> ends at 80.
        // d[3]: array, aligned to 16, stride 16 -> offset 80, size 48 -> ends at 128.
        assert_eq!(builder.size(), 128);
        assert_eq!(def.size(), 128);
    }

    #[test]
    fn mat3_padding_zeroes_fourth_lane() {
        let def = UniformBlockDefinition::new(vec![MemberDefinition::new(
            UniformFormat::Mat33F,
            "m",
            1,
        )]);
        let mut builder = UniformBlockBuilder::new(def);
        let m = glam::Mat3::from_cols_array(&[1., 2., 3., 4., 5., 6., 7., 8., 9.]);
        assert!(builder.set_mat33f(0, m, 0));

        let bytes = builder.data();
        let floats: &[f32] = bytemuck::cast_slice(bytes);
        assert_eq!(
            floats,
            &[1., 2., 3., 0., 4., 5., 6., 0., 7., 8., 9., 0.]
        );
    }

    #[test]
    fn set_value_rejects_out_of_range_index_and_element() {
        let mut builder = UniformBlockBuilder::new(definition());
        assert!(!builder.set_scalar_float(99, 1.0, 0));
        assert!(builder.set_scalar_float(3, 1.0, 2));
        assert!(!builder.set_scalar_float(3, 1.0, 3));
    }

    #[test]
    fn set_value_by_name_round_trips() {
        let mut builder = UniformBlockBuilder::new(definition());
        assert!(builder.set_vec3f(1, glam::Vec3::new(1.0, 2.0, 3.0), 0));
        assert!(builder.set_value_by_name(
            "a",
            UniformFormat::Float,
            bytemuck::bytes_of(&42.0f32),
            0
        ));
        let floats: &[f32] = bytemuck::cast_slice(&builder.data()[0..4]);
        assert_eq!(floats[0], 42.0);
    }
}
