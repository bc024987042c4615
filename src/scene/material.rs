//! Materials, their textures and the descriptor heap that binds them.

use std::collections::HashMap;

use crate::abi::{GpuMaterial, DESCRIPTORS_PER_MATERIAL, MATERIAL_CUTOUT, MATERIAL_REFLECTIVE};
use crate::device::{
    BufferDesc, BufferId, BufferKind, GpuAddress, HeapId, RayDevice, ResourceState, TextureDesc,
    TextureFormat, TextureId,
};
use crate::util::{Error, Result};

/// Alpha cutoff used when a cutout material does not set one.
pub const DEFAULT_ALPHA_CUTOFF: f32 = 0.5;

/// CPU-side texture, RGBA float texels in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub texels: Vec<[f32; 4]>,
}

impl TextureData {
    /// 1x1 texture of one color.
    pub fn solid(color: [f32; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            texels: vec![color],
        }
    }

    /// `cells` x `cells` checkerboard of `size` x `size` texels.
    pub fn checker(size: u32, cells: u32, a: [f32; 4], b: [f32; 4]) -> Self {
        let cell = (size / cells.max(1)).max(1);
        let texels = (0..size * size)
            .map(|i| {
                let (x, y) = (i % size, i / size);
                if ((x / cell) + (y / cell)) % 2 == 0 {
                    a
                } else {
                    b
                }
            })
            .collect();
        Self {
            width: size,
            height: size,
            texels,
        }
    }
}

/// Which texture of a material a heap slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialTexture {
    Diffuse = 0,
    Specular = 1,
    Normal = 2,
}

/// Material as delivered by the asset loader.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub id: u32,
    pub name: String,
    pub base_color: [f32; 4],
    /// Reflection strength, scaled by the specular texture's red channel.
    pub reflectivity: f32,
    pub reflective: bool,
    /// Alpha-tested; geometry using it is built non-opaque.
    pub cutout: bool,
    pub alpha_cutoff: f32,
    pub diffuse: Option<TextureData>,
    pub specular: Option<TextureData>,
    pub normal: Option<TextureData>,
}

impl Material {
    pub fn new(id: u32, name: impl Into<String>, base_color: [f32; 4]) -> Self {
        Self {
            id,
            name: name.into(),
            base_color,
            reflectivity: 0.0,
            reflective: false,
            cutout: false,
            alpha_cutoff: DEFAULT_ALPHA_CUTOFF,
            diffuse: None,
            specular: None,
            normal: None,
        }
    }

    pub fn with_reflectivity(mut self, reflectivity: f32) -> Self {
        self.reflectivity = reflectivity.clamp(0.0, 1.0);
        self.reflective = self.reflectivity > 0.0;
        self
    }

    /// Alpha-test against `cutoff` using the diffuse texture's alpha.
    pub fn with_cutout(mut self, diffuse: TextureData, cutoff: f32) -> Self {
        self.cutout = true;
        self.alpha_cutoff = cutoff;
        self.diffuse = Some(diffuse);
        self
    }

    pub fn with_diffuse(mut self, diffuse: TextureData) -> Self {
        self.diffuse = Some(diffuse);
        self
    }

    pub fn with_specular(mut self, specular: TextureData) -> Self {
        self.specular = Some(specular);
        self
    }

    pub fn to_gpu(&self) -> GpuMaterial {
        let mut flags = 0;
        if self.reflective {
            flags |= MATERIAL_REFLECTIVE;
        }
        if self.cutout {
            flags |= MATERIAL_CUTOUT;
        }
        GpuMaterial {
            base_color: self.base_color,
            params: [self.reflectivity, self.alpha_cutoff, 0.0, 0.0],
            flags,
            _pad: [0; 3],
        }
    }

    fn texture(&self, slot: MaterialTexture) -> Option<&TextureData> {
        match slot {
            MaterialTexture::Diffuse => self.diffuse.as_ref(),
            MaterialTexture::Specular => self.specular.as_ref(),
            MaterialTexture::Normal => self.normal.as_ref(),
        }
    }
}

/// Materials keyed by id, each with a dense slot in upload order.
#[derive(Debug, Clone, Default)]
pub struct MaterialTable {
    materials: Vec<Material>,
    slots: HashMap<u32, u32>,
}

impl MaterialTable {
    pub fn new(materials: Vec<Material>) -> Result<Self> {
        let mut slots = HashMap::with_capacity(materials.len());
        for (slot, material) in materials.iter().enumerate() {
            if slots.insert(material.id, slot as u32).is_some() {
                return Err(Error::DuplicateMaterial(material.id));
            }
        }
        Ok(Self { materials, slots })
    }

    pub fn len(&self) -> usize {
        self.materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.materials.is_empty()
    }

    /// Dense slot of a material id.
    pub fn slot(&self, id: u32) -> Result<u32> {
        self.slots.get(&id).copied().ok_or(Error::MaterialNotFound(id))
    }

    pub fn get(&self, id: u32) -> Option<&Material> {
        self.slots.get(&id).map(|&slot| &self.materials[slot as usize])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Material> {
        self.materials.iter()
    }

    /// Upload textures, fill the descriptor heap and the material buffer.
    ///
    /// Missing textures bind shared 1x1 fallbacks.
    #[tracing::instrument(level = "debug", skip_all, fields(materials = self.len()))]
    pub fn upload(&self, device: &dyn RayDevice) -> Result<MaterialBindings> {
        let count = self.materials.len().max(1) as u32;
        let heap = device.create_descriptor_heap(count * DESCRIPTORS_PER_MATERIAL)?;

        let mut textures = Vec::new();
        let mut create = |label: &str, data: &TextureData| -> Result<TextureId> {
            let desc = TextureDesc::new(
                label,
                data.width,
                data.height,
                TextureFormat::Rgba32Float,
                ResourceState::ShaderResource,
            );
            let texture = device.create_texture(&desc)?;
            device.write_texture(texture, &data.texels)?;
            textures.push(texture);
            Ok(texture)
        };

        let fallbacks = [
            create("fallback_diffuse", &TextureData::solid([1.0; 4]))?,
            create("fallback_specular", &TextureData::solid([1.0; 4]))?,
            create("fallback_normal", &TextureData::solid([0.5, 0.5, 1.0, 1.0]))?,
        ];

        for (slot, material) in self.materials.iter().enumerate() {
            for kind in [MaterialTexture::Diffuse, MaterialTexture::Specular, MaterialTexture::Normal] {
                let texture = match material.texture(kind) {
                    Some(data) => create(&format!("{}_{:?}", material.name, kind), data)?,
                    None => fallbacks[kind as usize],
                };
                let index = slot as u32 * DESCRIPTORS_PER_MATERIAL + kind as u32;
                device.write_descriptor(heap, index, texture)?;
            }
        }
        if self.materials.is_empty() {
            for (i, texture) in fallbacks.iter().enumerate() {
                device.write_descriptor(heap, i as u32, *texture)?;
            }
        }

        let gpu: Vec<GpuMaterial> = if self.materials.is_empty() {
            vec![Material::new(0, "default", [1.0; 4]).to_gpu()]
        } else {
            self.materials.iter().map(Material::to_gpu).collect()
        };
        let bytes: &[u8] = bytemuck::cast_slice(&gpu);
        let buffer = device.create_buffer(&BufferDesc::new(
            "materials",
            bytes.len() as u64,
            BufferKind::Upload,
        ))?;
        device.write_buffer(buffer, 0, bytes)?;

        tracing::debug!(
            descriptors = count * DESCRIPTORS_PER_MATERIAL,
            textures = textures.len(),
            "material bindings uploaded"
        );
        Ok(MaterialBindings {
            heap,
            materials: buffer,
            textures,
        })
    }
}

/// Device objects holding every material.
#[derive(Debug, Clone)]
pub struct MaterialBindings {
    /// Three descriptors per material slot.
    pub heap: HeapId,
    /// `GpuMaterial` per slot.
    pub materials: BufferId,
    pub textures: Vec<TextureId>,
}

impl MaterialBindings {
    /// Shader-visible handle of a slot's first descriptor.
    pub fn descriptor_table(&self, device: &dyn RayDevice, slot: u32) -> Result<GpuAddress> {
        Ok(device.descriptor_handle(self.heap, slot * DESCRIPTORS_PER_MATERIAL)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::software::SoftwareDevice;

    #[test]
    fn test_slots_follow_table_order() {
        let table = MaterialTable::new(vec![
            Material::new(10, "floor", [1.0; 4]),
            Material::new(3, "mirror", [1.0; 4]).with_reflectivity(0.8),
        ])
        .expect("table");
        assert_eq!(table.slot(10).expect("slot"), 0);
        assert_eq!(table.slot(3).expect("slot"), 1);
        assert!(matches!(table.slot(4), Err(Error::MaterialNotFound(4))));
        assert!(table.get(3).expect("mirror").reflective);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = MaterialTable::new(vec![
            Material::new(1, "a", [1.0; 4]),
            Material::new(1, "b", [1.0; 4]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateMaterial(1)));
    }

    #[test]
    fn test_gpu_flags() {
        let leaves = Material::new(2, "leaves", [0.2, 0.6, 0.2, 1.0])
            .with_cutout(TextureData::solid([1.0, 1.0, 1.0, 0.0]), 0.5);
        let gpu = leaves.to_gpu();
        assert!(gpu.is_cutout());
        assert!(!gpu.is_reflective());
        assert_eq!(gpu.params[1], 0.5);
    }

    #[test]
    fn test_upload_sizes_heap_from_material_count() {
        let device = SoftwareDevice::new();
        let table = MaterialTable::new(vec![
            Material::new(0, "a", [1.0; 4]),
            Material::new(1, "b", [1.0; 4]).with_diffuse(TextureData::checker(4, 2, [1.0; 4], [0.0; 4])),
        ])
        .expect("table");
        let bindings = table.upload(&device).expect("upload");
        // three fallbacks plus one diffuse texture
        assert_eq!(bindings.textures.len(), 4);
        assert!(bindings.descriptor_table(&device, 1).is_ok());
        assert!(bindings.descriptor_table(&device, 2).is_err());
    }
}
