//! Per-technique hit-group record tables.
//!
//! A record is `[identifier][descriptor table handle][material constant]`
//! with each argument at its natural alignment after the identifier, and the
//! stride rounded up to the device's record alignment. Record `i` belongs to
//! geometry object `i`, matching the top-level instance offsets.
//! Tables are sized for one record per object, which relies on coincident
//! instances resolving to the lowest one (see [`crate::accel`]).

use crate::device::{
    BindingLayout, BindingParam, BufferDesc, BufferId, BufferKind, DeviceCaps, GpuAddress,
    ProgramIdentifier, RayDevice, RecordTableView, PROGRAM_IDENTIFIER_SIZE,
};
use crate::scene::{MaterialBindings, MaterialTable, SceneGeometry};
use crate::technique::{Technique, TechniqueId, TechniqueRegistry};
use crate::util::{align_up, is_aligned, Error, Result};

/// Byte layout of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub identifier_size: u64,
    pub descriptor_table_offset: u64,
    pub material_offset: u64,
    pub stride: u64,
    pub alignment: u64,
}

impl RecordLayout {
    /// Derive the layout from device limits and a local binding layout.
    ///
    /// The local layout must start with a descriptor table followed by a
    /// single 32-bit constant.
    pub fn new(caps: &DeviceCaps, local: &BindingLayout) -> Result<Self> {
        let identifier_size = caps.program_identifier_size as u64;
        if identifier_size != PROGRAM_IDENTIFIER_SIZE as u64 {
            return Err(Error::RecordLayout(format!(
                "device identifier width {} != {}",
                identifier_size, PROGRAM_IDENTIFIER_SIZE
            )));
        }
        let alignment = caps.record_alignment as u64;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::RecordLayout(format!("record alignment {} is not a power of two", alignment)));
        }
        if !local.local {
            return Err(Error::RecordLayout(format!("`{}` is not a local layout", local.name)));
        }

        let (table, constant) = match local.params.as_slice() {
            [table @ BindingParam::DescriptorTable { .. }, constant @ BindingParam::Constants { count: 1, .. }] => {
                (table, constant)
            }
            _ => {
                return Err(Error::RecordLayout(format!(
                    "`{}` must hold a descriptor table then one constant",
                    local.name
                )))
            }
        };

        let descriptor_table_offset = align_up(identifier_size, table.record_alignment());
        let material_offset = align_up(
            descriptor_table_offset + table.record_size(),
            constant.record_alignment(),
        );
        let end = material_offset + constant.record_size();
        let stride = align_up(end, alignment);

        let layout = Self {
            identifier_size,
            descriptor_table_offset,
            material_offset,
            stride,
            alignment,
        };
        assert!(is_aligned(layout.stride, alignment), "record stride misaligned");
        assert!(layout.descriptor_table_offset >= identifier_size, "pointer overlaps identifier");
        assert!(layout.material_offset >= descriptor_table_offset + 8, "constant overlaps pointer");
        Ok(layout)
    }

    /// Table length for `count` records.
    pub fn table_size(&self, count: usize) -> u64 {
        self.stride * count as u64
    }
}

/// Contents of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub identifier: ProgramIdentifier,
    /// Handle of the material's first descriptor.
    pub descriptor_table: GpuAddress,
    /// Dense material slot.
    pub material: u32,
}

/// Serializes records in object order. The bytes never leave the builder
/// except through [`RecordTableBuilder::upload`].
#[derive(Debug)]
pub struct RecordTableBuilder {
    layout: RecordLayout,
    bytes: Vec<u8>,
    count: usize,
}

impl RecordTableBuilder {
    pub fn new(layout: RecordLayout, capacity: usize) -> Self {
        Self {
            layout,
            bytes: Vec::with_capacity(layout.table_size(capacity) as usize),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append the next record.
    pub fn push(&mut self, record: &DispatchRecord) -> Result<()> {
        if !is_aligned(record.descriptor_table.0, 8) {
            return Err(Error::RecordLayout(format!(
                "record {}: descriptor handle {:#x} not 8-byte aligned",
                self.count, record.descriptor_table.0
            )));
        }
        let layout = &self.layout;
        let start = self.bytes.len();
        self.bytes.resize(start + layout.stride as usize, 0);
        let record_bytes = &mut self.bytes[start..];

        record_bytes[..layout.identifier_size as usize].copy_from_slice(&record.identifier.0);
        let table = layout.descriptor_table_offset as usize;
        record_bytes[table..table + 8].copy_from_slice(bytemuck::bytes_of(&record.descriptor_table));
        let material = layout.material_offset as usize;
        record_bytes[material..material + 4].copy_from_slice(&record.material.to_le_bytes());

        self.count += 1;
        Ok(())
    }

    /// Copy the table into a new upload buffer.
    pub fn upload(self, device: &dyn RayDevice, label: &str) -> Result<(BufferId, u64)> {
        let size = self.bytes.len() as u64;
        assert_eq!(size, self.layout.table_size(self.count), "table length mismatch");
        let buffer = device.create_buffer(&BufferDesc::new(label, size, BufferKind::Upload))?;
        device.write_buffer(buffer, 0, &self.bytes)?;
        Ok((buffer, size))
    }
}

/// A technique's uploaded record table. Immutable once built.
#[derive(Debug, Clone)]
pub struct DispatchRecordTable {
    technique: TechniqueId,
    layout: RecordLayout,
    buffer: BufferId,
    count: usize,
    size: u64,
}

impl DispatchRecordTable {
    /// One record per scene object, binding the technique's hit group to
    /// the object's material.
    pub fn build(
        device: &dyn RayDevice,
        technique: &Technique,
        layout: RecordLayout,
        scene: &SceneGeometry,
        materials: &MaterialTable,
        bindings: &MaterialBindings,
    ) -> Result<Self> {
        let mut builder = RecordTableBuilder::new(layout, scene.len());
        for object in scene.objects() {
            let slot = materials.slot(object.material_id)?;
            builder.push(&DispatchRecord {
                identifier: technique.hit_group,
                descriptor_table: bindings.descriptor_table(device, slot)?,
                material: slot,
            })?;
        }
        let count = builder.len();
        let label = format!("records_{}", technique.id);
        let (buffer, size) = builder.upload(device, &label)?;

        let address = device.buffer_address(buffer)?;
        assert!(
            is_aligned(address.0, device.caps().table_alignment as u64),
            "record table start misaligned"
        );
        tracing::debug!(
            technique = %technique.id,
            stride = layout.stride,
            records = count,
            bytes = size,
            "record table built"
        );
        Ok(Self {
            technique: technique.id,
            layout,
            buffer,
            count,
            size,
        })
    }

    pub fn technique(&self) -> TechniqueId {
        self.technique
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn stride(&self) -> u64 {
        self.layout.stride
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn byte_len(&self) -> u64 {
        self.size
    }

    /// What a dispatch binds.
    pub fn view(&self) -> RecordTableView {
        RecordTableView {
            buffer: self.buffer,
            stride: self.layout.stride,
            size: self.size,
        }
    }
}

/// Record tables of every technique, indexed by [`TechniqueId`].
#[derive(Debug, Clone)]
pub struct RecordTables {
    tables: Vec<DispatchRecordTable>,
}

impl RecordTables {
    #[tracing::instrument(level = "info", skip_all, fields(objects = scene.len()))]
    pub fn build(
        device: &dyn RayDevice,
        registry: &TechniqueRegistry,
        scene: &SceneGeometry,
        materials: &MaterialTable,
        bindings: &MaterialBindings,
    ) -> Result<Self> {
        let layout = RecordLayout::new(device.caps(), &registry.local_layout().layout)?;
        let tables = TechniqueId::ALL
            .into_iter()
            .map(|id| DispatchRecordTable::build(device, registry.get(id), layout, scene, materials, bindings))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            stride = layout.stride,
            bytes = layout.table_size(scene.len()),
            "record tables built"
        );
        Ok(Self { tables })
    }

    pub fn get(&self, id: TechniqueId) -> &DispatchRecordTable {
        &self.tables[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &DispatchRecordTable> {
        self.tables.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::technique::local_layout;

    fn layout() -> RecordLayout {
        RecordLayout::new(&DeviceCaps::default(), &local_layout()).expect("layout")
    }

    #[test]
    fn test_layout_offsets() {
        let layout = layout();
        assert_eq!(layout.descriptor_table_offset, 32);
        assert_eq!(layout.material_offset, 40);
        assert_eq!(layout.stride, 64);
        assert_eq!(layout.table_size(37), 2368);
    }

    #[test]
    fn test_stride_follows_alignment() {
        let caps = DeviceCaps {
            record_alignment: 64,
            ..DeviceCaps::default()
        };
        let layout = RecordLayout::new(&caps, &local_layout()).expect("layout");
        assert_eq!(layout.stride, 64);
        let caps = DeviceCaps {
            record_alignment: 16,
            ..DeviceCaps::default()
        };
        let layout = RecordLayout::new(&caps, &local_layout()).expect("layout");
        assert_eq!(layout.stride, 48);
        assert_eq!(layout.stride % 16, 0);
    }

    #[test]
    fn test_bad_layouts_rejected() {
        let caps = DeviceCaps {
            record_alignment: 24,
            ..DeviceCaps::default()
        };
        assert!(matches!(RecordLayout::new(&caps, &local_layout()), Err(Error::RecordLayout(_))));

        let mut swapped = local_layout();
        swapped.params.reverse();
        assert!(RecordLayout::new(&DeviceCaps::default(), &swapped).is_err());

        let mut global = local_layout();
        global.local = false;
        assert!(RecordLayout::new(&DeviceCaps::default(), &global).is_err());
    }

    #[test]
    fn test_builder_writes_fields() {
        let layout = layout();
        let mut builder = RecordTableBuilder::new(layout, 2);
        let identifier = ProgramIdentifier([7; PROGRAM_IDENTIFIER_SIZE]);
        for material in 0..2 {
            builder
                .push(&DispatchRecord {
                    identifier,
                    descriptor_table: GpuAddress(0x8000_0000_0000_0040 + material as u64 * 96),
                    material,
                })
                .expect("push");
        }
        let bytes = &builder.bytes;
        assert_eq!(bytes.len(), 128);
        let second = &bytes[64..128];
        assert_eq!(&second[..32], &[7; 32]);
        let table = u64::from_le_bytes(second[32..40].try_into().expect("8 bytes"));
        assert_eq!(table, 0x8000_0000_0000_0040 + 96);
        assert_eq!(u32::from_le_bytes(second[40..44].try_into().expect("4 bytes")), 1);
        assert!(second[44..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unaligned_handle_rejected() {
        let mut builder = RecordTableBuilder::new(layout(), 1);
        let err = builder
            .push(&DispatchRecord {
                identifier: ProgramIdentifier([0; PROGRAM_IDENTIFIER_SIZE]),
                descriptor_table: GpuAddress(3),
                material: 0,
            })
            .unwrap_err();
        assert!(matches!(err, Error::RecordLayout(_)));
        assert!(builder.is_empty());
    }
}
