//! Two-level spatial index over the static scene.
//!
//! One bottom level holds every object's triangles. The top level carries one
//! instance per object, all referencing that bottom level with the scene
//! transform, mask 1 and a hit-group offset equal to the object's ordinal.
//! Both builds share one scratch buffer sized for the larger of the two.
//!
//! Record lookup is `instance offset + geometry index`, and the table holds
//! one record per object. Only instance 0 may therefore reach the bottom
//! level's geometries: the instances are coincident, and the backend must
//! report a hit on the lowest instance only. A backend that traverses every
//! instance would read records past the end of the table for instances 1..N.

use crate::device::{
    AccelInputs, BufferDesc, BufferId, BufferKind, CommandList, Command, InstanceDesc, QueueKind,
    RayDevice, SubmissionId,
};
use crate::scene::SceneGeometry;
use crate::util::{Affine3A, Error, Result};

/// Instance mask given to every scene instance.
pub const SCENE_INSTANCE_MASK: u8 = 1;

/// Built acceleration structures. Lives for the process lifetime.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    bottom_level: BufferId,
    top_level: BufferId,
    instances: BufferId,
    scratch: BufferId,
    scratch_size: u64,
    instance_count: u32,
    submission: SubmissionId,
}

impl SpatialIndex {
    pub fn top_level(&self) -> BufferId {
        self.top_level
    }

    pub fn bottom_level(&self) -> BufferId {
        self.bottom_level
    }

    pub fn scratch(&self) -> BufferId {
        self.scratch
    }

    pub fn scratch_size(&self) -> u64 {
        self.scratch_size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Submission that performed the builds.
    pub fn submission(&self) -> SubmissionId {
        self.submission
    }

    /// Read back the top-level instance descriptors.
    pub fn instance_descs(&self, device: &dyn RayDevice) -> Result<Vec<InstanceDesc>> {
        let bytes = device.read_buffer(self.instances)?;
        Ok(bytes
            .chunks_exact(InstanceDesc::SIZE as usize)
            .take(self.instance_count as usize)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

/// Builds the [`SpatialIndex`] once at startup.
pub struct SpatialIndexBuilder<'a> {
    device: &'a dyn RayDevice,
    transform: Affine3A,
    queue: QueueKind,
}

impl<'a> SpatialIndexBuilder<'a> {
    pub fn new(device: &'a dyn RayDevice) -> Self {
        Self {
            device,
            transform: Affine3A::IDENTITY,
            queue: QueueKind::Graphics,
        }
    }

    /// Scene transform applied to every instance.
    pub fn with_transform(mut self, transform: Affine3A) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    /// Build both levels. Any failure is fatal; there is no partial result.
    #[tracing::instrument(level = "info", skip_all, fields(objects = scene.len()))]
    pub fn build(&self, scene: &SceneGeometry) -> Result<SpatialIndex> {
        if scene.is_empty() {
            return Err(Error::EmptyScene);
        }
        for object in scene.objects() {
            object.validate()?;
        }
        let device = self.device;
        let count = scene.len() as u32;

        let geometries: Vec<_> = scene
            .objects()
            .iter()
            .enumerate()
            .map(|(i, o)| o.triangle_desc(scene.vertex_buffer, scene.index_buffer, !scene.is_cutout(i)))
            .collect();
        let bottom_info = device.prebuild_info(&AccelInputs::BottomLevel(&geometries));
        let top_info = device.prebuild_info(&AccelInputs::TopLevel {
            instance_count: count,
        });
        let scratch_size = bottom_info.scratch_size.max(top_info.scratch_size);
        tracing::info!(
            bottom_level = bottom_info.result_size,
            top_level = top_info.result_size,
            scratch = scratch_size,
            "acceleration structure sizes"
        );

        let bottom_level = device.create_buffer(&BufferDesc::new(
            "bottom_level",
            bottom_info.result_size,
            BufferKind::AccelerationStructure,
        ))?;
        let top_level = device.create_buffer(&BufferDesc::new(
            "top_level",
            top_info.result_size,
            BufferKind::AccelerationStructure,
        ))?;
        let scratch = device.create_buffer(&BufferDesc::new("as_scratch", scratch_size, BufferKind::Scratch))?;
        let instances = device.create_buffer(&BufferDesc::new(
            "instances",
            count as u64 * InstanceDesc::SIZE,
            BufferKind::Upload,
        ))?;

        let bottom_address = device.buffer_address(bottom_level)?;
        let descs: Vec<InstanceDesc> = (0..count)
            .map(|i| InstanceDesc::new(&self.transform, i, SCENE_INSTANCE_MASK, i, bottom_address))
            .collect();
        device.write_buffer(instances, 0, bytemuck::cast_slice(&descs))?;

        let mut list = CommandList::new(self.queue, "spatial_index_build");
        list.push(Command::BuildBottomLevel {
            geometries,
            dest: bottom_level,
            scratch,
        });
        // The top-level build reads the bottom level and reuses its scratch
        list.uav_barrier(None);
        list.push(Command::BuildTopLevel {
            instances,
            instance_count: count,
            dest: top_level,
            scratch,
        });
        list.uav_barrier(None);
        let submission = device.submit(list)?;

        assert_eq!(descs.len(), scene.len(), "one instance per object");
        assert!(
            descs.iter().enumerate().all(|(i, d)| d.hit_group_offset() == i as u32),
            "hit-group offset equals instance ordinal"
        );
        tracing::info!(instances = count, "spatial index built");

        Ok(SpatialIndex {
            bottom_level,
            top_level,
            instances,
            scratch,
            scratch_size,
            instance_count: count,
            submission,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::software::SoftwareDevice;
    use crate::device::{DeviceCaps, DeviceError};
    use crate::scene::{demo, SceneGeometry};

    fn upload(device: &SoftwareDevice, objects: usize) -> SceneGeometry {
        let scene = demo::grid_scene(objects).expect("scene");
        SceneGeometry::upload(device, &scene.meshes, &scene.materials).expect("upload")
    }

    #[test]
    fn test_instance_per_object() {
        let device = SoftwareDevice::new();
        let geometry = upload(&device, 5);
        let index = SpatialIndexBuilder::new(&device).build(&geometry).expect("build");
        assert_eq!(index.instance_count(), 5);
        let descs = index.instance_descs(&device).expect("read back");
        for (i, desc) in descs.iter().enumerate() {
            assert_eq!(desc.hit_group_offset(), i as u32);
            assert_eq!(desc.mask(), SCENE_INSTANCE_MASK);
            assert_eq!(desc.bottom_level, device.buffer_address(index.bottom_level()).expect("addr"));
        }
    }

    #[test]
    fn test_scratch_covers_both_levels() {
        let device = SoftwareDevice::new();
        let geometry = upload(&device, 3);
        let index = SpatialIndexBuilder::new(&device).build(&geometry).expect("build");
        let top = device.prebuild_info(&AccelInputs::TopLevel { instance_count: 3 });
        assert!(index.scratch_size() >= top.scratch_size);
        assert_eq!(device.buffer_size(index.scratch()).expect("size"), index.scratch_size());
    }

    #[test]
    fn test_allocation_failure_is_fatal() {
        let device = SoftwareDevice::new();
        let geometry = upload(&device, 3);
        let tight = SoftwareDevice::with_caps(DeviceCaps {
            memory_budget: device.allocated_bytes() + 64,
            ..DeviceCaps::default()
        });
        let geometry_tight = upload(&tight, 3);
        drop(geometry);
        let err = SpatialIndexBuilder::new(&tight).build(&geometry_tight).unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::OutOfMemory { .. })));
        assert_eq!(err.kind(), crate::util::ErrorKind::Construction);
    }
}
