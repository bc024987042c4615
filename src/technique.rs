//! Ray-dispatch techniques and their compiled pipelines.
//!
//! Each technique pairs one ray-generation program, one miss program and one
//! hit group (closest-hit + alpha-test any-hit). Pipelines are compiled once
//! from a program library; afterwards every technique is immutable.

use crate::device::{
    BindingLayout, BindingParam, DescriptorRange, DeviceError, HitGroupDesc, LibraryId, PipelineDesc,
    PipelineId, ProgramIdentifier, ProgramLibrary, RangeKind, RayDevice, SerializedLayout,
};
use crate::util::{Error, Result};

/// Deepest trace nesting any technique uses (primary + one secondary ray).
pub const MAX_RECURSION: u32 = 2;
/// Largest ray payload in bytes (rgba color).
pub const PAYLOAD_SIZE: u32 = 16;
/// Triangle barycentrics.
pub const ATTRIBUTE_SIZE: u32 = 8;

/// The fixed set of techniques.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TechniqueId {
    Traversal,
    ScreenSpaceReflectionTraversal,
    ShadowRays,
    DiffuseHit,
    ReflectionHit,
}

/// Program export names of one technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TechniquePrograms {
    pub ray_generation: &'static str,
    pub closest_hit: &'static str,
    pub any_hit: &'static str,
    pub miss: &'static str,
    pub hit_group: &'static str,
}

const PROGRAMS: [TechniquePrograms; 5] = [
    TechniquePrograms {
        ray_generation: "PrimaryRayGen",
        closest_hit: "PrimaryClosestHit",
        any_hit: "AlphaTestAnyHit",
        miss: "PrimaryMiss",
        hit_group: "PrimaryHitGroup",
    },
    TechniquePrograms {
        ray_generation: "ScreenSpaceReflectionRayGen",
        closest_hit: "PrimaryClosestHit",
        any_hit: "AlphaTestAnyHit",
        miss: "PrimaryMiss",
        hit_group: "PrimaryHitGroup",
    },
    TechniquePrograms {
        ray_generation: "ShadowRayGen",
        closest_hit: "ShadowClosestHit",
        any_hit: "AlphaTestAnyHit",
        miss: "ShadowMiss",
        hit_group: "ShadowHitGroup",
    },
    TechniquePrograms {
        ray_generation: "PrimaryRayGen",
        closest_hit: "DiffuseClosestHit",
        any_hit: "AlphaTestAnyHit",
        miss: "PrimaryMiss",
        hit_group: "DiffuseHitGroup",
    },
    TechniquePrograms {
        ray_generation: "PrimaryRayGen",
        closest_hit: "ReflectionClosestHit",
        any_hit: "AlphaTestAnyHit",
        miss: "PrimaryMiss",
        hit_group: "ReflectionHitGroup",
    },
];

impl TechniqueId {
    pub const ALL: [TechniqueId; 5] = [
        Self::Traversal,
        Self::ScreenSpaceReflectionTraversal,
        Self::ShadowRays,
        Self::DiffuseHit,
        Self::ReflectionHit,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Traversal => "Traversal",
            Self::ScreenSpaceReflectionTraversal => "ScreenSpaceReflectionTraversal",
            Self::ShadowRays => "ShadowRays",
            Self::DiffuseHit => "DiffuseHit",
            Self::ReflectionHit => "ReflectionHit",
        }
    }

    pub fn programs(self) -> &'static TechniquePrograms {
        &PROGRAMS[self as usize]
    }
}

impl std::fmt::Display for TechniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Stack bytes a pipeline needs when traces nest `max_recursion` deep.
pub fn stack_size_budget(
    ray_generation: u64,
    closest_hit: u64,
    any_hit: u64,
    miss: u64,
    max_recursion: u32,
) -> u64 {
    ray_generation + closest_hit.max(any_hit).max(miss) * max_recursion as u64
}

/// Global bindings shared by every technique.
///
/// b0 hit constants, b1 frame constants, t0 top level, t1 geometry info,
/// t2 materials, t3 vertices, t4 indices, t5..t7 depth/normal/shadow map,
/// u0 output.
pub fn global_layout() -> BindingLayout {
    BindingLayout {
        name: "global",
        local: false,
        params: vec![
            BindingParam::ConstantBuffer { register: 0 },
            BindingParam::ConstantBuffer { register: 1 },
            BindingParam::ShaderResource { register: 0 },
            BindingParam::ShaderResource { register: 1 },
            BindingParam::ShaderResource { register: 2 },
            BindingParam::ShaderResource { register: 3 },
            BindingParam::ShaderResource { register: 4 },
            BindingParam::DescriptorTable {
                ranges: vec![DescriptorRange {
                    kind: RangeKind::ShaderResource,
                    base_register: 5,
                    count: 3,
                }],
            },
            BindingParam::UnorderedAccess { register: 0 },
        ],
    }
}

/// Per-record arguments: material textures (t8..t10) and material index (b2).
pub fn local_layout() -> BindingLayout {
    BindingLayout {
        name: "local",
        local: true,
        params: vec![
            BindingParam::DescriptorTable {
                ranges: vec![DescriptorRange {
                    kind: RangeKind::ShaderResource,
                    base_register: 8,
                    count: 3,
                }],
            },
            BindingParam::Constants { register: 2, count: 1 },
        ],
    }
}

/// A compiled technique.
#[derive(Debug, Clone)]
pub struct Technique {
    pub id: TechniqueId,
    pub pipeline: PipelineId,
    pub max_recursion: u32,
    /// Stack budget set on the pipeline.
    pub stack_size: u64,
    pub ray_generation: ProgramIdentifier,
    pub miss: ProgramIdentifier,
    pub hit_group: ProgramIdentifier,
}

impl Technique {
    pub fn programs(&self) -> &'static TechniquePrograms {
        self.id.programs()
    }
}

/// All techniques, built once at startup.
#[derive(Debug, Clone)]
pub struct TechniqueRegistry {
    techniques: Vec<Technique>,
    library: LibraryId,
    global_layout: SerializedLayout,
    local_layout: SerializedLayout,
}

fn layout_error(layout: &'static str, err: DeviceError) -> Error {
    match err {
        DeviceError::LayoutSerialization(reason) => Error::BindingLayout { layout, reason },
        other => other.into(),
    }
}

impl TechniqueRegistry {
    /// Serialize layouts, load the library and compile every technique.
    #[tracing::instrument(level = "info", skip_all, fields(library = %library.label))]
    pub fn build(device: &dyn RayDevice, library: &ProgramLibrary) -> Result<Self> {
        let global_layout = device
            .serialize_layout(&global_layout())
            .map_err(|e| layout_error("global", e))?;
        let local_layout = device
            .serialize_layout(&local_layout())
            .map_err(|e| layout_error("local", e))?;
        let library = device.load_library(library)?;

        let techniques = TechniqueId::ALL
            .into_iter()
            .map(|id| Self::register(device, library, id, &global_layout, &local_layout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            techniques,
            library,
            global_layout,
            local_layout,
        })
    }

    fn register(
        device: &dyn RayDevice,
        library: LibraryId,
        id: TechniqueId,
        global_layout: &SerializedLayout,
        local_layout: &SerializedLayout,
    ) -> Result<Technique> {
        let programs = id.programs();
        let missing = |export: &str| Error::MissingExport {
            technique: id.name(),
            export: export.to_string(),
        };

        let pipeline = device
            .create_pipeline(&PipelineDesc {
                label: id.name(),
                library,
                ray_generation: programs.ray_generation,
                miss: programs.miss,
                hit_group: HitGroupDesc {
                    name: programs.hit_group,
                    closest_hit: programs.closest_hit,
                    any_hit: programs.any_hit,
                },
                max_recursion: MAX_RECURSION,
                payload_size: PAYLOAD_SIZE,
                attribute_size: ATTRIBUTE_SIZE,
                global_layout,
                local_layout,
            })
            .map_err(|e| match e {
                DeviceError::MissingExport(export) => missing(&export),
                other => other.into(),
            })?;

        let stack = |export: &str| device.program_stack_size(pipeline, export).ok_or_else(|| missing(export));
        let stack_size = stack_size_budget(
            stack(programs.ray_generation)?,
            stack(programs.closest_hit)?,
            stack(programs.any_hit)?,
            stack(programs.miss)?,
            MAX_RECURSION,
        );
        // The implicit estimate only covers one level of recursion
        device.set_pipeline_stack_size(pipeline, stack_size)?;

        let identifier = |export: &str| device.program_identifier(pipeline, export).ok_or_else(|| missing(export));
        let technique = Technique {
            id,
            pipeline,
            max_recursion: MAX_RECURSION,
            stack_size,
            ray_generation: identifier(programs.ray_generation)?,
            miss: identifier(programs.miss)?,
            hit_group: identifier(programs.hit_group)?,
        };
        tracing::info!(technique = %id, stack = stack_size, "technique registered");
        Ok(technique)
    }

    pub fn get(&self, id: TechniqueId) -> &Technique {
        &self.techniques[id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Technique> {
        self.techniques.iter()
    }

    pub fn library(&self) -> LibraryId {
        self.library
    }

    pub fn global_layout(&self) -> &SerializedLayout {
        &self.global_layout
    }

    pub fn local_layout(&self) -> &SerializedLayout {
        &self.local_layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::software::{builtin_library, SoftwareDevice};

    #[test]
    fn test_budget_formula() {
        assert_eq!(stack_size_budget(64, 192, 32, 16, 2), 64 + 2 * 192);
        assert_eq!(stack_size_budget(10, 1, 40, 2, 1), 50);
    }

    #[test]
    fn test_program_table_order() {
        for id in TechniqueId::ALL {
            assert_eq!(TechniqueId::ALL[id as usize], id);
        }
        assert_eq!(TechniqueId::ShadowRays.programs().miss, "ShadowMiss");
        assert_eq!(
            TechniqueId::ScreenSpaceReflectionTraversal.programs().ray_generation,
            "ScreenSpaceReflectionRayGen"
        );
    }

    #[test]
    fn test_registry_sets_explicit_budget() {
        let device = SoftwareDevice::new();
        let registry = TechniqueRegistry::build(&device, &builtin_library()).expect("registry");
        for technique in registry.iter() {
            let p = technique.programs();
            let size = |e: &str| device.program_stack_size(technique.pipeline, e).expect("export");
            let floor = size(p.ray_generation)
                + MAX_RECURSION as u64 * size(p.closest_hit).max(size(p.any_hit)).max(size(p.miss));
            assert!(technique.stack_size >= floor);
            assert_eq!(device.pipeline_stack_size(technique.pipeline), Some(technique.stack_size));
        }
    }

    #[test]
    fn test_missing_export_names_technique() {
        let device = SoftwareDevice::new();
        let library = ProgramLibrary::new(
            "partial",
            b"PrimaryRayGen\nPrimaryClosestHit\nAlphaTestAnyHit\nPrimaryMiss\n".to_vec(),
        );
        let err = TechniqueRegistry::build(&device, &library).unwrap_err();
        match err {
            Error::MissingExport { technique, export } => {
                assert_eq!(technique, "ScreenSpaceReflectionTraversal");
                assert_eq!(export, "ScreenSpaceReflectionRayGen");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
