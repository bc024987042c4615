//! Built-in programs and compiled pipelines of the software device.
//!
//! A program library blob is UTF-8 text with one export name per line
//! (`#` starts a comment). Each export must name a built-in [`Kernel`].

use crate::device::{
    BindingParam, DeviceError, PipelineDesc, ProgramIdentifier, ProgramLibrary,
    PROGRAM_IDENTIFIER_SIZE,
};
use crate::util::align_up;

const IDENTIFIER_MAGIC: &[u8; 4] = b"SWRT";

/// Program stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    RayGeneration,
    ClosestHit,
    AnyHit,
    Miss,
}

/// Built-in program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kernel {
    PrimaryRayGen,
    ScreenSpaceReflectionRayGen,
    ShadowRayGen,
    PrimaryClosestHit,
    DiffuseClosestHit,
    ReflectionClosestHit,
    ShadowClosestHit,
    AlphaTestAnyHit,
    PrimaryMiss,
    ShadowMiss,
}

impl Kernel {
    pub const ALL: [Kernel; 10] = [
        Self::PrimaryRayGen,
        Self::ScreenSpaceReflectionRayGen,
        Self::ShadowRayGen,
        Self::PrimaryClosestHit,
        Self::DiffuseClosestHit,
        Self::ReflectionClosestHit,
        Self::ShadowClosestHit,
        Self::AlphaTestAnyHit,
        Self::PrimaryMiss,
        Self::ShadowMiss,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PrimaryRayGen => "PrimaryRayGen",
            Self::ScreenSpaceReflectionRayGen => "ScreenSpaceReflectionRayGen",
            Self::ShadowRayGen => "ShadowRayGen",
            Self::PrimaryClosestHit => "PrimaryClosestHit",
            Self::DiffuseClosestHit => "DiffuseClosestHit",
            Self::ReflectionClosestHit => "ReflectionClosestHit",
            Self::ShadowClosestHit => "ShadowClosestHit",
            Self::AlphaTestAnyHit => "AlphaTestAnyHit",
            Self::PrimaryMiss => "PrimaryMiss",
            Self::ShadowMiss => "ShadowMiss",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn stage(self) -> Stage {
        match self {
            Self::PrimaryRayGen | Self::ScreenSpaceReflectionRayGen | Self::ShadowRayGen => {
                Stage::RayGeneration
            }
            Self::PrimaryClosestHit
            | Self::DiffuseClosestHit
            | Self::ReflectionClosestHit
            | Self::ShadowClosestHit => Stage::ClosestHit,
            Self::AlphaTestAnyHit => Stage::AnyHit,
            Self::PrimaryMiss | Self::ShadowMiss => Stage::Miss,
        }
    }

    /// Stack bytes one invocation needs.
    pub fn stack_size(self) -> u64 {
        match self {
            Self::PrimaryRayGen => 64,
            Self::ScreenSpaceReflectionRayGen => 96,
            Self::ShadowRayGen => 48,
            Self::PrimaryClosestHit => 128,
            Self::DiffuseClosestHit => 192,
            Self::ReflectionClosestHit => 224,
            Self::ShadowClosestHit => 16,
            Self::AlphaTestAnyHit => 32,
            Self::PrimaryMiss => 16,
            Self::ShadowMiss => 8,
        }
    }
}

/// Library blob exporting every built-in program.
pub fn builtin_library() -> ProgramLibrary {
    let mut text = String::from("# software ray programs\n");
    for kernel in Kernel::ALL {
        text.push_str(kernel.name());
        text.push('\n');
    }
    ProgramLibrary::new("builtin", text.into_bytes())
}

/// Exports of a library blob.
pub(crate) fn parse_library(library: &ProgramLibrary) -> Result<Vec<(String, Kernel)>, DeviceError> {
    let text = std::str::from_utf8(&library.bytecode)
        .map_err(|e| DeviceError::MalformedLibrary(format!("{}: {}", library.label, e)))?;
    let mut exports = Vec::new();
    for line in text.lines() {
        let name = line.split('#').next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        let kernel = Kernel::from_name(name).ok_or_else(|| {
            DeviceError::MalformedLibrary(format!("{}: unknown export `{}`", library.label, name))
        })?;
        exports.push((name.to_string(), kernel));
    }
    if exports.is_empty() {
        return Err(DeviceError::MalformedLibrary(format!("{}: no exports", library.label)));
    }
    Ok(exports)
}

/// Identifier slot within a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum IdentifierSlot {
    RayGeneration = 0,
    Miss = 1,
    HitGroup = 2,
}

pub(crate) fn make_identifier(pipeline: u32, slot: IdentifierSlot) -> ProgramIdentifier {
    let mut bytes = [0u8; PROGRAM_IDENTIFIER_SIZE];
    bytes[..4].copy_from_slice(IDENTIFIER_MAGIC);
    bytes[4..8].copy_from_slice(&pipeline.to_le_bytes());
    bytes[8..12].copy_from_slice(&(slot as u32).to_le_bytes());
    ProgramIdentifier(bytes)
}

/// Byte offsets of the local arguments inside a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LocalOffsets {
    pub descriptor_table: Option<u64>,
    pub constants: Option<u64>,
}

impl LocalOffsets {
    /// Lay parameters out after the identifier, each at its natural alignment.
    pub fn from_params(params: &[BindingParam]) -> Self {
        let mut out = Self::default();
        let mut offset = PROGRAM_IDENTIFIER_SIZE as u64;
        for param in params {
            offset = align_up(offset, param.record_alignment());
            match param {
                BindingParam::DescriptorTable { .. } if out.descriptor_table.is_none() => {
                    out.descriptor_table = Some(offset)
                }
                BindingParam::Constants { .. } if out.constants.is_none() => {
                    out.constants = Some(offset)
                }
                _ => {}
            }
            offset += param.record_size();
        }
        out
    }
}

/// A named export bound to its kernel.
#[derive(Debug, Clone)]
pub(crate) struct Export {
    pub name: String,
    pub kernel: Kernel,
}

/// Compiled ray pipeline.
#[derive(Debug, Clone)]
pub(crate) struct SoftwarePipeline {
    pub label: String,
    pub index: u32,
    pub ray_generation: Export,
    pub miss: Export,
    pub hit_group: String,
    pub closest_hit: Export,
    pub any_hit: Export,
    pub max_recursion: u32,
    pub stack_size: u64,
    pub local: LocalOffsets,
}

impl SoftwarePipeline {
    /// Link a pipeline from library exports.
    pub fn link(
        index: u32,
        desc: &PipelineDesc<'_>,
        exports: &[(String, Kernel)],
        max_recursion_depth: u32,
    ) -> Result<Self, DeviceError> {
        if desc.max_recursion > max_recursion_depth {
            return Err(DeviceError::RecursionExceeded {
                depth: desc.max_recursion,
                max: max_recursion_depth,
            });
        }
        let resolve = |name: &str, stage: Stage| -> Result<Export, DeviceError> {
            let (_, kernel) = exports
                .iter()
                .find(|(n, _)| n == name)
                .ok_or_else(|| DeviceError::MissingExport(name.to_string()))?;
            if kernel.stage() != stage {
                return Err(DeviceError::MalformedLibrary(format!(
                    "export `{}` is a {:?} program, expected {:?}",
                    name,
                    kernel.stage(),
                    stage
                )));
            }
            Ok(Export {
                name: name.to_string(),
                kernel: *kernel,
            })
        };

        let ray_generation = resolve(desc.ray_generation, Stage::RayGeneration)?;
        let miss = resolve(desc.miss, Stage::Miss)?;
        let closest_hit = resolve(desc.hit_group.closest_hit, Stage::ClosestHit)?;
        let any_hit = resolve(desc.hit_group.any_hit, Stage::AnyHit)?;

        let mut pipeline = Self {
            label: desc.label.to_string(),
            index,
            ray_generation,
            miss,
            hit_group: desc.hit_group.name.to_string(),
            closest_hit,
            any_hit,
            max_recursion: desc.max_recursion,
            stack_size: 0,
            local: LocalOffsets::from_params(&desc.local_layout.layout.params),
        };
        // Implicit estimate: a single level of hit/miss shaders
        pipeline.stack_size = pipeline.stack_required(1);
        Ok(pipeline)
    }

    /// Largest per-level stack of the hit group and miss programs.
    pub fn max_level_stack(&self) -> u64 {
        self.closest_hit
            .kernel
            .stack_size()
            .max(self.any_hit.kernel.stack_size())
            .max(self.miss.kernel.stack_size())
    }

    /// Stack needed once traces nest `depth` levels deep.
    pub fn stack_required(&self, depth: u32) -> u64 {
        self.ray_generation.kernel.stack_size() + self.max_level_stack() * depth as u64
    }

    pub fn identifier(&self, export: &str) -> Option<ProgramIdentifier> {
        let slot = if export == self.ray_generation.name {
            IdentifierSlot::RayGeneration
        } else if export == self.miss.name {
            IdentifierSlot::Miss
        } else if export == self.hit_group {
            IdentifierSlot::HitGroup
        } else {
            return None;
        };
        Some(make_identifier(self.index, slot))
    }

    /// Stack size of an export. Hit-group members may be named
    /// `Group::closesthit` / `Group::anyhit` or by export name.
    pub fn export_stack_size(&self, export: &str) -> Option<u64> {
        if let Some((group, member)) = export.split_once("::") {
            if group != self.hit_group {
                return None;
            }
            return match member {
                "closesthit" => Some(self.closest_hit.kernel.stack_size()),
                "anyhit" => Some(self.any_hit.kernel.stack_size()),
                _ => None,
            };
        }
        [&self.ray_generation, &self.miss, &self.closest_hit, &self.any_hit]
            .into_iter()
            .find(|e| e.name == export)
            .map(|e| e.kernel.stack_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DescriptorRange, RangeKind};

    #[test]
    fn test_builtin_library_roundtrip() {
        let exports = parse_library(&builtin_library()).expect("builtin library parses");
        assert_eq!(exports.len(), Kernel::ALL.len());
    }

    #[test]
    fn test_library_rejects_unknown_export() {
        let lib = ProgramLibrary::new("bad", b"PrimaryRayGen\nNoSuchProgram\n".to_vec());
        assert!(matches!(parse_library(&lib), Err(DeviceError::MalformedLibrary(_))));
    }

    #[test]
    fn test_local_offsets_follow_natural_alignment() {
        let params = vec![
            BindingParam::DescriptorTable {
                ranges: vec![DescriptorRange {
                    kind: RangeKind::ShaderResource,
                    base_register: 0,
                    count: 3,
                }],
            },
            BindingParam::Constants { register: 0, count: 1 },
        ];
        let offsets = LocalOffsets::from_params(&params);
        assert_eq!(offsets.descriptor_table, Some(32));
        assert_eq!(offsets.constants, Some(40));
    }

    #[test]
    fn test_identifier_slots_differ() {
        let a = make_identifier(3, IdentifierSlot::RayGeneration);
        let b = make_identifier(3, IdentifierSlot::HitGroup);
        assert_ne!(a, b);
        assert_eq!(&a.0[..4], IDENTIFIER_MAGIC);
    }
}
