//! Persistent render settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::abi::HitConstants;
use crate::frame::Mode;
use crate::history::DEFAULT_MIN_BLEND;
use crate::scene::{sun_view_proj, SceneGeometry};
use crate::util::{Error, Mat4, Result, Vec3};

/// Per-frame settings supplied by the settings collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    // Ray path
    pub mode: Mode,
    pub camera_index: usize,
    /// Size of the targets the application allocates; dispatches follow
    /// the color target itself.
    pub width: u32,
    pub height: u32,

    // Temporal accumulation
    pub temporal_aa: bool,
    /// One-shot request, never persisted
    #[serde(skip)]
    pub reset_history: bool,
    pub min_blend: f32,

    // Lighting
    pub sun_direction: [f32; 3],
    pub sun_color: [f32; 3],
    pub sun_intensity: f32,
    pub ambient_color: [f32; 3],
    pub ambient_intensity: f32,

    // Shadows
    /// Half-extent of the shadow volume; `None` fits the scene bounds
    pub shadow_extent: Option<f32>,
    pub shadow_bias: f32,
    pub shadow_ray_offset: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            mode: Mode::Traversal,
            camera_index: 0,
            width: 320,
            height: 180,
            temporal_aa: false,
            reset_history: false,
            min_blend: DEFAULT_MIN_BLEND,
            sun_direction: [-0.4, -1.0, -0.3],
            sun_color: [1.0, 0.95, 0.85],
            sun_intensity: 2.5,
            ambient_color: [0.55, 0.65, 0.8],
            ambient_intensity: 0.3,
            shadow_extent: None,
            shadow_bias: 0.005,
            shadow_ray_offset: 0.01,
        }
    }
}

const MAX_RESOLUTION: u32 = 8192;

impl RenderSettings {
    /// Default settings file path
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("hybrid-rt");
            p.push("settings.json");
            p
        })
    }

    /// Load from the default path, falling back to defaults
    pub fn load() -> Self {
        match Self::path() {
            Some(path) if path.exists() => Self::load_from(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Load from an explicit path. Out-of-range values are clamped.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::SettingsNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&text)?;
        settings.clamp();
        Ok(settings)
    }

    /// Save to the default path
    pub fn save(&self) -> Result<()> {
        match Self::path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Replace invalid values with usable ones
    pub fn clamp(&mut self) {
        self.width = self.width.clamp(1, MAX_RESOLUTION);
        self.height = self.height.clamp(1, MAX_RESOLUTION);
        self.min_blend = if self.min_blend.is_finite() {
            self.min_blend.clamp(0.0, 1.0)
        } else {
            DEFAULT_MIN_BLEND
        };
        let dir = Vec3::from(self.sun_direction);
        if !dir.is_finite() || dir.length_squared() < 1e-8 {
            self.sun_direction = Self::default().sun_direction;
        }
        for value in [&mut self.sun_intensity, &mut self.ambient_intensity] {
            *value = if value.is_finite() { (*value).max(0.0) } else { 0.0 };
        }
        if let Some(extent) = self.shadow_extent {
            self.shadow_extent = (extent.is_finite() && extent > 0.0).then_some(extent);
        }
        self.shadow_bias = self.shadow_bias.max(0.0);
        self.shadow_ray_offset = self.shadow_ray_offset.max(0.0);
    }

    /// Normalized direction the sunlight travels
    pub fn sun_direction(&self) -> Vec3 {
        Vec3::from(self.sun_direction).normalize_or(Vec3::NEG_Y)
    }

    /// Shadow-map projection for a scene
    pub fn light_view_proj(&self, scene: &SceneGeometry) -> Mat4 {
        let (center, radius) = scene.bounding_sphere();
        sun_view_proj(self.sun_direction(), center, self.shadow_extent.unwrap_or(radius))
    }

    /// Hit-shading constants for a frame in `mode`
    pub fn hit_constants(&self, mode: Mode, light_view_proj: Mat4) -> HitConstants {
        let route = mode.route();
        let sun = Vec3::from(self.sun_color) * self.sun_intensity;
        let ambient = Vec3::from(self.ambient_color) * self.ambient_intensity;
        HitConstants {
            sun_direction: self.sun_direction().extend(0.0).to_array(),
            sun_color: sun.extend(1.0).to_array(),
            ambient: ambient.extend(1.0).to_array(),
            light_view_proj: light_view_proj.to_cols_array_2d(),
            shadow_params: [self.shadow_bias, self.shadow_ray_offset, 0.0, 0.0],
            reflections: route.reflections as u32,
            shadow_rays: route.shadow_rays as u32,
            _pad: [0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let settings = RenderSettings {
            mode: Mode::DiffuseShadowRays,
            temporal_aa: true,
            reset_history: true,
            width: 64,
            ..RenderSettings::default()
        };
        settings.save_to(&path).expect("save");
        let loaded = RenderSettings::load_from(&path).expect("load");
        assert_eq!(loaded.mode, Mode::DiffuseShadowRays);
        assert!(loaded.temporal_aa);
        assert!(!loaded.reset_history);
        assert_eq!(loaded.width, 64);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "mode": "Reflections", "width": 0, "min_blend": 7.0 }"#).expect("write");
        let loaded = RenderSettings::load_from(&path).expect("load");
        assert_eq!(loaded.mode, Mode::Reflections);
        assert_eq!(loaded.width, 1);
        assert_eq!(loaded.min_blend, 1.0);
        assert_eq!(loaded.height, RenderSettings::default().height);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RenderSettings::load_from(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, Error::SettingsNotFound(_)));
        assert_eq!(err.kind(), crate::util::ErrorKind::Config);
    }

    #[test]
    fn test_hit_constants_flags() {
        let settings = RenderSettings::default();
        let hit = settings.hit_constants(Mode::DiffuseShadowRays, Mat4::IDENTITY);
        assert_eq!((hit.reflections, hit.shadow_rays), (0, 1));
        let hit = settings.hit_constants(Mode::Reflections, Mat4::IDENTITY);
        assert_eq!((hit.reflections, hit.shadow_rays), (1, 0));
        let dir = Vec3::from_slice(&hit.sun_direction[..3]);
        assert!((dir.length() - 1.0).abs() < 1e-5);
        assert_eq!(hit.shadow_params[0], settings.shadow_bias);
    }

    #[test]
    fn test_clamp_rejects_zero_sun() {
        let mut settings = RenderSettings {
            sun_direction: [0.0; 3],
            shadow_extent: Some(-1.0),
            ..RenderSettings::default()
        };
        settings.clamp();
        assert_eq!(settings.sun_direction, RenderSettings::default().sun_direction);
        assert_eq!(settings.shadow_extent, None);
    }
}
