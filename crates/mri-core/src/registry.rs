use std::collections::HashMap;
use std::path::PathBuf;

/// The input space a model expects its volume in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSpace {
    Native,
    Conformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationPolicy {
    Auto,
    Fixed,
    Percentile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Grace,
    Domino,
    DominoPlusPlus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionVariant {
    Conv,
    Perceptron,
}

/// Static entry for one segmentation model, keyed by `model_name`. Immutable
/// for the process lifetime; unknown names fail fast at orchestration.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub name: &'static str,
    pub kind: ModelKind,
    pub input_space: InputSpace,
    pub checkpoint_path: PathBuf,
    pub spatial_size: (usize, usize, usize),
    pub num_classes: usize,
    pub normalization_policy: NormalizationPolicy,
    pub interp_mode: &'static str,
    pub percentile_range: (f64, f64),
    pub fixed_range: (f64, f64),
    pub resize_target: (usize, usize, usize),
    pub projection_variant: ProjectionVariant,
}

/// Compile-time table of every known segmentation model. Checkpoint paths
/// are resolved against the configured model root at construction time.
pub struct ModelRegistry {
    entries: HashMap<&'static str, ModelEntry>,
}

impl ModelRegistry {
    pub fn with_model_root(model_root: &std::path::Path) -> Self {
        let ckpt = |file: &str| model_root.join(file);

        let defs: Vec<ModelEntry> = vec![
            ModelEntry {
                name: "grace-native",
                kind: ModelKind::Grace,
                input_space: InputSpace::Native,
                checkpoint_path: ckpt("grace_native.pth"),
                spatial_size: (64, 64, 64),
                num_classes: 12,
                normalization_policy: NormalizationPolicy::Auto,
                interp_mode: "bilinear",
                percentile_range: (20.0, 80.0),
                fixed_range: (0.0, 255.0),
                resize_target: (176, 256, 256),
                projection_variant: ProjectionVariant::Conv,
            },
            ModelEntry {
                name: "grace-fs",
                kind: ModelKind::Grace,
                input_space: InputSpace::Conformed,
                checkpoint_path: ckpt("grace_fs.pth"),
                spatial_size: (256, 256, 256),
                num_classes: 12,
                normalization_policy: NormalizationPolicy::Auto,
                interp_mode: "bilinear",
                percentile_range: (20.0, 80.0),
                fixed_range: (0.0, 255.0),
                resize_target: (256, 256, 256),
                projection_variant: ProjectionVariant::Perceptron,
            },
            ModelEntry {
                name: "domino-native",
                kind: ModelKind::Domino,
                input_space: InputSpace::Native,
                checkpoint_path: ckpt("domino_native.pth"),
                spatial_size: (64, 64, 64),
                num_classes: 12,
                normalization_policy: NormalizationPolicy::Auto,
                interp_mode: "bilinear",
                percentile_range: (25.0, 75.0),
                fixed_range: (0.0, 255.0),
                resize_target: (176, 256, 256),
                projection_variant: ProjectionVariant::Perceptron,
            },
            ModelEntry {
                name: "domino-fs",
                kind: ModelKind::Domino,
                input_space: InputSpace::Conformed,
                checkpoint_path: ckpt("domino_fs.pth"),
                spatial_size: (256, 256, 256),
                num_classes: 12,
                normalization_policy: NormalizationPolicy::Auto,
                interp_mode: "bilinear",
                percentile_range: (25.0, 75.0),
                fixed_range: (0.0, 255.0),
                resize_target: (256, 256, 256),
                projection_variant: ProjectionVariant::Perceptron,
            },
            ModelEntry {
                name: "dominopp-native",
                kind: ModelKind::DominoPlusPlus,
                input_space: InputSpace::Native,
                checkpoint_path: ckpt("dominopp_native.pth"),
                spatial_size: (64, 64, 64),
                num_classes: 12,
                normalization_policy: NormalizationPolicy::Auto,
                interp_mode: "bilinear",
                percentile_range: (25.0, 75.0),
                fixed_range: (0.0, 255.0),
                resize_target: (176, 256, 256),
                projection_variant: ProjectionVariant::Perceptron,
            },
            ModelEntry {
                name: "dominopp-fs",
                kind: ModelKind::DominoPlusPlus,
                input_space: InputSpace::Conformed,
                checkpoint_path: ckpt("dominopp_fs.pth"),
                spatial_size: (256, 256, 256),
                num_classes: 12,
                normalization_policy: NormalizationPolicy::Auto,
                interp_mode: "bilinear",
                percentile_range: (25.0, 75.0),
                fixed_range: (0.0, 255.0),
                resize_target: (256, 256, 256),
                projection_variant: ProjectionVariant::Perceptron,
            },
        ];

        Self {
            entries: defs.into_iter().map(|e| (e.name, e)).collect(),
        }
    }

    pub fn get(&self, model_name: &str) -> Option<&ModelEntry> {
        self.entries.get(model_name)
    }

    pub fn list(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_six_models_present() {
        let registry = ModelRegistry::with_model_root(std::path::Path::new("/models"));
        let names = registry.list();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"grace-native"));
        assert!(names.contains(&"dominopp-fs"));
    }

    #[test]
    fn unknown_model_resolves_to_none() {
        let registry = ModelRegistry::with_model_root(std::path::Path::new("/models"));
        assert!(registry.get("not-a-model").is_none());
    }
}
