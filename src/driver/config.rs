use std::path::PathBuf;

use crate::backend::{BackendKind, ParallelAnnotation};

/// Engine configuration: store directories, naming, backend selection and
/// the external compiler command line. `from_env` overrides the defaults
/// with `ARRAYJIT_*` variables; unparsable values are logged and ignored.
#[derive(Debug, Clone)]
pub struct Config {
    pub object_dir: PathBuf,
    pub source_dir: PathBuf,
    pub kernel_prefix: String,
    pub library_prefix: String,
    pub backend: BackendKind,
    pub annotation: ParallelAnnotation,
    /// Bases holding more elements than this are never scalar-replaced.
    pub scalar_replacement_threshold: usize,
    pub compiler_cmd: String,
    pub compiler_flags: Vec<String>,
    pub compiler_link_flags: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let base = std::env::temp_dir().join("arrayjit");
        Config {
            object_dir: base.join("objects"),
            source_dir: base.join("kernels"),
            kernel_prefix: "KRN_".to_string(),
            library_prefix: "LIB_".to_string(),
            backend: BackendKind::Openmp,
            annotation: ParallelAnnotation::ParallelFor,
            scalar_replacement_threshold: usize::MAX,
            compiler_cmd: "cc".to_string(),
            compiler_flags: ["-O2", "-fopenmp", "-fPIC", "-shared", "-std=gnu99"]
                .map(String::from)
                .to_vec(),
            compiler_link_flags: vec!["-lm".to_string()],
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(v) = std::env::var("ARRAYJIT_OBJECT_DIR") {
            config.object_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ARRAYJIT_SOURCE_DIR") {
            config.source_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ARRAYJIT_KERNEL_PREFIX") {
            config.kernel_prefix = v;
        }
        if let Ok(v) = std::env::var("ARRAYJIT_LIBRARY_PREFIX") {
            config.library_prefix = v;
        }
        if let Ok(v) = std::env::var("ARRAYJIT_BACKEND") {
            match v.parse() {
                Ok(kind) => config.backend = kind,
                Err(e) => log::warn!("ARRAYJIT_BACKEND ignored: {e}"),
            }
        }
        if let Ok(v) = std::env::var("ARRAYJIT_PARALLEL") {
            match v.parse() {
                Ok(annot) => config.annotation = annot,
                Err(e) => log::warn!("ARRAYJIT_PARALLEL ignored: {e}"),
            }
        }
        if let Ok(v) = std::env::var("ARRAYJIT_SR_THRESHOLD") {
            match v.parse() {
                Ok(n) => config.scalar_replacement_threshold = n,
                Err(e) => log::warn!("ARRAYJIT_SR_THRESHOLD ignored: {e}"),
            }
        }
        if let Ok(v) = std::env::var("ARRAYJIT_CC") {
            config.compiler_cmd = v;
        }
        if let Ok(v) = std::env::var("ARRAYJIT_CC_FLAGS") {
            config.compiler_flags = v.split_whitespace().map(String::from).collect();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let c = Config::default();
        assert_eq!(c.kernel_prefix, "KRN_");
        assert_eq!(c.library_prefix, "LIB_");
        assert_eq!(c.backend, BackendKind::Openmp);
        assert!(c.compiler_flags.iter().any(|f| f == "-shared"));
    }

    #[test]
    fn backend_selector_parses() {
        assert_eq!("cpu".parse::<BackendKind>().unwrap(), BackendKind::Openmp);
        assert_eq!("device".parse::<BackendKind>().unwrap(), BackendKind::Opencl);
        assert!("vulkan".parse::<BackendKind>().is_err());
    }
}
