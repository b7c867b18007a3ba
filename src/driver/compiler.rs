use std::path::Path;
use std::process::Command;

use crate::common::{Error, Result};
use crate::driver::config::Config;

/// External compiler invocation. All process spawning for kernel
/// compilation is centralized here so the engine never deals with
/// `std::process::Command` building.
pub struct ExternalCompiler {
    cmd: String,
    flags: Vec<String>,
    link_flags: Vec<String>,
}

impl ExternalCompiler {
    pub fn from_config(config: &Config) -> Self {
        ExternalCompiler {
            cmd: config.compiler_cmd.clone(),
            flags: config.compiler_flags.clone(),
            link_flags: config.compiler_link_flags.clone(),
        }
    }

    /// Compile one kernel source into a shared object. On failure the
    /// source file is left in place for post-mortem.
    pub fn compile(&self, source: &Path, object: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.flags).arg(source).arg("-o").arg(object).args(&self.link_flags);
        log::debug!("compiling {} -> {}", source.display(), object.display());
        let result = cmd.output().map_err(|e| Error::Compile {
            status: -1,
            stderr: format!("failed to run {}: {e}", self.cmd),
            source_path: source.to_path_buf(),
        })?;
        if !result.status.success() {
            return Err(Error::Compile {
                status: result.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                source_path: source.to_path_buf(),
            });
        }
        Ok(())
    }

    /// Probe whether the configured compiler runs at all.
    pub fn available(&self) -> bool {
        Command::new(&self.cmd)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_compiler_is_a_compile_error() {
        let cc = ExternalCompiler {
            cmd: "arrayjit-no-such-compiler".to_string(),
            flags: vec![],
            link_flags: vec![],
        };
        let err = cc.compile(Path::new("/dev/null"), Path::new("/dev/null")).unwrap_err();
        assert!(matches!(err, Error::Compile { status: -1, .. }));
        assert!(!cc.available());
    }
}
