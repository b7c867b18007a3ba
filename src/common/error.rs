use std::path::PathBuf;

/// Errors that abort a batch. Everything here unwinds to the `execute`
/// entry point; the fusion pass communicates "does not fit this block"
/// through an ordinary return value, never through this type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reshape not divisible, shape mismatch, operand arity mismatch.
    #[error("structural error: {0}")]
    Structural(String),

    /// An instruction whose opcode has no emission template. Carries the
    /// pretty-printed instruction.
    #[error("instruction \"{0}\" not supported")]
    UnsupportedOpcode(String),

    /// The external compiler exited non-zero. The failing source is kept
    /// on disk for post-mortem.
    #[error("external compiler failed ({status}) on {}: {stderr}", source_path.display())]
    Compile {
        status: i32,
        stderr: String,
        source_path: PathBuf,
    },

    /// `dlopen`/`dlsym` failed; the store is left as it was.
    #[error("failed to link {}: {reason}", path.display())]
    Link { path: PathBuf, reason: String },

    /// Kernel invocation or another unrecoverable runtime condition.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach the pretty-printed form of the offending instruction.
    pub fn with_instr(self, pretty: &str) -> Self {
        match self {
            Error::Structural(msg) => Error::Structural(format!("{msg} (in \"{pretty}\")")),
            Error::Runtime(msg) => Error::Runtime(format!("{msg} (in \"{pretty}\")")),
            other => other,
        }
    }
}
