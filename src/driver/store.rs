use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::common::{Error, Result};
use crate::driver::config::Config;

/// The uniform entry point every compiled kernel exports: it unpacks the
/// flat argument vector into the typed kernel signature.
pub type KernelFn = unsafe extern "C" fn(*mut *mut c_void);

/// Persistent cache of compiled kernels.
///
/// On-disk layout under the object directory:
/// `<kernel_prefix><symbol>_<uid>.so` for single-symbol libraries and
/// `<library_prefix><name>_<uid>.idx` (newline-delimited symbol list)
/// next to `<library_prefix><name>_<uid>.so` for bundles. `uid` is a
/// 6-character alphanumeric tag generated once per process so concurrent
/// processes never collide on file names.
pub struct ObjectStore {
    object_dir: PathBuf,
    source_dir: PathBuf,
    kernel_prefix: String,
    library_prefix: String,
    uid: String,
    /// symbol -> library path it can be loaded from
    libraries: HashMap<String, PathBuf>,
    /// library path -> open handle
    handles: HashMap<PathBuf, libloading::Library>,
    /// symbol -> resolved entry point
    funcs: HashMap<String, KernelFn>,
}

impl ObjectStore {
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.object_dir)?;
        std::fs::create_dir_all(&config.source_dir)?;
        let store = ObjectStore {
            object_dir: config.object_dir.clone(),
            source_dir: config.source_dir.clone(),
            kernel_prefix: config.kernel_prefix.clone(),
            library_prefix: config.library_prefix.clone(),
            uid: gen_uid(),
            libraries: HashMap::new(),
            handles: HashMap::new(),
            funcs: HashMap::new(),
        };
        log::debug!("object store at {} (uid {})", store.object_dir.display(), store.uid);
        Ok(store)
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn object_path(&self, symbol: &str) -> PathBuf {
        self.object_dir.join(format!("{}{symbol}_{}.so", self.kernel_prefix, self.uid))
    }

    pub fn source_path(&self, symbol: &str) -> PathBuf {
        self.source_dir.join(format!("{}{symbol}_{}.c", self.kernel_prefix, self.uid))
    }

    /// The symbol's entry point is resolved and callable.
    pub fn ready(&self, symbol: &str) -> bool {
        self.funcs.contains_key(symbol)
    }

    /// A library for the symbol is known (resolved or not).
    pub fn knows(&self, symbol: &str) -> bool {
        self.funcs.contains_key(symbol) || self.libraries.contains_key(symbol)
    }

    /// Record where a symbol can be loaded from.
    pub fn insert_symbol(&mut self, symbol: String, library: PathBuf) {
        log::debug!("store: symbol {symbol} -> {}", library.display());
        self.libraries.insert(symbol, library);
    }

    /// Scan the object directory and resolve everything loadable: first
    /// `.idx` bundles, then lone single-kernel objects whose symbol is
    /// derived from the filename. Returns how many symbols resolved;
    /// libraries that fail to open are skipped with a warning.
    pub fn preload(&mut self) -> Result<usize> {
        for entry in std::fs::read_dir(&self.object_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.ends_with(".idx") {
                continue;
            }
            let library = path.with_extension("so");
            let listing = std::fs::read_to_string(&path)?;
            for symbol in listing.lines().map(str::trim).filter(|s| !s.is_empty()) {
                if !self.libraries.contains_key(symbol) {
                    self.insert_symbol(symbol.to_string(), library.clone());
                }
            }
        }
        for entry in std::fs::read_dir(&self.object_dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            let Some(symbol) = self.symbol_from_filename(name) else { continue };
            if !self.libraries.contains_key(&symbol) {
                self.insert_symbol(symbol, path);
            }
        }
        let known: Vec<(String, PathBuf)> =
            self.libraries.iter().map(|(s, p)| (s.clone(), p.clone())).collect();
        let mut nloaded = 0;
        for (symbol, library) in known {
            match self.load_from(&symbol, &library) {
                Ok(()) => nloaded += 1,
                Err(e) => log::warn!("preload: skipping {symbol}: {e}"),
            }
        }
        log::debug!("preload: {nloaded} symbols ready");
        Ok(nloaded)
    }

    /// `<kernel_prefix><symbol>_<uid6>.so` -> symbol.
    fn symbol_from_filename(&self, name: &str) -> Option<String> {
        let stem = name.strip_prefix(self.kernel_prefix.as_str())?.strip_suffix(".so")?;
        let (symbol, uid) = stem.rsplit_once('_')?;
        if symbol.is_empty() || uid.len() != 6 {
            return None;
        }
        Some(symbol.to_string())
    }

    /// Open the symbol's library (lazily) and resolve the mangled entry
    /// point `<kernel_prefix><symbol>`. Failure leaves the store as it
    /// was.
    pub fn load(&mut self, symbol: &str) -> Result<()> {
        if self.funcs.contains_key(symbol) {
            return Ok(());
        }
        let library = match self.libraries.get(symbol) {
            Some(path) => path.clone(),
            None => self.object_path(symbol),
        };
        self.load_from(symbol, &library)?;
        if !self.libraries.contains_key(symbol) {
            self.libraries.insert(symbol.to_string(), library);
        }
        Ok(())
    }

    fn load_from(&mut self, symbol: &str, library: &Path) -> Result<()> {
        if self.funcs.contains_key(symbol) {
            return Ok(());
        }
        let newly_opened = !self.handles.contains_key(library);
        if newly_opened {
            let handle = unsafe { libloading::Library::new(library) }.map_err(|e| {
                Error::Link { path: library.to_path_buf(), reason: e.to_string() }
            })?;
            self.handles.insert(library.to_path_buf(), handle);
        }
        let handle = self.handles.get(library).unwrap();
        let mangled = format!("{}{symbol}", self.kernel_prefix);
        let func = unsafe { handle.get::<KernelFn>(mangled.as_bytes()) };
        match func {
            Ok(sym) => {
                self.funcs.insert(symbol.to_string(), *sym);
                Ok(())
            }
            Err(e) => {
                if newly_opened {
                    self.handles.remove(library);
                }
                Err(Error::Link { path: library.to_path_buf(), reason: e.to_string() })
            }
        }
    }

    /// Invoke a resolved kernel with the packed argument vector.
    pub fn call(&self, symbol: &str, args: &mut [*mut c_void]) -> Result<()> {
        let func = self
            .funcs
            .get(symbol)
            .ok_or_else(|| Error::Runtime(format!("kernel {symbol} is not loaded")))?;
        unsafe { func(args.as_mut_ptr()) };
        Ok(())
    }
}

fn gen_uid() -> String {
    let mut rng = StdRng::seed_from_u64(std::process::id() as u64);
    (0..6).map(|_| rng.sample(Alphanumeric) as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> Config {
        Config {
            object_dir: dir.join("objects"),
            source_dir: dir.join("kernels"),
            ..Config::default()
        }
    }

    #[test]
    fn uid_is_six_alphanumeric_chars() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(&test_config(dir.path())).unwrap();
        assert_eq!(store.uid().len(), 6);
        assert!(store.uid().chars().all(|c| c.is_ascii_alphanumeric()));
        // Same process, same tag.
        let other = ObjectStore::new(&test_config(dir.path())).unwrap();
        assert_eq!(store.uid(), other.uid());
    }

    #[test]
    fn paths_follow_the_naming_convention() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(&test_config(dir.path())).unwrap();
        let obj = store.object_path("abc123");
        let name = obj.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("KRN_abc123_"));
        assert!(name.ends_with(".so"));
        assert!(store.source_path("abc123").to_str().unwrap().ends_with(".c"));
    }

    #[test]
    fn symbol_is_derived_from_filename() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(&test_config(dir.path())).unwrap();
        assert_eq!(
            store.symbol_from_filename("KRN_deadbeef_Ab12Cd.so"),
            Some("deadbeef".to_string())
        );
        assert_eq!(store.symbol_from_filename("LIB_deadbeef_Ab12Cd.so"), None);
        assert_eq!(store.symbol_from_filename("KRN_deadbeef.so"), None);
        assert_eq!(store.symbol_from_filename("KRN_x_y.idx"), None);
    }

    #[test]
    fn preload_scans_idx_bundles_and_lone_objects() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.object_dir).unwrap();
        std::fs::write(
            config.object_dir.join("LIB_batch_AAAAAA.idx"),
            "sym_one\nsym_two\n",
        )
        .unwrap();
        std::fs::write(config.object_dir.join("LIB_batch_AAAAAA.so"), b"not a library").unwrap();
        std::fs::write(config.object_dir.join("KRN_sym_three_BBBBBB.so"), b"not a library")
            .unwrap();
        let mut store = ObjectStore::new(&config).unwrap();
        // Nothing actually loads (the files are garbage), but the scan
        // must map every symbol and stay quiet about the failures.
        let nloaded = store.preload().unwrap();
        assert_eq!(nloaded, 0);
        assert!(store.knows("sym_one"));
        assert!(store.knows("sym_two"));
        assert!(store.knows("sym_three"));
        assert!(!store.ready("sym_one"));
    }

    #[test]
    fn load_failure_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ObjectStore::new(&test_config(dir.path())).unwrap();
        let err = store.load("nonexistent").unwrap_err();
        assert!(matches!(err, Error::Link { .. }));
        assert!(!store.knows("nonexistent"));
        assert!(store.handles.is_empty());
    }
}
