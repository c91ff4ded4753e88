//! Loading compiled shaders into the engine.
//!
//! Shaders are keyed by a blake3 hash of their compiled file path and
//! modification time, so an edited file loads again under a new key while
//! an unchanged one is a cache hit. Source files are compiled next to
//! themselves when the compiled file is missing or older. A shader that
//! fails to load is remembered as failed and not retried.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::engine::ShadingEngine;
use crate::error::OslError;
use crate::query::ShaderQuery;

/// Compiles shader source into bytecode.
pub trait OslSourceCompiler: Send + Sync {
    fn compile(&self, input: &Path, output: &Path) -> Result<(), OslError>;
}

/// Runs the standalone `oslc` executable.
#[derive(Debug, Clone)]
pub struct Oslc {
    pub program: PathBuf,
    /// Directory holding the renderer's standard shader headers.
    pub include_dir: Option<PathBuf>,
}

impl OslSourceCompiler for Oslc {
    fn compile(&self, input: &Path, output: &Path) -> Result<(), OslError> {
        let mut command = Command::new(&self.program);
        command.arg("-o").arg(output);
        if let Some(dir) = &self.include_dir {
            command.arg(format!("-I{}", dir.display()));
        }
        command.arg(input);

        let failed = |message: String| OslError::SourceCompile { path: input.to_path_buf(), message };
        let out = command.output().map_err(|e| failed(e.to_string()))?;
        if !out.status.success() {
            return Err(failed(String::from_utf8_lossy(&out.stderr).trim().to_string()));
        }
        Ok(())
    }
}

/// Where shaders come from.
#[derive(Clone)]
pub struct LoaderSettings {
    /// Directory searched for bare shader names.
    pub user_shader_path: Option<PathBuf>,
    pub source_compiler: Arc<dyn OslSourceCompiler>,
}

/// What the cache knows about a loaded shader.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedShader {
    /// `None` when the bytecode loaded but could not be queried.
    pub query: Option<ShaderQuery>,
    pub has_surface_emission: bool,
    pub has_surface_transparent: bool,
    pub has_surface_bssrdf: bool,
}

impl LoadedShader {
    /// Closure use is detected by the closure names present in the
    /// bytecode.
    fn from_bytecode(bytecode: &str, query: Option<ShaderQuery>) -> Self {
        LoadedShader {
            query,
            has_surface_emission: bytecode.contains("\"emission\""),
            has_surface_transparent: bytecode.contains("\"transparent\""),
            has_surface_bssrdf: bytecode.contains("\"bssrdf\""),
        }
    }
}

/// Cache key for a file at a given modification time.
pub fn filepath_hash(path: &Path, modified: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update(&modified.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Modification time in nanoseconds, or zero when the file is missing.
fn modified_time(path: &Path) -> u64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos() as u64)
}

pub struct ShaderCache {
    /// `None` marks a shader that failed to load.
    loaded: HashMap<String, Option<LoadedShader>>,
    settings: LoaderSettings,
}

impl ShaderCache {
    pub fn new(settings: LoaderSettings) -> Self {
        ShaderCache { loaded: HashMap::new(), settings }
    }

    /// The key of an already loaded shader. Errors if the key is known to
    /// have failed.
    fn test_loaded(&self, key: &str) -> Result<Option<String>, OslError> {
        match self.loaded.get(key) {
            Some(Some(_)) => Ok(Some(key.to_string())),
            Some(None) => {
                tracing::warn!(key, "skipping shader that failed to load earlier");
                Err(OslError::PreviouslyFailed { key: key.to_string() })
            }
            None => Ok(None),
        }
    }

    fn remember_failure(&mut self, key: String) {
        self.loaded.insert(key, None);
    }

    /// Loads a `.osl` source, a `.oso` file, or a bare shader name found in
    /// the user shader directory. Returns the shader's cache key, which is
    /// also its name in the engine.
    pub fn load_file(&mut self, engine: &mut dyn ShadingEngine, path: &Path) -> Result<String, OslError> {
        let extension = path.extension().and_then(OsStr::to_str);
        let mut modified = modified_time(path);

        let compiled = match extension {
            Some("osl") => {
                let oso = path.with_extension("oso");
                let oso_modified = modified_time(&oso);
                if oso_modified != 0 {
                    if let Some(key) = self.test_loaded(&filepath_hash(&oso, oso_modified))? {
                        return Ok(key);
                    }
                }
                if oso_modified == 0 || oso_modified < modified {
                    let source_key = filepath_hash(path, modified);
                    self.test_loaded(&source_key)?;
                    tracing::info!(source = %path.display(), "compiling shader source");
                    if let Err(error) = self.settings.source_compiler.compile(path, &oso) {
                        tracing::warn!(source = %path.display(), %error, "shader source failed to compile");
                        self.remember_failure(source_key);
                        return Err(error);
                    }
                    modified = modified_time(&oso);
                } else {
                    modified = oso_modified;
                }
                oso
            }
            Some("oso") => path.to_path_buf(),
            None if path.parent().is_some_and(|p| p.as_os_str().is_empty()) => {
                let name = path.to_string_lossy();
                let dir = self
                    .settings
                    .user_shader_path
                    .as_ref()
                    .ok_or_else(|| OslError::NoSearchPath { name: name.to_string() })?;
                let oso = dir.join(format!("{name}.oso"));
                modified = modified_time(&oso);
                oso
            }
            _ => return Err(OslError::UnknownShaderFile { path: path.to_path_buf() }),
        };

        let key = filepath_hash(&compiled, modified);
        if let Some(key) = self.test_loaded(&key)? {
            return Ok(key);
        }

        match fs::read_to_string(&compiled) {
            Ok(bytecode) => self.load_bytecode(engine, &key, &bytecode),
            Err(source) => {
                tracing::warn!(path = %compiled.display(), %source, "failed to read shader");
                self.remember_failure(key);
                Err(OslError::Read { path: compiled, source })
            }
        }
    }

    /// Registers bytecode under `hash` unless it is already loaded.
    pub fn load_bytecode(
        &mut self,
        engine: &mut dyn ShadingEngine,
        hash: &str,
        bytecode: &str,
    ) -> Result<String, OslError> {
        if let Some(key) = self.test_loaded(hash)? {
            return Ok(key);
        }
        engine.load_memory_compiled_shader(hash, bytecode)?;

        let query = match ShaderQuery::parse(bytecode) {
            Ok(query) => Some(query),
            Err(error) => {
                tracing::warn!(hash, %error, "shader parameter query failed");
                None
            }
        };
        self.loaded.insert(hash.to_string(), Some(LoadedShader::from_bytecode(bytecode, query)));
        tracing::debug!(hash, "loaded shader bytecode");
        Ok(hash.to_string())
    }

    pub fn info(&self, key: &str) -> Option<&LoadedShader> {
        self.loaded.get(key).and_then(Option::as_ref)
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.info(key).is_some()
    }

    /// Loaded and failed entries.
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RecordingEngine;

    struct NoCompiler;

    impl OslSourceCompiler for NoCompiler {
        fn compile(&self, input: &Path, _output: &Path) -> Result<(), OslError> {
            Err(OslError::SourceCompile { path: input.to_path_buf(), message: "unavailable".into() })
        }
    }

    fn new_cache(user: Option<PathBuf>) -> ShaderCache {
        ShaderCache::new(LoaderSettings { user_shader_path: user, source_compiler: Arc::new(NoCompiler) })
    }

    const BYTECODE: &str = "OpenShadingLanguage 1.00\nshader glow\n\
oparam\tclosure color\tBSDF\t\t%write{0,0}\n\
code ___main___\n\tclosure\tBSDF\t\"emission\"\n";

    #[test]
    fn hash_depends_on_path_and_time() {
        let a = filepath_hash(Path::new("/s/a.oso"), 1);
        assert_eq!(a, filepath_hash(Path::new("/s/a.oso"), 1));
        assert_ne!(a, filepath_hash(Path::new("/s/a.oso"), 2));
        assert_ne!(a, filepath_hash(Path::new("/s/b.oso"), 1));
    }

    #[test]
    fn bytecode_loads_once_and_detects_closures() {
        let mut cache = new_cache(None);
        let mut engine = RecordingEngine::new();
        let key = cache.load_bytecode(&mut engine, "abc", BYTECODE).unwrap();
        assert_eq!(cache.load_bytecode(&mut engine, "abc", BYTECODE).unwrap(), key);
        assert_eq!(engine.calls().len(), 1);

        let info = cache.info(&key).unwrap();
        assert!(info.has_surface_emission);
        assert!(!info.has_surface_transparent);
        assert_eq!(info.query.as_ref().unwrap().shader_name, "glow");
    }

    #[test]
    fn unreadable_files_are_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = new_cache(None);
        let mut engine = RecordingEngine::new();
        let missing = dir.path().join("missing.oso");
        assert!(matches!(cache.load_file(&mut engine, &missing), Err(OslError::Read { .. })));
        assert!(matches!(
            cache.load_file(&mut engine, &missing),
            Err(OslError::PreviouslyFailed { .. })
        ));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bare_names_resolve_in_the_user_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("glow.oso"), BYTECODE).unwrap();
        let mut engine = RecordingEngine::new();

        let mut cache = new_cache(Some(dir.path().to_path_buf()));
        let key = cache.load_file(&mut engine, Path::new("glow")).unwrap();
        assert!(cache.is_loaded(&key));
        assert!(engine.is_loaded(&key));

        let mut unconfigured = new_cache(None);
        assert!(matches!(
            unconfigured.load_file(&mut engine, Path::new("glow")),
            Err(OslError::NoSearchPath { .. })
        ));
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let mut engine = RecordingEngine::new();
        let err = new_cache(None).load_file(&mut engine, Path::new("/shaders/wood.txt")).unwrap_err();
        assert!(matches!(err, OslError::UnknownShaderFile { .. }));
    }
}
