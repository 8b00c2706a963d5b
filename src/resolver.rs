//! Engine executable discovery.
//!
//! Tiers are tried in order and the first hit wins: well-known install paths, a `which`
//! lookup, then probing interpreters for the engine module and synthesizing a wrapper
//! script. Nothing is cached; every cycle resolves again.

use crate::error::ResolveError;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

pub const ENGINE_NAME: &str = "good-night";
pub const ENGINE_MODULE: &str = "good_night";
const PROBE_SENTINEL: &str = "GOOD_NIGHT_IMPORT_OK";
const PYTHON_VERSIONS: &[&str] = &["3.13", "3.12", "3.11", "3.10"];

/// How the executable was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationSource {
    WellKnown,
    PathLookup,
    InterpreterWrapper { interpreter: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableLocation {
    pub path: PathBuf,
    pub source: LocationSource,
}

/// Host interactions the resolver needs. Swapped out in tests.
pub trait SystemProbe: Send + Sync {
    fn is_executable(&self, path: &Path) -> bool;
    /// PATH lookup for `name`, or `None` if nothing matched. May carry surrounding whitespace.
    fn which(&self, name: &str) -> Option<String>;
    /// Whether `interpreter -c <program>` exits 0 and prints `sentinel`.
    fn probe_interpreter(&self, interpreter: &str, program: &str, sentinel: &str) -> bool;
    fn write_wrapper(&self, path: &Path, script: &str) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub engine_name: String,
    pub module: String,
    pub well_known_paths: Vec<PathBuf>,
    pub interpreters: Vec<String>,
    pub wrapper_path: PathBuf,
}

impl ResolverConfig {
    /// Default search locations for a user whose home directory is `home`.
    pub fn for_home(home: &Path) -> Self {
        let bin = ENGINE_NAME;
        let mut well_known_paths = vec![
            PathBuf::from("/usr/local/bin").join(bin),
            PathBuf::from("/opt/homebrew/bin").join(bin),
            home.join(".local/bin").join(bin),
        ];
        for v in PYTHON_VERSIONS {
            well_known_paths.push(home.join(format!("Library/Python/{v}/bin")).join(bin));
        }
        for v in PYTHON_VERSIONS {
            well_known_paths.push(
                PathBuf::from(format!("/Library/Frameworks/Python.framework/Versions/{v}/bin"))
                    .join(bin),
            );
        }

        Self {
            engine_name: ENGINE_NAME.to_string(),
            module: ENGINE_MODULE.to_string(),
            well_known_paths,
            interpreters: vec![
                "/opt/homebrew/bin/python3".to_string(),
                "/usr/local/bin/python3".to_string(),
                "/usr/bin/python3".to_string(),
                "python3".to_string(),
            ],
            wrapper_path: std::env::temp_dir().join(format!("{ENGINE_NAME}-wrapper.sh")),
        }
    }
}

#[derive(Clone)]
pub struct ExecutableResolver {
    config: ResolverConfig,
    probe: Arc<dyn SystemProbe>,
}

impl ExecutableResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self::with_probe(config, Arc::new(HostProbe))
    }

    pub fn with_probe(config: ResolverConfig, probe: Arc<dyn SystemProbe>) -> Self {
        Self { config, probe }
    }

    pub fn resolve(&self) -> Result<ExecutableLocation, ResolveError> {
        if let Some(path) = self
            .config
            .well_known_paths
            .iter()
            .find(|p| self.probe.is_executable(p))
        {
            info!(path = %path.display(), "engine found at well-known path");
            return Ok(ExecutableLocation {
                path: path.clone(),
                source: LocationSource::WellKnown,
            });
        }
        debug!("engine not at any well-known path");

        if let Some(found) = self.probe.which(&self.config.engine_name) {
            let trimmed = found.trim();
            if !trimmed.is_empty() {
                info!(path = trimmed, "engine found on PATH");
                return Ok(ExecutableLocation {
                    path: PathBuf::from(trimmed),
                    source: LocationSource::PathLookup,
                });
            }
        }
        debug!(name = %self.config.engine_name, "PATH lookup came back empty");

        let program = format!("import {}; print('{PROBE_SENTINEL}')", self.config.module);
        for interpreter in &self.config.interpreters {
            if !self
                .probe
                .probe_interpreter(interpreter, &program, PROBE_SENTINEL)
            {
                debug!(interpreter, "interpreter cannot import engine module");
                continue;
            }
            let script = wrapper_script(interpreter, &self.config.module);
            match self.probe.write_wrapper(&self.config.wrapper_path, &script) {
                Ok(()) => {
                    info!(
                        interpreter,
                        wrapper = %self.config.wrapper_path.display(),
                        "engine reachable as module; using wrapper script"
                    );
                    return Ok(ExecutableLocation {
                        path: self.config.wrapper_path.clone(),
                        source: LocationSource::InterpreterWrapper {
                            interpreter: interpreter.clone(),
                        },
                    });
                }
                Err(e) => {
                    debug!(interpreter, error = %e, "failed to write wrapper script");
                }
            }
        }

        info!("engine executable not found");
        Err(ResolveError::NotFound)
    }
}

fn wrapper_script(interpreter: &str, module: &str) -> String {
    format!("#!/bin/sh\nexec \"{interpreter}\" -m {module}.cli.main \"$@\"\n")
}

/// Probe backed by the real file system and process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl SystemProbe for HostProbe {
    fn is_executable(&self, path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            std::fs::metadata(path)
                .map(|m| m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        }

        #[cfg(not(unix))]
        {
            true
        }
    }

    fn which(&self, name: &str) -> Option<String> {
        which::which(name)
            .ok()
            .map(|path| path.to_string_lossy().into_owned())
    }

    fn probe_interpreter(&self, interpreter: &str, program: &str, sentinel: &str) -> bool {
        Command::new(interpreter)
            .arg("-c")
            .arg(program)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).contains(sentinel))
            .unwrap_or(false)
    }

    fn write_wrapper(&self, path: &Path, script: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, script)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }

        Ok(())
    }
}
