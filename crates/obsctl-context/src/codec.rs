//! Reading and writing the registry file.
//!
//! The file lives at `$OBSCTL_CONFIG_PATH` when set, otherwise at
//! `<user config dir>/obsctl/config.json`.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ContextError, Result};
use crate::model::Registry;

/// Environment variable overriding the registry file location.
pub const CONFIG_PATH_ENV: &str = "OBSCTL_CONFIG_PATH";

const CONFIG_DIR_NAME: &str = "obsctl";
const CONFIG_FILE_NAME: &str = "config.json";

/// Resolve the registry path from the current environment.
pub fn config_path() -> PathBuf {
    config_path_from(std::env::var_os(CONFIG_PATH_ENV))
}

/// Resolve the registry path given the value of the override variable.
pub fn config_path_from(env_override: Option<OsString>) -> PathBuf {
    if let Some(path) = env_override.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }

    match dirs::config_dir() {
        Some(dir) => dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME),
        None => PathBuf::from(CONFIG_FILE_NAME),
    }
}

/// Load the registry, creating an empty file (and its directory) if needed.
/// An empty file decodes to an empty registry.
pub fn load(path: &Path) -> Result<Registry> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            ensure_parent_dir(path)?;
            open_options()
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .map_err(|e| ContextError::io(path, e))?;
            debug!(path = %path.display(), "created config file");
            File::open(path).map_err(|e| ContextError::io(path, e))?
        }
        Err(e) => return Err(ContextError::io(path, e)),
    };

    let mut raw = String::new();
    file.read_to_string(&mut raw)
        .map_err(|e| ContextError::io(path, e))?;

    if raw.trim().is_empty() {
        debug!(path = %path.display(), "config file is empty");
        return Ok(Registry::default());
    }

    let registry = serde_json::from_str(&raw).map_err(|source| ContextError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "read and parsed config file");
    Ok(registry)
}

/// Overwrite the registry file with `registry`.
pub fn save(path: &Path, registry: &Registry) -> Result<()> {
    ensure_parent_dir(path)?;

    let mut encoded =
        serde_json::to_vec_pretty(registry).map_err(|e| ContextError::io(path, e.into()))?;
    encoded.push(b'\n');

    let mut file = open_options()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path)
        .map_err(|e| ContextError::io(path, e))?;
    file.write_all(&encoded)
        .and_then(|()| file.flush())
        .map_err(|e| ContextError::io(path, e))?;

    debug!(path = %path.display(), "saved config file");
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| ContextError::io(dir, e))
}

fn open_options() -> OpenOptions {
    #[allow(unused_mut)]
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}
