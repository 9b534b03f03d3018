use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{event, Level};
use uuid::Uuid;

const CONFIG_PERMISSIONS: u32 = 0o640;

/// A request body spooled to disk, removed again when dropped.
pub struct TempFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl TempFile {
    pub fn create(dir: &Path) -> io::Result<Self> {
        let path = dir.join(format!("quire-{}", Uuid::new_v4().simple()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(CONFIG_PERMISSIONS)
            .open(&path)?;

        event!(Level::TRACE, ?path, "created request file");
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A fresh handle positioned at the start, for a helper's standard input.
    pub fn reopen(&self) -> io::Result<File> {
        self.file.sync_data()?;
        File::open(&self.path)
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => event!(Level::TRACE, path = ?self.path, "removed request file"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                event!(Level::WARN, path = ?self.path, ?error, "failed to remove request file")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("failed to write new configuration {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to keep previous configuration as {path:?}")]
    Backup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to replace configuration {path:?}")]
    Replace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Replace the configuration file with an uploaded one.
///
/// The previous file is kept as `<name>.O` and the new one written to `<name>.N` before being
/// renamed into place, so readers never see a partial file.
pub fn install_config(upload: &TempFile, target: &Path) -> Result<(), InstallError> {
    let backup = with_suffix(target, ".O");
    let staged = with_suffix(target, ".N");

    fs::copy(upload.path(), &staged)
        .and_then(|_| fs::set_permissions(&staged, Permissions::from_mode(CONFIG_PERMISSIONS)))
        .map_err(|source| InstallError::Write {
            path: staged.clone(),
            source,
        })?;

    let backup_result = remove_if_present(&backup).and_then(|_| match fs::hard_link(target, &backup) {
        // First install, nothing to keep
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    });
    if let Err(source) = backup_result {
        let _ = fs::remove_file(&staged);
        return Err(InstallError::Backup {
            path: backup,
            source,
        });
    }

    fs::rename(&staged, target).map_err(|source| InstallError::Replace {
        path: target.to_path_buf(),
        source,
    })?;

    event!(Level::INFO, path = ?target, "installed new configuration");
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}
