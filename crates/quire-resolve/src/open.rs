use std::{
    ffi::OsStr,
    fs::{File, Metadata},
    os::{
        fd::{AsRawFd, FromRawFd},
        unix::fs::MetadataExt,
    },
    path::{Path, PathBuf},
};

use nix::{
    fcntl::{self, OFlag},
    sys::stat::Mode,
};
use tracing::{event, Level};

/// An opened, not yet accepted resolution candidate.
pub struct Candidate {
    pub file: File,
    pub path: PathBuf,
    pub metadata: Metadata,
}

impl Candidate {
    pub fn is_dir(&self) -> bool {
        self.metadata.is_dir()
    }

    pub fn is_world_readable(&self) -> bool {
        self.metadata.mode() & 0o004 != 0
    }
}

/// Open `relative` beneath the trusted directory `root`.
///
/// Every component is opened relative to the handle of its parent with symlink following
/// disabled, so a link anywhere below `root` fails the open.
pub fn open_beneath(root: &Path, relative: &str) -> Option<Candidate> {
    let mut names = Vec::new();
    for name in relative.split('/') {
        match name {
            "" | "." => continue,
            ".." => return None,
            name => names.push(OsStr::new(name)),
        }
    }

    let mut dir = open_trusted_dir(root)?;
    let mut path = root.to_path_buf();

    let Some((leaf, parents)) = names.split_last() else {
        return accept(dir, path);
    };

    for name in parents {
        dir = open_child(&dir, name, OFlag::O_DIRECTORY)?;
        path.push(name);
    }

    let file = open_child(&dir, leaf, OFlag::O_NONBLOCK)?;
    path.push(leaf);

    accept(file, path)
}

/// Open a literal path from configuration.
///
/// The parent directory is trusted, the leaf itself must not be a link.
pub fn open_literal(path: &Path) -> Option<Candidate> {
    let parent = path.parent()?;
    let name = path.file_name()?;

    let dir = open_trusted_dir(parent)?;
    let file = open_child(&dir, name, OFlag::O_NONBLOCK)?;

    accept(file, path.to_path_buf())
}

fn open_trusted_dir(path: &Path) -> Option<File> {
    let flags = OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC;

    match fcntl::open(path, flags, Mode::empty()) {
        // SAFETY: The descriptor was just returned by open and is owned by nothing else
        Ok(fd) => Some(unsafe { File::from_raw_fd(fd) }),
        Err(error) => {
            event!(Level::DEBUG, ?path, ?error, "failed to open root directory");
            None
        }
    }
}

fn open_child(dir: &File, name: &OsStr, extra: OFlag) -> Option<File> {
    let flags = OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC | extra;

    match fcntl::openat(dir.as_raw_fd(), name, flags, Mode::empty()) {
        // SAFETY: The descriptor was just returned by openat and is owned by nothing else
        Ok(fd) => Some(unsafe { File::from_raw_fd(fd) }),
        Err(error) => {
            // ELOOP and ENOTDIR are how links show up here, they are just as missing as ENOENT
            event!(Level::TRACE, ?name, ?error, "failed to open path component");
            None
        }
    }
}

fn accept(file: File, path: PathBuf) -> Option<Candidate> {
    let metadata = file.metadata().ok()?;

    let file_type = metadata.file_type();
    if !file_type.is_file() && !file_type.is_dir() {
        event!(Level::DEBUG, ?path, "refusing special file");
        return None;
    }

    Some(Candidate {
        file,
        path,
        metadata,
    })
}
