use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

pub mod error {
    use std::{io, path::PathBuf};

    pub type Result<T> = std::result::Result<T, self::Error>;

    type Msg = &'static str;

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("{0} ({1}): {2}")]
        SingleIO(Msg, PathBuf, #[source] io::Error),

        #[error("Refusing to overwrite existing file '{0}'")]
        AlreadyExists(PathBuf),
    }
}
pub use error::{Error, Result};

#[must_use]
pub fn mkdir_all(path: impl AsRef<Path>) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::SingleIO("Cannot create dir", dir.to_owned(), e))
}

#[must_use]
pub fn write<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    fs::write(&filepath, contents)
        .map_err(|e| Error::SingleIO("Cannot write file", filepath.as_ref().to_owned(), e))
}

/// Writes `contents` to a new file, creating parent dirs.
/// Fails with [`Error::AlreadyExists`] instead of clobbering an existing file.
#[must_use]
pub fn write_new_with_mkdir<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    let filepath = filepath.as_ref();
    if filepath.exists() {
        return Err(Error::AlreadyExists(filepath.to_owned()));
    }
    if let Some(dir) = filepath.parent() {
        self::mkdir_all(dir)?;
    }
    self::write(filepath, contents)
}

#[must_use]
pub fn read_to_string(filepath: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

/// Removes the file. A missing file is not an error.
#[must_use]
pub fn remove_file_if_exists(filepath: impl AsRef<Path>) -> Result<()> {
    match fs::remove_file(&filepath) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::SingleIO(
            "Cannot remove file",
            filepath.as_ref().to_owned(),
            e,
        )),
    }
}

/// Opens `filepath` for appending, creating it (and its parent dirs) when missing.
#[must_use]
pub fn open_append_with_mkdir(filepath: impl AsRef<Path>) -> Result<File> {
    let filepath = filepath.as_ref();
    if let Some(dir) = filepath.parent() {
        self::mkdir_all(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(filepath)
        .map_err(|e| Error::SingleIO("Cannot open file for append", filepath.to_owned(), e))
}

/// Append-only line writer over a single file.
///
/// Every [`AppendLog::append_line`] is flushed before returning, so a crash
/// of the caller never leaves a half-written line behind.
#[derive(Debug)]
pub struct AppendLog {
    filepath: PathBuf,
    file: File,
}

impl AppendLog {
    #[must_use]
    pub fn open(filepath: impl AsRef<Path>) -> Result<Self> {
        let filepath = filepath.as_ref().to_owned();
        let file = self::open_append_with_mkdir(&filepath)?;
        log::debug!("Opened append log {}", filepath.to_string_lossy());
        Ok(Self { filepath, file })
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    #[must_use]
    pub fn append_line(&mut self, line: &str) -> Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        self.file
            .write_all(&buf)
            .and_then(|_| self.file.flush())
            .map_err(|e| Error::SingleIO("Cannot append to file", self.filepath.clone(), e))
    }

    #[must_use]
    pub fn sync(self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::SingleIO("Cannot sync file", self.filepath, e))
    }
}

/// Normalize the path
/// ```
/// use fsutil::normalize_path;
/// use std::path::Path;
///
/// assert_eq!(normalize_path("./log/.session/././foo"), Path::new("log/.session/foo"));
/// assert_eq!(normalize_path("bin/tls/../../certs/."), Path::new("certs"));
/// assert_eq!(normalize_path("../foo/../hello"), Path::new("../hello"));
/// assert_eq!(normalize_path("/"), Path::new("/"));
/// assert_eq!(normalize_path("./foo/"), Path::new("foo"));
/// assert_eq!(normalize_path("./././."), Path::new("."));
/// ```
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    use ::std::path::Component;
    let components = path.as_ref().components();
    let mut stack = Vec::with_capacity(components.size_hint().1.unwrap_or(4));
    for c in components {
        match c {
            Component::CurDir => (),
            Component::ParentDir if !stack.is_empty() => {
                stack.pop();
            }
            _ => {
                stack.push(c);
            }
        }
    }
    if stack.is_empty() {
        stack.push(Component::CurDir);
    }
    stack.iter().collect()
}
