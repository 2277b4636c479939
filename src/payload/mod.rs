//! Present a file or a directory as one readable byte stream.
//!
//! A regular file is handed through untouched. A directory is walked on a
//! dedicated producer thread that writes a tar (gzip-compressed under
//! format version 2) into a bounded OS pipe; the consumer drains the read
//! end and the pipe applies backpressure. Producer failures are parked in a
//! shared slot and surface on the consumer's next read after EOF or on
//! [`PayloadStream::finish`].

use crate::{Error, Result};
use flate2::{Compression, write::GzEncoder};
use std::{
    fs::{self, File},
    io::{self, PipeReader, PipeWriter, Read},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
};
use walkdir::WalkDir;

/// Bundle format version: a version selects a feature set. The only
/// version-gated feature today is gzip compression of directory tars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundleVersion {
    V1,
    #[default]
    V2,
}

impl BundleVersion {
    #[must_use]
    pub const fn compressed_tar(self) -> bool {
        matches!(self, Self::V2)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
        }
    }
}

impl FromStr for BundleVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1" => Ok(Self::V1),
            "2" => Ok(Self::V2),
            other => Err(Error::BadInput(format!(
                "unsupported bundle format version: {other}"
            ))),
        }
    }
}

/// What `payload.enc` holds before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerType {
    File,
    Tar,
    TarGz,
}

impl ContainerType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    #[must_use]
    pub const fn is_archive(self) -> bool {
        !matches!(self, Self::File)
    }
}

#[derive(Debug)]
pub struct Payload {
    pub stream: PayloadStream,
    pub container: ContainerType,
}

/// Open `path` as a payload stream.
///
/// # Errors
/// `BadInput` if the path is neither a regular file nor a directory,
/// `Io` on filesystem failures
pub fn open(path: &Path, version: BundleVersion) -> Result<Payload> {
    let meta = fs::metadata(path)?;

    if meta.is_file() {
        return Ok(Payload {
            stream: PayloadStream::from_file(File::open(path)?),
            container: ContainerType::File,
        });
    }

    if meta.is_dir() {
        let container = if version.compressed_tar() {
            ContainerType::TarGz
        } else {
            ContainerType::Tar
        };

        return Ok(Payload {
            stream: PayloadStream::tar_directory(path, version)?,
            container,
        });
    }

    Err(Error::BadInput(format!(
        "{} is neither a file nor a directory",
        path.display()
    )))
}

type ErrorSlot = Arc<Mutex<Option<Error>>>;

#[derive(Debug)]
enum Inner {
    File(File),
    Piped {
        reader: Option<PipeReader>,
        worker: Option<JoinHandle<()>>,
        error: ErrorSlot,
    },
}

/// Lazy byte stream over the payload. Dropping it without reading to the
/// end closes the pipe, which unblocks and terminates the producer.
#[derive(Debug)]
pub struct PayloadStream {
    inner: Inner,
}

impl PayloadStream {
    #[must_use]
    pub const fn from_file(file: File) -> Self {
        Self {
            inner: Inner::File(file),
        }
    }

    fn tar_directory(root: &Path, version: BundleVersion) -> Result<Self> {
        let (reader, writer) = io::pipe()?;
        let error: ErrorSlot = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&error);
        let root: PathBuf = root.to_path_buf();

        let worker = thread::Builder::new()
            .name("payload-tar".to_string())
            .spawn(move || {
                if let Err(err) = write_tar(&root, version, writer) {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                }
            })?;

        Ok(Self {
            inner: Inner::Piped {
                reader: Some(reader),
                worker: Some(worker),
                error,
            },
        })
    }

    /// Close the stream, waiting for the producer to terminate, and
    /// surface any error it left behind.
    ///
    /// # Errors
    /// Will return the producer's pending error, if any
    pub fn finish(mut self) -> Result<()> {
        match &mut self.inner {
            Inner::File(_) => Ok(()),
            Inner::Piped {
                reader,
                worker,
                error,
            } => {
                // closing the read end unblocks a producer stuck on a full pipe
                drop(reader.take());

                if let Some(worker) = worker.take() {
                    worker
                        .join()
                        .map_err(|_| Error::Io(io::Error::other("payload producer panicked")))?;
                }

                match error.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }
}

impl Read for PayloadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::File(file) => file.read(buf),
            Inner::Piped {
                reader,
                worker,
                error,
            } => {
                let Some(pipe) = reader.as_mut() else {
                    return Ok(0);
                };

                let got = pipe.read(buf)?;

                if got == 0 {
                    // writer closed, so the producer has already returned
                    if let Some(worker) = worker.take() {
                        if worker.join().is_err() {
                            return Err(io::Error::other("payload producer panicked"));
                        }
                    }

                    if let Some(err) = error.lock().unwrap_or_else(PoisonError::into_inner).take()
                    {
                        return Err(io::Error::other(err));
                    }
                }

                Ok(got)
            }
        }
    }
}

fn write_tar(root: &Path, version: BundleVersion, writer: PipeWriter) -> Result<()> {
    if version.compressed_tar() {
        let encoder = GzEncoder::new(writer, Compression::default());
        let encoder = append_tree(root, encoder)?;
        encoder.finish()?;
    } else {
        append_tree(root, writer)?;
    }

    Ok(())
}

// Archive every regular file under `root` with its root-relative name.
// Directories are not emitted; names longer than the classic 100-byte
// header field go out as long-name extension entries, courtesy of `tar`.
fn append_tree<W: io::Write>(root: &Path, writer: W) -> Result<W> {
    let mut builder = tar::Builder::new(writer);

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;

        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Io(io::Error::other(e)))?;

        let mut file = File::open(entry.path())?;
        builder.append_file(name, &mut file)?;
    }

    Ok(builder.into_inner()?)
}
