//! A block store backed by a regular file, using positional I/O on the blocking pool.

use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use color_eyre::eyre::{WrapErr, ensure};
use tokio::fs::OpenOptions;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use super::{BackingStore, BackstoreKind, DEFAULT_MAX_TRANSFER_BLOCKS, Identity, emulate_control};
use crate::engine::{Unit, UnitStatus};
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::scsi::response::Inquiry;
use crate::scsi::{AdditionalSense, CdbKind, Direction};

struct Inner {
    file: std::fs::File,
    identity: Identity,
    writable: bool,
}

/// File backed store. Units run on tokio's blocking pool and complete from there.
pub struct FileStore {
    inner: Arc<Inner>,
    runtime: Handle,
    max_transfer_blocks: u32,
}

impl FileStore {
    /// Opens `path` read-write, falling back to read-only. The capacity is the file
    /// length rounded down to whole blocks.
    pub async fn open(path: impl AsRef<Path>, block_size: u32) -> color_eyre::Result<Self> {
        let path = path.as_ref();
        ensure!(
            block_size.is_power_of_two() && block_size >= 512,
            "block size {block_size} is not a power of two of at least 512"
        );
        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path).await {
            Ok(file) => (file, true),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                let file = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .await
                    .wrap_err_with(|| format!("open {}", path.display()))?;
                (file, false)
            }
            Err(err) => return Err(err).wrap_err_with(|| format!("open {}", path.display())),
        };
        let len = file
            .metadata()
            .await
            .wrap_err_with(|| format!("stat {}", path.display()))?
            .len();
        let capacity = len / u64::from(block_size);
        ensure!(
            capacity > 0,
            "{} is smaller than one {block_size} byte block",
            path.display()
        );
        debug!(path = %path.display(), capacity, writable, "opened file store");

        Ok(Self {
            inner: Arc::new(Inner {
                file: file.into_std().await,
                identity: Identity {
                    inquiry: Inquiry::direct_access("LUNAGLAS", "FILEIO"),
                    block_size,
                    capacity,
                },
                writable,
            }),
            runtime: Handle::try_current().wrap_err("file store needs a tokio runtime")?,
            max_transfer_blocks: DEFAULT_MAX_TRANSFER_BLOCKS,
        })
    }

    pub fn with_max_transfer_blocks(mut self, blocks: u32) -> Self {
        self.max_transfer_blocks = blocks.max(1);
        self
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable
    }
}

impl Inner {
    fn run(&self, unit: &Unit) -> UnitStatus {
        if unit.wants_stop() {
            return UnitStatus::aborted();
        }
        let Some(cdb) = unit.cdb() else {
            return UnitStatus::Failed(EngineError::invalid_field("unit carries no CDB"));
        };
        match cdb.kind {
            CdbKind::Media => match self.transfer(unit) {
                Ok(()) => UnitStatus::Good,
                Err(err) => UnitStatus::Failed(err),
            },
            CdbKind::Control => emulate_control(unit, &self.identity, || {
                self.file.sync_data().map_err(|err| {
                    EngineError::with_message(ErrorKind::Medium, err.to_string())
                        .with_sense(AdditionalSense::WRITE_ERROR)
                })
            }),
        }
    }

    fn transfer(&self, unit: &Unit) -> EngineResult<()> {
        let offset = unit.lba() * u64::from(self.identity.block_size);
        let mut bytes = vec![0u8; unit.len()];
        match unit.direction() {
            Direction::DataIn => {
                self.file.read_exact_at(&mut bytes, offset).map_err(|err| {
                    EngineError::with_message(ErrorKind::Medium, err.to_string())
                })?;
                unit.buffer().copy_from_slice(&bytes);
            }
            Direction::DataOut => {
                if !self.writable {
                    return Err(EngineError::with_message(
                        ErrorKind::Medium,
                        "file store opened read-only",
                    )
                    .with_sense(AdditionalSense::WRITE_ERROR));
                }
                unit.buffer().copy_to_slice(&mut bytes);
                self.file.write_all_at(&bytes, offset).map_err(|err| {
                    EngineError::with_message(ErrorKind::Medium, err.to_string())
                        .with_sense(AdditionalSense::WRITE_ERROR)
                })?;
            }
            Direction::Bidirectional | Direction::NonDirectional => {}
        }
        Ok(())
    }
}

impl BackingStore for FileStore {
    fn kind(&self) -> BackstoreKind {
        BackstoreKind::File
    }

    fn block_size(&self) -> u32 {
        self.inner.identity.block_size
    }

    fn capacity(&self) -> u64 {
        self.inner.identity.capacity
    }

    fn max_transfer_blocks(&self) -> u32 {
        self.max_transfer_blocks
    }

    fn execute(&self, unit: Arc<Unit>) -> EngineResult<()> {
        let inner = Arc::clone(&self.inner);
        trace!(cmd = %unit.command_id(), lba = unit.lba(), blocks = unit.blocks(), "file io");
        self.runtime.spawn_blocking(move || {
            let status = inner.run(&unit);
            unit.complete(status);
        });
        Ok(())
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("block_size", &self.inner.identity.block_size)
            .field("capacity", &self.inner.identity.capacity)
            .field("writable", &self.inner.writable)
            .finish()
    }
}
