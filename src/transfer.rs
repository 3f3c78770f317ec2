//! The per-object transfer engine.
//!
//! Drives one plan entry to the destination, by type: directory creation
//! goes through the synchronized-directory coordinator, small files move
//! whole, large files move in checkpointed chunks that a later run can
//! resume.

use nix::fcntl::OFlag;

use crate::bucket_status::FileTransferState;
use crate::digest::DigestField;
use crate::error::{MigError, MigResult};
use crate::status_store::StatusStore;
use crate::store::{locator_parent, EntryType, StoreClient, StoreErrorKind};
use crate::synced_dir::SyncedDirContext;
use crate::transfer_info::TransferInfo;

pub struct TransferCtx<'a> {
    pub src: &'a dyn StoreClient,
    pub dst: &'a dyn StoreClient,
    pub status: &'a StatusStore,
    pub synced_dirs: &'a SyncedDirContext,
    pub tinfo: &'a TransferInfo,
    pub block_size: u64,
    pub create_dirs: bool,
}

/// Replicate one selected entry.
pub fn transfer_object(ctx: &TransferCtx<'_>, state: &mut FileTransferState) -> MigResult<()> {
    match state.entry_type {
        EntryType::Directory => create_directory(ctx, state),
        EntryType::Symlink => create_symlink(ctx, state),
        EntryType::Regular => transfer_file(ctx, state),
        EntryType::Undefined => Err(MigError::TransferError(format!(
            "file {} has no type attributed? not transferred...",
            state.obj_path
        ))),
    }
}

/// getattr on the source, mkdir on the destination with those attributes.
/// Another worker may have won the race, so EEXIST is success.
fn mkdir_from_source(ctx: &TransferCtx<'_>, src_path: &str, dst_path: &str) -> MigResult<()> {
    let attrs = match ctx.src.getattr(src_path) {
        Ok(attrs) => attrs,
        Err(e) => {
            error!(
                "[Migrating] could not get source directory {} attributes: {}",
                src_path, e
            );
            return Err(MigError::StoreError(e));
        }
    };
    match ctx.dst.mkdir(dst_path, &attrs) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == StoreErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            error!("[Migrating] could not create directory {}: {}", dst_path, e);
            Err(MigError::StoreError(e))
        }
    }
}

/// Walk up the destination path and create every missing ancestor, each
/// one serialized through the coordinator so concurrent workers never
/// issue the same mkdir twice.
fn create_parent_dirs(ctx: &TransferCtx<'_>, src_path: &str, dst_path: &str) -> MigResult<()> {
    let dst_parent = match locator_parent(dst_path) {
        Some(parent) => parent.to_string(),
        None => return Ok(()),
    };
    let src_parent = match locator_parent(src_path) {
        Some(parent) => parent.to_string(),
        None => return Ok(()),
    };

    match ctx.dst.getattr(&dst_parent) {
        Ok(_) => return Ok(()),
        Err(ref e) if e.kind() == StoreErrorKind::NotFound => {}
        Err(e) => return Err(MigError::StoreError(e)),
    }

    debug!("[Migrating] creating parent directory={}", dst_parent);

    let (sdir, is_responsible) = ctx.synced_dirs.register(&dst_parent)?;
    let mut created = false;
    let result = if is_responsible {
        match create_parent_dirs(ctx, &src_parent, &dst_parent) {
            Ok(()) => match mkdir_from_source(ctx, &src_parent, &dst_parent) {
                Ok(()) => {
                    created = true;
                    debug!("[Migrating] parent directories created with success!");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    } else {
        created = sdir.wait()?;
        if created {
            Ok(())
        } else {
            Err(MigError::TransferError(format!(
                "parent directory {} could not be created",
                dst_parent
            )))
        }
    };
    ctx.synced_dirs.unregister(&sdir, is_responsible, created)?;
    result
}

fn create_directory(ctx: &TransferCtx<'_>, state: &FileTransferState) -> MigResult<()> {
    debug!(
        "[Migrating] directory {} ({} -> {})",
        state.obj_path, state.src_path, state.dst_path
    );

    if ctx.create_dirs {
        create_parent_dirs(ctx, &state.src_path, &state.dst_path)?;
    }

    let (sdir, is_responsible) = ctx.synced_dirs.register(&state.dst_path)?;
    let mut created = false;
    let result = if is_responsible {
        match mkdir_from_source(ctx, &state.src_path, &state.dst_path) {
            Ok(()) => {
                created = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    } else {
        created = sdir.wait()?;
        if created {
            Ok(())
        } else {
            Err(MigError::TransferError(format!(
                "directory {} could not be created",
                state.dst_path
            )))
        }
    };
    ctx.synced_dirs.unregister(&sdir, is_responsible, created)?;
    result?;

    ctx.tinfo.add_bytes(0)?;
    Ok(())
}

fn create_symlink(ctx: &TransferCtx<'_>, state: &FileTransferState) -> MigResult<()> {
    debug!("[Migrating] creating symlink {}", state.obj_path);

    if ctx.create_dirs {
        create_parent_dirs(ctx, &state.src_path, &state.dst_path)?;
    }

    let target = match ctx.src.readlink(&state.src_path) {
        Ok(target) => target,
        Err(e) => {
            error!(
                "[Migrating] could not read target of symlink {}: {}",
                state.src_path, e
            );
            return Err(MigError::StoreError(e));
        }
    };

    match ctx.dst.symlink(&target, &state.dst_path) {
        Ok(()) => {}
        Err(ref e) if e.kind() == StoreErrorKind::AlreadyExists => {
            // leftover from an interrupted run; replace it unless it
            // already points at the right target
            let existing = ctx.dst.readlink(&state.dst_path).map_err(MigError::StoreError)?;
            if existing != target {
                ctx.dst.unlink(&state.dst_path).map_err(MigError::StoreError)?;
                ctx.dst.symlink(&target, &state.dst_path).map_err(MigError::StoreError)?;
            }
        }
        Err(e) => {
            error!(
                "[Migrating] could not create symlink {} to file {}: {}",
                state.dst_path, target, e
            );
            return Err(MigError::StoreError(e));
        }
    }

    ctx.tinfo.add_bytes(0)?;
    ctx.status
        .digest()
        .add(ctx.status.client(), DigestField::DoneBytes, state.size)?;
    Ok(())
}

/// Whole-object copy, taken when the size fits one block.  The caller
/// completes the entry, so no intermediary checkpoint is needed.
fn transfer_whole(ctx: &TransferCtx<'_>, state: &FileTransferState) -> MigResult<()> {
    let (data, metadata) = match ctx.src.fget(&state.src_path) {
        Ok(found) => found,
        Err(e) => {
            error!("[Migrating] could not fget source file {}: {}", state.src_path, e);
            return Err(MigError::StoreError(e));
        }
    };
    if let Err(e) = ctx.dst.fput(&state.dst_path, &data, &metadata) {
        error!(
            "[Migrating] could not fput destination file {}: {}",
            state.dst_path, e
        );
        return Err(MigError::StoreError(e));
    }

    ctx.tinfo.add_bytes(data.len() as u64)?;
    ctx.status
        .digest()
        .add(ctx.status.client(), DigestField::DoneBytes, state.size)?;
    Ok(())
}

/// Chunked streaming copy with a checkpoint after every chunk; a crash
/// never loses more than one chunk.  The carried stream status documents
/// let the client resume mid-stream after a restart.
fn transfer_chunked(ctx: &TransferCtx<'_>, state: &mut FileTransferState) -> MigResult<()> {
    debug!("transfer chunked of file {}", state.obj_path);

    let mut src_stream = ctx
        .src
        .open(&state.src_path, OFlag::O_RDONLY, state.rstatus.as_ref())
        .map_err(|e| {
            error!("could not open source file {}: {}", state.src_path, e);
            MigError::StoreError(e)
        })?;
    let mut dst_stream = ctx
        .dst
        .open(
            &state.dst_path,
            OFlag::O_WRONLY | OFlag::O_CREAT,
            state.wstatus.as_ref(),
        )
        .map_err(|e| {
            error!("could not open dest file {}: {}", state.dst_path, e);
            MigError::StoreError(e)
        })?;

    while state.offset < state.size {
        debug!(
            "[Migrating] {}: transferring data chunk of {} bytes",
            state.obj_path, ctx.block_size
        );
        let (chunk, rstatus) = src_stream.stream_get(ctx.block_size).map_err(|e| {
            error!("could not get next block from source file {}: {}", state.src_path, e);
            MigError::StoreError(e)
        })?;
        if chunk.is_empty() {
            return Err(MigError::TransferError(format!(
                "source file {} ended {} bytes short of its recorded size",
                state.src_path,
                state.size - state.offset
            )));
        }
        let wstatus = dst_stream.stream_put(&chunk).map_err(|e| {
            error!(
                "could not put next block to destination file {}: {}",
                state.dst_path, e
            );
            MigError::StoreError(e)
        })?;

        ctx.tinfo.add_bytes(chunk.len() as u64)?;

        state.rstatus = Some(rstatus);
        state.wstatus = Some(wstatus);
        state.offset += chunk.len() as u64;

        // durable before the next chunk is requested
        ctx.status.entry_update(state, chunk.len() as u64)?;
    }

    dst_stream.stream_flush().map_err(|e| {
        error!("could not flush destination file {}: {}", state.dst_path, e);
        MigError::StoreError(e)
    })?;
    Ok(())
}

fn transfer_file(ctx: &TransferCtx<'_>, state: &mut FileTransferState) -> MigResult<()> {
    info!(
        "[Migrating] file '{}' is a regular file: starting transfer...",
        state.obj_path
    );

    if ctx.create_dirs {
        create_parent_dirs(ctx, &state.src_path, &state.dst_path)?;
    }

    let ret = if state.size > ctx.block_size {
        transfer_chunked(ctx, state)
    } else {
        transfer_whole(ctx, state)
    };

    info!(
        "[Migrating] file '{}' transfer {}!",
        state.obj_path,
        if ret.is_ok() { "succeeded" } else { "failed" }
    );
    ret
}
