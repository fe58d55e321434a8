//! A/B firmware-update store over a block device.
//!
//! Images live in two redundant banks; each bank holds one slot per managed
//! image type. Reads target the bank the platform booted from, writes target
//! the inactive update bank and are staged in RAM until the image file is
//! released. The first mutation of an image persists its unaccepted state to
//! metadata before any image byte reaches flash, so an interrupted update
//! can never masquerade as an accepted image.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use fwstore::error::{EfiError, Result};
use fwstore_block::BlockIo;
use fwstore_hal::Clock;

use crate::dirty::DirtyBlockMap;
use crate::metadata::{AcceptRequest, FwsMetadata, ImageType, NUM_BANKS};

/// Bank-to-bank copies go through a bounded bounce buffer of this size.
const COPY_BUFFER_SIZE: usize = 0x10000;

bitflags! {
    /// Vendor flags accepted by [`FwsDevice::update_start`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VendorFlags: u32 {
        /// Start the update even while modified image files are open.
        const IGNORE_DIRTY = 1 << 0;
    }
}

/// Direction an image file is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Read,
    Write,
}

/// Storage geometry of the update store.
///
/// Each bank is a contiguous run of `bank_blocks` blocks, divided evenly
/// among the image types recorded in metadata, in metadata order. The two
/// metadata copies each occupy one block.
#[derive(Debug, Clone, Copy)]
pub struct FwsConfig {
    pub metadata_lba: [u64; 2],
    pub bank_start_lba: [u64; NUM_BANKS],
    pub bank_blocks: u64,
}

/// Work accounting returned by [`FwsDevice::release`], in device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseProgress {
    pub progress: u32,
    pub total_work: u32,
}

impl ReleaseProgress {
    pub fn is_complete(&self) -> bool {
        self.progress == self.total_work
    }
}

struct Staging {
    buffer: Vec<u8>,
    dirty: DirtyBlockMap,
    flushed: u32,
}

/// An open image file handle.
///
/// Obtained from [`FwsDevice::open`] and closed by [`FwsDevice::release`];
/// dropping an unreleased handle leaks the device's open-file count, just
/// like never closing it.
pub struct ImageFile {
    image_type: ImageType,
    op_type: OpType,
    bank_index: u32,
    start_lba: u64,
    max_size: u64,
    file_size: u64,
    dirty: bool,
    closed: bool,
    staging: Option<Staging>,
}

impl ImageFile {
    pub fn image_type(&self) -> &ImageType {
        &self.image_type
    }

    pub fn bank_index(&self) -> u32 {
        self.bank_index
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Opened firmware storage device.
pub struct FwsDevice<I: BlockIo, C: Clock> {
    io: I,
    clock: C,
    config: FwsConfig,
    metadata: FwsMetadata,
    boot_index: u32,
    active_index: u32,
    update_index: u32,
    update_in_progress: bool,
    open_files: u32,
}

impl<I: BlockIo, C: Clock> FwsDevice<I, C> {
    /// Open the update store, assuming the platform booted from the bank
    /// metadata records as active (the common case when the first-stage
    /// loader only ever boots the active bank).
    pub fn open_device(io: I, clock: C, config: FwsConfig) -> Result<Self> {
        Self::open_internal(io, clock, config, None)
    }

    /// Open the update store on a platform whose loader reports the bank it
    /// actually booted, which may differ from the active bank during a trial
    /// boot or after a failed update.
    pub fn open_device_with_boot_index(
        io: I,
        clock: C,
        config: FwsConfig,
        boot_index: u32,
    ) -> Result<Self> {
        if boot_index as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        Self::open_internal(io, clock, config, Some(boot_index))
    }

    fn open_internal(mut io: I, clock: C, config: FwsConfig, boot_index: Option<u32>) -> Result<Self> {
        let last_block = io.media().last_block;
        for &lba in config.metadata_lba.iter() {
            if lba > last_block {
                Err(EfiError::InvalidParameter)?;
            }
        }
        if config.bank_blocks == 0 {
            Err(EfiError::InvalidParameter)?;
        }
        for &start in config.bank_start_lba.iter() {
            if start + config.bank_blocks - 1 > last_block {
                log::error!("fws: bank {start:#x}+{:#x} blocks exceeds the device", config.bank_blocks);
                Err(EfiError::InvalidParameter)?;
            }
        }

        let metadata = FwsMetadata::load(&mut io, config.metadata_lba).inspect_err(|e| {
            log::error!("fws: failed to load metadata: {e:?}");
        })?;

        if config.bank_blocks % metadata.num_images() as u64 != 0 {
            log::error!(
                "fws: bank of {:#x} blocks does not divide among {} images",
                config.bank_blocks,
                metadata.num_images()
            );
            Err(EfiError::InvalidParameter)?;
        }

        let active_index = metadata.active_index();
        let boot_index = boot_index.unwrap_or(active_index);
        let update_index = (active_index + 1) % NUM_BANKS as u32;

        log::debug!("fws: boot index {boot_index}, active {active_index}, update {update_index}");

        Ok(Self {
            io,
            clock,
            config,
            metadata,
            boot_index,
            active_index,
            update_index,
            update_in_progress: false,
            open_files: 0,
        })
    }

    /// Release the device, handing back the underlying block device.
    ///
    /// Fails with `NotReady` while image files are still open, returning the
    /// device so the caller can close them and retry.
    pub fn release_device(self) -> core::result::Result<I, (Self, EfiError)> {
        if self.open_files != 0 {
            log::error!("fws: busy, open image file count: {}", self.open_files);
            return Err((self, EfiError::NotReady));
        }
        Ok(self.io)
    }

    pub fn open_file_count(&self) -> u32 {
        self.open_files
    }

    pub fn boot_index(&self) -> u32 {
        self.boot_index
    }

    pub fn active_index(&self) -> u32 {
        self.active_index
    }

    pub fn update_index(&self) -> u32 {
        self.update_index
    }

    pub fn metadata(&self) -> &FwsMetadata {
        &self.metadata
    }

    /// Direct access to the underlying block device.
    pub fn block_device_mut(&mut self) -> &mut I {
        &mut self.io
    }

    /// Open the image slot for `image_type`. Read opens target the booted
    /// bank; write opens target the update bank and stage their content in
    /// RAM until [`release`](Self::release).
    pub fn open(&mut self, image_type: ImageType, op_type: OpType) -> Result<ImageFile> {
        let image_index = self.metadata.image_index(&image_type).inspect_err(|_| {
            log::error!("fws: image type not managed by this store");
        })?;

        let bank_index = match op_type {
            OpType::Write => self.update_index,
            OpType::Read => self.boot_index,
        };

        let blocks_per_image = self.config.bank_blocks / self.metadata.num_images() as u64;
        let start_lba =
            self.config.bank_start_lba[bank_index as usize] + image_index as u64 * blocks_per_image;
        let block_size = self.io.media().block_size as u64;
        let max_size = blocks_per_image * block_size;

        let staging = match op_type {
            OpType::Read => None,
            OpType::Write => {
                let mut buffer = vec![0u8; max_size as usize];
                self.io.read_blocks(start_lba, &mut buffer)?;
                Some(Staging {
                    buffer,
                    dirty: DirtyBlockMap::new(blocks_per_image as usize, block_size as usize),
                    flushed: 0,
                })
            }
        };

        self.open_files += 1;

        Ok(ImageFile {
            image_type,
            op_type,
            bank_index,
            start_lba,
            max_size,
            file_size: max_size,
            dirty: false,
            closed: false,
            staging,
        })
    }

    /// Read from an image file, clamped at the file size. Returns the number
    /// of bytes read.
    pub fn read(&mut self, file: &ImageFile, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        if file.closed {
            Err(EfiError::InvalidParameter)?;
        }
        if offset >= file.file_size {
            return Ok(0);
        }
        let length = (buffer.len() as u64).min(file.file_size - offset) as usize;

        match &file.staging {
            Some(staging) => {
                let offset = offset as usize;
                buffer[..length].copy_from_slice(&staging.buffer[offset..offset + length]);
            }
            None => self.read_from_flash(file, offset, &mut buffer[..length])?,
        }

        Ok(length)
    }

    /// Write to an image file opened for writing.
    ///
    /// The data lands in the RAM staging buffer; the first mutation of the
    /// file first persists the image's unaccepted state to metadata.
    pub fn write(&mut self, file: &mut ImageFile, offset: u64, data: &[u8]) -> Result<()> {
        if file.closed || data.is_empty() {
            Err(EfiError::InvalidParameter)?;
        }
        if file.op_type != OpType::Write {
            Err(EfiError::AccessDenied)?;
        }
        if offset + data.len() as u64 > file.max_size {
            log::error!(
                "fws: write of {:#x} bytes at {offset:#x} exceeds the image slot of {:#x} bytes",
                data.len(),
                file.max_size
            );
            Err(EfiError::InvalidParameter)?;
        }

        self.mark_modified(file)?;

        let staging = file.staging.as_mut().ok_or(EfiError::InvalidParameter)?;
        let offset = offset as usize;
        staging.buffer[offset..offset + data.len()].copy_from_slice(data);
        staging.dirty.mark(offset, data.len());

        Ok(())
    }

    /// Erase the whole image slot to the flash erased state.
    pub fn erase(&mut self, file: &mut ImageFile) -> Result<()> {
        if file.closed {
            Err(EfiError::InvalidParameter)?;
        }
        if file.op_type != OpType::Write {
            Err(EfiError::AccessDenied)?;
        }

        self.mark_modified(file)?;

        let staging = file.staging.as_mut().ok_or(EfiError::InvalidParameter)?;
        staging.buffer.fill(0xff);
        staging.dirty.mark_all();

        Ok(())
    }

    /// Flush staged writes and close the file.
    ///
    /// Dirty blocks are committed in time slices bounded by
    /// `max_atomic_time_ns` (`0` runs to completion). While the returned
    /// progress is short of the total, the file stays open and `release`
    /// must be called again to continue.
    pub fn release(&mut self, file: &mut ImageFile, max_atomic_time_ns: u64) -> Result<ReleaseProgress> {
        if file.closed {
            Err(EfiError::InvalidParameter)?;
        }

        let mut progress = ReleaseProgress { progress: 0, total_work: 0 };

        if let Some(staging) = file.staging.as_mut() {
            progress.total_work = staging.flushed + staging.dirty.pending() as u32;
            progress.progress = staging.flushed;

            let block_size = self.io.media().block_size as usize;
            let deadline =
                (max_atomic_time_ns != 0).then(|| self.clock.nanoseconds() + max_atomic_time_ns);

            while let Some(block) = staging.dirty.first_dirty() {
                self.io.write_blocks(
                    file.start_lba + block as u64,
                    &staging.buffer[block * block_size..(block + 1) * block_size],
                )?;
                staging.dirty.commit(block);
                staging.flushed += 1;
                progress.progress = staging.flushed;

                if let Some(deadline) = deadline {
                    if self.clock.nanoseconds() >= deadline && !staging.dirty.is_clean() {
                        return Ok(progress);
                    }
                }
            }

            self.io.flush_blocks()?;
        }

        file.closed = true;
        self.open_files -= 1;

        Ok(progress)
    }

    /// Mark an image as trusted on the update bank (during an update) or on
    /// the active bank.
    ///
    /// Fails with `NotReady` unless the platform is booted from the active
    /// bank: accepting an image that was never actually booted would defeat
    /// the trial-boot scheme.
    pub fn accept_image(&mut self, image_type: &ImageType, accept_update_image: bool) -> Result<()> {
        if self.boot_index != self.active_index {
            Err(EfiError::NotReady)?;
        }

        let bank_index = if accept_update_image {
            if !self.update_in_progress {
                Err(EfiError::NotReady)?;
            }
            self.update_index
        } else {
            if self.update_in_progress {
                Err(EfiError::NotReady)?;
            }
            self.active_index
        };

        self.metadata.set_accept_state(image_type, bank_index, AcceptRequest::Accept)?;

        // Update-bank accepts are persisted in one batch by update_end.
        if accept_update_image {
            return Ok(());
        }

        self.metadata.update_bank_state(bank_index)?;
        self.metadata.save(&mut self.io)
    }

    /// Start an update transaction targeting the update bank.
    pub fn update_start(&mut self, vendor_flags: VendorFlags) -> Result<()> {
        if self.boot_index != self.active_index || self.update_in_progress {
            Err(EfiError::NotReady)?;
        }
        if self.open_files != 0 && !vendor_flags.contains(VendorFlags::IGNORE_DIRTY) {
            log::error!("fws: update start refused with {} image files open", self.open_files);
            Err(EfiError::NotReady)?;
        }

        self.update_in_progress = true;

        Ok(())
    }

    /// Finish an update transaction.
    ///
    /// With `abort` the update bank is simply never activated; its content
    /// is left behind but the active bank stays the boot target. Otherwise
    /// the metadata is re-pointed at the update bank and persisted — any
    /// failure there is reported as `Aborted` with the previous bank still
    /// bootable, because the old metadata copy remains authoritative until
    /// the save fully completes.
    pub fn update_end(&mut self, abort: bool) -> Result<()> {
        if !self.update_in_progress {
            Err(EfiError::NotReady)?;
        }

        if abort {
            self.update_in_progress = false;
            return Ok(());
        }

        let commit = (|| {
            self.metadata.set_previous_active_index(self.active_index)?;
            self.metadata.set_active_index(self.update_index)?;
            self.metadata.update_bank_state(self.update_index)?;
            self.metadata.save(&mut self.io)?;
            self.metadata.crc_check()
        })();
        if let Err(e) = commit {
            log::error!("fws: update commit failed: {e:?}");
            // The flash copy is authoritative; drop the half-mutated RAM
            // state so a later save cannot activate the update bank.
            match FwsMetadata::load(&mut self.io, self.config.metadata_lba) {
                Ok(metadata) => self.metadata = metadata,
                Err(reload) => log::error!("fws: metadata reload after failed commit: {reload:?}"),
            }
            Err(EfiError::Aborted)?;
        }

        self.active_index = self.update_index;
        self.update_index = (self.active_index + 1) % NUM_BANKS as u32;
        self.update_in_progress = false;

        Ok(())
    }

    /// Whether the active bank is awaiting acceptance after an update.
    pub fn check_trial_state(&self) -> Result<bool> {
        self.metadata.is_trial_bank(self.active_index)
    }

    /// Whether the platform booted from the active bank.
    pub fn check_correct_boot(&self) -> bool {
        self.boot_index == self.active_index
    }

    /// Restore a bank from its backup.
    ///
    /// During an update the backup is the active bank and the target the
    /// update bank; otherwise the backup is the previously active bank and
    /// the target the active one. The backup's content is copied over the
    /// target and the rolled-back metadata persisted.
    pub fn roll_back(&mut self) -> Result<()> {
        self.metadata.crc_check().map_err(|e| {
            log::error!("fws: metadata corrupt before rollback: {e:?}");
            EfiError::DeviceError
        })?;

        let (backup, target) = if self.update_in_progress {
            (self.active_index, self.update_index)
        } else {
            (self.metadata.previous_active_index(), self.active_index)
        };

        self.copy_bank(backup, target)?;

        self.metadata.roll_back(backup, target)?;
        self.metadata.save(&mut self.io)?;

        self.metadata.crc_check().map_err(|e| {
            log::error!("fws: metadata corrupt after rollback: {e:?}");
            EfiError::DeviceError
        })
    }

    fn mark_modified(&mut self, file: &mut ImageFile) -> Result<()> {
        if file.dirty {
            return Ok(());
        }

        self.metadata
            .set_accept_state(&file.image_type, file.bank_index, AcceptRequest::WriteUnaccept)?;
        self.metadata.save(&mut self.io).inspect_err(|e| {
            log::error!("fws: failed to persist unaccepted state: {e:?}");
        })?;
        self.metadata.crc_check()?;

        file.dirty = true;

        Ok(())
    }

    fn read_from_flash(&mut self, file: &ImageFile, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let block_size = self.io.media().block_size as usize;
        let mut bounce = vec![0u8; block_size];

        let mut index = 0;
        while index < buffer.len() {
            let position = offset as usize + index;
            let lba = file.start_lba + (position / block_size) as u64;
            let within = position % block_size;
            let chunk = (block_size - within).min(buffer.len() - index);

            self.io.read_blocks(lba, &mut bounce)?;
            buffer[index..index + chunk].copy_from_slice(&bounce[within..within + chunk]);

            index += chunk;
        }

        Ok(())
    }

    fn copy_bank(&mut self, backup: u32, target: u32) -> Result<()> {
        let block_size = self.io.media().block_size as usize;
        let chunk_blocks = (COPY_BUFFER_SIZE / block_size).max(1) as u64;
        let mut buffer = vec![0u8; chunk_blocks as usize * block_size];

        let backup_start = self.config.bank_start_lba[backup as usize];
        let target_start = self.config.bank_start_lba[target as usize];

        let mut block = 0;
        while block < self.config.bank_blocks {
            let count = chunk_blocks.min(self.config.bank_blocks - block);
            let chunk = &mut buffer[..count as usize * block_size];

            self.io.read_blocks(backup_start + block, chunk)?;
            self.io.write_blocks(target_start + block, chunk)?;

            block += count;
        }

        Ok(())
    }
}
