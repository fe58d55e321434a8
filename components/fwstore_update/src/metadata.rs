//! Persistent A/B bank metadata.
//!
//! The bank configuration (active index, previous active index, per-bank
//! state, per-image accept flags) is the source of truth for the whole
//! update store and lives in flash, not RAM. It is kept in two ping-pong
//! copies, each in its own block: a save always writes the stale copy with
//! an incremented sequence number and verifies it by readback, so a torn
//! write leaves the other copy authoritative. Load picks the valid copy
//! with the highest sequence number.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec;
use core::mem;

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use fwstore::error::{EfiError, Result};
use fwstore_block::BlockIo;

/// Number of redundant image banks.
pub const NUM_BANKS: usize = 2;

/// Fixed capacity of the image table; `num_images` records how many entries
/// are in use.
pub const MAX_IMAGES: usize = 8;

/// ASCII "FWSM".
const METADATA_MAGIC: u32 = u32::from_le_bytes(*b"FWSM");
const METADATA_VERSION: u32 = 2;

/// Bank lifecycle states.
///
/// `INVALID` is a bank with an update in flight, `VALID` a fully written
/// bank that has not been accepted yet (booting from it is a trial boot),
/// `ACCEPTED` a bank whose every image has been explicitly accepted.
pub const BANK_STATE_INVALID: u8 = 0xff;
pub const BANK_STATE_VALID: u8 = 0xfe;
pub const BANK_STATE_ACCEPTED: u8 = 0xfc;

const IMAGE_ACCEPTED: u8 = 0x01;
const IMAGE_UNACCEPTED: u8 = 0x00;

/// An image-type identifier (EFI GUID bytes).
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ImageType(pub [u8; 16]);

/// Why an image is having its accept flag changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptRequest {
    Accept,
    Unaccept,
    /// Unaccept because a write to the image is starting; additionally drops
    /// the owning bank to `INVALID` until the update completes.
    WriteUnaccept,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
struct ImageEntry {
    image_type: ImageType,
    accepted: [u8; NUM_BANKS],
    reserved: [u8; 2],
}

/// On-flash metadata copy. The CRC comes first and covers every byte after
/// itself.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
struct MetadataSector {
    crc32: U32,
    magic: U32,
    version: U32,
    seq: U32,
    active_index: U32,
    previous_active_index: U32,
    num_images: U32,
    bank_state: [u8; NUM_BANKS],
    reserved: [u8; 2],
    images: [ImageEntry; MAX_IMAGES],
}

impl MetadataSector {
    fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.as_bytes()[mem::size_of::<U32>()..])
    }

    fn validate(&self) -> Result<()> {
        if self.magic.get() != METADATA_MAGIC || self.version.get() != METADATA_VERSION {
            Err(EfiError::VolumeCorrupted)?;
        }
        if self.active_index.get() as usize >= NUM_BANKS
            || self.previous_active_index.get() as usize >= NUM_BANKS
        {
            Err(EfiError::VolumeCorrupted)?;
        }
        let num_images = self.num_images.get() as usize;
        if num_images == 0 || num_images > MAX_IMAGES {
            Err(EfiError::VolumeCorrupted)?;
        }
        for bank in 0..NUM_BANKS {
            match self.bank_state[bank] {
                BANK_STATE_INVALID | BANK_STATE_VALID => {}
                BANK_STATE_ACCEPTED => {
                    // An accepted bank must not carry unaccepted images.
                    for entry in &self.images[..num_images] {
                        if entry.accepted[bank] != IMAGE_ACCEPTED {
                            Err(EfiError::VolumeCorrupted)?;
                        }
                    }
                }
                _ => Err(EfiError::VolumeCorrupted)?,
            }
        }
        if self.compute_crc() != self.crc32.get() {
            Err(EfiError::CrcError)?;
        }
        Ok(())
    }
}

/// Loaded bank metadata bound to its two on-flash slots.
pub struct FwsMetadata {
    sector: MetadataSector,
    /// LBA of each ping-pong copy.
    slot_lba: [u64; 2],
    /// Slot holding the copy this state was loaded from (or last saved to);
    /// the other slot is written next.
    current_slot: usize,
}

impl FwsMetadata {
    /// Load the newest valid metadata copy from its two slots.
    ///
    /// Fails with `Aborted` when neither slot holds valid metadata; a single
    /// corrupt slot (torn write) is recovered from silently.
    pub fn load<I: BlockIo>(io: &mut I, slot_lba: [u64; 2]) -> Result<Self> {
        let mut best: Option<(usize, MetadataSector)> = None;

        for (slot, &lba) in slot_lba.iter().enumerate() {
            let sector = match read_sector(io, lba) {
                Ok(sector) => sector,
                Err(e) => {
                    log::warn!("fws: metadata slot {slot} unreadable: {e:?}");
                    continue;
                }
            };
            if let Err(e) = sector.validate() {
                log::warn!("fws: metadata slot {slot} invalid: {e:?}");
                continue;
            }
            match best {
                Some((_, chosen)) if sector.seq.get() <= chosen.seq.get() => {}
                _ => best = Some((slot, sector)),
            }
        }

        let (current_slot, sector) = best.ok_or_else(|| {
            log::error!("fws: no valid metadata copy found");
            EfiError::Aborted
        })?;

        Ok(Self { sector, slot_lba, current_slot })
    }

    /// Provision fresh metadata for a factory-programmed device: bank 0
    /// active, every image accepted on both banks. Both slots are written.
    pub fn format<I: BlockIo>(io: &mut I, slot_lba: [u64; 2], image_types: &[ImageType]) -> Result<Self> {
        if image_types.is_empty() || image_types.len() > MAX_IMAGES {
            Err(EfiError::InvalidParameter)?;
        }

        let mut sector = MetadataSector {
            crc32: U32::new(0),
            magic: U32::new(METADATA_MAGIC),
            version: U32::new(METADATA_VERSION),
            seq: U32::new(0),
            active_index: U32::new(0),
            previous_active_index: U32::new(0),
            num_images: U32::new(image_types.len() as u32),
            bank_state: [BANK_STATE_ACCEPTED; NUM_BANKS],
            reserved: [0; 2],
            images: [ImageEntry {
                image_type: ImageType([0; 16]),
                accepted: [IMAGE_UNACCEPTED; NUM_BANKS],
                reserved: [0; 2],
            }; MAX_IMAGES],
        };
        for (entry, &image_type) in sector.images.iter_mut().zip(image_types) {
            entry.image_type = image_type;
            entry.accepted = [IMAGE_ACCEPTED; NUM_BANKS];
        }
        sector.crc32.set(sector.compute_crc());

        for &lba in &slot_lba {
            write_sector(io, lba, &sector)?;
        }

        Ok(Self { sector, slot_lba, current_slot: 0 })
    }

    /// Persist the RAM state to the stale slot and verify it by readback.
    ///
    /// The slot just written becomes current only after the readback
    /// matches; until then the previous copy stays authoritative, so a
    /// power loss or torn write at any point here is recoverable.
    pub fn save<I: BlockIo>(&mut self, io: &mut I) -> Result<()> {
        let stale_slot = 1 - self.current_slot;

        self.sector.seq.set(self.sector.seq.get().wrapping_add(1));
        self.sector.crc32.set(self.sector.compute_crc());

        write_sector(io, self.slot_lba[stale_slot], &self.sector)?;

        let readback = read_sector(io, self.slot_lba[stale_slot])?;
        if readback.as_bytes() != self.sector.as_bytes() {
            log::error!("fws: metadata readback mismatch on slot {stale_slot}");
            Err(EfiError::DeviceError)?;
        }

        io.flush_blocks()?;
        self.current_slot = stale_slot;

        Ok(())
    }

    /// Verify the CRC of the RAM copy.
    pub fn crc_check(&self) -> Result<()> {
        if self.sector.compute_crc() != self.sector.crc32.get() {
            Err(EfiError::CrcError)?;
        }
        Ok(())
    }

    pub fn active_index(&self) -> u32 {
        self.sector.active_index.get()
    }

    pub fn set_active_index(&mut self, index: u32) -> Result<()> {
        if index as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        self.sector.active_index.set(index);
        Ok(())
    }

    pub fn previous_active_index(&self) -> u32 {
        self.sector.previous_active_index.get()
    }

    pub fn set_previous_active_index(&mut self, index: u32) -> Result<()> {
        if index as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        self.sector.previous_active_index.set(index);
        Ok(())
    }

    pub fn num_images(&self) -> u32 {
        self.sector.num_images.get()
    }

    pub fn sequence(&self) -> u32 {
        self.sector.seq.get()
    }

    pub fn bank_state(&self, bank: u32) -> Result<u8> {
        if bank as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        Ok(self.sector.bank_state[bank as usize])
    }

    /// Position of an image type in the image table.
    pub fn image_index(&self, image_type: &ImageType) -> Result<usize> {
        self.entries()
            .iter()
            .position(|entry| entry.image_type == *image_type)
            .ok_or(EfiError::NotFound)
    }

    pub fn accept_state(&self, image_type: &ImageType, bank: u32) -> Result<bool> {
        if bank as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        let index = self.image_index(image_type)?;
        Ok(self.entries()[index].accepted[bank as usize] == IMAGE_ACCEPTED)
    }

    /// Change the accept flag of one image on one bank (RAM only; call
    /// [`save`](Self::save) to persist).
    pub fn set_accept_state(
        &mut self,
        image_type: &ImageType,
        bank: u32,
        request: AcceptRequest,
    ) -> Result<()> {
        if bank as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        let index = self.image_index(image_type)?;
        let num_images = self.num_images() as usize;
        let entry = &mut self.sector.images[..num_images][index];

        match request {
            AcceptRequest::Accept => entry.accepted[bank as usize] = IMAGE_ACCEPTED,
            AcceptRequest::Unaccept => entry.accepted[bank as usize] = IMAGE_UNACCEPTED,
            AcceptRequest::WriteUnaccept => {
                entry.accepted[bank as usize] = IMAGE_UNACCEPTED;
                self.sector.bank_state[bank as usize] = BANK_STATE_INVALID;
            }
        }

        Ok(())
    }

    /// Recompute one bank's state from its image accept flags: `ACCEPTED`
    /// when every image is accepted, `VALID` otherwise.
    pub fn update_bank_state(&mut self, bank: u32) -> Result<()> {
        if bank as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        let all_accepted =
            self.entries().iter().all(|entry| entry.accepted[bank as usize] == IMAGE_ACCEPTED);
        self.sector.bank_state[bank as usize] =
            if all_accepted { BANK_STATE_ACCEPTED } else { BANK_STATE_VALID };
        Ok(())
    }

    /// Whether booting from `bank` would be a trial boot (written, not yet
    /// accepted).
    pub fn is_trial_bank(&self, bank: u32) -> Result<bool> {
        Ok(self.bank_state(bank)? == BANK_STATE_VALID)
    }

    /// Copy the backup bank's accept flags and state over the target bank's.
    ///
    /// The backup must be in the `ACCEPTED` state; rolling back to an
    /// unverified bank is refused.
    pub fn roll_back(&mut self, backup: u32, target: u32) -> Result<()> {
        if backup as usize >= NUM_BANKS || target as usize >= NUM_BANKS {
            Err(EfiError::InvalidParameter)?;
        }
        if self.sector.bank_state[backup as usize] != BANK_STATE_ACCEPTED {
            log::error!("fws: backup bank {backup} is not in the accepted state");
            Err(EfiError::InvalidParameter)?;
        }

        let num_images = self.num_images() as usize;
        for entry in &mut self.sector.images[..num_images] {
            entry.accepted[target as usize] = entry.accepted[backup as usize];
        }
        self.sector.bank_state[target as usize] = self.sector.bank_state[backup as usize];

        Ok(())
    }

    fn entries(&self) -> &[ImageEntry] {
        &self.sector.images[..self.num_images() as usize]
    }
}

fn check_block_size<I: BlockIo>(io: &I) -> Result<usize> {
    let block_size = io.media().block_size as usize;
    if block_size < mem::size_of::<MetadataSector>() {
        log::error!("fws: block size {block_size:#x} cannot hold a metadata copy");
        Err(EfiError::InvalidParameter)?;
    }
    Ok(block_size)
}

fn read_sector<I: BlockIo>(io: &mut I, lba: u64) -> Result<MetadataSector> {
    let block_size = check_block_size(io)?;
    let mut block = vec![0u8; block_size];
    io.read_blocks(lba, &mut block)?;
    Ok(MetadataSector::read_from_bytes(&block[..mem::size_of::<MetadataSector>()]).unwrap())
}

fn write_sector<I: BlockIo>(io: &mut I, lba: u64, sector: &MetadataSector) -> Result<()> {
    let block_size = check_block_size(io)?;
    let mut block = vec![0xffu8; block_size];
    block[..mem::size_of::<MetadataSector>()].copy_from_slice(sector.as_bytes());
    io.write_blocks(lba, &block)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimBlockDevice;
    use uuid::uuid;

    const SLOTS: [u64; 2] = [0, 1];

    fn image_a() -> ImageType {
        ImageType(*uuid!("8a2b19c0-6f4d-4d0a-9a41-1f1f3a6d8b01").as_bytes())
    }

    fn image_b() -> ImageType {
        ImageType(*uuid!("c4d57e12-93b8-4e6f-b7a5-2e9d0c4f7a02").as_bytes())
    }

    fn device() -> SimBlockDevice {
        SimBlockDevice::new(0x200, 64)
    }

    #[test]
    fn format_then_load_round_trips() {
        let mut io = device();
        FwsMetadata::format(&mut io, SLOTS, &[image_a(), image_b()]).unwrap();

        let meta = FwsMetadata::load(&mut io, SLOTS).unwrap();
        assert_eq!(meta.active_index(), 0);
        assert_eq!(meta.num_images(), 2);
        assert_eq!(meta.bank_state(0), Ok(BANK_STATE_ACCEPTED));
        assert!(meta.accept_state(&image_a(), 1).unwrap());
    }

    #[test]
    fn load_without_metadata_is_aborted() {
        let mut io = device();
        assert!(matches!(FwsMetadata::load(&mut io, SLOTS), Err(EfiError::Aborted)));
    }

    #[test]
    fn saves_alternate_between_slots() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a()]).unwrap();

        meta.set_active_index(1).unwrap();
        meta.save(&mut io).unwrap();
        let slot1 = io.contents()[0x200..0x400].to_vec();

        meta.set_active_index(0).unwrap();
        meta.save(&mut io).unwrap();

        // The second save landed in slot 0, leaving slot 1 untouched.
        assert_eq!(&io.contents()[0x200..0x400], slot1.as_slice());

        let reloaded = FwsMetadata::load(&mut io, SLOTS).unwrap();
        assert_eq!(reloaded.active_index(), 0);
        assert_eq!(reloaded.sequence(), 2);
    }

    #[test]
    fn torn_write_falls_back_to_previous_copy() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a()]).unwrap();
        meta.set_active_index(1).unwrap();
        meta.save(&mut io).unwrap();

        // Corrupt the copy just written (slot 1); the older slot-0 copy must
        // win on the next load.
        io.contents_mut()[0x210] ^= 0xff;

        let reloaded = FwsMetadata::load(&mut io, SLOTS).unwrap();
        assert_eq!(reloaded.active_index(), 0);
    }

    #[test]
    fn newest_valid_copy_wins() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a()]).unwrap();
        meta.set_active_index(1).unwrap();
        meta.save(&mut io).unwrap();

        let reloaded = FwsMetadata::load(&mut io, SLOTS).unwrap();
        assert_eq!(reloaded.active_index(), 1);
        assert_eq!(reloaded.sequence(), 1);
    }

    #[test]
    fn write_unaccept_invalidates_the_bank() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a(), image_b()]).unwrap();

        meta.set_accept_state(&image_a(), 1, AcceptRequest::WriteUnaccept).unwrap();
        assert_eq!(meta.bank_state(1), Ok(BANK_STATE_INVALID));
        assert!(!meta.accept_state(&image_a(), 1).unwrap());

        // Accepting one of two images leaves the bank merely valid.
        meta.set_accept_state(&image_a(), 1, AcceptRequest::Accept).unwrap();
        meta.set_accept_state(&image_b(), 1, AcceptRequest::Unaccept).unwrap();
        meta.update_bank_state(1).unwrap();
        assert_eq!(meta.bank_state(1), Ok(BANK_STATE_VALID));
        assert!(meta.is_trial_bank(1).unwrap());

        meta.set_accept_state(&image_b(), 1, AcceptRequest::Accept).unwrap();
        meta.update_bank_state(1).unwrap();
        assert_eq!(meta.bank_state(1), Ok(BANK_STATE_ACCEPTED));
    }

    #[test]
    fn unknown_image_type_is_not_found() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a()]).unwrap();
        assert_eq!(meta.accept_state(&image_b(), 0), Err(EfiError::NotFound));
        assert_eq!(
            meta.set_accept_state(&image_b(), 0, AcceptRequest::Accept),
            Err(EfiError::NotFound)
        );
    }

    #[test]
    fn roll_back_requires_an_accepted_backup() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a()]).unwrap();

        meta.set_accept_state(&image_a(), 0, AcceptRequest::WriteUnaccept).unwrap();
        assert_eq!(meta.roll_back(0, 1), Err(EfiError::InvalidParameter));

        // Bank 1 is still accepted; restoring bank 0 from it works.
        meta.roll_back(1, 0).unwrap();
        assert_eq!(meta.bank_state(0), Ok(BANK_STATE_ACCEPTED));
        assert!(meta.accept_state(&image_a(), 0).unwrap());
    }

    #[test]
    fn interrupted_save_keeps_the_old_copy_authoritative() {
        let mut io = device();
        let mut meta = FwsMetadata::format(&mut io, SLOTS, &[image_a()]).unwrap();

        // Power fails before the slot write completes.
        io.fail_after_writes(0);
        meta.set_active_index(1).unwrap();
        assert!(meta.save(&mut io).is_err());
        io.clear_write_limit();

        let reloaded = FwsMetadata::load(&mut io, SLOTS).unwrap();
        assert_eq!(reloaded.active_index(), 0);

        // Retrying the save afterwards succeeds and takes effect.
        meta.save(&mut io).unwrap();
        let reloaded = FwsMetadata::load(&mut io, SLOTS).unwrap();
        assert_eq!(reloaded.active_index(), 1);
    }
}
