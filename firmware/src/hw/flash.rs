//! Storage driver over the last pages of the internal flash bank.
//!
//! Program and erase run blocking on the control task; the completion event
//! is posted to the queue right after, so the control plane still sees the
//! asynchronous contract it expects.

use embassy_stm32::flash::{Blocking, Flash, WRITE_SIZE};
use heapless::Vec;
use tracker_core::Event;
use tracker_core::drivers::{
    Region, StorageDriver, StorageError, StorageHandle, StorageStatus,
};
use tracker_core::flash::layout::{LOG_SECTORS, RECORD_LEN, SECTOR_SIZE};

use crate::config::{LOG_BASE, PAIRING_BASE, PROFILE_BASE};
use crate::runtime;

/// Largest single write the control plane issues.
const MAX_WRITE: usize = RECORD_LEN;
const ERASED: u8 = 0xFF;

const fn region_bounds(region: Region) -> (u32, u32) {
    match region {
        Region::Profile => (PROFILE_BASE, SECTOR_SIZE),
        Region::Log => (LOG_BASE, SECTOR_SIZE * LOG_SECTORS),
        Region::Pairing => (PAIRING_BASE, SECTOR_SIZE),
    }
}

fn absolute(region: Region, offset: u32, len: usize) -> Result<u32, StorageError> {
    let (base, size) = region_bounds(region);
    let len = u32::try_from(len).map_err(|_| StorageError::OutOfBounds)?;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(base + offset),
        _ => Err(StorageError::OutOfBounds),
    }
}

pub struct InternalFlash<'d> {
    flash: Flash<'d, Blocking>,
}

impl<'d> InternalFlash<'d> {
    pub fn new(flash: Flash<'d, Blocking>) -> Self {
        Self { flash }
    }

    fn complete(event: fn(StorageStatus) -> Event, ok: bool) {
        let status = if ok {
            StorageStatus::Success
        } else {
            StorageStatus::Failed
        };
        runtime::post(event(status));
    }
}

impl StorageDriver for InternalFlash<'_> {
    fn init(&mut self, region: Region) -> Result<StorageHandle, StorageError> {
        Ok(StorageHandle::new(region))
    }

    fn read(
        &mut self,
        handle: StorageHandle,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let at = absolute(handle.region(), offset, buf.len())?;
        self.flash
            .blocking_read(at, buf)
            .map_err(|_| StorageError::Failed)
    }

    fn write(
        &mut self,
        handle: StorageHandle,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let aligned = usize::try_from(offset).is_ok_and(|at| at % WRITE_SIZE == 0);
        if data.len() > MAX_WRITE || !aligned {
            return Err(StorageError::OutOfBounds);
        }
        let padded_len = data.len().div_ceil(WRITE_SIZE) * WRITE_SIZE;
        let at = absolute(handle.region(), offset, padded_len)?;

        let mut padded: Vec<u8, MAX_WRITE> = Vec::new();
        padded
            .extend_from_slice(data)
            .map_err(|_| StorageError::OutOfBounds)?;
        padded.resize(padded_len, ERASED).map_err(|_| StorageError::OutOfBounds)?;

        let ok = self.flash.blocking_write(at, &padded).is_ok();
        Self::complete(Event::WriteComplete, ok);
        Ok(())
    }

    fn erase(&mut self, handle: StorageHandle, offset: u32, len: u32) -> Result<(), StorageError> {
        if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
            return Err(StorageError::OutOfBounds);
        }
        let len_bytes = usize::try_from(len).map_err(|_| StorageError::OutOfBounds)?;
        let from = absolute(handle.region(), offset, len_bytes)?;

        let ok = self.flash.blocking_erase(from, from + len).is_ok();
        Self::complete(Event::EraseComplete, ok);
        Ok(())
    }

    fn uninit(&mut self, _handle: StorageHandle) {}
}
