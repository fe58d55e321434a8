//! Module for converting EFI status codes to rusty errors.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// A specialized [`Result`](core::result::Result) type for flash storage operations.
pub type Result<T> = core::result::Result<T, EfiError>;

use r_efi::efi;

/// EDK II error code equivalent as a Rust error enum.
///
/// Only the statuses produced by this stack are spelled out; anything else
/// round-trips through [`EfiError::Unknown`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EfiError {
    InvalidParameter,
    Unsupported,
    BadBufferSize,
    BufferTooSmall,
    NotReady,
    DeviceError,
    WriteProtected,
    OutOfResources,
    VolumeCorrupted,
    NotFound,
    AccessDenied,
    Timeout,
    Aborted,
    CrcError,
    Unknown(efi::Status),
}

impl EfiError {
    /// Converts an `r_efi::efi::Status` to a `Result`.
    ///
    /// If the status is `SUCCESS`, it returns `Ok(())`. Otherwise, it returns
    /// an `Err` with the corresponding `EfiError`.
    pub fn status_to_result(status: efi::Status) -> Result<()> {
        match status {
            efi::Status::SUCCESS => Ok(()),
            efi::Status::INVALID_PARAMETER => Err(EfiError::InvalidParameter),
            efi::Status::UNSUPPORTED => Err(EfiError::Unsupported),
            efi::Status::BAD_BUFFER_SIZE => Err(EfiError::BadBufferSize),
            efi::Status::BUFFER_TOO_SMALL => Err(EfiError::BufferTooSmall),
            efi::Status::NOT_READY => Err(EfiError::NotReady),
            efi::Status::DEVICE_ERROR => Err(EfiError::DeviceError),
            efi::Status::WRITE_PROTECTED => Err(EfiError::WriteProtected),
            efi::Status::OUT_OF_RESOURCES => Err(EfiError::OutOfResources),
            efi::Status::VOLUME_CORRUPTED => Err(EfiError::VolumeCorrupted),
            efi::Status::NOT_FOUND => Err(EfiError::NotFound),
            efi::Status::ACCESS_DENIED => Err(EfiError::AccessDenied),
            efi::Status::TIMEOUT => Err(EfiError::Timeout),
            efi::Status::ABORTED => Err(EfiError::Aborted),
            efi::Status::CRC_ERROR => Err(EfiError::CrcError),
            _ => Err(EfiError::Unknown(status)),
        }
    }
}

impl From<EfiError> for efi::Status {
    fn from(e: EfiError) -> efi::Status {
        match e {
            EfiError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            EfiError::Unsupported => efi::Status::UNSUPPORTED,
            EfiError::BadBufferSize => efi::Status::BAD_BUFFER_SIZE,
            EfiError::BufferTooSmall => efi::Status::BUFFER_TOO_SMALL,
            EfiError::NotReady => efi::Status::NOT_READY,
            EfiError::DeviceError => efi::Status::DEVICE_ERROR,
            EfiError::WriteProtected => efi::Status::WRITE_PROTECTED,
            EfiError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            EfiError::VolumeCorrupted => efi::Status::VOLUME_CORRUPTED,
            EfiError::NotFound => efi::Status::NOT_FOUND,
            EfiError::AccessDenied => efi::Status::ACCESS_DENIED,
            EfiError::Timeout => efi::Status::TIMEOUT,
            EfiError::Aborted => efi::Status::ABORTED,
            EfiError::CrcError => efi::Status::CRC_ERROR,
            EfiError::Unknown(status) => status,
        }
    }
}

impl From<efi::Status> for EfiError {
    fn from(status: efi::Status) -> EfiError {
        EfiError::status_to_result(status).unwrap_err()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_round_trips_through_error() {
        let statuses = [
            efi::Status::INVALID_PARAMETER,
            efi::Status::DEVICE_ERROR,
            efi::Status::TIMEOUT,
            efi::Status::NOT_READY,
            efi::Status::ABORTED,
            efi::Status::NOT_FOUND,
        ];
        for status in statuses {
            let err: EfiError = status.into();
            assert_eq!(efi::Status::from(err), status);
        }
    }

    #[test]
    fn success_maps_to_ok() {
        assert_eq!(EfiError::status_to_result(efi::Status::SUCCESS), Ok(()));
    }

    #[test]
    fn unrecognized_status_is_preserved() {
        let err: EfiError = efi::Status::ICMP_ERROR.into();
        assert_eq!(err, EfiError::Unknown(efi::Status::ICMP_ERROR));
        assert_eq!(efi::Status::from(err), efi::Status::ICMP_ERROR);
    }
}
