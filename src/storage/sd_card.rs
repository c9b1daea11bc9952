use core::fmt::Write as _;

use embedded_sdmmc::{Mode, SdCard, TimeSource, VolumeIdx, VolumeManager};
use heapless::String;

use super::{Key, MAX_VALUE_LEN, Storage, StorageError};

/// 8.3 file name for a key, e.g. `K0001001.BIN`
type FileName = String<12>;

/// Key-value storage on a FAT-formatted SD card, one file per key.
///
/// Operations are blocking. Each call opens and closes the volume so the
/// card can be shared with other users of the SPI bus between calls.
pub struct SdCardStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    volume_mgr: VolumeManager<SdCard<S, D>, T, 4, 4, 1>,
}

impl<S, D, T> SdCardStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    pub fn new(sd_card: SdCard<S, D>, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(sd_card, ts);

        Self { volume_mgr }
    }

    fn file_name(key: Key) -> FileName {
        let mut name = FileName::new();
        // 12 bytes always fit "K" + 7 digits + ".BIN"
        let _ = write!(name, "K{:07}.BIN", key % 10_000_000);
        name
    }
}

fn map_err<E: core::fmt::Debug>(err: embedded_sdmmc::Error<E>) -> StorageError {
    match err {
        embedded_sdmmc::Error::NotEnoughSpace | embedded_sdmmc::Error::DiskFull => {
            StorageError::NoSpace
        }
        other => {
            log::warn!("SD card error: {:?}", other);
            StorageError::Device
        }
    }
}

impl<S, D, T> Storage for SdCardStorage<S, D, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    fn exists(&self, key: Key) -> bool {
        let name = Self::file_name(key);
        let Ok(volume) = self.volume_mgr.open_volume(VolumeIdx(0)) else {
            return false;
        };
        let Ok(root_dir) = volume.open_root_dir() else {
            return false;
        };
        root_dir.find_directory_entry(name.as_str()).is_ok()
    }

    fn read(&self, key: Key, buf: &mut [u8]) -> Result<Option<usize>, StorageError> {
        let name = Self::file_name(key);
        let volume = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume.open_root_dir().map_err(map_err)?;

        let file = match root_dir.open_file_in_dir(name.as_str(), Mode::ReadOnly) {
            Ok(file) => file,
            Err(embedded_sdmmc::Error::NotFound) => return Ok(None),
            Err(err) => return Err(map_err(err)),
        };

        let mut total = 0;
        while total < buf.len() {
            let read = file.read(&mut buf[total..]).map_err(map_err)?;
            if read == 0 {
                break; // EOF
            }
            total += read;
        }

        file.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume.close().map_err(map_err)?;

        Ok(Some(total))
    }

    fn write(&mut self, key: Key, data: &[u8]) -> Result<(), StorageError> {
        if data.len() > MAX_VALUE_LEN {
            return Err(StorageError::TooLarge(data.len()));
        }

        let name = Self::file_name(key);
        let volume = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume.open_root_dir().map_err(map_err)?;
        let file = root_dir
            .open_file_in_dir(name.as_str(), Mode::ReadWriteCreateOrTruncate)
            .map_err(map_err)?;

        file.write(data).map_err(map_err)?;

        file.close().map_err(map_err)?;
        root_dir.close().map_err(map_err)?;
        volume.close().map_err(map_err)?;

        Ok(())
    }

    fn delete(&mut self, key: Key) -> Result<(), StorageError> {
        let name = Self::file_name(key);
        let volume = self.volume_mgr.open_volume(VolumeIdx(0)).map_err(map_err)?;
        let root_dir = volume.open_root_dir().map_err(map_err)?;

        match root_dir.delete_file_in_dir(name.as_str()) {
            Ok(()) | Err(embedded_sdmmc::Error::NotFound) => {}
            Err(err) => return Err(map_err(err)),
        }

        root_dir.close().map_err(map_err)?;
        volume.close().map_err(map_err)?;

        Ok(())
    }
}
