//! Fixed-width record in a plain file

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::debug;

use super::fixed_record::{self, FLAT_FILE_RECORD_LEN};
use super::fs::{FileSystem, replace_file};
use super::{Backend, Entry};
use crate::config::FLAT_FILE_NAME;
use crate::error::StoreError;
use crate::record::StateRecord;

/// Stores the record as one fixed-width line in a file.
///
/// Saves go through a temporary file and a rename, so an interrupted save
/// leaves the previous record intact.
pub struct FlatFileBackend<F: FileSystem> {
    fs: F,
    path: String,
}

impl<F: FileSystem> FlatFileBackend<F> {
    pub fn new(fs: F, path: &str) -> Self {
        Self {
            fs,
            path: path.to_string(),
        }
    }

    /// Backend on the conventional `watermeter.dat` file
    pub fn with_default_path(fs: F) -> Self {
        Self::new(fs, FLAT_FILE_NAME)
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    fn read_raw(&mut self) -> Result<([u8; FLAT_FILE_RECORD_LEN], usize), StoreError> {
        let mut buf = [0u8; FLAT_FILE_RECORD_LEN];
        let n = self.fs.read_into(&self.path, &mut buf)?;
        Ok((buf, n))
    }
}

impl<F: FileSystem> Backend for FlatFileBackend<F> {
    fn name(&self) -> &'static str {
        "flat-file"
    }

    fn try_load(&mut self) -> Result<StateRecord, StoreError> {
        let (buf, n) = self.read_raw()?;
        let record = fixed_record::decode(&buf[..n])?;
        fixed_record::check_budget::<FLAT_FILE_RECORD_LEN>(&record)?;
        Ok(record)
    }

    fn write_record(&mut self, record: &StateRecord) -> Result<(), StoreError> {
        let encoded = fixed_record::encode::<FLAT_FILE_RECORD_LEN>(record)?;
        replace_file(&mut self.fs, &self.path, encoded.as_bytes())?;
        debug!("Wrote {} bytes to {}", encoded.len(), self.path);
        Ok(())
    }

    fn dump(&mut self) -> Result<Vec<Entry>, StoreError> {
        let (buf, n) = self.read_raw()?;
        fixed_record::dump(&buf[..n])
    }

    fn raw_edit(&mut self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let (buf, n) = self.read_raw().unwrap_or(([0; FLAT_FILE_RECORD_LEN], 0));
        let edited = fixed_record::edit_field::<FLAT_FILE_RECORD_LEN>(&buf[..n], key, value)?;
        replace_file(&mut self.fs, &self.path, edited.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_unix_secs;
    use crate::record::Indicator;
    use crate::storage::MemoryFs;

    fn backend() -> FlatFileBackend<MemoryFs> {
        FlatFileBackend::with_default_path(MemoryFs::new())
    }

    #[test]
    fn save_then_load_round_trips_defaults() {
        let mut backend = backend();
        let now = from_unix_secs(1_700_000_000);
        let mut record = StateRecord::default();

        backend.save(&mut record, now).unwrap();
        let loaded = backend.try_load().unwrap();

        assert_eq!(loaded.last_save_time, now);
        assert_eq!(loaded, record);
        assert_eq!(
            StateRecord {
                last_save_time: Default::default(),
                ..loaded
            },
            StateRecord::default()
        );
    }

    #[test]
    fn file_holds_the_legacy_line() {
        let mut backend = backend();
        let mut record = StateRecord {
            usage: 12,
            indicator: Indicator::None,
            ..StateRecord::default()
        };
        backend
            .save(&mut record, from_unix_secs(1_542_456_000))
            .unwrap();

        assert_eq!(
            backend.fs().file("watermeter.dat"),
            Some(&b"1,12,1.50,2018 11 17 12 0 0,none,watermeter,EOF"[..])
        );
        assert!(!backend.fs().contains("watermeter.dat.tmp"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let mut backend = backend();
        assert!(matches!(
            backend.try_load(),
            Err(StoreError::MediaUnavailable(_))
        ));
        assert_eq!(backend.load(), StateRecord::default());
    }

    #[test]
    fn garbage_file_loads_defaults() {
        let mut backend = backend();
        backend.fs_mut().insert("watermeter.dat", b"\x01\x02 not a record");
        assert_eq!(backend.load(), StateRecord::default());
    }

    #[test]
    fn failed_save_keeps_previous_file_and_stamp() {
        let mut backend = backend();
        let mut record = StateRecord::default();
        backend.save(&mut record, from_unix_secs(1_000_000_000)).unwrap();
        let before = backend.fs().file("watermeter.dat").map(<[u8]>::to_vec);

        backend.fs_mut().set_fail_writes(true);
        record.usage = 99;
        let stamp = record.last_save_time;
        assert!(backend.save(&mut record, from_unix_secs(1_000_000_600)).is_err());

        assert_eq!(record.last_save_time, stamp);
        assert_eq!(backend.fs().file("watermeter.dat").map(<[u8]>::to_vec), before);
    }

    #[test]
    fn raw_edit_changes_one_field_unchecked() {
        let mut backend = backend();
        backend.initialize(from_unix_secs(1_700_000_000)).unwrap();

        backend.raw_edit("usage", Some("4242")).unwrap();
        assert_eq!(backend.try_load().unwrap().usage, 4242);

        backend.raw_edit("ml_per_pulse", Some("zero")).unwrap();
        assert!(backend.try_load().is_err());
        assert_eq!(backend.load(), StateRecord::default());
    }

    #[test]
    fn raw_edit_refuses_a_record_that_could_outgrow_the_buffer() {
        let mut backend = backend();
        backend.initialize(from_unix_secs(1_700_000_000)).unwrap();
        let before = backend.fs().file("watermeter.dat").map(<[u8]>::to_vec);

        assert!(matches!(
            backend.raw_edit("hostname", Some("north-wing-second-floor-utility")),
            Err(StoreError::RecordTooLarge { capacity: FLAT_FILE_RECORD_LEN, .. })
        ));
        assert_eq!(backend.fs().file("watermeter.dat").map(<[u8]>::to_vec), before);
    }

    #[test]
    fn saves_in_place_without_rename() {
        let mut fs = MemoryFs::new();
        fs.set_atomic_rename(false);
        let mut backend = FlatFileBackend::with_default_path(fs);
        let mut record = StateRecord::default();
        backend.save(&mut record, from_unix_secs(1_700_000_000)).unwrap();
        record.usage = 12;
        backend.save(&mut record, from_unix_secs(1_700_000_600)).unwrap();

        assert_eq!(backend.try_load().unwrap(), record);
        assert!(!backend.fs().contains("watermeter.dat.tmp"));
        assert_eq!(backend.fs().writes(), 2);
    }

    #[test]
    fn dump_lists_fields_by_name() {
        let mut backend = backend();
        backend.initialize(from_unix_secs(1_700_000_000)).unwrap();
        let dump = backend.dump().unwrap();
        assert_eq!(dump[2], Entry::new("ml_per_pulse", "1.50"));
    }
}
