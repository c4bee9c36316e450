use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::*;
use crate::protos::{HardState, ServerId};
use crate::rpc::{marshal, unmarshal};

/// A file that can only ever be observed in its pre-write or post-write state.
/// Every store writes the full blob to a sibling temp file, flushes it, and
/// renames it over the target, so a crash at any point leaves a readable copy
pub struct AtomicFile {
	path: PathBuf,
	tmp_path: PathBuf,
}

impl AtomicFile {
	pub fn new(path: PathBuf) -> AtomicFile {
		let mut tmp = path.as_os_str().to_owned();
		tmp.push(".tmp");
		AtomicFile { path, tmp_path: PathBuf::from(tmp) }
	}

	/// Reads the last fully stored blob, or None if nothing was ever stored
	pub fn load(&self) -> Result<Option<Vec<u8>>> {
		match std::fs::read(&self.path) {
			Ok(data) => Ok(Some(data)),
			Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	pub fn store(&self, data: &[u8]) -> Result<()> {
		{
			let mut file = File::create(&self.tmp_path)?;
			file.write_all(data)?;
			// The rename must never land before the contents
			file.sync_all()?;
		}

		std::fs::rename(&self.tmp_path, &self.path)?;
		Ok(())
	}
}

/// Durable record of one server's hard state, keyed by server id so that several
/// servers may share a data directory on one host
pub struct Wal {
	file: AtomicFile,
}

impl Wal {
	pub fn open(dir: &Path, id: ServerId) -> Wal {
		Wal { file: AtomicFile::new(dir.join(format!("server-{}.wal", id))) }
	}

	/// Returns the last saved state, or the zero state if this server has never
	/// saved one. A present but undecodable file is an error; silently resetting
	/// would let this server vote twice in a term
	pub fn load(&self) -> Result<HardState> {
		match self.file.load()? {
			Some(data) => {
				unmarshal(&data).chain_err(|| "write-ahead log payload is corrupt")
			}
			None => Ok(HardState::default()),
		}
	}

	pub fn save(&self, state: &HardState) -> Result<()> {
		self.file.store(&marshal(state)?)
	}
}

/// Holds an exclusive advisory lock on a data directory for as long as the value
/// lives. Prevents two server processes from sharing one state directory
pub struct DirLock {
	_file: File,
	path: PathBuf,
}

impl DirLock {
	pub fn open(dir: &Path) -> Result<DirLock> {
		std::fs::create_dir_all(dir)?;

		let path = dir.join("LOCK");
		let file = OpenOptions::new().write(true).create(true).open(&path)?;

		file.try_lock_exclusive()
			.chain_err(|| format!("data directory {:?} is locked by another process", dir))?;

		Ok(DirLock { _file: file, path })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protos::{Command, LogEntry};

	#[test]
	fn wal_round_trips_hard_state() {
		let dir = tempfile::tempdir().unwrap();
		let wal = Wal::open(dir.path(), 1);

		let state = HardState {
			current_term: 7,
			voted_for: Some(3),
			entries: vec![
				LogEntry { term: 6, index: 1, command: Command::Set { key: "k".into(), value: "v".into() } },
				LogEntry { term: 7, index: 2, command: Command::Noop },
			],
		};

		wal.save(&state).unwrap();
		assert_eq!(wal.load().unwrap(), state);

		// Overwrites atomically rather than appending
		let next = HardState { current_term: 8, voted_for: None, entries: state.entries.clone() };
		wal.save(&next).unwrap();
		assert_eq!(wal.load().unwrap(), next);
	}

	#[test]
	fn wal_defaults_when_absent() {
		let dir = tempfile::tempdir().unwrap();
		let wal = Wal::open(dir.path(), 42);

		let state = wal.load().unwrap();
		assert_eq!(state, HardState::default());
	}

	#[test]
	fn wal_reports_corruption() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("server-1.wal"), b"not a valid payload").unwrap();

		let wal = Wal::open(dir.path(), 1);
		assert!(wal.load().is_err());
	}

	#[test]
	fn wals_are_keyed_by_server_id() {
		let dir = tempfile::tempdir().unwrap();

		let a = Wal::open(dir.path(), 1);
		let b = Wal::open(dir.path(), 2);

		let state = HardState { current_term: 3, voted_for: Some(1), entries: vec![] };
		a.save(&state).unwrap();

		assert_eq!(b.load().unwrap(), HardState::default());
		assert_eq!(a.load().unwrap(), state);
	}

	#[test]
	fn dir_lock_is_exclusive() {
		let dir = tempfile::tempdir().unwrap();

		let lock = DirLock::open(dir.path()).unwrap();
		assert!(DirLock::open(dir.path()).is_err());

		drop(lock);
		assert!(DirLock::open(dir.path()).is_ok());
	}
}
