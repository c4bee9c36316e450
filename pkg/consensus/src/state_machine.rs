use std::collections::HashMap;
use std::sync::Mutex;

use crate::protos::Command;

/// Result of applying a single command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
	pub success: bool,
	pub value: Option<String>,
}

/// In-memory key-value state machine. apply() is the only mutator and is fully
/// deterministic: two servers applying the same command sequence end up with
/// identical maps. Reads may run concurrently with applies and always observe the
/// most recently applied value
pub struct MemoryKVStateMachine {
	data: Mutex<HashMap<String, String>>,
}

impl MemoryKVStateMachine {
	pub fn new() -> MemoryKVStateMachine {
		MemoryKVStateMachine { data: Mutex::new(HashMap::new()) }
	}

	/// Applies one committed command. Must never block on I/O; the apply worker
	/// calls this while entries may be piling up behind it
	pub fn apply(&self, command: &Command) -> CommandOutcome {
		let mut data = self.data.lock().unwrap();

		match command {
			Command::Set { key, value } => {
				data.insert(key.clone(), value.clone());
				CommandOutcome { success: true, value: None }
			}
			Command::Delete { key } => {
				let existed = data.remove(key).is_some();
				CommandOutcome { success: existed, value: None }
			}
			Command::Get { key } => {
				let value = data.get(key).cloned();
				CommandOutcome { success: value.is_some(), value }
			}
			Command::Noop => CommandOutcome { success: true, value: None },
		}
	}

	pub fn get(&self, key: &str) -> Option<String> {
		self.data.lock().unwrap().get(key).cloned()
	}

	pub fn snapshot(&self) -> HashMap<String, String> {
		self.data.lock().unwrap().clone()
	}
}

impl Default for MemoryKVStateMachine {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn apply_set_get_delete() {
		let sm = MemoryKVStateMachine::new();

		sm.apply(&Command::Set { key: "x".into(), value: "1".into() });
		assert_eq!(sm.get("x"), Some("1".into()));

		let got = sm.apply(&Command::Get { key: "x".into() });
		assert_eq!(got, CommandOutcome { success: true, value: Some("1".into()) });

		let deleted = sm.apply(&Command::Delete { key: "x".into() });
		assert!(deleted.success);
		assert_eq!(sm.get("x"), None);

		// Deleting a missing key is a deterministic no-op
		let deleted = sm.apply(&Command::Delete { key: "x".into() });
		assert!(!deleted.success);
	}

	#[test]
	fn replay_produces_identical_snapshot() {
		let commands = vec![
			Command::Set { key: "a".into(), value: "1".into() },
			Command::Set { key: "b".into(), value: "2".into() },
			Command::Noop,
			Command::Delete { key: "a".into() },
			Command::Set { key: "b".into(), value: "3".into() },
			Command::Get { key: "b".into() },
		];

		let first = MemoryKVStateMachine::new();
		let second = MemoryKVStateMachine::new();

		for cmd in &commands {
			first.apply(cmd);
		}
		for cmd in &commands {
			second.apply(cmd);
		}

		assert_eq!(first.snapshot(), second.snapshot());
	}
}
