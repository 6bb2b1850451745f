// Shared test doubles: an in-memory line sink and snapshot store.
#![allow(dead_code)]

use std::sync::Mutex;

use async_trait::async_trait;

use feeder_rs::hardware::{LineSink, LinkError};
use feeder_rs::snapshot::{MachineSnapshot, SnapshotError, StateStore};

/// Collects every line the machine sends instead of writing to a port.
#[derive(Default)]
pub struct MockLink {
    sent: Mutex<Vec<String>>,
}

impl MockLink {
    pub fn sent_lines(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    pub fn last_sent(&self) -> Option<String> {
        self.sent.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl LineSink for MockLink {
    async fn send_line(&self, line: &str) -> Result<(), LinkError> {
        self.sent.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// Snapshot store backed by memory, counting saves.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<MachineSnapshot>>,
    save_count: Mutex<u32>,
}

impl MemoryStore {
    pub fn seeded(snapshot: MachineSnapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
            save_count: Mutex::new(0),
        }
    }

    pub fn saved(&self) -> Option<MachineSnapshot> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> u32 {
        *self.save_count.lock().unwrap()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> MachineSnapshot {
        self.saved.lock().unwrap().clone().unwrap_or_default()
    }

    async fn save(&self, snapshot: &MachineSnapshot) -> Result<(), SnapshotError> {
        *self.saved.lock().unwrap() = Some(snapshot.clone());
        *self.save_count.lock().unwrap() += 1;
        Ok(())
    }
}
