//! The ordered list of drives belonging to a session.

use super::Drive;

/// Drives attached to a session, indexed by the order they were added.
#[derive(Debug, Default)]
pub struct DriveRegistry {
    drives: Vec<Drive>,
}

impl DriveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.drives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drives.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Drive> {
        self.drives.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Drive)> {
        self.drives.iter().enumerate()
    }

    /// Append a drive and return its index.
    pub(crate) fn push(&mut self, drive: Drive) -> usize {
        self.drives.push(drive);
        self.drives.len() - 1
    }

    /// Append the placeholder for the appliance's own root disk.
    pub(crate) fn add_dummy(&mut self) -> usize {
        self.push(Drive::dummy())
    }

    /// Mark the current end of the list for a later [`rollback`](Self::rollback).
    pub fn checkpoint(&self) -> usize {
        self.drives.len()
    }

    /// Drop every drive added since `mark`.
    pub(crate) fn rollback(&mut self, mark: usize) {
        self.drives.truncate(mark);
    }

    /// One human readable line per drive.
    pub fn debug_drives(&self) -> Vec<String> {
        self.drives.iter().map(Drive::to_string).collect()
    }
}
