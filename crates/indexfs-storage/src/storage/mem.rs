//! In-memory file writer

use super::{CloseHook, ClosedContent, ClosedFile};
use crate::memory::{MemoryQuota, MemoryReservation};
use crate::writer::FileWriter;
use bytes::Bytes;
use indexfs_common::{Error, Result};
use std::sync::Arc;

/// Buffers the whole file, accounting every byte against the quota
#[derive(Debug)]
pub struct MemFileWriter {
    logical_path: String,
    data: Vec<u8>,
    length: u64,
    reservation: Option<MemoryReservation>,
    hook: Option<CloseHook>,
}

impl MemFileWriter {
    pub fn create(
        logical_path: impl Into<String>,
        quota: &Arc<MemoryQuota>,
        hook: CloseHook,
    ) -> Result<Self> {
        Ok(Self {
            logical_path: logical_path.into(),
            data: Vec::new(),
            length: 0,
            reservation: Some(quota.reserve(0)?),
            hook: Some(hook),
        })
    }
}

impl FileWriter for MemFileWriter {
    fn logical_path(&self) -> &str {
        &self.logical_path
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let (Some(reservation), Some(_)) = (self.reservation.as_mut(), self.hook.as_ref()) else {
            return Err(Error::internal(format!("{} already closed", self.logical_path)));
        };
        reservation.grow(data.len() as u64)?;
        self.data.extend_from_slice(data);
        self.length += data.len() as u64;
        Ok(())
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn close(&mut self) -> Result<()> {
        let Some(hook) = self.hook.take() else {
            return Ok(());
        };
        let data = Bytes::from(std::mem::take(&mut self.data));
        hook.call(ClosedFile {
            logical_path: self.logical_path.clone(),
            length: data.len() as u64,
            content: ClosedContent::Mem {
                data,
                reservation: self.reservation.take(),
            },
        })
    }

    fn is_closed(&self) -> bool {
        self.hook.is_none()
    }
}
