//! Simulated device programmer
//!
//! Models the download/activate interface of a programmable FRU with
//! poll-count latencies and scriptable failures, so pipeline behavior can be
//! exercised without hardware.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::domain::ports::{DeviceProgrammer, OpStatus};
use crate::domain::{DeviceLocation, FirmwareTarget};
use crate::error::{Error, Result};

/// Scripted behavior for one slot.
#[derive(Debug, Clone, Default)]
pub struct ProgrammerScript {
    /// Polls before a download reports Done
    pub download_polls: u32,
    /// Polls before an activation reports Done
    pub activate_polls: u32,
    /// Download ends with a checksum rejection
    pub fail_checksum: bool,
    /// Activation never completes
    pub fail_activate_timeout: bool,
    /// start_download returns busy this many times before accepting
    pub busy_starts: u32,
}

#[derive(Debug)]
struct SlotState {
    script: ProgrammerScript,
    download_remaining: Option<u32>,
    activate_remaining: Option<u32>,
    busy_left: u32,
}

#[derive(Default)]
struct Shared {
    slots: HashMap<DeviceLocation, SlotState>,
    downloads: Vec<(DeviceLocation, FirmwareTarget, usize)>,
    activations: Vec<DeviceLocation>,
}

/// Simulated programmer, cloneable for inspection from tests.
#[derive(Clone, Default)]
pub struct SimulatedProgrammer {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a script for a slot; slots without one succeed instantly.
    pub fn script(&self, location: DeviceLocation, script: ProgrammerScript) {
        let busy_left = script.busy_starts;
        self.shared.lock().slots.insert(
            location,
            SlotState {
                script,
                download_remaining: None,
                activate_remaining: None,
                busy_left,
            },
        );
    }

    /// Downloads started so far: (slot, target, image length).
    pub fn downloads(&self) -> Vec<(DeviceLocation, FirmwareTarget, usize)> {
        self.shared.lock().downloads.clone()
    }

    /// Activations started so far.
    pub fn activations(&self) -> Vec<DeviceLocation> {
        self.shared.lock().activations.clone()
    }
}

impl DeviceProgrammer for SimulatedProgrammer {
    fn start_download(
        &mut self,
        location: DeviceLocation,
        target: &FirmwareTarget,
        image: Bytes,
    ) -> Result<()> {
        let mut shared = self.shared.lock();
        let slot = shared.slots.entry(location).or_insert_with(|| SlotState {
            script: ProgrammerScript::default(),
            download_remaining: None,
            activate_remaining: None,
            busy_left: 0,
        });
        if slot.busy_left > 0 {
            slot.busy_left -= 1;
            return Err(Error::Busy(format!("slot {} download", location)));
        }
        slot.download_remaining = Some(slot.script.download_polls);
        shared
            .downloads
            .push((location, target.clone(), image.len()));
        Ok(())
    }

    fn poll_download(&mut self, location: DeviceLocation) -> OpStatus {
        let mut shared = self.shared.lock();
        let Some(slot) = shared.slots.get_mut(&location) else {
            return OpStatus::Done;
        };
        match slot.download_remaining {
            None => OpStatus::Done,
            Some(0) => {
                slot.download_remaining = None;
                if slot.script.fail_checksum {
                    OpStatus::ChecksumError
                } else {
                    OpStatus::Done
                }
            }
            Some(n) => {
                slot.download_remaining = Some(n - 1);
                OpStatus::InProgress
            }
        }
    }

    fn start_activate(&mut self, location: DeviceLocation) -> Result<()> {
        let mut shared = self.shared.lock();
        let slot = shared.slots.entry(location).or_insert_with(|| SlotState {
            script: ProgrammerScript::default(),
            download_remaining: None,
            activate_remaining: None,
            busy_left: 0,
        });
        slot.activate_remaining = Some(slot.script.activate_polls);
        shared.activations.push(location);
        Ok(())
    }

    fn poll_activate(&mut self, location: DeviceLocation) -> OpStatus {
        let mut shared = self.shared.lock();
        let Some(slot) = shared.slots.get_mut(&location) else {
            return OpStatus::Done;
        };
        match slot.activate_remaining {
            None => OpStatus::Done,
            Some(0) => {
                slot.activate_remaining = None;
                if slot.script.fail_activate_timeout {
                    OpStatus::ActivateTimeout
                } else {
                    OpStatus::Done
                }
            }
            Some(n) => {
                slot.activate_remaining = Some(n - 1);
                OpStatus::InProgress
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> DeviceLocation {
        DeviceLocation::new(0, 0, 0)
    }

    #[test]
    fn test_instant_success_without_script() {
        let mut prog = SimulatedProgrammer::new();
        prog.start_download(loc(), &FirmwareTarget::legacy(), Bytes::from_static(b"img"))
            .unwrap();
        assert_eq!(prog.poll_download(loc()), OpStatus::Done);
        prog.start_activate(loc()).unwrap();
        assert_eq!(prog.poll_activate(loc()), OpStatus::Done);
        assert_eq!(prog.downloads().len(), 1);
    }

    #[test]
    fn test_scripted_latency_and_checksum_failure() {
        let mut prog = SimulatedProgrammer::new();
        prog.script(
            loc(),
            ProgrammerScript {
                download_polls: 2,
                fail_checksum: true,
                ..ProgrammerScript::default()
            },
        );
        prog.start_download(loc(), &FirmwareTarget::legacy(), Bytes::from_static(b"img"))
            .unwrap();
        assert_eq!(prog.poll_download(loc()), OpStatus::InProgress);
        assert_eq!(prog.poll_download(loc()), OpStatus::InProgress);
        assert_eq!(prog.poll_download(loc()), OpStatus::ChecksumError);
    }

    #[test]
    fn test_busy_starts_consume_then_accept() {
        let mut prog = SimulatedProgrammer::new();
        prog.script(
            loc(),
            ProgrammerScript {
                busy_starts: 1,
                ..ProgrammerScript::default()
            },
        );
        let err = prog
            .start_download(loc(), &FirmwareTarget::legacy(), Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(prog
            .start_download(loc(), &FirmwareTarget::legacy(), Bytes::from_static(b"x"))
            .is_ok());
    }
}
