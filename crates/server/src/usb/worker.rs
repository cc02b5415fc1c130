//! USB worker thread
//!
//! Dedicated thread for USB I/O. Drains the command queue, executes
//! transfers synchronously (which makes per-device completion order
//! equal submission order), services libusb events for the hotplug
//! callbacks, and fires debounced hotplug work.

use std::time::Duration;

use common::{DeviceKey, TransferStatus, TransferToken, UsbCommand, UsbEvent, UsbWorker};
use rusb::UsbContext;
use tracing::{debug, info, warn};

use super::manager::DeviceManager;

/// Per-transfer timeout. Frames are at most ~1.6 KB; a full-speed
/// device that cannot take that within a second is wedged.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(1);

/// How long one libusb event wait may block. Short, so commands queued
/// meanwhile keep frame latency bounded.
const EVENT_TIMEOUT: Duration = Duration::from_millis(4);

pub struct UsbWorkerThread {
    manager: DeviceManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(worker: UsbWorker) -> Result<Self, rusb::Error> {
        let mut manager = DeviceManager::new(worker.event_sender())?;
        manager.initialize()?;
        Ok(Self { manager, worker })
    }

    /// Main loop: commands, libusb events, debounced hotplug. Runs
    /// until a Shutdown command arrives.
    pub fn run(mut self) -> Result<(), rusb::Error> {
        info!("USB worker thread started");

        'outer: loop {
            while let Some(cmd) = self.worker.try_recv_command() {
                if matches!(cmd, UsbCommand::Shutdown) {
                    info!("USB worker shutting down");
                    break 'outer;
                }
                self.handle_command(cmd);
            }

            match self.manager.context().handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) | Err(rusb::Error::Interrupted) => {}
                Err(e) => {
                    warn!("libusb event handling error: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }

            self.manager.process_debounced_events();
        }

        info!("USB worker thread stopped");
        Ok(())
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::SubmitOut {
                key,
                endpoint,
                data,
                token,
            } => {
                let (status, bytes) = self.execute_out(key, endpoint, &data);
                self.report(key, token, status, bytes);
            }

            UsbCommand::SubmitControl {
                key,
                request_type,
                request,
                value,
                index,
                token,
            } => {
                let status = self.execute_control(key, request_type, request, value, index);
                self.report(key, token, status, 0);
            }

            UsbCommand::CloseDevice { key } => {
                self.manager.close_device(key);
            }

            UsbCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn execute_out(&mut self, key: DeviceKey, endpoint: u8, data: &[u8]) -> (TransferStatus, usize) {
        let Some(handle) = self.manager.handle_mut(key) else {
            // Device already gone; the transfer was queued behind its
            // removal and completes as cancelled.
            return (TransferStatus::Cancelled, 0);
        };

        match handle.write_bulk(endpoint, data, TRANSFER_TIMEOUT) {
            Ok(n) => (TransferStatus::Ok, n),
            Err(e) => (map_write_error(key, endpoint, e), 0),
        }
    }

    fn execute_control(
        &mut self,
        key: DeviceKey,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
    ) -> TransferStatus {
        let Some(handle) = self.manager.handle_mut(key) else {
            return TransferStatus::Cancelled;
        };

        match handle.write_control(request_type, request, value, index, &[], TRANSFER_TIMEOUT) {
            Ok(_) => TransferStatus::Ok,
            Err(e) => map_write_error(key, 0, e),
        }
    }

    /// Deliver a completion; a hard failure additionally retires the
    /// device, which emits the synthetic leave event.
    fn report(&mut self, key: DeviceKey, token: TransferToken, status: TransferStatus, bytes: usize) {
        let _ = self.worker.send_event(UsbEvent::TransferComplete {
            key,
            token,
            status,
            bytes,
        });

        if status == TransferStatus::IoError {
            self.manager.drop_failed_device(key);
        }
    }
}

fn map_write_error(key: DeviceKey, endpoint: u8, err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Pipe => {
            warn!("endpoint {:#x} stalled at {}", endpoint, key);
            TransferStatus::Stall
        }
        rusb::Error::Busy => {
            debug!("transfer busy at {}", key);
            TransferStatus::Cancelled
        }
        e => {
            warn!("transfer failed at {}: {}", key, e);
            TransferStatus::IoError
        }
    }
}

/// Spawn the USB worker thread. The thread runs until a Shutdown
/// command is received.
pub fn spawn_usb_worker(worker: UsbWorker) -> std::thread::JoinHandle<Result<(), rusb::Error>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let worker_thread = UsbWorkerThread::new(worker)?;
            worker_thread.run()
        })
        .expect("Failed to spawn USB worker thread")
}
