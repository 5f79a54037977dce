//! Blocking single-transfer convenience calls, layered over the async engine:
//! submit, drive the event loop from the calling thread until the transfer is
//! terminal, and map the outcome to a `Result`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    transfer::{
        ControlSetup, Direction, EndpointType, Transfer, TransferStatus, SETUP_PACKET_SIZE,
    },
    Context, DeviceHandle, Error, ErrorKind,
};

impl DeviceHandle {
    /// Perform a control transfer and block until it is terminal.
    ///
    /// The data stage uses `data`: sent for an OUT request, filled in for an
    /// IN request (`wLength` is `data.len()` in both cases). Returns the
    /// number of bytes of the data stage actually transferred.
    pub fn control_transfer(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let mut setup = setup;
        setup.length = data
            .len()
            .try_into()
            .map_err(|_| Error::new(ErrorKind::InvalidParam, "control data stage too long"))?;
        let buffer = match setup.direction() {
            Direction::Out => setup.buffer_out(data),
            Direction::In => setup.buffer_in(),
        };

        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let transfer = Transfer::control(self, buffer, timeout, move |_| {
            flag.store(true, Ordering::SeqCst);
        });
        transfer.submit()?;
        wait_for_completion(&self.context(), &transfer, &completed)?;

        let n = map_status(&transfer)?;
        if setup.direction() == Direction::In {
            let buf = transfer.buffer();
            let n = n.min(data.len());
            data[..n].copy_from_slice(&buf[SETUP_PACKET_SIZE..SETUP_PACKET_SIZE + n]);
        }
        Ok(n)
    }

    /// Perform a bulk transfer and block until it is terminal. Direction is
    /// taken from bit 7 of `endpoint`: `data` is sent for OUT, filled for IN.
    /// Returns the number of bytes transferred.
    pub fn bulk_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.sync_transfer(endpoint, EndpointType::Bulk, data, timeout)
    }

    /// Perform an interrupt transfer and block until it is terminal. Same
    /// conventions as [`bulk_transfer`][`Self::bulk_transfer`].
    pub fn interrupt_transfer(
        &self,
        endpoint: u8,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.sync_transfer(endpoint, EndpointType::Interrupt, data, timeout)
    }

    fn sync_transfer(
        &self,
        endpoint: u8,
        ep_type: EndpointType,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let completed = Arc::new(AtomicBool::new(false));
        let flag = completed.clone();
        let callback = move |_: &Transfer| {
            flag.store(true, Ordering::SeqCst);
        };
        let transfer = match ep_type {
            EndpointType::Bulk => Transfer::bulk(self, endpoint, data.to_vec(), timeout, callback),
            EndpointType::Interrupt => {
                Transfer::interrupt(self, endpoint, data.to_vec(), timeout, callback)
            }
            _ => unreachable!("sync_transfer is bulk or interrupt only"),
        };
        transfer.submit()?;
        wait_for_completion(&self.context(), &transfer, &completed)?;

        let n = map_status(&transfer)?;
        if Direction::from_address(endpoint) == Direction::In {
            let buf = transfer.buffer();
            let n = n.min(data.len());
            data[..n].copy_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

/// Drive the event loop until `completed` is set. On a fatal event-loop
/// error, cancel the transfer, drain until it is terminal, and report the
/// error.
fn wait_for_completion(
    ctx: &Context,
    transfer: &Transfer,
    completed: &AtomicBool,
) -> Result<(), Error> {
    while !completed.load(Ordering::SeqCst) {
        match ctx.handle_events() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                transfer.cancel().ok();
                while !completed.load(Ordering::SeqCst) {
                    if ctx.handle_events().is_err() {
                        break;
                    }
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

fn map_status(transfer: &Transfer) -> Result<usize, Error> {
    match transfer.status().unwrap_or(TransferStatus::Error) {
        TransferStatus::Completed => Ok(transfer.actual_length()),
        TransferStatus::TimedOut => Err(Error::new(ErrorKind::Timeout, "transfer timed out")),
        TransferStatus::Stall => Err(Error::new(ErrorKind::Pipe, "endpoint stalled")),
        TransferStatus::NoDevice => Err(Error::new(ErrorKind::NoDevice, "device disconnected")),
        TransferStatus::Overflow => Err(Error::new(
            ErrorKind::Overflow,
            "device sent more data than requested",
        )),
        TransferStatus::Error | TransferStatus::Cancelled => {
            Err(Error::new(ErrorKind::Io, "transfer failed"))
        }
    }
}
