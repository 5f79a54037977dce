//! End-to-end tests of the engine over a mock backend that simulates the
//! kernel transport: submissions are recorded, completions and cancellations
//! are queued and delivered through an eventfd so they travel the same
//! poll-readiness path a real backend uses.

pub(crate) mod mock {
    use std::{
        collections::VecDeque,
        fs::File,
        io::{Read, Write},
        mem::ManuallyDrop,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use rustix::{
        event::{eventfd, EventfdFlags},
        fd::{AsRawFd, FromRawFd, OwnedFd},
    };

    use crate::{
        backend::Backend,
        descriptors::DESCRIPTOR_LEN_DEVICE,
        device::{DeviceInner, HandleInner},
        events::{PollEvents, PollFd},
        transfer::{CompletionStatus, EndpointType, Transfer, TransferStatus, SETUP_PACKET_SIZE},
        Context, Error, ErrorKind,
    };

    pub struct MockDevice {
        pub session_id: u64,
        pub bus_number: u8,
        pub device_address: u8,
        pub descriptor: [u8; DESCRIPTOR_LEN_DEVICE],
    }

    pub fn device_descriptor_bytes(
        vendor_id: u16,
        product_id: u16,
        num_configurations: u8,
    ) -> [u8; DESCRIPTOR_LEN_DEVICE] {
        let v = vendor_id.to_le_bytes();
        let p = product_id.to_le_bytes();
        [
            18, 1, 0x00, 0x02, 0, 0, 0, 64, v[0], v[1], p[0], p[1], 0x00, 0x01, 0, 0, 0,
            num_configurations,
        ]
    }

    enum MockEvent {
        Complete {
            transfer: Transfer,
            status: TransferStatus,
            data: Option<Vec<u8>>,
            actual: usize,
        },
        CancelDone {
            transfer: Transfer,
        },
    }

    struct MockHandle {
        fd: OwnedFd,
    }

    pub struct MockBackend {
        event_fd: OwnedFd,
        devices: Mutex<Vec<MockDevice>>,
        events: Mutex<VecDeque<MockEvent>>,
        config_descriptor: Mutex<Vec<u8>>,
        pub destroyed: Mutex<Vec<u64>>,
        pub closed: Mutex<usize>,
        pub claims: Mutex<Vec<u8>>,
        pub releases: Mutex<Vec<u8>>,
        pub submitted: Mutex<Vec<Transfer>>,
        pub cancels: Mutex<Vec<Transfer>>,
        pub fail_open: AtomicBool,
        pub fail_submit: AtomicBool,
    }

    impl MockBackend {
        pub fn new(devices: Vec<MockDevice>) -> Arc<MockBackend> {
            let event_fd =
                eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).expect("eventfd");
            Arc::new(MockBackend {
                event_fd,
                devices: Mutex::new(devices),
                events: Mutex::new(VecDeque::new()),
                config_descriptor: Mutex::new(Vec::new()),
                destroyed: Mutex::new(Vec::new()),
                closed: Mutex::new(0),
                claims: Mutex::new(Vec::new()),
                releases: Mutex::new(Vec::new()),
                submitted: Mutex::new(Vec::new()),
                cancels: Mutex::new(Vec::new()),
                fail_open: AtomicBool::new(false),
                fail_submit: AtomicBool::new(false),
            })
        }

        fn signal(&self) {
            let mut f =
                ManuallyDrop::new(unsafe { File::from_raw_fd(self.event_fd.as_raw_fd()) });
            let _ = f.write(&1u64.to_ne_bytes());
        }

        fn drain(&self) {
            let mut f =
                ManuallyDrop::new(unsafe { File::from_raw_fd(self.event_fd.as_raw_fd()) });
            let mut buf = [0u8; 8];
            let _ = f.read(&mut buf);
        }

        pub fn complete(&self, transfer: &Transfer, status: TransferStatus, actual: usize) {
            self.events.lock().unwrap().push_back(MockEvent::Complete {
                transfer: transfer.clone(),
                status,
                data: None,
                actual,
            });
            self.signal();
        }

        pub fn complete_with_data(
            &self,
            transfer: &Transfer,
            status: TransferStatus,
            data: &[u8],
        ) {
            self.events.lock().unwrap().push_back(MockEvent::Complete {
                transfer: transfer.clone(),
                status,
                data: Some(data.to_vec()),
                actual: data.len(),
            });
            self.signal();
        }

        pub fn set_config_descriptor(&self, bytes: Vec<u8>) {
            *self.config_descriptor.lock().unwrap() = bytes;
        }
    }

    impl Backend for MockBackend {
        fn init(&self, ctx: &Context) -> Result<(), Error> {
            ctx.add_poll_fd(self.event_fd.as_raw_fd(), PollEvents::IN);
            Ok(())
        }

        fn scan_devices(&self, ctx: &Context) -> Result<Vec<Arc<DeviceInner>>, Error> {
            // release the device-table lock before sanitize calls back into
            // device_descriptor
            let present: Vec<(u64, u8, u8)> = self
                .devices
                .lock()
                .unwrap()
                .iter()
                .map(|d| (d.session_id, d.bus_number, d.device_address))
                .collect();
            let mut out = Vec::new();
            for (session_id, bus_number, device_address) in present {
                if let Some(dev) = ctx.device_by_session_id(session_id) {
                    out.push(dev);
                    continue;
                }
                let dev = ctx.alloc_device(session_id, bus_number, device_address);
                if ctx.sanitize_device(&dev).is_ok() {
                    out.push(dev);
                }
            }
            Ok(out)
        }

        fn open(&self, handle: &Arc<HandleInner>) -> Result<(), Error> {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::Access, "mock open failure"));
            }
            let fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).expect("eventfd");
            let raw = fd.as_raw_fd();
            handle.backend_data.set(Box::new(MockHandle { fd })).ok();
            handle.context().add_poll_fd(raw, PollEvents::IN);
            Ok(())
        }

        fn close(&self, handle: &HandleInner) {
            *self.closed.lock().unwrap() += 1;
            if let Some(data) = handle
                .backend_data
                .get()
                .and_then(|d| d.downcast_ref::<MockHandle>())
            {
                handle.context().remove_poll_fd(data.fd.as_raw_fd());
            }
        }

        fn device_descriptor(
            &self,
            device: &DeviceInner,
        ) -> Result<[u8; DESCRIPTOR_LEN_DEVICE], Error> {
            self.devices
                .lock()
                .unwrap()
                .iter()
                .find(|d| d.session_id == device.session_id)
                .map(|d| d.descriptor)
                .ok_or_else(|| Error::new(ErrorKind::NoDevice, "unknown mock device"))
        }

        fn active_config_descriptor(&self, _device: &DeviceInner) -> Result<Vec<u8>, Error> {
            Ok(self.config_descriptor.lock().unwrap().clone())
        }

        fn set_configuration(
            &self,
            _handle: &HandleInner,
            _config: Option<u8>,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn claim_interface(&self, _handle: &HandleInner, interface: u8) -> Result<(), Error> {
            self.claims.lock().unwrap().push(interface);
            Ok(())
        }

        fn release_interface(&self, _handle: &HandleInner, interface: u8) -> Result<(), Error> {
            self.releases.lock().unwrap().push(interface);
            Ok(())
        }

        fn set_interface_alt_setting(
            &self,
            _handle: &HandleInner,
            _interface: u8,
            _alt_setting: u8,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn clear_halt(&self, _handle: &HandleInner, _endpoint: u8) -> Result<(), Error> {
            Ok(())
        }

        fn reset_device(&self, _handle: &HandleInner) -> Result<(), Error> {
            Ok(())
        }

        fn submit_transfer(&self, transfer: &Transfer) -> Result<(), Error> {
            if self.fail_submit.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::NoDevice, "mock submit failure"));
            }
            self.submitted.lock().unwrap().push(transfer.clone());
            Ok(())
        }

        fn cancel_transfer(&self, transfer: &Transfer) -> Result<(), Error> {
            self.cancels.lock().unwrap().push(transfer.clone());
            self.events.lock().unwrap().push_back(MockEvent::CancelDone {
                transfer: transfer.clone(),
            });
            self.signal();
            Ok(())
        }

        fn handle_events(&self, ctx: &Context, _ready: &[PollFd]) -> Result<(), Error> {
            self.drain();
            let events: Vec<MockEvent> = self.events.lock().unwrap().drain(..).collect();
            for ev in events {
                match ev {
                    MockEvent::Complete {
                        transfer,
                        status,
                        data,
                        actual,
                    } => {
                        {
                            let mut st = transfer.inner.state.lock().unwrap();
                            if let Some(data) = data {
                                let offset =
                                    if transfer.endpoint_type() == EndpointType::Control {
                                        SETUP_PACKET_SIZE
                                    } else {
                                        0
                                    };
                                let n = data.len().min(st.buffer.len().saturating_sub(offset));
                                st.buffer[offset..offset + n].copy_from_slice(&data[..n]);
                            }
                            st.actual_length = actual;
                        }
                        ctx.handle_transfer_completion(&transfer, CompletionStatus::Done(status));
                    }
                    MockEvent::CancelDone { transfer } => {
                        ctx.handle_transfer_cancellation(&transfer);
                    }
                }
            }
            Ok(())
        }

        fn destroy_device(&self, device: &DeviceInner) {
            self.destroyed.lock().unwrap().push(device.session_id);
        }
    }

    pub fn mock_context(sessions: &[(u64, u8, u8)]) -> (Context, Arc<MockBackend>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let devices = sessions
            .iter()
            .map(|&(session_id, bus_number, device_address)| MockDevice {
                session_id,
                bus_number,
                device_address,
                descriptor: device_descriptor_bytes(0x1234, 0x5678, 1),
            })
            .collect();
        let backend = MockBackend::new(devices);
        let ctx = Context::with_backend(backend.clone()).expect("context");
        (ctx, backend)
    }

    pub fn placeholder_transfer() -> Transfer {
        let (ctx, _backend) = mock_context(&[(1, 1, 1)]);
        let dev = ctx.devices().unwrap().remove(0);
        let handle = dev.open().unwrap();
        Transfer::bulk(&handle, 0x81, vec![0; 8], Duration::ZERO, |_| {})
    }
}

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{
    transfer::{ControlSetup, Transfer, TransferFlags, TransferStatus},
    ErrorKind,
};
use self::mock::{device_descriptor_bytes, mock_context, MockBackend, MockDevice};

const TICK: Duration = Duration::from_millis(100);

#[test]
fn enumerate_open_close_lifecycle() {
    let (ctx, backend) = mock_context(&[(10, 1, 10), (11, 1, 11)]);

    let list = ctx.devices().unwrap();
    assert_eq!(list.len(), 2);

    let dev = list[0].clone();
    assert_eq!(Arc::strong_count(&dev.inner), 2); // list + local

    let handle = dev.open().unwrap();
    assert_eq!(Arc::strong_count(&dev.inner), 3); // list + local + handle

    drop(list);
    assert_eq!(Arc::strong_count(&dev.inner), 2);
    assert_eq!(backend.destroyed.lock().unwrap().as_slice(), &[11]);

    drop(handle);
    assert_eq!(*backend.closed.lock().unwrap(), 1);
    assert_eq!(Arc::strong_count(&dev.inner), 1);

    drop(dev);
    assert_eq!(backend.destroyed.lock().unwrap().as_slice(), &[11, 10]);
    assert!(ctx.device_by_session_id(10).is_none());
    assert!(ctx.device_by_session_id(11).is_none());
}

#[test]
fn session_ids_deduplicate_rescans() {
    let (ctx, _backend) = mock_context(&[(10, 1, 10), (11, 1, 11)]);
    let first = ctx.devices().unwrap();
    let second = ctx.devices().unwrap();
    for (a, b) in first.iter().zip(&second) {
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}

#[test]
fn sanitize_rejects_out_of_spec_devices() {
    let backend = MockBackend::new(vec![
        MockDevice {
            session_id: 1,
            bus_number: 1,
            device_address: 1,
            descriptor: device_descriptor_bytes(0x1234, 0x5678, 1),
        },
        MockDevice {
            session_id: 2,
            bus_number: 1,
            device_address: 2,
            descriptor: device_descriptor_bytes(0x1234, 0x5678, 0),
        },
        MockDevice {
            session_id: 3,
            bus_number: 1,
            device_address: 3,
            descriptor: device_descriptor_bytes(0x1234, 0x5678, 9),
        },
    ]);
    let ctx = crate::Context::with_backend(backend.clone()).unwrap();

    let list = ctx.devices().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].device_address(), 1);

    // the rejected devices were unpublished and released
    let mut destroyed = backend.destroyed.lock().unwrap().clone();
    destroyed.sort();
    assert_eq!(destroyed, vec![2, 3]);
    assert!(ctx.device_by_session_id(2).is_none());
}

#[test]
fn refs_survive_list_release() {
    let (ctx, _backend) = mock_context(&[(10, 1, 10), (11, 1, 11)]);
    let list = ctx.devices().unwrap();
    let handle = list[0].open().unwrap();
    drop(list);

    assert_eq!(handle.device().bus_number(), 1);
    assert_eq!(handle.device().device_address(), 10);

    let list2 = ctx.devices().unwrap();
    assert!(Arc::ptr_eq(&list2[0].inner, &handle.device().inner));
}

#[test]
fn open_failure_releases_the_device_ref() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let dev = ctx.devices().unwrap().remove(0);
    backend.fail_open.store(true, std::sync::atomic::Ordering::SeqCst);

    let before = Arc::strong_count(&dev.inner);
    let err = dev.open().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Access);
    assert_eq!(Arc::strong_count(&dev.inner), before);
    assert_eq!(*backend.closed.lock().unwrap(), 0);
}

#[test]
fn claimed_interface_bitmap_tracks_backend_acceptance() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    assert_eq!(
        handle.claim_interface(64).unwrap_err().kind(),
        ErrorKind::InvalidParam
    );

    handle.claim_interface(2).unwrap();
    handle.claim_interface(2).unwrap(); // idempotent, no second backend call
    assert_eq!(backend.claims.lock().unwrap().as_slice(), &[2]);

    assert_eq!(
        handle.set_interface_alt_setting(3, 1).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    handle.set_interface_alt_setting(2, 1).unwrap();

    handle.release_interface(2).unwrap();
    assert_eq!(backend.releases.lock().unwrap().as_slice(), &[2]);
    assert_eq!(
        handle.release_interface(2).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    // kernel-driver queries fall through to the backend default
    assert_eq!(
        handle.kernel_driver_active(0).unwrap_err().kind(),
        ErrorKind::NotSupported
    );
    assert_eq!(
        handle.detach_kernel_driver(0).unwrap_err().kind(),
        ErrorKind::NotSupported
    );
}

#[test]
fn timeout_latches_cancels_and_reports_timed_out_once() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let recorded = statuses.clone();
    let t = Transfer::bulk(
        &handle,
        0x81,
        vec![0; 64],
        TICK,
        move |t: &Transfer| {
            recorded.lock().unwrap().push(t.status().unwrap());
        },
    );
    t.submit().unwrap();
    assert!(t.is_in_flight());

    // the deadline bounds the wait: a 500 ms wait wakes after ~100 ms,
    // sweeps, and issues the cancel before returning
    let start = Instant::now();
    ctx.handle_events_timeout(Duration::from_millis(500)).unwrap();
    assert!(start.elapsed() < Duration::from_millis(450));
    assert_eq!(backend.cancels.lock().unwrap().len(), 1);
    assert!(statuses.lock().unwrap().is_empty());

    // the cancellation completes through the event path as a timeout
    ctx.handle_events_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(statuses.lock().unwrap().as_slice(), &[TransferStatus::TimedOut]);
    assert!(!t.is_in_flight());
    assert_eq!(ctx.inner.inflight.lock().unwrap().len(), 0);
}

#[test]
fn sync_cancel_suppresses_the_callback() {
    let (ctx, _backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 8,
    };
    let t = Transfer::control(&handle, setup.buffer_in(), Duration::ZERO, move |_| {
        *counter.lock().unwrap() += 1;
    });
    t.submit().unwrap();

    t.cancel_sync().unwrap();
    assert_eq!(*calls.lock().unwrap(), 0);
    assert!(!t.is_in_flight());
    assert_eq!(t.status(), Some(TransferStatus::Cancelled));
    drop(ctx);
}

#[test]
fn short_transfer_with_short_not_ok_reports_error() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let result = Arc::new(Mutex::new(None));
    let recorded = result.clone();
    let t = Transfer::bulk(&handle, 0x81, vec![0; 512], Duration::ZERO, move |t| {
        *recorded.lock().unwrap() = Some((t.status().unwrap(), t.actual_length()));
    });
    t.set_flags(TransferFlags::SHORT_NOT_OK);
    t.submit().unwrap();

    backend.complete(&t, TransferStatus::Completed, 200);
    ctx.handle_events_timeout(TICK).unwrap();

    assert_eq!(
        *result.lock().unwrap(),
        Some((TransferStatus::Error, 200))
    );
}

#[test]
fn scheduler_keeps_deadlines_ascending_with_infinite_tail() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let mk = |ep: u8, timeout: Duration| {
        Transfer::bulk(&handle, ep, vec![0; 1], timeout, |_| {})
    };
    let t1 = mk(0x81, Duration::from_millis(200));
    let t2 = mk(0x82, Duration::ZERO);
    let t3 = mk(0x83, Duration::from_millis(50));
    t1.submit().unwrap();
    t2.submit().unwrap();
    t3.submit().unwrap();

    let order: Vec<u8> = ctx
        .inner
        .inflight
        .lock()
        .unwrap()
        .iter()
        .map(|t| t.endpoint())
        .collect();
    assert_eq!(order, vec![0x83, 0x81, 0x82]);

    for t in [&t1, &t2, &t3] {
        backend.complete(t, TransferStatus::Completed, 0);
    }
    ctx.handle_events_timeout(TICK).unwrap();
    assert_eq!(ctx.inner.inflight.lock().unwrap().len(), 0);
}

#[test]
fn next_timeout_tracks_the_nearest_deadline() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();
    assert!(ctx.next_timeout().is_none());

    let infinite = Transfer::bulk(&handle, 0x82, vec![0; 1], Duration::ZERO, |_| {});
    infinite.submit().unwrap();
    assert!(ctx.next_timeout().is_none());

    let bounded = Transfer::bulk(&handle, 0x81, vec![0; 1], TICK, |_| {});
    bounded.submit().unwrap();
    let remaining = ctx.next_timeout().unwrap();
    assert!(remaining <= TICK && remaining > Duration::from_millis(10));

    for t in [&infinite, &bounded] {
        backend.complete(t, TransferStatus::Completed, 0);
    }
    ctx.handle_events_timeout(TICK).unwrap();
}

#[test]
fn callback_fires_exactly_once_per_submission() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let count = Arc::new(Mutex::new(0u32));
    let counter = count.clone();
    let t = Transfer::bulk(&handle, 0x81, vec![0; 4], Duration::ZERO, move |_| {
        *counter.lock().unwrap() += 1;
    });

    t.submit().unwrap();
    assert_eq!(t.submit().unwrap_err().kind(), ErrorKind::Busy);
    backend.complete(&t, TransferStatus::Completed, 4);
    ctx.handle_events_timeout(TICK).unwrap();
    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(t.status(), Some(TransferStatus::Completed));

    // the callback is retained across completions, so the transfer can be
    // submitted again
    t.submit().unwrap();
    backend.complete(&t, TransferStatus::Completed, 4);
    ctx.handle_events_timeout(TICK).unwrap();
    assert_eq!(*count.lock().unwrap(), 2);
}

#[test]
fn isochronous_packets_are_tracked_per_submission() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let t = Transfer::isochronous(&handle, 0x81, vec![0; 3 * 64], 3, 64, Duration::ZERO, |_| {});
    assert_eq!(t.num_iso_packets(), 3);
    assert_eq!(t.iso_packet(0).unwrap().length, 64);
    assert!(t.iso_packet(3).is_none());

    t.submit().unwrap();
    backend.complete(&t, TransferStatus::Completed, 192);
    ctx.handle_events_timeout(TICK).unwrap();
    assert_eq!(t.status(), Some(TransferStatus::Completed));
    assert_eq!(t.actual_length(), 192);
}

#[test]
fn control_setup_is_normalized_at_submit() {
    let (ctx, _backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x1234,
        index: 0x5678,
        length: 0x00FF,
    };
    let t = Transfer::control(&handle, setup.buffer_in(), Duration::ZERO, |_| {});
    t.submit().unwrap();
    {
        let st = t.inner.state.lock().unwrap();
        assert_eq!(
            &st.buffer[..8],
            &[0x80, 0x06, 0x34, 0x12, 0x78, 0x56, 0xFF, 0x00]
        );
    }
    t.cancel_sync().unwrap();
}

#[test]
fn failed_submit_unwinds_the_scheduler() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let t = Transfer::bulk(&handle, 0x81, vec![0; 4], Duration::ZERO, |_| {});
    backend
        .fail_submit
        .store(true, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(t.submit().unwrap_err().kind(), ErrorKind::NoDevice);
    assert!(!t.is_in_flight());
    assert_eq!(ctx.inner.inflight.lock().unwrap().len(), 0);

    assert_eq!(t.cancel().unwrap_err().kind(), ErrorKind::NotFound);

    backend
        .fail_submit
        .store(false, std::sync::atomic::Ordering::SeqCst);
    t.submit().unwrap();
    backend.complete(&t, TransferStatus::Completed, 0);
    ctx.handle_events_timeout(TICK).unwrap();
    assert_eq!(t.status(), Some(TransferStatus::Completed));
}

#[test]
fn concurrent_event_loop_drivers_are_rejected() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let (ctx, _backend) = mock_context(&[(10, 1, 10)]);
    let driver = ctx.clone();
    let entered = Arc::new(AtomicBool::new(false));
    let flag = entered.clone();
    let worker = thread::spawn(move || {
        flag.store(true, Ordering::SeqCst);
        driver
            .handle_events_timeout(Duration::from_millis(500))
            .unwrap();
    });
    while !entered.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    thread::sleep(TICK);
    assert_eq!(
        ctx.handle_events_timeout(Duration::ZERO).unwrap_err().kind(),
        ErrorKind::Busy
    );
    worker.join().unwrap();
    ctx.handle_events_timeout(Duration::ZERO).unwrap();
}

#[test]
fn poll_fd_notifiers_mirror_the_watched_set() {
    let (ctx, _backend) = mock_context(&[(10, 1, 10)]);
    let dev = ctx.devices().unwrap().remove(0);

    let adds = Arc::new(Mutex::new(Vec::new()));
    let removes = Arc::new(Mutex::new(Vec::new()));
    let added = adds.clone();
    let removed = removes.clone();
    ctx.set_poll_fd_notifiers(
        Some(Box::new(move |p| added.lock().unwrap().push(p.fd))),
        Some(Box::new(move |fd| removed.lock().unwrap().push(fd))),
    );

    let before = ctx.poll_fds().len();
    let handle = dev.open().unwrap();
    assert_eq!(ctx.poll_fds().len(), before + 1);
    let added_fd = *adds.lock().unwrap().last().unwrap();

    drop(handle);
    assert_eq!(ctx.poll_fds().len(), before);
    assert_eq!(removes.lock().unwrap().as_slice(), &[added_fd]);
}

#[test]
fn max_packet_size_reads_the_active_configuration() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    backend.set_config_descriptor(vec![
        9, 2, 32, 0, 1, 1, 0, 0x80, 50, //
        9, 4, 0, 0, 2, 0xFF, 0, 0, 0, //
        7, 5, 0x81, 2, 0x00, 0x02, 0, //
        7, 5, 0x02, 2, 0x40, 0x00, 0,
    ]);
    let dev = ctx.devices().unwrap().remove(0);
    assert_eq!(dev.max_packet_size(0x81).unwrap(), 512);
    assert_eq!(dev.max_packet_size(0x02).unwrap(), 64);
    assert_eq!(
        dev.max_packet_size(0x99).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn open_device_with_vid_pid_finds_a_match() {
    let backend = MockBackend::new(vec![
        MockDevice {
            session_id: 1,
            bus_number: 1,
            device_address: 1,
            descriptor: device_descriptor_bytes(0x1111, 0x2222, 1),
        },
        MockDevice {
            session_id: 2,
            bus_number: 1,
            device_address: 2,
            descriptor: device_descriptor_bytes(0xAAAA, 0xBBBB, 1),
        },
    ]);
    let ctx = crate::Context::with_backend(backend).unwrap();

    let handle = ctx.open_device_with_vid_pid(0xAAAA, 0xBBBB).unwrap();
    assert_eq!(handle.device().device_address(), 2);
    assert_eq!(handle.device().vendor_id(), 0xAAAA);
    assert_eq!(handle.device().product_id(), 0xBBBB);

    assert_eq!(
        ctx.open_device_with_vid_pid(0xAAAA, 0x0001)
            .unwrap_err()
            .kind(),
        ErrorKind::NotFound
    );
}

#[test]
fn blocking_control_in_fills_the_callers_buffer() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let completer = {
        let backend = backend.clone();
        thread::spawn(move || loop {
            let last = backend.submitted.lock().unwrap().last().cloned();
            if let Some(t) = last {
                backend.complete_with_data(
                    &t,
                    TransferStatus::Completed,
                    &[0xDE, 0xAD, 0xBE, 0xEF],
                );
                break;
            }
            thread::sleep(Duration::from_millis(1));
        })
    };

    let setup = ControlSetup {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 0,
    };
    let mut data = [0u8; 16];
    let n = handle
        .control_transfer(setup, &mut data, Duration::ZERO)
        .unwrap();
    completer.join().unwrap();

    assert_eq!(n, 4);
    assert_eq!(&data[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
}

#[test]
fn blocking_bulk_out_sends_the_callers_buffer() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let completer = {
        let backend = backend.clone();
        thread::spawn(move || loop {
            let last = backend.submitted.lock().unwrap().last().cloned();
            if let Some(t) = last {
                backend.complete(&t, TransferStatus::Completed, 5);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        })
    };

    let mut data = [1u8, 2, 3, 4, 5];
    let n = handle
        .bulk_transfer(0x02, &mut data, Duration::ZERO)
        .unwrap();
    completer.join().unwrap();
    assert_eq!(n, 5);

    let sent = backend.submitted.lock().unwrap().last().cloned().unwrap();
    assert_eq!(&*sent.buffer(), &[1, 2, 3, 4, 5]);
}

#[test]
fn blocking_transfer_maps_timeout_status() {
    let (ctx, backend) = mock_context(&[(10, 1, 10)]);
    let handle = ctx.devices().unwrap().remove(0).open().unwrap();

    let mut data = [0u8; 8];
    let err = handle
        .bulk_transfer(0x81, &mut data, Duration::from_millis(50))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(backend.cancels.lock().unwrap().len(), 1);
}
