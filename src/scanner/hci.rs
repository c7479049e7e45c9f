//! Raw HCI socket backend.
//!
//! Scans for BLE advertisements over raw Linux HCI sockets without the BlueZ
//! daemon. Requires CAP_NET_RAW and CAP_NET_ADMIN or root.

use super::{ADVERTISEMENT_CHANNEL_BUFFER_SIZE, AdvertisementResult, ScanError};
use crate::advertisement::{Advertisement, ManufacturerData};
use crate::mac_address::MacAddress;
use libc::{
    AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t,
};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::{debug, warn};

const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;
const HCI_DEV_ID: u16 = 0;

const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;
/// Scan interval and window, in 0.625 ms units (10 ms).
const SCAN_TIMING: u16 = 0x0010;

const AD_TYPE_SHORT_NAME: u8 = 0x08;
const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Largest HCI event: 3 header bytes plus 255 parameter bytes.
const MAX_EVENT_SIZE: usize = 258;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Filter passing only LE meta events.
    fn le_meta_events() -> Self {
        let mut filter = Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        };
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        let bit = usize::from(EVT_LE_META_EVENT);
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

fn os_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{context}: {}", io::Error::last_os_error()))
}

/// A raw HCI socket bound to one controller.
struct HciSocket(OwnedFd);

impl HciSocket {
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // SOCK_NONBLOCK is required for AsyncFd
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(os_error("failed to create HCI socket"));
        }
        let socket = Self(unsafe { OwnedFd::from_raw_fd(fd) });

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.0.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("failed to bind HCI socket"));
        }
        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.0.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("failed to set HCI filter"));
        }
        Ok(())
    }

    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = command_packet(OGF_LE_CTL, ocf, params);
        let ret = unsafe {
            libc::write(
                self.0.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("failed to send HCI command"));
        }
        Ok(())
    }

    /// Passive scan, duplicates not filtered so repeated advertisements keep arriving.
    fn start_le_scan(&self) -> Result<(), ScanError> {
        let [lo, hi] = SCAN_TIMING.to_le_bytes();
        self.send_command(
            OCF_LE_SET_SCAN_PARAMETERS,
            &[
                LE_SCAN_PASSIVE,
                lo,
                hi,
                lo,
                hi,
                LE_PUBLIC_ADDRESS,
                FILTER_POLICY_ACCEPT_ALL,
            ],
        )?;
        self.set_scan_enable(true)
    }

    fn set_scan_enable(&self, enable: bool) -> Result<(), ScanError> {
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
    }
}

fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Parse an HCI LE advertising report event into advertisements.
///
/// Layout after the 4-byte event header (packet type, event code, length,
/// subevent): report count, then per report: event type, address type,
/// address (6, little-endian), data length, AD data, RSSI (i8).
fn parse_advertising_report(event: &[u8]) -> Vec<Advertisement> {
    let mut out = Vec::new();
    if event.len() < 5
        || event[0] != HCI_EVENT_PKT
        || event[1] != EVT_LE_META_EVENT
        || event[3] != EVT_LE_ADVERTISING_REPORT
    {
        return out;
    }

    let count = usize::from(event[4]);
    let mut rest = &event[5..];
    for _ in 0..count {
        // event type, address type, address, data length
        if rest.len() < 9 {
            break;
        }
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&rest[2..8]);
        addr.reverse();

        let data_len = usize::from(rest[8]);
        let Some(ad_data) = rest.get(9..9 + data_len) else {
            break;
        };
        let Some(&rssi) = rest.get(9 + data_len) else {
            break;
        };

        let (name, manufacturer_data) = parse_ad_structures(ad_data);
        out.push(Advertisement {
            address: MacAddress(addr),
            name,
            rssi: i16::from(rssi as i8),
            manufacturer_data,
        });
        rest = &rest[10 + data_len..];
    }
    out
}

/// Extract the local name and manufacturer data from AD structures.
fn parse_ad_structures(mut data: &[u8]) -> (Option<String>, ManufacturerData) {
    let mut name = None;
    let mut manufacturer_data = ManufacturerData::new();

    while let [len, rest @ ..] = data {
        let len = usize::from(*len);
        if len == 0 || rest.len() < len {
            break;
        }
        let (ad_type, payload) = (rest[0], &rest[1..len]);

        match ad_type {
            AD_TYPE_COMPLETE_NAME => name = Some(String::from_utf8_lossy(payload).into_owned()),
            AD_TYPE_SHORT_NAME if name.is_none() => {
                name = Some(String::from_utf8_lossy(payload).into_owned())
            }
            AD_TYPE_MANUFACTURER_DATA if payload.len() >= 2 => {
                let company_id = u16::from_le_bytes([payload[0], payload[1]]);
                manufacturer_data.insert(company_id, payload[2..].to_vec());
            }
            _ => {}
        }
        data = &rest[len..];
    }

    (name, manufacturer_data)
}

/// Start scanning over raw HCI sockets on `hci0`.
///
/// Scanning is disabled again when the returned receiver is dropped.
pub async fn start_scan() -> Result<mpsc::Receiver<AdvertisementResult>, ScanError> {
    let events = HciSocket::open(HCI_DEV_ID)?;
    events.set_filter(&HciFilter::le_meta_events())?;

    // Commands go through their own socket so reads only ever see events.
    let commands = HciSocket::open(HCI_DEV_ID)?;
    commands.start_le_scan()?;

    let async_fd = AsyncFd::new(events.0)
        .map_err(|e| ScanError::Bluetooth(format!("failed to create async fd: {e}")))?;
    let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

    tokio::spawn(
        async move {
            if let Err(e) = read_events(&async_fd, &tx).await {
                warn!(error = %e, "HCI event loop failed");
                let _ = tx.send(Err(e)).await;
            }
            if let Err(e) = commands.set_scan_enable(false) {
                debug!(error = %e, "failed to disable LE scan");
            }
        }
        .with_current_subscriber(),
    );

    Ok(rx)
}

/// Forward advertisements until the receiver closes or the socket fails.
///
/// A closed receiver is noticed even while the socket stays silent.
async fn read_events(
    async_fd: &AsyncFd<OwnedFd>,
    tx: &mpsc::Sender<AdvertisementResult>,
) -> Result<(), ScanError> {
    let mut buf = [0u8; MAX_EVENT_SIZE];

    loop {
        let mut guard = tokio::select! {
            _ = tx.closed() => {
                debug!("advertisement receiver closed, stopping HCI scan");
                return Ok(());
            }
            ready = async_fd.readable() => ready
                .map_err(|e| ScanError::Bluetooth(format!("HCI socket not readable: {e}")))?,
        };

        let read = guard.try_io(|inner| {
            let ret = unsafe {
                libc::read(
                    inner.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(ret as usize)
            }
        });

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(ScanError::Bluetooth(format!("HCI read failed: {e}"))),
            // WouldBlock: readiness was cleared, wait again
            Err(_) => continue,
        };

        for advertisement in parse_advertising_report(&buf[..n]) {
            if tx.send(Ok(advertisement)).await.is_err() {
                debug!("advertisement receiver closed, stopping HCI scan");
                return Ok(());
            }
        }
    }
}
