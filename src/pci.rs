//! Linux userspace PCIe transport: maps BAR 0 from sysfs, enables bus
//! mastering and hands the device to [`Controller::bind`].
//!
//! sysfs offers no interrupt delivery, so the [`PolledTransport`] reports
//! legacy mode and services completions by polling at the reset cadence.

use crate::controller::{Controller, InterruptMode, Transport};
use crate::error::Error;
use crate::huge_pages::HugePageAllocator;
use crate::regs::BarRegion;
use core::ptr;
use std::boxed::Box;
use std::format;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::prelude::AsRawFd;
use std::string::ToString;
use std::time::Duration;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

// write to the command register (offset 4) in the PCIe config space
const COMMAND_REGISTER_OFFSET: u64 = 4;
// bit 2: "bus master enable", see PCIe 3.0 specification section 7.5.1.1
const BUS_MASTER_ENABLE_BIT: u64 = 2;
// bit 10: "interrupt disable"
const INTERRUPT_DISABLE: u64 = 10;

/// Transport standing in for real interrupt delivery: every wait "fires"
/// after one poll interval, and the phase-gated reaper treats an idle
/// completion ring as a spurious interrupt.
pub struct PolledTransport;

impl Transport for PolledTransport {
    fn interrupt_mode(&self) -> InterruptMode {
        InterruptMode::Legacy
    }

    fn wait_for_interrupt(&mut self) -> Result<(), Error> {
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn ack_interrupt(&mut self) {}

    fn delay_ms(&mut self, milliseconds: u32) {
        std::thread::sleep(Duration::from_millis(milliseconds as u64));
    }
}

pub(crate) fn probe(
    pci_address: &str,
) -> Result<Controller<HugePageAllocator, BarRegion, PolledTransport>, Error> {
    let mut config_file = open_resource_readonly(pci_address, "config").map_err(Error::Pci)?;
    let class_id = read_io32(&mut config_file, 8).map_err(|error| Error::Pci(Box::new(error)))? >> 16;

    // 0x01 -> mass storage device class id
    // 0x08 -> nvme subclass
    if class_id != 0x0108 {
        return Err(Error::NotABlockDevice(pci_address.to_string()));
    }

    let (address, length) = mmap_resource(pci_address).map_err(Error::Pci)?;
    let bar = unsafe { BarRegion::new(address, length) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    Controller::bind(bar, PolledTransport, HugePageAllocator, page_size)
}

/// Unbinds the kernel driver from the device at `pci_address`.
fn unbind_driver(pci_address: &str) -> Result<(), Box<dyn core::error::Error>> {
    let path = format!("/sys/bus/pci/devices/{pci_address}/driver/unbind");

    match fs::OpenOptions::new().write(true).open(path) {
        Ok(mut f) => {
            write!(f, "{pci_address}")?;
            Ok(())
        }
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}

/// Enables bus mastering for the device at `pci_address`.
fn enable_bus_mastering(pci_address: &str) -> Result<(), Box<dyn core::error::Error>> {
    let path = format!("/sys/bus/pci/devices/{pci_address}/config");
    let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;

    let mut command = read_io16(&mut file, COMMAND_REGISTER_OFFSET)?;
    command |= 1 << BUS_MASTER_ENABLE_BIT;
    write_io16(&mut file, command, COMMAND_REGISTER_OFFSET)?;

    Ok(())
}

/// Disables INTx interrupts for the device at `pci_address`; nothing would
/// service them.
fn disable_intx(pci_address: &str) -> Result<(), Box<dyn core::error::Error>> {
    let path = format!("/sys/bus/pci/devices/{pci_address}/config");
    let mut file = fs::OpenOptions::new().read(true).write(true).open(path)?;

    let mut command = read_io16(&mut file, COMMAND_REGISTER_OFFSET)?;
    command |= 1 << INTERRUPT_DISABLE;
    write_io16(&mut file, command, COMMAND_REGISTER_OFFSET)?;

    Ok(())
}

/// Mmaps BAR 0 of the device and returns the mapping and its length.
fn mmap_resource(pci_address: &str) -> Result<(*mut u8, usize), Box<dyn core::error::Error>> {
    let path = format!("/sys/bus/pci/devices/{pci_address}/resource0");

    unbind_driver(pci_address)?;
    enable_bus_mastering(pci_address)?;
    disable_intx(pci_address)?;

    let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
    let len = fs::metadata(&path)?.len() as usize;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        ) as *mut u8
    };

    if ptr == libc::MAP_FAILED as *mut u8 || ptr.is_null() || len == 0 {
        Err("pci mapping failed".into())
    } else {
        Ok((ptr, len))
    }
}

/// Opens a pci resource file at the given address in read-only mode.
fn open_resource_readonly(
    pci_address: &str,
    resource: &str,
) -> Result<File, Box<dyn core::error::Error>> {
    let path = format!("/sys/bus/pci/devices/{pci_address}/{resource}");
    Ok(OpenOptions::new().read(true).write(false).open(path)?)
}

/// Reads and returns an u16 at `offset` in `file`.
fn read_io16(file: &mut File, offset: u64) -> Result<u16, io::Error> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_u16::<NativeEndian>()
}

/// Reads and returns an u32 at `offset` in `file`.
fn read_io32(file: &mut File, offset: u64) -> Result<u32, io::Error> {
    file.seek(SeekFrom::Start(offset))?;
    file.read_u32::<NativeEndian>()
}

/// Writes an u16 at `offset` in `file`.
fn write_io16(file: &mut File, value: u16, offset: u64) -> Result<(), io::Error> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_u16::<NativeEndian>(value)
}
