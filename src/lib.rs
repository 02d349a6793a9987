//! An NVMe host-controller driver core.
//!
//! The crate sits between a generic block interface and an NVM Express
//! controller reached over PCIe: it drives the controller through reset and
//! configuration, meters commands through DMA-resident submission and
//! completion rings, reaps completions when the interrupt fires and
//! presents each active namespace as a block device.
//!
//! The PCIe transport, the DMA domain and interrupt delivery are consumed
//! as capabilities: an [`Mmio`] view of BAR 0, an [`Allocator`] for
//! device-visible memory and a [`Transport`] for the granted interrupt.
//! With the `std` feature, [`new_from_pci`] wires those up for a Linux
//! userspace process from sysfs and huge pages.
#![cfg_attr(not(test), no_std)]

mod cmd;
mod controller;
mod dma;
mod error;
#[cfg(test)]
mod fake;
#[cfg(feature = "std")]
mod huge_pages;
mod namespace;
#[cfg(feature = "std")]
mod pci;
mod queue;
mod queue_pair;
mod regs;

extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub use cmd::{
    Completion, GenericStatus, IdentifyActiveNamespaces, IdentifyCns, IdentifyController,
    IdentifyNamespace, LbaFormat, PowerStateDescriptor, RelativePerformance, StatusCodeType,
    Submission, IDENTIFY_OPCODE,
};
pub use controller::{Controller, ControllerInformation, InterruptMode, Transport};
pub use dma::{Allocator, Dma};
pub use error::Error;
pub use namespace::{BlockFlags, BlockInfo, BlockOp, Namespace};
pub use queue_pair::{
    oneshot, Completer, CompletionReceiver, PinnedPages, QueuePair, SubmitError, SubmitErrorKind,
};
pub use regs::{
    ArbitrationMechanism, BarRegion, Capabilities, CommandSet, CommandSetSupport, ControllerConfig,
    ControllerStatus, Doorbell, Mmio, Registers, Version,
};

#[cfg(feature = "std")]
pub use huge_pages::{HugePageAllocator, HUGE_PAGE_SIZE};
#[cfg(feature = "std")]
pub use pci::PolledTransport;

/// Binds to the NVMe device at `pci_address`, mapping BAR 0 from sysfs and
/// backing DMA memory with huge pages. Interrupt delivery is not available
/// through sysfs, so completions are serviced by polling.
#[cfg(feature = "std")]
pub fn new_from_pci(
    pci_address: &str,
) -> Result<Controller<HugePageAllocator, BarRegion, PolledTransport>, Error> {
    pci::probe(pci_address)
}
