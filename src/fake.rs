//! A software NVMe controller for tests.
//!
//! Implements the register file over shared state, executes admin
//! submissions straight out of the ring when the doorbell rings, writes
//! phase-tagged completions into the completion ring and latches a fake
//! interrupt for the transport to deliver. Physical addresses are the
//! virtual ones, courtesy of [`TestAllocator`].

use crate::cmd::{
    Completion, GenericStatus, IdentifyCns, IdentifyController, IdentifyNamespace, LbaFormat,
    Submission, IDENTIFY_OPCODE,
};
use crate::controller::{InterruptMode, Transport};
use crate::dma::Allocator;
use crate::error::Error;
use crate::regs::{Mmio, REG_ACQ, REG_AQA, REG_ASQ, REG_CAP, REG_CC, REG_CSTS, REG_DOORBELL_BASE, REG_INTMC, REG_INTMS, REG_VS};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

pub(crate) const SERIAL_NUMBER: &str = "12345678";
pub(crate) const MODEL_NUMBER: &str = "PL4T-1234";
pub(crate) const FIRMWARE_REVISION: &str = "7.4.2.1";

/// Identity-mapped DMA allocator over the global heap.
#[derive(Debug, Default, Clone)]
pub(crate) struct TestAllocator;

impl Allocator for TestAllocator {
    fn allocate(
        &self,
        layout: core::alloc::Layout,
    ) -> Result<*mut u8, Box<dyn core::error::Error>> {
        let pointer = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if pointer.is_null() {
            return Err("the test allocator is out of memory".into());
        }
        Ok(pointer)
    }

    fn deallocate(
        &self,
        address: *mut u8,
        layout: core::alloc::Layout,
    ) -> Result<(), Box<dyn core::error::Error>> {
        unsafe { alloc::alloc::dealloc(address, layout) };
        Ok(())
    }

    fn translate_virtual_to_physical(
        &self,
        virtual_address: *const u8,
    ) -> Result<u64, Box<dyn core::error::Error>> {
        Ok(virtual_address as u64)
    }
}

/// Capability knobs of the emulated controller. The defaults advertise a
/// minimal device: 4 KiB pages only, 1 s ready timeout, NVM command set,
/// contiguous queues required, 65536 queue entries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FakeControllerConfig {
    pub memory_page_size_min_log2: u8,
    pub memory_page_size_max_log2: u8,
    pub timeout_500ms_units: u8,
    pub max_queue_entries_raw: u16,
    pub doorbell_stride: u8,
}

impl Default for FakeControllerConfig {
    fn default() -> Self {
        Self {
            memory_page_size_min_log2: 12,
            memory_page_size_max_log2: 12,
            timeout_500ms_units: 2,
            max_queue_entries_raw: 65535,
            doorbell_stride: 0,
        }
    }
}

impl FakeControllerConfig {
    fn raw_capabilities(&self) -> u64 {
        self.max_queue_entries_raw as u64
            | 1 << 16 // CQR
            | (self.timeout_500ms_units as u64) << 24
            | (self.doorbell_stride as u64) << 32
            | 1 << 37 // CSS: NVM
            | ((self.memory_page_size_min_log2 - 12) as u64) << 48
            | ((self.memory_page_size_max_log2 - 12) as u64) << 52
    }
}

/// One emulated namespace.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FakeNamespace {
    pub block_count: u64,
    pub block_size_log2: u8,
    pub metadata_size: u16,
}

impl Default for FakeNamespace {
    fn default() -> Self {
        Self {
            block_count: 1024,
            block_size_log2: 9,
            metadata_size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AdminQueues {
    sq_entries: u16,
    cq_entries: u16,
    /// Next submission to execute.
    sq_consumed: u16,
    /// Next completion slot to fill.
    cq_produced: u16,
    cq_phase: u16,
}

#[derive(Debug)]
struct FakeState {
    caps: u64,
    vs: u32,
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    interrupt_mask: u32,
    doorbell_stride: u8,
    enable_transitions: u32,
    admin: Option<AdminQueues>,
    io_completion_queue: Option<(u64, u16)>,
    io_submission_queue: Option<(u64, u16)>,
    namespaces: BTreeMap<u32, FakeNamespace>,
    irq_pending: bool,
}

impl FakeState {
    fn handle_config_write(&mut self, value: u32) {
        let was_enabled = self.cc & 1 == 1;
        let enabled = value & 1 == 1;
        self.cc = value;
        if enabled && !was_enabled {
            self.enable_transitions += 1;
            self.admin = Some(AdminQueues {
                sq_entries: (self.aqa & 0xFFF) as u16 + 1,
                cq_entries: ((self.aqa >> 16) & 0xFFF) as u16 + 1,
                sq_consumed: 0,
                cq_produced: 0,
                cq_phase: 1,
            });
            self.csts |= 1;
        } else if !enabled {
            self.csts &= !1;
        }
    }

    fn handle_doorbell_write(&mut self, offset: usize, value: u32) {
        let index = (offset - REG_DOORBELL_BASE) / (4 << self.doorbell_stride);
        let queue_id = index / 2;
        let is_completion = index % 2 == 1;
        if queue_id == 0 && !is_completion {
            self.execute_admin_submissions(value as u16);
        }
        // Completion head updates and I/O doorbells need no reaction; no
        // test submits through the I/O queue yet.
    }

    fn execute_admin_submissions(&mut self, tail: u16) {
        let Some(mut admin) = self.admin else { return };
        while admin.sq_consumed != tail {
            let entry_address = self.asq + admin.sq_consumed as u64 * 64;
            let submission: Submission =
                unsafe { (entry_address as *const Submission).read_volatile() };
            admin.sq_consumed = (admin.sq_consumed + 1) % admin.sq_entries;

            let status_code = self.execute_admin_command(&submission);
            let completion = Completion {
                command_specific: 0,
                _reserved: 0,
                sq_head: admin.sq_consumed,
                sq_id: 0,
                command_id: submission.command_id,
                status: admin.cq_phase | (status_code as u16) << 1,
            };
            let slot_address = self.acq + admin.cq_produced as u64 * 16;
            unsafe { (slot_address as *mut Completion).write_volatile(completion) };
            admin.cq_produced = (admin.cq_produced + 1) % admin.cq_entries;
            if admin.cq_produced == 0 {
                admin.cq_phase ^= 1;
            }
            self.irq_pending = true;
        }
        self.admin = Some(admin);
    }

    fn execute_admin_command(&mut self, submission: &Submission) -> GenericStatus {
        match submission.opcode {
            IDENTIFY_OPCODE => self.execute_identify(submission),
            // Create I/O submission queue
            1 => {
                let size = (submission.cdw10 >> 16) as u16;
                self.io_submission_queue = Some((submission.data_pointer[0], size));
                GenericStatus::Success
            }
            // Create I/O completion queue
            5 => {
                let size = (submission.cdw10 >> 16) as u16;
                self.io_completion_queue = Some((submission.data_pointer[0], size));
                GenericStatus::Success
            }
            // Delete I/O submission queue
            0 => {
                self.io_submission_queue = None;
                GenericStatus::Success
            }
            // Delete I/O completion queue
            4 => {
                self.io_completion_queue = None;
                GenericStatus::Success
            }
            _ => GenericStatus::InvalidOpcode,
        }
    }

    fn execute_identify(&mut self, submission: &Submission) -> GenericStatus {
        let destination = submission.data_pointer[0];
        match submission.cdw10 & 0xFF {
            cns if cns == IdentifyCns::Controller as u32 => {
                let mut identify: IdentifyController = unsafe { core::mem::zeroed() };
                write_padded(&mut identify.serial_number, SERIAL_NUMBER);
                write_padded(&mut identify.model_number, MODEL_NUMBER);
                write_padded(&mut identify.firmware_revision, FIRMWARE_REVISION);
                identify.sqes = core::mem::size_of::<Submission>().trailing_zeros() as u8;
                identify.cqes = core::mem::size_of::<Completion>().trailing_zeros() as u8;
                identify.num_namespaces = self.namespaces.len() as u32;
                identify.max_data_transfer = 0;
                unsafe { (destination as *mut IdentifyController).write_volatile(identify) };
                GenericStatus::Success
            }
            cns if cns == IdentifyCns::ActiveNamespaceList as u32 => {
                let list = destination as *mut u32;
                unsafe { core::ptr::write_bytes(list, 0, 1024) };
                for (index, &id) in self.namespaces.keys().enumerate().take(1024) {
                    unsafe { list.add(index).write_volatile(id) };
                }
                GenericStatus::Success
            }
            cns if cns == IdentifyCns::Namespace as u32 => {
                let Some(namespace) = self.namespaces.get(&submission.namespace_id) else {
                    return GenericStatus::InvalidNamespaceOrFormat;
                };
                let mut identify: IdentifyNamespace = unsafe { core::mem::zeroed() };
                identify.namespace_size = namespace.block_count;
                identify.namespace_capacity = namespace.block_count;
                identify.number_of_lba_formats = 0;
                identify.formatted_lba_size = 0;
                identify.lba_formats[0] = LbaFormat::from_raw(
                    (namespace.block_size_log2 as u32) << 16 | namespace.metadata_size as u32,
                );
                unsafe { (destination as *mut IdentifyNamespace).write_volatile(identify) };
                GenericStatus::Success
            }
            _ => GenericStatus::InvalidField,
        }
    }
}

fn write_padded(destination: &mut [u8], value: &str) {
    destination.fill(b' ');
    destination[..value.len()].copy_from_slice(value.as_bytes());
}

/// The emulated controller. Hand its [`FakeNvme::mmio`] and
/// [`FakeNvme::transport`] views to [`Controller::bind`].
///
/// [`Controller::bind`]: crate::controller::Controller::bind
#[derive(Clone)]
pub(crate) struct FakeNvme {
    state: Arc<Mutex<FakeState>>,
}

impl Default for FakeNvme {
    fn default() -> Self {
        Self::new(FakeControllerConfig::default())
    }
}

impl FakeNvme {
    pub(crate) fn new(config: FakeControllerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                caps: config.raw_capabilities(),
                vs: 0x0001_0400, // 1.4.0
                cc: 0,
                csts: 0,
                aqa: 0,
                asq: 0,
                acq: 0,
                interrupt_mask: 0,
                doorbell_stride: config.doorbell_stride,
                enable_transitions: 0,
                admin: None,
                io_completion_queue: None,
                io_submission_queue: None,
                namespaces: BTreeMap::new(),
                irq_pending: false,
            })),
        }
    }

    pub(crate) fn mmio(&self) -> FakeMmio {
        FakeMmio {
            state: self.state.clone(),
        }
    }

    pub(crate) fn transport(&self) -> FakeTransport {
        FakeTransport {
            state: self.state.clone(),
        }
    }

    pub(crate) fn add_namespace(&self, id: u32, namespace: FakeNamespace) {
        self.state.lock().namespaces.insert(id, namespace);
    }

    /// How often CC.EN transitioned from 0 to 1.
    pub(crate) fn enable_transitions(&self) -> u32 {
        self.state.lock().enable_transitions
    }

    /// Pretends the controller was left running by firmware.
    pub(crate) fn force_ready(&self) {
        self.state.lock().csts |= 1;
    }

    pub(crate) fn io_queues_registered(&self) -> bool {
        let state = self.state.lock();
        state.io_completion_queue.is_some() && state.io_submission_queue.is_some()
    }

    /// The legacy interrupt mask, as toggled through INTMS/INTMC.
    pub(crate) fn interrupts_masked(&self) -> bool {
        self.state.lock().interrupt_mask != 0
    }
}

#[derive(Clone)]
pub(crate) struct FakeMmio {
    state: Arc<Mutex<FakeState>>,
}

impl Mmio for FakeMmio {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.state.lock();
        match offset {
            REG_VS => state.vs,
            REG_CC => state.cc,
            REG_CSTS => state.csts,
            REG_AQA => state.aqa,
            _ => panic!("32-bit read from unsupported register {offset:#X}"),
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        if offset >= REG_DOORBELL_BASE {
            state.handle_doorbell_write(offset, value);
            return;
        }
        match offset {
            REG_INTMS => state.interrupt_mask |= value,
            REG_INTMC => state.interrupt_mask &= !value,
            REG_CC => state.handle_config_write(value),
            REG_AQA => state.aqa = value,
            _ => panic!("32-bit write to unsupported register {offset:#X}"),
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        let state = self.state.lock();
        match offset {
            REG_CAP => state.caps,
            REG_ASQ => state.asq,
            REG_ACQ => state.acq,
            _ => panic!("64-bit read from unsupported register {offset:#X}"),
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        let mut state = self.state.lock();
        match offset {
            REG_ASQ => state.asq = value,
            REG_ACQ => state.acq = value,
            _ => panic!("64-bit write to unsupported register {offset:#X}"),
        }
    }
}

pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl Transport for FakeTransport {
    fn interrupt_mode(&self) -> InterruptMode {
        InterruptMode::Legacy
    }

    fn wait_for_interrupt(&mut self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.irq_pending {
            state.irq_pending = false;
            Ok(())
        } else {
            Err(Error::InterruptWait(
                "the fake controller has no interrupt pending".into(),
            ))
        }
    }

    fn ack_interrupt(&mut self) {}

    fn delay_ms(&mut self, _milliseconds: u32) {}
}
