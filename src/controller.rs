use crate::cmd::{
    Completion, IdentifyActiveNamespaces, IdentifyController, Submission,
};
use crate::dma::{Allocator, Dma};
use crate::error::Error;
use crate::namespace::Namespace;
use crate::queue_pair::{oneshot, PinnedPages, QueuePair};
use crate::regs::{
    ArbitrationMechanism, Capabilities, CommandSet, CommandSetSupport, ControllerConfig, Mmio,
    Registers, Version,
};
use ahash::RandomState;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use log::{debug, info, warn};

// c.f. NVMe Base Specification 2.0, section 3.1.3.8 "AQA - Admin Queue Attributes"
const ADMIN_QUEUE_MAX_ENTRIES: usize = 4096;
const IO_QUEUE_ID: u16 = 1;
const RESET_POLL_INTERVAL_MS: u32 = 1;

/// How interrupt delivery was granted when the transport configured it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    MsiX,
    Legacy,
}

/// The services the PCIe transport keeps supplying after bind: the granted
/// interrupt mode, delivery of the mapped interrupt, and timing for the
/// bring-up polls.
pub trait Transport: Send {
    fn interrupt_mode(&self) -> InterruptMode;
    /// Blocks until the controller raises its interrupt.
    fn wait_for_interrupt(&mut self) -> Result<(), Error>;
    /// Re-arms the interrupt at the transport end.
    fn ack_interrupt(&mut self);
    fn delay_ms(&mut self, milliseconds: u32);
}

/// Identity and limits of the controller, captured once during `init`.
#[derive(Debug, Clone)]
pub struct ControllerInformation {
    pub serial_number: String,
    pub model_number: String,
    pub firmware_revision: String,
    pub number_of_namespaces: u32,
    /// In bytes; 0 means the controller reported no limit.
    pub maximum_data_transfer_size: u32,
    pub version: Version,
    pub minimum_memory_page_size: u64,
    pub maximum_memory_page_size: u64,
    pub maximum_queue_entries: u32,
}

/// An NVMe controller behind a mapped BAR.
///
/// `bind` snapshots the capability and version registers and validates the
/// host page size against them; `init` then drives the reset, configures
/// and registers the queue pairs, identifies the controller and attaches a
/// [`Namespace`] per active namespace ID.
pub struct Controller<A: Allocator, M: Mmio, T: Transport> {
    registers: Arc<Registers<M>>,
    allocator: Arc<A>,
    transport: T,
    capabilities: Capabilities,
    version: Version,
    page_size: usize,
    admin_queue: Option<QueuePair<A, M>>,
    io_queue: Option<QueuePair<A, M>>,
    io_queue_registered: bool,
    namespaces: HashMap<u32, Namespace, RandomState>,
    information: Option<ControllerInformation>,
    maximum_data_transfer_size: u32,
}

impl<A: Allocator, M: Mmio, T: Transport> Controller<A, M, T> {
    pub fn bind(mmio: M, transport: T, allocator: A, page_size: usize) -> Result<Self, Error> {
        let registers = Arc::new(Registers::new(mmio));
        let capabilities = registers.capabilities();
        let version = registers.version();

        if !page_size.is_power_of_two() {
            return Err(Error::PageSizeNotAPowerOfTwo(page_size));
        }
        // MQES is zero-based, so a converted value of 1 means the raw field
        // was invalidly zero.
        if capabilities.max_queue_entries() == 1 {
            return Err(Error::MaximumQueueEntriesInvalidlyZero);
        }
        if !capabilities.command_sets().contains(CommandSetSupport::NVM) {
            return Err(Error::NvmCommandSetNotSupported);
        }
        let minimum = capabilities.memory_page_size_min_bytes();
        let maximum = capabilities.memory_page_size_max_bytes();
        if (page_size as u64) < minimum || (page_size as u64) > maximum {
            return Err(Error::PageSizeOutsideControllerWindow(
                page_size, minimum, maximum,
            ));
        }

        let controller = Self {
            registers,
            allocator: Arc::new(allocator),
            transport,
            capabilities,
            version,
            page_size,
            admin_queue: None,
            io_queue: None,
            io_queue_registered: false,
            namespaces: HashMap::with_hasher(RandomState::with_seeds(0, 0, 0, 0)),
            information: None,
            maximum_data_transfer_size: 0,
        };
        controller.log_capabilities();
        Ok(controller)
    }

    /// Drives reset, configuration, identification and namespace
    /// enumeration. Per-namespace failures are logged and skipped; every
    /// other failure is fatal to initialization.
    pub fn init(&mut self) -> Result<(), Error> {
        self.reset_and_prepare_queues()?;
        self.poll_ready_state(true)?;
        self.identify_controller()?;
        self.register_io_queue()?;
        self.enumerate_namespaces()?;
        Ok(())
    }

    fn log_capabilities(&self) {
        let caps = &self.capabilities;
        info!("NVMe version {}", self.version);
        debug!(
            "memory page size window: [{:#X}, {:#X}]",
            caps.memory_page_size_min_bytes(),
            caps.memory_page_size_max_bytes()
        );
        debug!("maximum queue entries: {}", caps.max_queue_entries());
        debug!("doorbell stride: {} bytes", 4usize << caps.doorbell_stride());
        debug!("ready timeout: {} ms", caps.timeout_ms());
        debug!(
            "contiguous queues required: {}",
            caps.contiguous_queues_required()
        );
        debug!(
            "NVM subsystem reset supported: {}",
            caps.subsystem_reset_supported()
        );
        debug!("command sets: {:?}", caps.command_sets());
    }

    /// Disables the controller if it is live, then sets up both queue
    /// pairs, points the admin registers at the admin rings and re-enables
    /// the controller.
    fn reset_and_prepare_queues(&mut self) -> Result<(), Error> {
        if self.registers.controller_status().ready() {
            debug!("controller is already active, resetting it");
            let config = self.registers.controller_config().set_enabled(false);
            self.registers.set_controller_config(config);
            self.poll_ready_state(false)?;
        }

        debug!("configuring admin and I/O queue pairs");
        let admin_queue = QueuePair::create(
            self.allocator.clone(),
            self.registers.clone(),
            0,
            ADMIN_QUEUE_MAX_ENTRIES,
            &self.capabilities,
            self.page_size,
        )?;
        let io_queue = match QueuePair::create(
            self.allocator.clone(),
            self.registers.clone(),
            IO_QUEUE_ID,
            self.capabilities.max_queue_entries() as usize,
            &self.capabilities,
            self.page_size,
        ) {
            Ok(queue) => queue,
            Err(error) => {
                let _ = admin_queue.free();
                return Err(error);
            }
        };

        self.registers.set_admin_queue_attributes(
            admin_queue.submission_entry_count() as u32,
            admin_queue.completion_entry_count() as u32,
        );
        self.registers
            .set_admin_submission_queue_address(admin_queue.submission_address());
        self.registers
            .set_admin_completion_queue_address(admin_queue.completion_address());
        self.admin_queue = Some(admin_queue);
        self.io_queue = Some(io_queue);

        debug!("enabling the controller");
        let config = ControllerConfig::default()
            .set_io_completion_queue_entry_size_log2(
                core::mem::size_of::<Completion>().trailing_zeros(),
            )
            .set_io_submission_queue_entry_size_log2(
                core::mem::size_of::<Submission>().trailing_zeros(),
            )
            .set_arbitration_mechanism(ArbitrationMechanism::RoundRobin)
            .set_memory_page_size_log2(self.page_size.trailing_zeros() as u8)
            .set_io_command_set(CommandSet::Nvm)
            .set_enabled(true);
        self.registers.set_controller_config(config);

        // The advertised timeout may have changed across the reset.
        self.capabilities = self.registers.capabilities();
        Ok(())
    }

    /// Polls CSTS at a 1 ms cadence until RDY matches `target`, bounded by
    /// the timeout CAP advertises.
    fn poll_ready_state(&mut self, target: bool) -> Result<(), Error> {
        let timeout_ms = self.capabilities.timeout_ms();
        let mut waited_ms = 0u64;
        loop {
            let status = self.registers.controller_status();
            if status.fatal() {
                return Err(Error::ControllerFatal);
            }
            if status.ready() == target {
                return Ok(());
            }
            if waited_ms >= timeout_ms {
                return Err(Error::ControllerTimeout(timeout_ms));
            }
            self.transport.delay_ms(RESET_POLL_INTERVAL_MS);
            waited_ms += RESET_POLL_INTERVAL_MS as u64;
        }
    }

    fn identify_controller(&mut self) -> Result<(), Error> {
        debug!("identifying the controller");
        let buffer: Dma<u8> =
            Dma::allocate(self.allocator.as_ref(), self.page_size, self.page_size)?;
        let outcome = self
            .admin_command(
                Submission::identify_controller(),
                Some(PinnedPages::of(&buffer, 0)),
            )
            .and_then(|_| {
                let identify = IdentifyController::read_from(buffer.as_slice());
                self.record_identity(&identify)
            });
        let freed = buffer.free(self.allocator.as_ref());
        outcome?;
        freed
    }

    fn record_identity(&mut self, identify: &IdentifyController) -> Result<(), Error> {
        let submission_entry_size = identify.minimum_submission_entry_size();
        let completion_entry_size = identify.minimum_completion_entry_size();
        if submission_entry_size != core::mem::size_of::<Submission>()
            || completion_entry_size != core::mem::size_of::<Completion>()
        {
            return Err(Error::EntrySizesNotSupported(
                submission_entry_size,
                completion_entry_size,
            ));
        }

        // MDTS is a power of two in MPSMIN units; zero means no limit.
        if identify.max_data_transfer != 0 {
            self.maximum_data_transfer_size = (1u32 << identify.max_data_transfer)
                * self.capabilities.memory_page_size_min_bytes() as u32;
        }
        info!(
            "maximum data transfer size: {} bytes",
            self.maximum_data_transfer_size
        );

        let information = ControllerInformation {
            serial_number: identify.serial_number(),
            model_number: identify.model_number(),
            firmware_revision: identify.firmware_revision(),
            number_of_namespaces: identify.num_namespaces,
            maximum_data_transfer_size: self.maximum_data_transfer_size,
            version: self.version,
            minimum_memory_page_size: self.capabilities.memory_page_size_min_bytes(),
            maximum_memory_page_size: self.capabilities.memory_page_size_max_bytes(),
            maximum_queue_entries: self.capabilities.max_queue_entries(),
        };
        debug!("{information:?}");
        self.information = Some(information);
        Ok(())
    }

    /// Registers the I/O queue pair with the controller. The rings already
    /// exist in memory; these admin commands hand their addresses over.
    fn register_io_queue(&mut self) -> Result<(), Error> {
        let (cq_address, cq_size, sq_address, sq_size) = {
            let io_queue = self.io_queue.as_ref().ok_or(Error::NotInitialized)?;
            (
                io_queue.completion_address(),
                io_queue.completion_entry_count() as u16 - 1,
                io_queue.submission_address(),
                io_queue.submission_entry_count() as u16 - 1,
            )
        };
        debug!("registering the I/O queue pair with the controller");
        self.admin_command(
            Submission::create_io_completion_queue(IO_QUEUE_ID, cq_size),
            Some(PinnedPages {
                pages: &[cq_address],
                offset: 0,
            }),
        )?;
        self.admin_command(
            Submission::create_io_submission_queue(IO_QUEUE_ID, sq_size, IO_QUEUE_ID),
            Some(PinnedPages {
                pages: &[sq_address],
                offset: 0,
            }),
        )?;
        self.io_queue_registered = true;
        Ok(())
    }

    fn enumerate_namespaces(&mut self) -> Result<(), Error> {
        debug!("identifying active namespace IDs");
        let buffer: Dma<u8> =
            Dma::allocate(self.allocator.as_ref(), self.page_size, self.page_size)?;
        let ids = match self.admin_command(
            Submission::identify_active_namespace_list(0),
            Some(PinnedPages::of(&buffer, 0)),
        ) {
            Ok(_) => {
                let list = IdentifyActiveNamespaces::read_from(buffer.as_slice());
                list.namespace_ids
                    .iter()
                    .copied()
                    .take_while(|&id| id != 0)
                    .collect::<Vec<u32>>()
            }
            Err(error) => {
                let _ = buffer.free(self.allocator.as_ref());
                return Err(error);
            }
        };
        buffer.free(self.allocator.as_ref())?;
        debug!("active namespaces: {ids:?}");

        for id in ids {
            match Namespace::create(self, id) {
                Ok(namespace) => {
                    self.namespaces.insert(id, namespace);
                }
                Err(error) => warn!("failed to attach namespace {id}: {error}"),
            }
        }
        Ok(())
    }

    /// Issues one admin command and pumps the interrupt until its
    /// completion has been reaped.
    pub(crate) fn admin_command(
        &mut self,
        command: Submission,
        data: Option<PinnedPages<'_>>,
    ) -> Result<Completion, Error> {
        let (completer, receiver) = oneshot();
        {
            let admin_queue = self.admin_queue.as_ref().ok_or(Error::NotInitialized)?;
            admin_queue
                .submit(command.as_bytes(), data, completer)
                .map_err(Error::from)?;
        }
        loop {
            if let Some(result) = receiver.take() {
                return result.map_err(Error::CommandFailed);
            }
            self.transport.wait_for_interrupt()?;
            self.handle_interrupt();
        }
    }

    /// The interrupt handler: reaps both queues, bracketed by the legacy
    /// mask/unmask handshake, or followed by the deferred MSI-X
    /// acknowledge. Deferring the acknowledge keeps the vector from firing
    /// again before reaping is done.
    pub fn handle_interrupt(&mut self) {
        if self.transport.interrupt_mode() == InterruptMode::Legacy {
            self.registers.mask_interrupts(1);
        }
        if let Some(queue) = &self.admin_queue {
            queue.check_for_new_completions();
        }
        if let Some(queue) = &self.io_queue {
            queue.check_for_new_completions();
        }
        match self.transport.interrupt_mode() {
            InterruptMode::MsiX => self.transport.ack_interrupt(),
            InterruptMode::Legacy => {
                self.registers.unmask_interrupts(1);
                self.transport.ack_interrupt();
            }
        }
    }

    pub fn information(&self) -> Option<&ControllerInformation> {
        self.information.as_ref()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// In bytes; 0 means the controller reported no limit.
    pub fn max_transfer_size(&self) -> u32 {
        self.maximum_data_transfer_size
    }

    pub fn namespace(&self, id: u32) -> Option<&Namespace> {
        self.namespaces.get(&id)
    }

    pub fn namespace_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.namespaces.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn allocator(&self) -> &Arc<A> {
        &self.allocator
    }

    /// Deletes the I/O queues from the controller, disables it and releases
    /// every ring. Pending completers are dropped without firing.
    pub fn shutdown(mut self) -> Result<(), Error> {
        if self.io_queue_registered {
            if let Err(error) =
                self.admin_command(Submission::delete_io_submission_queue(IO_QUEUE_ID), None)
            {
                warn!("failed to delete the I/O submission queue: {error}");
            }
            if let Err(error) =
                self.admin_command(Submission::delete_io_completion_queue(IO_QUEUE_ID), None)
            {
                warn!("failed to delete the I/O completion queue: {error}");
            }
        }

        debug!("disabling the controller");
        let config = self.registers.controller_config().set_enabled(false);
        self.registers.set_controller_config(config);
        if let Err(error) = self.poll_ready_state(false) {
            warn!("controller did not finish shutting down: {error}");
        }

        if let Some(queue) = self.io_queue.take() {
            queue.free()?;
        }
        if let Some(queue) = self.admin_queue.take() {
            queue.free()?;
        }
        Ok(())
    }
}
