use crate::cmd::{IdentifyNamespace, Submission};
use crate::controller::{Controller, Transport};
use crate::dma::{Allocator, Dma};
use crate::error::Error;
use crate::queue_pair::PinnedPages;
use crate::regs::Mmio;
use alloc::format;
use alloc::string::String;
use bitflags::bitflags;
use log::info;

bitflags! {
    /// Block device flags; empty in this revision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        const READ_ONLY = 1 << 0;
        const REMOVABLE = 1 << 1;
    }
}

/// Geometry and limits a block client learns through [`Namespace::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_size: u32,
    pub block_count: u64,
    /// In bytes; 0 means the controller reported no limit.
    pub max_transfer_size: u32,
    pub flags: BlockFlags,
}

/// A block request, addressed in logical blocks of the namespace's current
/// LBA format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read {
        lba: u64,
        block_count: u32,
        buffer_offset: usize,
    },
    Write {
        lba: u64,
        block_count: u32,
        buffer_offset: usize,
    },
    Flush,
}

/// One active namespace of a controller, presented as a block device named
/// `namespace-{id}`.
///
/// The namespace is attached by identifying it through the admin queue and
/// deriving its geometry from the current LBA format. Formats that carry
/// per-block metadata are refused.
#[derive(Debug, Clone)]
pub struct Namespace {
    id: u32,
    name: String,
    lba_size_bytes: u32,
    lba_count: u64,
    max_transfer_size: u32,
}

impl Namespace {
    /// NSID 0 and NSID 0xFFFFFFFF are reserved by the specification and
    /// rejected here.
    pub(crate) fn create<A: Allocator, M: Mmio, T: Transport>(
        controller: &mut Controller<A, M, T>,
        id: u32,
    ) -> Result<Self, Error> {
        if id == 0 || id == u32::MAX {
            return Err(Error::InvalidNamespaceId(id));
        }

        let page_size = controller.page_size();
        let allocator = controller.allocator().clone();
        let buffer: Dma<u8> = Dma::allocate(allocator.as_ref(), page_size, page_size)?;
        let outcome = controller
            .admin_command(
                Submission::identify_namespace(id),
                Some(PinnedPages::of(&buffer, 0)),
            )
            .map(|_| IdentifyNamespace::read_from(buffer.as_slice()));
        let freed = buffer.free(allocator.as_ref());
        let identify = outcome?;
        freed?;

        let format = identify.current_lba_format();
        info!(
            "namespace {id}: LBAs of {} bytes (log2 {}), perf {:?}, metadata size {}",
            format.lba_data_size_bytes(),
            format.lba_data_size_log2(),
            format.relative_performance(),
            format.metadata_size_bytes()
        );
        if format.metadata_size_bytes() != 0 {
            return Err(Error::LbaFormatHasMetadata(format.metadata_size_bytes()));
        }

        Ok(Self {
            id,
            name: format!("namespace-{id}"),
            lba_size_bytes: format.lba_data_size_bytes(),
            lba_count: identify.namespace_size,
            max_transfer_size: controller.max_transfer_size(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports the namespace geometry and the size of one block op record.
    pub fn query(&self) -> (BlockInfo, usize) {
        (
            BlockInfo {
                block_size: self.lba_size_bytes,
                block_count: self.lba_count,
                max_transfer_size: self.max_transfer_size,
                flags: BlockFlags::empty(),
            },
            core::mem::size_of::<BlockOp>(),
        )
    }

    /// Queues a block op. Reads and writes are not wired into the I/O
    /// queue pair yet, so every op completes with
    /// [`Error::OperationNotSupported`]; the op rides back through the
    /// callback so a future data path keeps this shape.
    pub fn queue<F>(&self, op: BlockOp, callback: F)
    where
        F: FnOnce(Result<(), Error>, BlockOp),
    {
        callback(Err(Error::OperationNotSupported), op);
    }
}
