use crate::cmd::Completion;
use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;

#[derive(Debug)]
pub enum Error {
    Allocate(Box<dyn core::error::Error>),
    Deallocate(Box<dyn core::error::Error>),
    TranslateVirtualToPhysical(Box<dyn core::error::Error>),
    Layout(core::alloc::LayoutError),
    Pci(Box<dyn core::error::Error>),
    NotABlockDevice(String),
    MaximumQueueEntriesInvalidlyZero,
    NvmCommandSetNotSupported,
    PageSizeNotAPowerOfTwo(usize),
    PageSizeOutsideControllerWindow(usize, u64, u64),
    EntrySizesNotSupported(usize, usize),
    LbaFormatHasMetadata(u16),
    InvalidNamespaceId(u32),
    ControllerTimeout(u64),
    ControllerFatal,
    NotInitialized,
    CommandFailed(Completion),
    SubmissionQueueFull,
    SubmissionWrongSize(usize),
    TransactionAlreadyActive(usize),
    PrpChainExhausted,
    InterruptWait(Box<dyn core::error::Error>),
    OperationNotSupported,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Allocate(error) => write!(f, "Allocation error: {error}."),
            Error::Deallocate(error) => write!(f, "Deallocation error: {error}."),
            Error::TranslateVirtualToPhysical(error) => write!(f, "Translation error: {error}."),
            Error::Layout(error) => write!(f, "{error}"),
            Error::Pci(error) => write!(f, "{error}"),
            Error::NotABlockDevice(pci_address) => write!(
                f,
                "The device at PCI address {pci_address} is not a block device."
            ),
            Error::MaximumQueueEntriesInvalidlyZero => write!(
                f,
                "The value of \"Maximum Queue Entries Supported (MQES)\" in the
                capabilities register (CAP) is invalidly set to 0."
            ),
            Error::NvmCommandSetNotSupported => {
                write!(f, "The device does not support the NVM command set.")
            }
            Error::PageSizeNotAPowerOfTwo(page_size) => {
                write!(f, "The page size used ({page_size:X}) is not a power of two.")
            }
            Error::PageSizeOutsideControllerWindow(page_size, minimum, maximum) => write!(
                f,
                "The page size used ({page_size:X}) is outside the memory page size window \
                 [{minimum:X}, {maximum:X}] advertised in the capabilities register (CAP)."
            ),
            Error::EntrySizesNotSupported(sq, cq) => write!(
                f,
                "The controller requires minimum submission/completion entry sizes \
                 ({sq} B / {cq} B) that differ from the compiled entry sizes."
            ),
            Error::LbaFormatHasMetadata(metadata_size) => write!(
                f,
                "The current LBA format carries {metadata_size} bytes of metadata per block, \
                 which is not supported."
            ),
            Error::InvalidNamespaceId(id) => write!(
                f,
                "The namespace ID {id:#X} is reserved and cannot name a namespace."
            ),
            Error::ControllerTimeout(timeout_ms) => write!(
                f,
                "The controller did not change ready state within its advertised \
                 timeout of {timeout_ms} ms."
            ),
            Error::ControllerFatal => {
                write!(f, "The controller reported a fatal status (CSTS.CFS).")
            }
            Error::NotInitialized => {
                write!(f, "The controller has not completed initialization.")
            }
            Error::CommandFailed(completion) => write!(
                f,
                "The command with ID {} failed with status code {:#X} of type {:?}.",
                completion.command_id(),
                completion.status_code(),
                completion.status_code_type()
            ),
            Error::SubmissionQueueFull => write!(f, "The submission queue is full."),
            Error::SubmissionWrongSize(size) => write!(
                f,
                "The submission must be exactly one queue entry long, not {size} bytes."
            ),
            Error::TransactionAlreadyActive(slot) => write!(
                f,
                "The transaction slot {slot:#X} is already occupied by an in-flight command."
            ),
            Error::PrpChainExhausted => write!(
                f,
                "The pre-computed PRP list chain ran out of pages while being filled."
            ),
            Error::InterruptWait(error) => {
                write!(f, "Waiting for the controller interrupt failed: {error}.")
            }
            Error::OperationNotSupported => write!(f, "The operation is not supported."),
        }
    }
}

impl core::error::Error for Error {}

impl From<core::alloc::LayoutError> for Error {
    fn from(error: core::alloc::LayoutError) -> Self {
        Error::Layout(error)
    }
}
