use crate::cmd::{Completion, Submission};
use crate::dma::{Allocator, Dma};
use crate::error::Error;
use crate::queue::Queue;
use crate::regs::{Capabilities, Doorbell, Mmio, Registers};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::error;
use spin::Mutex;

/// Receives the outcome of one in-flight command: the completion entry on
/// success, or the completion entry carrying its error status.
///
/// A completer is moved into the transaction slot by [`QueuePair::submit`]
/// and moved back out by the reaper, which runs it strictly after the slot
/// has been cleared and its pinned pages released.
pub struct Completer(Box<dyn FnOnce(Result<Completion, Completion>) + Send>);

impl Completer {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<Completion, Completion>) + Send + 'static,
    {
        Self(Box::new(callback))
    }

    pub(crate) fn complete(self, result: Result<Completion, Completion>) {
        (self.0)(result)
    }
}

impl core::fmt::Debug for Completer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Completer")
    }
}

/// A completer paired with a cell the caller can poll for the result.
pub fn oneshot() -> (Completer, CompletionReceiver) {
    let cell = Arc::new(Mutex::new(None));
    let sender = cell.clone();
    let completer = Completer::new(move |result| {
        *sender.lock() = Some(result);
    });
    (completer, CompletionReceiver(cell))
}

#[derive(Debug, Clone)]
pub struct CompletionReceiver(Arc<Mutex<Option<Result<Completion, Completion>>>>);

impl CompletionReceiver {
    pub fn take(&self) -> Option<Result<Completion, Completion>> {
        self.0.lock().take()
    }
}

/// The physical pages of a data buffer pinned for the controller, plus the
/// byte offset of the transfer within the first page.
#[derive(Debug, Clone, Copy)]
pub struct PinnedPages<'a> {
    pub pages: &'a [u64],
    pub offset: usize,
}

impl<'a> PinnedPages<'a> {
    pub fn of(buffer: &'a Dma<u8>, offset: usize) -> Self {
        Self {
            pages: buffer.physical_pages(),
            offset,
        }
    }
}

#[derive(Debug)]
pub enum SubmitErrorKind {
    /// The ring has no free slot; retry after completions advance the head.
    ShouldWait,
    /// The submission byte slice is not exactly one queue entry long.
    WrongSubmissionSize(usize),
    /// The target transaction slot is still in flight. Not retryable.
    SlotAlreadyActive(usize),
    /// Allocating or filling the PRP list failed.
    Allocation(Error),
}

/// A rejected submission. The completer (still unfired) is handed back so
/// the caller can retry or fail it.
#[derive(Debug)]
pub struct SubmitError {
    pub kind: SubmitErrorKind,
    pub completer: Completer,
}

impl From<SubmitError> for Error {
    fn from(error: SubmitError) -> Self {
        match error.kind {
            SubmitErrorKind::ShouldWait => Error::SubmissionQueueFull,
            SubmitErrorKind::WrongSubmissionSize(size) => Error::SubmissionWrongSize(size),
            SubmitErrorKind::SlotAlreadyActive(slot) => Error::TransactionAlreadyActive(slot),
            SubmitErrorKind::Allocation(error) => error,
        }
    }
}

/// State attached to one in-flight command, indexed by its command ID.
#[derive(Debug, Default)]
struct TransactionState {
    /// Set while the command is in flight.
    active: bool,
    completer: Option<Completer>,
    /// The pinned pages of the caller's data buffer.
    data_pages: Vec<u64>,
    /// PRP list chain, present when the transfer spans more than two pages.
    prp_list: Option<Dma<u64>>,
}

struct CompletionRing {
    queue: Queue<Completion>,
    /// Entries whose phase equals this are fresh.
    ready_phase: u8,
}

/// A submission ring and a completion ring sharing one queue ID.
///
/// The pair tracks every in-flight command in a transaction table sized to
/// the submission ring; a command's ID is its slot index, which maps each
/// completion back to its transaction unambiguously.
///
/// Lock order: the submission or completion lock is always acquired before
/// the transaction lock, never the other way around.
pub struct QueuePair<A: Allocator, M: Mmio> {
    submission: Mutex<Queue<Submission>>,
    completion: Mutex<CompletionRing>,
    transactions: Mutex<Vec<TransactionState>>,
    /// Last position the controller reported consuming in the submission
    /// ring; the one-slot-free rule keeps the tail from catching it.
    sq_head: AtomicUsize,
    submission_doorbell: Doorbell,
    completion_doorbell: Doorbell,
    registers: Arc<Registers<M>>,
    allocator: Arc<A>,
    page_size: usize,
}

impl<A: Allocator, M: Mmio> QueuePair<A, M> {
    pub fn create(
        allocator: Arc<A>,
        registers: Arc<Registers<M>>,
        queue_id: u16,
        max_entries: usize,
        capabilities: &Capabilities,
        page_size: usize,
    ) -> Result<Self, Error> {
        let submission: Queue<Submission> = Queue::new(allocator.as_ref(), page_size, max_entries)?;
        let completion: Queue<Completion> =
            match Queue::new(allocator.as_ref(), page_size, max_entries) {
                Ok(queue) => queue,
                Err(error) => {
                    let _ = submission.free(allocator.as_ref());
                    return Err(error);
                }
            };

        let mut transactions = Vec::with_capacity(submission.entry_count());
        transactions.resize_with(submission.entry_count(), TransactionState::default);

        Ok(Self {
            sq_head: AtomicUsize::new(submission.entry_count() - 1),
            transactions: Mutex::new(transactions),
            submission: Mutex::new(submission),
            completion: Mutex::new(CompletionRing {
                queue: completion,
                ready_phase: 1,
            }),
            submission_doorbell: Doorbell::submission(queue_id, capabilities),
            completion_doorbell: Doorbell::completion(queue_id, capabilities),
            registers,
            allocator,
            page_size,
        })
    }

    pub fn submission_entry_count(&self) -> usize {
        self.submission.lock().entry_count()
    }

    pub fn completion_entry_count(&self) -> usize {
        self.completion.lock().queue.entry_count()
    }

    pub fn submission_address(&self) -> u64 {
        self.submission.lock().device_address()
    }

    pub fn completion_address(&self) -> u64 {
        self.completion.lock().queue.device_address()
    }

    /// Installs a command into the next free submission slot and rings the
    /// doorbell.
    ///
    /// `submission` must be exactly one submission entry; its command ID is
    /// overwritten with the slot index, and its metadata pointer, fused and
    /// data transfer mode fields are cleared (neither is supported). If
    /// `data` is present, its pages become the command's data pointers, via
    /// a PRP list when the transfer spans more than two pages.
    ///
    /// On rejection nothing is left installed and the completer is handed
    /// back inside the [`SubmitError`].
    pub fn submit(
        &self,
        submission: &[u8],
        data: Option<PinnedPages<'_>>,
        completer: Completer,
    ) -> Result<(), SubmitError> {
        let mut sq = self.submission.lock();
        if (sq.next_index() + 1) % sq.entry_count() == self.sq_head.load(Ordering::Acquire) {
            // No room. Try again once completions advance the head.
            return Err(SubmitError {
                kind: SubmitErrorKind::ShouldWait,
                completer,
            });
        }
        if submission.len() != core::mem::size_of::<Submission>() {
            return Err(SubmitError {
                kind: SubmitErrorKind::WrongSubmissionSize(submission.len()),
                completer,
            });
        }

        let mut transactions = self.transactions.lock();
        let index = sq.next_index();
        if transactions[index].active {
            error!("slot {index:#x} is already active; refusing to overwrite it");
            return Err(SubmitError {
                kind: SubmitErrorKind::SlotAlreadyActive(index),
                completer,
            });
        }

        let mut entry = Submission::from_bytes(submission);
        // The command ID doubles as the transaction slot index.
        entry.command_id = index as u16;
        // Metadata and fused commands are not supported.
        entry.metadata_pointer = 0;
        entry.flags = 0;
        entry.data_pointer = [0, 0];

        let mut data_pages = Vec::new();
        let mut prp_list = None;
        if let Some(pinned) = data {
            let pages = pinned.pages;
            debug_assert!(!pages.is_empty());
            debug_assert!(pinned.offset < self.page_size);
            entry.data_pointer[0] = pages[0] + pinned.offset as u64;
            if pages.len() == 2 {
                entry.data_pointer[1] = pages[1];
            } else if pages.len() > 2 {
                let list = match self.prepare_prp_list(&pages[1..]) {
                    Ok(list) => list,
                    Err(error) => {
                        return Err(SubmitError {
                            kind: SubmitErrorKind::Allocation(error),
                            completer,
                        })
                    }
                };
                entry.data_pointer[1] = list.device_address();
                prp_list = Some(list);
            }
            data_pages = pages.to_vec();
        }

        let slot = &mut transactions[index];
        slot.completer = Some(completer);
        slot.data_pages = data_pages;
        slot.prp_list = prp_list;
        slot.active = true;

        sq.write_slot(entry);
        let tail = sq.advance();
        // The doorbell write is sequenced after the slot store above.
        self.submission_doorbell.ring(&self.registers, tail as u32);
        Ok(())
    }

    /// Walks the completion ring, fulfilling the completer of every freshly
    /// written entry. Called from the interrupt handler.
    pub fn check_for_new_completions(&self) {
        let mut cq = self.completion.lock();
        let mut handled = false;
        loop {
            let entry = cq.queue.peek();
            if entry.phase() != cq.ready_phase {
                break;
            }
            handled = true;
            cq.queue.advance();
            if cq.queue.next_index() == 0 {
                // About to wrap; fresh entries arrive with the other phase.
                cq.ready_phase ^= 1;
            }
            self.sq_head.store(entry.sq_head() as usize, Ordering::Release);

            let completer;
            let prp_list;
            {
                let mut transactions = self.transactions.lock();
                let id = entry.command_id() as usize;
                let Some(slot) = transactions.get_mut(id) else {
                    error!("completion names out-of-range command {id:#x}");
                    continue;
                };
                if !slot.active {
                    error!("completion names command {id:#x}, which is not in flight");
                    continue;
                }
                completer = slot.completer.take();
                prp_list = slot.prp_list.take();
                slot.data_pages = Vec::new();
                slot.active = false;
            }

            // The pins are released and the transaction lock dropped before
            // the completer runs, so its handler may immediately resubmit
            // into the same slot.
            if let Some(prp_list) = prp_list {
                if let Err(error) = prp_list.free(self.allocator.as_ref()) {
                    error!(
                        "failed to release the PRP list of command {}: {error}",
                        entry.command_id()
                    );
                }
            }
            if let Some(completer) = completer {
                if entry.is_success() {
                    completer.complete(Ok(entry));
                } else {
                    completer.complete(Err(entry));
                }
            }
        }
        if handled {
            self.completion_doorbell
                .ring(&self.registers, cq.queue.next_index() as u32);
        }
    }

    /// Builds the PRP list chain describing `pages`, which excludes the
    /// first transfer page (that one rides in data pointer 0).
    ///
    /// Every list page holds `page_size / 8` entries; when a transfer needs
    /// more than one list page, the last entry of each page holds the
    /// physical address of the next one.
    fn prepare_prp_list(&self, pages: &[u64]) -> Result<Dma<u64>, Error> {
        let entries_per_page = self.page_size / core::mem::size_of::<u64>();
        // One entry per list page is lost to chaining; over-allocating one
        // page of slack beats special-casing the exact fit.
        let list_page_count = pages.len() / (entries_per_page - 1) + 1;
        let mut list: Dma<u64> = Dma::allocate(
            self.allocator.as_ref(),
            list_page_count * entries_per_page,
            self.page_size,
        )?;
        let list_pages = list.physical_pages().to_vec();
        match fill_prp_entries(list.as_mut_slice(), &list_pages, pages, entries_per_page) {
            Ok(()) => Ok(list),
            Err(error) => {
                let _ = list.free(self.allocator.as_ref());
                Err(error)
            }
        }
    }

    /// Releases the rings, any leftover PRP lists and the pins of commands
    /// that never completed. Pending completers are dropped without firing.
    pub fn free(self) -> Result<(), Error> {
        let allocator = self.allocator.clone();
        self.submission.into_inner().free(allocator.as_ref())?;
        self.completion.into_inner().queue.free(allocator.as_ref())?;
        for slot in self.transactions.into_inner() {
            if let Some(prp_list) = slot.prp_list {
                prp_list.free(allocator.as_ref())?;
            }
        }
        Ok(())
    }
}

fn fill_prp_entries(
    entries: &mut [u64],
    list_pages: &[u64],
    pages: &[u64],
    entries_per_page: usize,
) -> Result<(), Error> {
    let mut cursor = 0;
    let mut next_list_page = 1;
    for &page in pages {
        if cursor % entries_per_page == entries_per_page - 1 {
            // Crossing a list page boundary; chain to the next list page.
            let Some(&chain) = list_pages.get(next_list_page) else {
                error!("the pre-computed PRP chain ran out of pages");
                return Err(Error::PrpChainExhausted);
            };
            entries[cursor] = chain;
            next_list_page += 1;
            cursor += 1;
        }
        entries[cursor] = page;
        cursor += 1;
    }
    Ok(())
}
