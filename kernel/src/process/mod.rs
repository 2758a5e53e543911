//! Processes: the container tying an address space, a handle table, and a
//! set of threads together.

use alloc::{
    collections::BTreeMap,
    string::String,
    sync::Arc,
    vec::Vec,
};
use core::any::Any;

use crate::{
    error::{KernelError, KernelResult},
    mm::vas::{self, AddressSpace},
    object::{Handle, HandleTable, KernelObject, Notifier, ObjectType, WaitEvent, Waiter},
    sched::Thread,
    sync::SpinLock,
    util::IdAllocator,
};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u64);

pub struct Process {
    id: ProcessId,
    name: String,
    aspace: Arc<AddressSpace>,
    handles: HandleTable,
    threads: SpinLock<Vec<Arc<Thread>>>,
    /// Signalled when the last thread exits.
    exit_notifier: Notifier,
}

impl Process {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    pub fn handle_table(&self) -> &HandleTable {
        &self.handles
    }

    /// Add a thread to this process.
    pub fn attach_thread(self: &Arc<Self>, thread: &Arc<Thread>) {
        thread.attach_process(self);
        self.threads.lock().push(thread.clone());
    }

    /// Remove a thread (reaper path). The last detach signals waiters.
    pub fn detach_thread(&self, thread: &Arc<Thread>) {
        let emptied = {
            let mut threads = self.threads.lock();
            threads.retain(|t| t.id() != thread.id());
            threads.is_empty()
        };
        if emptied {
            self.exit_notifier.notify(WaitEvent::Terminated);
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

impl KernelObject for Process {
    fn object_type(&self) -> ObjectType {
        ObjectType::Process
    }

    fn wait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) -> KernelResult<()> {
        if event != WaitEvent::Terminated {
            return Err(KernelError::InvalidArgument);
        }
        if self.thread_count() == 0 {
            waiter.signal(index);
        } else {
            self.exit_notifier.register(waiter, index, event);
        }
        Ok(())
    }

    fn unwait(&self, waiter: &Arc<Waiter>, index: usize, event: WaitEvent) {
        self.exit_notifier.unregister(waiter, index, event);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let mut ids = PROCESS_IDS.lock();
        if let Some(ids) = ids.as_mut() {
            ids.free(self.id.0 as usize);
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const MAX_PROCESSES: usize = 4096;

static PROCESS_IDS: SpinLock<Option<IdAllocator>> = SpinLock::new(None);
static PROCESSES: SpinLock<BTreeMap<u64, Arc<Process>>> = SpinLock::new(BTreeMap::new());
static KERNEL_PROCESS: crate::sync::OnceLock<Arc<Process>> = crate::sync::OnceLock::new();

fn alloc_id() -> KernelResult<ProcessId> {
    let mut ids = PROCESS_IDS.lock();
    let ids = ids.get_or_insert_with(|| IdAllocator::new(MAX_PROCESSES));
    ids.alloc()
        .map(|id| ProcessId(id as u64))
        .ok_or(KernelError::OutOfMemory)
}

/// The kernel's own process: the kernel address space, no parent. Built on
/// first use during single-threaded boot.
pub fn kernel_process() -> &'static Arc<Process> {
    if let Some(process) = KERNEL_PROCESS.get() {
        return process;
    }
    let candidate = Arc::new(Process {
        id: alloc_id().expect("process id space exhausted at boot"),
        name: String::from("kernel"),
        aspace: vas::kernel_space().clone(),
        handles: HandleTable::new(),
        threads: SpinLock::new(Vec::new()),
        exit_notifier: Notifier::new(),
    });
    // A racing initializer loses cleanly: its candidate drops (returning
    // the id) and the winner is registered exactly once.
    let _ = KERNEL_PROCESS.set(candidate);
    let winner = KERNEL_PROCESS.get().expect("kernel process just set");
    PROCESSES
        .lock()
        .entry(winner.id().0)
        .or_insert_with(|| winner.clone());
    winner
}

/// Create a fresh process with an empty handle table.
pub fn create(name: &str) -> KernelResult<Arc<Process>> {
    let id = alloc_id()?;
    let process = Arc::new(Process {
        id,
        name: String::from(name),
        aspace: AddressSpace::new_user()?,
        handles: HandleTable::new(),
        threads: SpinLock::new(Vec::new()),
        exit_notifier: Notifier::new(),
    });
    PROCESSES.lock().insert(id.0, process.clone());
    log::debug!("process {} created ({})", id.0, name);
    Ok(process)
}

/// Create a process as a copy of `parent`'s handle environment: either the
/// INHERITABLE entries, or an explicit source-to-destination id map.
pub fn create_from(
    parent: &Arc<Process>,
    name: &str,
    id_map: Option<&[(u32, u32)]>,
) -> KernelResult<Arc<Process>> {
    let id = alloc_id()?;
    let handles = HandleTable::inherit(&parent.handles, id_map)?;
    let process = Arc::new(Process {
        id,
        name: String::from(name),
        aspace: AddressSpace::new_user()?,
        handles,
        threads: SpinLock::new(Vec::new()),
        exit_notifier: Notifier::new(),
    });
    PROCESSES.lock().insert(id.0, process.clone());
    Ok(process)
}

/// Look up a live process.
pub fn find(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&id.0).cloned()
}

/// Drop the registry's reference. The process is freed once its last thread
/// is reaped and the last handle to it closes.
pub fn unregister(id: ProcessId) {
    PROCESSES.lock().remove(&id.0);
}

/// Handle factory for process objects.
pub fn make_handle(process: Arc<Process>, rights: crate::object::Rights) -> Arc<Handle> {
    Handle::new(process, rights)
}

/// The calling thread's process, or the kernel process for kernel threads.
pub fn current() -> Arc<Process> {
    crate::sched::current_thread()
        .process()
        .unwrap_or_else(|| kernel_process().clone())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::object::{object_wait, Rights};

    #[test]
    fn kernel_process_is_registered() {
        vas::init();
        let kp = kernel_process();
        assert_eq!(kp.name(), "kernel");
        assert!(find(kp.id()).is_some());
        assert!(Arc::ptr_eq(kernel_process(), kp));
    }

    #[test]
    fn terminated_wait_fires_once_threadless() {
        vas::init();
        let kp = kernel_process().clone();
        // The kernel process has no attached threads in the test harness,
        // so a Terminated wait is already satisfied.
        let handle = make_handle(kp, Rights::READ);
        assert_eq!(object_wait(&[(handle, WaitEvent::Terminated)], 0), Ok(0));
    }
}
