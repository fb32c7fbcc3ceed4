//! Live model of the debuggee's process, thread, and module topology.
//!
//! Ownership is by key membership. A process owns its threads and modules because they
//! are stored under it, and a global thread index maps each live thread back to its
//! owning process. The registry does no I/O.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::types::{Address, OsHandle, ProcessId, ThreadId};


#[derive(thiserror::Error, Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegistryError {
    #[error("Process {0} is already registered")]
    DuplicateProcess(ProcessId),

    #[error("Process {0} is not registered")]
    ProcessNotFound(ProcessId),

    #[error("Process {pid} still owns {threads} live thread(s)")]
    ProcessHasThreads { pid: ProcessId, threads: usize },

    #[error("Thread {0} is already registered")]
    DuplicateThread(ThreadId),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadState {
    pub id: ThreadId,
    pub handle: OsHandle,
    pub process_id: ProcessId,
    pub start_address: Option<Address>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleRecord {
    pub path: Option<PathBuf>,
    pub base: Address,
    pub size: Option<u64>,
}

impl ModuleRecord {
    pub fn contains(&self, addr: Address) -> bool {
        match self.size {
            Some(size) => addr >= self.base && addr.0 - self.base.0 < size,
            None => addr == self.base,
        }
    }
}

/// Threads of one process, in creation order.
#[derive(Clone, Debug, Default)]
pub struct ThreadRegistry {
    threads: Vec<ThreadState>,
}

impl ThreadRegistry {
    fn insert(&mut self, thread: ThreadState) -> Result<(), RegistryError> {
        if self.get(thread.id).is_some() {
            return Err(RegistryError::DuplicateThread(thread.id));
        }

        self.threads.push(thread);
        Ok(())
    }

    fn remove(&mut self, tid: ThreadId) -> Option<ThreadState> {
        let index = self.threads.iter().position(|t| t.id == tid)?;

        // `Vec::remove` keeps creation order for the remaining threads.
        Some(self.threads.remove(index))
    }

    pub fn get(&self, tid: ThreadId) -> Option<&ThreadState> {
        self.threads.iter().find(|t| t.id == tid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ThreadState> {
        self.threads.iter()
    }

    pub fn ids(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|t| t.id).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Modules of one process, keyed by base address.
#[derive(Clone, Debug, Default)]
pub struct ModuleMap {
    modules: BTreeMap<Address, ModuleRecord>,
}

impl ModuleMap {
    /// Insert a module. Returns the record it replaced at the same base, if any.
    pub fn insert(&mut self, module: ModuleRecord) -> Option<ModuleRecord> {
        self.modules.insert(module.base, module)
    }

    /// Remove the module loaded at `base`. Removing an absent module is a no-op.
    pub fn remove(&mut self, base: Address) -> Option<ModuleRecord> {
        self.modules.remove(&base)
    }

    pub fn get(&self, base: Address) -> Option<&ModuleRecord> {
        self.modules.get(&base)
    }

    pub fn by_path(&self, path: &Path) -> Option<&ModuleRecord> {
        self.modules.values().find(|m| m.path.as_deref() == Some(path))
    }

    /// Find the module whose mapped range covers `addr`.
    pub fn containing(&self, addr: Address) -> Option<&ModuleRecord> {
        self.modules
            .range(..=addr)
            .next_back()
            .map(|(_, module)| module)
            .filter(|module| module.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    fn clear(&mut self) -> usize {
        let n = self.modules.len();
        self.modules.clear();
        n
    }
}

#[derive(Clone, Debug)]
pub struct ProcessState {
    pub id: ProcessId,
    pub handle: OsHandle,
    pub main_thread: ThreadId,

    /// Main image the process was created with. An image replaced later, as by `exec()`,
    /// shows up as a module instead.
    pub base_address: Address,
    pub image_path: Option<PathBuf>,

    threads: ThreadRegistry,
    modules: ModuleMap,
}

impl ProcessState {
    pub fn new(
        id: ProcessId,
        handle: OsHandle,
        base_address: Address,
        main_thread: ThreadId,
        image_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            handle,
            base_address,
            main_thread,
            image_path,
            threads: ThreadRegistry::default(),
            modules: ModuleMap::default(),
        }
    }

    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    pub fn modules(&self) -> &ModuleMap {
        &self.modules
    }
}

/// All live debuggee processes, and the process of the event being dispatched.
#[derive(Clone, Debug, Default)]
pub struct ProcessRegistry {
    processes: BTreeMap<ProcessId, ProcessState>,

    /// Owning process of every live thread.
    thread_owners: HashMap<ThreadId, ProcessId>,

    current: Option<ProcessId>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new process. Its thread and module sets start empty.
    pub fn insert_process(&mut self, process: ProcessState) -> Result<(), RegistryError> {
        let pid = process.id;

        if self.processes.contains_key(&pid) {
            return Err(RegistryError::DuplicateProcess(pid));
        }

        trace!(pid = pid.as_raw(), "inserting process");
        self.processes.insert(pid, process);

        Ok(())
    }

    /// Remove a process record.
    ///
    /// The caller must first remove every thread of the process. Modules are cleared
    /// along with the record.
    pub fn remove_process(&mut self, pid: ProcessId) -> Result<ProcessState, RegistryError> {
        let process = self.processes.get(&pid).ok_or(RegistryError::ProcessNotFound(pid))?;

        if !process.threads.is_empty() {
            return Err(RegistryError::ProcessHasThreads {
                pid,
                threads: process.threads.len(),
            });
        }

        trace!(pid = pid.as_raw(), "removing process");

        if self.current == Some(pid) {
            self.current = None;
        }

        let mut process = self
            .processes
            .remove(&pid)
            .ok_or(RegistryError::ProcessNotFound(pid))?;
        process.modules.clear();

        Ok(process)
    }

    pub fn insert_thread(&mut self, pid: ProcessId, thread: ThreadState) -> Result<(), RegistryError> {
        let tid = thread.id;

        if self.thread_owners.contains_key(&tid) {
            return Err(RegistryError::DuplicateThread(tid));
        }

        let process = self.processes.get_mut(&pid).ok_or(RegistryError::ProcessNotFound(pid))?;

        trace!(pid = pid.as_raw(), tid = tid.as_raw(), "inserting thread");
        process.threads.insert(ThreadState { process_id: pid, ..thread })?;
        self.thread_owners.insert(tid, pid);

        Ok(())
    }

    pub fn remove_thread(&mut self, tid: ThreadId) -> Option<ThreadState> {
        let pid = self.thread_owners.remove(&tid)?;

        trace!(pid = pid.as_raw(), tid = tid.as_raw(), "removing thread");
        self.processes.get_mut(&pid)?.threads.remove(tid)
    }

    /// Remove every thread of `pid`, in creation order.
    pub fn remove_threads_of(&mut self, pid: ProcessId) -> Vec<ThreadState> {
        let tids = match self.processes.get(&pid) {
            Some(process) => process.threads.ids(),
            None => return vec![],
        };

        tids.into_iter()
            .filter_map(|tid| self.remove_thread(tid))
            .collect()
    }

    /// Record a module load. Returns the record replaced at the same base, if any.
    pub fn insert_module(&mut self, pid: ProcessId, module: ModuleRecord) -> Result<Option<ModuleRecord>, RegistryError> {
        let process = self.processes.get_mut(&pid).ok_or(RegistryError::ProcessNotFound(pid))?;

        trace!(pid = pid.as_raw(), base = %module.base, "inserting module");
        Ok(process.modules.insert(module))
    }

    /// Record a module unload. Unloading an unknown base is a no-op.
    pub fn remove_module(&mut self, pid: ProcessId, base: Address) -> Option<ModuleRecord> {
        trace!(pid = pid.as_raw(), %base, "removing module");
        self.processes.get_mut(&pid)?.modules.remove(base)
    }

    /// Clear all modules of `pid`, returning how many were removed.
    pub fn clear_modules(&mut self, pid: ProcessId) -> usize {
        self.processes
            .get_mut(&pid)
            .map(|process| process.modules.clear())
            .unwrap_or(0)
    }

    pub fn lookup_process(&self, pid: ProcessId) -> Option<&ProcessState> {
        self.processes.get(&pid)
    }

    pub fn lookup_thread(&self, tid: ThreadId) -> Option<&ThreadState> {
        let pid = self.thread_owners.get(&tid)?;
        self.processes.get(pid)?.threads.get(tid)
    }

    pub fn thread_owner(&self, tid: ThreadId) -> Option<ProcessId> {
        self.thread_owners.get(&tid).copied()
    }

    /// The process of the event currently being dispatched.
    pub fn current_process(&self) -> Option<&ProcessState> {
        self.processes.get(&self.current?)
    }

    pub fn current_process_id(&self) -> Option<ProcessId> {
        self.current
    }

    pub(crate) fn set_current(&mut self, pid: Option<ProcessId>) {
        self.current = pid;
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessState> {
        self.processes.values()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_owners.len()
    }

    /// Remove every process, tearing each one down threads first, then modules.
    pub fn drain(&mut self) -> Vec<(ProcessState, Vec<ThreadState>)> {
        let mut drained = vec![];

        for pid in self.process_ids() {
            let threads = self.remove_threads_of(pid);
            self.clear_modules(pid);

            if let Ok(process) = self.remove_process(pid) {
                drained.push((process, threads));
            }
        }

        self.current = None;
        drained
    }
}
