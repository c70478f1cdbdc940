//! The patch engine: installs a jump at the start of a trampoline and
//! rewrites its displacement field on every direction change.
//!
//! Writers are serialized by a process-wide lock so that permission toggles
//! on a shared page cannot interleave. Readers executing the trampoline are
//! never synchronized with; a call racing a patch may fetch a partially
//! written displacement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::config::PatchConfig;
use crate::dispatch::codec::{self, Endian, Family, FieldBytes};
use crate::dispatch::page::{self, CodeRegion};
use crate::dispatch::trampoline::Target;
use crate::error::{BranchError, BranchResult};

static PATCH_LOCK: Mutex<()> = Mutex::new(());

/// Set once any site has restored read+execute. Trampolines share text
/// pages, so a persistent site can no longer assume its page stayed
/// writable after that.
static PAGES_RESTORED: AtomicBool = AtomicBool::new(false);

fn restore_execute_only(region: &CodeRegion) -> BranchResult<()> {
    PAGES_RESTORED.store(true, Ordering::Relaxed);
    page::make_execute_only(region.address(), region.len())
}

/// Failure of [`PatchSite::install`].
#[derive(Debug)]
pub struct InstallError {
    pub error: BranchError,
    /// The jump was already written when `error` occurred.
    pub patched: bool,
}

impl InstallError {
    fn after_write(error: BranchError) -> Self {
        Self {
            error,
            patched: true,
        }
    }
}

impl From<BranchError> for InstallError {
    fn from(error: BranchError) -> Self {
        Self {
            error,
            patched: false,
        }
    }
}

/// Encoded displacement field for every candidate, in candidate order.
#[derive(Debug, Clone)]
pub struct JumpTable {
    targets: Vec<Target>,
    entries: Vec<FieldBytes>,
}

impl JumpTable {
    /// Encode the displacement from the jump at `instruction` to each target.
    pub fn build(
        instruction: usize,
        targets: &[Target],
        family: Family,
        endian: Endian,
    ) -> BranchResult<Self> {
        if targets.len() < 2 {
            return Err(BranchError::TooFewTargets { len: targets.len() });
        }

        let entries = targets
            .iter()
            .enumerate()
            .map(|(index, target)| {
                let offset = codec::compute_offset(target.address(), instruction, family);
                codec::encode(offset, family, endian).map_err(|_| BranchError::OutOfBounds {
                    index,
                    offset,
                    limit: family.limit(),
                })
            })
            .collect::<BranchResult<Vec<_>>>()?;

        Ok(Self {
            targets: targets.to_vec(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<FieldBytes> {
        self.entries.get(index).copied()
    }

    pub fn target(&self, index: usize) -> Option<Target> {
        self.targets.get(index).copied()
    }

    fn checked_entry(&self, index: usize) -> BranchResult<FieldBytes> {
        self.entry(index).ok_or(BranchError::DirectionOutOfRange {
            index,
            len: self.len(),
        })
    }
}

/// A routine run after each displacement write to drain instructions the
/// core may have fetched before the store.
#[derive(Debug, Clone, Copy)]
pub struct FlushStub(fn());

impl FlushStub {
    pub fn host() -> Self {
        FlushStub(serialize)
    }

    pub fn run(self) {
        (self.0)()
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
fn serialize() {
    #[cfg(target_arch = "x86")]
    use core::arch::x86::__cpuid;
    #[cfg(target_arch = "x86_64")]
    use core::arch::x86_64::__cpuid;

    // cpuid is architecturally serializing.
    #[allow(unused_unsafe)]
    let result = unsafe { __cpuid(0) };
    core::hint::black_box(result.eax);
}

#[cfg(target_arch = "aarch64")]
fn serialize() {
    // SAFETY: isb only discards prefetched instructions.
    unsafe { core::arch::asm!("isb", options(nomem, nostack, preserves_flags)) }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
fn serialize() {}

/// A trampoline under the engine's control.
#[derive(Debug)]
pub struct PatchSite {
    region: CodeRegion,
    family: Family,
    endian: Endian,
    table: JumpTable,
    current: usize,
    config: PatchConfig,
    flush: Option<FlushStub>,
    patches: u64,
}

impl PatchSite {
    /// Encode `candidates`, write the jump opcode and point the jump at
    /// `candidates[default]`.
    ///
    /// Nothing is written unless every candidate is reachable and `default`
    /// is in range. Only a failure to restore read+execute afterwards comes
    /// back with `patched` set.
    ///
    /// # Safety
    /// `region` must cover the first `family.jump_len()` bytes of a function
    /// that is never executed except through the patched jump, and every
    /// candidate must have the calling convention callers of that function
    /// expect.
    pub unsafe fn install(
        region: CodeRegion,
        candidates: &[Target],
        default: usize,
        family: Family,
        endian: Endian,
        config: PatchConfig,
    ) -> Result<Self, InstallError> {
        debug_assert!(region.len() >= family.jump_len());

        let table = JumpTable::build(region.address(), candidates, family, endian)?;
        let entry = table.checked_entry(default)?;

        let _guard = PATCH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        page::make_writable(region.address(), region.len())?;

        // SAFETY: the page is writable and the caller owns the region.
        unsafe {
            if let Some(opcode) = family.opcode() {
                region.write_byte(0, opcode);
            }
            region.write_bytes(family.field_offset(), entry);
        }
        region.sync_icache();

        let flush = config.flush_pipeline().then(FlushStub::host);
        if let Some(flush) = flush {
            flush.run();
        }
        if config.conserve_permissions() {
            restore_execute_only(&region).map_err(InstallError::after_write)?;
        }

        tracing::debug!(
            address = region.address(),
            family = family.name(),
            targets = table.len(),
            default,
            ?config,
            "installed trampoline jump"
        );

        Ok(Self {
            region,
            family,
            endian,
            table,
            current: default,
            config,
            flush,
            patches: 1,
        })
    }

    /// Point the jump at candidate `index`.
    ///
    /// Returns `Ok(false)` without touching memory when `index` is already
    /// the active direction.
    pub fn set_direction(&mut self, index: usize) -> BranchResult<bool> {
        let entry = self.table.checked_entry(index)?;
        if index == self.current {
            return Ok(false);
        }

        let _guard = PATCH_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let conserve = self.config.conserve_permissions();
        if conserve || PAGES_RESTORED.load(Ordering::Relaxed) {
            page::make_writable(self.region.address(), self.region.len())?;
        }

        // SAFETY: the page is writable, either since install or just above;
        // the region was handed over at install.
        unsafe {
            self.region.write_bytes(self.family.field_offset(), entry);
        }
        self.current = index;
        self.patches += 1;
        self.region.sync_icache();
        if let Some(flush) = self.flush {
            flush.run();
        }

        if conserve {
            restore_execute_only(&self.region)?;
        }

        tracing::trace!(address = self.region.address(), direction = index, "patched");
        Ok(true)
    }

    pub fn direction(&self) -> usize {
        self.current
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Number of displacement writes, including the one at install.
    pub fn patch_count(&self) -> u64 {
        self.patches
    }

    pub fn address(&self) -> usize {
        self.region.address()
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn config(&self) -> PatchConfig {
        self.config
    }

    pub fn table(&self) -> &JumpTable {
        &self.table
    }

    /// The jump instruction as it currently sits in memory.
    pub fn leading_bytes(&self) -> Vec<u8> {
        self.region.read()
    }

    /// Absolute address the jump currently resolves to.
    pub fn current_target(&self) -> Option<usize> {
        codec::jump_target(
            &self.leading_bytes(),
            self.region.address(),
            self.family,
            self.endian,
        )
    }
}
