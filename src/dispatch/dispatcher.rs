//! Typed dispatchers over a patched trampoline.
//!
//! [`Switch`] picks between two targets with a `bool`; [`BranchChanger`]
//! picks among any number of targets by index. Both dereference to an
//! [`Entry`], whose `branch` method calls the trampoline with the
//! signature's arguments.

// Same overlap as the `Signature` impls: `fn(A) -> R` next to
// `for<'r> fn(&'r T) -> R`.
#![allow(coherence_leak_check)]

use std::fmt;
use std::ops::Deref;

use crate::config::PatchConfig;
use crate::dispatch::codec::{Endian, Family};
use crate::dispatch::page::CodeRegion;
use crate::dispatch::patch::{InstallError, PatchSite};
use crate::dispatch::registry::{self, Claim};
use crate::dispatch::trampoline::{Method, Signature, Target};
use crate::error::{BranchError, BranchResult};

/// Callable handle on a signature's trampoline.
///
/// Borrowed from a dispatcher, it is tied to the dispatcher's lifetime and
/// cannot observe a patch in flight. An owned handle from `share` can be
/// sent to other threads and races with `set_direction`.
pub struct Entry<S: Signature> {
    entry: S::Target,
}

impl<S: Signature> Entry<S> {
    /// Code address of the trampoline.
    pub fn address(&self) -> usize {
        S::address(self.entry)
    }
}

impl<S: Signature> fmt::Debug for Entry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("signature", &S::name())
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

macro_rules! free_branch {
    ($($arg:ident: $ty:ident),*) => {
        impl<R: Default + 'static, $($ty: 'static),*> Entry<fn($($ty),*) -> R> {
            /// Call whichever target the trampoline currently jumps to.
            #[inline(always)]
            pub fn branch(&self, $($arg: $ty),*) -> R {
                (core::hint::black_box(self.entry))($($arg),*)
            }
        }
    };
}

macro_rules! method_branch {
    ($($arg:ident: $ty:ident),*) => {
        impl<C: ?Sized + 'static, R: Default + 'static, $($ty: 'static),*>
            Entry<Method<C, fn($($ty),*) -> R>>
        {
            /// Call whichever target the trampoline currently jumps to, with
            /// `receiver` as its first argument.
            #[inline(always)]
            pub fn branch(&self, receiver: &C, $($arg: $ty),*) -> R {
                (core::hint::black_box(self.entry))(receiver, $($arg),*)
            }
        }
    };
}

macro_rules! borrowed_branch {
    ($($arg:ident: $ty:ident),*) => {
        impl<T: ?Sized + 'static, R: Default + 'static, $($ty: 'static),*>
            Entry<for<'r> fn(&'r T, $($ty),*) -> R>
        {
            /// Call whichever target the trampoline currently jumps to.
            /// `first` may borrow for any lifetime.
            #[inline(always)]
            pub fn branch(&self, first: &T, $($arg: $ty),*) -> R {
                (core::hint::black_box(self.entry))(first, $($arg),*)
            }
        }
    };
}

free_branch!();
free_branch!(a1: A1);
free_branch!(a1: A1, a2: A2);
free_branch!(a1: A1, a2: A2, a3: A3);
free_branch!(a1: A1, a2: A2, a3: A3, a4: A4);
free_branch!(a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);
free_branch!(a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);

method_branch!();
method_branch!(a1: A1);
method_branch!(a1: A1, a2: A2);
method_branch!(a1: A1, a2: A2, a3: A3);
method_branch!(a1: A1, a2: A2, a3: A3, a4: A4);
method_branch!(a1: A1, a2: A2, a3: A3, a4: A4, a5: A5);
method_branch!(a1: A1, a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);

borrowed_branch!();
borrowed_branch!(a2: A2);
borrowed_branch!(a2: A2, a3: A3);
borrowed_branch!(a2: A2, a3: A3, a4: A4);
borrowed_branch!(a2: A2, a3: A3, a4: A4, a5: A5);
borrowed_branch!(a2: A2, a3: A3, a4: A4, a5: A5, a6: A6);

/// A trampoline owned through its registry claim.
struct Installed<S: Signature> {
    entry: Entry<S>,
    site: PatchSite,
    _claim: Claim,
}

impl<S: Signature> Installed<S> {
    fn new(candidates: &[S::Target], config: PatchConfig) -> BranchResult<Self> {
        let family = Family::HOST.ok_or(BranchError::UnsupportedPlatform)?;
        if candidates.len() < 2 {
            return Err(BranchError::TooFewTargets {
                len: candidates.len(),
            });
        }

        let trampoline = S::trampoline();
        let address = S::address(trampoline);
        let claim = registry::claim(S::key(), S::name(), address)?;

        let targets: Vec<Target> = candidates.iter().map(|&target| S::tag(target)).collect();
        let endian = family.code_endian(Endian::native());

        // SAFETY: the claim makes this the only writer of the trampoline,
        // which is only ever entered through `Entry::branch` and whose
        // candidates share its signature.
        let installed = unsafe {
            let region = CodeRegion::new(address, family.jump_len());
            PatchSite::install(region, &targets, 0, family, endian, config)
        };

        match installed {
            Ok(site) => {
                tracing::debug!(signature = S::name(), address, "dispatcher ready");
                Ok(Self {
                    entry: Entry { entry: trampoline },
                    site,
                    _claim: claim,
                })
            }
            Err(failure) => {
                settle_failed_install(claim, &failure);
                Err(failure.error)
            }
        }
    }
}

/// Give the claim back unless the failed install had already written the
/// jump. A patched trampoline stays claimed for the life of the process.
fn settle_failed_install(claim: Claim, failure: &InstallError) {
    if failure.patched {
        tracing::warn!(
            signature = claim.name(),
            address = claim.address(),
            error = %failure.error,
            "install failed after patching; signature stays claimed"
        );
    } else {
        claim.release();
    }
}

macro_rules! dispatcher_common {
    ($name:ident) => {
        impl<S: Signature> $name<S> {
            /// Hand out a reader handle that outlives this borrow.
            ///
            /// # Safety
            /// Calls through the handle may run concurrently with
            /// `set_direction`. The displacement store is not atomic with
            /// respect to instruction fetch, so a racing call can jump to an
            /// address that is neither the old nor the new target. The
            /// caller must ensure no call is in flight while a patch is, or
            /// accept that hazard on hosts where it is known not to occur.
            pub unsafe fn share(&self) -> Entry<S> {
                Entry {
                    entry: self.inner.entry.entry,
                }
            }

            /// Number of displacement writes so far, including installation.
            pub fn patch_count(&self) -> u64 {
                self.inner.site.patch_count()
            }

            pub fn trampoline_address(&self) -> usize {
                self.inner.site.address()
            }

            /// The jump instruction currently at the start of the trampoline.
            pub fn leading_bytes(&self) -> Vec<u8> {
                self.inner.site.leading_bytes()
            }

            /// Absolute address the trampoline currently jumps to.
            pub fn current_target(&self) -> Option<usize> {
                self.inner.site.current_target()
            }

            pub fn config(&self) -> PatchConfig {
                self.inner.site.config()
            }
        }

        impl<S: Signature> Deref for $name<S> {
            type Target = Entry<S>;

            fn deref(&self) -> &Entry<S> {
                &self.inner.entry
            }
        }

        impl<S: Signature> fmt::Debug for $name<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("signature", &S::name())
                    .field("site", &self.inner.site)
                    .finish()
            }
        }
    };
}

/// Two-way dispatcher. Starts pointed at `if_true`.
pub struct Switch<S: Signature> {
    inner: Installed<S>,
}

impl<S: Signature> Switch<S> {
    pub fn new(if_true: S::Target, if_false: S::Target) -> BranchResult<Self> {
        Self::with_config(if_true, if_false, PatchConfig::default())
    }

    pub fn with_config(
        if_true: S::Target,
        if_false: S::Target,
        config: PatchConfig,
    ) -> BranchResult<Self> {
        Ok(Self {
            inner: Installed::new(&[if_true, if_false], config)?,
        })
    }

    pub fn set_direction(&mut self, direction: bool) -> BranchResult<()> {
        self.inner.site.set_direction(slot(direction))?;
        Ok(())
    }

    pub fn direction(&self) -> bool {
        self.inner.site.direction() == slot(true)
    }
}

fn slot(direction: bool) -> usize {
    if direction { 0 } else { 1 }
}

dispatcher_common!(Switch);

/// N-way dispatcher. Starts pointed at the first target.
pub struct BranchChanger<S: Signature> {
    inner: Installed<S>,
}

impl<S: Signature> BranchChanger<S> {
    pub fn new(targets: &[S::Target]) -> BranchResult<Self> {
        Self::with_config(targets, PatchConfig::default())
    }

    pub fn with_config(targets: &[S::Target], config: PatchConfig) -> BranchResult<Self> {
        Ok(Self {
            inner: Installed::new(targets, config)?,
        })
    }

    /// Select `targets[index]`. Fails without patching if `index` is not a
    /// valid target index.
    pub fn set_direction(&mut self, index: usize) -> BranchResult<()> {
        self.inner.site.set_direction(index)?;
        Ok(())
    }

    pub fn direction(&self) -> usize {
        self.inner.site.direction()
    }

    pub fn len(&self) -> usize {
        self.inner.site.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.site.is_empty()
    }
}

dispatcher_common!(BranchChanger);
