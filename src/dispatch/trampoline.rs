//! Trampoline synthesis.
//!
//! Every [`Signature`] owns one monomorphized entry function. Its body is
//! never meant to run: the patch engine overwrites its first instruction
//! with a jump to the selected target before any caller can reach it. If it
//! does run, it returns `R::default()`.
//!
//! The entry must keep a stable, unshared address with at least one jump's
//! worth of bytes:
//! - `#[inline(never)]` keeps it out of line,
//! - the reserved `jmp +0` / `nop` slot guarantees the length,
//! - the signature's `TypeId` is baked into the body so identical-code
//!   folding cannot merge two signatures onto one address,
//! - callers go through [`core::hint::black_box`] on the pointer so the
//!   optimizer cannot specialize or drop arguments of the entry.

// `fn(A) -> R` and `for<'r> fn(&'r T) -> R` only differ by the binder, which
// the overlap check accepts under this lint.
#![allow(coherence_leak_check)]

use std::any::TypeId;
use std::marker::PhantomData;

use serde::Serialize;

/// Calling shape of a dispatch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Shape {
    /// `fn(Args..) -> R`
    Free,
    /// `fn(&C, Args..) -> R`, the receiver passed first.
    Method,
}

/// A code address tagged with the shape of the function living there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Free(usize),
    Method(usize),
}

impl Target {
    pub fn new(shape: Shape, address: usize) -> Self {
        match shape {
            Shape::Free => Target::Free(address),
            Shape::Method => Target::Method(address),
        }
    }

    pub fn address(self) -> usize {
        match self {
            Target::Free(address) | Target::Method(address) => address,
        }
    }

    pub fn shape(self) -> Shape {
        match self {
            Target::Free(_) => Shape::Free,
            Target::Method(_) => Shape::Method,
        }
    }
}

/// Signature key for method-shaped targets: `Method<C, fn(A) -> R>` selects
/// candidates of type `fn(&C, A) -> R`.
pub struct Method<C: ?Sized, F> {
    _marker: PhantomData<(fn(&C), F)>,
}

mod sealed {
    pub trait Sealed {}
}

/// A function signature that owns a trampoline.
///
/// Implemented for `fn(A..) -> R` and `Method<C, fn(A..) -> R>` with up to
/// six arguments besides the receiver, and for `fn(&T, A..) -> R` whose
/// leading reference may borrow for any lifetime, with up to five more.
pub trait Signature: sealed::Sealed + 'static {
    /// Function pointer type of both the trampoline and its candidates.
    type Target: Copy + Send + Sync + 'static;

    const SHAPE: Shape;

    /// The synthesized entry point for this signature.
    fn trampoline() -> Self::Target;

    /// Code address of a function pointer of this signature.
    fn address(target: Self::Target) -> usize;

    fn tag(target: Self::Target) -> Target {
        Target::new(Self::SHAPE, Self::address(target))
    }

    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    fn key() -> TypeId {
        TypeId::of::<Self>()
    }
}

/// Reserve the patchable slot and make the body unique to `K`.
#[inline(always)]
fn reserve_slot<K: 'static>() {
    jump_slot();
    core::hint::black_box(TypeId::of::<K>());
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
#[inline(always)]
fn jump_slot() {
    // SAFETY: `jmp +0` falls through to the next instruction.
    unsafe {
        core::arch::asm!(
            ".byte 0xe9, 0x00, 0x00, 0x00, 0x00",
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn jump_slot() {
    // SAFETY: a plain nop.
    unsafe {
        core::arch::asm!("nop", options(nomem, nostack, preserves_flags));
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
#[inline(always)]
fn jump_slot() {}

macro_rules! free_signature {
    ($entry:ident; $($arg:ident),*) => {
        #[inline(never)]
        fn $entry<K: 'static, R: Default, $($arg),*>($(_: $arg),*) -> R {
            reserve_slot::<K>();
            R::default()
        }

        impl<R: Default + 'static, $($arg: 'static),*> sealed::Sealed for fn($($arg),*) -> R {}

        impl<R: Default + 'static, $($arg: 'static),*> Signature for fn($($arg),*) -> R {
            type Target = fn($($arg),*) -> R;

            const SHAPE: Shape = Shape::Free;

            fn trampoline() -> Self::Target {
                $entry::<Self, R, $($arg),*>
            }

            fn address(target: Self::Target) -> usize {
                target as usize
            }
        }
    };
}

macro_rules! method_signature {
    ($entry:ident; $($arg:ident),*) => {
        #[inline(never)]
        fn $entry<K: 'static, C: ?Sized, R: Default, $($arg),*>(_: &C, $(_: $arg),*) -> R {
            reserve_slot::<K>();
            R::default()
        }

        impl<C: ?Sized + 'static, R: Default + 'static, $($arg: 'static),*> sealed::Sealed
            for Method<C, fn($($arg),*) -> R>
        {
        }

        impl<C: ?Sized + 'static, R: Default + 'static, $($arg: 'static),*> Signature
            for Method<C, fn($($arg),*) -> R>
        {
            type Target = for<'r> fn(&'r C, $($arg),*) -> R;

            const SHAPE: Shape = Shape::Method;

            fn trampoline() -> Self::Target {
                $entry::<Self, C, R, $($arg),*>
            }

            fn address(target: Self::Target) -> usize {
                target as usize
            }
        }
    };
}

// A free function whose first parameter is a reference: the pointer type is
// higher-ranked over that borrow, so callers can pass non-'static data. It
// shares the method entries, which take the same leading `&T`.
macro_rules! borrowed_signature {
    ($entry:ident; $($arg:ident),*) => {
        impl<T: ?Sized + 'static, R: Default + 'static, $($arg: 'static),*> sealed::Sealed
            for for<'r> fn(&'r T, $($arg),*) -> R
        {
        }

        impl<T: ?Sized + 'static, R: Default + 'static, $($arg: 'static),*> Signature
            for for<'r> fn(&'r T, $($arg),*) -> R
        {
            type Target = Self;

            const SHAPE: Shape = Shape::Free;

            fn trampoline() -> Self::Target {
                $entry::<Self, T, R, $($arg),*>
            }

            fn address(target: Self::Target) -> usize {
                target as usize
            }
        }
    };
}

free_signature!(free_entry0;);
free_signature!(free_entry1; A1);
free_signature!(free_entry2; A1, A2);
free_signature!(free_entry3; A1, A2, A3);
free_signature!(free_entry4; A1, A2, A3, A4);
free_signature!(free_entry5; A1, A2, A3, A4, A5);
free_signature!(free_entry6; A1, A2, A3, A4, A5, A6);

method_signature!(method_entry0;);
method_signature!(method_entry1; A1);
method_signature!(method_entry2; A1, A2);
method_signature!(method_entry3; A1, A2, A3);
method_signature!(method_entry4; A1, A2, A3, A4);
method_signature!(method_entry5; A1, A2, A3, A4, A5);
method_signature!(method_entry6; A1, A2, A3, A4, A5, A6);

borrowed_signature!(method_entry0;);
borrowed_signature!(method_entry1; A1);
borrowed_signature!(method_entry2; A1, A2);
borrowed_signature!(method_entry3; A1, A2, A3);
borrowed_signature!(method_entry4; A1, A2, A3, A4);
borrowed_signature!(method_entry5; A1, A2, A3, A4, A5);
