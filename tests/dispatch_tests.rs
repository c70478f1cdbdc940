//! End-to-end dispatch through real trampolines.
//!
//! The signature registry is process-wide, so every test here owns a
//! signature no other test in this binary uses.

use std::sync::mpsc;

use semistatic::dispatch::Signature;
use semistatic::{
    BranchChanger, BranchError, ErrorKind, FlushMode, Method, PatchConfig, PermissionMode, Switch,
};

fn add(a: i32, b: i32) -> i32 {
    a + b
}

fn sub(a: i32, b: i32) -> i32 {
    a - b
}

#[test]
fn test_switch_add_sub() {
    let mut switch = Switch::<fn(i32, i32) -> i32>::new(add, sub).unwrap();

    switch.set_direction(true).unwrap();
    assert_eq!(switch.branch(1, 2), 3);

    switch.set_direction(false).unwrap();
    assert_eq!(switch.branch(1, 2), -1);

    switch.set_direction(true).unwrap();
    assert_eq!(switch.branch(1, 2), 3);
}

fn add64(a: i64, b: i64) -> i64 {
    a + b
}

fn sub64(a: i64, b: i64) -> i64 {
    a - b
}

fn mul64(a: i64, b: i64) -> i64 {
    a * b
}

fn div64(a: i64, b: i64) -> i64 {
    a / b
}

#[test]
fn test_branch_changer_four_targets() {
    let mut changer =
        BranchChanger::<fn(i64, i64) -> i64>::new(&[add64, sub64, mul64, div64]).unwrap();
    assert_eq!(changer.len(), 4);
    assert_eq!(changer.direction(), 0);
    assert_eq!(changer.branch(6, 3), 9);

    changer.set_direction(2).unwrap();
    assert_eq!(changer.branch(6, 3), 18);

    changer.set_direction(3).unwrap();
    assert_eq!(changer.branch(6, 3), 2);

    changer.set_direction(1).unwrap();
    assert_eq!(changer.branch(6, 3), 3);
}

fn pick0(x: u64) -> u64 {
    x
}

fn pick1(x: u64) -> u64 {
    x + 1
}

fn pick2(x: u64) -> u64 {
    x + 2
}

#[test]
fn test_many_random_directions() {
    let mut changer = BranchChanger::<fn(u64) -> u64>::new(&[pick0, pick1, pick2]).unwrap();

    // xorshift keeps the sequence reproducible.
    let mut state = 0x2545_F491_4F6C_DD1Du64;
    for _ in 0..10_000 {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let index = (state % 3) as usize;
        changer.set_direction(index).unwrap();
        assert_eq!(changer.direction(), index);
        assert_eq!(changer.branch(100), 100 + index as u64);
    }
}

fn near(x: u8) -> u16 {
    x as u16
}

#[cfg(target_pointer_width = "64")]
#[test]
fn test_out_of_bounds_target_is_rejected() {
    type S = fn(u8) -> u16;
    let trampoline = <S as Signature>::address(<S as Signature>::trampoline());
    let before = unsafe { std::slice::from_raw_parts(trampoline as *const u8, 5).to_vec() };

    // Never called: only its address matters.
    let far_address = <fn(u8) -> u16 as Signature>::address(near) + (1 << 34);
    let far = unsafe { std::mem::transmute::<usize, fn(u8) -> u16>(far_address) };
    let err = Switch::<fn(u8) -> u16>::new(near, far).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BranchTargetOutOfBounds);
    assert!(matches!(err, BranchError::OutOfBounds { index: 1, .. }));

    let after = unsafe { std::slice::from_raw_parts(trampoline as *const u8, 5).to_vec() };
    assert_eq!(before, after);

    // The failed attempt does not use up the signature.
    let mut switch = Switch::<fn(u8) -> u16>::new(near, near).unwrap();
    switch.set_direction(false).unwrap();
    assert_eq!(switch.branch(9), 9);
}

fn first(x: f64) -> f64 {
    x
}

fn second(x: f64) -> f64 {
    -x
}

#[test]
fn test_second_instance_is_rejected() {
    let mut original = Switch::<fn(f64) -> f64>::new(first, second).unwrap();

    let err = Switch::<fn(f64) -> f64>::new(second, first).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MultipleInstance);
    let err = BranchChanger::<fn(f64) -> f64>::new(&[first, second, first]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MultipleInstance);

    assert_eq!(original.branch(2.5), 2.5);
    original.set_direction(false).unwrap();
    assert_eq!(original.branch(2.5), -2.5);
}

fn lower(c: char) -> char {
    c.to_ascii_lowercase()
}

fn upper(c: char) -> char {
    c.to_ascii_uppercase()
}

#[test]
fn test_repeated_direction_does_not_patch() {
    let mut switch = Switch::<fn(char) -> char>::new(lower, upper).unwrap();
    assert_eq!(switch.patch_count(), 1);

    switch.set_direction(true).unwrap();
    assert_eq!(switch.patch_count(), 1);

    switch.set_direction(false).unwrap();
    let bytes = switch.leading_bytes();
    switch.set_direction(false).unwrap();
    assert_eq!(switch.patch_count(), 2);
    assert_eq!(switch.leading_bytes(), bytes);
    assert_eq!(switch.branch('q'), 'Q');
}

struct Account {
    balance: i64,
}

fn deposit(account: &Account, amount: i64) -> i64 {
    account.balance + amount
}

fn withdraw(account: &Account, amount: i64) -> i64 {
    account.balance - amount
}

#[test]
fn test_method_shaped_dispatch() {
    let account = Account { balance: 100 };
    let mut switch = Switch::<Method<Account, fn(i64) -> i64>>::new(deposit, withdraw).unwrap();

    assert_eq!(switch.branch(&account, 25), 125);
    switch.set_direction(false).unwrap();
    assert_eq!(switch.branch(&account, 25), 75);
}

fn words(s: &'static str) -> usize {
    s.split_whitespace().count()
}

fn bytes(s: &'static str) -> usize {
    s.len()
}

#[test]
fn test_shared_entry_across_threads() {
    let mut switch = Switch::<fn(&'static str) -> usize>::new(words, bytes).unwrap();
    // Calls and patches alternate through the channels, so none overlap.
    let entry = unsafe { switch.share() };
    let (request_tx, request_rx) = mpsc::channel::<()>();
    let (result_tx, result_rx) = mpsc::channel();

    let reader = std::thread::spawn(move || {
        for () in request_rx {
            result_tx.send(entry.branch("a b c")).unwrap();
        }
    });

    for i in 0..50 {
        let direction = i % 2 == 0;
        switch.set_direction(direction).unwrap();
        request_tx.send(()).unwrap();
        let expected = if direction { 3 } else { 5 };
        assert_eq!(result_rx.recv().unwrap(), expected);
    }
    drop(request_tx);
    reader.join().unwrap();
    assert_eq!(switch.patch_count(), 50);
}

fn total(values: &[u32], scale: u32) -> u32 {
    values.iter().sum::<u32>() * scale
}

fn largest(values: &[u32], scale: u32) -> u32 {
    values.iter().copied().max().unwrap_or(0) * scale
}

#[test]
fn test_borrowed_argument_dispatch() {
    let mut switch = Switch::<fn(&[u32], u32) -> u32>::new(total, largest).unwrap();

    for round in 0..4u32 {
        // A fresh local each round: the borrow lives only as long as `values`.
        let values: Vec<u32> = (1..=round + 3).collect();
        switch.set_direction(round % 2 == 0).unwrap();
        let expected = if round % 2 == 0 {
            total(&values, 2)
        } else {
            largest(&values, 2)
        };
        assert_eq!(switch.branch(&values, 2), expected);
    }
    assert_eq!(
        switch.current_target(),
        Some(<fn(&[u32], u32) -> u32 as Signature>::address(largest))
    );
}

struct Quote {
    bid: f64,
    ask: f64,
}

fn mid(quote: &Quote) -> f64 {
    (quote.bid + quote.ask) / 2.0
}

fn spread(quote: &Quote) -> f64 {
    quote.ask - quote.bid
}

#[test]
fn test_reference_only_signature() {
    let mut switch = Switch::<fn(&Quote) -> f64>::new(mid, spread).unwrap();
    let quote = Quote {
        bid: 99.0,
        ask: 101.0,
    };
    assert_eq!(switch.branch(&quote), 100.0);
    switch.set_direction(false).unwrap();
    assert_eq!(switch.branch(&quote), 2.0);
}

fn lhs(a: u16, _b: u16) -> u16 {
    a
}

fn rhs(_a: u16, b: u16) -> u16 {
    b
}

#[test]
fn test_direction_out_of_range() {
    let mut changer = BranchChanger::<fn(u16, u16) -> u16>::new(&[lhs, rhs]).unwrap();
    changer.set_direction(1).unwrap();

    let err = changer.set_direction(2).unwrap_err();
    assert!(matches!(err, BranchError::DirectionOutOfRange { index: 2, len: 2 }));
    assert_eq!(changer.direction(), 1);
    assert_eq!(changer.branch(4, 8), 8);
}

fn lone(x: i8) -> i8 {
    x
}

#[test]
fn test_needs_two_targets() {
    let err = BranchChanger::<fn(i8) -> i8>::new(&[lone]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTargets);
    let err = BranchChanger::<fn(i8) -> i8>::new(&[]).unwrap_err();
    assert!(matches!(err, BranchError::TooFewTargets { len: 0 }));
}

fn on() -> Option<u32> {
    Some(1)
}

fn off() -> Option<u32> {
    None
}

#[test]
fn test_conserving_permissions() {
    let config = PatchConfig {
        permissions: PermissionMode::Conserve,
        flush: FlushMode::Serialize,
    };
    let mut switch = Switch::<fn() -> Option<u32>>::with_config(on, off, config).unwrap();
    assert_eq!(switch.config(), config);

    for _ in 0..10 {
        switch.set_direction(false).unwrap();
        assert_eq!(switch.branch(), None);
        switch.set_direction(true).unwrap();
        assert_eq!(switch.branch(), Some(1));
    }
}

fn sum6(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> u32 {
    [a, b, c, d, e, f].iter().map(|&x| x as u32).sum()
}

fn max6(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> u32 {
    [a, b, c, d, e, f].iter().copied().max().unwrap_or(0) as u32
}

#[test]
fn test_six_arguments() {
    let mut switch = Switch::<fn(u8, u8, u8, u8, u8, u8) -> u32>::new(sum6, max6).unwrap();
    assert_eq!(switch.branch(1, 2, 3, 4, 5, 6), 21);
    switch.set_direction(false).unwrap();
    assert_eq!(switch.branch(1, 2, 3, 4, 5, 6), 6);
    assert_eq!(
        switch.current_target(),
        Some(<fn(u8, u8, u8, u8, u8, u8) -> u32 as Signature>::address(max6))
    );
}
