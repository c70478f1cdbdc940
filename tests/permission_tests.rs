//! Page protection of installed trampolines, read back from the kernel.
//!
//! Kept in its own binary: a persistent dispatcher elsewhere in the process
//! could reopen a shared text page for writing while these assertions run.

#![cfg(target_os = "linux")]

use semistatic::{FlushMode, PatchConfig, PermissionMode, Switch};

/// Permission string (`r-xp` and the like) of the mapping holding `address`.
fn page_permissions(address: usize) -> String {
    let maps = std::fs::read_to_string("/proc/self/maps").unwrap();
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let start = usize::from_str_radix(start, 16).unwrap();
        let end = usize::from_str_radix(end, 16).unwrap();
        if (start..end).contains(&address) {
            return perms.to_string();
        }
    }
    panic!("no mapping contains {address:#x}");
}

fn writable(perms: &str) -> bool {
    perms.as_bytes().get(1) == Some(&b'w')
}

fn executable(perms: &str) -> bool {
    perms.as_bytes().get(2) == Some(&b'x')
}

fn halve(x: u32, y: u32) -> bool {
    x / 2 == y
}

fn double(x: u32, y: u32) -> bool {
    x * 2 == y
}

fn keep(x: i16) -> i16 {
    x
}

fn negate(x: i16) -> i16 {
    -x
}

#[test]
fn test_page_protection_by_mode() {
    let config = PatchConfig {
        permissions: PermissionMode::Conserve,
        flush: FlushMode::Off,
    };
    let mut conserving = Switch::<fn(u32, u32) -> bool>::with_config(halve, double, config).unwrap();
    let address = conserving.trampoline_address();

    let perms = page_permissions(address);
    assert!(!writable(&perms), "after install: {perms}");
    assert!(executable(&perms), "after install: {perms}");

    for round in 0..6 {
        let direction = round % 2 == 1;
        conserving.set_direction(direction).unwrap();
        let perms = page_permissions(address);
        assert!(!writable(&perms), "after patch {round}: {perms}");
        assert!(executable(&perms), "after patch {round}: {perms}");
        assert_eq!(conserving.branch(8, 4), direction);
    }

    // A persistent dispatcher leaves its page open for the next patch.
    let persistent = PatchConfig {
        permissions: PermissionMode::Persistent,
        flush: FlushMode::Off,
    };
    let mut open = Switch::<fn(i16) -> i16>::with_config(keep, negate, persistent).unwrap();
    open.set_direction(false).unwrap();
    let perms = page_permissions(open.trampoline_address());
    assert!(writable(&perms), "persistent: {perms}");
    assert!(executable(&perms), "persistent: {perms}");
    assert_eq!(open.branch(3), -3);
}
