//! Branchless dispatch through a self-modifying trampoline.
//!
//! The trampoline of a signature starts with an unconditional relative jump.
//! Changing direction rewrites that jump's displacement, so a call through
//! the trampoline costs one direct jump and no conditional branch.

pub mod codec;
pub mod dispatcher;
pub mod page;
pub mod patch;
pub mod registry;
pub mod trampoline;

use serde::Serialize;

pub use codec::{Endian, Family};
pub use dispatcher::{BranchChanger, Entry, Switch};
pub use page::Protection;
pub use trampoline::{Method, Shape, Signature, Target};

/// What the patch engine would do on this host.
#[derive(Debug, Clone, Serialize)]
pub struct HostInfo {
    pub arch: &'static str,
    pub os: &'static str,
    pub family: Option<Family>,
    pub jump_len: Option<usize>,
    pub page_size: usize,
    pub data_endian: Endian,
    pub code_endian: Option<Endian>,
}

impl HostInfo {
    pub fn detect() -> Self {
        let data_endian = Endian::native();
        Self {
            arch: std::env::consts::ARCH,
            os: std::env::consts::OS,
            family: Family::HOST,
            jump_len: Family::HOST.map(Family::jump_len),
            page_size: page::page_size(),
            data_endian,
            code_endian: Family::HOST.map(|family| family.code_endian(data_endian)),
        }
    }

    pub fn supported(&self) -> bool {
        self.family.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_info() {
        let info = HostInfo::detect();
        assert_eq!(info.arch, std::env::consts::ARCH);
        assert!(info.page_size.is_power_of_two());
        assert_eq!(info.supported(), info.jump_len.is_some());

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["page_size"], info.page_size);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_host_family_x86_64() {
        let info = HostInfo::detect();
        assert_eq!(info.family, Some(Family::Rel32));
        assert_eq!(info.jump_len, Some(5));
    }
}
