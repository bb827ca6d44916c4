// src/sudo/capability.rs

//! Linux capability handling for the helper process
//!
//! The helper keeps only the capabilities it needs for its seven operations.
//! libc has no wrapper for `capget`/`capset`, so the raw syscalls are used
//! with the version 3 (64-bit) header.

use crate::error::{Error, Result};
use std::fmt;

/// Capabilities the helper may keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Chown,
    DacOverride,
    DacReadSearch,
    Fowner,
    Fsetid,
    Setgid,
    Setuid,
    SysAdmin,
    Mknod,
}

impl Capability {
    /// Kernel capability number
    pub fn number(self) -> u32 {
        match self {
            Capability::Chown => 0,
            Capability::DacOverride => 1,
            Capability::DacReadSearch => 2,
            Capability::Fowner => 3,
            Capability::Fsetid => 4,
            Capability::Setgid => 6,
            Capability::Setuid => 7,
            Capability::SysAdmin => 21,
            Capability::Mknod => 27,
        }
    }

    /// Kernel name, e.g. `CAP_SYS_ADMIN`
    pub fn name(self) -> &'static str {
        match self {
            Capability::Chown => "CAP_CHOWN",
            Capability::DacOverride => "CAP_DAC_OVERRIDE",
            Capability::DacReadSearch => "CAP_DAC_READ_SEARCH",
            Capability::Fowner => "CAP_FOWNER",
            Capability::Fsetid => "CAP_FSETID",
            Capability::Setgid => "CAP_SETGID",
            Capability::Setuid => "CAP_SETUID",
            Capability::SysAdmin => "CAP_SYS_ADMIN",
            Capability::Mknod => "CAP_MKNOD",
        }
    }

    /// Parse a kernel name. The `CAP_` prefix and case are optional.
    pub fn parse(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let full = if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{}", upper)
        };

        [
            Capability::Chown,
            Capability::DacOverride,
            Capability::DacReadSearch,
            Capability::Fowner,
            Capability::Fsetid,
            Capability::Setgid,
            Capability::Setuid,
            Capability::SysAdmin,
            Capability::Mknod,
        ]
        .into_iter()
        .find(|cap| cap.name() == full)
        .ok_or_else(|| Error::ParseError(format!("unknown capability: {}", name)))
    }

    /// Parse a configured list of capability names
    pub fn parse_list(names: &[String]) -> Result<Vec<Self>> {
        names.iter().map(|name| Self::parse(name)).collect()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Split a capability set into the two 32-bit words of the v3 ABI
fn capability_words(capabilities: &[Capability]) -> [u32; 2] {
    let mut words = [0u32; 2];
    for cap in capabilities {
        let bit = cap.number();
        words[(bit / 32) as usize] |= 1 << (bit % 32);
    }
    words
}

/// Restrict the current process to exactly `capabilities`
///
/// Effective, permitted and inheritable sets are all set to the given mask.
pub fn restrict_to(capabilities: &[Capability]) -> Result<()> {
    let mut header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapUserData::default(); 2];

    // SAFETY: header and data match the kernel's v3 layout
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capget,
            &mut header as *mut CapUserHeader,
            data.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(Error::SystemError(format!(
            "capget failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    let words = capability_words(capabilities);
    for (slot, word) in data.iter_mut().zip(words) {
        slot.effective = word;
        slot.permitted = word;
        slot.inheritable = word;
    }

    // SAFETY: as above
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            &mut header as *mut CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(Error::SystemError(format!(
            "capset failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(Capability::parse("CAP_SYS_ADMIN").unwrap(), Capability::SysAdmin);
        assert_eq!(Capability::parse("chown").unwrap(), Capability::Chown);
        assert_eq!(Capability::parse(" cap_fowner ").unwrap(), Capability::Fowner);
        assert!(Capability::parse("CAP_NET_RAW").is_err());
    }

    #[test]
    fn test_default_list() {
        let config = crate::config::PrivilegeConfig::default();
        let caps = Capability::parse_list(&config.capabilities).unwrap();
        assert_eq!(
            caps,
            vec![
                Capability::SysAdmin,
                Capability::Chown,
                Capability::Fowner,
                Capability::DacOverride
            ]
        );
    }

    #[test]
    fn test_capability_words() {
        let words = capability_words(&[Capability::Chown, Capability::SysAdmin, Capability::Mknod]);
        assert_eq!(words[0], (1 << 0) | (1 << 21) | (1 << 27));
        assert_eq!(words[1], 0);
    }
}
