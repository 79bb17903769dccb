//! The result channel shared with the guest and validation of the values the
//! guest writes into it.

use std::{fmt, mem::size_of};

use anyhow::anyhow;
use bytemuck::{CheckedBitPattern, NoUninit, Pod, Zeroable};

use crate::error::Error;

/// The guest hasn't reported anything since the last resume.
pub const RESULT_NONE: i32 = -1;
/// The guest is done.
pub const RESULT_EXIT: i32 = 0xff;

/// Fixed part of the result channel. The message follows directly after it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ResultHeader {
    pub result: i32,
    pub lineno: i32,
    /// Guest address of a NUL-terminated source file name.
    pub file_addr: u64,
}

pub const RESULT_HEADER_SIZE: usize = size_of::<ResultHeader>();

impl ResultHeader {
    pub const fn empty() -> Self {
        Self {
            result: RESULT_NONE,
            lineno: 0,
            file_addr: 0,
        }
    }
}

/// The outcomes a guest may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, CheckedBitPattern, NoUninit)]
#[repr(i32)]
pub enum ResultType {
    Pass = 0,
    Fail = 1,
    Broken = 2,
    Warn = 4,
    Info = 16,
    Conf = 32,
}

impl ResultType {
    pub const ALL: [Self; 6] = [
        Self::Pass,
        Self::Fail,
        Self::Broken,
        Self::Warn,
        Self::Info,
        Self::Conf,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Rank used to pick the overall outcome of a run.
    pub fn severity(self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Pass => 1,
            Self::Conf => 2,
            Self::Warn => 3,
            Self::Fail => 4,
            Self::Broken => 5,
        }
    }

    /// Exit status for a process whose worst outcome is `self`.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Pass | Self::Info => 0,
            Self::Fail => 1,
            Self::Broken => 2,
            Self::Warn => 4,
            Self::Conf => 32,
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pass => "TPASS",
            Self::Fail => "TFAIL",
            Self::Broken => "TBROK",
            Self::Warn => "TWARN",
            Self::Info => "TINFO",
            Self::Conf => "TCONF",
        })
    }
}

/// Check that a value written by the guest is one of the recognized outcomes.
///
/// The value comes from untrusted guest memory, so anything else is rejected
/// instead of being passed on.
pub fn validate(value: i32) -> Result<ResultType, Error> {
    if value == RESULT_NONE {
        return Err(Error::Protocol(anyhow!("guest did not return any result")));
    }
    bytemuck::checked::try_cast(value)
        .map_err(|_| Error::Protocol(anyhow!("guest returned invalid result value {value}")))
}

/// A single outcome reported by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub result: ResultType,
    pub file: String,
    pub lineno: i32,
    pub message: String,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}: {}: {}",
            self.file, self.lineno, self.result, self.message
        )
    }
}
