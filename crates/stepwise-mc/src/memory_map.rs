//! Parser for `/proc/<pid>/maps`.

use std::fs;

use nix::unistd::Pid;
use thiserror::Error;

pub const PROT_READ: u8 = 1;
pub const PROT_WRITE: u8 = 2;
pub const PROT_EXEC: u8 = 4;

#[derive(Error, Debug)]
pub enum MapsError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed maps line {line}: {text:?}")]
    Malformed { line: usize, text: String },
}

/// One virtual memory area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmMap {
    pub start_addr: u64,
    pub end_addr: u64,
    /// Combination of `PROT_*`.
    pub prot: u8,
    pub private: bool,
    pub offset: u64,
    pub inode: u64,
    /// File name, pseudo name such as `[heap]`, or empty.
    pub pathname: String,
}

impl VmMap {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start_addr && address < self.end_addr
    }

    pub fn is_file_backed(&self) -> bool {
        self.inode != 0 && self.pathname.starts_with('/')
    }
}

pub fn read_maps(pid: Pid) -> Result<Vec<VmMap>, MapsError> {
    let path = format!("/proc/{pid}/maps");
    let text = fs::read_to_string(&path).map_err(|source| MapsError::Io { path, source })?;
    parse_maps(&text)
}

pub fn parse_maps(text: &str) -> Result<Vec<VmMap>, MapsError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            parse_line(line).ok_or_else(|| MapsError::Malformed {
                line: i + 1,
                text: line.to_string(),
            })
        })
        .collect()
}

fn parse_line(line: &str) -> Option<VmMap> {
    // start-end perms offset dev inode [pathname]
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = fields.next()?.as_bytes();
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let inode = fields.next()?;
    let pathname = fields.next().unwrap_or("").trim_start().to_string();

    let (start, end) = range.split_once('-')?;
    if perms.len() != 4 {
        return None;
    }
    let mut prot = 0;
    if perms[0] == b'r' {
        prot |= PROT_READ;
    }
    if perms[1] == b'w' {
        prot |= PROT_WRITE;
    }
    if perms[2] == b'x' {
        prot |= PROT_EXEC;
    }

    Some(VmMap {
        start_addr: u64::from_str_radix(start, 16).ok()?,
        end_addr: u64::from_str_radix(end, 16).ok()?,
        prot,
        private: perms[3] == b'p',
        offset: u64::from_str_radix(offset, 16).ok()?,
        inode: inode.trim().parse().ok()?,
        pathname,
    })
}
