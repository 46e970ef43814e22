//! Turns the compiled selector object into a loadable program.
//!
//! The object is produced out of band (`clang -target bpf`) from
//! `bpf/failover_select.c`. Only what that routine needs is supported: one
//! program, map references to a single map, no bpf-to-bpf calls and no
//! global data. Every map reference is bound to the pinned registry.

use std::fs;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use object::{Object, ObjectSection, ObjectSymbol, RelocationTarget};

use crate::sys::{self, Insn, BPF_PSEUDO_MAP_FD};
use crate::{Error, Result};

const MAP_SECTIONS: [&str; 2] = [".maps", "maps"];
const DEFAULT_LICENSE: &str = "GPL";
const BPF_PSEUDO_CALL: u8 = 1;

/// A selector program extracted from an ELF object, ready to load once its
/// map references are bound.
#[derive(Debug, Clone)]
pub struct SelectorProgram {
    pub name: String,
    pub license: String,
    insns: Vec<Insn>,
    /// Indices of `ld_imm64` instructions that reference the registry map.
    map_refs: Vec<usize>,
    bound: bool,
}

fn load_error(msg: impl Into<String>) -> Error {
    Error::SelectorLoad(msg.into())
}

impl SelectorProgram {
    /// Read and parse the object at `path`. A missing file is a load error
    /// like any other; callers decide whether that is fatal.
    pub fn read(path: &Path, entry: &str) -> Result<Self> {
        let data = fs::read(path)
            .map_err(|e| load_error(format!("artifact {} unreadable: {e}", path.display())))?;
        Self::parse(&data, entry)
    }

    /// Extract the program whose symbol is `entry`.
    pub fn parse(data: &[u8], entry: &str) -> Result<Self> {
        let file =
            object::File::parse(data).map_err(|e| load_error(format!("not an object file: {e}")))?;

        let symbol = file
            .symbols()
            .find(|s| s.name().map(|n| n == entry).unwrap_or(false))
            .ok_or_else(|| load_error(format!("entry symbol {entry:?} not found")))?;
        let section_index = symbol
            .section_index()
            .ok_or_else(|| load_error(format!("entry symbol {entry:?} is not defined")))?;
        let section = file
            .section_by_index(section_index)
            .map_err(|e| load_error(e.to_string()))?;
        let bytes = section.data().map_err(|e| load_error(e.to_string()))?;

        let out_of_bounds = || {
            load_error(format!(
                "entry {entry:?} at {:#x}+{:#x} lies outside its {}-byte section",
                symbol.address(),
                symbol.size(),
                bytes.len()
            ))
        };
        let start = usize::try_from(symbol.address()).map_err(|_| out_of_bounds())?;
        let end = match symbol.size() {
            0 => bytes.len(),
            size => usize::try_from(size)
                .ok()
                .and_then(|size| start.checked_add(size))
                .ok_or_else(out_of_bounds)?,
        };
        if start > end || end > bytes.len() || (end - start) % Insn::SIZE != 0 {
            return Err(out_of_bounds());
        }
        let insns: Vec<Insn> = bytes[start..end]
            .chunks_exact(Insn::SIZE)
            .map(|c| Insn::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        if insns.is_empty() {
            return Err(load_error(format!("entry {entry:?} is empty")));
        }
        if let Some(pc) = insns
            .iter()
            .position(|i| i.code == Insn::CALL && i.src_reg() == BPF_PSEUDO_CALL)
        {
            return Err(load_error(format!("bpf-to-bpf call at insn {pc} is not supported")));
        }

        let mut map_refs = Vec::new();
        let mut map_name: Option<String> = None;
        for (offset, reloc) in section.relocations() {
            let offset = offset as usize;
            if offset < start || offset >= end {
                continue;
            }
            let target = match reloc.target() {
                RelocationTarget::Symbol(idx) => file
                    .symbol_by_index(idx)
                    .map_err(|e| load_error(e.to_string()))?,
                other => return Err(load_error(format!("unsupported relocation target {other:?}"))),
            };
            let target_section = target
                .section_index()
                .and_then(|i| file.section_by_index(i).ok())
                .and_then(|s| s.name().ok().map(str::to_owned))
                .unwrap_or_default();
            if !MAP_SECTIONS.contains(&target_section.as_str()) {
                return Err(load_error(format!(
                    "relocation at {offset} targets section {target_section:?}; only map references are supported"
                )));
            }
            let name = target.name().unwrap_or_default().to_owned();
            match &map_name {
                Some(existing) if *existing != name => {
                    return Err(load_error(format!(
                        "program references maps {existing:?} and {name:?}; only the registry map is supported"
                    )))
                }
                _ => map_name = Some(name),
            }

            let pc = (offset - start) / Insn::SIZE;
            if insns[pc].code != Insn::LD_IMM64 || pc + 1 >= insns.len() {
                return Err(load_error(format!("map relocation at insn {pc} is not ld_imm64")));
            }
            map_refs.push(pc);
        }

        let license = file
            .section_by_name("license")
            .and_then(|s| s.data().ok())
            .map(|d| {
                let end = d.iter().position(|&b| b == 0).unwrap_or(d.len());
                String::from_utf8_lossy(&d[..end]).into_owned()
            })
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| DEFAULT_LICENSE.to_owned());

        Ok(Self {
            name: entry.to_owned(),
            license,
            insns,
            map_refs,
            bound: false,
        })
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn map_refs(&self) -> &[usize] {
        &self.map_refs
    }

    /// Point every map reference at `map`.
    pub fn bind_map(&mut self, map: BorrowedFd<'_>) {
        bind_map_refs(&mut self.insns, &self.map_refs, map.as_raw_fd());
        self.bound = true;
    }

    /// Hand the program to the kernel verifier.
    pub fn load(&self) -> Result<OwnedFd> {
        if !self.bound && !self.map_refs.is_empty() {
            return Err(load_error("map references not bound to the registry"));
        }
        sys::load_reuseport_prog(&self.name, &self.insns, &self.license)
            .map_err(|e| load_error(format!("kernel rejected {:?}: {e}", self.name)))
    }
}

fn bind_map_refs(insns: &mut [Insn], refs: &[usize], map_fd: i32) {
    for &pc in refs {
        insns[pc].set_src_reg(BPF_PSEUDO_MAP_FD);
        insns[pc].imm = map_fd;
        insns[pc + 1].imm = 0;
    }
}
