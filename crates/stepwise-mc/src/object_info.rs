//! Per-object symbol and type information.
//!
//! Segment bounds come from the memory map, functions and global variables
//! from the ELF symbol tables (through `goblin`).  Types, local variables and
//! lexical scopes have no ELF counterpart; they are registered through
//! [`ObjectInformation::add_type`] and friends and drive the typed paths of
//! the comparison engine when present.

use std::collections::{BTreeMap, HashMap};

use goblin::elf::{header, sym, Elf};
use log::debug;
use thiserror::Error;

use crate::memory_map::{VmMap, PROT_EXEC, PROT_READ, PROT_WRITE};

#[derive(Error, Debug)]
pub enum ObjectError {
    #[error("could not locate any segment of {0}")]
    NoSegment(String),

    #[error("multiple read-write segments for {0}, not supported")]
    MultipleRwSegments(String),

    #[error("cannot parse ELF file {name}: {source}")]
    Elf {
        name: String,
        source: goblin::error::Error,
    },
}

pub type TypeId = u64;

/// Closed set of type categories the comparison engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Unspecified,
    Base,
    Enumeration,
    Typedef,
    Const,
    Volatile,
    Array,
    Pointer,
    Reference,
    RvalueReference,
    Structure,
    Class,
    Union,
    Subroutine,
}

impl TypeKind {
    pub fn is_pointer(self) -> bool {
        matches!(self, Self::Pointer | Self::Reference | Self::RvalueReference)
    }

    pub fn is_qualifier(self) -> bool {
        matches!(self, Self::Typedef | Self::Const | Self::Volatile)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub offset: u64,
    pub type_id: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Type {
    pub id: TypeId,
    pub kind: TypeKind,
    pub name: String,
    pub byte_size: u64,
    /// Pointee, element, or aliased type.
    pub subtype: Option<TypeId>,
    pub element_count: u64,
    pub members: Vec<Member>,
    /// Complete definition of a forward-declared type.
    pub full_type: Option<TypeId>,
}

impl Type {
    pub fn new(id: TypeId, kind: TypeKind, name: &str, byte_size: u64) -> Self {
        Self {
            id,
            kind,
            name: name.to_string(),
            byte_size,
            subtype: None,
            element_count: 0,
            members: Vec::new(),
            full_type: None,
        }
    }

    pub fn with_subtype(mut self, subtype: TypeId) -> Self {
        self.subtype = Some(subtype);
        self
    }

    pub fn with_element_count(mut self, count: u64) -> Self {
        self.element_count = count;
        self
    }

    pub fn with_member(mut self, name: &str, offset: u64, type_id: TypeId) -> Self {
        self.members.push(Member {
            name: name.to_string(),
            offset,
            type_id,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableLocation {
    /// Absolute address (globals and statics).
    Address(u64),
    /// Offset from the frame pointer of the enclosing frame.
    FrameOffset(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
    pub type_id: Option<TypeId>,
    pub location: VariableLocation,
    /// Size in bytes, used when no type is known.
    pub size: u64,
    /// Offset from the start of the enclosing scope at which the variable
    /// becomes valid.
    pub start_scope: u64,
}

impl Variable {
    pub fn global(name: &str, address: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            type_id: None,
            location: VariableLocation::Address(address),
            size,
            start_scope: 0,
        }
    }

    pub fn local(name: &str, frame_offset: i64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            type_id: None,
            location: VariableLocation::FrameOffset(frame_offset),
            size,
            start_scope: 0,
        }
    }

    pub fn with_type(mut self, type_id: TypeId) -> Self {
        self.type_id = Some(type_id);
        self
    }

    pub fn address(&self) -> Option<u64> {
        match self.location {
            VariableLocation::Address(a) => Some(a),
            VariableLocation::FrameOffset(_) => None,
        }
    }
}

/// A function or a lexical block inside one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub name: String,
    pub low_pc: u64,
    pub high_pc: u64,
    pub variables: Vec<Variable>,
    pub scopes: Vec<Frame>,
}

impl Frame {
    pub fn new(name: &str, low_pc: u64, high_pc: u64) -> Self {
        Self {
            name: name.to_string(),
            low_pc,
            high_pc,
            variables: Vec::new(),
            scopes: Vec::new(),
        }
    }

    pub fn contains(&self, ip: u64) -> bool {
        ip >= self.low_pc && ip < self.high_pc
    }

    fn remove_variable(&mut self, name: &str) {
        self.variables.retain(|v| v.name != name);
        for scope in &mut self.scopes {
            scope.remove_variable(name);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectInformation {
    pub file_name: String,
    pub start: u64,
    pub end: u64,
    pub start_exec: u64,
    pub end_exec: u64,
    pub start_rw: u64,
    pub end_rw: u64,
    pub start_ro: u64,
    pub end_ro: u64,
    /// Data segment duplicated per replica.
    pub privatized: bool,
    functions: BTreeMap<u64, Frame>,
    global_variables: Vec<Variable>,
    types: HashMap<TypeId, Type>,
}

impl ObjectInformation {
    pub fn new(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            ..Default::default()
        }
    }

    /// Find the segments of this object in the memory map.
    ///
    /// An anonymous writable mapping right after the read-write segment is
    /// its `.bss` and extends it.
    pub fn locate_segments(&mut self, maps: &[VmMap]) -> Result<(), ObjectError> {
        for (i, reg) in maps.iter().enumerate() {
            if reg.pathname != self.file_name {
                continue;
            }
            if self.start == 0 || reg.start_addr < self.start {
                self.start = reg.start_addr;
            }
            self.end = self.end.max(reg.end_addr);

            if reg.prot & PROT_WRITE != 0 {
                if self.start_rw != 0 {
                    if reg.start_addr != self.end_rw {
                        return Err(ObjectError::MultipleRwSegments(self.file_name.clone()));
                    }
                    self.end_rw = reg.end_addr;
                } else {
                    self.start_rw = reg.start_addr;
                    self.end_rw = reg.end_addr;
                }
                if let Some(next) = maps.get(i + 1) {
                    if next.pathname.is_empty()
                        && next.prot & PROT_WRITE != 0
                        && next.start_addr == reg.end_addr
                    {
                        self.end_rw = next.end_addr;
                    }
                }
            } else if reg.prot & PROT_READ != 0 && reg.prot & PROT_EXEC != 0 {
                extend(&mut self.start_exec, &mut self.end_exec, reg);
            } else if reg.prot & PROT_READ != 0 {
                extend(&mut self.start_ro, &mut self.end_ro, reg);
            }
        }

        if self.start_exec == 0 && self.start_rw == 0 && self.start_ro == 0 {
            return Err(ObjectError::NoSegment(self.file_name.clone()));
        }
        Ok(())
    }

    /// Register functions and global variables from the ELF symbol tables.
    ///
    /// Position-independent objects are relocated by the address of their
    /// first mapping, so [`locate_segments`](Self::locate_segments) must run
    /// first.
    pub fn load_symbols(&mut self, bytes: &[u8]) -> Result<(), ObjectError> {
        let elf = Elf::parse(bytes).map_err(|source| ObjectError::Elf {
            name: self.file_name.clone(),
            source,
        })?;
        let base = if elf.header.e_type == header::ET_DYN {
            self.start
        } else {
            0
        };

        let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
        for (symbols, strings) in tables {
            for symbol in symbols.iter() {
                if symbol.st_value == 0 || symbol.st_shndx == 0 {
                    continue;
                }
                let Some(name) = strings.get_at(symbol.st_name) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let address = base + symbol.st_value;
                match symbol.st_type() {
                    sym::STT_FUNC => {
                        let size = symbol.st_size.max(1);
                        self.functions
                            .entry(address)
                            .or_insert_with(|| Frame::new(name, address, address + size));
                    }
                    sym::STT_OBJECT => {
                        if self.find_variable(name).is_none() {
                            self.add_global_variable(Variable::global(
                                name,
                                address,
                                symbol.st_size,
                            ));
                        }
                    }
                    _ => {}
                }
            }
        }
        debug!(
            "{}: {} functions, {} global variables",
            self.file_name,
            self.functions.len(),
            self.global_variables.len()
        );
        Ok(())
    }

    pub fn add_function(&mut self, frame: Frame) {
        self.functions.insert(frame.low_pc, frame);
    }

    pub fn add_global_variable(&mut self, variable: Variable) {
        let pos = self
            .global_variables
            .partition_point(|v| v.name.as_str() < variable.name.as_str());
        self.global_variables.insert(pos, variable);
    }

    pub fn add_type(&mut self, ty: Type) {
        self.types.insert(ty.id, ty);
    }

    pub fn get_type(&self, id: TypeId) -> Option<&Type> {
        self.types.get(&id)
    }

    pub fn global_variables(&self) -> &[Variable] {
        &self.global_variables
    }

    /// True when at least one global carries a type.
    pub fn has_typed_globals(&self) -> bool {
        self.global_variables.iter().any(|v| v.type_id.is_some())
    }

    pub fn find_variable(&self, name: &str) -> Option<&Variable> {
        self.global_variables
            .binary_search_by(|v| v.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.global_variables[i])
    }

    pub fn find_function(&self, ip: u64) -> Option<&Frame> {
        self.functions
            .range(..=ip)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(ip))
    }

    pub fn functions(&self) -> impl Iterator<Item = &Frame> {
        self.functions.values()
    }

    pub fn remove_global_variable(&mut self, name: &str) {
        self.global_variables.retain(|v| v.name != name);
    }

    /// Drop a local variable from one function, or from all when `frame` is `None`.
    pub fn remove_local_variable(&mut self, name: &str, frame: Option<&str>) {
        for function in self.functions.values_mut() {
            if frame.map_or(true, |f| f == function.name) {
                function.remove_variable(name);
            }
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn contains_exec(&self, address: u64) -> bool {
        address >= self.start_exec && address < self.end_exec
    }

    pub fn contains_rw(&self, address: u64) -> bool {
        address >= self.start_rw && address < self.end_rw
    }
}

fn extend(start: &mut u64, end: &mut u64, reg: &VmMap) {
    if *start == 0 || reg.start_addr < *start {
        *start = reg.start_addr;
    }
    *end = (*end).max(reg.end_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::parse_maps;

    const MAPS: &str = "\
1000-2000 r--p 00000000 fd:01 7 /bin/app
2000-4000 r-xp 00001000 fd:01 7 /bin/app
4000-5000 r--p 00003000 fd:01 7 /bin/app
5000-6000 rw-p 00004000 fd:01 7 /bin/app
6000-8000 rw-p 00000000 00:00 0 
9000-a000 rw-p 00000000 fd:01 8 /lib/other.so
";

    #[test]
    fn segments_include_trailing_bss() {
        let maps = parse_maps(MAPS).unwrap();
        let mut info = ObjectInformation::new("/bin/app");
        info.locate_segments(&maps).unwrap();
        assert_eq!((info.start_exec, info.end_exec), (0x2000, 0x4000));
        assert_eq!((info.start_ro, info.end_ro), (0x1000, 0x5000));
        assert_eq!((info.start_rw, info.end_rw), (0x5000, 0x8000));
        assert_eq!((info.start, info.end), (0x1000, 0x6000));
        assert!(info.contains_rw(0x7fff));
    }

    #[test]
    fn unknown_object_has_no_segment() {
        let maps = parse_maps(MAPS).unwrap();
        let mut info = ObjectInformation::new("/bin/missing");
        assert!(matches!(
            info.locate_segments(&maps),
            Err(ObjectError::NoSegment(_))
        ));
    }

    #[test]
    fn function_lookup_by_address_range() {
        let mut info = ObjectInformation::new("x");
        info.add_function(Frame::new("a", 0x100, 0x180));
        info.add_function(Frame::new("b", 0x200, 0x220));
        assert_eq!(info.find_function(0x17f).unwrap().name, "a");
        assert!(info.find_function(0x180).is_none());
        assert_eq!(info.find_function(0x200).unwrap().name, "b");
        assert!(info.find_function(0x50).is_none());
    }

    #[test]
    fn variables_sorted_and_removable() {
        let mut info = ObjectInformation::new("x");
        info.add_global_variable(Variable::global("zeta", 0x30, 4));
        info.add_global_variable(Variable::global("counter", 0x10, 8));
        info.add_global_variable(Variable::global("alpha", 0x20, 4));
        let names: Vec<_> = info.global_variables().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["alpha", "counter", "zeta"]);
        assert_eq!(info.find_variable("counter").unwrap().address(), Some(0x10));
        info.remove_global_variable("counter");
        assert!(info.find_variable("counter").is_none());
    }

    #[test]
    fn local_variables_removed_from_nested_scopes() {
        let mut info = ObjectInformation::new("x");
        let mut main = Frame::new("main", 0x100, 0x200);
        main.variables.push(Variable::local("e", -8, 8));
        let mut block = Frame::new("main", 0x120, 0x140);
        block.variables.push(Variable::local("e", -16, 8));
        block.variables.push(Variable::local("keep", -24, 8));
        main.scopes.push(block);
        info.add_function(main);
        let mut other = Frame::new("other", 0x300, 0x380);
        other.variables.push(Variable::local("e", -8, 8));
        info.add_function(other);

        info.remove_local_variable("e", Some("main"));
        let main = info.find_function(0x100).unwrap();
        assert!(main.variables.is_empty());
        assert_eq!(main.scopes[0].variables.len(), 1);
        assert_eq!(info.find_function(0x300).unwrap().variables.len(), 1);

        info.remove_local_variable("e", None);
        assert!(info.find_function(0x300).unwrap().variables.is_empty());
    }

    #[test]
    fn loads_symbols_of_the_test_binary() {
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let bytes = std::fs::read(&exe).unwrap();
        let maps = crate::memory_map::read_maps(nix::unistd::getpid()).unwrap();
        let mut info = ObjectInformation::new(exe.to_str().unwrap());
        info.locate_segments(&maps).unwrap();
        info.load_symbols(&bytes).unwrap();
        assert!(info.functions().count() > 0);
    }
}
